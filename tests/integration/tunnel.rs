use crate::*;

use std::sync::Mutex;

use tether_core::wire::EventTag;
use tether_core::{HttpMethod, HttpRequest};
use tether_services::HttpClient;
use tokio_util::sync::CancellationToken;

fn with_downstream(url: String) -> Settings {
    Settings {
        downstream_url: url,
        ..Settings::default()
    }
}

#[tokio::test]
async fn test_get_without_body_is_single_message() {
    let (alpha, bravo) = pair(&with_downstream(spawn_downstream().await));

    let response = alpha
        .tunnel_client
        .send(HttpRequest::new(HttpMethod::Get, "/health"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"ok");
    assert_eq!(alpha.events.count(), 1);
    assert_eq!(bravo.tunnel_server.in_flight(), 0);
    assert_eq!(alpha.tunnel_client.outstanding(), 0);
}

#[tokio::test]
async fn test_large_body_round_trip() {
    let settings = Settings {
        max_event_payload: 16 * 1024,
        ..with_downstream(spawn_downstream().await)
    };
    let (alpha, _bravo) = pair(&settings);

    let body = noise(300_000);
    let request = HttpRequest::new(HttpMethod::Post, "/echo")
        .with_header("Content-Type", "application/x-test")
        .with_header("X-Trace", "abc123")
        .with_body(body.clone());
    let response = alpha.tunnel_client.send(request).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], &body[..]);
    assert_eq!(response.headers.get("content-type"), Some("application/x-test"));
    assert_eq!(response.headers.get("x-trace"), Some("abc123"));
    // 300 KB does not fit one 16 KB event.
    assert!(alpha.events.count() >= 300_000 / (16 * 1024));
}

#[tokio::test]
async fn test_downstream_status_passes_through() {
    let (alpha, _bravo) = pair(&with_downstream(spawn_downstream().await));
    let response = alpha
        .tunnel_client
        .send(HttpRequest::new(HttpMethod::Get, "/status/418"))
        .await
        .unwrap();
    assert_eq!(response.status, 418);
}

#[tokio::test]
async fn test_dispatch_failure_is_internal_error() {
    // Nothing listens downstream, so the real request fails on bravo.
    let (alpha, _bravo) = pair(&Settings::default());
    let response = alpha
        .tunnel_client
        .send(HttpRequest::new(HttpMethod::Get, "/anything"))
        .await
        .unwrap();

    assert_eq!(response.status, 500);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn test_both_directions_work() {
    let url = spawn_downstream().await;
    let (alpha, bravo) = pair(&with_downstream(url));

    let (a, b) = tokio::join!(
        alpha.tunnel_client.send(HttpRequest::new(HttpMethod::Get, "/health")),
        bravo.tunnel_client.send(HttpRequest::new(HttpMethod::Get, "/status/204")),
    );
    assert_eq!(a.unwrap().status, 200);
    assert_eq!(b.unwrap().status, 204);
}

#[tokio::test]
async fn test_cancellation_resolves_waiter() {
    let (alpha, _bravo) = pair(&with_downstream(spawn_downstream().await));
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
    }

    let err = alpha
        .tunnel_client
        .send_with_cancel(HttpRequest::new(HttpMethod::Get, "/slow"), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(alpha.tunnel_client.outstanding(), 0);
}

// ── Reordering ────────────────────────────────────────────────────────────────

/// Holds back body message 1 until body message 2 has gone out.
struct SwapFirstTwo<T> {
    inner: T,
    held: Mutex<Option<(Bytes, String, String, String)>>,
}

impl<T: EventTransport> EventTransport for SwapFirstTwo<T> {
    fn max_payload_size(&self) -> usize {
        self.inner.max_payload_size()
    }

    fn publish<'a>(
        &'a self,
        payload: Bytes,
        id: &'a str,
        schema: &'a str,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<(), TetherError>> {
        Box::pin(async move {
            let sequence = id.parse::<EventTag>()?.sequence;
            if sequence == 1 {
                let held = (payload, id.to_string(), schema.to_string(), content_type.to_string());
                *self.held.lock().unwrap() = Some(held);
                return Ok(());
            }
            self.inner.publish(payload, id, schema, content_type).await?;
            if sequence == 2 {
                let held = self.held.lock().unwrap().take();
                if let Some((payload, id, schema, content_type)) = held {
                    self.inner.publish(payload, &id, &schema, &content_type).await?;
                }
            }
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_out_of_order_body_messages_reassemble() {
    let settings = Settings {
        max_event_payload: 8 * 1024,
        ..with_downstream(spawn_downstream().await)
    };
    let (alpha, bravo) = pair(&settings);

    let reordering = Arc::new(SwapFirstTwo {
        inner: LoopbackEventTransport::new(bravo.tunnel_server.clone(), ALPHA, settings.max_event_payload),
        held: Mutex::new(None),
    });
    let client = HttpTunnelClient::new(reordering, settings.request_timeout);
    client.attach(&alpha.router);

    let body = noise(40_000);
    let response = client
        .send(HttpRequest::new(HttpMethod::Post, "/echo").with_body(body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], &body[..]);
}

#[tokio::test(start_paused = true)]
async fn test_partial_request_is_evicted() {
    let settings = Settings {
        max_event_payload: 4 * 1024,
        ..Settings::default()
    };
    let (alpha, bravo) = pair(&settings);

    // A transport that loses everything after the first message.
    struct FirstOnly<T>(T);
    impl<T: EventTransport> EventTransport for FirstOnly<T> {
        fn max_payload_size(&self) -> usize {
            self.0.max_payload_size()
        }
        fn publish<'a>(
            &'a self,
            payload: Bytes,
            id: &'a str,
            schema: &'a str,
            content_type: &'a str,
        ) -> BoxFuture<'a, Result<(), TetherError>> {
            Box::pin(async move {
                if id.ends_with("_0") {
                    self.0.publish(payload, id, schema, content_type).await
                } else {
                    Ok(())
                }
            })
        }
    }

    let lossy = FirstOnly(LoopbackEventTransport::new(
        bravo.tunnel_server.clone(),
        ALPHA,
        settings.max_event_payload,
    ));
    let client = HttpTunnelClient::new(Arc::new(lossy), Duration::from_secs(60));
    client.attach(&alpha.router);

    let request = HttpRequest::new(HttpMethod::Put, "/echo").with_body(noise(20_000));
    let waiting = tokio::spawn(async move { client.send(request).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(bravo.tunnel_server.in_flight(), 1);

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(bravo.tunnel_server.sweep(), 1);
    assert_eq!(bravo.tunnel_server.in_flight(), 0);

    // The requester learns nothing and times out on its own.
    let err = waiting.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
}
