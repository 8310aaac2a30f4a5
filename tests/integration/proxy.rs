use crate::*;

/// Serve `peer`'s API on an ephemeral port and return its base URL.
async fn serve_api(peer: &Peer, max_event_payload: usize) -> String {
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let state = tether_api::ApiState {
        identity: peer.name.to_string(),
        router: peer.router.clone(),
        tunnel_server: peer.tunnel_server.clone(),
        tunnel_client: peer.tunnel_client.clone(),
        max_event_payload,
        shutdown_tx,
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind api");
    let addr = listener.local_addr().expect("api addr");
    let app = tether_api::build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_proxy_forwards_through_tunnel() {
    let settings = Settings {
        downstream_url: spawn_downstream().await,
        ..Settings::default()
    };
    let (alpha, bravo) = pair(&settings);
    let api = serve_api(&alpha, settings.max_event_payload).await;

    let body = noise(150_000);
    let response = reqwest::Client::new()
        .post(format!("{api}/proxy/echo"))
        .header("content-type", "application/x-test")
        .body(body.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/x-test"
    );
    let echoed = response.bytes().await.unwrap();
    assert_eq!(&echoed[..], &body[..]);
    assert!(alpha.events.count() > 1);
    assert_eq!(bravo.tunnel_server.in_flight(), 0);
}

#[tokio::test]
async fn test_proxy_keeps_query_string() {
    let settings = Settings {
        downstream_url: spawn_downstream().await,
        ..Settings::default()
    };
    let (alpha, _bravo) = pair(&settings);
    let api = serve_api(&alpha, settings.max_event_payload).await;

    let response = reqwest::get(format!("{api}/proxy/status/202?source=test"))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
}

#[tokio::test]
async fn test_status_endpoint_reports_idle_peer() {
    let (alpha, _bravo) = pair(&Settings::default());
    let api = serve_api(&alpha, 64 * 1024).await;

    let status: serde_json::Value = reqwest::get(format!("{api}/api/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["identity"], ALPHA);
    assert_eq!(status["rpc_exchanges"], 0);
    assert_eq!(status["tunnel_exchanges"], 0);
    assert_eq!(status["pending_requests"], 0);
}
