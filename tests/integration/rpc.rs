use crate::*;

use bytes::Bytes;
use tether_core::compress::compress;
use tether_core::wire::{MethodChunk, CHUNK_OPERATION, JSON_CONTENT_TYPE, OCTET_CONTENT_TYPE};

#[tokio::test]
async fn test_500kb_over_64kb_chunks() {
    let (alpha, bravo) = pair(&Settings::default());
    assert_eq!(alpha.rpc.max_chunk_length(), 64 * 1024);

    let payload = noise(500 * 1000);
    let compressed = compress(&payload).unwrap().len();
    let chunks = compressed.div_ceil(64 * 1024);
    assert_eq!(chunks, 8);

    let out = alpha
        .rpc
        .call(BRAVO, "Echo", &payload, OCTET_CONTENT_TYPE)
        .await
        .unwrap();
    assert_eq!(&out[..], &payload[..]);

    // `chunks` uploads; the last reply already carries the first download
    // chunk, so the echoed result needs `chunks - 1` further polls.
    assert_eq!(alpha.calls.count(), chunks + chunks - 1);
    assert_eq!(bravo.chunk_server.in_flight(), 0);
}

#[tokio::test]
async fn test_chunked_payload_sizes() {
    let settings = Settings {
        max_call_payload: 120 * 1024,
        ..Settings::default()
    };
    let (alpha, bravo) = pair(&settings);

    for len in [0usize, 19, 1049, 128 * 1024, 450_000, 129 * 1024] {
        let payload = noise(len);
        let out = alpha
            .rpc
            .call(BRAVO, "Echo", &payload, OCTET_CONTENT_TYPE)
            .await
            .unwrap_or_else(|e| panic!("{len} bytes: {e}"));
        assert_eq!(out.len(), len);
        assert_eq!(&out[..], &payload[..]);
    }
    assert_eq!(bravo.chunk_server.in_flight(), 0);
}

#[tokio::test]
async fn test_empty_payload_is_one_round_trip() {
    let (alpha, _bravo) = pair(&Settings::default());
    let out = alpha.rpc.call(BRAVO, "Echo", b"", JSON_CONTENT_TYPE).await.unwrap();
    assert!(out.is_empty());
    assert_eq!(alpha.calls.count(), 1);
}

#[tokio::test]
async fn test_handler_status_propagates() {
    let (alpha, _bravo) = pair(&Settings::default());
    let err = alpha
        .rpc
        .call(BRAVO, "Reject", &noise(300_000), OCTET_CONTENT_TYPE)
        .await
        .unwrap_err();
    match err {
        TetherError::RemoteStatus { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("rejected by handler"), "body: {body}");
        }
        other => panic!("expected remote status, got {other}"),
    }
}

#[tokio::test]
async fn test_unexpected_failure_is_internal_error() {
    let (alpha, _bravo) = pair(&Settings::default());
    let err = alpha
        .rpc
        .call(BRAVO, "Explode", b"{}", JSON_CONTENT_TYPE)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 500);
}

#[tokio::test]
async fn test_unknown_operation_is_not_found() {
    let (alpha, _bravo) = pair(&Settings::default());
    let err = alpha
        .rpc
        .call(BRAVO, "Nowhere", b"{}", JSON_CONTENT_TYPE)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 404);
}

#[tokio::test]
async fn test_oversized_direct_call_is_rejected() {
    let (alpha, _bravo) = pair(&Settings::default());
    let limit = alpha.calls.max_payload_size();
    let err = alpha
        .calls
        .invoke(BRAVO, "Echo", Bytes::from(noise(limit + 1)), OCTET_CONTENT_TYPE, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::TransportLimit { .. }));

    // The receiving router applies the same ceiling when the transport does not.
    let resp = alpha
        .router
        .invoke("Echo", Bytes::from(noise(limit + 1)), OCTET_CONTENT_TYPE)
        .await
        .unwrap();
    assert_eq!(resp.status, 413);
}

#[tokio::test]
async fn test_concurrent_calls_use_independent_exchanges() {
    let (alpha, bravo) = pair(&Settings::default());
    let payloads: Vec<Vec<u8>> = (0..8).map(|i| noise(40_000 + i * 17_000)).collect();

    let calls = payloads
        .iter()
        .map(|p| alpha.rpc.call(BRAVO, "Echo", p, OCTET_CONTENT_TYPE));
    let results = futures::future::join_all(calls).await;

    for (payload, result) in payloads.iter().zip(results) {
        assert_eq!(&result.unwrap()[..], &payload[..]);
    }
    assert_eq!(bravo.chunk_server.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_evicted_exchange_continuation_is_not_found() {
    let (alpha, bravo) = pair(&Settings::default());

    // Open an exchange by hand and abandon it after the first chunk.
    let body = compress(&noise(200_000)).unwrap();
    let max = alpha.rpc.max_chunk_length();
    let first = MethodChunk::first(
        "Echo",
        OCTET_CONTENT_TYPE,
        body.len(),
        max,
        None,
        Bytes::copy_from_slice(&body[..max]),
    );
    let reply = alpha
        .calls
        .invoke(BRAVO, CHUNK_OPERATION, Bytes::from(first.to_vec().unwrap()), JSON_CONTENT_TYPE, Duration::from_secs(5))
        .await
        .unwrap();
    let handle = MethodChunk::from_slice(&reply).unwrap().handle.unwrap();
    assert_eq!(bravo.chunk_server.in_flight(), 1);

    tokio::time::advance(Duration::from_secs(21)).await;
    assert_eq!(bravo.chunk_server.sweep(), 1);

    let next = MethodChunk::upload(&handle, 1, Bytes::copy_from_slice(&body[max..2 * max]));
    let reply = alpha
        .calls
        .invoke(BRAVO, CHUNK_OPERATION, Bytes::from(next.to_vec().unwrap()), JSON_CONTENT_TYPE, Duration::from_secs(5))
        .await
        .unwrap();
    let reply = MethodChunk::from_slice(&reply).unwrap();
    assert!(reply.is_terminal());
    assert_eq!(reply.status, Some(404));
}
