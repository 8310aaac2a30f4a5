//! tetherd — tether daemon. Serves the call and event primitives to its
//! peer, answers chunked calls, executes tunnelled HTTP requests against
//! the configured downstream and proxies local requests through the tunnel.

use std::sync::Arc;

use anyhow::{Context, Result};

use tether_core::config::TetherConfig;
use tether_services::{
    CallTransport, ChunkMethodClient, ChunkMethodServer, EventTransport, HttpTunnelClient,
    HttpTunnelServer, MethodRouter, ReqwestClient,
};

mod transport;

use transport::{HttpCallTransport, HttpEventTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TetherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });

    let identity = config.identity.name.clone();
    tracing::info!(
        identity,
        peer = %config.peer.url,
        downstream = %config.tunnel.forward_base_url,
        "tetherd starting"
    );
    if config.peer.url.is_empty() {
        tracing::warn!("no peer url configured, outbound calls and tunnelled requests will fail");
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Inbound calls ────────────────────────────────────────────────────────
    let router = MethodRouter::new(config.channel.max_call_payload);
    let chunk_server = Arc::new(ChunkMethodServer::new(&config.rpc));
    router
        .attach_chunk_server(chunk_server.clone())
        .context("failed to attach chunk server")?;

    // ── Outbound primitives ──────────────────────────────────────────────────
    let calls: Arc<dyn CallTransport> = Arc::new(
        HttpCallTransport::new(&config.peer.url, config.channel.max_call_payload)
            .context("failed to build call transport")?,
    );
    let events: Arc<dyn EventTransport> = Arc::new(
        HttpEventTransport::new(&config.peer.url, &identity, config.channel.max_event_payload)
            .context("failed to build event transport")?,
    );

    // ── Tunnel ───────────────────────────────────────────────────────────────
    let downstream = Arc::new(
        ReqwestClient::new(
            &config.tunnel.forward_base_url,
            config.tunnel.request_timeout(),
        )
        .context("failed to build downstream client")?,
    );
    let callback = ChunkMethodClient::new(calls, config.rpc.call_timeout());
    let tunnel_server = Arc::new(HttpTunnelServer::new(
        downstream,
        callback,
        config.channel.max_event_payload,
        &config.tunnel,
    ));
    let tunnel_client = HttpTunnelClient::new(events, config.tunnel.request_timeout());
    tunnel_client.attach(&router);

    // ── Spawn tasks ──────────────────────────────────────────────────────────
    let rpc_sweeper = chunk_server.spawn_sweeper(shutdown_tx.subscribe());
    let tunnel_sweeper = tunnel_server.spawn_sweeper(shutdown_tx.subscribe());

    let api_port = config.api.port;
    let api_task = {
        let state = tether_api::ApiState {
            identity,
            router,
            tunnel_server: tunnel_server.clone(),
            tunnel_client,
            max_event_payload: config.channel.max_event_payload,
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = tether_api::serve(state, api_port).await {
                tracing::error!(error = %e, "api server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = api_task            => tracing::error!("api server exited: {:?}", r),
        r = rpc_sweeper         => tracing::error!("rpc sweeper exited: {:?}", r),
        r = tunnel_sweeper      => tracing::error!("tunnel sweeper exited: {:?}", r),
    }

    chunk_server.shutdown();
    tunnel_server.shutdown();
    Ok(())
}
