use log::*;
use service::{config::Config, logging::Logger, AppState};
use sse::ConnectionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new();
    Logger::init_logger(&config)?;

    info!("Starting up eventsource_rs...");

    let registry = Arc::new(ConnectionRegistry::new());
    let app_state = AppState::new(config.clone(), &registry);
    let shutdown = CancellationToken::new();

    let keep_alive = config.keep_alive_interval().map(|period| {
        info!("Sending SSE keep-alives every {period:?}");
        web::sse::keep_alive::spawn(registry.clone(), period, shutdown.clone())
    });

    let listen_address = config.listen_address();
    let listener = TcpListener::bind(&listen_address).await?;
    info!("Server starting... listening for connections on http://{listen_address}");

    let router = web::define_routes(app_state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(registry.clone(), shutdown))
    .await?;

    if let Some(task) = keep_alive {
        task.await?;
    }

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C after closing every open stream. Graceful shutdown
/// waits for in-flight responses, which for an event stream means until it
/// is closed from our side.
async fn shutdown_signal(registry: Arc<ConnectionRegistry>, shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {e}");
        std::future::pending::<()>().await;
    }

    info!("Shutting down, closing {} SSE connection(s)", registry.count());
    shutdown.cancel();
    registry.close_all().await;
}
