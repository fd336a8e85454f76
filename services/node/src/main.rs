use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use mesh_log::Logger;
use server::{Cluster, config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let debug = env::var("CLUSTER_DEBUG")
        .ok()
        .filter(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .is_some();
    let log_level = if debug {
        "debug".to_owned()
    } else {
        env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned())
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&log_level))
        .init();
    mesh_log::set_level(if debug { mesh_log::Level::Debug } else { mesh_log::Level::Info });
    let log = Logger::new("node");

    let config_path = env::var("CLUSTER_CONFIG").ok().map(PathBuf::from);
    let config = config::load(config_path.as_deref()).expect("failed to load cluster config");

    let cluster = Cluster::new(config.clone());
    log.info(format!(
        "starting cluster node {} (namespace={}, port={})",
        cluster.self_id, config.namespace, config.port
    ));

    let router = cluster.clone().start().await;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .expect("failed to bind");
    log.info(format!("node listening on port {}", config.port));
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    log.info("node shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let log = Logger::new("node");
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { log.info("received Ctrl+C, shutting down"); },
        _ = terminate => { log.info("received SIGTERM, shutting down"); },
    }
}
