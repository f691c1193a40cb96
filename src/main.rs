#[macro_use]
extern crate log;

use simple_ingress::{watcher::Watcher, Config, Server};
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
pub async fn main() {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    let watcher = match Watcher::connect().await {
        Ok(watcher) => watcher,
        Err(e) => {
            error!("Failed to connect to the cluster: {}", e);
            process::exit(1);
        }
    };

    let server = Arc::new(Server::new(config.clone()));
    let shutdown = CancellationToken::new();

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested.");
        shutdown_clone.cancel();
    });

    let server_clone = server.clone();
    let shutdown_clone = shutdown.clone();
    let watch = tokio::spawn(async move {
        watcher
            .run(server_clone, config.debounce, shutdown_clone)
            .await;
    });

    let result = server.run(shutdown.clone()).await;
    shutdown.cancel();
    let _ = watch.await;

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
