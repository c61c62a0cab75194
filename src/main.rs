use clap::Parser;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod client;
mod config;
mod context;
mod data_channel;
mod enter_code;
mod error;
mod experiment;
mod facade;
mod game;
mod lobby;
mod messages;
mod registry;
mod session;
#[cfg(test)]
mod test_utils;
mod timesync;

use crate::client::serve_control;
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::data_channel::run_data_channel;

/// Entry point: binds both channels and runs until Ctrl-C
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    let listener = TcpListener::bind(config.control_addr).await?;
    let data_socket = Arc::new(UdpSocket::bind(config.data_addr).await?);
    let ctx = ServerContext::new(&config, Arc::clone(&data_socket));
    info!(
        "Server listening on {} (control) and {} (data)",
        config.control_addr, config.data_addr
    );

    let shutdown = CancellationToken::new();
    let sweep = ctx
        .registry
        .spawn_liveness_sweep(config.sweep_interval(), shutdown.clone());
    let sampler = ctx.time_sync.spawn_sampler(shutdown.clone());
    let data = tokio::spawn(run_data_channel(
        Arc::clone(&ctx),
        data_socket,
        shutdown.clone(),
    ));
    let control = tokio::spawn(serve_control(Arc::clone(&ctx), listener, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!(
        "Shutting down with {} lobbies open and {} games running",
        ctx.lobbies.list().len(),
        ctx.games.lobbies_with_running_games().len()
    );
    shutdown.cancel();

    for (name, task) in [("data channel", data), ("control channel", control)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} failed: {:#}", name, e),
            Err(e) => error!("{} task panicked: {}", name, e),
        }
    }
    let _ = sweep.await;
    if let Some(sampler) = sampler {
        let _ = sampler.await;
    }
    Ok(())
}
