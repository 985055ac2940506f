use anyhow::Result;
use tokio::select;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tracing::{error, info};

use rusty_duct::{register_builtin, TransportRegistry};

use crate::config::ConfigBuilder;
use crate::forward::Forwarder;
use crate::utils::logging::init_logger;

pub(crate) mod config;
mod forward;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    let (config_builder, logger_config) = ConfigBuilder::new().get_opts()?.get_ini_config()?;
    let _guard = init_logger(logger_config)?;
    let config = config_builder.build()?;

    // Explicit wiring instead of load-time side effects; a clash here means
    // the build itself is wrong, so give up before binding anything
    let mut registry = TransportRegistry::new();
    if let Err(e) = register_builtin(&mut registry) {
        error!("failed to register transports: {}", e);
        return Err(e.into());
    }

    let (forwarder, conn_sender) = Forwarder::new(&config.forward_settings);
    let listener = match registry
        .listen(config.stream_settings, Forwarder::handler(conn_sender))
        .await
    {
        Ok(l) => l,
        Err(e) => {
            error!("failed to start listener: {}", e);
            return Err(e.into());
        }
    };
    info!("listening on {}", listener.local_endpoint());
    let forward_task = tokio::task::spawn(forwarder.run());

    wait_for_shutdown().await?;
    info!("shutting down");
    listener.close().await?;
    // The listener held the last handler clone, so the forwarder's channel
    // is closed now and run() drains whatever is still in flight
    forward_task.await?;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(SignalKind::terminate())?;
    select! {
        c = signal::ctrl_c() => { c?; },
        _ = sigterm.recv() => {},
    }
    Ok(())
}
