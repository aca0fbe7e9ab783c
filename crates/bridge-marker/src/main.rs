use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use bridge_marker::config::Cli;
use bridge_marker::logging;
use bridge_marker::plugin::bridge_device_plugins;
use bridge_marker::plugin::BridgeDeviceController;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init();

    let plugins = bridge_device_plugins(cli.max_devices, &cli.plugin_dir, &cli.kubelet_socket)
        .await
        .context("bridge-marker couldn't start")?;

    tracing::info!(
        bridges = plugins.len(),
        max_devices = cli.max_devices,
        "starting bridge device plugin controller"
    );

    let controller = BridgeDeviceController::new(plugins, cli.max_devices)
        .with_paths(&cli.plugin_dir, &cli.kubelet_socket);

    let stop = CancellationToken::new();
    spawn_signal_handler(stop.clone())?;

    controller.run(stop).await
}

fn spawn_signal_handler(stop: CancellationToken) -> Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => tracing::info!("received SIGINT, initiating graceful shutdown"),
        }
        stop.cancel();
    });

    Ok(())
}
