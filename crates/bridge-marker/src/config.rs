use std::path::PathBuf;

use clap::Parser;

/// The Linux kernel hardcodes `BR_PORT_BITS = 10`, so a bridge accepts at
/// most 1024 (2^10) ports.
const MAX_DEVICES: usize = 1024;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bridge-marker",
    about = "Exposes Linux bridge interfaces to the kubelet as extended resources"
)]
pub struct Cli {
    /// The maximum number of connected devices to the bridge
    #[arg(long, default_value_t = MAX_DEVICES)]
    pub max_devices: usize,

    /// Kubelet directory holding the device plugin sockets
    #[arg(
        long,
        env = "BRIDGE_MARKER_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = device_plugin_pb::DEVICE_PLUGIN_PATH
    )]
    pub plugin_dir: PathBuf,

    /// Kubelet registration socket
    #[arg(
        long,
        env = "BRIDGE_MARKER_KUBELET_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        default_value = device_plugin_pb::KUBELET_SOCKET
    )]
    pub kubelet_socket: PathBuf,
}
