//! Bridge device plugins and their supervisor.

pub mod bridge;
pub mod controller;
pub mod registration;

use std::path::Path;
use std::path::PathBuf;

use device_plugin_pb::api::DevicePluginOptions;

pub use bridge::BridgeDevicePlugin;
pub use controller::bridge_device_plugins;
pub use controller::BridgeDeviceController;

/// Resource namespace identifying the bridge device family; every bridge is
/// advertised as `<DEVICE_NAMESPACE>/<name>`.
pub const DEVICE_NAMESPACE: &str = "bridge.network.kubevirt.io";

/// Prefix of every plugin socket created under the kubelet plugin directory.
const SOCKET_PREFIX: &str = "kubevirt";

/// Health of the slots exposed for one bridge. All slots of a bridge share
/// one value, derived solely from the bridge's kernel operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    Healthy,
    Unhealthy,
}

impl DeviceHealth {
    pub fn from_oper_up(oper_up: bool) -> Self {
        if oper_up {
            DeviceHealth::Healthy
        } else {
            DeviceHealth::Unhealthy
        }
    }

    /// The wire value the kubelet expects in [`device_plugin_pb::api::Device::health`].
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceHealth::Healthy => device_plugin_pb::HEALTHY,
            DeviceHealth::Unhealthy => device_plugin_pb::UNHEALTHY,
        }
    }
}

/// Canonical socket path for a device name, under the well-known kubelet
/// plugin directory.
pub fn socket_path(device_name: &str) -> PathBuf {
    socket_path_in(Path::new(device_plugin_pb::DEVICE_PLUGIN_PATH), device_name)
}

/// [`socket_path`] relative to an arbitrary plugin directory.
pub fn socket_path_in(plugin_dir: &Path, device_name: &str) -> PathBuf {
    plugin_dir.join(format!("{SOCKET_PREFIX}-{device_name}.sock"))
}

/// Fully qualified name the kubelet accounts this bridge's resource under.
pub fn resource_name(device_name: &str) -> String {
    format!("{DEVICE_NAMESPACE}/{device_name}")
}

/// The options this plugin family announces: nothing beyond list-and-watch
/// and trivial allocation is implemented.
pub(crate) fn device_plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: false,
    }
}
