//! Generated bindings for the kubelet device-plugin `v1beta1` API, plus the
//! well-known constants device plugins and the kubelet agree on.

pub mod api {
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("v1beta1");
}

/// API version announced at registration time.
pub const API_VERSION: &str = "v1beta1";

/// Directory in which the kubelet expects device plugins to create their
/// sockets, and in which it creates its own registration socket.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// The kubelet registration socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Wire value of [`api::Device::health`] for a usable device.
pub const HEALTHY: &str = "Healthy";

/// Wire value of [`api::Device::health`] for an unusable device.
pub const UNHEALTHY: &str = "Unhealthy";
