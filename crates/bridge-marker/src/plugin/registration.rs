//! Client side of the kubelet device-plugin registration protocol.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use device_plugin_pb::api::registration_client::RegistrationClient;
use device_plugin_pb::api::RegisterRequest;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::time::sleep;
use tokio::time::timeout;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tower::service_fn;
use tracing::info;

use crate::plugin::device_plugin_options;

/// Window within which dials and the local readiness probe must succeed.
pub(crate) const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a gRPC channel over a Unix domain socket.
pub async fn connect_uds(socket_path: &Path) -> Result<Channel> {
    let display = socket_path.display().to_string();
    let socket_path = socket_path.to_path_buf();

    // The HTTP URI is a placeholder, the connector below dials the socket
    let endpoint = Endpoint::from_static("http://tonic");
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let socket_path = socket_path.clone();
        async move {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => Ok(TokioIo::new(stream)),
                Err(err) => Err(Box::new(err) as Box<dyn std::error::Error + Send + Sync>),
            }
        }
    }));

    timeout(CONNECTION_TIMEOUT, connect)
        .await
        .with_context(|| format!("timed out dialing {display}"))?
        .with_context(|| format!("failed to dial {display}"))
}

/// Waits until the socket at `socket_path` accepts a connection
/// (connect-and-close probe), bounded by [`CONNECTION_TIMEOUT`].
pub(crate) async fn wait_for_server(socket_path: &Path) -> Result<()> {
    timeout(CONNECTION_TIMEOUT, async {
        loop {
            match UnixStream::connect(socket_path).await {
                Ok(_stream) => return,
                Err(_) => sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .with_context(|| {
        format!(
            "device plugin socket at {} did not become ready",
            socket_path.display()
        )
    })
}

/// Registers a plugin socket and its resource name with the kubelet.
///
/// `endpoint` is the basename of the plugin's socket; the kubelet resolves
/// it relative to its own plugin directory.
pub(crate) async fn register_with_kubelet(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
) -> Result<()> {
    let channel = connect_uds(kubelet_socket).await?;
    let mut client = RegistrationClient::new(channel);

    let request = RegisterRequest {
        version: device_plugin_pb::API_VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(device_plugin_options()),
    };

    client
        .register(Request::new(request))
        .await
        .with_context(|| format!("kubelet rejected registration for {resource_name}"))?;

    info!(resource = resource_name, "registered device plugin with kubelet");
    Ok(())
}
