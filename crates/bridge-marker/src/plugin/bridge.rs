//! Per-bridge device plugin: one gRPC server on one kubelet socket, serving
//! `max_devices` synthetic slots whose shared health tracks the bridge's
//! kernel operational state.

use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use device_plugin_pb::api::device_plugin_server::DevicePlugin;
use device_plugin_pb::api::device_plugin_server::DevicePluginServer;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::AllocateResponse;
use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::Device;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreStartContainerResponse;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::PreferredAllocationResponse;
use futures::Stream;
use notify::Watcher;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::netlink;
use crate::plugin::device_plugin_options;
use crate::plugin::registration;
use crate::plugin::resource_name;
use crate::plugin::socket_path_in;
use crate::plugin::DeviceHealth;

/// Grace period granted to the kubelet to observe the empty device list
/// before the server is torn down.
const DEREGISTRATION_GRACE: Duration = Duration::from_secs(1);

/// Advertises one bridge to the kubelet for the plugin's lifetime.
///
/// A plugin is inert until [`start`](Self::start) is called; the supervised
/// restart wrapper guarantees `start` is never invoked concurrently.
pub struct BridgeDevicePlugin {
    device_name: String,
    resource_name: String,
    socket_path: PathBuf,
    kubelet_socket: PathBuf,
    max_devices: usize,
    initialized: Mutex<bool>,
}

impl BridgeDevicePlugin {
    /// Creates a plugin advertising `max_devices` slots for `device_name`
    /// under the well-known kubelet plugin directory.
    pub fn new(device_name: impl Into<String>, max_devices: usize) -> Self {
        Self::with_paths(
            device_name,
            max_devices,
            Path::new(device_plugin_pb::DEVICE_PLUGIN_PATH),
            Path::new(device_plugin_pb::KUBELET_SOCKET),
        )
    }

    /// Same as [`new`](Self::new) with the kubelet paths overridden; the
    /// daemon maps its path flags through here, tests point it at scratch
    /// directories.
    pub fn with_paths(
        device_name: impl Into<String>,
        max_devices: usize,
        plugin_dir: &Path,
        kubelet_socket: &Path,
    ) -> Self {
        let device_name = device_name.into();
        Self {
            resource_name: resource_name(&device_name),
            socket_path: socket_path_in(plugin_dir, &device_name),
            kubelet_socket: kubelet_socket.to_path_buf(),
            max_devices,
            initialized: Mutex::new(false),
            device_name,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// True once the plugin has a live socket, a successful registration and
    /// a running health loop; false again as soon as it is stopped.
    pub fn initialized(&self) -> bool {
        *self.initialized.lock().expect("poisoning")
    }

    fn set_initialized(&self, value: bool) {
        *self.initialized.lock().expect("poisoning") = value;
    }

    fn devices(&self) -> Vec<Device> {
        (0..self.max_devices)
            .map(|index| Device {
                id: format!("{}{index}", self.device_name),
                health: DeviceHealth::Healthy.as_str().to_string(),
                topology: None,
            })
            .collect()
    }

    fn cleanup(&self) -> Result<()> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing {}", self.socket_path.display()))
            }
        }
    }

    /// Runs the plugin until `stop` is cancelled, the kubelet wipes the
    /// plugin socket, or one of its tasks fails.
    ///
    /// The socket is cleaned up and `initialized` cleared on every exit
    /// path; a returned error means the attempt failed and the caller may
    /// retry.
    pub async fn start(&self, stop: CancellationToken) -> Result<()> {
        let done = CancellationToken::new();
        let deregistered = CancellationToken::new();
        let server_shutdown = CancellationToken::new();
        // capacity 1 so the health loop's initial publish survives until the
        // kubelet attaches its list-and-watch stream
        let (health_tx, health_rx) = mpsc::channel(1);

        self.cleanup()?;

        let listener = UnixListener::bind(&self.socket_path).with_context(|| {
            format!(
                "error creating gRPC server socket at {}",
                self.socket_path.display()
            )
        })?;

        let service = DevicePluginService {
            device_name: self.device_name.clone(),
            devices: self.devices(),
            health: Mutex::new(Some(health_rx)),
            stop: stop.clone(),
            done: done.clone(),
            deregistered: deregistered.clone(),
        };

        let (err_tx, mut err_rx) = mpsc::channel::<Result<()>>(2);

        {
            let err_tx = err_tx.clone();
            let server_shutdown = server_shutdown.clone();
            tokio::spawn(async move {
                let result = tonic::transport::Server::builder()
                    .add_service(DevicePluginServer::new(service))
                    .serve_with_incoming_shutdown(
                        UnixListenerStream::new(listener),
                        server_shutdown.cancelled_owned(),
                    )
                    .await;
                let _ = err_tx.send(result.map_err(Into::into)).await;
            });
        }

        let run = async {
            registration::wait_for_server(&self.socket_path).await?;

            let endpoint = self
                .socket_path
                .file_name()
                .and_then(|name| name.to_str())
                .context("device plugin socket path has no basename")?;
            registration::register_with_kubelet(&self.kubelet_socket, endpoint, &self.resource_name)
                .await
                .context("error registering with device plugin manager")?;

            {
                let err_tx = err_tx.clone();
                let device_name = self.device_name.clone();
                let socket_path = self.socket_path.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    let result = health_check(&device_name, &socket_path, stop, health_tx).await;
                    let _ = err_tx.send(result).await;
                });
            }

            self.set_initialized(true);
            info!(device = %self.device_name, "device plugin started");

            // first completion of either the serve task or the health loop
            err_rx.recv().await.unwrap_or(Ok(()))
        };

        let result = run.await;
        self.stop_device_plugin(&done, &deregistered, &server_shutdown)
            .await;
        result
    }

    async fn stop_device_plugin(
        &self,
        done: &CancellationToken,
        deregistered: &CancellationToken,
        server_shutdown: &CancellationToken,
    ) {
        done.cancel();

        // Give the kubelet a moment to receive the empty device list
        if tokio::time::timeout(DEREGISTRATION_GRACE, deregistered.cancelled())
            .await
            .is_err()
        {
            debug!(device = %self.device_name, "deregistration grace period elapsed");
        }

        server_shutdown.cancel();
        self.set_initialized(false);
        if let Err(err) = self.cleanup() {
            warn!(device = %self.device_name, "failed to remove device plugin socket: {err:#}");
        }
    }
}

/// gRPC service state for one start attempt of a [`BridgeDevicePlugin`].
struct DevicePluginService {
    device_name: String,
    devices: Vec<Device>,
    /// Taken by the first list-and-watch stream; the kubelet holds a single
    /// connection per plugin socket, so a second take never happens in
    /// practice.
    health: Mutex<Option<mpsc::Receiver<DeviceHealth>>>,
    stop: CancellationToken,
    done: CancellationToken,
    deregistered: CancellationToken,
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(device_plugin_options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let Some(mut health) = self.health.lock().expect("poisoning").take() else {
            return Err(Status::failed_precondition(
                "list-and-watch stream already active",
            ));
        };

        info!(device = %self.device_name, "kubelet opened list-and-watch stream");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut devices = self.devices.clone();
        let device_name = self.device_name.clone();
        let stop = self.stop.clone();
        let done = self.done.clone();
        let deregistered = self.deregistered.clone();

        tokio::spawn(async move {
            let _ = tx.send(Ok(ListAndWatchResponse {
                devices: devices.clone(),
            }));

            loop {
                tokio::select! {
                    update = health.recv() => {
                        let Some(update) = update else { break };
                        // one shared bridge, so every slot reflects its health
                        for device in &mut devices {
                            device.health = update.as_str().to_string();
                        }
                        if tx
                            .send(Ok(ListAndWatchResponse {
                                devices: devices.clone(),
                            }))
                            .is_err()
                        {
                            break;
                        }
                    }
                    () = stop.cancelled() => break,
                    () = done.cancelled() => break,
                }
            }

            // An empty list is the closest thing the protocol has to an
            // explicit deregistration; send it before the server goes away.
            if tx
                .send(Ok(ListAndWatchResponse { devices: Vec::new() }))
                .is_err()
            {
                warn!(device = %device_name, "device plugin failed to deregister");
            }
            deregistered.cancel();
        });

        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let request = request.into_inner();
        info!(
            device = %self.device_name,
            requests = ?request.container_requests,
            "allocating bridge slots"
        );

        // Slots are scheduling tokens; no device nodes, mounts or env vars
        // are handed to the container.
        let container_responses = request
            .container_requests
            .iter()
            .map(|_| ContainerAllocateResponse::default())
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse::default()))
    }
}

/// Publishes `value` unless the consumer is gone or the plugin is stopping.
async fn publish(
    health: &mpsc::Sender<DeviceHealth>,
    stop: &CancellationToken,
    value: DeviceHealth,
) {
    tokio::select! {
        result = health.send(value) => {
            if result.is_err() {
                debug!("dropping health update, list-and-watch stream is gone");
            }
        }
        () = stop.cancelled() => {}
    }
}

/// Watches kernel link state for `device_name` and republishes health on
/// every change, until `stop` cancels or the plugin socket disappears.
///
/// A removed socket file means the kubelet restarted and wiped its plugin
/// directory; returning `Ok` lets the restart wrapper re-register promptly.
async fn health_check(
    device_name: &str,
    socket_path: &Path,
    stop: CancellationToken,
    health: mpsc::Sender<DeviceHealth>,
) -> Result<()> {
    let mut link_updates = netlink::subscribe_link_updates(stop.clone())
        .context("failed to subscribe to link updates")?;

    let socket_dir = socket_path
        .parent()
        .context("device plugin socket has no parent directory")?;
    let (fs_tx, mut fs_rx) = mpsc::channel(16);
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let _ = fs_tx.blocking_send(event);
    })
    .context("failed to create filesystem watcher")?;
    watcher
        .watch(socket_dir, notify::RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", socket_dir.display()))?;

    match netlink::link_oper_up(device_name)
        .await
        .context("could not check the bridge")?
    {
        None => {
            warn!(bridge = %device_name, "bridge is not present, the device plugin can't expose it");
            publish(&health, &stop, DeviceHealth::Unhealthy).await;
        }
        Some(oper_up) => {
            info!(bridge = %device_name, up = oper_up, "bridge is present");
            publish(&health, &stop, DeviceHealth::from_oper_up(oper_up)).await;
        }
    }

    loop {
        tokio::select! {
            () = stop.cancelled() => return Ok(()),
            update = link_updates.recv() => {
                let Some(update) = update else {
                    if stop.is_cancelled() {
                        return Ok(());
                    }
                    anyhow::bail!("link update subscription ended unexpectedly");
                };
                if update.name == device_name {
                    if update.oper_up {
                        info!(bridge = %device_name, "monitored bridge is up");
                    } else {
                        info!(bridge = %device_name, "monitored bridge is down");
                    }
                    publish(&health, &stop, DeviceHealth::from_oper_up(update.oper_up)).await;
                }
            }
            event = fs_rx.recv() => {
                match event {
                    Some(Ok(event)) => {
                        if matches!(event.kind, notify::EventKind::Remove(_))
                            && event.paths.iter().any(|path| path == socket_path)
                        {
                            info!(device = %device_name, "device plugin socket was removed, kubelet probably restarted");
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => error!(error = %err, "error watching device plugin socket"),
                    None => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_are_indexed_slots_sharing_health() {
        let plugin = BridgeDevicePlugin::new("br0", 3);
        let devices = plugin.devices();

        let ids: Vec<_> = devices.iter().map(|device| device.id.as_str()).collect();
        assert_eq!(ids, ["br00", "br01", "br02"]);
        assert!(devices.iter().all(|device| device.health == "Healthy"));
    }

    #[test]
    fn default_paths_follow_the_kubelet_layout() {
        let plugin = BridgeDevicePlugin::new("br1", 1);
        assert_eq!(
            plugin.socket_path(),
            Path::new("/var/lib/kubelet/device-plugins/kubevirt-br1.sock")
        );
        assert_eq!(plugin.resource_name(), "bridge.network.kubevirt.io/br1");
        assert!(!plugin.initialized());
    }

    #[test]
    fn cleanup_tolerates_a_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = BridgeDevicePlugin::with_paths(
            "br0",
            1,
            dir.path(),
            &dir.path().join("kubelet.sock"),
        );

        plugin.cleanup().unwrap();

        std::fs::write(plugin.socket_path(), b"").unwrap();
        plugin.cleanup().unwrap();
        assert!(!plugin.socket_path().exists());
    }
}
