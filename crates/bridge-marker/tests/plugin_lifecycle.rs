//! Socket-level tests driving the controller and a plugin against a fake
//! kubelet registration server.
//!
//! No real bridges are created here, so the plugins under test report their
//! bridge as absent (Unhealthy); kernel-state flips are covered by the
//! netlink unit tests.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use device_plugin_pb::api::device_plugin_client::DevicePluginClient;
use device_plugin_pb::api::registration_server::Registration;
use device_plugin_pb::api::registration_server::RegistrationServer;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::ContainerAllocateRequest;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::RegisterRequest;
use tokio::net::UnixListener;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;

use bridge_marker::plugin::registration::connect_uds;
use bridge_marker::plugin::BridgeDeviceController;
use bridge_marker::plugin::BridgeDevicePlugin;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct FakeKubelet {
    registrations: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.registrations
            .lock()
            .expect("poisoning")
            .push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

fn spawn_fake_kubelet(
    kubelet_socket: &Path,
    shutdown: CancellationToken,
) -> Arc<Mutex<Vec<RegisterRequest>>> {
    let kubelet = FakeKubelet::default();
    let registrations = Arc::clone(&kubelet.registrations);
    let listener = UnixListener::bind(kubelet_socket).expect("binding fake kubelet socket");

    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(kubelet))
            .serve_with_incoming_shutdown(
                UnixListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
            .expect("fake kubelet server failed");
    });

    registrations
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let result = timeout(TEST_TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

struct Harness {
    _dir: tempfile::TempDir,
    registrations: Arc<Mutex<Vec<RegisterRequest>>>,
    controller: Arc<BridgeDeviceController>,
    stop: CancellationToken,
    kubelet_shutdown: CancellationToken,
    run: tokio::task::JoinHandle<anyhow::Result<()>>,
    socket_path: std::path::PathBuf,
}

/// Boots a fake kubelet plus a controller supervising one permanent plugin
/// for `device_name`, with a fast restart backoff.
fn start_harness(device_name: &str, max_devices: usize) -> Harness {
    let dir = tempfile::tempdir().expect("creating scratch plugin dir");
    let kubelet_socket = dir.path().join("kubelet.sock");

    let kubelet_shutdown = CancellationToken::new();
    let registrations = spawn_fake_kubelet(&kubelet_socket, kubelet_shutdown.clone());

    let plugin = Arc::new(BridgeDevicePlugin::with_paths(
        device_name,
        max_devices,
        dir.path(),
        &kubelet_socket,
    ));
    let socket_path = plugin.socket_path().to_path_buf();

    let controller = Arc::new(
        BridgeDeviceController::new(vec![plugin], max_devices)
            .with_paths(dir.path(), &kubelet_socket)
            .with_backoff(vec![Duration::from_millis(100)]),
    );

    let stop = CancellationToken::new();
    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        let stop = stop.clone();
        async move { controller.run(stop).await }
    });

    Harness {
        _dir: dir,
        registrations,
        controller,
        stop,
        kubelet_shutdown,
        run,
        socket_path,
    }
}

#[tokio::test]
async fn plugin_registers_serves_slots_and_shuts_down_cleanly() {
    let harness = start_harness("brtest0", 4);

    // registration carries the socket basename and the namespaced resource
    wait_for("kubelet registration", || {
        !harness.registrations.lock().expect("poisoning").is_empty()
    })
    .await;
    {
        let registrations = harness.registrations.lock().expect("poisoning");
        let request = &registrations[0];
        assert_eq!(request.version, "v1beta1");
        assert_eq!(request.endpoint, "kubevirt-brtest0.sock");
        assert_eq!(request.resource_name, "bridge.network.kubevirt.io/brtest0");
        let options = request.options.as_ref().expect("registration options");
        assert!(!options.pre_start_required);
        assert!(!options.get_preferred_allocation_available);
    }

    let controller = Arc::clone(&harness.controller);
    wait_for("controller readiness", move || controller.initialized()).await;

    let channel = connect_uds(&harness.socket_path)
        .await
        .expect("dialing plugin socket");
    let mut client = DevicePluginClient::new(channel);

    let options = client
        .get_device_plugin_options(Request::new(Empty {}))
        .await
        .expect("options call")
        .into_inner();
    assert!(!options.pre_start_required);
    assert!(!options.get_preferred_allocation_available);

    // initial list: every slot present and Healthy
    let mut stream = client
        .list_and_watch(Request::new(Empty {}))
        .await
        .expect("list-and-watch call")
        .into_inner();
    let initial = timeout(TEST_TIMEOUT, stream.message())
        .await
        .expect("initial device list timed out")
        .expect("stream error")
        .expect("stream closed early");
    let ids: Vec<_> = initial.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["brtest00", "brtest01", "brtest02", "brtest03"]);
    assert!(initial.devices.iter().all(|d| d.health == "Healthy"));

    // no kernel link named brtest0 exists, so the health loop downgrades
    // every slot
    let update = timeout(TEST_TIMEOUT, stream.message())
        .await
        .expect("health update timed out")
        .expect("stream error")
        .expect("stream closed early");
    assert_eq!(update.devices.len(), 4);
    assert!(update.devices.iter().all(|d| d.health == "Unhealthy"));

    // allocation returns one empty response per container, no mounts or
    // device nodes
    let allocation = client
        .allocate(Request::new(AllocateRequest {
            container_requests: vec![
                ContainerAllocateRequest {
                    devices_ids: vec!["brtest00".to_string()],
                },
                ContainerAllocateRequest {
                    devices_ids: vec!["brtest01".to_string()],
                },
            ],
        }))
        .await
        .expect("allocate call")
        .into_inner();
    assert_eq!(allocation.container_responses.len(), 2);
    for response in &allocation.container_responses {
        assert!(response.envs.is_empty());
        assert!(response.mounts.is_empty());
        assert!(response.devices.is_empty());
    }

    client
        .pre_start_container(Request::new(PreStartContainerRequest::default()))
        .await
        .expect("pre-start call");
    let preferred = client
        .get_preferred_allocation(Request::new(PreferredAllocationRequest::default()))
        .await
        .expect("preferred allocation call")
        .into_inner();
    assert!(preferred.container_responses.is_empty());

    // shutdown: the stream receives one empty list before the server goes
    // away, the socket file disappears, and run() returns cleanly
    harness.stop.cancel();

    let farewell = timeout(TEST_TIMEOUT, stream.message())
        .await
        .expect("deregistration message timed out")
        .expect("stream error")
        .expect("stream closed before deregistration");
    assert!(farewell.devices.is_empty());

    let socket_path = harness.socket_path.clone();
    wait_for("plugin socket removal", move || !socket_path.exists()).await;

    timeout(TEST_TIMEOUT, harness.run)
        .await
        .expect("controller shutdown timed out")
        .expect("controller task panicked")
        .expect("controller returned an error");

    harness.kubelet_shutdown.cancel();
}

#[tokio::test]
async fn socket_removal_triggers_restart_and_reregistration() {
    let harness = start_harness("brtest1", 1);

    wait_for("first registration", || {
        !harness.registrations.lock().expect("poisoning").is_empty()
    })
    .await;
    wait_for("plugin socket", || harness.socket_path.exists()).await;

    // wiping the socket is what a kubelet restart looks like from here
    std::fs::remove_file(&harness.socket_path).expect("removing plugin socket");

    let registrations = Arc::clone(&harness.registrations);
    wait_for("re-registration", move || {
        registrations.lock().expect("poisoning").len() >= 2
    })
    .await;
    let socket_path = harness.socket_path.clone();
    wait_for("socket recreation", move || socket_path.exists()).await;

    harness.stop.cancel();
    timeout(TEST_TIMEOUT, harness.run)
        .await
        .expect("controller shutdown timed out")
        .expect("controller task panicked")
        .expect("controller returned an error");
    harness.kubelet_shutdown.cancel();
}

#[tokio::test]
async fn controller_without_bridges_is_vacuously_ready() {
    let controller = Arc::new(BridgeDeviceController::new(Vec::new(), 1024));
    let stop = CancellationToken::new();

    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        let stop = stop.clone();
        async move { controller.run(stop).await }
    });

    sleep(Duration::from_millis(200)).await;
    assert!(controller.initialized());
    assert!(!run.is_finished());

    stop.cancel();
    timeout(TEST_TIMEOUT, run)
        .await
        .expect("controller shutdown timed out")
        .expect("controller task panicked")
        .expect("controller returned an error");
}
