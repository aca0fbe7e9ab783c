//! Supervision: restart-looped plugin instances and the controller that
//! discovers bridges and keeps one plugin running per bridge.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use crate::netlink;
use crate::netlink::LinkEvent;
use crate::plugin::BridgeDevicePlugin;

/// Restart delays applied after consecutive failed starts, saturating at
/// the tail. A successful run resets to the head.
const DEFAULT_BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Bound on how long shutdown waits for plugin teardown (deregistration
/// grace plus socket removal) before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Picks the delay before the next start attempt and advances the retry
/// index: the k-th consecutive failure waits `backoff[min(k-1, len-1)]`, a
/// success resets to `backoff[0]`.
fn next_delay(backoff: &[Duration], retries: &mut usize, failed: bool) -> Duration {
    if failed {
        let delay = backoff[(*retries).min(backoff.len() - 1)];
        *retries = (*retries + 1).min(backoff.len() - 1);
        delay
    } else {
        *retries = 0;
        backoff[0]
    }
}

/// Keeps one [`BridgeDevicePlugin`] running until explicitly stopped.
pub(crate) struct ControlledDevice {
    device_plugin: Arc<BridgeDevicePlugin>,
    backoff: Vec<Duration>,
    started: bool,
    stop: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl ControlledDevice {
    pub(crate) fn new(device_plugin: Arc<BridgeDevicePlugin>, backoff: Vec<Duration>) -> Self {
        Self {
            device_plugin,
            backoff,
            started: false,
            stop: None,
            handle: None,
        }
    }

    pub(crate) fn device_plugin(&self) -> &Arc<BridgeDevicePlugin> {
        &self.device_plugin
    }

    /// Spawns the restart loop. A second call while started is a no-op.
    pub(crate) fn start(&mut self) {
        if self.started {
            return;
        }

        let stop = CancellationToken::new();
        let plugin = Arc::clone(&self.device_plugin);
        let backoff = self.backoff.clone();
        info!(device = plugin.device_name(), "starting a device plugin");

        let handle = tokio::spawn({
            let stop = stop.clone();
            async move {
                let mut retries = 0;
                loop {
                    let delay = match plugin.start(stop.clone()).await {
                        Ok(()) => next_delay(&backoff, &mut retries, false),
                        Err(err) => {
                            error!(
                                device = plugin.device_name(),
                                "error starting device plugin: {err:#}"
                            );
                            next_delay(&backoff, &mut retries, true)
                        }
                    };

                    tokio::select! {
                        // stopped for good, no further registration
                        () = stop.cancelled() => return,
                        () = sleep(delay) => {}
                    }
                }
            }
        });

        self.stop = Some(stop);
        self.handle = Some(handle);
        self.started = true;
    }

    /// Cancels the restart loop and the running plugin, returning the loop's
    /// join handle so callers can await teardown. Idempotent.
    pub(crate) fn stop(&mut self) -> Option<JoinHandle<()>> {
        if !self.started {
            return None;
        }
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        self.started = false;
        self.handle.take()
    }
}

/// Enumerates current kernel bridges and builds one plugin per bridge.
///
/// Fails when the kernel cannot be asked for its link list; the caller is
/// expected to treat that as fatal.
pub async fn bridge_device_plugins(
    max_devices: usize,
    plugin_dir: &Path,
    kubelet_socket: &Path,
) -> Result<Vec<Arc<BridgeDevicePlugin>>> {
    let names = netlink::list_bridge_names().await?;
    Ok(names
        .into_iter()
        .map(|name| {
            Arc::new(BridgeDevicePlugin::with_paths(
                name,
                max_devices,
                plugin_dir,
                kubelet_socket,
            ))
        })
        .collect())
}

/// Starts one supervised plugin per discovered bridge and keeps the set
/// current as bridges appear, until stopped.
///
/// Bridge deletions are not propagated here: the protocol has no
/// deregistration verb, so the per-plugin health loop downgrades the
/// resource to Unhealthy instead.
pub struct BridgeDeviceController {
    permanent_plugins: HashMap<String, Arc<BridgeDevicePlugin>>,
    started_plugins: Mutex<HashMap<String, ControlledDevice>>,
    max_devices: usize,
    plugin_dir: PathBuf,
    kubelet_socket: PathBuf,
    backoff: Vec<Duration>,
}

impl BridgeDeviceController {
    pub fn new(permanent_plugins: Vec<Arc<BridgeDevicePlugin>>, max_devices: usize) -> Self {
        let permanent_plugins = permanent_plugins
            .into_iter()
            .map(|plugin| (plugin.device_name().to_string(), plugin))
            .collect();
        Self {
            permanent_plugins,
            started_plugins: Mutex::new(HashMap::new()),
            max_devices,
            plugin_dir: PathBuf::from(device_plugin_pb::DEVICE_PLUGIN_PATH),
            kubelet_socket: PathBuf::from(device_plugin_pb::KUBELET_SOCKET),
            backoff: DEFAULT_BACKOFF.to_vec(),
        }
    }

    /// Overrides the kubelet paths used for plugins built at discovery time.
    pub fn with_paths(mut self, plugin_dir: &Path, kubelet_socket: &Path) -> Self {
        self.plugin_dir = plugin_dir.to_path_buf();
        self.kubelet_socket = kubelet_socket.to_path_buf();
        self
    }

    /// Overrides the restart backoff schedule.
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        assert!(!backoff.is_empty(), "backoff schedule cannot be empty");
        self.backoff = backoff;
        self
    }

    /// True iff every started plugin reports initialized (vacuously true
    /// when none is running). Backs external readiness probes.
    pub fn initialized(&self) -> bool {
        self.started_plugins
            .lock()
            .expect("poisoning")
            .values()
            .all(|device| device.device_plugin().initialized())
    }

    /// Runs the controller until `stop` is cancelled: starts the permanent
    /// plugins, then services discovery, then tears everything down.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        {
            let mut started = self.started_plugins.lock().expect("poisoning");
            for (name, plugin) in &self.permanent_plugins {
                Self::start_device(&mut started, name.clone(), Arc::clone(plugin), &self.backoff);
            }
        }

        // Discovery hands fresh plugins to this loop instead of touching the
        // started map itself; this loop is the map's only writer.
        let (new_plugins_tx, mut new_plugins) = mpsc::channel(1);
        tokio::spawn(scan_for_new_devices(
            self.max_devices,
            self.plugin_dir.clone(),
            self.kubelet_socket.clone(),
            stop.clone(),
            new_plugins_tx,
        ));

        loop {
            tokio::select! {
                plugin = new_plugins.recv() => {
                    match plugin {
                        Some(plugin) => {
                            let mut started = self.started_plugins.lock().expect("poisoning");
                            Self::start_device(
                                &mut started,
                                plugin.device_name().to_string(),
                                plugin,
                                &self.backoff,
                            );
                        }
                        // discovery is gone; fatal subscription errors cancel
                        // `stop` themselves, so just wait for it
                        None => {
                            stop.cancelled().await;
                            break;
                        }
                    }
                }
                () = stop.cancelled() => break,
            }
        }

        info!("shutting down device plugin controller");
        let handles: Vec<_> = {
            let mut started = self.started_plugins.lock().expect("poisoning");
            started
                .drain()
                .filter_map(|(_, mut device)| device.stop())
                .collect()
        };
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles)).await;
        Ok(())
    }

    /// Replaces any running plugin for `name` with a fresh supervised one.
    /// Caller holds the `started_plugins` lock.
    fn start_device(
        started: &mut HashMap<String, ControlledDevice>,
        name: String,
        plugin: Arc<BridgeDevicePlugin>,
        backoff: &[Duration],
    ) {
        Self::stop_device(started, &name);
        let mut device = ControlledDevice::new(plugin, backoff.to_vec());
        device.start();
        started.insert(name, device);
    }

    fn stop_device(started: &mut HashMap<String, ControlledDevice>, name: &str) {
        if let Some(mut device) = started.remove(name) {
            device.stop();
        }
    }
}

/// Watches for bridge `RTM_NEWLINK` events and hands a freshly built plugin
/// to the controller's run loop for each one.
async fn scan_for_new_devices(
    max_devices: usize,
    plugin_dir: PathBuf,
    kubelet_socket: PathBuf,
    stop: CancellationToken,
    new_plugins: mpsc::Sender<Arc<BridgeDevicePlugin>>,
) {
    let mut updates = match netlink::subscribe_link_updates(stop.clone()) {
        Ok(updates) => updates,
        Err(err) => {
            // without link updates the controller cannot meet its contract
            error!("could not subscribe to link updates, stopping device plugin: {err:#}");
            stop.cancel();
            return;
        }
    };

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    if !stop.is_cancelled() {
                        error!("link update stream ended, stopping device plugin");
                        stop.cancel();
                    }
                    return;
                };
                if update.is_bridge && update.event == LinkEvent::New {
                    let plugin = Arc::new(BridgeDevicePlugin::with_paths(
                        update.name,
                        max_devices,
                        &plugin_dir,
                        &kubelet_socket,
                    ));
                    tokio::select! {
                        result = new_plugins.send(plugin) => {
                            if result.is_err() {
                                return;
                            }
                        }
                        () = stop.cancelled() => return,
                    }
                }
            }
            () = stop.cancelled() => {
                info!("stop scanning for new devices due to stop signal");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_saturates_and_resets() {
        let backoff = DEFAULT_BACKOFF.to_vec();
        let mut retries = 0;

        // consecutive failures walk the schedule and saturate at the tail
        let waits: Vec<_> = (0..6)
            .map(|_| next_delay(&backoff, &mut retries, true))
            .collect();
        assert_eq!(
            waits,
            [
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );

        // a successful run resets to the head
        assert_eq!(
            next_delay(&backoff, &mut retries, false),
            Duration::from_secs(1)
        );
        assert_eq!(
            next_delay(&backoff, &mut retries, true),
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn controlled_device_start_and_stop_are_idempotent() {
        let plugin = Arc::new(BridgeDevicePlugin::new("brtest", 1));
        let mut device = ControlledDevice::new(plugin, vec![Duration::from_millis(10)]);

        device.start();
        let first = device.stop.clone().unwrap();
        device.start();
        // the second start was a no-op: the stored token still shares state
        // with the one created by the first start
        first.cancel();
        assert!(device.stop.as_ref().unwrap().is_cancelled());

        let handle = device.stop();
        assert!(handle.is_some());
        assert!(device.stop().is_none());
    }

    #[tokio::test]
    async fn initialized_is_vacuously_true_without_plugins() {
        let controller = BridgeDeviceController::new(Vec::new(), 1024);
        assert!(controller.initialized());
    }
}
