//! `/dev/input` enumeration and udev hot-plug as a [`DeviceRegistry`]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use hidseize::platform::RegistryCallback;
use hidseize::{
    DeviceError, DeviceFilter, DeviceRegistry, PlatformDevice, RegistryEntryId,
    RegistryNotification, RegistryWatch,
};

use crate::device::EvdevDevice;

const EVENT_NODE_PREFIX: &str = "/dev/input/event";

/// udev action of a hot-plug event
#[cfg_attr(not(feature = "hotplug"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeAction {
    Add,
    Remove,
    Other,
}

/// What a hot-plug event means for the watch
#[cfg_attr(not(feature = "hotplug"), allow(dead_code))]
#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeChange {
    Added(PathBuf),
    Removed(RegistryEntryId),
}

/// Map a udev event on the input subsystem to a registry change
///
/// Only event nodes count; removals are keyed by device number because the
/// node is already gone.
#[cfg_attr(not(feature = "hotplug"), allow(dead_code))]
fn node_change(
    action: NodeAction,
    devnode: Option<&Path>,
    devnum: Option<u64>,
) -> Option<NodeChange> {
    let devnode = devnode?;
    if !devnode.to_string_lossy().starts_with(EVENT_NODE_PREFIX) {
        return None;
    }
    match action {
        NodeAction::Add => Some(NodeChange::Added(devnode.to_path_buf())),
        NodeAction::Remove => devnum.map(|devnum| NodeChange::Removed(RegistryEntryId(devnum))),
        NodeAction::Other => None,
    }
}

/// Registry backed by evdev enumeration and udev
///
/// Every [`watch`](DeviceRegistry::watch) runs on its own thread: it reports
/// the matching nodes present now, then follows udev until cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvdevRegistry;

impl EvdevRegistry {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceRegistry for EvdevRegistry {
    fn watch(
        &self,
        filter: DeviceFilter,
        callback: RegistryCallback,
    ) -> Result<Box<dyn RegistryWatch>, DeviceError> {
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<io::Result<()>>(1);

        let thread = std::thread::Builder::new()
            .name("evdev-registry-watch".into())
            .spawn(move || run_watch(filter, callback, stop_rx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(EvdevWatch {
                stop: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e.into())
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Io("registry watch thread exited".into()))
            }
        }
    }
}

struct EvdevWatch {
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RegistryWatch for EvdevWatch {
    fn cancel(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Registry watch thread panicked");
            }
        }
    }
}

impl Drop for EvdevWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn report_node(
    path: &Path,
    device: Option<&evdev::Device>,
    filter: &DeviceFilter,
    callback: &RegistryCallback,
) {
    let probed = match device {
        Some(device) => EvdevDevice::from_device(path, device),
        None => EvdevDevice::probe(path),
    };
    match probed {
        Ok(device) => {
            if filter.matches(&device.properties()) {
                debug!("{} matches {:?}", path.display(), filter);
                callback(RegistryNotification::Matched(device));
            }
        }
        Err(e) => debug!("Skipping {}: {}", path.display(), e),
    }
}

fn enumerate(filter: &DeviceFilter, callback: &RegistryCallback) {
    for (path, device) in evdev::enumerate() {
        report_node(&path, Some(&device), filter, callback);
    }
}

#[cfg(feature = "hotplug")]
fn run_watch(
    filter: DeviceFilter,
    callback: RegistryCallback,
    stop: tokio::sync::oneshot::Receiver<()>,
    ready: mpsc::SyncSender<io::Result<()>>,
) {
    use futures::StreamExt;
    use tokio_udev::{AsyncMonitorSocket, EventType, MonitorBuilder};

    let setup = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .and_then(|runtime| {
            let socket = runtime.block_on(async {
                let socket = MonitorBuilder::new()?.match_subsystem("input")?.listen()?;
                AsyncMonitorSocket::new(socket)
            })?;
            Ok((runtime, socket))
        });
    let (runtime, mut socket) = match setup {
        Ok(ok) => {
            let _ = ready.send(Ok(()));
            ok
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Subscribe before enumerating so a device plugged in between is not lost.
    enumerate(&filter, &callback);

    runtime.block_on(async move {
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                event = socket.next() => {
                    let event = match event {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            warn!("udev monitor error: {}", e);
                            continue;
                        }
                        None => {
                            info!("udev monitor closed");
                            break;
                        }
                    };
                    let action = match event.event_type() {
                        EventType::Add => NodeAction::Add,
                        EventType::Remove => NodeAction::Remove,
                        _ => NodeAction::Other,
                    };
                    let devnum = event.devnum().map(u64::from);
                    match node_change(action, event.devnode(), devnum) {
                        Some(NodeChange::Added(path)) => {
                            report_node(&path, None, &filter, &callback);
                        }
                        Some(NodeChange::Removed(id)) => {
                            callback(RegistryNotification::Terminated(id));
                        }
                        None => {}
                    }
                }
            }
        }
    });
}

#[cfg(not(feature = "hotplug"))]
fn run_watch(
    filter: DeviceFilter,
    callback: RegistryCallback,
    _stop: tokio::sync::oneshot::Receiver<()>,
    ready: mpsc::SyncSender<io::Result<()>>,
) {
    let _ = ready.send(Ok(()));
    enumerate(&filter, &callback);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_event_nodes_are_reported() {
        let event = Path::new("/dev/input/event7");
        assert_eq!(
            node_change(NodeAction::Add, Some(event), Some(0x0d47)),
            Some(NodeChange::Added(event.to_path_buf()))
        );

        for other in ["/dev/input/mouse0", "/dev/input/js0", "/dev/hidraw2"] {
            let other = Some(Path::new(other));
            assert_eq!(node_change(NodeAction::Add, other, Some(1)), None);
            assert_eq!(node_change(NodeAction::Remove, other, Some(1)), None);
        }
        assert_eq!(node_change(NodeAction::Add, None, Some(1)), None);
    }

    #[test]
    fn test_remove_maps_to_device_number() {
        let event = Path::new("/dev/input/event3");
        assert_eq!(
            node_change(NodeAction::Remove, Some(event), Some(0x0d43)),
            Some(NodeChange::Removed(RegistryEntryId(0x0d43)))
        );
        assert_eq!(node_change(NodeAction::Remove, Some(event), None), None);
        assert_eq!(node_change(NodeAction::Other, Some(event), Some(0x0d43)), None);
    }
}
