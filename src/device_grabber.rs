//! Exclusive-access state machine for one device
//!
//! ```text
//!  idle ──grab()──► retrying ──opened(seize)──► grabbed ──ungrab()──► idle
//!   │                  │  ▲                                            │
//!   │                  └──┘ tick: evaluate device_grabbing, open(seize) │
//!   └─observe()─► observing ──opened(shared)──► observed ◄──────────────┘
//!                                                  (if observation requested)
//! ```
//!
//! The retry timer fires immediately and then every retry interval. Each
//! tick runs on the grabber's own queue, as do the handlers for the device's
//! open/close signals, so the grabber never races itself.
//!
//! Observation keeps a non-exclusive open so the grabber sees which keys and
//! buttons are held; a grab is refused while any of them would be stuck by
//! seizing the device. The grabber only reacts to opens it issued itself.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::GrabberConfig;
use crate::device_handle::{DeviceHandle, DeviceRef};
use crate::device_properties::DeviceProperties;
use crate::dispatcher::{Dispatcher, Timer, TimerControl};
use crate::error::DeviceError;
use crate::log_reducer::LogReducer;
use crate::predicate::PredicateChain;
use crate::signal::{Connection, Signal};
use crate::types::{DeviceId, GrabbableState, OpenMode};

#[derive(Default)]
struct GrabberState {
    grabbed: bool,
    observed: bool,
    grab_timer: Option<Timer>,
    observe_timer: Option<Timer>,
    /// Set by `observe()`, cleared by `unobserve()`; ungrab falls back to it
    observe_requested: bool,
    /// Mode of the open this grabber issued; cleared only once the open has
    /// settled on the handle's queue
    open_in_flight: Option<OpenMode>,
    /// An ungrab close is in flight; its outcome emits `device_ungrabbed`
    closing: bool,
    /// A previous close failed, so the handle is still nominally open
    close_pending: bool,
    log_reducer: LogReducer,
    connections: Vec<Connection>,
}

fn is_running(timer: &Option<Timer>) -> bool {
    timer.as_ref().is_some_and(|t| t.is_active())
}

fn cancel(timer: &mut Option<Timer>) {
    if let Some(timer) = timer.take() {
        timer.cancel();
    }
}

/// Held input that seizing the device would leave stuck downstream
fn held_input(handle: &DeviceHandle) -> Option<&'static str> {
    if handle.is_key_repeating() {
        Some("a key is repeating")
    } else if !handle.pressed_modifier_flags().is_empty() {
        Some("modifier keys are held")
    } else if handle.has_pressed_pointing_buttons() {
        Some("pointing buttons are held")
    } else {
        None
    }
}

pub struct DeviceGrabber {
    weak_self: Weak<DeviceGrabber>,
    device: DeviceRef,
    retry_interval: Duration,
    observe_interval: Duration,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<GrabberState>,

    device_grabbing: PredicateChain<DeviceProperties, GrabbableState>,
    device_grabbed: Signal<DeviceId>,
    device_ungrabbed: Signal<DeviceId>,
    device_observed: Signal<DeviceId>,
}

impl DeviceGrabber {
    pub fn new(device: DeviceRef, config: &GrabberConfig) -> Result<Arc<Self>, DeviceError> {
        let dispatcher = Arc::new(Dispatcher::new(format!(
            "device-grabber-{}",
            device.device_id()
        ))?);

        let grabber = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            device,
            retry_interval: config.retry_interval(),
            observe_interval: config.observe_interval(),
            dispatcher,
            state: Mutex::new(GrabberState::default()),
            device_grabbing: PredicateChain::new(GrabbableState::Grabbable),
            device_grabbed: Signal::new(),
            device_ungrabbed: Signal::new(),
            device_observed: Signal::new(),
        });
        grabber.connect_device_signals();
        Ok(grabber)
    }

    fn connect_device_signals(&self) {
        let Some(handle) = self.device.upgrade() else {
            return;
        };

        let connections = vec![
            handle
                .opened()
                .connect(self.slot(|g, mode: &OpenMode| g.on_opened(*mode))),
            handle
                .open_failed()
                .connect(self.slot(|g, e: &DeviceError| g.on_open_failed(e))),
            handle.closed().connect(self.slot(|g, _: &()| g.on_closed())),
            handle
                .close_failed()
                .connect(self.slot(|g, e: &DeviceError| g.on_close_failed(e))),
        ];
        self.state.lock().connections = connections;
    }

    /// Build a device-signal slot that re-dispatches onto this grabber's queue
    fn slot<T, F>(&self, handler: F) -> impl Fn(&T) + Send + Sync + 'static
    where
        T: Clone + Send + 'static,
        F: Fn(&DeviceGrabber, &T) + Send + Sync + Copy + 'static,
    {
        let weak = self.weak_self.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        move |value: &T| {
            let weak = weak.clone();
            let value = value.clone();
            dispatcher.enqueue(move || {
                if let Some(grabber) = weak.upgrade() {
                    handler(&grabber, &value);
                }
            });
        }
    }

    fn enqueue<F>(&self, f: F)
    where
        F: FnOnce(&DeviceGrabber) + Send + 'static,
    {
        let weak = self.weak_self.clone();
        self.dispatcher.enqueue(move || {
            if let Some(grabber) = weak.upgrade() {
                f(&grabber);
            }
        });
    }

    // ---- accessors ----

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Voters deciding whether the device may be seized right now
    pub fn device_grabbing(&self) -> &PredicateChain<DeviceProperties, GrabbableState> {
        &self.device_grabbing
    }

    pub fn device_grabbed(&self) -> &Signal<DeviceId> {
        &self.device_grabbed
    }

    /// Fired after a clean close and also after a failed one
    pub fn device_ungrabbed(&self) -> &Signal<DeviceId> {
        &self.device_ungrabbed
    }

    /// Fired when a shared open for observation succeeds
    pub fn device_observed(&self) -> &Signal<DeviceId> {
        &self.device_observed
    }

    pub fn is_grabbed(&self) -> bool {
        self.state.lock().grabbed
    }

    pub fn is_observed(&self) -> bool {
        self.state.lock().observed
    }

    pub fn is_retrying(&self) -> bool {
        is_running(&self.state.lock().grab_timer)
    }

    /// Wait until every operation enqueued so far has run
    pub fn flush(&self) -> bool {
        self.dispatcher.run_sync(|| {})
    }

    // ---- operations ----

    /// Start retrying until the device is seized; idempotent
    pub fn grab(&self) {
        self.enqueue(|g| g.start_grab());
    }

    /// Release the device; observation resumes if it was requested
    pub fn ungrab(&self) {
        self.enqueue(|g| g.stop_grab());
    }

    /// Keep a shared open so held keys and buttons are tracked; idempotent
    pub fn observe(&self) {
        self.enqueue(|g| g.start_observe());
    }

    pub fn unobserve(&self) {
        self.enqueue(|g| g.stop_observe());
    }

    fn start_grab(&self) {
        let mut state = self.state.lock();
        if state.grabbed || is_running(&state.grab_timer) {
            return;
        }
        state.log_reducer.reset();

        let weak = self.weak_self.clone();
        state.grab_timer = Some(self.dispatcher.start_timer(self.retry_interval, move || {
            match weak.upgrade() {
                Some(grabber) => grabber.tick(),
                None => TimerControl::Stop,
            }
        }));
        debug!("Grabbing {}", self.device.properties().name_for_log());
    }

    /// Grabbability of the device: the voters first, then held input
    fn grabbable_state(&self, handle: &DeviceHandle) -> (GrabbableState, Option<&'static str>) {
        match self.device_grabbing.evaluate(handle.properties()) {
            GrabbableState::Grabbable => match held_input(handle) {
                Some(reason) => (GrabbableState::UngrabbableTemporarily, Some(reason)),
                None => (GrabbableState::Grabbable, None),
            },
            state => (state, None),
        }
    }

    fn tick(&self) -> TimerControl {
        if self.state.lock().grabbed {
            return TimerControl::Stop;
        }
        let Some(handle) = self.device.upgrade() else {
            debug!(
                "{} is gone, giving up grab",
                self.device.properties().name_for_log()
            );
            return TimerControl::Stop;
        };

        let name = handle.name_for_log();
        match self.grabbable_state(&handle) {
            (GrabbableState::Grabbable, _) => {}
            (GrabbableState::UngrabbablePermanently, _) => {
                self.state
                    .lock()
                    .log_reducer
                    .warn(format!("{} is ungrabbable permanently", name));
                return TimerControl::Stop;
            }
            (_, Some(reason)) => {
                self.state
                    .lock()
                    .log_reducer
                    .warn(format!("{} cannot be grabbed while {}", name, reason));
                return TimerControl::Continue;
            }
            (state, None) => {
                self.state
                    .lock()
                    .log_reducer
                    .warn(format!("{} is not grabbable yet ({:?})", name, state));
                return TimerControl::Continue;
            }
        }

        let mut state = self.state.lock();
        if state.open_in_flight.is_some() {
            return TimerControl::Continue;
        }
        if handle.open_mode() == Some(OpenMode::Seize) && !state.close_pending {
            // Seized already, e.g. by the handle's owner.
            self.become_grabbed(state, &handle);
            return TimerControl::Stop;
        }

        let was_observed = std::mem::take(&mut state.observed);
        cancel(&mut state.observe_timer);
        let close_first = std::mem::take(&mut state.close_pending) || handle.is_opened();
        drop(state);

        if was_observed {
            handle.async_unschedule();
            handle.async_stop_value_queue();
        }
        if close_first {
            // A non-exclusive open has to be dropped before the device can
            // be seized.
            handle.async_close();
        }
        self.open_device(&handle, OpenMode::Seize);
        TimerControl::Continue
    }

    /// Issue an open and learn when it has settled on the handle's queue
    ///
    /// The handle ignores an open while already opened, so `opened` may
    /// never come; the settle job clears the in-flight mark either way.
    fn open_device(&self, handle: &DeviceHandle, mode: OpenMode) {
        self.state.lock().open_in_flight = Some(mode);
        handle.async_open(mode);

        let weak = self.weak_self.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        handle.enqueue(move |_| {
            dispatcher.enqueue(move || {
                if let Some(grabber) = weak.upgrade() {
                    grabber.state.lock().open_in_flight = None;
                }
            });
        });
    }

    fn become_grabbed(&self, mut state: MutexGuard<'_, GrabberState>, handle: &DeviceHandle) {
        state.grabbed = true;
        cancel(&mut state.grab_timer);
        drop(state);

        handle.async_start_value_queue();
        handle.async_schedule();
        info!("{} is grabbed", handle.name_for_log());
        self.device_grabbed.emit(&self.device.device_id());
    }

    fn become_observed(&self, mut state: MutexGuard<'_, GrabberState>, handle: &DeviceHandle) {
        state.observed = true;
        cancel(&mut state.observe_timer);
        drop(state);

        handle.async_start_value_queue();
        handle.async_schedule();
        info!("{} is observed", handle.name_for_log());
        self.device_observed.emit(&self.device.device_id());
    }

    fn stop_grab(&self) {
        let mut state = self.state.lock();
        cancel(&mut state.grab_timer);
        if !state.grabbed {
            let resume = state.observe_requested;
            drop(state);
            if resume {
                self.start_observe();
            }
            return;
        }
        state.grabbed = false;

        match self.device.upgrade() {
            Some(handle) => {
                state.closing = true;
                drop(state);
                handle.async_unschedule();
                handle.async_stop_value_queue();
                handle.async_close();
            }
            None => {
                // Nothing left to close; the device is gone.
                drop(state);
                info!(
                    "{} is ungrabbed (device gone)",
                    self.device.properties().name_for_log()
                );
                self.device_ungrabbed.emit(&self.device.device_id());
            }
        }
    }

    fn start_observe(&self) {
        let mut state = self.state.lock();
        state.observe_requested = true;
        if state.grabbed || state.observed || state.closing || is_running(&state.observe_timer) {
            return;
        }

        let weak = self.weak_self.clone();
        state.observe_timer = Some(self.dispatcher.start_timer(self.observe_interval, move || {
            match weak.upgrade() {
                Some(grabber) => grabber.observe_tick(),
                None => TimerControl::Stop,
            }
        }));
        debug!("Observing {}", self.device.properties().name_for_log());
    }

    fn observe_tick(&self) -> TimerControl {
        let mut state = self.state.lock();
        if state.grabbed || state.observed {
            return TimerControl::Stop;
        }
        let Some(handle) = self.device.upgrade() else {
            debug!(
                "{} is gone, giving up observation",
                self.device.properties().name_for_log()
            );
            return TimerControl::Stop;
        };
        if state.open_in_flight.is_some() {
            return TimerControl::Continue;
        }

        match handle.open_mode() {
            Some(OpenMode::Shared) if !state.close_pending => {
                self.become_observed(state, &handle);
                TimerControl::Stop
            }
            Some(OpenMode::Seize) if !state.close_pending => {
                state
                    .log_reducer
                    .warn(format!("{} is seized by another owner", handle.name_for_log()));
                TimerControl::Continue
            }
            _ => {
                let close_first = std::mem::take(&mut state.close_pending);
                drop(state);
                if close_first {
                    handle.async_close();
                }
                self.open_device(&handle, OpenMode::Shared);
                TimerControl::Continue
            }
        }
    }

    fn stop_observe(&self) {
        let mut state = self.state.lock();
        state.observe_requested = false;
        cancel(&mut state.observe_timer);
        if !std::mem::take(&mut state.observed) {
            return;
        }
        drop(state);

        if let Some(handle) = self.device.upgrade() {
            handle.async_unschedule();
            handle.async_stop_value_queue();
            handle.async_close();
            info!("{} is unobserved", handle.name_for_log());
        }
    }

    /// Called once an ungrab close has settled
    fn finish_ungrab(&self, how: &str) {
        let name = self.device.properties().name_for_log();
        info!("{} is ungrabbed{}", name, how);
        self.device_ungrabbed.emit(&self.device.device_id());
        if self.state.lock().observe_requested {
            self.start_observe();
        }
    }

    // ---- device signal handlers (grabber queue) ----

    fn on_opened(&self, mode: OpenMode) {
        let mut state = self.state.lock();
        if state.open_in_flight != Some(mode) {
            // Opened by the handle's owner; not ours to keep or close.
            return;
        }
        let Some(handle) = self.device.upgrade() else {
            return;
        };

        match mode {
            OpenMode::Seize if !state.grabbed && is_running(&state.grab_timer) => {
                self.become_grabbed(state, &handle);
            }
            OpenMode::Shared
                if !state.grabbed && !state.observed && is_running(&state.observe_timer) =>
            {
                self.become_observed(state, &handle);
            }
            _ => {
                // Completed after ungrab()/unobserve(); do not keep it.
                drop(state);
                debug!("Closing stray open of {}", handle.name_for_log());
                handle.async_close();
            }
        }
    }

    fn on_open_failed(&self, error: &DeviceError) {
        let name = self.device.properties().name_for_log();
        let mut state = self.state.lock();
        let message = match state.open_in_flight {
            Some(OpenMode::Seize) => format!("Failed to seize {}: {}", name, error),
            Some(OpenMode::Shared) => format!("Failed to observe {}: {}", name, error),
            None => return,
        };
        state.log_reducer.error(message);
    }

    fn on_closed(&self) {
        let closing = std::mem::take(&mut self.state.lock().closing);
        if closing {
            self.finish_ungrab("");
        }
    }

    fn on_close_failed(&self, error: &DeviceError) {
        let name = self.device.properties().name_for_log();
        let closing = {
            let mut state = self.state.lock();
            state.close_pending = true;
            state
                .log_reducer
                .error(format!("Failed to release {}: {}", name, error));
            std::mem::take(&mut state.closing)
        };
        if closing {
            self.finish_ungrab(" (close failed)");
        }
    }
}

impl Drop for DeviceGrabber {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        cancel(&mut state.grab_timer);
        cancel(&mut state.observe_timer);
        let holds_device = std::mem::take(&mut state.grabbed) | std::mem::take(&mut state.observed);
        let connections = std::mem::take(&mut state.connections);

        match self.device.upgrade_for_teardown() {
            Some(handle) => {
                if holds_device {
                    handle.async_unschedule();
                    handle.async_stop_value_queue();
                    handle.async_close();
                }
                // Disconnect on the device's queue so no delivery is mid-flight.
                handle.run_sync(move || {
                    for connection in &connections {
                        connection.disconnect();
                    }
                });
            }
            None => {
                for connection in &connections {
                    connection.disconnect();
                }
            }
        }

        self.dispatcher.terminate();
    }
}
