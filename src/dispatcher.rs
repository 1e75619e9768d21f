//! Serial task queues
//!
//! Every component (monitor, handle, grabber) owns one `Dispatcher`: a named
//! worker thread driving a current-thread tokio runtime. Jobs enqueued from
//! any thread run one at a time in submission order. Repeating timers are
//! tokio interval tasks on the same runtime that enqueue their tick as an
//! ordinary job, so ticks never race the component's other work.
//!
//! ```text
//!  enqueue(job) ──► [mpsc] ──► worker loop ──► job()
//!                     ▲
//!  Timer ─ interval ──┘ (tick enqueued as a job)
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shortest period a timer runs at; tokio rejects a zero interval
const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(1);

enum Message {
    Job(Job),
    Terminate,
}

/// Outcome of one timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerControl {
    Continue,
    Stop,
}

/// A serial queue backed by one worker thread
pub struct Dispatcher {
    name: String,
    tx: mpsc::UnboundedSender<Message>,
    runtime: Handle,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the worker thread
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let worker_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(run_worker_loop(rx, &worker_name));
                debug!("{}: worker stopped", worker_name);
            })?;

        Ok(Self {
            name,
            tx,
            runtime: handle,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from this queue's worker thread
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Append a job; it runs after every previously enqueued job
    ///
    /// Jobs enqueued after `terminate()` are dropped without running.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.tx.send(Message::Job(Box::new(job)));
    }

    /// Run `job` on this queue and wait for it to finish
    ///
    /// Runs inline when already on the queue. Returns `false` if the queue
    /// has terminated and the job was dropped unrun.
    pub fn run_sync<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            job();
            return true;
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.enqueue(move || {
            job();
            let _ = tx.send(());
        });
        rx.recv().is_ok()
    }

    /// Start a repeating timer whose first tick fires immediately
    ///
    /// `tick` runs on this queue. Returning [`TimerControl::Stop`] ends the
    /// timer; so does cancelling or dropping the returned [`Timer`]. An
    /// interval below one millisecond is raised to one millisecond.
    pub fn start_timer<F>(&self, interval: Duration, tick: F) -> Timer
    where
        F: FnMut() -> TimerControl + Send + 'static,
    {
        let interval = interval.max(MIN_TIMER_INTERVAL);
        let active = Arc::new(AtomicBool::new(true));
        let tick = Arc::new(Mutex::new(tick));
        let tx = self.tx.clone();
        let task_active = Arc::clone(&active);

        let task = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !task_active.load(Ordering::Acquire) {
                    break;
                }
                let job_active = Arc::clone(&task_active);
                let job_tick = Arc::clone(&tick);
                let job: Job = Box::new(move || {
                    if !job_active.load(Ordering::Acquire) {
                        return;
                    }
                    let mut tick = job_tick.lock();
                    if (*tick)() == TimerControl::Stop {
                        job_active.store(false, Ordering::Release);
                    }
                });
                if tx.send(Message::Job(job)).is_err() {
                    break;
                }
            }
        });

        Timer { active, task }
    }

    /// Run every job already enqueued, then stop and join the worker
    ///
    /// Safe to call more than once. When called from the worker itself (the
    /// last owner dropped inside one of its own jobs) the worker is told to
    /// stop but cannot be joined.
    pub fn terminate(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let _ = self.tx.send(Message::Terminate);

        if self.is_current() {
            debug!("{}: terminated from its own worker, detaching", self.name);
            return;
        }
        if thread.join().is_err() {
            error!("{}: worker thread panicked", self.name);
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn run_worker_loop(mut rx: mpsc::UnboundedReceiver<Message>, name: &str) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Job(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("{}: job panicked", name);
                }
            }
            Message::Terminate => break,
        }
    }
}

/// Handle to a repeating timer created by [`Dispatcher::start_timer`]
pub struct Timer {
    active: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl Timer {
    /// Stop the timer; a tick already queued becomes a no-op
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let dispatcher = Dispatcher::new("test-order").unwrap();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            dispatcher.enqueue(move || tx.send(i).unwrap());
        }
        dispatcher.terminate();
        let seen: Vec<i32> = rx.try_iter().collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_terminate_drains_pending_jobs() {
        let dispatcher = Dispatcher::new("test-drain").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            dispatcher.enqueue(move || {
                std::thread::sleep(Duration::from_millis(1));
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(dispatcher);
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panicking_job_does_not_kill_queue() {
        let dispatcher = Dispatcher::new("test-panic").unwrap();
        let (tx, rx) = std_mpsc::channel();
        dispatcher.enqueue(|| panic!("boom"));
        dispatcher.enqueue(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_timer_first_tick_is_immediate_and_stop_ends_it() {
        let dispatcher = Dispatcher::new("test-timer").unwrap();
        let (tx, rx) = std_mpsc::channel();
        let mut ticks = 0;
        let timer = dispatcher.start_timer(Duration::from_millis(10), move || {
            ticks += 1;
            tx.send(ticks).unwrap();
            if ticks == 3 {
                TimerControl::Stop
            } else {
                TimerControl::Continue
            }
        });

        // An hour-long interval would still deliver the first tick at once.
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!timer.is_active());
    }

    #[test]
    fn test_zero_interval_timer_still_ticks() {
        let dispatcher = Dispatcher::new("test-zero").unwrap();
        let (tx, rx) = std_mpsc::channel();
        let mut ticks = 0;
        let timer = dispatcher.start_timer(Duration::ZERO, move || {
            ticks += 1;
            let _ = tx.send(ticks);
            if ticks == 2 {
                TimerControl::Stop
            } else {
                TimerControl::Continue
            }
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert!(dispatcher.run_sync(|| {}));
        assert!(!timer.is_active());
    }

    #[test]
    fn test_cancelled_timer_stops_ticking() {
        let dispatcher = Dispatcher::new("test-cancel").unwrap();
        let (tx, rx) = std_mpsc::channel();
        let timer = dispatcher.start_timer(Duration::from_secs(3600), move || {
            tx.send(()).unwrap();
            TimerControl::Continue
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        timer.cancel();
        assert!(!timer.is_active());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_run_sync() {
        let dispatcher = Dispatcher::new("test-run-sync").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        assert!(dispatcher.run_sync(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        dispatcher.terminate();
        assert!(!dispatcher.run_sync(|| {}));
    }

    #[test]
    fn test_is_current() {
        let dispatcher = Arc::new(Dispatcher::new("test-current").unwrap());
        assert!(!dispatcher.is_current());
        let (tx, rx) = std_mpsc::channel();
        let inner = Arc::clone(&dispatcher);
        dispatcher.enqueue(move || tx.send(inner.is_current()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
