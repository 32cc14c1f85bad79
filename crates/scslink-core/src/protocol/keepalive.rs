//! Session keep-alive
//!
//! After a successful login the meter drops the session if the link stays
//! quiet too long. A background thread sends an Enquire whenever the link has
//! been idle for a full interval.
//!
//! Application exchanges and keep-alives are serialized by the transport
//! mutex: every session operation holds it for its whole duration, and the
//! keep-alive thread only ever `try_lock`s it. On top of that, an operation
//! pauses the timer for its duration and restarts the idle interval when it
//! finishes (see [`Activity::pause`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn, Span};

use super::link::Link;
use super::stats::LinkStats;
use super::stream::{RxNotify, Transport};
use super::ProtocolError;

/// Floor for the timer's sleep so a briefly held lock cannot make it spin
const MIN_TICK: Duration = Duration::from_millis(10);

/// Tracks when the link was last used and whether an operation is running
#[derive(Debug)]
pub(crate) struct Activity {
    paused: AtomicBool,
    last: Mutex<Instant>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            last: Mutex::new(Instant::now()),
        }
    }

    /// Pause the keep-alive until the returned guard drops
    pub(crate) fn pause(&self) -> PauseGuard<'_> {
        self.paused.store(true, Ordering::Release);
        PauseGuard(self)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Resumes the keep-alive, restarting its interval, when dropped
pub(crate) struct PauseGuard<'a>(&'a Activity);

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.0.touch();
        self.0.paused.store(false, Ordering::Release);
    }
}

/// Keep-alive timing
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeepAliveParams {
    pub interval: Duration,
    pub attempts: u32,
    pub poll: Duration,
}

#[derive(Debug, Default)]
struct Control {
    stop: Mutex<bool>,
    wake: Condvar,
    running: AtomicBool,
}

impl Control {
    /// Sleep for `timeout` unless stopped first. Returns true when stopped.
    fn wait_stop(&self, timeout: Duration) -> bool {
        let guard = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Handle to a running keep-alive thread. Dropping it stops the thread.
pub(crate) struct KeepAlive {
    control: Arc<Control>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub(crate) fn start<T: Transport + 'static>(
        transport: Arc<Mutex<T>>,
        rx: RxNotify,
        stats: Arc<LinkStats>,
        activity: Arc<Activity>,
        params: KeepAliveParams,
        span: Span,
    ) -> Result<Self, ProtocolError> {
        let control = Arc::new(Control::default());
        control.running.store(true, Ordering::Release);

        let thread_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name("scs-keepalive".to_string())
            .spawn(move || {
                span.in_scope(|| {
                    run(&transport, &rx, &stats, &activity, params, &thread_control);
                });
                thread_control.running.store(false, Ordering::Release);
            })?;

        info!(interval_ms = params.interval.as_millis() as u64, "keep-alive started");
        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    /// False once the thread has given up or been stopped
    pub(crate) fn is_running(&self) -> bool {
        self.control.running.load(Ordering::Acquire)
    }

    fn shutdown(&mut self) {
        {
            let mut stopped = self
                .control
                .stop
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *stopped = true;
        }
        self.control.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("keep-alive thread panicked");
            }
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T: Transport>(
    transport: &Mutex<T>,
    rx: &RxNotify,
    stats: &LinkStats,
    activity: &Activity,
    params: KeepAliveParams,
    control: &Control,
) {
    loop {
        let wait = if activity.is_paused() {
            params.interval
        } else {
            params.interval.saturating_sub(activity.idle_for())
        }
        .max(MIN_TICK);
        if control.wait_stop(wait) {
            debug!("keep-alive stopped");
            return;
        }

        let mut guard = match transport.try_lock() {
            Ok(guard) => guard,
            // An operation owns the link; it restarts the interval when done
            Err(TryLockError::WouldBlock) => continue,
            Err(TryLockError::Poisoned(_)) => {
                warn!("transport lock poisoned, keep-alive disabled");
                return;
            }
        };
        if activity.is_paused() || activity.idle_for() < params.interval {
            continue;
        }
        if !guard.is_open() {
            info!("transport closed, keep-alive disabled");
            return;
        }

        let result = Link::new(&mut *guard, rx, stats).enquire(params.attempts, params.poll);
        drop(guard);

        match result {
            Ok(code) if code.is_ack() => {
                stats.record_keep_alive(true);
                activity.touch();
                debug!("keep-alive acknowledged");
            }
            Ok(code) => {
                stats.record_keep_alive(false);
                warn!(
                    "keep-alive got {} after {} attempt(s), disabling until next login",
                    code, params.attempts
                );
                return;
            }
            Err(e) => {
                stats.record_keep_alive(false);
                warn!("keep-alive failed: {}, disabling until next login", e);
                return;
            }
        }
    }
}
