//! Byte-stream transport abstraction
//!
//! The session never talks to a serial port directly. It drives a
//! [`Transport`] and blocks on the transport's [`RxNotify`] while waiting for
//! response bytes, re-checking its own deadline after each wake-up.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

use super::ProtocolError;

/// Default capacity of an [`RxQueue`] in bytes
pub const DEFAULT_RX_CAPACITY: usize = 64 * 1024;

/// Byte-oriented communication channel to a meter
pub trait Transport: Send {
    /// Open the channel identified by `identifier` (e.g. "/dev/ttyUSB0" or "COM3")
    fn open(&mut self, identifier: &str) -> Result<(), ProtocolError>;

    /// Close the channel. Closing a closed channel is a no-op.
    fn close(&mut self) -> Result<(), ProtocolError>;

    /// Whether the channel is open
    fn is_open(&self) -> bool;

    /// Queue `bytes` for transmission
    fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns 0 when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError>;

    /// Drop any bytes received but not yet read
    fn discard_input(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Notification signalled every time new bytes become readable
    fn rx_notify(&self) -> RxNotify;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, identifier: &str) -> Result<(), ProtocolError> {
        (**self).open(identifier)
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        (**self).send(bytes)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError> {
        (**self).read(buf, timeout)
    }

    fn discard_input(&mut self) -> Result<(), ProtocolError> {
        (**self).discard_input()
    }

    fn rx_notify(&self) -> RxNotify {
        (**self).rx_notify()
    }
}

/// Byte-received notification.
///
/// A generation counter guarded by a mutex and paired with a condition
/// variable. Consumers sample [`generation`](Self::generation) before checking
/// for data, then wait for it to move on, so a notification between the check
/// and the wait is never lost.
#[derive(Debug, Clone, Default)]
pub struct RxNotify {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl RxNotify {
    /// Fresh notifier at generation zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that bytes arrived
    pub fn notify(&self) {
        let (lock, cvar) = &*self.inner;
        let mut generation = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        cvar.notify_all();
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the generation differs from `seen` or `timeout` elapses.
    ///
    /// Returns true if a notification arrived.
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
        *guard != seen
    }
}

/// Bounded receive queue shared between a producer (usually a reader thread)
/// and the transport's `read`.
///
/// When full, the oldest bytes are dropped.
#[derive(Debug, Clone)]
pub struct RxQueue {
    bytes: Arc<Mutex<VecDeque<u8>>>,
    notify: RxNotify,
    capacity: usize,
}

impl RxQueue {
    /// Empty queue holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(4096)))),
            notify: RxNotify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append received bytes and wake any waiting reader
    pub fn push(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        {
            let mut queue = self.lock();
            queue.extend(data);
            let overflow = queue.len().saturating_sub(self.capacity);
            if overflow > 0 {
                warn!(dropped = overflow, "receive queue full, dropping oldest bytes");
                queue.drain(..overflow);
            }
        }
        self.notify.notify();
    }

    /// Move up to `buf.len()` queued bytes into `buf`
    pub fn pop_into(&self, buf: &mut [u8]) -> usize {
        let mut queue = self.lock();
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        n
    }

    /// Like [`pop_into`](Self::pop_into), but waits up to `timeout` for data
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.notify.generation();
            let n = self.pop_into(buf);
            if n > 0 || buf.is_empty() {
                return n;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            self.notify.wait_for_change(seen, deadline - now);
        }
    }

    /// Bytes waiting
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// No bytes waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued byte
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Notification fired by [`push`](Self::push)
    pub fn notifier(&self) -> RxNotify {
        self.notify.clone()
    }
}

impl Default for RxQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RX_CAPACITY)
    }
}
