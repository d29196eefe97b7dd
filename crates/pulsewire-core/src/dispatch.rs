//! Callback-or-queue delivery primitive for one asynchronous message kind.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CloseStatus, Result, StreamError};

type Callback<T> = Box<dyn Fn(T) + Send>;

struct Inner<T> {
    callback: Option<Callback<T>>,
    queue: VecDeque<T>,
    closed: Option<CloseStatus>,
}

/// Delivers values of one message kind either synchronously through a
/// registered callback or through an internal FIFO drained by `poll`.
///
/// A value handed to a callback leaves the dispatcher's responsibility;
/// values queued for pollers are only drained naturally or discarded on
/// `reset`. Callbacks are invoked on the I/O thread that produced the value
/// and must be safe to call from there. They run with the dispatcher's
/// internal lock held, which is what keeps delivery order equal to arrival
/// order; a callback must therefore never call back into the dispatcher it
/// is registered on (`poll`, `set_callback`, or `handle`).
pub struct Dispatcher<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dispatcher<T> {
    /// Creates an empty dispatcher with no callback registered.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                callback: None,
                queue: VecDeque::new(),
                closed: None,
            }),
            available: Condvar::new(),
        }
    }

    /// Delivers one value: invokes the registered callback if present,
    /// otherwise queues the value and wakes one poller.
    pub fn handle(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(callback) = &inner.callback {
            callback(value);
        } else {
            inner.queue.push_back(value);
            self.available.notify_one();
        }
    }

    /// Swaps in a callback, flushing any queued backlog through it in
    /// original order before returning.
    ///
    /// The callback runs under the dispatcher's lock and must not re-enter
    /// this dispatcher.
    pub fn set_callback(&self, callback: impl Fn(T) + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        for value in inner.queue.drain(..).collect::<Vec<_>>() {
            callback(value);
        }
        inner.callback = Some(Box::new(callback));
    }

    /// Blocks until a value is available, the dispatcher closes, or the
    /// timeout elapses. `None` waits indefinitely.
    ///
    /// Values queued before the close are still drained; only an empty,
    /// closed dispatcher reports the close status.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(value) = inner.queue.pop_front() {
                return Ok(value);
            }
            if let Some(status) = &inner.closed {
                return Err(match status {
                    Ok(()) => StreamError::AlreadyClosed,
                    Err(e) => e.clone(),
                });
            }
            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StreamError::Timeout {
                            timeout_ms: timeout.unwrap_or_default().as_millis() as u64,
                        });
                    }
                    let (guard, _) = self
                        .available
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    guard
                }
                None => self.available.wait(inner).unwrap(),
            };
        }
    }

    /// Records the terminal status and wakes every blocked poller. The first
    /// status recorded wins; later calls only re-notify.
    pub fn close(&self, status: CloseStatus) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed.is_none() {
            inner.closed = Some(status);
        }
        self.available.notify_all();
    }

    /// Discards queued values and clears the closed flag so the dispatcher
    /// can serve another session. The registered callback is kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.closed = None;
    }
}
