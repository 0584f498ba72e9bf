//! Single-threaded event multiplexer.
//!
//! Sources are `(handle, interest, timeout, callback)` tuples. Each call to
//! [`EventLoop::run_iteration`] waits until at least one source is ready or
//! its timeout has elapsed, then invokes every ready callback once, in
//! registration order. Readiness is polled through the [`Readiness`]
//! implementation of the loop's state, so the loop itself knows nothing
//! about devices.
//!
//! Callbacks receive the loop and may register or unregister sources while
//! being dispatched. Removals take effect immediately for the rest of the
//! pass; additions are first considered in the next iteration.

use bitflags::bitflags;
use std::fmt;
use std::time::{Duration, Instant};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        const ERROR = 0b100;
    }
}

/// Identity of a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceHandle {
    /// A pollable transport.
    Io(u64),
    /// A pure timer with no underlying channel; never polled for readiness.
    Timer(u64),
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceHandle::Io(id) => write!(f, "io#{id}"),
            SourceHandle::Timer(id) => write!(f, "timer#{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub handle: SourceHandle,
    /// What fired; empty when only the source's timeout elapsed.
    pub revents: Interest,
}

impl Event {
    pub fn is_timeout(&self) -> bool {
        self.revents.is_empty()
    }
}

/// Returned by a callback to keep or drop its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Remove,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("Source {0} is already registered")]
    DuplicateSource(SourceHandle),

    #[error("Readiness poll failed: {0}")]
    Poll(String),
}

/// Answers which of `interest` is currently ready for `handle`.
pub trait Readiness {
    fn readiness(&mut self, handle: SourceHandle, interest: Interest)
        -> Result<Interest, LoopError>;
}

pub type Callback<S> = Box<dyn FnMut(&mut S, &mut EventLoop<S>, Event) -> Flow>;

struct Source<S> {
    handle: SourceHandle,
    interest: Interest,
    timeout: Option<Duration>,
    due: Option<Instant>,
    callback: Option<Callback<S>>,
    removed: bool,
}

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2);

pub struct EventLoop<S> {
    sources: Vec<Source<S>>,
    poll_interval: Duration,
    dispatching: bool,
}

impl<S> fmt::Debug for EventLoop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handles: Vec<SourceHandle> = self
            .sources
            .iter()
            .filter(|s| !s.removed)
            .map(|s| s.handle)
            .collect();
        f.debug_struct("EventLoop")
            .field("sources", &handles)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl<S> Default for EventLoop<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> EventLoop<S> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            dispatching: false,
        }
    }

    /// Granularity at which readiness is re-polled while waiting.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_micros(100));
        self
    }

    /// Adds a source. With `timeout` set, the callback also fires (with an
    /// empty `revents`) whenever the source stayed quiet that long.
    pub fn register<F>(
        &mut self,
        handle: SourceHandle,
        interest: Interest,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<(), LoopError>
    where
        F: FnMut(&mut S, &mut EventLoop<S>, Event) -> Flow + 'static,
    {
        if self.is_registered(handle) {
            return Err(LoopError::DuplicateSource(handle));
        }
        log::trace!("Registering source {handle} ({interest:?}, timeout {timeout:?}).");
        self.sources.push(Source {
            handle,
            interest,
            timeout,
            due: timeout.map(|t| Instant::now() + t),
            callback: Some(Box::new(callback)),
            removed: false,
        });
        Ok(())
    }

    /// Removes a source; returns whether it was registered.
    pub fn unregister(&mut self, handle: SourceHandle) -> bool {
        let Some(index) = self
            .sources
            .iter()
            .position(|s| !s.removed && s.handle == handle)
        else {
            return false;
        };
        log::trace!("Unregistering source {handle}.");
        if self.dispatching {
            self.sources[index].removed = true;
            self.sources[index].callback = None;
        } else {
            self.sources.remove(index);
        }
        true
    }

    pub fn is_registered(&self, handle: SourceHandle) -> bool {
        self.sources.iter().any(|s| !s.removed && s.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.sources.iter().filter(|s| !s.removed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<SourceHandle> {
        self.sources
            .iter()
            .filter(|s| !s.removed)
            .map(|s| s.handle)
            .collect()
    }
}

impl<S: Readiness> EventLoop<S> {
    /// Waits up to `max_wait` for ready sources and dispatches them.
    /// Returns the number of callbacks invoked; with nothing registered it
    /// returns `Ok(0)` right away.
    pub fn run_iteration(&mut self, state: &mut S, max_wait: Duration) -> Result<usize, LoopError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("run_iteration");

        if self.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + max_wait;
        let ready = loop {
            let now = Instant::now();
            let ready = self.poll(state, now)?;
            if !ready.is_empty() || now >= deadline {
                break ready;
            }
            let mut wait = self.poll_interval.min(deadline - now);
            if let Some(next_due) = self.sources.iter().filter_map(|s| s.due).min() {
                wait = wait.min(next_due.saturating_duration_since(now));
            }
            std::thread::sleep(wait);
        };

        Ok(self.dispatch(state, ready))
    }

    fn poll(&self, state: &mut S, now: Instant) -> Result<Vec<(usize, Interest)>, LoopError> {
        let mut ready = Vec::new();
        for (index, source) in self.sources.iter().enumerate() {
            if source.removed {
                continue;
            }
            let revents = match source.handle {
                SourceHandle::Timer(_) => Interest::empty(),
                SourceHandle::Io(_) => {
                    state.readiness(source.handle, source.interest)?
                        & (source.interest | Interest::ERROR)
                }
            };
            let timed_out = source.due.is_some_and(|due| now >= due);
            if !revents.is_empty() || timed_out {
                ready.push((index, revents));
            }
        }
        Ok(ready)
    }

    fn dispatch(&mut self, state: &mut S, ready: Vec<(usize, Interest)>) -> usize {
        self.dispatching = true;
        let mut dispatched = 0;

        for (index, revents) in ready {
            let Some(source) = self.sources.get_mut(index) else {
                continue;
            };
            if source.removed {
                continue;
            }
            let Some(mut callback) = source.callback.take() else {
                continue;
            };
            let event = Event {
                handle: source.handle,
                revents,
            };

            let flow = {
                let _span = tracing::trace_span!("dispatch", handle = %event.handle).entered();
                callback(state, self, event)
            };
            dispatched += 1;

            if let Some(source) = self.sources.get_mut(index) {
                if flow == Flow::Remove || source.removed {
                    source.removed = true;
                } else {
                    source.callback = Some(callback);
                    source.due = source.timeout.map(|t| Instant::now() + t);
                }
            }
        }

        self.dispatching = false;
        self.sources.retain(|s| !s.removed);
        dispatched
    }
}
