//! Single-threaded event dispatcher
//!
//! Waits on the control and notification channels with one `poll(2)`, turns
//! what arrives into resolved events and hands them to a consumer callback.
//! Control messages always win: once a shutdown signal is seen, notifications
//! that became ready in the same wait are never processed.

use std::path::Path;
use std::time::Duration;

use kwatch_core::{NotificationEvent, Result, WatchError};
use tracing::{debug, info, trace, warn};

use crate::channel::{ControlChannel, NotificationChannel, DEFAULT_READ_BUFFER, MIN_READ_BUFFER};
use crate::registry::WatchRegistry;
use crate::signals::is_shutdown_signal;
use crate::sys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Waiting for readiness or processing notifications
    Running,
    /// Control message read but not yet acted on
    Draining,
    /// Shutdown requested, releasing watches and handles
    Terminating,
    Stopped,
}

/// Counters kept over the dispatcher's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub reads: u64,
    pub events_delivered: u64,
    pub unresolved_dropped: u64,
    pub overflows: u64,
    pub signal_events: u64,
    pub unexpected_signals: u64,
    pub watches_retired: u64,
    pub released: u64,
}

pub struct Dispatcher<N: NotificationChannel, C: ControlChannel> {
    registry: WatchRegistry,
    notifications: N,
    control: C,
    buffer: Vec<u8>,
    poll_timeout: Option<Duration>,
    state: DispatchState,
    stats: DispatchStats,
}

impl<N: NotificationChannel, C: ControlChannel> Dispatcher<N, C> {
    pub fn new(notifications: N, control: C) -> Self {
        Self {
            registry: WatchRegistry::new(),
            notifications,
            control,
            buffer: vec![0u8; DEFAULT_READ_BUFFER],
            poll_timeout: None,
            state: DispatchState::Running,
            stats: DispatchStats::default(),
        }
    }

    /// Read buffer size, raised to `MIN_READ_BUFFER` if smaller
    pub fn with_read_buffer(mut self, size: usize) -> Self {
        self.buffer = vec![0u8; size.max(MIN_READ_BUFFER)];
        self
    }

    /// Bounds each wait. Expiry only ends the wait; nothing is dropped.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Registers `paths` in order. On the first failure everything registered
    /// so far is released, both channels are closed and the error is returned.
    pub fn watch<I, P>(&mut self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for path in paths {
            let path = path.as_ref();
            if let Err(err) = self.registry.register(path, &mut self.notifications) {
                warn!(path = %path.display(), error = %err, "Registration failed, releasing watches");
                self.shutdown();
                return Err(err);
            }
        }
        info!(
            watches = self.registry.len(),
            backend = %self.notifications.backend(),
            "Watching paths"
        );
        Ok(())
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    pub fn notification_channel(&self) -> &N {
        &self.notifications
    }

    pub fn control_channel(&self) -> &C {
        &self.control
    }

    /// Steps until stopped. A fatal error shuts down before it is returned.
    pub fn run<F>(&mut self, mut consumer: F) -> Result<DispatchStats>
    where
        F: FnMut(&Path, &NotificationEvent),
    {
        while self.state != DispatchState::Stopped {
            if let Err(err) = self.step(&mut consumer) {
                self.shutdown();
                return Err(err);
            }
        }
        debug!(stats = ?self.stats, "Dispatcher stopped");
        Ok(self.stats)
    }

    /// One wait plus whatever became ready. Returns the state afterwards.
    pub fn step<F>(&mut self, consumer: &mut F) -> Result<DispatchState>
    where
        F: FnMut(&Path, &NotificationEvent),
    {
        if self.state == DispatchState::Stopped {
            return Ok(self.state);
        }

        let ready = sys::poll_readable(
            &[self.control.readiness_fd(), self.notifications.readiness_fd()],
            self.poll_timeout,
        )
        .map_err(|err| WatchError::io("Failed to wait for events", err))?;

        if ready[0] {
            self.state = DispatchState::Draining;
            let handled = self.handle_control(consumer);
            if self.state == DispatchState::Draining {
                self.state = DispatchState::Running;
            }
            if let Err(err) = handled {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(error = %err, "Ignoring control message");
                self.stats.unexpected_signals += 1;
            }
            if self.state != DispatchState::Running {
                return Ok(self.state);
            }
        }

        if ready[1] {
            self.drain_notifications(consumer)?;
        }

        Ok(self.state)
    }

    /// Releases every watch and closes both channels. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.state == DispatchState::Stopped {
            return;
        }
        self.state = DispatchState::Terminating;

        let released = self.registry.release_all(&mut self.notifications);
        self.stats.released += released as u64;

        if let Err(err) = self.notifications.close() {
            warn!(error = %err, "Failed to close notification channel");
        }
        if let Err(err) = self.control.close() {
            warn!(error = %err, "Failed to close control channel");
        }

        self.state = DispatchState::Stopped;
        debug!(released, "Dispatcher shut down");
    }

    fn handle_control<F>(&mut self, consumer: &mut F) -> Result<()>
    where
        F: FnMut(&Path, &NotificationEvent),
    {
        let message = self.control.read_message()?;

        if is_shutdown_signal(message.signal) {
            info!(signal = message.signal, "Shutdown requested");
            self.shutdown();
            return Ok(());
        }

        if self.notifications.delivery_signal() == Some(message.signal) {
            self.stats.signal_events += 1;
            let event = self.notifications.signal_event(&message);
            self.dispatch(event, consumer);
            return Ok(());
        }

        if self.notifications.overflow_signal() == Some(message.signal) {
            self.dispatch(NotificationEvent::overflow(), consumer);
            return Ok(());
        }

        debug!(signal = message.signal, pid = message.pid, "Signal not handled by kwatch");
        Err(WatchError::UnexpectedSignal {
            signal: message.signal,
        })
    }

    fn drain_notifications<F>(&mut self, consumer: &mut F) -> Result<()>
    where
        F: FnMut(&Path, &NotificationEvent),
    {
        let len = self.notifications.read_raw(&mut self.buffer)?;
        self.stats.reads += 1;

        let events = self.notifications.decode(&self.buffer[..len])?;
        trace!(bytes = len, events = events.len(), "Decoded notification batch");

        for event in events {
            self.dispatch(event, consumer);
        }
        Ok(())
    }

    fn dispatch<F>(&mut self, mut event: NotificationEvent, consumer: &mut F)
    where
        F: FnMut(&Path, &NotificationEvent),
    {
        if event.is_overflow() {
            self.stats.overflows += 1;
            warn!("Kernel event queue overflowed, some events were lost");
            return;
        }

        if event.watch_removed {
            if let Some(id) = event.backend_id {
                if self.registry.retire(id).is_some() {
                    self.stats.watches_retired += 1;
                }
            }
            return;
        }

        let entry = match event.subject.clone() {
            Some(subject) => self
                .registry
                .resolve_subject(&subject)
                .map(|(entry, relative)| {
                    if !relative.as_os_str().is_empty() {
                        event.name = Some(relative.into_os_string());
                    }
                    entry
                }),
            None => event.backend_id.and_then(|id| self.registry.resolve(id)),
        };

        match entry {
            Some(entry) => {
                consumer(&entry.path, &event);
                self.stats.events_delivered += 1;
            }
            None => {
                self.stats.unresolved_dropped += 1;
                trace!(id = ?event.backend_id, subject = ?event.subject, "Dropping event for unknown watch");
            }
        }
    }
}

impl<N: NotificationChannel, C: ControlChannel> Drop for Dispatcher<N, C> {
    fn drop(&mut self) {
        if self.state != DispatchState::Stopped {
            self.shutdown();
        }
    }
}
