//! kwatch System Integration
//!
//! Linux-specific half of the monitoring service: the inotify, dnotify and
//! fanotify notification channels, the signalfd-backed control channel, the
//! watch registry, and the single-threaded dispatcher that multiplexes them.

#[cfg(not(target_os = "linux"))]
compile_error!("kwatch-system only supports Linux notification backends");

pub mod channel;
pub mod dispatcher;
pub mod dnotify;
pub mod fanotify;
pub mod inotify;
pub mod registry;
pub mod signals;

mod sys;

#[cfg(test)]
mod testing;

pub use channel::{
    open_backend, ControlChannel, NotificationChannel, DEFAULT_READ_BUFFER, MIN_READ_BUFFER,
};
pub use dispatcher::{DispatchState, DispatchStats, Dispatcher};
pub use dnotify::DnotifyChannel;
pub use fanotify::FanotifyChannel;
pub use inotify::InotifyChannel;
pub use registry::WatchRegistry;
pub use signals::{is_shutdown_signal, SignalControl, SignalSet};
