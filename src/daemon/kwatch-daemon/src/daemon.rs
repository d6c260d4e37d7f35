//! Core daemon implementation
//!
//! The dispatcher owns the kernel handles and runs on a blocking thread. Every
//! resolved event is forwarded over a bounded channel to an async reporter
//! that writes it to stdout, so events keep their order and none are dropped
//! between the two. A slow reader backs up into the kernel queue, where
//! overflows are reported. If the reporter stops, dispatching stops too.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kwatch_core::NotificationEvent;
use kwatch_system::{
    open_backend, ControlChannel, DispatchState, DispatchStats, Dispatcher, NotificationChannel,
    SignalControl, SignalSet,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::metrics::MetricsCollector;
use crate::report::{EventReport, OutputFormat};

type SystemDispatcher = Dispatcher<Box<dyn NotificationChannel>, SignalControl>;

/// Reports buffered between the dispatcher and the writer
const REPORT_QUEUE_CAPACITY: usize = 1024;

/// Starting with nothing to watch is a usage error
pub fn require_paths(paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        anyhow::bail!("No paths to watch: pass them as arguments or set watcher.paths");
    }
    Ok(())
}

/// Command-line paths replace the configured ones. Repeated paths are dropped
/// with a warning, keeping the first occurrence.
pub fn merge_paths(cli_paths: Vec<PathBuf>, configured: &[PathBuf]) -> Vec<PathBuf> {
    let candidates = if cli_paths.is_empty() {
        configured.to_vec()
    } else {
        cli_paths
    };

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|path| {
            let fresh = seen.insert(path.clone());
            if !fresh {
                warn!("Ignoring duplicate path: {}", path.display());
            }
            fresh
        })
        .collect()
}

/// Main daemon orchestrator
pub struct Daemon {
    config: DaemonConfig,
    dispatcher: SystemDispatcher,
    metrics_collector: Arc<MetricsCollector>,
}

impl Daemon {
    /// Blocks the control signals, opens the backend and registers every
    /// configured path. Call before any other thread exists.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        require_paths(&config.watcher.paths)?;
        let backend = config.watcher.backend;

        let control = SignalControl::open(SignalSet::for_backend(backend))
            .context("Failed to set up signal handling")?;
        let notifications = open_backend(backend)
            .with_context(|| format!("Failed to initialize the {backend} backend"))?;

        let mut dispatcher = Dispatcher::new(notifications, control)
            .with_read_buffer(config.watcher.read_buffer_size);
        if let Some(timeout_ms) = config.watcher.poll_timeout_ms {
            dispatcher = dispatcher.with_poll_timeout(Duration::from_millis(timeout_ms));
        }

        dispatcher
            .watch(&config.watcher.paths)
            .context("Failed to register watches")?;

        let metrics_collector = Arc::new(MetricsCollector::new());
        metrics_collector.set_watched_paths(dispatcher.registry().len());

        Ok(Self {
            config,
            dispatcher,
            metrics_collector,
        })
    }

    /// Runs until a shutdown signal or a fatal error
    pub async fn run(self) -> Result<DispatchStats> {
        let Self {
            config,
            dispatcher,
            metrics_collector,
        } = self;

        let (sender, receiver) = mpsc::channel(REPORT_QUEUE_CAPACITY);

        let format = config.output.format;
        let reporter_metrics = Arc::clone(&metrics_collector);
        let reporter = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            report_events(receiver, &mut stdout, format, &reporter_metrics).await
        });

        let dispatch_metrics = Arc::clone(&metrics_collector);
        let dispatch = tokio::task::spawn_blocking(move || {
            dispatch_events(dispatcher, sender, &dispatch_metrics)
        });

        info!(backend = %config.watcher.backend, "kwatch started");

        let dispatched = dispatch.await.context("Dispatcher thread panicked")?;
        // The sender is gone, so the reporter finishes once it has caught up
        let reported = reporter.await.context("Reporter task panicked")??;
        let stats = dispatched.context("Event dispatch failed")?;

        info!(
            reported,
            events_per_second = metrics_collector.events_per_second(),
            overflows = stats.overflows,
            unresolved = stats.unresolved_dropped,
            "kwatch stopped"
        );
        Ok(stats)
    }
}

/// Steps the dispatcher until it stops, publishing its totals after each step.
/// Blocks while the report queue is full. Once the reporter is gone the
/// watches are released and an error is returned.
fn dispatch_events<N, C>(
    mut dispatcher: Dispatcher<N, C>,
    sender: mpsc::Sender<EventReport>,
    metrics: &MetricsCollector,
) -> Result<DispatchStats>
where
    N: NotificationChannel,
    C: ControlChannel,
{
    let mut consumer = |watched: &Path, event: &NotificationEvent| {
        if sender.blocking_send(EventReport::new(watched, event)).is_err() {
            debug!("Reporter is gone, event not written");
        }
    };

    let result = loop {
        if sender.is_closed() {
            dispatcher.shutdown();
            break Err(anyhow::anyhow!("Event reporter stopped, no longer dispatching"));
        }
        match dispatcher.step(&mut consumer) {
            Ok(DispatchState::Stopped) => break Ok(dispatcher.stats()),
            Ok(_) => record_dispatch(metrics, &dispatcher),
            Err(err) => {
                dispatcher.shutdown();
                break Err(err.into());
            }
        }
    };

    record_dispatch(metrics, &dispatcher);
    result
}

fn record_dispatch<N: NotificationChannel, C: ControlChannel>(
    metrics: &MetricsCollector,
    dispatcher: &Dispatcher<N, C>,
) {
    metrics.record_dispatch(&dispatcher.stats(), dispatcher.registry().len());
}

/// Writes each report as one line until the channel closes. Returns how many
/// were written.
pub async fn report_events<W>(
    mut receiver: mpsc::Receiver<EventReport>,
    writer: &mut W,
    format: OutputFormat,
    metrics: &MetricsCollector,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut reported = 0;
    while let Some(report) = receiver.recv().await {
        metrics.record_event(&report);

        let mut line = report.render(format)?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write event report")?;
        writer.flush().await?;
        reported += 1;
    }
    Ok(reported)
}
