//! Periodic stream monitoring
//!
//! [`monitor_streams`] spawns one background task for the whole set of
//! streams. Each tick it probes every stream and calls `on_tick` once per
//! stream. [`MonitorHandle::stop`] signals the task through a watch channel
//! and waits for it to exit, so no callback runs after `stop` returns.

use crate::config::MonitorConfig;
use crate::registry::StreamRegistry;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// A fetch is running or finished recently.
    Active,
    Idle,
    /// Unregistered, unhealthy, or the last fetch failed.
    Error,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamStatus::Active => "active",
            StreamStatus::Idle => "idle",
            StreamStatus::Error => "error",
        })
    }
}

/// What one tick reports for one stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStats {
    pub status: StreamStatus,
    /// Time since the monitor started.
    pub uptime: Duration,
    pub fetches: u64,
    pub failures: u64,
    pub in_flight: usize,
    pub error: Option<String>,
}

impl StreamStats {
    fn failed(uptime: Duration, error: String) -> Self {
        Self {
            status: StreamStatus::Error,
            uptime,
            fetches: 0,
            failures: 0,
            in_flight: 0,
            error: Some(error),
        }
    }
}

/// Handle on a running monitor.
///
/// Dropping the handle closes the shutdown channel, which also ends the
/// loop, but without waiting for it.
pub struct MonitorHandle {
    stream_ids: Vec<String>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
}

impl MonitorHandle {
    pub fn stream_ids(&self) -> &[String] {
        &self.stream_ids
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Completed ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Stop the loop and wait for it to exit. Calling it again is a no-op.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Stream monitor task ended abnormally");
                }
            }
            self.running.store(false, Ordering::SeqCst);
            info!(streams = self.stream_ids.len(), ticks = self.ticks(), "Stream monitor stopped");
        }
    }
}

impl fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("stream_ids", &self.stream_ids)
            .field("running", &self.is_running())
            .field("ticks", &self.ticks())
            .finish()
    }
}

/// Start monitoring `stream_ids`. The first tick fires immediately.
///
/// Must be called from within a tokio runtime.
pub fn monitor_streams<F>(
    registry: Arc<StreamRegistry>,
    stream_ids: Vec<String>,
    config: &MonitorConfig,
    on_tick: F,
) -> MonitorHandle
where
    F: Fn(&str, &StreamStats) + Send + Sync + 'static,
{
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let running = Arc::new(AtomicBool::new(true));
    let ticks = Arc::new(AtomicU64::new(0));
    let period = config.interval();
    let idle_after = config.idle_after();

    let task = {
        let ids = stream_ids.clone();
        let running = Arc::clone(&running);
        let ticks = Arc::clone(&ticks);
        tokio::spawn(async move {
            let started = Instant::now();
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = timer.tick() => {
                        for id in &ids {
                            let stats = stream_stats(&registry, id, started, idle_after).await;
                            on_tick(id, &stats);
                        }
                        let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                        debug!(tick = n, streams = ids.len(), "Monitor tick");
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        })
    };

    info!(
        streams = stream_ids.len(),
        interval_ms = period.as_millis() as u64,
        "Stream monitor started"
    );

    MonitorHandle {
        stream_ids,
        shutdown,
        task: Mutex::new(Some(task)),
        running,
        ticks,
    }
}

/// Probe one stream. Failures become an `Error` status rather than ending the
/// loop.
async fn stream_stats(
    registry: &StreamRegistry,
    id: &str,
    started: Instant,
    idle_after: Duration,
) -> StreamStats {
    let uptime = started.elapsed();
    let registration = match registry.resolve(id) {
        Ok(registration) => registration,
        Err(e) => return StreamStats::failed(uptime, e.to_string()),
    };

    let activity = registration.activity().snapshot();
    let mut stats = StreamStats {
        status: StreamStatus::Idle,
        uptime,
        fetches: activity.fetches,
        failures: activity.failures,
        in_flight: activity.in_flight,
        error: None,
    };

    if let Err(e) = registration.source.health().await {
        warn!(stream_id = id, error = %e, "Stream health check failed");
        stats.status = StreamStatus::Error;
        stats.error = Some(e.to_string());
    } else if activity.last_failed {
        stats.status = StreamStatus::Error;
        stats.error = Some("last fetch failed".to_string());
    } else if activity.in_flight > 0
        || activity
            .last_finished
            .is_some_and(|at| at.elapsed() <= idle_after)
    {
        stats.status = StreamStatus::Active;
    }
    stats
}
