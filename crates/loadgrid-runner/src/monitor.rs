//! CPU monitor — a supervised sampling task owned by its runner.
//!
//! The latest reading is published as f64 bits in an `AtomicU64`, so the
//! heartbeat task reads a synchronized snapshot instead of poking at
//! shared mutable state. The monitor is torn down with its owner.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Samples the current process's CPU usage as a percentage of one core.
pub trait CpuSampler: Send + 'static {
    /// `None` when the platform offers no reading (first sample, or an
    /// unsupported OS); the monitor keeps the previous value.
    fn sample(&mut self) -> Option<f64>;
}

/// `/proc/self/stat`-based sampler: utime+stime deltas over wall time.
#[derive(Debug, Default)]
pub struct ProcStatSampler {
    last: Option<(u64, Instant)>,
}

// USER_HZ on every mainstream Linux configuration.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

impl ProcStatSampler {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(target_os = "linux")]
    fn read_ticks() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // comm (field 2) may contain spaces; skip past the closing paren.
        let rest = stat.rsplit_once(')').map(|(_, r)| r)?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // utime and stime are fields 14 and 15 overall, 12 and 13 here.
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    #[cfg(not(target_os = "linux"))]
    fn read_ticks() -> Option<u64> {
        None
    }
}

impl CpuSampler for ProcStatSampler {
    fn sample(&mut self) -> Option<f64> {
        let ticks = Self::read_ticks()?;
        let now = Instant::now();
        let reading = self.last.map(|(prev_ticks, prev_at)| {
            let elapsed = now.duration_since(prev_at).as_secs_f64();
            if elapsed <= 0.0 {
                return 0.0;
            }
            let busy = ticks.saturating_sub(prev_ticks) as f64 / CLOCK_TICKS_PER_SEC;
            (busy / elapsed * 100.0).clamp(0.0, 100.0)
        });
        self.last = Some((ticks, now));
        reading
    }
}

/// Shared read handle to the latest CPU reading.
#[derive(Debug, Clone)]
pub struct CpuReading(Arc<AtomicU64>);

impl CpuReading {
    pub fn current(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Owns the periodic sampling task.
#[derive(Debug)]
pub struct CpuMonitor {
    value: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CpuMonitor {
    /// Start sampling at `interval`.
    pub fn start(mut sampler: impl CpuSampler, interval: Duration) -> Self {
        let value = Arc::new(AtomicU64::new(0f64.to_bits()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let shared = value.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Some(reading) = sampler.sample() {
                            shared.store(reading.to_bits(), Ordering::Relaxed);
                            debug!(cpu_pct = reading, "cpu sampled");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self {
            value,
            shutdown_tx,
            task,
        }
    }

    pub fn reading(&self) -> CpuReading {
        CpuReading(self.value.clone())
    }
}

impl Drop for CpuMonitor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.task.abort();
    }
}
