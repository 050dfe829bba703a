//! Polling loop: read every sensor, emit samples, wait for the next tick.
//!
//! ```text
//!   tick ──▶ read sensor 1 ──▶ Sample ──▶ sinks
//!            read sensor 2 ──▶ Sample ──▶ sinks
//!            ...
//!   tick ──▶ ...
//! ```
//!
//! The loop ends when the shutdown signal fires, when `max_samples`
//! rounds have run, or on a fatal error. Transient read failures are
//! logged and the sample is skipped; `max_consecutive_failures` in a
//! row on one sensor turn into a fatal error. There is no automatic
//! retry or backoff within a round.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sensorbus_core::{Sample, Sensor, SensorError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::AcquisitionConfig;
use crate::error::{AppError, AppResult};
use crate::sink::SampleSink;

// =============================================================================
// Shutdown
// =============================================================================

/// Stops a running loop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the loop to stop after the current round.
    pub fn trigger(&self) {
        // send_replace works with no receivers left
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Shutdown handle and the signal the loop listens on.
pub fn shutdown_channel() -> (ShutdownHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx: Arc::new(tx) }, rx)
}

// =============================================================================
// Configuration and Summary
// =============================================================================

/// Loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub interval: Duration,
    pub max_samples: Option<u64>,
    pub max_consecutive_failures: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::from(&AcquisitionConfig::default())
    }
}

impl From<&AcquisitionConfig> for PollingConfig {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms.max(1)),
            max_samples: config.max_samples,
            max_consecutive_failures: config.max_consecutive_failures.max(1),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown signal
    Shutdown,
    /// `max_samples` rounds completed
    MaxSamples,
    /// Nothing configured to read
    NoSensors,
}

/// Per-sensor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorStats {
    pub samples: u64,
    pub transient_failures: u64,
    /// Current run of transient failures
    pub consecutive_failures: u32,
}

/// What a finished loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionSummary {
    pub rounds: u64,
    pub samples: u64,
    pub transient_failures: u64,
    pub elapsed: Duration,
    pub stop: StopReason,
    pub per_sensor: BTreeMap<String, SensorStats>,
}

impl fmt::Display for AcquisitionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} rounds, {} samples, {} skipped in {:.1}s ({:?})",
            self.rounds,
            self.samples,
            self.transient_failures,
            self.elapsed.as_secs_f64(),
            self.stop
        )?;
        for (id, stats) in &self.per_sensor {
            writeln!(
                f,
                "\t{}: {} samples, {} skipped",
                id, stats.samples, stats.transient_failures
            )?;
        }
        Ok(())
    }
}

// =============================================================================
// Polling Loop
// =============================================================================

/// Periodic reader over a set of sensors.
pub struct PollingLoop {
    config: PollingConfig,
    sensors: Vec<Arc<dyn Sensor>>,
    sinks: Vec<Box<dyn SampleSink>>,
}

impl PollingLoop {
    pub fn new(config: PollingConfig, sensors: Vec<Arc<dyn Sensor>>) -> Self {
        Self {
            config,
            sensors,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn SampleSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> PollingConfig {
        self.config
    }

    /// Run until shutdown, `max_samples` rounds, or a fatal error.
    ///
    /// Sinks are flushed on every exit path.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> AppResult<AcquisitionSummary> {
        let result = self.poll(shutdown).await;
        let flushed = self.flush_sinks().await;
        match (result, flushed) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        }
    }

    async fn poll(&mut self, mut shutdown: watch::Receiver<bool>) -> AppResult<AcquisitionSummary> {
        let started = Instant::now();
        let mut summary = AcquisitionSummary {
            rounds: 0,
            samples: 0,
            transient_failures: 0,
            elapsed: Duration::ZERO,
            stop: StopReason::Shutdown,
            per_sensor: self
                .sensors
                .iter()
                .map(|s| (s.id().to_string(), SensorStats::default()))
                .collect(),
        };

        if self.sensors.is_empty() {
            warn!("No sensors to poll");
            summary.stop = StopReason::NoSensors;
            return Ok(summary);
        }

        info!(
            sensors = self.sensors.len(),
            interval_ms = self.config.interval.as_millis() as u64,
            max_samples = ?self.config.max_samples,
            "Polling loop started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_open = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed(), if shutdown_open => {
                    if changed.is_err() {
                        // Handle dropped without triggering: keep polling
                        shutdown_open = false;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            summary.rounds += 1;
            for sensor in &self.sensors {
                let id = sensor.id();
                let result = sensor.read().await;
                let stats = summary.per_sensor.entry(id.to_string()).or_default();

                match result {
                    Ok(reading) => {
                        stats.samples += 1;
                        stats.consecutive_failures = 0;
                        summary.samples += 1;

                        let sample = Sample::now(id, reading);
                        for sink in &mut self.sinks {
                            sink.write(&sample).await.inspect_err(|e| {
                                error!(sink = sink.name(), error = %e, "Sink write failed");
                            })?;
                        }
                    }
                    Err(e) if e.is_transient() => {
                        stats.transient_failures += 1;
                        stats.consecutive_failures += 1;
                        summary.transient_failures += 1;
                        warn!(
                            sensor = id,
                            error = %e,
                            consecutive = stats.consecutive_failures,
                            "Sample skipped"
                        );

                        if stats.consecutive_failures >= self.config.max_consecutive_failures {
                            error!(
                                sensor = id,
                                failures = stats.consecutive_failures,
                                "Too many consecutive transient failures"
                            );
                            return Err(AppError::Sensor(SensorError::fatal(
                                id,
                                format!(
                                    "{} consecutive transient failures, last: {}",
                                    stats.consecutive_failures, e
                                ),
                            )));
                        }
                    }
                    Err(e) => {
                        error!(sensor = id, error = %e, kind = %e.kind(), "Polling stopped");
                        return Err(e.into());
                    }
                }
            }
            debug!(round = summary.rounds, "Polling round complete");

            if let Some(max) = self.config.max_samples {
                if summary.rounds >= max {
                    summary.stop = StopReason::MaxSamples;
                    break;
                }
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            rounds = summary.rounds,
            samples = summary.samples,
            skipped = summary.transient_failures,
            stop = ?summary.stop,
            "Polling loop stopped"
        );
        Ok(summary)
    }

    async fn flush_sinks(&mut self) -> AppResult<()> {
        for sink in &mut self.sinks {
            sink.flush().await?;
        }
        Ok(())
    }
}
