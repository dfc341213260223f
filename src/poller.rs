//! Polling of configured PLCs and publishing into the metric registry.
//!
//! One cycle walks every target, block and metric strictly in
//! configuration order. Failures are isolated at the granularity they
//! occur: an unreachable target is skipped for the cycle, a failed read
//! or decode skips that one metric. Nothing in the poll path aborts the
//! cycle or the process; a metric that fails simply keeps its previous
//! published value until a later cycle succeeds.
//!
//! Targets are polled sequentially with no overlap between cycles. A
//! transport read that hangs therefore stalls the whole cycle; there is
//! no internal timeout or retry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{MetricConfig, TargetConfig};
use crate::decode::{self, DecodeError, DecodedValue};
use crate::recipe::{self, RECIPE_METRIC};
use crate::registry::MetricRegistry;
use crate::transport::{Connection, Transport};

/// How a target fared in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    /// Connected, read everything it could, disconnected.
    Completed,
    /// Connect failed; zero observations this cycle.
    Unreachable,
}

/// Per-target result of one cycle.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub ip: String,
    pub status: TargetStatus,
    pub published: usize,
    pub skipped: usize,
}

/// Result of one complete poll cycle.
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub outcomes: Vec<TargetOutcome>,
}

impl PollReport {
    pub fn published(&self) -> usize {
        self.outcomes.iter().map(|o| o.published).sum()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.iter().map(|o| o.skipped).sum()
    }

    pub fn unreachable(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TargetStatus::Unreachable)
            .count()
    }
}

/// Cumulative counters across cycles.
#[derive(Debug, Clone, Default)]
pub struct PollStats {
    pub cycles: u64,
    pub published: u64,
    pub skipped: u64,
    pub unreachable: u64,
}

/// Polls all configured targets and feeds the registry.
pub struct PlcPoller<T: Transport> {
    targets: Vec<TargetConfig>,
    registry: Arc<MetricRegistry>,
    transport: T,
    interval: Duration,
    stats: Mutex<PollStats>,
}

impl<T: Transport> PlcPoller<T> {
    pub fn new(
        targets: Vec<TargetConfig>,
        registry: Arc<MetricRegistry>,
        transport: T,
        interval: Duration,
    ) -> Self {
        Self {
            targets,
            registry,
            transport,
            interval,
            stats: Mutex::new(PollStats::default()),
        }
    }

    /// Cumulative counters since startup.
    pub fn stats(&self) -> PollStats {
        self.stats.lock().clone()
    }

    /// Run cycles until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting poll loop for {} target(s) (interval: {:?})",
            self.targets.len(),
            self.interval
        );

        loop {
            let report = self.poll_once().await;
            info!(
                "Cycle done: {} published, {} skipped, {}/{} targets unreachable",
                report.published(),
                report.skipped(),
                report.unreachable(),
                self.targets.len()
            );

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Poll loop stopped");
    }

    /// Perform one complete pass over all targets.
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();

        for target in &self.targets {
            let outcome = match self.transport.connect(target).await {
                Ok(mut conn) => {
                    debug!("Connected to PLC at {}", target.ip);
                    let (published, skipped) = self.read_target(&mut conn, target).await;
                    // Release the connection no matter how the block walk
                    // went; the next cycle starts from scratch.
                    conn.disconnect().await;
                    TargetOutcome {
                        ip: target.ip.clone(),
                        status: TargetStatus::Completed,
                        published,
                        skipped,
                    }
                }
                Err(e) => {
                    error!("Failed to connect to PLC at {}: {}", target.ip, e);
                    TargetOutcome {
                        ip: target.ip.clone(),
                        status: TargetStatus::Unreachable,
                        published: 0,
                        skipped: 0,
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        let mut stats = self.stats.lock();
        stats.cycles += 1;
        stats.published += report.published() as u64;
        stats.skipped += report.skipped() as u64;
        stats.unreachable += report.unreachable() as u64;

        report
    }

    /// Walk every block and metric of a connected target.
    async fn read_target(
        &self,
        conn: &mut T::Connection,
        target: &TargetConfig,
    ) -> (usize, usize) {
        let mut published = 0;
        let mut skipped = 0;

        for block in &target.db {
            for metric in &block.metrics {
                let len = match decode::read_length(metric) {
                    Ok(len) => len,
                    Err(e) => {
                        // A misconfigured type never heals on its own;
                        // keep it louder than transient read failures.
                        error!("{}", e);
                        skipped += 1;
                        continue;
                    }
                };

                let raw = match conn.read(block.number, metric.offset.byte, len).await {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(
                            "Error reading DB {} at offset {}: {}",
                            block.number, metric.offset, e
                        );
                        skipped += 1;
                        continue;
                    }
                };

                let value = match decode::decode(&raw, metric) {
                    Ok(value) => value,
                    Err(e @ DecodeError::UnsupportedType { .. }) => {
                        error!("{}", e);
                        skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            "Error decoding DB {} at offset {}: {}",
                            block.number, metric.offset, e
                        );
                        skipped += 1;
                        continue;
                    }
                };

                if self.publish(target, metric, &value) {
                    published += 1;
                } else {
                    skipped += 1;
                }
            }
        }

        (published, skipped)
    }

    /// Push one decoded value into the registry. Returns false when the
    /// value could not be published.
    fn publish(&self, target: &TargetConfig, metric: &MetricConfig, value: &DecodedValue) -> bool {
        if metric.name == RECIPE_METRIC {
            let DecodedValue::Text(text) = value else {
                warn!(
                    "Metric '{}' is reserved for recipe strings but decoded {:?}",
                    metric.name, value
                );
                return false;
            };

            let parts = recipe::split(text);
            match self
                .registry
                .set_recipe(&target.ip, &metric.name, &target.label, parts)
            {
                Ok(()) => {
                    debug!(
                        "Updated {} to alphabet={}, number={}",
                        metric.name, parts.rank, parts.number
                    );
                    true
                }
                Err(e) => {
                    warn!("Failed to publish '{}': {}", metric.name, e);
                    false
                }
            }
        } else {
            let Some(numeric) = value.as_gauge() else {
                warn!(
                    "Metric '{}' decoded non-numeric value {:?}, not publishable as a gauge",
                    metric.name, value
                );
                return false;
            };

            match self
                .registry
                .set_value(&target.ip, &metric.name, &target.label, numeric)
            {
                Ok(()) => {
                    debug!("Updated {} to {}", metric.name, numeric);
                    true
                }
                Err(e) => {
                    warn!("Failed to publish '{}': {}", metric.name, e);
                    false
                }
            }
        }
    }
}
