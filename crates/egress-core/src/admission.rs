//! CPU-cost admission control.
//!
//! Admission compares the latest idle-CPU sample minus outstanding start
//! reservations against a static per-kind cost. A reservation is a
//! pessimistic stand-in for CPU a freshly accepted pipeline has not consumed
//! yet; it is retired after a fixed delay whatever happens to the job.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use egress_protocol::RequestKind;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::{Config, CpuCostConfig};
use crate::error::ConfigError;

const GAUGE_CPU_LOAD: &str = "egress.cpu_load";
const GAUGE_AVAILABLE: &str = "egress.available";
const GAUGE_REQUESTS: &str = "egress.requests";
const COUNTER_REJECTED: &str = "egress.admission.rejected";

/// Lock-free f64 cell; every mutation is a commutative add.
#[derive(Debug, Default)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Release);
    }

    /// Add `delta`, clamping float residue below zero; returns the new value.
    pub(crate) fn add(&self, delta: f64) -> f64 {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let next = (f64::from_bits(bits) + delta).max(0.0);
                Some(next.to_bits())
            })
            .unwrap_or_else(|bits| bits);
        (f64::from_bits(prev) + delta).max(0.0)
    }
}

/// Minimum cost per kind below which encoder startup spikes are not covered.
fn cost_floor(kind: RequestKind) -> (f64, f64) {
    // (minimum, recommended)
    match kind {
        RequestKind::RoomComposite | RequestKind::Web => (2.5, 3.0),
        RequestKind::TrackComposite => (1.0, 2.0),
        RequestKind::Track => (0.5, 1.0),
    }
}

/// Non-fatal findings from [`check_cpu_config`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "advisory", rename_all = "snake_case")]
pub enum CpuAdvisory {
    CostBelowMinimum {
        kind: RequestKind,
        value: f64,
        minimum: f64,
        recommended: f64,
    },
    InsufficientForSomeKinds {
        required: f64,
        recommended: f64,
        available: f64,
    },
}

/// Validate cost thresholds against the node's logical CPU count.
///
/// Fails only when no job kind could ever be served; everything else is
/// returned (and logged) as an advisory.
pub fn check_cpu_config(
    costs: &CpuCostConfig,
    num_cpus: f64,
) -> Result<Vec<CpuAdvisory>, ConfigError> {
    let mut advisories = Vec::new();
    for kind in RequestKind::ALL {
        let value = costs.cost(kind);
        if !value.is_finite() || value <= 0.0 {
            return Err(ConfigError::InvalidCost { kind, value });
        }
        let (minimum, recommended) = cost_floor(kind);
        if value < minimum {
            warn!(
                kind = kind.as_str(),
                config_value = value,
                minimum_value = minimum,
                recommended_value = recommended,
                "cpu cost requirement too low"
            );
            advisories.push(CpuAdvisory::CostBelowMinimum {
                kind,
                value,
                minimum,
                recommended,
            });
        }
    }

    let mut requirements: Vec<f64> = RequestKind::ALL.iter().map(|k| costs.cost(*k)).collect();
    requirements.sort_by(|a, b| a.total_cmp(b));
    let recommended = requirements[2].max(3.0);

    if num_cpus < requirements[0] {
        error!(
            minimum_cpu = requirements[0],
            recommended,
            available = num_cpus,
            "not enough cpu"
        );
        return Err(ConfigError::InsufficientCapacity {
            minimum: requirements[0],
            recommended,
            available: num_cpus,
        });
    }

    if num_cpus < requirements[3] {
        warn!(
            minimum_cpu = requirements[3],
            recommended,
            available = num_cpus,
            "not enough cpu for some egress types"
        );
        advisories.push(CpuAdvisory::InsufficientForSomeKinds {
            required: requirements[3],
            recommended,
            available: num_cpus,
        });
    }

    Ok(advisories)
}

/// Per-node admission controller. Owns its counters; instances never share state.
pub struct AdmissionController {
    node_id: String,
    costs: CpuCostConfig,
    num_cpus: f64,
    idle: AtomicF64,
    pending: Arc<AtomicF64>,
    active: [AtomicI64; 4],
    rejected: AtomicU64,
    release_delay: Duration,
    advisories: Vec<CpuAdvisory>,
}

impl AdmissionController {
    pub fn new(
        node_id: impl Into<String>,
        costs: CpuCostConfig,
        num_cpus: f64,
        release_delay: Duration,
    ) -> Result<Self, ConfigError> {
        let advisories = check_cpu_config(&costs, num_cpus)?;
        Ok(Self {
            node_id: node_id.into(),
            costs,
            num_cpus,
            idle: AtomicF64::new(num_cpus),
            pending: Arc::new(AtomicF64::new(0.0)),
            active: Default::default(),
            rejected: AtomicU64::new(0),
            release_delay,
            advisories,
        })
    }

    pub fn from_config(cfg: &Config, num_cpus: f64) -> Result<Self, ConfigError> {
        Self::new(
            cfg.node_id(),
            cfg.cpu_cost.clone(),
            num_cpus,
            cfg.admission.release_delay(),
        )
    }

    pub fn advisories(&self) -> &[CpuAdvisory] {
        &self.advisories
    }

    pub fn num_cpus(&self) -> f64 {
        self.num_cpus
    }

    pub fn cost(&self, kind: RequestKind) -> f64 {
        self.costs.cost(kind)
    }

    pub fn idle_cpu(&self) -> f64 {
        self.idle.load()
    }

    pub fn pending_cpu(&self) -> f64 {
        self.pending.load()
    }

    pub fn available_cpu(&self) -> f64 {
        self.idle.load() - self.pending.load()
    }

    /// Sampler callback with the latest idle-core figure.
    pub fn update_idle(&self, idle: f64) {
        let idle = idle.clamp(0.0, self.num_cpus);
        self.idle.store(idle);
        metrics::gauge!(GAUGE_CPU_LOAD, "node_id" => self.node_id.clone())
            .set(1.0 - idle / self.num_cpus);
        self.export_available();
    }

    /// Advisory check with no side effects; callers still need [`Self::reserve`].
    pub fn can_accept(&self, kind: RequestKind) -> bool {
        let available = self.available_cpu();
        let accept = available > self.costs.cost(kind);
        debug!(
            kind = kind.as_str(),
            accepted = accept,
            available_cpus = available,
            num_cpus = self.num_cpus,
            "cpu request"
        );
        accept
    }

    /// Hold the kind's cost for the release delay.
    pub fn reserve(&self, kind: RequestKind) {
        let hold = self.costs.cost(kind);
        self.pending.add(hold);
        self.export_available();

        let pending = self.pending.clone();
        let delay = self.release_delay;
        let release = move || {
            pending.add(-hold);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    release();
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    release();
                });
            }
        }
    }

    /// `(numCPUs - idle) / numCPUs * 100`.
    pub fn load_percent(&self) -> f64 {
        (self.num_cpus - self.idle.load()) / self.num_cpus * 100.0
    }

    pub fn job_started(&self, kind: RequestKind) {
        self.active[kind.index()].fetch_add(1, Ordering::Relaxed);
        metrics::gauge!(GAUGE_REQUESTS, "node_id" => self.node_id.clone(), "type" => kind.as_str())
            .increment(1.0);
    }

    pub fn job_ended(&self, kind: RequestKind) {
        self.active[kind.index()].fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!(GAUGE_REQUESTS, "node_id" => self.node_id.clone(), "type" => kind.as_str())
            .decrement(1.0);
    }

    pub fn active_count(&self, kind: RequestKind) -> i64 {
        self.active[kind.index()].load(Ordering::Relaxed)
    }

    /// Count a start turned away by [`Self::can_accept`].
    pub fn record_rejection(&self, kind: RequestKind) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(COUNTER_REJECTED, "type" => kind.as_str()).increment(1);
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn export_available(&self) {
        metrics::gauge!(GAUGE_AVAILABLE, "node_id" => self.node_id.clone())
            .set(self.available_cpu());
    }
}
