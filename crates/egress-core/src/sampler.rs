use std::sync::Arc;
use std::time::Duration;

use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::admission::AdmissionController;

/// Source of system-wide idle CPU, in cores.
pub trait CpuSampler: Send {
    fn num_cpus(&self) -> f64;
    fn sample_idle(&mut self) -> f64;
}

/// Samples global CPU usage through `sysinfo`.
pub struct SysinfoSampler {
    sys: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_cpu_usage()),
        );
        Self { sys }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SysinfoSampler {
    fn num_cpus(&self) -> f64 {
        self.sys.cpus().len().max(1) as f64
    }

    fn sample_idle(&mut self) -> f64 {
        self.sys.refresh_cpu_usage();
        let busy = (self.sys.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);
        self.num_cpus() * (1.0 - busy)
    }
}

/// Logical CPU count of this host.
pub fn host_cpus() -> f64 {
    SysinfoSampler::new().num_cpus()
}

/// Feed samples into `controller` every `interval` until `shutdown` fires.
/// The first sample is taken immediately.
pub async fn run_sampler<S: CpuSampler>(
    controller: Arc<AdmissionController>,
    mut sampler: S,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(interval_ms = interval.as_millis() as u64, "cpu sampler started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let idle = sampler.sample_idle();
                controller.update_idle(idle);
                debug!(idle_cpu = idle, "cpu sample");
            }
        }
    }
    debug!("cpu sampler stopped");
}

pub fn spawn_sampler<S: CpuSampler + 'static>(
    controller: Arc<AdmissionController>,
    sampler: S,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_sampler(controller, sampler, interval, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuCostConfig;
    use std::collections::VecDeque;

    struct Scripted {
        samples: VecDeque<f64>,
    }

    impl CpuSampler for Scripted {
        fn num_cpus(&self) -> f64 {
            4.0
        }

        fn sample_idle(&mut self) -> f64 {
            self.samples.pop_front().unwrap_or(0.5)
        }
    }

    #[tokio::test]
    async fn sampler_feeds_controller_until_cancelled() {
        let ctl = Arc::new(
            AdmissionController::new(
                "n",
                CpuCostConfig::default(),
                4.0,
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        let token = CancellationToken::new();
        let handle = spawn_sampler(
            ctl.clone(),
            Scripted {
                samples: VecDeque::from(vec![3.0]),
            },
            Duration::from_millis(20),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctl.idle_cpu(), 0.5);
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sampler stops")
            .unwrap();
    }

    #[test]
    fn sysinfo_reports_at_least_one_cpu() {
        let mut s = SysinfoSampler::new();
        assert!(s.num_cpus() >= 1.0);
        let idle = s.sample_idle();
        assert!(idle >= 0.0 && idle <= s.num_cpus());
    }
}
