//! Agent pool manager (C6, §4.6).
//!
//! Supervises a set of [`Agent`] run loops (§4.5) within one process,
//! scaling the set up or down every `mgr_sleep` tick based on load
//! average, free disk, and whether there is any active ensemble at all.
//! Each run loop already cooperatively yields at second-granularity
//! ticks (its heartbeat loop, §4.3), so "worker thread" here is a Tokio
//! task rather than an OS thread — the scaling policy below is
//! unchanged either way.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::agent::runloop::Agent;
use crate::claim::{ClaimProtocol, InstanceId};
use crate::config::{AgentConfig, PoolConfig};
use crate::error::{JoshuaError, JoshuaResult};
use crate::registry::Registry;

struct Worker {
    id: u64,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// One periodic report, logged at `info` (§9 "Metrics/reporting": the
/// teacher's metrics-exporter stack is intentionally not pulled in here,
/// see DESIGN.md — the counters themselves are still surfaced via
/// `tracing`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolReport {
    pub load_1m: f64,
    pub active_ensembles: usize,
    pub workers: usize,
    pub pass_rate_per_hour: f64,
    pub fail_rate_per_hour: f64,
    pub free_space_gib: f64,
}

pub struct PoolManager {
    registry: Registry,
    pool_config: PoolConfig,
    agent_template: AgentConfig,
    workers: Vec<Worker>,
    stopping: bool,
    next_worker_id: u64,
    last_report_at: Instant,
    last_report_totals: (u64, u64),
}

impl PoolManager {
    pub fn new(registry: Registry, pool_config: PoolConfig, agent_template: AgentConfig) -> Self {
        PoolManager {
            registry,
            pool_config,
            agent_template,
            workers: Vec::new(),
            stopping: false,
            next_worker_id: 0,
            last_report_at: Instant::now(),
            last_report_totals: (0, 0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The full §4.6 loop: tick, maybe report, sleep; once a stop
    /// condition is hit, drain workers with the shutdown discipline and
    /// return.
    pub async fn run(mut self) -> JoshuaResult<()> {
        loop {
            self.reap_finished();
            let target = self.compute_target()?;
            self.apply_target(target);

            if self.stopping {
                return self.drain().await;
            }

            if self.last_report_at.elapsed().as_secs() >= self.pool_config.report_freq_mins * 60 {
                if let Ok(report) = self.report() {
                    tracing::info!(
                        load_1m = report.load_1m,
                        active_ensembles = report.active_ensembles,
                        workers = report.workers,
                        pass_per_hour = report.pass_rate_per_hour,
                        fail_per_hour = report.fail_rate_per_hour,
                        free_space_gib = report.free_space_gib,
                        "pool report"
                    );
                }
            }

            tokio::time::sleep(Duration::from_secs(self.pool_config.mgr_sleep_secs)).await;
        }
    }

    /// §4.6 "Shutdown discipline": sleep `death_wait`, check whether
    /// every worker has exited, repeat until they have or
    /// `max_death_wait` is exceeded.
    async fn drain(mut self) -> JoshuaResult<()> {
        let death_wait = Duration::from_secs(self.pool_config.death_wait_secs);
        let max_wait = Duration::from_secs(self.pool_config.max_death_wait_secs);
        let start = Instant::now();
        loop {
            self.reap_finished();
            if self.workers.is_empty() {
                return Ok(());
            }
            if start.elapsed() >= max_wait {
                tracing::warn!(
                    remaining = self.workers.len(),
                    "max_death_wait exceeded, forcing shutdown"
                );
                for worker in &self.workers {
                    worker.handle.abort();
                }
                return Ok(());
            }
            tokio::time::sleep(death_wait).await;
        }
    }

    fn reap_finished(&mut self) {
        self.workers.retain(|w| !w.handle.is_finished());
    }

    /// §4.6 "per tick" decision tree, returning the desired worker count.
    fn compute_target(&mut self) -> JoshuaResult<usize> {
        if self.pool_config.stop_file.exists() {
            tracing::info!("stop-file present, draining pool");
            self.stopping = true;
            return Ok(0);
        }

        let free_gib = free_space_gib(&self.agent_template.work_dir)?;
        if free_gib < self.pool_config.free_space_gib {
            tracing::warn!(free_gib, target = self.pool_config.free_space_gib, "free disk below target, draining pool");
            self.stopping = true;
            return Ok(0);
        }

        let active = self.registry.list_active()?;
        if active.is_empty() {
            return Ok(0);
        }

        let current = self.workers.len();
        let max_agents = self.pool_config.target_max_agents();
        let total_cpus = num_cpus::get() as i64;
        let loadavg = load_average_1m()?;
        let cpus_used = (loadavg + 0.8).floor() as i64;
        let avail = total_cpus - cpus_used - self.pool_config.free_cpus as i64;

        let delta = damp_delta(
            desired_delta(current as i64, max_agents as i64, avail),
            self.pool_config.growth_rate,
        );
        Ok((current as i64 + delta).max(0) as usize)
    }

    fn apply_target(&mut self, target: usize) {
        let current = self.workers.len();
        if target > current {
            for _ in 0..(target - current) {
                self.spawn_worker();
            }
            return;
        }
        // Flag the newest `current - target` workers not already
        // stopping; they retire cooperatively and `reap_finished` drops
        // them from the count on their next tick.
        let to_flag = current - target;
        let mut flagged = 0;
        for worker in self.workers.iter().rev() {
            if flagged == to_flag {
                break;
            }
            if !worker.stop.load(Ordering::SeqCst) {
                tracing::debug!(worker = worker.id, "signalling worker to stop");
                worker.stop.store(true, Ordering::SeqCst);
                flagged += 1;
            }
        }
    }

    fn spawn_worker(&mut self) {
        let id = self.next_worker_id;
        self.next_worker_id += 1;

        let mut config = self.agent_template.clone();
        config.work_dir = self.agent_template.work_dir.join(format!("worker-{id}"));
        config.stop_file = self
            .agent_template
            .stop_file
            .with_file_name(format!(
                "{}-{id}",
                self.agent_template
                    .stop_file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "stop".to_string())
            ));

        let stop = Arc::new(AtomicBool::new(false));
        let registry = self.registry.clone();
        let claim = ClaimProtocol::new(registry.clone(), InstanceId::generate());
        let stop_for_task = stop.clone();

        let handle = tokio::spawn(async move {
            let mut agent = Agent::new(registry, claim, config, stop_for_task);
            if let Err(e) = agent.run().await {
                tracing::error!(worker = id, error = %e, "agent run loop exited with an error");
            }
        });

        tracing::debug!(worker = id, "spawned agent worker");
        self.workers.push(Worker { id, stop, handle });
    }

    /// §4.6 periodic report: load, active ensemble count, free disk, and
    /// last-hour pass/fail rates extrapolated from the delta in total
    /// counters since the previous report.
    fn report(&mut self) -> JoshuaResult<PoolReport> {
        let active = self.registry.list_active()?;
        let (pass, fail) = active
            .iter()
            .fold((0u64, 0u64), |(p, f), s| (p + s.counters.pass, f + s.counters.fail));

        let elapsed = self.last_report_at.elapsed().as_secs_f64().max(1.0);
        let (last_pass, last_fail) = self.last_report_totals;
        let pass_rate = (pass.saturating_sub(last_pass) as f64) * (3600.0 / elapsed);
        let fail_rate = (fail.saturating_sub(last_fail) as f64) * (3600.0 / elapsed);

        self.last_report_totals = (pass, fail);
        self.last_report_at = Instant::now();

        Ok(PoolReport {
            load_1m: load_average_1m().unwrap_or(0.0),
            active_ensembles: active.len(),
            workers: self.workers.len(),
            pass_rate_per_hour: pass_rate,
            fail_rate_per_hour: fail_rate,
            free_space_gib: free_space_gib(&self.agent_template.work_dir).unwrap_or(0.0),
        })
    }
}

/// `Δ = min(max_agents − current, avail)` if `avail > 0`, else
/// `max(−current, avail)` (§4.6).
fn desired_delta(current: i64, max_agents: i64, avail: i64) -> i64 {
    if avail > 0 {
        (max_agents - current).min(avail)
    } else {
        (-current).max(avail)
    }
}

/// Damp a big swing: if `|Δ| > 100/growth_rate`, scale by
/// `growth_rate/100` (§4.6).
fn damp_delta(delta: i64, growth_rate: u32) -> i64 {
    let growth_rate = growth_rate.max(1) as f64;
    let threshold = 100.0 / growth_rate;
    if (delta.abs() as f64) > threshold {
        (delta as f64 * growth_rate / 100.0).round() as i64
    } else {
        delta
    }
}

fn load_average_1m() -> JoshuaResult<f64> {
    let mut loads = [0f64; 3];
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if n < 1 {
        return Err(JoshuaError::Io("getloadavg returned no samples".to_string()));
    }
    Ok(loads[0])
}

fn free_space_gib(path: &Path) -> JoshuaResult<f64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    std::fs::create_dir_all(path)?;
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| JoshuaError::Io(e.to_string()))?;
    let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(JoshuaError::Io(std::io::Error::last_os_error().to_string()));
    }
    let stat = unsafe { stat.assume_init() };
    let free_bytes = stat.f_bavail as f64 * stat.f_frsize as f64;
    Ok(free_bytes / (1024.0 * 1024.0 * 1024.0))
}
