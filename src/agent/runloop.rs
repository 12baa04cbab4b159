//! Per-agent run loop (C5, §4.5).
//!
//! One `Agent` owns one OS thread worth of concurrency: it never runs two
//! tests at once. The pool manager (C6) is what gives a process several
//! of these running in parallel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::agent::materialize::{gc_stale_ensembles, materialise};
use crate::agent::process::{ChildHandle, ProcessGroup};
use crate::claim::ClaimProtocol;
use crate::config::AgentConfig;
use crate::error::{crosses_run_boundary, is_agent_fatal, JoshuaError, JoshuaResult};
use crate::model::EnsembleSummary;
use crate::registry::Registry;
use crate::results::ResultSink;
use crate::xml::{error_payload, timeout_payload};

/// Negative sentinel exit codes (§6).
pub const CODE_CLAIM_LOST: i32 = -1;
pub const CODE_TIMED_OUT: i32 = -2;
pub const CODE_STOPPED_BEFORE_START: i32 = -3;

const HEARTBEAT_TICK: Duration = Duration::from_secs(1);

pub struct Agent {
    registry: Registry,
    claim: ClaimProtocol,
    sink: ResultSink,
    config: AgentConfig,
    hostname: String,
    stop_agent: Arc<AtomicBool>,
    started_at: Instant,
    last_sanity_run: Option<Instant>,
}

impl Agent {
    pub fn new(registry: Registry, claim: ClaimProtocol, config: AgentConfig, stop_agent: Arc<AtomicBool>) -> Self {
        let sink = ResultSink::new(registry.clone());
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Agent {
            registry,
            claim,
            sink,
            config,
            hostname,
            stop_agent,
            started_at: Instant::now(),
            last_sanity_run: None,
        }
    }

    /// §4.5 main loop step 1 and step 3: run every sanity ensemble once,
    /// synchronously; any non-zero exit is agent-fatal.
    pub async fn run_sanity(&mut self) -> JoshuaResult<()> {
        let sanity_ensembles = self.registry.list_sanity()?;
        for summary in &sanity_ensembles {
            let code = self.execute_one(summary, true).await?;
            if code != 0 {
                return Err(JoshuaError::SanityFailure(format!(
                    "sanity ensemble {} exited {code}",
                    summary.eid
                )));
            }
        }
        self.last_sanity_run = Some(Instant::now());
        Ok(())
    }

    /// The full §4.5 main loop. Runs until a terminating condition (idle
    /// timeout, total runtime budget, stop-file/`stop_agent` flag, or a
    /// sanity failure) is hit, at which point it returns.
    pub async fn run(&mut self) -> JoshuaResult<()> {
        self.run_sanity().await?;

        loop {
            if self.stop_agent.load(Ordering::SeqCst) || self.config.stop_file.exists() {
                tracing::info!("stop_agent flag or stop-file observed, winding down run loop");
                return Ok(());
            }

            let sanity_due = self
                .last_sanity_run
                .map(|t| t.elapsed().as_secs() >= self.config.sanity_period)
                .unwrap_or(true);
            if sanity_due {
                self.run_sanity().await?;
            }

            let active = self.registry.list_active()?;
            let live_eids: HashSet<String> = active.iter().map(|s| s.eid.clone()).collect();
            gc_stale_ensembles(&self.config.work_dir, &live_eids)?;

            let mut runnable = Vec::new();
            for summary in &active {
                if self.claim.should_run(&summary.eid)? {
                    runnable.push(summary.clone());
                }
            }

            if runnable.is_empty() {
                if active.is_empty() {
                    if self.should_exit_idle() {
                        return Ok(());
                    }
                    self.wait_for_activity().await;
                }
                continue;
            }

            if self.total_runtime_exceeded() {
                return Ok(());
            }

            if let Some(chosen) = pick_weighted(&runnable) {
                let _code = self.execute_one(&chosen, false).await?;
            }
        }
    }

    fn should_exit_idle(&self) -> bool {
        if let Some(idle) = self.config.agent_idle_timeout {
            if self.started_at.elapsed().as_secs() >= idle {
                return true;
            }
        }
        self.total_runtime_exceeded()
    }

    fn total_runtime_exceeded(&self) -> bool {
        self.config
            .agent_timeout
            .map(|t| self.started_at.elapsed().as_secs() >= t)
            .unwrap_or(false)
    }

    /// §4.5 step 6: "wait on any of { active watch, sanity watch, 1 s
    /// timer }" — built on the `Waitable` seam from §9's design notes
    /// rather than a bespoke `tokio::select!` for this one call site.
    async fn wait_for_activity(&self) {
        let sources: Vec<Box<dyn crate::wait::Waitable>> = vec![
            Box::new(crate::wait::KvWatch::new(
                self.registry.store().clone(),
                self.registry.change_counter_key(false),
            )),
            Box::new(crate::wait::KvWatch::new(
                self.registry.store().clone(),
                self.registry.change_counter_key(true),
            )),
            Box::new(crate::wait::Timer::new(HEARTBEAT_TICK)),
        ];
        crate::wait::wait_for_any(sources, Duration::from_secs(1)).await;
    }

    /// §4.5 "Execution of a run". Returns the exit code (0 pass,
    /// non-zero fail, negative sentinel on internal cancellation).
    async fn execute_one(&self, summary: &EnsembleSummary, is_sanity: bool) -> JoshuaResult<i32> {
        let seed: u64 = rand::thread_rng().gen_range(0..(1u64 << 63));
        let eid = summary.eid.clone();

        if !self.claim.try_start(&eid, seed, is_sanity, &self.hostname)? {
            return Ok(CODE_STOPPED_BEFORE_START);
        }

        let tarball = match self.registry.read_tarball(&eid) {
            Ok(t) => t,
            Err(e) if is_agent_fatal(&e) => return Err(e),
            Err(e) if crosses_run_boundary(&e) => return self.fold_boundary_error(&eid, seed, is_sanity, summary, &e),
            Err(e) => return Err(e),
        };
        let root = match materialise(&self.config.work_dir, &eid, &tarball) {
            Ok(r) => r,
            Err(e) if is_agent_fatal(&e) => return Err(e),
            Err(e) if crosses_run_boundary(&e) => return self.fold_boundary_error(&eid, seed, is_sanity, summary, &e),
            Err(e) => return Err(e),
        };

        let mut env = summary.properties.to_env_pairs();
        env.push(("JOSHUA_SEED".to_string(), seed.to_string()));
        env.extend(summary.properties.parsed_env_overrides());
        let tmp_dir = root.join("tmp");
        env.push(("TMP".to_string(), tmp_dir.display().to_string()));

        let start = Instant::now();
        let run_outcome = self
            .run_with_heartbeat(&eid, seed, is_sanity, &root, &summary.properties.test_command, &env, summary.properties.timeout)
            .await;

        let (code, output) = match run_outcome {
            Ok((code, output)) => (code, output),
            Err(e) if is_agent_fatal(&e) => return Err(e),
            Err(e) => (CODE_CLAIM_LOST, error_payload(&e.to_string()).into_bytes()),
        };

        let output = if code == CODE_TIMED_OUT {
            self.summarise_timeout(&root, &summary.properties.timeout_command).await
        } else {
            output
        };

        let _ = std::fs::write(tmp_dir.join("console.log"), &output);
        let should_save = self.config.save_on.should_save(code);
        if should_save {
            if let Err(e) = self.archive_run(&root, &eid, seed) {
                tracing::warn!(eid = %eid, seed, error = %e, "failed to archive run output");
            }
        }
        let _ = std::fs::remove_dir_all(&tmp_dir);
        let _ = std::fs::create_dir_all(&tmp_dir);

        let duration = start.elapsed().as_secs_f64();
        let outcome = self.sink.insert_results(
            &eid,
            seed,
            code,
            &output,
            is_sanity,
            summary.properties.fail_fast,
            summary.properties.max_runs,
            duration,
            summary.properties.compressed,
        );
        if let Err(e) = outcome {
            tracing::error!(eid = %eid, seed, error = %e, "failed to insert result, logging agent failure");
            self.log_agent_failure(&e.to_string())?;
        }

        if code == CODE_CLAIM_LOST || code == CODE_TIMED_OUT {
            if let Err(e) = std::fs::write(&self.config.stop_file, b"") {
                tracing::warn!(eid = %eid, seed, error = %e, path = %self.config.stop_file.display(), "failed to write agent-wide stop-file");
            } else {
                tracing::warn!(eid = %eid, seed, code, "wrote stop-file after claim-lost/timeout exit, winding this agent down");
            }
        }

        Ok(code)
    }

    /// Fold a run-boundary error (§7 propagation policy) into a result row
    /// instead of propagating it out of the run loop.
    fn fold_boundary_error(
        &self,
        eid: &str,
        seed: u64,
        is_sanity: bool,
        summary: &EnsembleSummary,
        err: &JoshuaError,
    ) -> JoshuaResult<i32> {
        let output = error_payload(&err.to_string()).into_bytes();
        let outcome = self.sink.insert_results(
            eid,
            seed,
            CODE_CLAIM_LOST,
            &output,
            is_sanity,
            summary.properties.fail_fast,
            summary.properties.max_runs,
            0.0,
            summary.properties.compressed,
        );
        if let Err(e) = outcome {
            tracing::error!(eid = %eid, seed, error = %e, "failed to insert result, logging agent failure");
            self.log_agent_failure(&e.to_string())?;
        }
        if let Err(e) = std::fs::write(&self.config.stop_file, b"") {
            tracing::warn!(eid = %eid, seed, error = %e, path = %self.config.stop_file.display(), "failed to write agent-wide stop-file");
        } else {
            tracing::warn!(eid = %eid, seed, "wrote stop-file after a run-boundary error, winding this agent down");
        }
        Ok(CODE_CLAIM_LOST)
    }

    /// Spawn the test child and run the 1-second heartbeat loop
    /// alongside it, returning whichever of {natural exit, cancellation,
    /// timeout} happens first.
    async fn run_with_heartbeat(
        &self,
        eid: &str,
        seed: u64,
        is_sanity: bool,
        cwd: &std::path::Path,
        test_command: &str,
        env: &[(String, String)],
        timeout: Option<u64>,
    ) -> JoshuaResult<(i32, Vec<u8>)> {
        let child = ChildHandle::spawn(&cwd.join(test_command).display().to_string(), cwd, env)?;
        let pgid = child.pgid();
        let deadline = timeout.map(|t| Instant::now() + Duration::from_secs(t));

        let wait_fut = child.wait_with_output();
        tokio::pin!(wait_fut);

        loop {
            let tick = tokio::time::sleep(HEARTBEAT_TICK);
            tokio::select! {
                outcome = &mut wait_fut => {
                    let outcome = outcome?;
                    return Ok((outcome.code, outcome.output));
                }
                _ = tick => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            ProcessGroup::new(pgid).kill_all()?;
                            return Ok((CODE_TIMED_OUT, Vec::new()));
                        }
                    }
                    if !self.claim.heartbeat_and_check(eid, seed, is_sanity)? {
                        ProcessGroup::new(pgid).kill_all()?;
                        return Ok((CODE_CLAIM_LOST, Vec::new()));
                    }
                }
            }
        }
    }

    async fn summarise_timeout(&self, root: &std::path::Path, timeout_command: &str) -> Vec<u8> {
        let timeout_command_timeout = self.config.timeout_command_timeout;
        let script = root.join(timeout_command);
        if !script.exists() {
            return timeout_payload(false).into_bytes();
        }
        let spawn = ChildHandle::spawn(&script.display().to_string(), root, &[]);
        let Ok(child) = spawn else {
            return timeout_payload(false).into_bytes();
        };
        let result = tokio::time::timeout(Duration::from_secs(timeout_command_timeout), child.wait_with_output()).await;
        match result {
            Ok(Ok(outcome)) => outcome.output,
            _ => timeout_payload(true).into_bytes(),
        }
    }

    fn archive_run(&self, root: &std::path::Path, eid: &str, seed: u64) -> JoshuaResult<()> {
        let runs_dir = self.config.work_dir.join("runs");
        std::fs::create_dir_all(&runs_dir)?;
        let archive_path = runs_dir.join(format!("joshua-run-{}-{seed}.tar.gz", crate::agent::materialize::sanitise_eid(eid)));
        let file = std::fs::File::create(&archive_path)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let tmp_dir = root.join("tmp");
        if tmp_dir.exists() {
            builder.append_dir_all("tmp", &tmp_dir)?;
        }
        for entry in std::fs::read_dir(&self.config.work_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("core.") {
                builder.append_path_with_name(entry.path(), name)?;
                let _ = std::fs::remove_file(entry.path());
            }
        }
        builder.into_inner()?.finish()?;
        Ok(())
    }

    fn log_agent_failure(&self, message: &str) -> JoshuaResult<()> {
        let failures = self.registry.store().directory(&["failures"]);
        let now = crate::model::now_unix();
        let mut random = [0u8; 4];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut random);
        let key = failures
            .child(&now.to_string())
            .child(&self.hostname)
            .pack(&crate::store::Tuple::new().push(crate::store::Element::Bytes(random.to_vec())));
        self.registry.store().transact(|txn| txn.set(&key, message.as_bytes()))?;
        Ok(())
    }
}

/// §4.5 step 7: weighted selection by `priority / mean_duration`.
fn pick_weighted(candidates: &[EnsembleSummary]) -> Option<EnsembleSummary> {
    if candidates.is_empty() {
        return None;
    }
    let weights: Vec<f64> = candidates
        .iter()
        .map(|c| {
            let mean_duration = if c.counters.ended == 0 {
                1.0
            } else {
                (c.counters.duration as f64 / c.counters.ended as f64).max(1.0)
            };
            (c.properties.priority.max(0) as f64) / mean_duration
        })
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return candidates.first().cloned();
    }
    let u: f64 = rand::thread_rng().gen_range(0.0..total);
    let mut acc = 0.0;
    for (candidate, weight) in candidates.iter().zip(weights.iter()) {
        acc += weight;
        if u < acc {
            return Some(candidate.clone());
        }
    }
    candidates.last().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Counters, EnsembleProperties, Remaining};

    fn summary(eid: &str, priority: i64, ended: u64, duration: u64) -> EnsembleSummary {
        let mut props = EnsembleProperties::new("alice");
        props.priority = priority;
        EnsembleSummary {
            eid: eid.to_string(),
            properties: props,
            counters: Counters { started: ended, ended, pass: ended, fail: 0, duration },
            runtime: duration as i64,
            remaining: Remaining::NoMax,
        }
    }

    #[test]
    fn pick_weighted_returns_none_for_empty_candidates() {
        assert!(pick_weighted(&[]).is_none());
    }

    #[test]
    fn pick_weighted_always_returns_the_sole_candidate() {
        let candidates = vec![summary("a", 100, 0, 0)];
        for _ in 0..20 {
            assert_eq!(pick_weighted(&candidates).unwrap().eid, "a");
        }
    }

    #[test]
    fn pick_weighted_only_ever_returns_a_listed_candidate() {
        let candidates = vec![summary("a", 100, 10, 100), summary("b", 300, 5, 5)];
        for _ in 0..50 {
            let picked = pick_weighted(&candidates).unwrap();
            assert!(candidates.iter().any(|c| c.eid == picked.eid));
        }
    }

    #[test]
    fn pick_weighted_falls_back_to_first_when_all_priorities_are_zero() {
        let candidates = vec![summary("a", 0, 1, 1), summary("b", 0, 1, 1)];
        let picked = pick_weighted(&candidates).unwrap();
        assert_eq!(picked.eid, "a");
    }
}
