//! Typed shapes for what the KV store treats as opaque bytes: ensemble
//! properties, counters, and the small derived-fields view the registry's
//! read path computes (§4.2 "properties derivation", §9 "dynamic
//! properties dict").

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// The known property set (§3), plus an extension map for anything else a
/// caller sets — those are still forwarded to children as `JOSHUA_<NAME>`
/// but the registry never interprets them itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnsembleProperties {
    pub username: String,
    pub submitted: i64,
    pub compressed: bool,
    pub priority: i64,
    pub timeout: Option<u64>,
    pub fail_fast: u64,
    pub max_runs: u64,
    pub test_command: String,
    pub timeout_command: String,
    pub env: Option<String>,
    pub stopped: Option<i64>,
    pub runtime: Option<i64>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl EnsembleProperties {
    pub fn new(username: impl Into<String>) -> Self {
        EnsembleProperties {
            username: username.into(),
            submitted: now_unix(),
            compressed: false,
            priority: 100,
            timeout: None,
            fail_fast: 0,
            max_runs: 0,
            test_command: "./joshua_test".to_string(),
            timeout_command: "./joshua_timeout".to_string(),
            env: None,
            stopped: None,
            runtime: None,
            extra: BTreeMap::new(),
        }
    }

    /// Every property as a `(JOSHUA_<NAME>, value)` pair, for the child
    /// process environment (§6 "Child process contract").
    pub fn to_env_pairs(&self) -> Vec<(String, String)> {
        let mut out = vec![
            ("JOSHUA_USERNAME".to_string(), self.username.clone()),
            ("JOSHUA_SUBMITTED".to_string(), self.submitted.to_string()),
            ("JOSHUA_COMPRESSED".to_string(), self.compressed.to_string()),
            ("JOSHUA_PRIORITY".to_string(), self.priority.to_string()),
            ("JOSHUA_FAIL_FAST".to_string(), self.fail_fast.to_string()),
            ("JOSHUA_MAX_RUNS".to_string(), self.max_runs.to_string()),
            ("JOSHUA_TEST_COMMAND".to_string(), self.test_command.clone()),
            (
                "JOSHUA_TIMEOUT_COMMAND".to_string(),
                self.timeout_command.clone(),
            ),
        ];
        if let Some(t) = self.timeout {
            out.push(("JOSHUA_TIMEOUT".to_string(), t.to_string()));
        }
        if let Some(e) = &self.env {
            out.push(("JOSHUA_ENV".to_string(), e.clone()));
        }
        for (k, v) in &self.extra {
            out.push((format!("JOSHUA_{}", k.to_uppercase()), v.clone()));
        }
        out
    }

    /// Parse the `env=K=V:K=V` colon-joined property into pairs that get
    /// added to the child's environment verbatim (no `JOSHUA_` prefix).
    pub fn parsed_env_overrides(&self) -> Vec<(String, String)> {
        let Some(raw) = &self.env else {
            return Vec::new();
        };
        raw.split(':')
            .filter(|s| !s.is_empty())
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// The atomic-add counters every ensemble carries (§3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counters {
    pub started: u64,
    pub ended: u64,
    pub pass: u64,
    pub fail: u64,
    pub duration: u64,
}

/// The read-path view the registry hands back for `list_active` /
/// `list_sanity` / `list_all`: raw properties and counters, plus the two
/// derived fields from §4.2.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnsembleSummary {
    pub eid: String,
    pub properties: EnsembleProperties,
    pub counters: Counters,
    pub runtime: i64,
    pub remaining: Remaining,
}

/// `remaining` as derived in §4.2 — kept as an enum rather than a string
/// so callers don't have to parse it back out, while `Display` renders
/// the same string forms a caller would otherwise compute by hand.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum Remaining {
    Stopped,
    NotStarted,
    NoMax,
    Stopping,
    Seconds(i64),
}

impl std::fmt::Display for Remaining {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remaining::Stopped => write!(f, "0"),
            Remaining::NotStarted => write!(f, "not_started"),
            Remaining::NoMax => write!(f, "no_max"),
            Remaining::Stopping => write!(f, "stopping"),
            Remaining::Seconds(s) => write!(f, "{s}"),
        }
    }
}

pub fn derive_runtime(properties: &EnsembleProperties) -> i64 {
    properties
        .runtime
        .unwrap_or_else(|| now_unix() - properties.submitted)
}

pub fn derive_remaining(properties: &EnsembleProperties, counters: &Counters, runtime: i64) -> Remaining {
    if properties.stopped.is_some() {
        return Remaining::Stopped;
    }
    if counters.ended == 0 {
        return Remaining::NotStarted;
    }
    if properties.max_runs == 0 {
        return Remaining::NoMax;
    }
    if counters.ended >= properties.max_runs {
        return Remaining::Stopping;
    }
    let remaining = (runtime as i128 * (properties.max_runs as i128 - counters.ended as i128))
        / counters.ended.max(1) as i128;
    Remaining::Seconds(remaining as i64)
}

pub fn decode_i64(bytes: &[u8]) -> i64 {
    let mut arr = [0u8; 8];
    let n = bytes.len().min(8);
    arr[..n].copy_from_slice(&bytes[..n]);
    i64::from_le_bytes(arr)
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_not_started_before_any_run_ends() {
        let props = EnsembleProperties::new("alice");
        let counters = Counters::default();
        let runtime = derive_runtime(&props);
        assert_eq!(derive_remaining(&props, &counters, runtime), Remaining::NotStarted);
    }

    #[test]
    fn remaining_stopped_once_stopped_is_set() {
        let mut props = EnsembleProperties::new("alice");
        props.stopped = Some(now_unix());
        let counters = Counters { started: 3, ended: 3, pass: 3, fail: 0, duration: 9 };
        assert_eq!(derive_remaining(&props, &counters, 9), Remaining::Stopped);
    }

    #[test]
    fn remaining_no_max_when_max_runs_unset() {
        let props = EnsembleProperties::new("alice");
        let counters = Counters { started: 5, ended: 5, pass: 5, fail: 0, duration: 20 };
        assert_eq!(derive_remaining(&props, &counters, 20), Remaining::NoMax);
    }

    #[test]
    fn remaining_stopping_once_ended_reaches_max_runs() {
        let mut props = EnsembleProperties::new("alice");
        props.max_runs = 5;
        let counters = Counters { started: 5, ended: 5, pass: 5, fail: 0, duration: 20 };
        assert_eq!(derive_remaining(&props, &counters, 20), Remaining::Stopping);
    }

    #[test]
    fn remaining_computes_eta_from_mean_duration() {
        let mut props = EnsembleProperties::new("alice");
        props.max_runs = 10;
        let counters = Counters { started: 4, ended: 4, pass: 4, fail: 0, duration: 20 };
        // mean duration = 5s/run, 6 runs left => 30s
        assert_eq!(derive_remaining(&props, &counters, 20), Remaining::Seconds(30));
    }

    #[test]
    fn env_pairs_include_joshua_prefix_and_extras() {
        let mut props = EnsembleProperties::new("bob");
        props.extra.insert("custom_flag".to_string(), "1".to_string());
        let pairs = props.to_env_pairs();
        assert!(pairs.contains(&("JOSHUA_USERNAME".to_string(), "bob".to_string())));
        assert!(pairs.contains(&("JOSHUA_CUSTOM_FLAG".to_string(), "1".to_string())));
    }

    #[test]
    fn parsed_env_overrides_splits_colon_joined_pairs() {
        let mut props = EnsembleProperties::new("bob");
        props.env = Some("FOO=1:BAR=baz".to_string());
        let pairs = props.parsed_env_overrides();
        assert_eq!(
            pairs,
            vec![
                ("FOO".to_string(), "1".to_string()),
                ("BAR".to_string(), "baz".to_string())
            ]
        );
    }
}
