//! Promise-result audit sink
//!
//! Every actuator reports exactly one terminal outcome per concrete promise
//! iteration through this module. The sink:
//!
//! - suppresses duplicate terminal records by promise fingerprint
//! - keeps the in-memory trail and per-outcome tallies for the run summary
//! - routes `log_string` to the configured per-outcome file or the system
//!   logger at the configured priority
//!
//! Outcome aggregation is a monotonic fold: `failed` absorbs, and
//! `interrupted`/`timeout` dominate everything.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pact_state::KvStore;

use crate::attrs::{ClassesAttrs, TransactionAttrs};
use crate::classes::ClassStore;
use crate::policy::Origin;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal outcome of one concrete promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Nothing to assess (skipped, rate-limited, lock busy).
    Noop,
    /// The promise was already satisfied.
    Kept,
    /// The promise was repaired.
    Repaired,
    /// Drift detected but action policy forbids repair.
    Warn,
    /// Repair was attempted and did not converge.
    Failed,
    /// Repair was refused (permissions, policy).
    Denied,
    /// The actuator exceeded its time budget.
    Timeout,
    /// The run was interrupted mid-repair.
    Interrupted,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Noop => "noop",
            Outcome::Kept => "kept",
            Outcome::Repaired => "repaired",
            Outcome::Warn => "warn",
            Outcome::Failed => "failed",
            Outcome::Denied => "denied",
            Outcome::Timeout => "timeout",
            Outcome::Interrupted => "interrupted",
        }
    }

    /// True for outcomes that mean the promise is in its desired state.
    pub fn is_converged(self) -> bool {
        matches!(self, Outcome::Kept | Outcome::Repaired)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Monotonic fold used by compound actuators and iteration aggregation.
pub fn fold(a: Outcome, b: Outcome) -> Outcome {
    use Outcome::*;
    match (a, b) {
        (Interrupted, _) | (_, Interrupted) => Interrupted,
        (Timeout, _) | (_, Timeout) => Timeout,
        (Failed, _) | (_, Failed) => Failed,
        (Denied, _) | (_, Denied) => Denied,
        (Warn, _) | (_, Warn) => Warn,
        (Repaired, _) | (_, Repaired) => Repaired,
        (Kept, _) | (_, Kept) => Kept,
        (Noop, Noop) => Noop,
    }
}

/// Fold a whole sequence, starting from `Noop`.
pub fn fold_all(outcomes: impl IntoIterator<Item = Outcome>) -> Outcome {
    outcomes.into_iter().fold(Outcome::Noop, fold)
}

// ---------------------------------------------------------------------------
// Records and sink
// ---------------------------------------------------------------------------

/// One terminal audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: i64,
    pub bundle: String,
    pub handle: Option<String>,
    pub promiser: String,
    pub promise_type: String,
    pub outcome: Outcome,
    pub message: String,
    pub origin: Origin,
}

/// Per-outcome tallies for the end-of-run summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSummary {
    pub kept: usize,
    pub repaired: usize,
    pub failed: usize,
    pub denied: usize,
    pub timeout: usize,
    pub warned: usize,
    pub interrupted: usize,
    pub noop: usize,
}

impl AuditSummary {
    pub fn total(&self) -> usize {
        self.kept
            + self.repaired
            + self.failed
            + self.denied
            + self.timeout
            + self.warned
            + self.interrupted
            + self.noop
    }
}

/// The audit sink. Internally serialised; shared by value via `Arc`.
pub struct AuditSink {
    run_id: String,
    seen: Mutex<HashSet<String>>,
    records: Mutex<Vec<AuditRecord>>,
    summary: Mutex<AuditSummary>,
}

impl Default for AuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            seen: Mutex::new(HashSet::new()),
            records: Mutex::new(Vec::new()),
            summary: Mutex::new(AuditSummary::default()),
        }
    }

    /// This agent run's identifier (tags every emitted log line).
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Record a terminal outcome for the promise identified by
    /// `fingerprint`. Returns `false` when a terminal record for that
    /// fingerprint was already emitted (duplicate suppressed).
    pub fn record(&self, fingerprint: &str, record: AuditRecord) -> bool {
        {
            let mut seen = self.seen.lock().unwrap();
            if !seen.insert(fingerprint.to_string()) {
                debug!(
                    promiser = %record.promiser,
                    outcome = %record.outcome,
                    "Duplicate terminal record suppressed"
                );
                return false;
            }
        }

        match record.outcome {
            Outcome::Failed | Outcome::Denied | Outcome::Timeout | Outcome::Interrupted => {
                error!(
                    run_id = %self.run_id,
                    bundle = %record.bundle,
                    promiser = %record.promiser,
                    outcome = %record.outcome,
                    origin = %record.origin,
                    "{}",
                    record.message
                );
            }
            Outcome::Warn => {
                warn!(
                    run_id = %self.run_id,
                    bundle = %record.bundle,
                    promiser = %record.promiser,
                    "{}",
                    record.message
                );
            }
            Outcome::Repaired => {
                info!(
                    run_id = %self.run_id,
                    bundle = %record.bundle,
                    promiser = %record.promiser,
                    "{}",
                    record.message
                );
            }
            Outcome::Kept | Outcome::Noop => {
                debug!(
                    run_id = %self.run_id,
                    bundle = %record.bundle,
                    promiser = %record.promiser,
                    "{}",
                    record.message
                );
            }
        }

        {
            let mut summary = self.summary.lock().unwrap();
            match record.outcome {
                Outcome::Kept => summary.kept += 1,
                Outcome::Repaired => summary.repaired += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Denied => summary.denied += 1,
                Outcome::Timeout => summary.timeout += 1,
                Outcome::Warn => summary.warned += 1,
                Outcome::Interrupted => summary.interrupted += 1,
                Outcome::Noop => summary.noop += 1,
            }
        }

        self.records.lock().unwrap().push(record);
        true
    }

    /// Snapshot of all records so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn summary(&self) -> AuditSummary {
        self.summary.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Outcome side-effects
// ---------------------------------------------------------------------------

/// Define and cancel the user-configured outcome classes for `outcome`.
///
/// Defined classes are global; with `persist_time > 0` they are also saved
/// to the state store under the configured timer policy.
pub async fn apply_outcome_classes(
    outcome: Outcome,
    attrs: &ClassesAttrs,
    classes: &mut ClassStore,
    state: &Arc<dyn KvStore>,
    ns: &str,
) {
    let (define, cancel): (&[String], &[String]) = match outcome {
        Outcome::Kept => (&attrs.promise_kept, &attrs.cancel_kept),
        Outcome::Repaired => (&attrs.promise_repaired, &attrs.cancel_repaired),
        Outcome::Failed => (&attrs.repair_failed, &attrs.cancel_notkept),
        Outcome::Denied => (&attrs.repair_denied, &attrs.cancel_notkept),
        Outcome::Timeout | Outcome::Interrupted => (&attrs.repair_timeout, &attrs.cancel_notkept),
        Outcome::Warn | Outcome::Noop => (&[], &[]),
    };

    for name in define {
        if classes.is_hard(name) {
            error!(class = %name, "Cannot use a reserved hard class as a post-condition class");
            continue;
        }
        if attrs.persist_time > 0 {
            info!(class = %name, minutes = attrs.persist_time, "Defining persistent promise result class");
            classes
                .persist(state, name, ns, attrs.persist_time, attrs.timer_policy)
                .await;
        }
        classes.add_soft(name, ns);
    }

    for name in cancel {
        if classes.is_hard(name) {
            error!(class = %name, "Cannot cancel a reserved hard class");
            continue;
        }
        info!(class = %name, "Cancelling class");
        classes.delete_persistent(state, name).await;
        classes.remove(name);
    }
}

/// Route an expanded `log_string` according to the transaction attributes:
/// a per-outcome file when configured, the system logger otherwise.
pub fn route_log(attrs: &TransactionAttrs, outcome: Outcome, message: &str) {
    let path = match outcome {
        Outcome::Kept => attrs.log_kept.as_deref(),
        Outcome::Repaired => attrs.log_repaired.as_deref(),
        Outcome::Failed | Outcome::Denied | Outcome::Timeout | Outcome::Interrupted => {
            attrs.log_failed.as_deref()
        }
        Outcome::Warn | Outcome::Noop => None,
    };

    match path {
        Some(path) => {
            let line = format!("{} {}\n", Utc::now().to_rfc3339(), message);
            if let Err(err) = append_line(std::path::Path::new(path), &line) {
                error!(path = %path, error = %err, "Cannot open promise log file");
            }
        }
        None => match attrs.log_priority.as_deref() {
            Some("emergency") | Some("alert") | Some("critical") | Some("error") => {
                error!(target: "pact::promise_log", "{message}")
            }
            Some("warning") | Some("notice") => warn!(target: "pact::promise_log", "{message}"),
            Some("debug") => debug!(target: "pact::promise_log", "{message}"),
            _ => info!(target: "pact::promise_log", "{message}"),
        },
    }
}

fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

// ---------------------------------------------------------------------------
// Performance moments
// ---------------------------------------------------------------------------

/// Rolling performance moments for one measured event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PerformanceMoments {
    /// Time of last sample.
    pub t: i64,
    /// Last sampled duration (seconds).
    pub q: f64,
    /// Change since previous sample.
    pub dq: f64,
    /// Geometric running mean.
    pub expect: f64,
    /// Geometric running variance.
    pub var: f64,
}

/// Blend weight for the rolling moments.
const FORGETRATE: f64 = 0.7;

/// Record a duration sample for `event` into the performance store.
pub async fn note_performance(store: &Arc<dyn KvStore>, event: &str, now: i64, seconds: f64) {
    let previous = match store.get(event.as_bytes()).await {
        Ok(Some(bytes)) => serde_json::from_slice::<PerformanceMoments>(&bytes).unwrap_or_default(),
        Ok(None) => PerformanceMoments::default(),
        Err(err) => {
            warn!(event = %event, error = %err, "Performance store unavailable; sample dropped");
            return;
        }
    };

    let expect = seconds * (1.0 - FORGETRATE) + previous.expect * FORGETRATE;
    let dev = (seconds - expect) * (seconds - expect);
    let moments = PerformanceMoments {
        t: now,
        q: seconds,
        dq: seconds - previous.q,
        expect,
        var: dev * (1.0 - FORGETRATE) + previous.var * FORGETRATE,
    };

    let bytes = serde_json::to_vec(&moments).expect("performance moments serialize");
    if let Err(err) = store.put(event.as_bytes(), &bytes).await {
        warn!(event = %event, error = %err, "Performance store unavailable; sample dropped");
    }
    debug!(event = %event, q = seconds, expect = moments.expect, "Performance sample recorded");
}
