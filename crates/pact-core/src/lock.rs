//! Per-promise lock manager
//!
//! Enforces at-most-one active repair per promise identity across every
//! agent process sharing the `locks` database:
//!
//! - a stable SHA-1 fingerprint identifies each concrete promise
//! - `lock.<fp>` marks an in-progress attempt, `last.<fp>` the time of the
//!   last completion
//! - `ifelapsed` rate-limits re-assessment; `expireafter` lets a waiter
//!   seize a stale lock after gracefully terminating its holder
//! - all multi-step store transactions run inside a distinguished
//!   critical-section lock recovered from crashed holders after 60 s
//!
//! Completions append to a per-host run log rotated above 1 MiB; records
//! older than a four-week horizon are purged on a schedule.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, warn};

use pact_state::{KvStore, LockRecord};

/// Seconds after which lock/last records are eligible for purging.
pub const LOCK_HORIZON_SECS: i64 = 4 * 7 * 24 * 3600;

/// Key of the purge-schedule sentinel record.
const HORIZON_KEY: &[u8] = b"lock_horizon";

/// Key of the critical-section lock record.
const CRITICAL_SECTION_KEY: &str = "critical_section";

/// Seconds a critical-section holder may sit before a waiter seizes it.
const CRITICAL_SECTION_SEIZE_SECS: i64 = 60;

/// Run-log rotation threshold.
const LOG_ROTATE_BYTES: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Process control collaborator
// ---------------------------------------------------------------------------

/// Minimal process-table interface the lock manager needs to reclaim stale
/// locks. The system implementation lives at the OS boundary; tests use a
/// scripted fake.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Whether a process with this pid currently exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Gracefully terminate `pid` (TERM, short grace, then KILL).
    /// Returns true when the process is gone afterwards.
    async fn terminate(&self, pid: u32) -> bool;
}

/// `/proc`-based process control with a TERM→KILL escalation.
pub struct SystemProcesses;

#[async_trait]
impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    async fn terminate(&self, pid: u32) -> bool {
        let _ = tokio::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .await;

        for _ in 0..5 {
            if !self.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let _ = tokio::process::Command::new("kill")
            .args(["-KILL", &pid.to_string()])
            .status()
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        !self.is_alive(pid)
    }
}

// ---------------------------------------------------------------------------
// Fingerprinting
// ---------------------------------------------------------------------------

/// SHA-1 hex digest of arbitrary text, tagged with the algorithm.
pub fn tagged_digest(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    format!("sha1={}", hex::encode(hasher.finalize()))
}

/// Blank date-like substrings so time-varying promiser text does not
/// fragment the lock space. Operates on canonified text (`:` and spaces
/// have already become `_`).
pub fn blank_dates(operand: &str) -> String {
    const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let mut out = operand.to_string();
    let mut saw_day = false;
    let mut saw_month = false;

    for day in DAYS {
        if let Some(pos) = out.find(day) {
            out.replace_range(pos..pos + day.len(), "DAY");
            saw_day = true;
            break;
        }
    }
    for month in MONTHS {
        if let Some(pos) = out.find(month) {
            out.replace_range(pos..pos + month.len(), "MON");
            saw_month = true;
            break;
        }
    }

    if saw_day && saw_month {
        // Both a day and a month name: a full date string. Every digit is
        // time text, and field widths vary (9 vs 09), so the digits are
        // dropped outright rather than masked.
        out.retain(|c| !c.is_ascii_digit());
    } else {
        // Isolated time-of-day and year substrings blank to fixed tokens.
        let time_re = regex::Regex::new(r"\d{2}_\d{2}_\d{2}").unwrap();
        out = time_re.replace_all(&out, "TIME").to_string();
        let year_re = regex::Regex::new(r"(19|20)\d{2}").unwrap();
        out = year_re.replace_all(&out, "YEAR").to_string();
    }

    out
}

/// Identity material for one concrete promise.
#[derive(Debug, Clone)]
pub struct LockSubject {
    pub bundle: String,
    pub promise_type: String,
    pub promiser: String,
    /// `(lval, rendered rval)` pairs of the promise's constraints.
    pub constraints: Vec<(String, String)>,
    pub host: String,
}

impl LockSubject {
    /// Compute the stable 40-hex-char fingerprint.
    ///
    /// The operator combines the promise type, the sorted lock-relevant
    /// constraint l-values (`args` excluded, at most five) and the host;
    /// the operand is the canonified promiser with date text blanked; the
    /// remaining constraint text enters through a sorted digest.
    pub fn fingerprint(&self) -> String {
        let mut lvals: Vec<&str> = self
            .constraints
            .iter()
            .map(|(lval, _)| lval.as_str())
            .filter(|lval| *lval != "args")
            .collect();
        lvals.sort_unstable();
        lvals.dedup();
        lvals.truncate(5);

        let operator = format!("{}.{}-{}", self.promise_type, lvals.join("."), self.host);
        let operand = blank_dates(&crate::classes::canonify(&self.promiser));

        let mut body: Vec<String> = self
            .constraints
            .iter()
            .map(|(lval, rval)| format!("{lval}=>{rval}"))
            .collect();
        body.sort_unstable();
        let digest = tagged_digest(&body.join("\n"));

        let mut hasher = Sha1::new();
        hasher.update(self.bundle.as_bytes());
        hasher.update(b"\n");
        hasher.update(operator.as_bytes());
        hasher.update(b"\n");
        hasher.update(operand.as_bytes());
        hasher.update(b"\n");
        hasher.update(digest.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Acquisition results
// ---------------------------------------------------------------------------

/// A held promise lock, released through [`LockManager::release`].
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub fingerprint: String,
    lock_key: Vec<u8>,
    last_key: Vec<u8>,
    /// True for `-K` dummy locks: nothing to release.
    dummy: bool,
}

/// Outcome of an acquire attempt.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// The caller may proceed and must call `release` afterwards.
    Acquired(LockHandle),
    /// This promise was already attempted in this run.
    Duplicate,
    /// `ifelapsed` minutes have not passed since the last completion
    /// (or another agent completed it after we started).
    RateLimited { elapsed_minutes: i64, ifelapsed: u32 },
    /// A live holder is still working on this promise.
    Busy { holder_pid: u32 },
    /// The stale holder could not be terminated; the promise fails.
    CouldNotExpire { holder_pid: u32 },
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// The lock manager. One per agent process, shared via `Arc`.
pub struct LockManager {
    store: Arc<dyn KvStore>,
    procs: Arc<dyn ProcessControl>,
    /// Fingerprints attempted this run (duplicate suppression).
    done: Mutex<HashSet<String>>,
    /// The lock currently held, for exit cleanup.
    current: Mutex<Option<LockHandle>>,
    /// In-process half of the critical section.
    critical: tokio::sync::Mutex<()>,
    self_pid: u32,
    log_path: PathBuf,
    bypass: bool,
}

impl LockManager {
    /// `bypass` corresponds to the `-K` flag: every acquire succeeds with a
    /// dummy lock and no store traffic.
    pub fn new(
        store: Arc<dyn KvStore>,
        procs: Arc<dyn ProcessControl>,
        host: &str,
        log_dir: &std::path::Path,
        bypass: bool,
    ) -> Self {
        Self {
            store,
            procs,
            done: Mutex::new(HashSet::new()),
            current: Mutex::new(None),
            critical: tokio::sync::Mutex::new(()),
            self_pid: std::process::id(),
            log_path: log_dir.join(format!("promise.{host}.runlog")),
            bypass,
        }
    }

    async fn read_record(&self, key: &[u8]) -> Option<LockRecord> {
        match self.store.get(key).await {
            Ok(Some(bytes)) => LockRecord::from_bytes(&bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "Lock store unavailable; treating record as absent");
                None
            }
        }
    }

    async fn write_record(&self, key: &[u8], record: LockRecord) {
        if let Err(err) = self.store.put(key, &record.to_bytes()).await {
            warn!(error = %err, "Lock store unavailable; lock record dropped");
        }
    }

    // -- critical section ---------------------------------------------------

    /// Serialise multi-step store transactions across processes. A holder
    /// older than 60 s is presumed crashed and its section is seized.
    /// The clock is re-read on every poll so a crashed holder's record
    /// ages out even while we wait.
    async fn wait_for_critical_section(&self, now: i64) {
        loop {
            let wall = chrono::Utc::now().timestamp().max(now);
            match self.read_record(CRITICAL_SECTION_KEY.as_bytes()).await {
                Some(rec) if wall - rec.time < CRITICAL_SECTION_SEIZE_SECS => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Some(rec) => {
                    warn!(
                        holder_pid = rec.pid,
                        held_secs = wall - rec.time,
                        "Seizing critical section from stalled holder"
                    );
                    break;
                }
                None => break,
            }
        }
        self.write_record(
            CRITICAL_SECTION_KEY.as_bytes(),
            LockRecord::new(self.self_pid, now),
        )
        .await;
    }

    async fn release_critical_section(&self) {
        if let Err(err) = self.store.delete(CRITICAL_SECTION_KEY.as_bytes()).await {
            warn!(error = %err, "Lock store unavailable; critical section record left behind");
        }
    }

    // -- acquire / release --------------------------------------------------

    /// Attempt to acquire the lock for `subject` at time `now`.
    pub async fn acquire(
        &self,
        subject: &LockSubject,
        ifelapsed: u32,
        expireafter: u32,
        now: i64,
    ) -> AcquireOutcome {
        let fingerprint = subject.fingerprint();

        {
            let mut done = self.done.lock().unwrap();
            if !done.insert(fingerprint.clone()) {
                debug!(fingerprint = %fingerprint, "This promise has already been verified");
                return AcquireOutcome::Duplicate;
            }
        }

        let lock_key = format!("lock.{fingerprint}").into_bytes();
        let last_key = format!("last.{fingerprint}").into_bytes();
        let handle = LockHandle {
            fingerprint: fingerprint.clone(),
            lock_key: lock_key.clone(),
            last_key: last_key.clone(),
            dummy: self.bypass,
        };

        if self.bypass {
            return AcquireOutcome::Acquired(handle);
        }

        let _guard = self.critical.lock().await;
        self.wait_for_critical_section(now).await;

        // Last completion time; an absent record is initialised so that a
        // deadlock loop cannot survive ifelapsed longer than the schedule.
        let last_completed = match self.read_record(&last_key).await {
            Some(rec) => rec.time,
            None => {
                self.write_record(&last_key, LockRecord::new(self.self_pid, now))
                    .await;
                0
            }
        };
        let elapsed_minutes = (now - last_completed) / 60;

        if elapsed_minutes < 0 {
            debug!(
                fingerprint = %fingerprint,
                elapsed_minutes,
                "Another agent seems to have done this since we started"
            );
            self.release_critical_section().await;
            return AcquireOutcome::RateLimited {
                elapsed_minutes,
                ifelapsed,
            };
        }

        if elapsed_minutes < i64::from(ifelapsed) {
            debug!(
                fingerprint = %fingerprint,
                elapsed_minutes,
                ifelapsed,
                "Nothing promised here yet"
            );
            self.release_critical_section().await;
            return AcquireOutcome::RateLimited {
                elapsed_minutes,
                ifelapsed,
            };
        }

        if let Some(existing) = self.read_record(&lock_key).await {
            let held_minutes = (now - existing.time) / 60;
            if held_minutes >= i64::from(expireafter) {
                info!(
                    fingerprint = %fingerprint,
                    held_minutes,
                    expireafter,
                    holder_pid = existing.pid,
                    "Lock expired"
                );
                let holder_gone = if self.procs.is_alive(existing.pid) {
                    info!(holder_pid = existing.pid, "Trying to kill expired process");
                    self.procs.terminate(existing.pid).await
                } else {
                    true
                };

                if holder_gone {
                    self.log_completion(existing.pid, "stale lock recovered", &fingerprint);
                    if let Err(err) = self.store.delete(&lock_key).await {
                        warn!(error = %err, "Unable to delete stale lock record");
                    }
                } else {
                    error!(
                        fingerprint = %fingerprint,
                        holder_pid = existing.pid,
                        "Unable to kill expired process holding lock"
                    );
                    self.release_critical_section().await;
                    return AcquireOutcome::CouldNotExpire {
                        holder_pid: existing.pid,
                    };
                }
            } else {
                debug!(
                    fingerprint = %fingerprint,
                    holder_pid = existing.pid,
                    "Couldn't obtain lock (already running)"
                );
                self.release_critical_section().await;
                return AcquireOutcome::Busy {
                    holder_pid: existing.pid,
                };
            }
        }

        self.write_record(&lock_key, LockRecord::new(self.self_pid, now))
            .await;
        self.release_critical_section().await;

        *self.current.lock().unwrap() = Some(handle.clone());
        AcquireOutcome::Acquired(handle)
    }

    /// Release a held lock: drop the in-progress record, stamp the
    /// completion time, and append to the run log.
    pub async fn release(&self, handle: LockHandle, now: i64) {
        if handle.dummy {
            return;
        }

        if let Err(err) = self.store.delete(&handle.lock_key).await {
            warn!(fingerprint = %handle.fingerprint, error = %err, "Unable to remove lock record");
        }
        self.write_record(&handle.last_key, LockRecord::new(self.self_pid, now))
            .await;

        let mut current = self.current.lock().unwrap();
        if current
            .as_ref()
            .is_some_and(|c| c.fingerprint == handle.fingerprint)
        {
            *current = None;
        }
        drop(current);

        self.log_completion(self.self_pid, "lock removed normally", &handle.fingerprint);
    }

    /// Exit-path cleanup: drop the currently-held lock record, if any,
    /// without stamping a completion.
    pub async fn cleanup(&self) {
        let held = self.current.lock().unwrap().take();
        if let Some(handle) = held {
            warn!(fingerprint = %handle.fingerprint, "Releasing held lock on exit");
            if let Err(err) = self.store.delete(&handle.lock_key).await {
                warn!(error = %err, "Unable to remove held lock on exit");
            }
        }
    }

    /// Rewrite `last.<fp>` to the epoch so the next attempt skips the
    /// `ifelapsed` gate. Used after a deliberate failure.
    pub async fn invalidate(&self, fingerprint: &str) {
        let last_key = format!("last.{fingerprint}").into_bytes();
        match self.read_record(&last_key).await {
            Some(mut rec) => {
                rec.time = 0;
                self.write_record(&last_key, rec).await;
            }
            None => debug!(fingerprint = %fingerprint, "Nothing to invalidate"),
        }
    }

    /// Simple time-gated lock for ad-hoc rate limits (schedule-driven
    /// maintenance). Returns true when the gate opens.
    pub async fn acquire_by_id(&self, lock_id: &str, acquire_after_minutes: u32, now: i64) -> bool {
        let key = lock_id.as_bytes();
        let open = match self.read_record(key).await {
            Some(rec) => rec.time + i64::from(acquire_after_minutes) * 60 < now,
            None => true,
        };
        if open {
            self.write_record(key, LockRecord::new(self.self_pid, now)).await;
        }
        open
    }

    /// Purge lock/last records older than the four-week horizon. Runs at
    /// most once per horizon, gated by the `lock_horizon` sentinel.
    pub async fn purge(&self, now: i64) {
        if let Some(horizon) = self.read_record(HORIZON_KEY).await {
            if now - horizon.time < LOCK_HORIZON_SECS {
                debug!("No lock purging scheduled");
                return;
            }
        }

        info!("Looking for stale locks to purge");
        let result = self
            .store
            .retain(&move |key: &[u8], value: &[u8]| {
                if key == HORIZON_KEY {
                    return true;
                }
                match LockRecord::from_bytes(value) {
                    Ok(rec) => now - rec.time <= LOCK_HORIZON_SECS,
                    Err(_) => false,
                }
            })
            .await;

        match result {
            Ok(deleted) => info!(deleted, "Purged stale lock records"),
            Err(err) => warn!(error = %err, "Lock purge failed"),
        }

        self.write_record(HORIZON_KEY, LockRecord::new(0, now)).await;
    }

    // -- run log ------------------------------------------------------------

    fn log_completion(&self, pid: u32, message: &str, fingerprint: &str) {
        use std::io::Write;

        let line = format!(
            "{}:{}:pid={}:{}\n",
            chrono::Utc::now().to_rfc3339(),
            message,
            pid,
            fingerprint
        );
        let open = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path);
        match open {
            Ok(mut file) => {
                if let Err(err) = file.write_all(line.as_bytes()) {
                    error!(path = %self.log_path.display(), error = %err, "Can't write lock run log");
                }
            }
            Err(err) => {
                debug!(path = %self.log_path.display(), error = %err, "Can't open lock run log");
                return;
            }
        }

        if let Ok(meta) = std::fs::metadata(&self.log_path) {
            if meta.len() > LOG_ROTATE_BYTES {
                info!(path = %self.log_path.display(), "Rotating lock run log");
                let rotated = self.log_path.with_extension("runlog.1");
                let _ = std::fs::rename(&self.log_path, rotated);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pact_state::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted process table: one pid may be alive, and termination
    /// succeeds or fails per configuration.
    struct FakeProcesses {
        alive_pid: Option<u32>,
        kill_succeeds: bool,
        terminated: AtomicBool,
    }

    #[async_trait]
    impl ProcessControl for FakeProcesses {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive_pid == Some(pid) && !self.terminated.load(Ordering::SeqCst)
        }

        async fn terminate(&self, _pid: u32) -> bool {
            if self.kill_succeeds {
                self.terminated.store(true, Ordering::SeqCst);
            }
            self.kill_succeeds
        }
    }

    fn manager_with(
        store: Arc<dyn KvStore>,
        procs: FakeProcesses,
        dir: &std::path::Path,
    ) -> LockManager {
        LockManager::new(store, Arc::new(procs), "testhost", dir, false)
    }

    fn no_procs() -> FakeProcesses {
        FakeProcesses {
            alive_pid: None,
            kill_succeeds: true,
            terminated: AtomicBool::new(false),
        }
    }

    fn subject(promiser: &str) -> LockSubject {
        LockSubject {
            bundle: "main".into(),
            promise_type: "files".into(),
            promiser: promiser.into(),
            constraints: vec![
                ("create".into(), "true".into()),
                ("mode".into(), "0644".into()),
            ],
            host: "testhost".into(),
        }
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_fingerprint_is_40_hex() {
        let fp = subject("/etc/motd").fingerprint();
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_stable_across_constraint_order() {
        let mut reordered = subject("/etc/motd");
        reordered.constraints.reverse();
        assert_eq!(subject("/etc/motd").fingerprint(), reordered.fingerprint());
    }

    #[test]
    fn test_fingerprint_stable_across_date_text() {
        let a = subject("/logs/report Mon Jan 15 15:15:23 2010");
        let b = subject("/logs/report Tue Feb 9 09:10:11 2011");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_promisers() {
        assert_ne!(
            subject("/etc/motd").fingerprint(),
            subject("/etc/hosts").fingerprint()
        );
    }

    #[test]
    fn test_blank_dates_leaves_plain_text_alone() {
        assert_eq!(blank_dates("var_log_messages"), "var_log_messages");
    }

    #[test]
    fn test_blank_dates_masks_isolated_time_and_year() {
        assert_eq!(blank_dates("backup_02_30_00"), "backup_TIME");
        assert_eq!(blank_dates("report_2010"), "report_YEAR");
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mgr = manager_with(store.clone(), no_procs(), dir.path());

        let outcome = mgr.acquire(&subject("/etc/motd"), 1, 120, NOW).await;
        let handle = match outcome {
            AcquireOutcome::Acquired(handle) => handle,
            other => panic!("expected Acquired, got {other:?}"),
        };

        let lock_key = format!("lock.{}", handle.fingerprint).into_bytes();
        assert!(store.has(&lock_key).await.unwrap());

        mgr.release(handle.clone(), NOW + 30).await;
        assert!(!store.has(&lock_key).await.unwrap());

        let last_key = format!("last.{}", handle.fingerprint).into_bytes();
        let last = LockRecord::from_bytes(&store.get(&last_key).await.unwrap().unwrap()).unwrap();
        assert_eq!(last.time, NOW + 30);
    }

    #[tokio::test]
    async fn test_duplicate_within_one_run() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mgr = manager_with(store, no_procs(), dir.path());

        let first = mgr.acquire(&subject("/etc/motd"), 1, 120, NOW).await;
        assert!(matches!(first, AcquireOutcome::Acquired(_)));
        let second = mgr.acquire(&subject("/etc/motd"), 1, 120, NOW).await;
        assert!(matches!(second, AcquireOutcome::Duplicate));
    }

    #[tokio::test]
    async fn test_ifelapsed_rate_limits_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

        // First run completes at NOW.
        let mgr1 = manager_with(store.clone(), no_procs(), dir.path());
        match mgr1.acquire(&subject("/etc/motd"), 10, 120, NOW).await {
            AcquireOutcome::Acquired(handle) => mgr1.release(handle, NOW).await,
            other => panic!("expected Acquired, got {other:?}"),
        }

        // Second run, 3 minutes later, with ifelapsed = 10: rejected.
        let mgr2 = manager_with(store, no_procs(), dir.path());
        let outcome = mgr2.acquire(&subject("/etc/motd"), 10, 120, NOW + 180).await;
        match outcome {
            AcquireOutcome::RateLimited {
                elapsed_minutes,
                ifelapsed,
            } => {
                assert_eq!(elapsed_minutes, 3);
                assert_eq!(ifelapsed, 10);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_busy_when_live_holder_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let subj = subject("/etc/motd");
        let fp = subj.fingerprint();

        // A live holder wrote the lock 10 minutes ago.
        store
            .put(
                format!("lock.{fp}").as_bytes(),
                &LockRecord::new(4444, NOW - 600).to_bytes(),
            )
            .await
            .unwrap();

        let procs = FakeProcesses {
            alive_pid: Some(4444),
            kill_succeeds: true,
            terminated: AtomicBool::new(false),
        };
        let mgr = manager_with(store, procs, dir.path());
        let outcome = mgr.acquire(&subj, 0, 120, NOW).await;
        assert!(matches!(outcome, AcquireOutcome::Busy { holder_pid: 4444 }));
    }

    #[tokio::test]
    async fn test_stale_lock_with_dead_holder_is_seized() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let subj = subject("/etc/motd");
        let fp = subj.fingerprint();

        // Holder pid 9999 is absent; lock is two hours old, expireafter 60.
        store
            .put(
                format!("lock.{fp}").as_bytes(),
                &LockRecord::new(9999, NOW - 7200).to_bytes(),
            )
            .await
            .unwrap();

        let mgr = manager_with(store.clone(), no_procs(), dir.path());
        let outcome = mgr.acquire(&subj, 0, 60, NOW).await;
        let handle = match outcome {
            AcquireOutcome::Acquired(handle) => handle,
            other => panic!("expected Acquired, got {other:?}"),
        };

        // The lock record now carries our pid.
        let rec = LockRecord::from_bytes(
            &store
                .get(format!("lock.{fp}").as_bytes())
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(rec.pid, std::process::id());

        // And the run log mentions the stale recovery.
        let log = std::fs::read_to_string(dir.path().join("promise.testhost.runlog")).unwrap();
        assert!(log.contains("stale lock recovered"));

        mgr.release(handle, NOW).await;
    }

    #[tokio::test]
    async fn test_stale_lock_with_unkillable_holder_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let subj = subject("/etc/motd");
        let fp = subj.fingerprint();

        store
            .put(
                format!("lock.{fp}").as_bytes(),
                &LockRecord::new(5555, NOW - 7200).to_bytes(),
            )
            .await
            .unwrap();

        let procs = FakeProcesses {
            alive_pid: Some(5555),
            kill_succeeds: false,
            terminated: AtomicBool::new(false),
        };
        let mgr = manager_with(store, procs, dir.path());
        let outcome = mgr.acquire(&subj, 0, 60, NOW).await;
        assert!(matches!(
            outcome,
            AcquireOutcome::CouldNotExpire { holder_pid: 5555 }
        ));
    }

    #[tokio::test]
    async fn test_invalidate_resets_ifelapsed_gate() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

        let mgr = manager_with(store.clone(), no_procs(), dir.path());
        let subj = subject("/etc/motd");
        match mgr.acquire(&subj, 60, 120, NOW).await {
            AcquireOutcome::Acquired(handle) => mgr.release(handle, NOW).await,
            other => panic!("expected Acquired, got {other:?}"),
        }

        let fp = subj.fingerprint();
        mgr.invalidate(&fp).await;

        // Despite ifelapsed = 60, a fresh run one minute later acquires.
        let mgr2 = manager_with(store, no_procs(), dir.path());
        let outcome = mgr2.acquire(&subj, 60, 120, NOW + 60).await;
        assert!(matches!(outcome, AcquireOutcome::Acquired(_)));
    }

    #[tokio::test]
    async fn test_bypass_returns_dummy_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mgr = LockManager::new(
            store.clone(),
            Arc::new(no_procs()),
            "testhost",
            dir.path(),
            true,
        );

        let outcome = mgr.acquire(&subject("/etc/motd"), 60, 120, NOW).await;
        let handle = match outcome {
            AcquireOutcome::Acquired(handle) => handle,
            other => panic!("expected Acquired, got {other:?}"),
        };
        // No store traffic for dummy locks.
        assert!(store.scan().await.unwrap().is_empty());
        mgr.release(handle, NOW).await;
        assert!(store.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_honours_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

        let fresh = LockRecord::new(1, NOW - 3600);
        let ancient = LockRecord::new(1, NOW - LOCK_HORIZON_SECS - 3600);
        store.put(b"last.fresh", &fresh.to_bytes()).await.unwrap();
        store.put(b"last.ancient", &ancient.to_bytes()).await.unwrap();

        let mgr = manager_with(store.clone(), no_procs(), dir.path());
        mgr.purge(NOW).await;

        assert!(store.has(b"last.fresh").await.unwrap());
        assert!(!store.has(b"last.ancient").await.unwrap());
        assert!(store.has(HORIZON_KEY).await.unwrap());

        // A second purge inside the horizon window is a no-op even for
        // newly ancient entries.
        store.put(b"last.ancient", &ancient.to_bytes()).await.unwrap();
        mgr.purge(NOW + 60).await;
        assert!(store.has(b"last.ancient").await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_by_id_time_gate() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mgr = manager_with(store, no_procs(), dir.path());

        assert!(mgr.acquire_by_id("maintenance", 10, NOW).await);
        assert!(!mgr.acquire_by_id("maintenance", 10, NOW + 60).await);
        assert!(mgr.acquire_by_id("maintenance", 10, NOW + 601).await);
    }
}
