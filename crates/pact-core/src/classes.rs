//! Class (context) store
//!
//! The authoritative set of boolean facts currently defined about the host,
//! split into partitions:
//!
//! - *hard*: OS-discovered, never user-added, always looked up unqualified
//! - *soft global*: defined by common bundles, live until end of run
//! - *bundle-local*: defined inside a non-common bundle's frame
//! - *negated*: explicitly undefined; shadows any positive definition
//! - *cancelled*: removed mid-run by outcome classes; treated as negated
//!
//! Persistent classes live in the `state` database with an expiry and a
//! preserve/reset policy, and are loaded into the soft-global partition at
//! agent startup.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use tracing::{error, info, warn};

use pact_state::{KvStore, PersistPolicy, PersistRecord};

use crate::policy::DEFAULT_NAMESPACE;

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
///
/// Idempotent; two names differing only in such characters canonify equal.
pub fn canonify(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Qualify `name` with `ns` unless it is already qualified or `ns` is the
/// default namespace.
pub fn qualify(name: &str, ns: &str) -> String {
    if name.contains(':') || ns.is_empty() || ns == DEFAULT_NAMESPACE {
        name.to_string()
    } else {
        format!("{ns}:{name}")
    }
}

/// True for the reserved time classes (`Monday`, `Hr02`, `Min00_05`, ...).
pub fn is_time_class(name: &str) -> bool {
    const DAYS: [&str; 7] = [
        "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
    ];
    const MONTHS: [&str; 12] = [
        "January", "February", "March", "April", "May", "June", "July", "August", "September",
        "October", "November", "December",
    ];
    const SHIFTS: [&str; 4] = ["Night", "Morning", "Afternoon", "Evening"];

    if DAYS.contains(&name) || MONTHS.contains(&name) || SHIFTS.contains(&name) {
        return true;
    }
    for prefix in ["Min", "Day", "Hr", "Yr", "Q"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                return true;
            }
        }
    }
    false
}

/// Which partition an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Hard,
    Global,
    BundleLocal,
    Negated,
}

/// Result of defining a class, so callers can react to abort triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassEffect {
    /// Defined (or already present) without tripping an abort pattern.
    Added,
    /// The name matched an abort-bundle pattern; the bundle flag is now set.
    AbortBundle,
    /// The name matched an abort pattern; the agent flag is now set.
    AbortAgent,
}

#[derive(Debug, Default)]
struct Frame {
    classes: HashSet<String>,
}

/// The class store. Owned by the evaluation context; actuators see only
/// snapshots.
pub struct ClassStore {
    hard: HashSet<String>,
    global: HashSet<String>,
    negated: HashSet<String>,
    cancelled: HashSet<String>,
    frames: Vec<Frame>,
    abort_patterns: Vec<(String, Regex)>,
    abort_bundle_patterns: Vec<(String, Regex)>,
    abort_requested: Option<String>,
    abort_bundle: bool,
}

impl Default for ClassStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassStore {
    pub fn new() -> Self {
        Self {
            hard: HashSet::new(),
            global: HashSet::new(),
            negated: HashSet::new(),
            cancelled: HashSet::new(),
            frames: vec![Frame::default()],
            abort_patterns: Vec::new(),
            abort_bundle_patterns: Vec::new(),
            abort_requested: None,
            abort_bundle: false,
        }
    }

    // -- abort configuration ------------------------------------------------

    /// Register a pattern from `abortclasses`; defining a matching class
    /// terminates the agent at the next promise boundary.
    pub fn add_abort_pattern(&mut self, pattern: &str) {
        if let Ok(re) = Regex::new(&anchored(pattern)) {
            self.abort_patterns.push((pattern.to_string(), re));
        } else {
            error!(pattern = %pattern, "Unparseable abort class pattern ignored");
        }
    }

    /// Register a pattern from `abortbundleclasses`; defining a matching
    /// class unwinds the current bundle.
    pub fn add_abort_bundle_pattern(&mut self, pattern: &str) {
        if let Ok(re) = Regex::new(&anchored(pattern)) {
            self.abort_bundle_patterns.push((pattern.to_string(), re));
        } else {
            error!(pattern = %pattern, "Unparseable abort-bundle class pattern ignored");
        }
    }

    /// The class that requested agent termination, if any.
    pub fn abort_requested(&self) -> Option<&str> {
        self.abort_requested.as_deref()
    }

    /// Consume the bundle-abort flag, returning whether it was set.
    /// Queried by the scheduler after every promise.
    pub fn take_bundle_abort(&mut self) -> bool {
        std::mem::take(&mut self.abort_bundle)
    }

    fn check_abort_triggers(&mut self, context: &str) -> ClassEffect {
        for (pattern, re) in &self.abort_bundle_patterns {
            if re.is_match(context) {
                error!(class = %context, pattern = %pattern, "Bundle aborted on defined class");
                self.abort_bundle = true;
                return ClassEffect::AbortBundle;
            }
        }
        for (pattern, re) in &self.abort_patterns {
            if re.is_match(context) {
                error!(class = %context, pattern = %pattern, "Agent aborted on defined class");
                self.abort_requested = Some(context.to_string());
                return ClassEffect::AbortAgent;
            }
        }
        ClassEffect::Added
    }

    // -- definition ---------------------------------------------------------

    /// Define an OS-discovered class. Hard classes are stored and looked up
    /// unqualified.
    pub fn add_hard(&mut self, name: &str) -> ClassEffect {
        let context = canonify(name.trim());
        if context.is_empty() || self.hard.contains(&context) {
            return ClassEffect::Added;
        }
        self.hard.insert(context.clone());
        self.check_abort_triggers(&context)
    }

    /// Define a soft class visible process-wide for the rest of the run.
    pub fn add_soft(&mut self, name: &str, ns: &str) -> ClassEffect {
        let context = qualify(&canonify(name.trim()), ns);
        if context.is_empty() || self.global.contains(&context) {
            return ClassEffect::Added;
        }
        self.global.insert(context.clone());
        self.check_abort_triggers(&context)
    }

    /// Define a soft class visible only inside the current bundle frame.
    pub fn add_soft_bundle(&mut self, name: &str, bundle: &str, ns: &str) -> ClassEffect {
        let context = qualify(&canonify(name.trim()), ns);
        if context.is_empty() {
            return ClassEffect::Added;
        }
        if self.global.contains(&context) {
            warn!(
                class = %context,
                bundle = %bundle,
                "Private class shadows a global class - choose a different name to avoid conflicts"
            );
        }
        let frame = self.frames.last_mut().expect("class frame stack is never empty");
        if !frame.classes.insert(context.clone()) {
            return ClassEffect::Added;
        }
        self.check_abort_triggers(&context)
    }

    /// Explicitly undefine a name; shadows any positive definition.
    pub fn add_negated(&mut self, name: &str) {
        self.negated.insert(canonify(name.trim()));
    }

    /// Cancel a soft class mid-run: removed from the global and bundle-local
    /// partitions and treated as negated for the rest of the run.
    pub fn remove(&mut self, name: &str) {
        let context = canonify(name.trim());
        self.global.remove(&context);
        for frame in &mut self.frames {
            frame.classes.remove(&context);
        }
        self.cancelled.insert(context);
    }

    /// Remove a class from the hard partition only. Namespace prefixes are
    /// ignored; hard classes are unqualified by construction.
    pub fn remove_hard(&mut self, name: &str) {
        let local = name.rsplit(':').next().unwrap_or(name);
        self.hard.remove(local);
    }

    // -- lookup -------------------------------------------------------------

    /// True when `name` is defined from the perspective of namespace `ns`.
    ///
    /// `any` is always true. Qualified names are used as-is after stripping
    /// a `default:` prefix; unqualified names are qualified with `ns` for
    /// the soft partitions. Negated and cancelled names are never defined.
    /// Hard classes are consulted with the raw unqualified name.
    pub fn contains(&self, name: &str, ns: &str) -> bool {
        if name == "any" {
            return true;
        }

        let qualified = if let Some(stripped) = name.strip_prefix("default:") {
            stripped.to_string()
        } else if name.contains(':') {
            name.to_string()
        } else {
            qualify(name, ns)
        };

        if self.negated.contains(&qualified) || self.cancelled.contains(&qualified) {
            return false;
        }
        if self.hard.contains(name) {
            return true;
        }
        if self.global.contains(&qualified) {
            return true;
        }
        self.frames
            .last()
            .expect("class frame stack is never empty")
            .classes
            .contains(&qualified)
    }

    /// True when `name` is a reserved (hard) class.
    pub fn is_hard(&self, name: &str) -> bool {
        self.hard.contains(name)
    }

    /// All names in `partition` matching `pattern` (anchored), sorted.
    pub fn matching(&self, partition: Partition, pattern: &Regex) -> Vec<String> {
        let mut hits: Vec<String> = self
            .iter(partition)
            .filter(|name| pattern.is_match(name.as_str()))
            .cloned()
            .collect();
        hits.sort_unstable();
        hits
    }

    /// Iterate one partition's names (unsorted).
    pub fn iter(&self, partition: Partition) -> Box<dyn Iterator<Item = &String> + '_> {
        match partition {
            Partition::Hard => Box::new(self.hard.iter()),
            Partition::Global => Box::new(self.global.iter()),
            Partition::BundleLocal => Box::new(
                self.frames
                    .last()
                    .expect("class frame stack is never empty")
                    .classes
                    .iter(),
            ),
            Partition::Negated => Box::new(self.negated.iter().chain(self.cancelled.iter())),
        }
    }

    /// Sorted listing of a partition, with negated names elided. Used by the
    /// report generator and the class-environment cache.
    pub fn sorted(&self, partition: Partition) -> Vec<String> {
        let mut names: Vec<String> = self
            .iter(partition)
            .filter(|n| partition == Partition::Negated || !self.negated.contains(*n))
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    // -- frames -------------------------------------------------------------

    /// Push a bundle-local frame. With `inherit_previous` the current
    /// frame's classes are copied into the new one.
    pub fn push_frame(&mut self, inherit_previous: bool) {
        let classes = if inherit_previous {
            self.frames
                .last()
                .expect("class frame stack is never empty")
                .classes
                .clone()
        } else {
            HashSet::new()
        };
        self.frames.push(Frame { classes });
    }

    /// Pop the current bundle-local frame; its classes disappear.
    ///
    /// # Panics
    /// Panics if only the root frame remains: popping it is an engine bug.
    pub fn pop_frame(&mut self) {
        assert!(self.frames.len() > 1, "popped the root class frame");
        self.frames.pop();
    }

    /// Current frame depth (root frame = 1). Test helper.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    // -- persistent classes -------------------------------------------------

    /// Save `name` as a persistent class with a TTL in minutes.
    ///
    /// With `Preserve`, an unexpired existing entry is retained untouched;
    /// with `Reset` the expiry is always rewritten.
    pub async fn persist(
        &self,
        store: &Arc<dyn KvStore>,
        name: &str,
        ns: &str,
        ttl_minutes: u32,
        policy: PersistPolicy,
    ) {
        let key = qualify(&canonify(name), ns);
        let now = Utc::now().timestamp();

        // An existing entry saved with `preserve` keeps its window, no
        // matter what policy this save carries.
        match store.get(key.as_bytes()).await {
            Ok(Some(bytes)) => {
                if let Ok(existing) = PersistRecord::from_bytes(&bytes) {
                    if existing.policy == PersistPolicy::Preserve && now < existing.expires {
                        info!(
                            class = %key,
                            minutes_left = (existing.expires - now) / 60,
                            "Persistent class already in a preserved state"
                        );
                        return;
                    }
                }
            }
            Ok(None) => info!(class = %key, "New persistent class"),
            Err(err) => {
                warn!(class = %key, error = %err, "State store unavailable; persistent class not saved");
                return;
            }
        }

        let record = PersistRecord::new(now + i64::from(ttl_minutes) * 60, policy);
        if let Err(err) = store.put(key.as_bytes(), &record.to_bytes()).await {
            warn!(class = %key, error = %err, "State store unavailable; persistent class not saved");
        }
    }

    /// Delete any persistent entry for `name`.
    pub async fn delete_persistent(&self, store: &Arc<dyn KvStore>, name: &str) {
        if let Err(err) = store.delete(canonify(name).as_bytes()).await {
            warn!(class = %name, error = %err, "State store unavailable; persistent class not deleted");
        }
    }

    /// Load persistent classes into the soft-global partition, evicting
    /// expired entries as they are encountered.
    pub async fn load_persistent(&mut self, store: &Arc<dyn KvStore>) {
        let now = Utc::now().timestamp();

        let entries = match store.scan().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "Unable to scan persistence cache");
                return;
            }
        };

        let mut expired: HashSet<Vec<u8>> = HashSet::new();
        for (key, value) in &entries {
            let name = String::from_utf8_lossy(key).to_string();
            let record = match PersistRecord::from_bytes(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(class = %name, error = %err, "Corrupt persistent class entry evicted");
                    expired.insert(key.clone());
                    continue;
                }
            };

            if now > record.expires {
                info!(class = %name, "Persistent class expired");
                expired.insert(key.clone());
            } else {
                info!(
                    class = %name,
                    minutes_left = (record.expires - now) / 60,
                    "Adding persistent class to heap"
                );
                match name.split_once(':') {
                    Some((ns, local)) => self.add_soft(local, ns),
                    None => self.add_soft(&name, DEFAULT_NAMESPACE),
                };
            }
        }

        if !expired.is_empty() {
            if let Err(err) = store.retain(&move |k: &[u8], _v: &[u8]| !expired.contains(k)).await
            {
                warn!(error = %err, "Unable to evict expired persistent classes");
            }
        }
    }

    /// Write the visible class environment to `path`, one name per line,
    /// negated entries elided.
    pub fn save_class_environment(&self, path: &std::path::Path) -> std::io::Result<()> {
        let mut out = String::new();
        for partition in [Partition::Hard, Partition::Global, Partition::BundleLocal] {
            for name in self.sorted(partition) {
                out.push_str(&name);
                out.push('\n');
            }
        }
        std::fs::write(path, out)
    }
}

/// Abort patterns match whole class names.
fn anchored(pattern: &str) -> String {
    format!("^(?:{pattern})$")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pact_state::{MemoryStore, StoreResult};

    fn store() -> Arc<dyn KvStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_canonify_is_idempotent() {
        let once = canonify("web server 1.2-east");
        let twice = canonify(&once);
        assert_eq!(once, "web_server_1_2_east");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_canonify_equates_punctuation_variants() {
        assert_eq!(canonify("a.b-c"), canonify("a b c"));
    }

    #[test]
    fn test_any_is_always_defined() {
        let store = ClassStore::new();
        assert!(store.contains("any", DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_negation_shadows_every_partition() {
        let mut store = ClassStore::new();
        store.add_hard("linux");
        store.add_soft("webserver", DEFAULT_NAMESPACE);
        store.add_negated("linux");
        store.add_negated("webserver");
        assert!(!store.contains("linux", DEFAULT_NAMESPACE));
        assert!(!store.contains("webserver", DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_hard_lookup_is_unqualified() {
        let mut store = ClassStore::new();
        store.add_hard("linux");
        assert!(store.contains("linux", "site"));
    }

    #[test]
    fn test_default_prefix_is_stripped() {
        let mut store = ClassStore::new();
        store.add_soft("nightly", DEFAULT_NAMESPACE);
        assert!(store.contains("default:nightly", DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_namespace_qualification() {
        let mut store = ClassStore::new();
        store.add_soft("ready", "site");
        assert!(store.contains("ready", "site"));
        assert!(store.contains("site:ready", DEFAULT_NAMESPACE));
        assert!(!store.contains("ready", DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_bundle_frame_scoping() {
        let mut store = ClassStore::new();
        store.push_frame(false);
        store.add_soft_bundle("staging", "deploy", DEFAULT_NAMESPACE);
        assert!(store.contains("staging", DEFAULT_NAMESPACE));
        store.pop_frame();
        assert!(!store.contains("staging", DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_frame_inheritance_copies_local_set() {
        let mut store = ClassStore::new();
        store.push_frame(false);
        store.add_soft_bundle("inherited", "outer", DEFAULT_NAMESPACE);

        store.push_frame(true);
        assert!(store.contains("inherited", DEFAULT_NAMESPACE));
        store.pop_frame();

        store.push_frame(false);
        assert!(!store.contains("inherited", DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_remove_cancels_for_rest_of_run() {
        let mut store = ClassStore::new();
        store.add_soft("transient", DEFAULT_NAMESPACE);
        store.remove("transient");
        assert!(!store.contains("transient", DEFAULT_NAMESPACE));
        // Redefinition does not resurrect a cancelled class.
        store.add_soft("transient", DEFAULT_NAMESPACE);
        assert!(!store.contains("transient", DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_remove_hard_ignores_namespace_prefix() {
        let mut store = ClassStore::new();
        store.add_hard("linux");
        store.remove_hard("site:linux");
        assert!(!store.contains("linux", DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_abort_pattern_sets_agent_flag() {
        let mut store = ClassStore::new();
        store.add_abort_pattern("fatal_.*");
        let effect = store.add_soft("fatal_disk", DEFAULT_NAMESPACE);
        assert_eq!(effect, ClassEffect::AbortAgent);
        assert_eq!(store.abort_requested(), Some("fatal_disk"));
    }

    #[test]
    fn test_abort_bundle_pattern_sets_and_clears_flag() {
        let mut store = ClassStore::new();
        store.add_abort_bundle_pattern("rollback");
        store.push_frame(false);
        let effect = store.add_soft_bundle("rollback", "deploy", DEFAULT_NAMESPACE);
        assert_eq!(effect, ClassEffect::AbortBundle);
        assert!(store.take_bundle_abort());
        assert!(!store.take_bundle_abort());
    }

    #[test]
    fn test_matching_is_sorted() {
        let mut store = ClassStore::new();
        store.add_hard("linux");
        store.add_hard("linux_x86_64");
        store.add_hard("windows");
        let re = Regex::new("^linux.*").unwrap();
        assert_eq!(
            store.matching(Partition::Hard, &re),
            vec!["linux".to_string(), "linux_x86_64".to_string()]
        );
    }

    #[test]
    fn test_is_time_class() {
        assert!(is_time_class("Monday"));
        assert!(is_time_class("Hr02"));
        assert!(is_time_class("Min00_05"));
        assert!(is_time_class("Yr2026"));
        assert!(is_time_class("Q3"));
        assert!(!is_time_class("Hrx"));
        assert!(!is_time_class("webserver"));
    }

    #[tokio::test]
    async fn test_persist_preserve_keeps_unexpired_entry() {
        let store = store();
        let classes = ClassStore::new();

        classes
            .persist(&store, "upgraded", DEFAULT_NAMESPACE, 5, PersistPolicy::Preserve)
            .await;
        let first = store.get(b"upgraded").await.unwrap().unwrap();

        // Re-save inside the window with a longer TTL; entry must not move.
        classes
            .persist(&store, "upgraded", DEFAULT_NAMESPACE, 60, PersistPolicy::Preserve)
            .await;
        let second = store.get(b"upgraded").await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_persist_reset_rewrites_expiry() {
        let store = store();
        let classes = ClassStore::new();

        classes
            .persist(&store, "cycle", DEFAULT_NAMESPACE, 5, PersistPolicy::Reset)
            .await;
        let first = PersistRecord::from_bytes(&store.get(b"cycle").await.unwrap().unwrap()).unwrap();

        classes
            .persist(&store, "cycle", DEFAULT_NAMESPACE, 60, PersistPolicy::Reset)
            .await;
        let second =
            PersistRecord::from_bytes(&store.get(b"cycle").await.unwrap().unwrap()).unwrap();
        assert!(second.expires >= first.expires + 55 * 60 - 1);
    }

    #[tokio::test]
    async fn test_load_persistent_defines_and_evicts() -> StoreResult<()> {
        let store = store();
        let now = Utc::now().timestamp();

        let live = PersistRecord::new(now + 600, PersistPolicy::Preserve);
        let stale = PersistRecord::new(now - 600, PersistPolicy::Reset);
        store.put(b"alive", &live.to_bytes()).await?;
        store.put(b"site:scoped", &live.to_bytes()).await?;
        store.put(b"gone", &stale.to_bytes()).await?;

        let mut classes = ClassStore::new();
        classes.load_persistent(&store).await;

        assert!(classes.contains("alive", DEFAULT_NAMESPACE));
        assert!(classes.contains("site:scoped", DEFAULT_NAMESPACE));
        assert!(!classes.contains("gone", DEFAULT_NAMESPACE));
        assert!(!store.has(b"gone").await?);
        Ok(())
    }
}
