//! Evaluation context
//!
//! One `EvalContext` value owns all mutable evaluation state for an agent
//! run (class store, variable store, done-handle registry) together with
//! the shared collaborators (audit sink, lock manager, state stores). The
//! scheduler threads it explicitly through every call site; actuators only
//! ever see the concrete-promise snapshot plus this context.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use pact_state::{KvStore, MemoryStore};

use crate::attrs::{self, TransactionDefaults};
use crate::audit::AuditSink;
use crate::classes::ClassStore;
use crate::error::Result;
use crate::lock::{LockManager, ProcessControl, SystemProcesses};
use crate::policy::Promise;
use crate::vars::{scope_name, VarStore};

/// All state for one agent run.
pub struct EvalContext {
    pub classes: ClassStore,
    pub vars: VarStore,
    pub audit: Arc<AuditSink>,
    pub locks: Arc<LockManager>,
    /// Persistent-class store (`state` database).
    pub state: Arc<dyn KvStore>,
    /// Rolling performance moments (`performance` database).
    pub performance: Arc<dyn KvStore>,
    pub host: String,
    /// Namespace of the bundle currently being evaluated.
    pub namespace: String,
    /// Variable scope of the bundle currently being evaluated.
    pub current_scope: String,
    /// `-n`: actuators must not touch configured resources.
    pub dry_run: bool,
    /// Agent start time; `now` in integer constraints resolves to this.
    pub start_time: i64,
    pub txn_defaults: TransactionDefaults,
    done_handles: HashSet<String>,
}

/// Everything needed to assemble a context; the CLI builds this from flags
/// and opened stores.
pub struct ContextConfig {
    pub state: Arc<dyn KvStore>,
    pub performance: Arc<dyn KvStore>,
    pub locks: Arc<LockManager>,
    pub host: String,
    pub dry_run: bool,
    pub txn_defaults: TransactionDefaults,
}

impl EvalContext {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            classes: ClassStore::new(),
            vars: VarStore::with_builtins(),
            audit: Arc::new(AuditSink::new()),
            locks: config.locks,
            state: config.state,
            performance: config.performance,
            host: config.host,
            namespace: crate::policy::DEFAULT_NAMESPACE.to_string(),
            current_scope: String::new(),
            dry_run: config.dry_run,
            start_time: Utc::now().timestamp(),
            txn_defaults: config.txn_defaults,
            done_handles: HashSet::new(),
        }
    }

    /// A context backed entirely by in-memory stores with locking bypassed.
    /// Used by tests and `--no-persist` runs.
    pub fn ephemeral(host: &str) -> Self {
        let locks_store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let procs: Arc<dyn ProcessControl> = Arc::new(SystemProcesses);
        let locks = Arc::new(LockManager::new(
            locks_store,
            procs,
            host,
            std::env::temp_dir().as_path(),
            true,
        ));
        Self::new(ContextConfig {
            state: Arc::new(MemoryStore::new()),
            performance: Arc::new(MemoryStore::new()),
            locks,
            host: host.to_string(),
            dry_run: false,
            txn_defaults: TransactionDefaults::default(),
        })
    }

    /// Wall-clock now; kept behind a method so call sites are greppable.
    pub fn now(&self) -> i64 {
        Utc::now().timestamp()
    }

    // -- done handles -------------------------------------------------------

    /// Register a completed promise's `handle` for `depends_on` tracking.
    pub fn mark_handle_done(&mut self, ns: &str, handle: &str) {
        self.done_handles.insert(qualified_handle(ns, handle));
    }

    pub fn is_handle_done(&self, ns: &str, handle: &str) -> bool {
        self.done_handles.contains(&qualified_handle(ns, handle))
    }

    /// First `depends_on` handle that has not completed yet, if any.
    pub fn missing_dependency(&self, promise: &Promise) -> Result<Option<String>> {
        let deps = attrs::get_list(promise, "depends_on", &self.classes, &self.namespace)?;
        for dep in deps.unwrap_or_default() {
            let qualified = if dep.contains(':') {
                dep.clone()
            } else {
                qualified_handle(&self.namespace, &dep)
            };
            if !self.done_handles.contains(&qualified) {
                return Ok(Some(qualified));
            }
        }
        Ok(None)
    }

    // -- bundle frames ------------------------------------------------------

    /// Enter a bundle: push a class frame and make the bundle's scope
    /// current. Returns the previous `(namespace, scope)` for restoration.
    pub fn enter_bundle(&mut self, ns: &str, bundle: &str, inherit: bool) -> (String, String) {
        self.classes.push_frame(inherit);
        let scope = scope_name(ns, bundle);
        self.vars.new_scope(&scope);
        let previous = (
            std::mem::replace(&mut self.namespace, ns.to_string()),
            std::mem::replace(&mut self.current_scope, scope),
        );
        previous
    }

    /// Leave a bundle: pop its class frame and restore the caller's
    /// namespace and scope.
    pub fn leave_bundle(&mut self, previous: (String, String)) {
        self.classes.pop_frame();
        self.namespace = previous.0;
        self.current_scope = previous.1;
    }
}

fn qualified_handle(ns: &str, handle: &str) -> String {
    format!("{ns}:{handle}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Constraint, Rval, DEFAULT_NAMESPACE};

    #[test]
    fn test_handle_registry_is_namespaced() {
        let mut ctx = EvalContext::ephemeral("testhost");
        ctx.mark_handle_done("default", "base_done");
        assert!(ctx.is_handle_done("default", "base_done"));
        assert!(!ctx.is_handle_done("site", "base_done"));
    }

    #[test]
    fn test_missing_dependency_reports_first_gap() {
        let mut ctx = EvalContext::ephemeral("testhost");
        ctx.mark_handle_done("default", "first");

        let promise = Promise::new("demo").with_constraint(Constraint::new(
            "depends_on",
            Rval::List(vec!["first".into(), "second".into()]),
        ));

        assert_eq!(
            ctx.missing_dependency(&promise).unwrap(),
            Some("default:second".to_string())
        );

        ctx.mark_handle_done("default", "second");
        assert_eq!(ctx.missing_dependency(&promise).unwrap(), None);
    }

    #[test]
    fn test_enter_leave_bundle_restores_scope() {
        let mut ctx = EvalContext::ephemeral("testhost");
        assert_eq!(ctx.namespace, DEFAULT_NAMESPACE);

        let prev = ctx.enter_bundle("site", "deploy", false);
        assert_eq!(ctx.namespace, "site");
        assert_eq!(ctx.current_scope, "site:deploy");
        assert!(ctx.vars.has_scope("site:deploy"));
        assert_eq!(ctx.classes.frame_depth(), 2);

        ctx.leave_bundle(prev);
        assert_eq!(ctx.namespace, DEFAULT_NAMESPACE);
        assert_eq!(ctx.classes.frame_depth(), 1);
    }
}
