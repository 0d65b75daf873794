//! Actuator dispatch
//!
//! Maps a concrete promise's type to a registered actuator and drives the
//! full per-promise discipline around the call: lock acquisition, optional
//! timeout, backgrounding under the `max_children` cap, audit recording,
//! outcome-class side effects, and performance measurement.
//!
//! Actuators never see the evaluator's class or variable stacks; they get
//! the concrete-promise snapshot, the resolved transaction attributes, and
//! the dry-run flag. Each call reports exactly one terminal outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::attrs::{self, ActionPolicy, TransactionAttrs};
use crate::audit::{self, AuditRecord, AuditSink, Outcome};
use crate::context::EvalContext;
use crate::error::{PolicyError, Result};
use crate::expand::ConcretePromise;
use crate::lock::{AcquireOutcome, LockHandle, LockManager};

/// An enforcement backend for one promise type.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// The promise type this actuator enforces (`files`, `processes`, ...).
    fn promise_type(&self) -> &'static str;

    /// Converge one concrete promise. With `dry_run` no configured resource
    /// may be touched; the outcome reflects what would have happened.
    async fn actuate(
        &self,
        promise: &ConcretePromise,
        attrs: &TransactionAttrs,
        dry_run: bool,
    ) -> Result<Outcome>;
}

/// Registry of actuators plus the global background-children cap.
pub struct ActuatorRegistry {
    actuators: HashMap<&'static str, Arc<dyn Actuator>>,
    children: Arc<tokio::sync::Semaphore>,
}

impl ActuatorRegistry {
    pub fn new(max_children: usize) -> Self {
        Self {
            actuators: HashMap::new(),
            children: Arc::new(tokio::sync::Semaphore::new(max_children.max(1))),
        }
    }

    pub fn register(&mut self, actuator: Arc<dyn Actuator>) {
        self.actuators.insert(actuator.promise_type(), actuator);
    }

    pub fn get(&self, promise_type: &str) -> Option<Arc<dyn Actuator>> {
        self.actuators.get(promise_type).cloned()
    }

    pub fn has(&self, promise_type: &str) -> bool {
        self.actuators.contains_key(promise_type)
    }
}

/// Drive one concrete promise through lock → actuator → audit.
///
/// Lock rejections (`rate-limited`, `busy`, duplicate) return `Noop`
/// silently; a stale lock that cannot be expired fails the promise.
pub async fn dispatch(
    registry: &ActuatorRegistry,
    ctx: &mut EvalContext,
    concrete: &ConcretePromise,
) -> Result<Outcome> {
    let actuator =
        registry
            .get(&concrete.promise_type)
            .ok_or_else(|| PolicyError::UnknownPromiseType {
                promise_type: concrete.promise_type.clone(),
            })?;

    let ns = concrete.namespace.clone();
    let txn = attrs::transaction_attrs(
        &concrete.promise,
        &ctx.classes,
        &ns,
        ctx.txn_defaults,
        ctx.start_time,
    )?;
    let outcome_classes = attrs::classes_attrs(&concrete.promise, &ctx.classes, &ns, ctx.start_time)?;

    let subject = concrete.lock_subject(&ctx.host);
    let fingerprint = subject.fingerprint();
    let now = ctx.now();

    let handle = match ctx
        .locks
        .acquire(&subject, txn.ifelapsed, txn.expireafter, now)
        .await
    {
        AcquireOutcome::Acquired(handle) => handle,
        AcquireOutcome::Duplicate
        | AcquireOutcome::RateLimited { .. }
        | AcquireOutcome::Busy { .. } => return Ok(Outcome::Noop),
        AcquireOutcome::CouldNotExpire { holder_pid } => {
            let outcome = Outcome::Failed;
            record_outcome(
                ctx,
                concrete,
                &txn,
                &fingerprint,
                outcome,
                format!("could not expire stale lock held by pid {holder_pid}"),
            )
            .await;
            audit::apply_outcome_classes(outcome, &outcome_classes, &mut ctx.classes, &ctx.state, &ns)
                .await;
            return Ok(outcome);
        }
    };

    if txn.background {
        spawn_background(registry, ctx, actuator, concrete.clone(), txn, handle).await;
        return Ok(Outcome::Noop);
    }

    let started = Instant::now();
    let outcome = run_actuator(&*actuator, concrete, &txn, ctx).await;
    ctx.locks.release(handle, ctx.now()).await;

    let message = outcome_message(ctx, concrete, &txn, outcome);
    record_outcome(ctx, concrete, &txn, &fingerprint, outcome, message).await;
    audit::apply_outcome_classes(outcome, &outcome_classes, &mut ctx.classes, &ctx.state, &ns).await;

    if let Some(event) = &txn.measurement_class {
        audit::note_performance(
            &ctx.performance,
            event,
            ctx.now(),
            started.elapsed().as_secs_f64(),
        )
        .await;
    }

    if outcome.is_converged() {
        if let Some(handle_name) = concrete.handle() {
            ctx.mark_handle_done(&ns, handle_name);
        }
    }

    Ok(outcome)
}

/// Invoke the actuator with the promise's `timeout` (seconds) applied.
/// Action policy `warn`/`nop` downgrades a would-be repair.
async fn run_actuator(
    actuator: &dyn Actuator,
    concrete: &ConcretePromise,
    txn: &TransactionAttrs,
    ctx: &EvalContext,
) -> Outcome {
    let dry_run = ctx.dry_run || txn.action == ActionPolicy::Nop;

    let timeout_secs = concrete
        .promise
        .constraints_named("timeout")
        .next()
        .and_then(|c| c.rval.as_scalar())
        .and_then(|s| attrs::int_from_string(s, ctx.start_time))
        .filter(|secs| *secs > 0);

    let call = actuator.actuate(concrete, txn, dry_run);
    let result = match timeout_secs {
        Some(secs) => {
            match tokio::time::timeout(Duration::from_secs(secs as u64), call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        promiser = %concrete.promise.promiser,
                        timeout_secs = secs,
                        "Actuator exceeded its time budget"
                    );
                    return Outcome::Timeout;
                }
            }
        }
        None => call.await,
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(
                promiser = %concrete.promise.promiser,
                error = %err,
                "Actuator error"
            );
            Outcome::Failed
        }
    };

    // A warn-only promise reports drift instead of repairing it.
    if txn.action == ActionPolicy::Warn && outcome == Outcome::Repaired {
        Outcome::Warn
    } else {
        outcome
    }
}

/// Run an actuator detached: it gets a snapshot and an isolated lock
/// handle, records its own outcome, and never touches the class store.
async fn spawn_background(
    registry: &ActuatorRegistry,
    ctx: &EvalContext,
    actuator: Arc<dyn Actuator>,
    concrete: ConcretePromise,
    txn: TransactionAttrs,
    handle: LockHandle,
) {
    let permit = match registry.children.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Background pool closed; dropping promise");
            ctx.locks.release(handle, chrono::Utc::now().timestamp()).await;
            return;
        }
    };

    let sink: Arc<AuditSink> = ctx.audit.clone();
    let locks: Arc<LockManager> = ctx.locks.clone();
    let fingerprint = handle.fingerprint.clone();
    let dry_run = ctx.dry_run;
    let bundle = concrete.bundle.clone();

    info!(promiser = %concrete.promise.promiser, "Backgrounding promise repair");
    tokio::spawn(async move {
        let _permit = permit;
        let outcome = match actuator.actuate(&concrete, &txn, dry_run).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(promiser = %concrete.promise.promiser, error = %err, "Background actuator error");
                Outcome::Failed
            }
        };
        locks.release(handle, chrono::Utc::now().timestamp()).await;
        sink.record(
            &fingerprint,
            AuditRecord {
                timestamp: chrono::Utc::now().timestamp(),
                bundle,
                handle: None,
                promiser: concrete.promise.promiser.clone(),
                promise_type: concrete.promise_type.clone(),
                outcome,
                message: format!("background promise {outcome}"),
                origin: concrete.promise.origin.clone(),
            },
        );
    });
}

fn outcome_message(
    ctx: &EvalContext,
    concrete: &ConcretePromise,
    txn: &TransactionAttrs,
    outcome: Outcome,
) -> String {
    match &txn.log_string {
        Some(template) => match ctx
            .vars
            .expand_partial(template, &concrete.namespace, &ctx.current_scope)
        {
            Ok(expanded) => expanded,
            Err(_) => template.clone(),
        },
        None => format!("promise {} for {}", outcome, concrete.promise.promiser),
    }
}

async fn record_outcome(
    ctx: &EvalContext,
    concrete: &ConcretePromise,
    txn: &TransactionAttrs,
    fingerprint: &str,
    outcome: Outcome,
    message: String,
) {
    audit::route_log(txn, outcome, &message);
    let recorded = ctx.audit.record(
        fingerprint,
        AuditRecord {
            timestamp: ctx.now(),
            bundle: concrete.bundle.clone(),
            handle: concrete.handle().map(|h| h.to_string()),
            promiser: concrete.promise.promiser.clone(),
            promise_type: concrete.promise_type.clone(),
            outcome,
            message,
            origin: concrete.promise.origin.clone(),
        },
    );
    if !recorded {
        debug!(promiser = %concrete.promise.promiser, "Outcome already recorded for this promise");
    }
}

// ---------------------------------------------------------------------------
// Built-in reports actuator
// ---------------------------------------------------------------------------

/// The `reports` actuator: emits the promiser as a report line. The only
/// actuator that ships with the engine; everything touching real resources
/// registers from outside.
pub struct ReportsActuator;

#[async_trait]
impl Actuator for ReportsActuator {
    fn promise_type(&self) -> &'static str {
        "reports"
    }

    async fn actuate(
        &self,
        promise: &ConcretePromise,
        _attrs: &TransactionAttrs,
        _dry_run: bool,
    ) -> Result<Outcome> {
        println!("R: {}", promise.promise.promiser);
        Ok(Outcome::Repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Constraint, Promise, Rval};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Actuator that returns a scripted outcome and counts invocations.
    struct ScriptedActuator {
        outcome: Outcome,
        calls: Arc<AtomicUsize>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Actuator for ScriptedActuator {
        fn promise_type(&self) -> &'static str {
            "files"
        }

        async fn actuate(
            &self,
            _promise: &ConcretePromise,
            _attrs: &TransactionAttrs,
            _dry_run: bool,
        ) -> Result<Outcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.outcome)
        }
    }

    fn registry_with(outcome: Outcome, calls: Arc<AtomicUsize>) -> ActuatorRegistry {
        let mut registry = ActuatorRegistry::new(4);
        registry.register(Arc::new(ScriptedActuator {
            outcome,
            calls,
            delay: None,
        }));
        registry
    }

    fn concrete(promiser: &str) -> ConcretePromise {
        ConcretePromise {
            promise: Promise::new(promiser),
            bundle: "main".into(),
            namespace: "default".into(),
            promise_type: "files".into(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_runs_actuator_and_records() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Outcome::Repaired, calls.clone());
        let mut ctx = EvalContext::ephemeral("testhost");

        let outcome = dispatch(&registry, &mut ctx, &concrete("/etc/motd"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Repaired);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.audit.summary().repaired, 1);
    }

    #[tokio::test]
    async fn test_unknown_promise_type_is_policy_error() {
        let registry = ActuatorRegistry::new(4);
        let mut ctx = EvalContext::ephemeral("testhost");

        let mut unknown = concrete("svc");
        unknown.promise_type = "databases".into();
        assert!(matches!(
            dispatch(&registry, &mut ctx, &unknown).await,
            Err(PolicyError::UnknownPromiseType { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_promise_dispatches_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Outcome::Kept, calls.clone());
        let mut ctx = EvalContext::ephemeral("testhost");

        let cp = concrete("/etc/motd");
        dispatch(&registry, &mut ctx, &cp).await.unwrap();
        let second = dispatch(&registry, &mut ctx, &cp).await.unwrap();

        // The done-set catches the re-dispatch even with locking bypassed.
        assert_eq!(second, Outcome::Noop);
        assert_eq!(ctx.audit.summary().kept, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_warn_action_downgrades_repair() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Outcome::Repaired, calls);
        let mut ctx = EvalContext::ephemeral("testhost");

        let mut cp = concrete("/etc/motd");
        cp.promise
            .constraints
            .push(Constraint::new("action", Rval::Scalar("warn".into())));

        let outcome = dispatch(&registry, &mut ctx, &cp).await.unwrap();
        assert_eq!(outcome, Outcome::Warn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_timeout_outcome() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActuatorRegistry::new(4);
        registry.register(Arc::new(ScriptedActuator {
            outcome: Outcome::Repaired,
            calls,
            delay: Some(Duration::from_secs(30)),
        }));
        let mut ctx = EvalContext::ephemeral("testhost");

        let mut cp = concrete("/slow");
        cp.promise
            .constraints
            .push(Constraint::new("timeout", Rval::Scalar("1".into())));

        let outcome = dispatch(&registry, &mut ctx, &cp).await.unwrap();
        assert_eq!(outcome, Outcome::Timeout);
        assert_eq!(ctx.audit.summary().timeout, 1);
    }

    #[tokio::test]
    async fn test_converged_outcome_marks_handle_done() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Outcome::Kept, calls);
        let mut ctx = EvalContext::ephemeral("testhost");

        let mut cp = concrete("/etc/motd");
        cp.promise
            .constraints
            .push(Constraint::new("handle", Rval::Scalar("motd_ok".into())));

        dispatch(&registry, &mut ctx, &cp).await.unwrap();
        assert!(ctx.is_handle_done("default", "motd_ok"));
    }

    #[tokio::test]
    async fn test_outcome_classes_applied_after_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Outcome::Repaired, calls);
        let mut ctx = EvalContext::ephemeral("testhost");

        let mut cp = concrete("/etc/motd");
        cp.promise.constraints.push(Constraint::new(
            "promise_repaired",
            Rval::List(vec!["motd_fixed".into()]),
        ));

        dispatch(&registry, &mut ctx, &cp).await.unwrap();
        assert!(ctx.classes.contains("motd_fixed", "default"));
    }
}
