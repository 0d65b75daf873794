//! Bundle scheduler
//!
//! Runs the configured bundlesequence: for each entry the bundle is
//! resolved, a bundle frame is pushed, its scope is augmented with the
//! call arguments, and its sections are walked in the canonical promise
//! type order. `vars` and `classes` promises are kept natively; `methods`
//! promises re-enter the scheduler with a nested frame; everything else
//! expands through the iteration engine and dispatches to an actuator.
//!
//! Promises whose `depends_on` handles are not yet done stay pending and
//! are retried on later passes until a fixed point. Abort classes unwind
//! the current bundle or stop the whole run at the next promise boundary.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, error, info, warn};

use crate::actuate::{dispatch, ActuatorRegistry};
use crate::attrs;
use crate::classes::canonify;
use crate::context::EvalContext;
use crate::error::{PolicyError, Result};
use crate::expand::{ConcretePromise, PromiseIterations};
use crate::expr;
use crate::fns;
use crate::policy::{Bundle, BundleCall, Policy, Promise, Rval};
use crate::vars::{Expansion, VarPolicy};

/// Maximum `depends_on` retry passes over a bundle.
pub const MAX_DEPENDENCY_PASSES: usize = 5;

/// Canonical promise-type evaluation order within a bundle.
const SECTION_ORDER: [&str; 15] = [
    "vars",
    "defaults",
    "classes",
    "outputs",
    "interfaces",
    "files",
    "packages",
    "guest_environments",
    "methods",
    "processes",
    "services",
    "commands",
    "storage",
    "databases",
    "reports",
];

fn section_rank(promise_type: &str) -> usize {
    SECTION_ORDER
        .iter()
        .position(|t| *t == promise_type)
        .unwrap_or(SECTION_ORDER.len())
}

/// Scheduling options derived from CLI flags and `body agent control`.
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// This agent's role; bundles of this type or `common` may run.
    pub role: String,
    pub ignore_missing_bundles: bool,
    /// Overrides the policy's own bundlesequence when set.
    pub bundlesequence: Option<Vec<BundleCall>>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            role: "agent".to_string(),
            ignore_missing_bundles: false,
            bundlesequence: None,
        }
    }
}

/// Run the bundlesequence to completion (or abort).
pub async fn run_policy(
    policy: &Policy,
    ctx: &mut EvalContext,
    registry: &ActuatorRegistry,
    options: &ScheduleOptions,
) -> Result<()> {
    let sequence = options
        .bundlesequence
        .clone()
        .unwrap_or_else(|| policy.bundlesequence.clone());

    if sequence.is_empty() {
        warn!("Empty bundlesequence: nothing to do");
        return Ok(());
    }

    for call in &sequence {
        let Some(bundle) = policy.find_bundle(&call.name) else {
            if options.ignore_missing_bundles {
                debug!(bundle = %call.name, "Ignoring missing bundle");
                continue;
            }
            return Err(PolicyError::UnknownBundle {
                name: call.name.clone(),
            });
        };

        if bundle.bundle_type != options.role && bundle.bundle_type != "common" {
            debug!(
                bundle = %bundle.name,
                bundle_type = %bundle.bundle_type,
                "Skipping bundle of foreign type"
            );
            continue;
        }

        info!(bundle = %bundle.name, "Running bundle");
        run_bundle(policy, bundle, &call.args, ctx, registry, options).await?;

        if let Some(class) = ctx.classes.abort_requested() {
            error!(class = %class, "Agent aborted on defined class");
            return Ok(());
        }
    }

    Ok(())
}

/// Boxed recursion point so `methods` promises can nest bundle frames.
fn run_bundle_boxed<'a>(
    policy: &'a Policy,
    bundle: &'a Bundle,
    args: &'a [String],
    ctx: &'a mut EvalContext,
    registry: &'a ActuatorRegistry,
    options: &'a ScheduleOptions,
) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
    Box::pin(run_bundle(policy, bundle, args, ctx, registry, options))
}

/// Evaluate one bundle inside its own frame.
pub async fn run_bundle(
    policy: &Policy,
    bundle: &Bundle,
    args: &[String],
    ctx: &mut EvalContext,
    registry: &ActuatorRegistry,
    options: &ScheduleOptions,
) -> Result<()> {
    let previous = ctx.enter_bundle(&bundle.namespace, &bundle.name, false);
    let caller_scope = previous.1.clone();

    let result = async {
        if !bundle.params.is_empty() || !args.is_empty() {
            let scope = ctx.current_scope.clone();
            ctx.vars.augment(
                &scope,
                &bundle.params,
                args,
                &bundle.namespace,
                &caller_scope,
            )?;
        }

        // Sections in canonical order; source order breaks ties.
        let mut sections: Vec<usize> = (0..bundle.sections.len()).collect();
        sections.sort_by_key(|&i| (section_rank(&bundle.sections[i].promise_type), i));

        let mut done: HashSet<(usize, usize)> = HashSet::new();

        for pass in 0..MAX_DEPENDENCY_PASSES {
            let mut pending = 0usize;
            let mut progressed = false;

            for &si in &sections {
                let section = &bundle.sections[si];
                for (pi, promise) in section.promises.iter().enumerate() {
                    if done.contains(&(si, pi)) {
                        continue;
                    }

                    if !expr::is_defined(&promise.class_guard, &ctx.classes, &ctx.namespace) {
                        done.insert((si, pi));
                        continue;
                    }

                    if let Some(missing) = ctx.missing_dependency(promise)? {
                        debug!(
                            promiser = %promise.promiser,
                            dependency = %missing,
                            "Skipping promise: dependency has not yet been kept"
                        );
                        pending += 1;
                        continue;
                    }

                    keep_promise(
                        policy,
                        bundle,
                        &section.promise_type,
                        promise,
                        ctx,
                        registry,
                        options,
                    )
                    .await?;
                    done.insert((si, pi));
                    progressed = true;

                    if ctx.classes.take_bundle_abort() {
                        warn!(bundle = %bundle.name, "Unwinding bundle on abort class");
                        return Ok(());
                    }
                    if ctx.classes.abort_requested().is_some() {
                        return Ok(());
                    }
                }
            }

            if pending == 0 {
                break;
            }
            if !progressed {
                debug!(
                    bundle = %bundle.name,
                    pending,
                    "Dependency fixed point reached with promises still pending"
                );
                break;
            }
            debug!(bundle = %bundle.name, pass, pending, "Retrying pending promises");
        }

        Ok(())
    }
    .await;

    ctx.leave_bundle(previous);
    result
}

async fn keep_promise(
    policy: &Policy,
    bundle: &Bundle,
    promise_type: &str,
    promise: &Promise,
    ctx: &mut EvalContext,
    registry: &ActuatorRegistry,
    options: &ScheduleOptions,
) -> Result<()> {
    match promise_type {
        "vars" => keep_var_promise(promise, ctx),
        "classes" => keep_class_promise(bundle, promise, ctx).await,
        "methods" => keep_methods_promise(policy, bundle, promise, ctx, registry, options).await,
        other if registry.has(other) => {
            let Some(iterations) =
                PromiseIterations::prepare(policy, &bundle.name, other, promise, ctx)?
            else {
                return Ok(());
            };
            for i in 0..iterations.len() {
                let Some(concrete) = iterations.concretize(i, ctx)? else {
                    continue;
                };
                if let Err(err) = dispatch(registry, ctx, &concrete).await {
                    if err.is_recoverable() {
                        error!(
                            promiser = %concrete.promise.promiser,
                            error = %err,
                            "Promise not kept"
                        );
                    } else {
                        return Err(err);
                    }
                }
                if ctx.classes.abort_requested().is_some() {
                    return Ok(());
                }
            }
            Ok(())
        }
        other => {
            warn!(
                bundle = %bundle.name,
                promise_type = %other,
                "No actuator for promise type; section skipped"
            );
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// vars promises
// ---------------------------------------------------------------------------

const VAR_TYPE_LVALS: [&str; 6] = ["string", "int", "real", "slist", "ilist", "rlist"];

fn keep_var_promise(promise: &Promise, ctx: &mut EvalContext) -> Result<()> {
    if iteration_guard_excludes(promise, ctx)? {
        return Ok(());
    }

    let ns = ctx.namespace.clone();
    let scope = ctx.current_scope.clone();

    let policy_choice = attrs::get_scalar(promise, "policy", &ctx.classes, &ns)?
        .and_then(|p| VarPolicy::from_str(&p))
        .unwrap_or_default();

    for lval in VAR_TYPE_LVALS {
        let Some(constraint) = attrs::effective(promise, lval, &ctx.classes, &ns) else {
            continue;
        };

        let rval = match &constraint.rval {
            Rval::Scalar(s) => Rval::Scalar(ctx.vars.expand_partial(s, &ns, &scope)?),
            Rval::List(items) => {
                let mut expanded = Vec::with_capacity(items.len());
                for item in items {
                    expanded.push(ctx.vars.expand_partial(item, &ns, &scope)?);
                }
                Rval::List(expanded)
            }
            Rval::FnCall(call) => {
                let mut call = call.clone();
                for arg in &mut call.args {
                    *arg = ctx.vars.expand_partial(arg, &ns, &scope)?;
                }
                match fns::evaluate(&call, &ctx.vars, &ns, &scope) {
                    Some(value) => value,
                    None => {
                        // Leave the call in place; expansion retries it.
                        Rval::FnCall(call)
                    }
                }
            }
            other => other.clone(),
        };

        let origin = constraint.origin.clone();
        ctx.vars
            .put(&scope, &promise.promiser, rval, policy_choice, origin)?;
        mark_promise_handle(promise, ctx)?;
        return Ok(());
    }

    debug!(promiser = %promise.promiser, "Variable promise carries no value constraint");
    Ok(())
}

// ---------------------------------------------------------------------------
// classes promises
// ---------------------------------------------------------------------------

async fn keep_class_promise(
    bundle: &Bundle,
    promise: &Promise,
    ctx: &mut EvalContext,
) -> Result<()> {
    if iteration_guard_excludes(promise, ctx)? {
        return Ok(());
    }

    let ns = ctx.namespace.clone();
    let name = canonify(&promise.promiser);
    if name != promise.promiser {
        debug!(
            promiser = %promise.promiser,
            canonical = %name,
            "Class identifier contains illegal characters - canonifying"
        );
    }

    let persistence =
        attrs::get_int(promise, "persistence", &ctx.classes, &ns, ctx.start_time)?.unwrap_or(0);

    if ctx.classes.contains(&name, &ns) {
        if persistence == 0 {
            debug!(class = %name, "Cancelling cached persistent class");
            ctx.classes.delete_persistent(&ctx.state, &name).await;
        }
        return Ok(());
    }

    let Some(value) = eval_class_body(bundle, promise, ctx)? else {
        error!(promiser = %name, "No usable constraints for class promise");
        return Ok(());
    };
    if !value {
        return Ok(());
    }

    if persistence > 0 {
        let minutes = u32::try_from(persistence.max(0)).unwrap_or(u32::MAX);
        info!(class = %name, minutes, "Defining explicit persistent class");
        if bundle.bundle_type != "common" {
            debug!("Persistent classes are global in scope even in agent bundles");
        }
        ctx.classes
            .persist(&ctx.state, &name, &ns, minutes, pact_state::PersistPolicy::Reset)
            .await;
        ctx.classes.add_soft(&name, &ns);
    } else if bundle.bundle_type == "common" {
        debug!(class = %name, "Defining explicit global class");
        ctx.classes.add_soft(&name, &ns);
    } else {
        debug!(class = %name, "Defining explicit local bundle class");
        ctx.classes.add_soft_bundle(&name, &bundle.name, &ns);
    }

    mark_promise_handle(promise, ctx)?;
    Ok(())
}

/// Evaluate a class promise's defining constraint. `Ok(None)` when the
/// promise carries no recognised class source.
fn eval_class_body(bundle: &Bundle, promise: &Promise, ctx: &mut EvalContext) -> Result<Option<bool>> {
    let ns = ctx.namespace.clone();
    let scope = ctx.current_scope.clone();

    for constraint in &promise.constraints {
        if !expr::is_defined(&constraint.class_guard, &ctx.classes, &ns) {
            continue;
        }

        match constraint.lval.as_str() {
            "expression" | "not" => {
                let Some(raw) = constraint.rval.as_scalar() else {
                    return Ok(Some(false));
                };
                let text = ctx.vars.expand_partial(raw, &ns, &scope)?;
                let defined = expr::is_defined(&text, &ctx.classes, &ns);
                return Ok(Some(if constraint.lval == "not" {
                    !defined
                } else {
                    defined
                }));
            }
            "and" | "or" | "xor" => {
                let Some(items) = constraint.rval.as_list() else {
                    return Ok(Some(false));
                };
                let values: Vec<bool> = items
                    .iter()
                    .map(|e| expr::is_defined(e, &ctx.classes, &ns))
                    .collect();
                return Ok(Some(match constraint.lval.as_str() {
                    "and" => values.iter().all(|v| *v),
                    "or" => values.iter().any(|v| *v),
                    _ => values.iter().filter(|v| **v).count() % 2 == 1,
                }));
            }
            "select_class" => {
                let Some(items) = constraint.rval.as_list() else {
                    return Ok(Some(false));
                };
                if items.is_empty() {
                    error!(promiser = %promise.promiser, "No classes to select from");
                    return Ok(Some(false));
                }
                let n = host_splay(&ctx.host, items.len());
                define_strategy_class(bundle, &items[n], ctx);
                return Ok(Some(true));
            }
            "dist" => {
                let Some(items) = constraint.rval.as_list() else {
                    return Ok(Some(false));
                };
                let mut weights = Vec::with_capacity(items.len());
                let mut total: i64 = 0;
                for item in items {
                    let w = attrs::int_from_string(item, ctx.start_time).unwrap_or(-1);
                    if w < 0 {
                        error!(promiser = %promise.promiser, "Non-positive integer in class distribution");
                        return Ok(Some(false));
                    }
                    weights.push(w);
                    total += w;
                }
                if total == 0 {
                    error!(promiser = %promise.promiser, "An empty distribution was specified");
                    return Ok(Some(false));
                }

                // Deterministic draw keyed on host and promiser, so the
                // same host keeps its interval between runs.
                let point = (host_splay(&format!("{}+{}", ctx.host, promise.promiser), 10_000)
                    as i64)
                    * total
                    / 10_000;
                let mut cumulative = 0;
                for (item, weight) in items.iter().zip(&weights) {
                    cumulative += *weight;
                    if point < cumulative {
                        let name = format!("{}_{}", promise.promiser, item);
                        define_strategy_class(bundle, &name, ctx);
                        break;
                    }
                }
                return Ok(Some(true));
            }
            _ => {}
        }
    }

    Ok(None)
}

fn define_strategy_class(bundle: &Bundle, name: &str, ctx: &mut EvalContext) {
    let ns = ctx.namespace.clone();
    if bundle.bundle_type == "common" {
        ctx.classes.add_soft(name, &ns);
    } else {
        ctx.classes.add_soft_bundle(name, &bundle.name, &ns);
    }
}

/// Stable hash splay of a key onto `0..buckets`.
fn host_splay(key: &str, buckets: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % buckets.max(1)
}

// ---------------------------------------------------------------------------
// methods promises
// ---------------------------------------------------------------------------

async fn keep_methods_promise(
    policy: &Policy,
    bundle: &Bundle,
    promise: &Promise,
    ctx: &mut EvalContext,
    registry: &ActuatorRegistry,
    options: &ScheduleOptions,
) -> Result<()> {
    let Some(iterations) =
        PromiseIterations::prepare(policy, &bundle.name, "methods", promise, ctx)?
    else {
        return Ok(());
    };

    for i in 0..iterations.len() {
        let Some(concrete) = iterations.concretize(i, ctx)? else {
            continue;
        };
        let Some((target, args)) = method_target(&concrete) else {
            warn!(promiser = %concrete.promise.promiser, "Method promise without usebundle");
            continue;
        };

        let callee = policy
            .find_bundle(&target)
            .ok_or(PolicyError::UnknownBundle { name: target })?;

        info!(method = %concrete.promise.promiser, bundle = %callee.name, "Entering method bundle");
        run_bundle_boxed(policy, callee, &args, ctx, registry, options).await?;

        if ctx.classes.abort_requested().is_some() {
            return Ok(());
        }
    }

    mark_promise_handle(promise, ctx)?;
    Ok(())
}

fn method_target(concrete: &ConcretePromise) -> Option<(String, Vec<String>)> {
    let constraint = concrete.promise.constraints_named("usebundle").next()?;
    match &constraint.rval {
        Rval::Scalar(name) => Some((name.clone(), Vec::new())),
        Rval::FnCall(call) => Some((call.name.clone(), call.args.clone())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// shared helpers
// ---------------------------------------------------------------------------

/// `ifvarclass` check for natively-kept promises (vars/classes). A guard
/// that does not expand excludes the promise.
fn iteration_guard_excludes(promise: &Promise, ctx: &mut EvalContext) -> Result<bool> {
    let ns = ctx.namespace.clone();
    let scope = ctx.current_scope.clone();
    let Some(guard) = attrs::get_scalar(promise, "ifvarclass", &ctx.classes, &ns)? else {
        return Ok(false);
    };
    let expanded = match ctx.vars.expand(&guard, &ns, &scope)? {
        Expansion::Done(g) => g,
        Expansion::Dangler(_) => return Ok(true),
    };
    Ok(!expr::is_defined(&expanded, &ctx.classes, &ns))
}

fn mark_promise_handle(promise: &Promise, ctx: &mut EvalContext) -> Result<()> {
    let ns = ctx.namespace.clone();
    if let Some(handle) = attrs::get_scalar(promise, "handle", &ctx.classes, &ns)? {
        ctx.mark_handle_done(&ns, &handle);
    }
    Ok(())
}
