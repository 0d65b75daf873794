//! Promise expansion and iteration
//!
//! Turns one parsed promise whose outer guard has passed into a sequence of
//! *concrete promises*:
//!
//! 1. deref copy: body r-values inline with their arguments substituted
//! 2. reference scan: unexpanded `$(v)`/`@(v)` refs classify as scalar- or
//!    list-refs; function calls evaluate here, and a list-returning call
//!    promotes its ref
//! 3. the iteration space is the cartesian product of the list values, in
//!    first-appearance order; an unresolved or empty list skips the promise
//! 4. each iteration binds its elements into the `this` scope, re-expands
//!    every scalar, re-checks `ifvarclass` and per-constraint guards, and
//!    collapses duplicate l-values to the effective constraint
//!
//! A dangling reference at iteration time skips that iteration only.

use tracing::{debug, warn};

use crate::context::EvalContext;
use crate::error::{PolicyError, Result};
use crate::expr;
use crate::fns;
use crate::lock::LockSubject;
use crate::policy::{Constraint, Policy, Promise, Rval, GUARD_ANY};
use crate::vars::{Expansion, VarPolicy};

/// Upper bound on the iteration cross-product.
pub const MAX_ITERATIONS: usize = 10_000;

/// Bound on list length carried by a single variable.
pub const MAX_LIST_LEN: usize = 10_000;

// ---------------------------------------------------------------------------
// Concrete promises
// ---------------------------------------------------------------------------

/// One fully-expanded promise, ready for an actuator.
#[derive(Debug, Clone)]
pub struct ConcretePromise {
    pub promise: Promise,
    pub bundle: String,
    pub namespace: String,
    pub promise_type: String,
}

impl ConcretePromise {
    /// Lock identity material for this concrete promise.
    pub fn lock_subject(&self, host: &str) -> LockSubject {
        LockSubject {
            bundle: self.bundle.clone(),
            promise_type: self.promise_type.clone(),
            promiser: self.promise.promiser.clone(),
            constraints: self
                .promise
                .constraints
                .iter()
                .map(|c| (c.lval.clone(), c.rval.render()))
                .collect(),
            host: host.to_string(),
        }
    }

    /// The promise's `handle`, if declared.
    pub fn handle(&self) -> Option<&str> {
        self.promise
            .constraints_named("handle")
            .next()
            .and_then(|c| c.rval.as_scalar())
    }
}

// ---------------------------------------------------------------------------
// Deref copy
// ---------------------------------------------------------------------------

/// Combine two class guards into their conjunction.
fn merge_guards(outer: &str, inner: &str) -> String {
    match (outer == GUARD_ANY, inner == GUARD_ANY) {
        (true, true) => GUARD_ANY.to_string(),
        (true, false) => inner.to_string(),
        (false, true) => outer.to_string(),
        (false, false) => format!("({outer}).({inner})"),
    }
}

/// Substitute a body's formal parameters into a scalar.
fn substitute_params(text: &str, formals: &[String], actuals: &[String]) -> String {
    let mut out = text.to_string();
    for (formal, actual) in formals.iter().zip(actuals) {
        out = out.replace(&format!("$({formal})"), actual);
        out = out.replace(&format!("${{{formal}}}"), actual);
    }
    out
}

/// Deep-copy `promise` with every body r-value inlined.
///
/// Inlined constraints keep their own guards, conjoined with the guard of
/// the constraint that referenced the body.
pub fn deref_copy(policy: &Policy, promise: &Promise) -> Result<Promise> {
    let mut copy = promise.clone();
    let mut constraints = Vec::with_capacity(copy.constraints.len());

    for constraint in copy.constraints.drain(..) {
        match &constraint.rval {
            Rval::Body(body_ref) => {
                let body = policy
                    .find_body(&body_ref.name)
                    .ok_or_else(|| PolicyError::UnknownBody {
                        name: body_ref.name.clone(),
                    })?;
                if body.params.len() != body_ref.args.len() {
                    return Err(PolicyError::ParameterMismatch {
                        name: body.name.clone(),
                        formals: body.params.len(),
                        actuals: body_ref.args.len(),
                    });
                }
                for inner in &body.constraints {
                    let rval = match &inner.rval {
                        Rval::Scalar(s) => {
                            Rval::Scalar(substitute_params(s, &body.params, &body_ref.args))
                        }
                        Rval::List(items) => Rval::List(
                            items
                                .iter()
                                .map(|s| substitute_params(s, &body.params, &body_ref.args))
                                .collect(),
                        ),
                        other => other.clone(),
                    };
                    constraints.push(Constraint {
                        lval: inner.lval.clone(),
                        rval,
                        class_guard: merge_guards(&constraint.class_guard, &inner.class_guard),
                        origin: inner.origin.clone(),
                    });
                }
            }
            _ => constraints.push(constraint),
        }
    }

    copy.constraints = constraints;
    Ok(copy)
}

// ---------------------------------------------------------------------------
// Reference scan
// ---------------------------------------------------------------------------

/// Outermost `$(..)`/`${..}`/`@(..)`/`@{..}` reference bodies in `s`, in
/// source order.
pub fn find_refs(s: &str) -> Vec<String> {
    let bytes = s.as_bytes();
    let mut refs = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        let sigil = bytes[i];
        let open = bytes[i + 1];
        if (sigil == b'$' || sigil == b'@') && (open == b'(' || open == b'{') {
            let close = if open == b'(' { b')' } else { b'}' };
            let mut depth = 1;
            let mut j = i + 2;
            while j < bytes.len() {
                if bytes[j] == open {
                    depth += 1;
                } else if bytes[j] == close {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                j += 1;
            }
            if j < bytes.len() {
                refs.push(s[i + 2..j].to_string());
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    refs
}

fn strings_of(promise: &Promise) -> Vec<String> {
    let mut strings = vec![promise.promiser.clone()];
    for constraint in &promise.constraints {
        match &constraint.rval {
            Rval::Scalar(s) => strings.push(s.clone()),
            Rval::List(items) => strings.extend(items.iter().cloned()),
            Rval::FnCall(call) => strings.extend(call.args.iter().cloned()),
            _ => {}
        }
    }
    strings
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// The prepared iteration space of one promise.
pub struct PromiseIterations {
    base: Promise,
    pub bundle: String,
    pub namespace: String,
    pub promise_type: String,
    /// `(reference text, resolved elements)`, in first-appearance order.
    lists: Vec<(String, Vec<String>)>,
    total: usize,
}

impl PromiseIterations {
    /// Build the iteration space. `Ok(None)` means the promise is skipped
    /// (unresolved or empty list, bad function call) with a warning.
    pub fn prepare(
        policy: &Policy,
        bundle_name: &str,
        promise_type: &str,
        promise: &Promise,
        ctx: &mut EvalContext,
    ) -> Result<Option<Self>> {
        let mut base = deref_copy(policy, promise)?;
        let ns = ctx.namespace.clone();
        let scope = ctx.current_scope.clone();

        // Function-call r-values evaluate before iteration. A `usebundle`
        // call is a bundle invocation, not a function; the scheduler
        // resolves it per iteration.
        for constraint in &mut base.constraints {
            if constraint.lval == "usebundle" {
                continue;
            }
            if let Rval::FnCall(call) = &constraint.rval {
                let mut call = call.clone();
                for arg in &mut call.args {
                    *arg = ctx.vars.expand_partial(arg, &ns, &scope)?;
                }
                match fns::evaluate(&call, &ctx.vars, &ns, &scope) {
                    Some(value) => constraint.rval = value,
                    None => {
                        warn!(
                            promiser = %promise.promiser,
                            function = %call.name,
                            "Skipping promise: function call did not evaluate"
                        );
                        return Ok(None);
                    }
                }
            }
        }

        // Resolve what we can now; iteration variables stay unexpanded.
        base.promiser = ctx.vars.expand_partial(&base.promiser, &ns, &scope)?;
        for constraint in &mut base.constraints {
            match &mut constraint.rval {
                Rval::Scalar(s) => *s = ctx.vars.expand_partial(s, &ns, &scope)?,
                Rval::List(items) => {
                    for item in items.iter_mut() {
                        *item = ctx.vars.expand_partial(item, &ns, &scope)?;
                    }
                }
                _ => {}
            }
        }

        // Classify the remaining references.
        let mut lists: Vec<(String, Vec<String>)> = Vec::new();
        for text in strings_of(&base) {
            for reference in find_refs(&text) {
                if lists.iter().any(|(name, _)| *name == reference) {
                    continue;
                }
                let resolved = ctx.vars.resolve(&reference, &ns, &scope).cloned();
                match resolved {
                    Some(Rval::List(items)) => {
                        if items.is_empty() {
                            warn!(
                                promiser = %base.promiser,
                                list = %reference,
                                "Skipping promise: list is empty"
                            );
                            return Ok(None);
                        }
                        if items.len() > MAX_LIST_LEN {
                            return Err(PolicyError::BadRange {
                                lval: reference,
                                value: format!("list of {} items", items.len()),
                                origin: base.origin.clone(),
                            });
                        }
                        lists.push((reference, items));
                    }
                    Some(Rval::FnCall(call)) => {
                        // A ref resolving to a function call: evaluate, and a
                        // list result promotes the ref to a list-ref.
                        match fns::evaluate(&call, &ctx.vars, &ns, &scope) {
                            Some(Rval::List(items)) if items.is_empty() => {
                                warn!(promiser = %base.promiser, list = %reference,
                                      "Skipping promise: function returned an empty list");
                                return Ok(None);
                            }
                            Some(value) => {
                                if let Some(var) =
                                    VarRefMut::lookup(&mut ctx.vars, &reference, &ns, &scope)
                                {
                                    *var = value.clone();
                                }
                                if let Rval::List(items) = value {
                                    lists.push((reference, items));
                                }
                            }
                            None => {
                                warn!(promiser = %base.promiser, reference = %reference,
                                      "Skipping promise: function call did not evaluate");
                                return Ok(None);
                            }
                        }
                    }
                    _ => {
                        // Scalar refs were inlined above; anything left is an
                        // iteration-frame reference or a dangler found later.
                    }
                }
            }
        }

        let total = lists.iter().fold(1usize, |acc, (_, items)| {
            acc.saturating_mul(items.len())
        });
        if total > MAX_ITERATIONS {
            return Err(PolicyError::BadRange {
                lval: "iteration space".to_string(),
                value: format!("{total} iterations"),
                origin: base.origin.clone(),
            });
        }

        Ok(Some(Self {
            base,
            bundle: bundle_name.to_string(),
            namespace: ns,
            promise_type: promise_type.to_string(),
            lists,
            total,
        }))
    }

    /// Number of iteration points (1 when no list refs).
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Element index of list `j` at iteration point `i`: the last list
    /// varies fastest.
    fn element_index(&self, i: usize, j: usize) -> usize {
        let mut stride = 1;
        for (_, items) in self.lists.iter().skip(j + 1) {
            stride *= items.len();
        }
        (i / stride) % self.lists[j].1.len()
    }

    /// Produce the concrete promise for iteration point `i`, or `None`
    /// when this iteration is skipped (dangler or false guard).
    pub fn concretize(&self, i: usize, ctx: &mut EvalContext) -> Result<Option<ConcretePromise>> {
        assert!(i < self.total, "iteration index out of range");
        let ns = self.namespace.clone();
        let scope = ctx.current_scope.clone();

        let mut bound: Vec<String> = Vec::new();
        let bind = |ctx: &mut EvalContext, key: &str, value: String, bound: &mut Vec<String>| {
            ctx.vars.unset("this", key);
            let _ = ctx.vars.put(
                "this",
                key,
                Rval::Scalar(value),
                VarPolicy::Free,
                Default::default(),
            );
            bound.push(key.to_string());
        };

        for (j, (name, items)) in self.lists.iter().enumerate() {
            let element = items[self.element_index(i, j)].clone();
            bind(ctx, name, element, &mut bound);
        }
        bind(ctx, "promiser_idx", i.to_string(), &mut bound);

        let cleanup = |ctx: &mut EvalContext, bound: &[String]| {
            for key in bound {
                ctx.vars.unset("this", key);
            }
        };

        // Per-iteration promiser.
        let promiser = match ctx.vars.expand(&self.base.promiser, &ns, &scope)? {
            Expansion::Done(p) => p,
            Expansion::Dangler(reference) => {
                debug!(
                    promiser = %self.base.promiser,
                    reference = %reference,
                    "Skipping iteration: unresolved reference in promiser"
                );
                cleanup(ctx, &bound);
                return Ok(None);
            }
        };
        bind(ctx, "promiser", promiser.clone(), &mut bound);

        if let Some(handle) = self
            .base
            .constraints_named("handle")
            .next()
            .and_then(|c| c.rval.as_scalar())
        {
            if let Ok(Expansion::Done(handle)) = ctx.vars.expand(handle, &ns, &scope) {
                bind(ctx, "handle", handle, &mut bound);
            }
        }

        // Promise-level ifvarclass, evaluated on this iteration's bindings.
        if let Some(guard) = self
            .base
            .constraints_named("ifvarclass")
            .next()
            .and_then(|c| c.rval.as_scalar())
        {
            let expanded = match ctx.vars.expand(guard, &ns, &scope)? {
                Expansion::Done(g) => g,
                Expansion::Dangler(_) => {
                    debug!(promiser = %promiser, "Skipping iteration: ifvarclass did not expand");
                    cleanup(ctx, &bound);
                    return Ok(None);
                }
            };
            if !expr::is_defined(&expanded, &ctx.classes, &ns) {
                debug!(promiser = %promiser, guard = %expanded, "Skipping iteration: ifvarclass is false");
                cleanup(ctx, &bound);
                return Ok(None);
            }
        }

        // Expand and filter constraints.
        let mut constraints: Vec<Constraint> = Vec::new();
        for constraint in &self.base.constraints {
            if constraint.lval == "ifvarclass" {
                continue;
            }

            let guard = ctx.vars.expand_partial(&constraint.class_guard, &ns, &scope)?;
            if !expr::is_defined(&guard, &ctx.classes, &ns) {
                continue;
            }

            let rval = match &constraint.rval {
                Rval::Scalar(s) => match ctx.vars.expand(s, &ns, &scope)? {
                    Expansion::Done(s) => Rval::Scalar(s),
                    Expansion::Dangler(reference) => {
                        debug!(
                            promiser = %promiser,
                            lval = %constraint.lval,
                            reference = %reference,
                            "Skipping iteration: unresolved reference in constraint"
                        );
                        cleanup(ctx, &bound);
                        return Ok(None);
                    }
                },
                Rval::List(items) => {
                    let mut expanded = Vec::with_capacity(items.len());
                    for item in items {
                        match ctx.vars.expand(item, &ns, &scope)? {
                            Expansion::Done(s) => expanded.push(s),
                            Expansion::Dangler(reference) => {
                                debug!(
                                    promiser = %promiser,
                                    lval = %constraint.lval,
                                    reference = %reference,
                                    "Skipping iteration: unresolved reference in list"
                                );
                                cleanup(ctx, &bound);
                                return Ok(None);
                            }
                        }
                    }
                    Rval::List(expanded)
                }
                Rval::FnCall(call) => {
                    // Bundle-invocation arguments bind per iteration.
                    let mut call = call.clone();
                    for arg in &mut call.args {
                        match ctx.vars.expand(arg, &ns, &scope)? {
                            Expansion::Done(s) => *arg = s,
                            Expansion::Dangler(reference) => {
                                debug!(
                                    promiser = %promiser,
                                    lval = %constraint.lval,
                                    reference = %reference,
                                    "Skipping iteration: unresolved reference in call arguments"
                                );
                                cleanup(ctx, &bound);
                                return Ok(None);
                            }
                        }
                    }
                    Rval::FnCall(call)
                }
                other => other.clone(),
            };

            // Effective-constraint collapse: first true-guarded wins.
            if let Some(first) = constraints.iter().find(|c| c.lval == constraint.lval) {
                warn!(
                    promiser = %promiser,
                    lval = %constraint.lval,
                    first = %first.origin,
                    second = %constraint.origin,
                    "Inconsistent constraints break this promise"
                );
                continue;
            }

            constraints.push(Constraint {
                lval: constraint.lval.clone(),
                rval,
                class_guard: GUARD_ANY.to_string(),
                origin: constraint.origin.clone(),
            });
        }

        cleanup(ctx, &bound);

        let mut promise = self.base.clone();
        promise.promiser = promiser;
        promise.class_guard = GUARD_ANY.to_string();
        promise.constraints = constraints;

        Ok(Some(ConcretePromise {
            promise,
            bundle: self.bundle.clone(),
            namespace: ns,
            promise_type: self.promise_type.clone(),
        }))
    }
}

/// Mutable lookup helper used to memoize evaluated function calls back
/// into the variable that held them.
struct VarRefMut;

impl VarRefMut {
    fn lookup<'a>(
        vars: &'a mut crate::vars::VarStore,
        reference: &str,
        ns: &str,
        current: &str,
    ) -> Option<&'a mut Rval> {
        let parsed = crate::vars::VarRef::parse(reference).ok()?;
        let key = parsed.key();
        let table = parsed
            .scope_table(ns)
            .unwrap_or_else(|| current.to_string());
        vars.get_mut(&table, &key)
    }
}
