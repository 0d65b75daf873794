//! Constraint resolution and typed attribute access
//!
//! Given a promise and an l-value, [`effective`] returns the single
//! constraint whose class guard is true. Multiple true-guarded candidates
//! for one l-value are a user error, reported once with both origins; the
//! first wins so the promise can still proceed. Type mismatches are fatal
//! policy errors carrying the constraint's origin.
//!
//! The typed accessors layer unit parsing on top: `k/K/m/M/g/G` multipliers,
//! `%` as a negative sentinel, `inf` and `now` for integers; octal modes;
//! uid/gid by number or name with `*` meaning "same".

use tracing::error;

use crate::classes::ClassStore;
use crate::error::{PolicyError, Result};
use crate::expr;
use crate::policy::{Constraint, FnCall, Promise, Rval};

use pact_state::PersistPolicy;

/// Integer value of the literal `inf`.
pub const INT_INFINITY: i64 = 999_999_999;

// ---------------------------------------------------------------------------
// Effective constraint
// ---------------------------------------------------------------------------

/// The unique constraint for `lval` whose guard holds, or `None`.
pub fn effective<'a>(
    promise: &'a Promise,
    lval: &'a str,
    classes: &ClassStore,
    ns: &str,
) -> Option<&'a Constraint> {
    let mut found: Option<&Constraint> = None;
    for constraint in promise.constraints_named(lval) {
        if !expr::is_defined(&constraint.class_guard, classes, ns) {
            continue;
        }
        match found {
            None => found = Some(constraint),
            Some(first) => {
                error!(
                    promiser = %promise.promiser,
                    lval = %lval,
                    first = %first.origin,
                    second = %constraint.origin,
                    "Inconsistent constraints break this promise"
                );
                break;
            }
        }
    }
    found
}

fn scalar_of<'a>(constraint: &'a Constraint, lval: &str) -> Result<&'a str> {
    constraint
        .rval
        .as_scalar()
        .ok_or_else(|| PolicyError::TypeMismatch {
            lval: lval.to_string(),
            expected: "scalar",
            actual: constraint.rval.kind(),
            origin: constraint.origin.clone(),
        })
}

// ---------------------------------------------------------------------------
// Scalar conversions
// ---------------------------------------------------------------------------

/// Parse an integer with unit suffixes. `now` resolves to `start_time`.
///
/// Percentages are stored as negative numbers so consumers can tell them
/// from absolute values; out-of-range percentages are `None`.
pub fn int_from_string(s: &str, start_time: i64) -> Option<i64> {
    let s = s.trim();
    match s {
        "inf" => return Some(INT_INFINITY),
        "now" => return Some(start_time),
        _ => {}
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '-' && c != '+')
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let base: i64 = digits.parse().ok()?;

    match suffix {
        "" => Some(base),
        "k" => Some(base * 1_000),
        "K" => Some(base * 1_024),
        "m" => Some(base * 1_000_000),
        "M" => Some(base * 1_024 * 1_024),
        "g" => Some(base * 1_000_000_000),
        "G" => Some(base * 1_024 * 1_024 * 1_024),
        "%" => {
            if !(0..=100).contains(&base) {
                error!(value = base, "Percentage out of range");
                None
            } else {
                Some(-base)
            }
        }
        _ => None,
    }
}

/// Parse a boolean: `true`/`yes`/`on` or `false`/`no`/`off`.
pub fn bool_from_string(s: &str) -> Option<bool> {
    match s {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse an octal file mode.
pub fn mode_from_string(s: &str) -> Option<u32> {
    u32::from_str_radix(s.trim(), 8).ok()
}

/// An owner/group specification on a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpec {
    /// A concrete numeric id.
    Id(u32),
    /// `*`: keep whatever the resource already has.
    Same,
}

fn lookup_in_table(path: &str, name: &str) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        let mut fields = line.split(':');
        if fields.next() == Some(name) {
            let _password = fields.next()?;
            return fields.next()?.parse().ok();
        }
    }
    None
}

/// Parse a uid: numeric, `*`, or a user name resolved via the passwd table.
pub fn uid_from_string(s: &str) -> Option<IdSpec> {
    let s = s.trim();
    if s == "*" {
        return Some(IdSpec::Same);
    }
    if let Ok(uid) = s.parse() {
        return Some(IdSpec::Id(uid));
    }
    lookup_in_table("/etc/passwd", s).map(IdSpec::Id)
}

/// Parse a gid: numeric, `*`, or a group name resolved via the group table.
pub fn gid_from_string(s: &str) -> Option<IdSpec> {
    let s = s.trim();
    if s == "*" {
        return Some(IdSpec::Same);
    }
    if let Ok(gid) = s.parse() {
        return Some(IdSpec::Id(gid));
    }
    lookup_in_table("/etc/group", s).map(IdSpec::Id)
}

// ---------------------------------------------------------------------------
// Typed accessors
// ---------------------------------------------------------------------------

/// The effective scalar for `lval`, if any.
pub fn get_scalar(
    promise: &Promise,
    lval: &str,
    classes: &ClassStore,
    ns: &str,
) -> Result<Option<String>> {
    match effective(promise, lval, classes, ns) {
        Some(c) => Ok(Some(scalar_of(c, lval)?.to_string())),
        None => Ok(None),
    }
}

/// The effective boolean for `lval`, if any.
pub fn get_bool(
    promise: &Promise,
    lval: &str,
    classes: &ClassStore,
    ns: &str,
) -> Result<Option<bool>> {
    let Some(constraint) = effective(promise, lval, classes, ns) else {
        return Ok(None);
    };
    let raw = scalar_of(constraint, lval)?;
    bool_from_string(raw)
        .map(Some)
        .ok_or_else(|| PolicyError::BadRange {
            lval: lval.to_string(),
            value: raw.to_string(),
            origin: constraint.origin.clone(),
        })
}

/// The effective integer for `lval` (unit suffixes honoured), if any.
pub fn get_int(
    promise: &Promise,
    lval: &str,
    classes: &ClassStore,
    ns: &str,
    start_time: i64,
) -> Result<Option<i64>> {
    let Some(constraint) = effective(promise, lval, classes, ns) else {
        return Ok(None);
    };
    match &constraint.rval {
        Rval::Int(v) => Ok(Some(*v)),
        Rval::Scalar(raw) => {
            int_from_string(raw, start_time)
                .map(Some)
                .ok_or_else(|| PolicyError::BadRange {
                    lval: lval.to_string(),
                    value: raw.clone(),
                    origin: constraint.origin.clone(),
                })
        }
        other => Err(PolicyError::TypeMismatch {
            lval: lval.to_string(),
            expected: "int",
            actual: other.kind(),
            origin: constraint.origin.clone(),
        }),
    }
}

/// The effective real for `lval`, if any.
pub fn get_real(
    promise: &Promise,
    lval: &str,
    classes: &ClassStore,
    ns: &str,
) -> Result<Option<f64>> {
    let Some(constraint) = effective(promise, lval, classes, ns) else {
        return Ok(None);
    };
    match &constraint.rval {
        Rval::Real(v) => Ok(Some(*v)),
        Rval::Int(v) => Ok(Some(*v as f64)),
        Rval::Scalar(raw) => raw.trim().parse().map(Some).map_err(|_| PolicyError::BadRange {
            lval: lval.to_string(),
            value: raw.clone(),
            origin: constraint.origin.clone(),
        }),
        other => Err(PolicyError::TypeMismatch {
            lval: lval.to_string(),
            expected: "real",
            actual: other.kind(),
            origin: constraint.origin.clone(),
        }),
    }
}

/// The effective octal mode for `lval`, if any.
pub fn get_mode(
    promise: &Promise,
    lval: &str,
    classes: &ClassStore,
    ns: &str,
) -> Result<Option<u32>> {
    let Some(constraint) = effective(promise, lval, classes, ns) else {
        return Ok(None);
    };
    let raw = scalar_of(constraint, lval)?;
    mode_from_string(raw)
        .map(Some)
        .ok_or_else(|| PolicyError::BadRange {
            lval: lval.to_string(),
            value: raw.to_string(),
            origin: constraint.origin.clone(),
        })
}

/// The effective uid for `lval`, if any.
pub fn get_uid(
    promise: &Promise,
    lval: &str,
    classes: &ClassStore,
    ns: &str,
) -> Result<Option<IdSpec>> {
    let Some(constraint) = effective(promise, lval, classes, ns) else {
        return Ok(None);
    };
    let raw = scalar_of(constraint, lval)?;
    uid_from_string(raw)
        .map(Some)
        .ok_or_else(|| PolicyError::BadRange {
            lval: lval.to_string(),
            value: raw.to_string(),
            origin: constraint.origin.clone(),
        })
}

/// The effective gid for `lval`, if any.
pub fn get_gid(
    promise: &Promise,
    lval: &str,
    classes: &ClassStore,
    ns: &str,
) -> Result<Option<IdSpec>> {
    let Some(constraint) = effective(promise, lval, classes, ns) else {
        return Ok(None);
    };
    let raw = scalar_of(constraint, lval)?;
    gid_from_string(raw)
        .map(Some)
        .ok_or_else(|| PolicyError::BadRange {
            lval: lval.to_string(),
            value: raw.to_string(),
            origin: constraint.origin.clone(),
        })
}

/// The effective list for `lval`, if any.
pub fn get_list(
    promise: &Promise,
    lval: &str,
    classes: &ClassStore,
    ns: &str,
) -> Result<Option<Vec<String>>> {
    let Some(constraint) = effective(promise, lval, classes, ns) else {
        return Ok(None);
    };
    match &constraint.rval {
        Rval::List(items) => Ok(Some(items.clone())),
        other => Err(PolicyError::TypeMismatch {
            lval: lval.to_string(),
            expected: "list",
            actual: other.kind(),
            origin: constraint.origin.clone(),
        }),
    }
}

/// The effective function call for `lval`, if any.
pub fn get_fncall(
    promise: &Promise,
    lval: &str,
    classes: &ClassStore,
    ns: &str,
) -> Result<Option<FnCall>> {
    let Some(constraint) = effective(promise, lval, classes, ns) else {
        return Ok(None);
    };
    match &constraint.rval {
        Rval::FnCall(call) => Ok(Some(call.clone())),
        other => Err(PolicyError::TypeMismatch {
            lval: lval.to_string(),
            expected: "fncall",
            actual: other.kind(),
            origin: constraint.origin.clone(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Resolved attribute bundles
// ---------------------------------------------------------------------------

/// What a non-kept promise is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionPolicy {
    /// Repair the resource.
    #[default]
    Fix,
    /// Only warn about the drift.
    Warn,
    /// Take no action at all.
    Nop,
}

/// Resolved `transaction` body attributes for one promise.
#[derive(Debug, Clone)]
pub struct TransactionAttrs {
    pub action: ActionPolicy,
    /// Minutes that must elapse since last completion before re-assessment.
    pub ifelapsed: u32,
    /// Minutes after which an in-progress repair is considered stale.
    pub expireafter: u32,
    pub log_string: Option<String>,
    pub log_level: Option<String>,
    pub log_priority: Option<String>,
    pub log_kept: Option<String>,
    pub log_repaired: Option<String>,
    pub log_failed: Option<String>,
    pub background: bool,
    pub measurement_class: Option<String>,
}

/// Global fallbacks for the rate-limit/expiry gates.
#[derive(Debug, Clone, Copy)]
pub struct TransactionDefaults {
    pub ifelapsed: u32,
    pub expireafter: u32,
}

impl Default for TransactionDefaults {
    fn default() -> Self {
        Self {
            ifelapsed: 1,
            expireafter: 120,
        }
    }
}

/// Resolve the transaction attributes of `promise`.
pub fn transaction_attrs(
    promise: &Promise,
    classes: &ClassStore,
    ns: &str,
    defaults: TransactionDefaults,
    start_time: i64,
) -> Result<TransactionAttrs> {
    let action = match get_scalar(promise, "action", classes, ns)?.as_deref() {
        None | Some("fix") => ActionPolicy::Fix,
        Some("warn") => ActionPolicy::Warn,
        Some("nop") => ActionPolicy::Nop,
        Some(other) => {
            let origin = effective(promise, "action", classes, ns)
                .map(|c| c.origin.clone())
                .unwrap_or_default();
            return Err(PolicyError::BadRange {
                lval: "action".to_string(),
                value: other.to_string(),
                origin,
            });
        }
    };

    let clamp = |v: i64| u32::try_from(v.max(0)).unwrap_or(u32::MAX);

    Ok(TransactionAttrs {
        action,
        ifelapsed: get_int(promise, "ifelapsed", classes, ns, start_time)?
            .map_or(defaults.ifelapsed, clamp),
        expireafter: get_int(promise, "expireafter", classes, ns, start_time)?
            .map_or(defaults.expireafter, clamp),
        log_string: get_scalar(promise, "log_string", classes, ns)?,
        log_level: get_scalar(promise, "log_level", classes, ns)?,
        log_priority: get_scalar(promise, "log_priority", classes, ns)?,
        log_kept: get_scalar(promise, "log_kept", classes, ns)?,
        log_repaired: get_scalar(promise, "log_repaired", classes, ns)?,
        log_failed: get_scalar(promise, "log_failed", classes, ns)?,
        background: get_bool(promise, "background", classes, ns)?.unwrap_or(false),
        measurement_class: get_scalar(promise, "measurement_class", classes, ns)?,
    })
}

/// Resolved `classes` body attributes: classes to define or cancel per
/// outcome, with optional persistence.
#[derive(Debug, Clone)]
pub struct ClassesAttrs {
    pub promise_kept: Vec<String>,
    pub promise_repaired: Vec<String>,
    pub repair_failed: Vec<String>,
    pub repair_denied: Vec<String>,
    pub repair_timeout: Vec<String>,
    pub cancel_kept: Vec<String>,
    pub cancel_repaired: Vec<String>,
    pub cancel_notkept: Vec<String>,
    /// Minutes the defined classes persist; 0 means not persistent.
    pub persist_time: u32,
    pub timer_policy: PersistPolicy,
}

impl Default for ClassesAttrs {
    fn default() -> Self {
        Self {
            promise_kept: Vec::new(),
            promise_repaired: Vec::new(),
            repair_failed: Vec::new(),
            repair_denied: Vec::new(),
            repair_timeout: Vec::new(),
            cancel_kept: Vec::new(),
            cancel_repaired: Vec::new(),
            cancel_notkept: Vec::new(),
            persist_time: 0,
            timer_policy: PersistPolicy::Reset,
        }
    }
}

/// Resolve the outcome-class attributes of `promise`.
pub fn classes_attrs(
    promise: &Promise,
    classes: &ClassStore,
    ns: &str,
    start_time: i64,
) -> Result<ClassesAttrs> {
    let list = |lval: &str| -> Result<Vec<String>> {
        Ok(get_list(promise, lval, classes, ns)?.unwrap_or_default())
    };

    let timer_policy = match get_scalar(promise, "timer_policy", classes, ns)?.as_deref() {
        None | Some("reset") => PersistPolicy::Reset,
        Some("absolute") => PersistPolicy::Preserve,
        Some(other) => {
            let origin = effective(promise, "timer_policy", classes, ns)
                .map(|c| c.origin.clone())
                .unwrap_or_default();
            return Err(PolicyError::BadRange {
                lval: "timer_policy".to_string(),
                value: other.to_string(),
                origin,
            });
        }
    };

    Ok(ClassesAttrs {
        promise_kept: list("promise_kept")?,
        promise_repaired: list("promise_repaired")?,
        repair_failed: list("repair_failed")?,
        repair_denied: list("repair_denied")?,
        repair_timeout: list("repair_timeout")?,
        cancel_kept: list("cancel_kept")?,
        cancel_repaired: list("cancel_repaired")?,
        cancel_notkept: list("cancel_notkept")?,
        persist_time: get_int(promise, "persist_time", classes, ns, start_time)?
            .map_or(0, |v| u32::try_from(v.max(0)).unwrap_or(u32::MAX)),
        timer_policy,
    })
}
