//! Error types for the policy-evaluation engine
//!
//! Everything user-caused surfaces as a [`PolicyError`] diagnostic and the
//! run continues with the next promise; only invariant breaches inside the
//! engine itself panic. Storage failures arrive via `Store` and are treated
//! as soft: reads degrade to "absent", writes are dropped with a warning.

use thiserror::Error;

use crate::policy::Origin;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors raised while evaluating policy.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// A constraint's r-value has the wrong shape for its l-value
    #[error("{origin}: type mismatch for \"{lval}\": expected {expected}, got {actual}")]
    TypeMismatch {
        lval: String,
        expected: &'static str,
        actual: &'static str,
        origin: Origin,
    },

    /// Two constraints with the same l-value both have true guards
    #[error("{origin}: inconsistent \"{lval}\" constraints break this promise (also at {other})")]
    InconsistentConstraints {
        lval: String,
        origin: Origin,
        other: Origin,
    },

    /// A class expression failed to parse
    #[error("syntax error in class expression at position {position}: {expr}")]
    ExpressionSyntax { expr: String, position: usize },

    /// A variable reference failed to parse
    #[error("malformed variable reference \"{reference}\"")]
    BadReference { reference: String },

    /// Variable redefinition forbidden by the variable's policy
    #[error("redefinition of {scope}.{lval} violates its \"{policy}\" policy")]
    Redefinition {
        scope: String,
        lval: String,
        policy: String,
    },

    /// Scalar actual supplied for a list formal when augmenting a scope
    #[error("list parameter \"{formal}\" of scope \"{scope}\" bound to non-list value")]
    ListParameterMismatch { formal: String, scope: String },

    /// Formal/actual arity mismatch when calling a bundle or body
    #[error("\"{name}\" takes {formals} parameters, {actuals} supplied")]
    ParameterMismatch {
        name: String,
        formals: usize,
        actuals: usize,
    },

    /// Bundle named in the bundlesequence or a methods call does not exist
    #[error("bundle \"{name}\" not found")]
    UnknownBundle { name: String },

    /// Body referenced as an r-value does not exist
    #[error("body \"{name}\" not found")]
    UnknownBody { name: String },

    /// Promise type has no registered actuator
    #[error("no actuator registered for promise type \"{promise_type}\"")]
    UnknownPromiseType { promise_type: String },

    /// A value was outside its permitted range
    #[error("{origin}: value \"{value}\" out of range for \"{lval}\"")]
    BadRange {
        lval: String,
        value: String,
        origin: Origin,
    },

    /// Variable expansion exceeded the recursion bound
    #[error("expansion of \"{input}\" exceeded depth {depth}")]
    ExpansionDepth { input: String, depth: usize },

    /// Startup requirement on the workspace directory not met
    #[error("workspace error: {0}")]
    Workspace(String),

    /// Underlying state store failure (soft; callers degrade)
    #[error(transparent)]
    Store(#[from] pact_state::StoreError),
}

impl PolicyError {
    /// True when the error means "skip this promise and keep going".
    ///
    /// Only `Workspace` is fatal at startup; everything else is recorded
    /// and the run continues with the next promise.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PolicyError::Workspace(_))
    }
}
