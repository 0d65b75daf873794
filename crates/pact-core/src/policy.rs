//! Policy AST
//!
//! The engine consumes an already-built abstract syntax tree: a [`Policy`]
//! holding bundles of promises and reusable constraint bodies. Surface
//! syntax is out of scope; the tree deserializes from JSON.
//!
//! R-values are a closed sum type ([`Rval`]) so that every consumer matches
//! exhaustively and new variants are found at compile time.

use serde::{Deserialize, Serialize};

/// Default namespace for unqualified names.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The class guard that is always true.
pub const GUARD_ANY: &str = "any";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn guard_any() -> String {
    GUARD_ANY.to_string()
}

// ---------------------------------------------------------------------------
// Source origin
// ---------------------------------------------------------------------------

/// Where a promise or constraint came from, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
}

impl Origin {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.file.is_empty() {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}:{}", self.file, self.line)
        }
    }
}

// ---------------------------------------------------------------------------
// R-values
// ---------------------------------------------------------------------------

/// An unevaluated function call appearing as an r-value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnCall {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A reference to a named body, with actual arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyRef {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The right-hand side of a constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", content = "value")]
pub enum Rval {
    /// A scalar string, possibly containing unexpanded `$(..)`/`@(..)` refs.
    Scalar(String),
    /// A literal integer.
    Int(i64),
    /// A literal real.
    Real(f64),
    /// An ordered list of scalar strings.
    List(Vec<String>),
    /// An unevaluated function call.
    FnCall(FnCall),
    /// A reference to a named body of constraints.
    Body(BodyRef),
}

impl Rval {
    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Rval::Scalar(_) => "scalar",
            Rval::Int(_) => "int",
            Rval::Real(_) => "real",
            Rval::List(_) => "list",
            Rval::FnCall(_) => "fncall",
            Rval::Body(_) => "body",
        }
    }

    /// The scalar payload, if this is a scalar.
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Rval::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// The list payload, if this is a list.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Rval::List(items) => Some(items),
            _ => None,
        }
    }

    /// Render for reports and digests: lists as `{a,b}`, calls as `f(x,y)`.
    pub fn render(&self) -> String {
        match self {
            Rval::Scalar(s) => s.clone(),
            Rval::Int(i) => i.to_string(),
            Rval::Real(r) => r.to_string(),
            Rval::List(items) => format!("{{{}}}", items.join(",")),
            Rval::FnCall(call) => format!("{}({})", call.name, call.args.join(",")),
            Rval::Body(body) => format!("{}({})", body.name, body.args.join(",")),
        }
    }
}

// ---------------------------------------------------------------------------
// Constraints, promises, sections
// ---------------------------------------------------------------------------

/// One l-value/r-value pair inside a promise or body, guarded by its own
/// class expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub lval: String,
    pub rval: Rval,
    #[serde(default = "guard_any")]
    pub class_guard: String,
    #[serde(default)]
    pub origin: Origin,
}

impl Constraint {
    pub fn new(lval: impl Into<String>, rval: Rval) -> Self {
        Self {
            lval: lval.into(),
            rval,
            class_guard: guard_any(),
            origin: Origin::default(),
        }
    }

    pub fn guarded(mut self, guard: impl Into<String>) -> Self {
        self.class_guard = guard.into();
        self
    }
}

/// The atomic policy statement: a promiser bound to a set of constraints
/// under a class guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promise {
    pub promiser: String,
    #[serde(default)]
    pub promisee: Option<String>,
    #[serde(default = "guard_any")]
    pub class_guard: String,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub origin: Origin,
}

impl Promise {
    pub fn new(promiser: impl Into<String>) -> Self {
        Self {
            promiser: promiser.into(),
            promisee: None,
            class_guard: guard_any(),
            constraints: Vec::new(),
            origin: Origin::default(),
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// All constraints with the given l-value, in source order.
    pub fn constraints_named<'a>(
        &'a self,
        lval: &'a str,
    ) -> impl Iterator<Item = &'a Constraint> + 'a {
        self.constraints.iter().filter(move |c| c.lval == lval)
    }
}

/// Promises of one type, in source order, inside a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Promise type: `vars`, `classes`, `files`, `reports`, ...
    pub promise_type: String,
    pub promises: Vec<Promise>,
}

// ---------------------------------------------------------------------------
// Bundles and bodies
// ---------------------------------------------------------------------------

/// A named, parameterised collection of promises, grouped into sections
/// by promise type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Agent role this bundle belongs to: `agent`, `common`, `server`, ...
    pub bundle_type: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub origin: Origin,
}

impl Bundle {
    /// The section for `promise_type`, if the bundle has one.
    pub fn section(&self, promise_type: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.promise_type == promise_type)
    }
}

/// A named, parameterised group of constraints reusable by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Which constraint family this body feeds: `action`, `classes`, ...
    pub body_type: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub origin: Origin,
}

/// One entry of the bundlesequence: a bundle name with actual arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleCall {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl BundleCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy root
// ---------------------------------------------------------------------------

/// A complete parsed policy: bundles, bodies, and the order to run them in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub bundles: Vec<Bundle>,
    #[serde(default)]
    pub bodies: Vec<Body>,
    #[serde(default)]
    pub bundlesequence: Vec<BundleCall>,
}

impl Policy {
    /// Load a policy tree from its JSON form.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Find a bundle by name; unqualified names match the default namespace.
    pub fn find_bundle(&self, name: &str) -> Option<&Bundle> {
        let (ns, local) = match name.split_once(':') {
            Some((ns, local)) => (ns, local),
            None => (DEFAULT_NAMESPACE, name),
        };
        self.bundles
            .iter()
            .find(|b| b.name == local && b.namespace == ns)
    }

    /// Find a body by name; unqualified names match the default namespace.
    pub fn find_body(&self, name: &str) -> Option<&Body> {
        let (ns, local) = match name.split_once(':') {
            Some((ns, local)) => (ns, local),
            None => (DEFAULT_NAMESPACE, name),
        };
        self.bodies
            .iter()
            .find(|b| b.name == local && b.namespace == ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rval_serde_tagging() {
        let json = r#"{"type":"list","value":["a","b"]}"#;
        let rval: Rval = serde_json::from_str(json).unwrap();
        assert_eq!(rval, Rval::List(vec!["a".into(), "b".into()]));
        assert_eq!(serde_json::to_string(&rval).unwrap(), json);
    }

    #[test]
    fn test_promise_defaults() {
        let json = r#"{"promiser":"/tmp/x"}"#;
        let promise: Promise = serde_json::from_str(json).unwrap();
        assert_eq!(promise.class_guard, "any");
        assert!(promise.constraints.is_empty());
    }

    #[test]
    fn test_find_bundle_respects_namespace() {
        let policy = Policy {
            bundles: vec![
                Bundle {
                    name: "update".into(),
                    namespace: "default".into(),
                    bundle_type: "agent".into(),
                    params: vec![],
                    sections: vec![],
                    origin: Origin::default(),
                },
                Bundle {
                    name: "update".into(),
                    namespace: "site".into(),
                    bundle_type: "agent".into(),
                    params: vec![],
                    sections: vec![],
                    origin: Origin::default(),
                },
            ],
            bodies: vec![],
            bundlesequence: vec![],
        };

        assert_eq!(policy.find_bundle("update").unwrap().namespace, "default");
        assert_eq!(policy.find_bundle("site:update").unwrap().namespace, "site");
        assert!(policy.find_bundle("nowhere:update").is_none());
    }

    #[test]
    fn test_rval_render_forms() {
        assert_eq!(Rval::Scalar("x".into()).render(), "x");
        assert_eq!(Rval::List(vec!["a".into(), "b".into()]).render(), "{a,b}");
        let call = Rval::FnCall(FnCall {
            name: "readfile".into(),
            args: vec!["/etc/hosts".into()],
        });
        assert_eq!(call.render(), "readfile(/etc/hosts)");
    }
}
