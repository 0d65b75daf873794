//! Variable store and reference resolver
//!
//! Scoped mapping from `(scope, lval, indices...)` to a tagged r-value, with
//! `$(name)` / `${name}` / `@(list)` / `@{list}` expansion inside scalar
//! strings. Scopes are an ordered map keyed by name; the special scopes
//! `sys`, `const`, `mon`, `edit`, `match` and `this` exist process-wide,
//! plus one scope per bundle.
//!
//! Expansion runs to a fixed point with a bounded depth. In strict mode an
//! unresolved reference is a *dangler*, which aborts the current promise
//! iteration (never the run); lenient mode leaves danglers in place so the
//! iteration engine can classify them first.

use indexmap::IndexMap;

use crate::error::{PolicyError, Result};
use crate::policy::{Origin, Rval, DEFAULT_NAMESPACE};

/// Maximum nesting depth for scalar expansion.
pub const MAX_EXPANSION_DEPTH: usize = 20;

/// Redefinition policy attached to a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarPolicy {
    /// Redefinition replaces the value.
    #[default]
    Free,
    /// Same as `Free`; named for policy-file symmetry.
    Overridable,
    /// Redefinition is a policy error.
    Constant,
    /// Redefinition is silently ignored while a value exists.
    IfDefined,
}

impl VarPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free" => Some(VarPolicy::Free),
            "overridable" => Some(VarPolicy::Overridable),
            "constant" => Some(VarPolicy::Constant),
            "ifdefined" => Some(VarPolicy::IfDefined),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            VarPolicy::Free => "free",
            VarPolicy::Overridable => "overridable",
            VarPolicy::Constant => "constant",
            VarPolicy::IfDefined => "ifdefined",
        }
    }
}

/// A stored variable.
#[derive(Debug, Clone)]
pub struct Variable {
    pub rval: Rval,
    pub policy: VarPolicy,
    pub origin: Origin,
}

// ---------------------------------------------------------------------------
// Variable references
// ---------------------------------------------------------------------------

/// A parsed variable reference: `[ns:]scope.lval[i1][i2]...` or a bare
/// `lval[i]...` resolved against the current scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
    pub namespace: Option<String>,
    pub scope: Option<String>,
    pub lval: String,
    pub indices: Vec<String>,
}

impl VarRef {
    /// Parse the canonical string form. The scope split happens at the
    /// first `.` before any index bracket.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(PolicyError::BadReference {
                reference: input.to_string(),
            });
        }

        let (namespace, rest) = match input.split_once(':') {
            Some((ns, rest)) if !ns.contains('.') && !ns.contains('[') => {
                (Some(ns.to_string()), rest)
            }
            _ => (None, input),
        };

        let bracket = rest.find('[').unwrap_or(rest.len());
        let (name_part, index_part) = rest.split_at(bracket);

        let (scope, lval) = match name_part.split_once('.') {
            Some((scope, lval)) if !scope.is_empty() && !lval.is_empty() => {
                (Some(scope.to_string()), lval.to_string())
            }
            _ => (None, name_part.to_string()),
        };

        if lval.is_empty() {
            return Err(PolicyError::BadReference {
                reference: input.to_string(),
            });
        }

        let mut indices = Vec::new();
        let mut remainder = index_part;
        while !remainder.is_empty() {
            if !remainder.starts_with('[') {
                return Err(PolicyError::BadReference {
                    reference: input.to_string(),
                });
            }
            match remainder[1..].find(']') {
                Some(end) => {
                    indices.push(remainder[1..=end].to_string());
                    remainder = &remainder[end + 2..];
                }
                None => {
                    return Err(PolicyError::BadReference {
                        reference: input.to_string(),
                    })
                }
            }
        }

        Ok(VarRef {
            namespace,
            scope,
            lval,
            indices,
        })
    }

    /// The storage key inside a scope: `lval[i1][i2]...`.
    pub fn key(&self) -> String {
        let mut key = self.lval.clone();
        for index in &self.indices {
            key.push('[');
            key.push_str(index);
            key.push(']');
        }
        key
    }

    /// The scope table name this reference addresses, given the caller's
    /// namespace, or `None` for an unqualified reference.
    pub fn scope_table(&self, ns: &str) -> Option<String> {
        let scope = self.scope.as_deref()?;
        let ns = self.namespace.as_deref().unwrap_or(ns);
        Some(scope_name(ns, scope))
    }
}

/// Scope-table name for a bundle in a namespace.
pub fn scope_name(ns: &str, scope: &str) -> String {
    if ns.is_empty() || ns == DEFAULT_NAMESPACE {
        scope.to_string()
    } else {
        format!("{ns}:{scope}")
    }
}

/// True when `s` is exactly one naked reference like `@(name)` / `${name}`.
pub fn is_naked_ref(s: &str, sigil: char) -> bool {
    let Some(rest) = s.strip_prefix(sigil) else {
        return false;
    };
    match rest.as_bytes().first() {
        Some(b'(') => rest.ends_with(')') && !rest[1..rest.len() - 1].contains(['(', ')']),
        Some(b'{') => rest.ends_with('}') && !rest[1..rest.len() - 1].contains(['{', '}']),
        _ => false,
    }
}

/// Strip the sigil and delimiters from a naked reference.
pub fn unwrap_naked_ref(s: &str) -> &str {
    &s[2..s.len() - 1]
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Result of a strict scalar expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// Fully expanded.
    Done(String),
    /// Expansion hit an unresolved reference; payload is the offending ref.
    Dangler(String),
}

#[derive(Debug, Default)]
struct Scope {
    vars: IndexMap<String, Variable>,
}

/// The variable store. Owned by the evaluation context.
#[derive(Debug, Default)]
pub struct VarStore {
    scopes: IndexMap<String, Scope>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with the process-wide scopes (`sys`, `const`, `mon`, `edit`,
    /// `match`, `this`) created and `const` seeded with its literals.
    pub fn with_builtins() -> Self {
        let mut store = Self::new();
        for scope in ["sys", "const", "mon", "edit", "match", "this"] {
            store.new_scope(scope);
        }
        for (lval, value) in [
            ("dollar", "$"),
            ("n", "\n"),
            ("r", "\r"),
            ("t", "\t"),
            ("endl", "\n"),
        ] {
            store
                .put("const", lval, Rval::Scalar(value.into()), VarPolicy::Constant, Origin::default())
                .expect("seeding const scope cannot collide");
        }
        store
    }

    /// Create `name` if it does not exist.
    pub fn new_scope(&mut self, name: &str) {
        self.scopes.entry(name.to_string()).or_default();
    }

    /// Drop a scope and all its variables.
    pub fn delete_scope(&mut self, name: &str) {
        self.scopes.shift_remove(name);
    }

    pub fn has_scope(&self, name: &str) -> bool {
        self.scopes.contains_key(name)
    }

    /// Copy every variable of `src` into `dst` (creating `dst`).
    pub fn copy_scope(&mut self, dst: &str, src: &str) {
        let vars = self
            .scopes
            .get(src)
            .map(|s| s.vars.clone())
            .unwrap_or_default();
        self.scopes.entry(dst.to_string()).or_default().vars.extend(vars);
    }

    /// Define `scope.lval`. Redefinition honours the *existing* variable's
    /// policy: `constant` rejects, `ifdefined` keeps the old value.
    pub fn put(
        &mut self,
        scope: &str,
        lval: &str,
        rval: Rval,
        policy: VarPolicy,
        origin: Origin,
    ) -> Result<()> {
        let table = self.scopes.entry(scope.to_string()).or_default();
        if let Some(existing) = table.vars.get(lval) {
            match existing.policy {
                VarPolicy::Constant => {
                    return Err(PolicyError::Redefinition {
                        scope: scope.to_string(),
                        lval: lval.to_string(),
                        policy: existing.policy.as_str().to_string(),
                    })
                }
                VarPolicy::IfDefined => return Ok(()),
                VarPolicy::Free | VarPolicy::Overridable => {}
            }
        }
        table.vars.insert(
            lval.to_string(),
            Variable {
                rval,
                policy,
                origin,
            },
        );
        Ok(())
    }

    /// Remove `scope.lval` if present. Used when unwinding an iteration
    /// frame's bindings.
    pub fn unset(&mut self, scope: &str, lval: &str) {
        if let Some(table) = self.scopes.get_mut(scope) {
            table.vars.shift_remove(lval);
        }
    }

    /// Direct lookup of `scope.lval`.
    pub fn get(&self, scope: &str, lval: &str) -> Option<&Rval> {
        self.scopes
            .get(scope)
            .and_then(|s| s.vars.get(lval))
            .map(|v| &v.rval)
    }

    /// Mutable lookup, used to memoize evaluated function-call values.
    pub fn get_mut(&mut self, scope: &str, lval: &str) -> Option<&mut Rval> {
        self.scopes
            .get_mut(scope)
            .and_then(|s| s.vars.get_mut(lval))
            .map(|v| &mut v.rval)
    }

    /// Iterate a scope's variables in insertion order (for reports).
    pub fn iter_scope(&self, scope: &str) -> impl Iterator<Item = (&String, &Variable)> {
        self.scopes
            .get(scope)
            .into_iter()
            .flat_map(|s| s.vars.iter())
    }

    /// Scope names in creation order (for reports).
    pub fn scope_names(&self) -> impl Iterator<Item = &String> {
        self.scopes.keys()
    }

    /// Resolve a reference string from namespace `ns` with `current` as the
    /// implicit scope. Iteration bindings (stored in `this` under the
    /// literal reference text) shadow everything; unqualified names then
    /// check the iteration scope before the current scope.
    pub fn resolve(&self, reference: &str, ns: &str, current: &str) -> Option<&Rval> {
        if let Some(bound) = self.get("this", reference) {
            return Some(bound);
        }

        let parsed = VarRef::parse(reference).ok()?;
        let key = parsed.key();

        if let Some(table) = parsed.scope_table(ns) {
            // Scope-prefix disambiguation: `$(a.b)` only addresses scope `a`
            // when that scope exists; otherwise it is `a.b` in this scope.
            if let Some(scope) = self.scopes.get(&table) {
                if let Some(var) = scope.vars.get(&key) {
                    return Some(&var.rval);
                }
            }
            if let Some(rval) = self.get(current, reference) {
                return Some(rval);
            }
            return None;
        }

        self.get("this", &key).or_else(|| self.get(current, &key))
    }

    // -- scope augmentation -------------------------------------------------

    /// Bind a bundle's formal parameters to actual arguments in `scope`.
    ///
    /// A naked `@(name)` actual passes the named list by reference (the
    /// formal keeps list-ness); binding a non-list through `@(...)` is a
    /// fatal policy error. Everything else binds as a scalar, and the new
    /// scope's scalars are expanded once against the caller.
    pub fn augment(
        &mut self,
        scope: &str,
        formals: &[String],
        actuals: &[String],
        ns: &str,
        caller: &str,
    ) -> Result<()> {
        if formals.len() != actuals.len() {
            return Err(PolicyError::ParameterMismatch {
                name: scope.to_string(),
                formals: formals.len(),
                actuals: actuals.len(),
            });
        }

        self.new_scope(scope);

        for (formal, actual) in formals.iter().zip(actuals) {
            let rval = if is_naked_ref(actual, '@') {
                let name = unwrap_naked_ref(actual);
                match self.resolve(name, ns, caller) {
                    Some(Rval::List(items)) => Rval::List(items.clone()),
                    _ => {
                        return Err(PolicyError::ListParameterMismatch {
                            formal: formal.clone(),
                            scope: scope.to_string(),
                        })
                    }
                }
            } else {
                let expanded = match self.expand(actual, ns, caller)? {
                    Expansion::Done(s) => s,
                    Expansion::Dangler(_) => actual.clone(),
                };
                Rval::Scalar(expanded)
            };
            self.put(scope, formal, rval, VarPolicy::Free, Origin::default())?;
        }

        // No danglers may remain in the freshly built scope itself.
        let keys: Vec<String> = self
            .scopes
            .get(scope)
            .map(|s| s.vars.keys().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            let Some(Rval::Scalar(value)) = self.get(scope, &key).cloned() else {
                continue;
            };
            if let Expansion::Done(expanded) = self.expand(&value, ns, scope)? {
                if expanded != value {
                    if let Some(var) = self
                        .scopes
                        .get_mut(scope)
                        .and_then(|s| s.vars.get_mut(&key))
                    {
                        var.rval = Rval::Scalar(expanded);
                    }
                }
            }
        }

        Ok(())
    }

    // -- scalar expansion ---------------------------------------------------

    /// Strict expansion: fully expand or report the first dangler.
    pub fn expand(&self, input: &str, ns: &str, scope: &str) -> Result<Expansion> {
        self.expand_inner(input, ns, scope, 0, true)
    }

    /// Lenient expansion: expand what resolves, leave the rest literal.
    /// Used while scanning promises before iteration variables are bound.
    pub fn expand_partial(&self, input: &str, ns: &str, scope: &str) -> Result<String> {
        match self.expand_inner(input, ns, scope, 0, false)? {
            Expansion::Done(s) => Ok(s),
            Expansion::Dangler(_) => unreachable!("lenient expansion never danglers"),
        }
    }

    fn expand_inner(
        &self,
        input: &str,
        ns: &str,
        scope: &str,
        depth: usize,
        strict: bool,
    ) -> Result<Expansion> {
        if depth > MAX_EXPANSION_DEPTH {
            return Err(PolicyError::ExpansionDepth {
                input: input.to_string(),
                depth: MAX_EXPANSION_DEPTH,
            });
        }

        let mut out = String::with_capacity(input.len());
        let bytes = input.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            let sigil = bytes[i];
            if (sigil == b'$' || sigil == b'@') && i + 1 < bytes.len() {
                let open = bytes[i + 1];
                if open == b'(' || open == b'{' {
                    let close = if open == b'(' { b')' } else { b'}' };
                    if let Some(end) = matching_close(bytes, i + 2, open, close) {
                        let inner_raw = &input[i + 2..end];
                        // Inner references expand first: $(outer_$(inner)).
                        let inner = match self.expand_inner(inner_raw, ns, scope, depth + 1, strict)? {
                            Expansion::Done(s) => s,
                            dangler @ Expansion::Dangler(_) => return Ok(dangler),
                        };

                        match self.resolve(&inner, ns, scope) {
                            Some(Rval::Scalar(value)) => {
                                let value = value.clone();
                                match self.expand_inner(&value, ns, scope, depth + 1, strict)? {
                                    Expansion::Done(s) => out.push_str(&s),
                                    dangler @ Expansion::Dangler(_) => return Ok(dangler),
                                }
                            }
                            Some(Rval::Int(v)) => out.push_str(&v.to_string()),
                            Some(Rval::Real(v)) => out.push_str(&v.to_string()),
                            Some(other @ Rval::List(_)) => {
                                // List refs stay literal in lenient mode so
                                // the iteration engine can classify them; a
                                // list surviving to strict expansion renders
                                // in its brace form (log strings).
                                if strict {
                                    out.push_str(&other.render());
                                } else {
                                    out.push(sigil as char);
                                    out.push(open as char);
                                    out.push_str(&inner);
                                    out.push(close as char);
                                }
                            }
                            Some(Rval::FnCall(_)) | Some(Rval::Body(_)) | None => {
                                if strict {
                                    return Ok(Expansion::Dangler(inner));
                                }
                                out.push(sigil as char);
                                out.push(open as char);
                                out.push_str(&inner);
                                out.push(close as char);
                            }
                        }
                        i = end + 1;
                        continue;
                    }
                }
            }
            let ch_len = utf8_len(bytes[i]);
            out.push_str(&input[i..i + ch_len]);
            i += ch_len;
        }

        Ok(Expansion::Done(out))
    }
}

/// Find the index of the closing delimiter matching an opener at `start-1`,
/// honouring nested pairs of the same kind.
fn matching_close(bytes: &[u8], start: usize, open: u8, close: u8) -> Option<usize> {
    let mut depth = 1;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == open {
            depth += 1;
        } else if bytes[i] == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >= 0xf0 => 4,
        b if b >= 0xe0 => 3,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> VarStore {
        let mut vars = VarStore::with_builtins();
        vars.new_scope("main");
        vars.put(
            "main",
            "host",
            Rval::Scalar("web01".into()),
            VarPolicy::Free,
            Origin::default(),
        )
        .unwrap();
        vars.put(
            "main",
            "greeting",
            Rval::Scalar("hello $(host)".into()),
            VarPolicy::Free,
            Origin::default(),
        )
        .unwrap();
        vars.put(
            "main",
            "dirs",
            Rval::List(vec!["a".into(), "b".into()]),
            VarPolicy::Free,
            Origin::default(),
        )
        .unwrap();
        vars
    }

    #[test]
    fn test_varref_parse_forms() {
        let plain = VarRef::parse("host").unwrap();
        assert_eq!(plain.lval, "host");
        assert!(plain.scope.is_none() && plain.namespace.is_none());

        let scoped = VarRef::parse("sys.fqhost").unwrap();
        assert_eq!(scoped.scope.as_deref(), Some("sys"));
        assert_eq!(scoped.lval, "fqhost");

        let full = VarRef::parse("site:main.table[row][col]").unwrap();
        assert_eq!(full.namespace.as_deref(), Some("site"));
        assert_eq!(full.scope.as_deref(), Some("main"));
        assert_eq!(full.lval, "table");
        assert_eq!(full.indices, vec!["row".to_string(), "col".to_string()]);
        assert_eq!(full.key(), "table[row][col]");
    }

    #[test]
    fn test_varref_parse_rejects_malformed() {
        assert!(VarRef::parse("").is_err());
        assert!(VarRef::parse("a[unclosed").is_err());
    }

    #[test]
    fn test_expand_simple_and_braced() {
        let vars = store();
        assert_eq!(
            vars.expand("on $(host) now", DEFAULT_NAMESPACE, "main").unwrap(),
            Expansion::Done("on web01 now".into())
        );
        assert_eq!(
            vars.expand("on ${host} now", DEFAULT_NAMESPACE, "main").unwrap(),
            Expansion::Done("on web01 now".into())
        );
    }

    #[test]
    fn test_expand_recurses_to_fixed_point() {
        let vars = store();
        assert_eq!(
            vars.expand("$(greeting)!", DEFAULT_NAMESPACE, "main").unwrap(),
            Expansion::Done("hello web01!".into())
        );
    }

    #[test]
    fn test_expand_nested_reference_in_name() {
        let mut vars = store();
        vars.put(
            "main",
            "which",
            Rval::Scalar("host".into()),
            VarPolicy::Free,
            Origin::default(),
        )
        .unwrap();
        assert_eq!(
            vars.expand("$($(which))", DEFAULT_NAMESPACE, "main").unwrap(),
            Expansion::Done("web01".into())
        );
    }

    #[test]
    fn test_strict_expansion_reports_dangler() {
        let vars = store();
        assert_eq!(
            vars.expand("x $(missing) y", DEFAULT_NAMESPACE, "main").unwrap(),
            Expansion::Dangler("missing".into())
        );
    }

    #[test]
    fn test_lenient_expansion_leaves_dangler_literal() {
        let vars = store();
        assert_eq!(
            vars.expand_partial("$(host)/$(missing)", DEFAULT_NAMESPACE, "main").unwrap(),
            "web01/$(missing)"
        );
    }

    #[test]
    fn test_expansion_depth_is_bounded() {
        let mut vars = VarStore::new();
        vars.new_scope("main");
        vars.put(
            "main",
            "loop",
            Rval::Scalar("$(loop)".into()),
            VarPolicy::Free,
            Origin::default(),
        )
        .unwrap();
        assert!(matches!(
            vars.expand("$(loop)", DEFAULT_NAMESPACE, "main"),
            Err(PolicyError::ExpansionDepth { .. })
        ));
    }

    #[test]
    fn test_this_scope_shadows_current() {
        let mut vars = store();
        vars.put(
            "this",
            "host",
            Rval::Scalar("iterated".into()),
            VarPolicy::Free,
            Origin::default(),
        )
        .unwrap();
        assert_eq!(
            vars.expand("$(host)", DEFAULT_NAMESPACE, "main").unwrap(),
            Expansion::Done("iterated".into())
        );
    }

    #[test]
    fn test_scope_prefix_disambiguation() {
        let mut vars = store();
        vars.new_scope("app");
        vars.put(
            "app",
            "port",
            Rval::Scalar("8080".into()),
            VarPolicy::Free,
            Origin::default(),
        )
        .unwrap();
        // `app` is a scope, so $(app.port) addresses it from anywhere.
        assert_eq!(
            vars.expand("$(app.port)", DEFAULT_NAMESPACE, "main").unwrap(),
            Expansion::Done("8080".into())
        );
        // `nosuch.thing` is not a scope; it falls back to a dotted lval.
        vars.put(
            "main",
            "nosuch.thing",
            Rval::Scalar("dotted".into()),
            VarPolicy::Free,
            Origin::default(),
        )
        .unwrap();
        assert_eq!(
            vars.expand("$(nosuch.thing)", DEFAULT_NAMESPACE, "main").unwrap(),
            Expansion::Done("dotted".into())
        );
    }

    #[test]
    fn test_const_builtins() {
        let vars = VarStore::with_builtins();
        assert_eq!(
            vars.expand("a$(const.n)b", DEFAULT_NAMESPACE, "main").unwrap(),
            Expansion::Done("a\nb".into())
        );
        assert_eq!(
            vars.expand("$(const.dollar)(x)", DEFAULT_NAMESPACE, "main").unwrap(),
            Expansion::Done("$(x)".into())
        );
    }

    #[test]
    fn test_constant_policy_rejects_redefinition() {
        let mut vars = VarStore::new();
        vars.put(
            "main",
            "pinned",
            Rval::Scalar("v1".into()),
            VarPolicy::Constant,
            Origin::default(),
        )
        .unwrap();
        assert!(matches!(
            vars.put(
                "main",
                "pinned",
                Rval::Scalar("v2".into()),
                VarPolicy::Free,
                Origin::default()
            ),
            Err(PolicyError::Redefinition { .. })
        ));
    }

    #[test]
    fn test_ifdefined_policy_keeps_existing() {
        let mut vars = VarStore::new();
        vars.put(
            "main",
            "soft",
            Rval::Scalar("v1".into()),
            VarPolicy::IfDefined,
            Origin::default(),
        )
        .unwrap();
        vars.put(
            "main",
            "soft",
            Rval::Scalar("v2".into()),
            VarPolicy::Free,
            Origin::default(),
        )
        .unwrap();
        assert_eq!(vars.get("main", "soft"), Some(&Rval::Scalar("v1".into())));
    }

    #[test]
    fn test_augment_binds_scalars_and_lists() {
        let mut vars = store();
        vars.augment(
            "callee",
            &["target".into(), "entries".into()],
            &["$(host)".into(), "@(dirs)".into()],
            DEFAULT_NAMESPACE,
            "main",
        )
        .unwrap();

        assert_eq!(vars.get("callee", "target"), Some(&Rval::Scalar("web01".into())));
        assert_eq!(
            vars.get("callee", "entries"),
            Some(&Rval::List(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn test_augment_arity_mismatch_is_error() {
        let mut vars = store();
        assert!(matches!(
            vars.augment("callee", &["a".into()], &[], DEFAULT_NAMESPACE, "main"),
            Err(PolicyError::ParameterMismatch { .. })
        ));
    }

    #[test]
    fn test_augment_list_formal_needs_list_actual() {
        let mut vars = store();
        assert!(matches!(
            vars.augment(
                "callee",
                &["entries".into()],
                &["@(host)".into()], // host is a scalar
                DEFAULT_NAMESPACE,
                "main"
            ),
            Err(PolicyError::ListParameterMismatch { .. })
        ));
    }

    #[test]
    fn test_is_naked_ref() {
        assert!(is_naked_ref("@(dirs)", '@'));
        assert!(is_naked_ref("@{dirs}", '@'));
        assert!(!is_naked_ref("x@(dirs)", '@'));
        assert!(!is_naked_ref("@(dirs)x", '@'));
        assert_eq!(unwrap_naked_ref("@(dirs)"), "dirs");
    }
}
