//! Built-in policy functions
//!
//! Function-call r-values are evaluated before iteration. Only the pure,
//! host-local functions live here; anything touching configured resources
//! belongs to actuators. Unknown functions are a soft failure: the calling
//! promise is skipped with a warning.

use regex::Regex;
use tracing::warn;

use crate::classes::canonify;
use crate::policy::{FnCall, Rval};
use crate::vars::VarStore;

/// Evaluate `call` with pre-expanded arguments. `None` means the function
/// is unknown or its arguments were invalid; the caller skips the promise.
pub fn evaluate(call: &FnCall, vars: &VarStore, ns: &str, scope: &str) -> Option<Rval> {
    match call.name.as_str() {
        "concat" => Some(Rval::Scalar(call.args.concat())),

        "canonify" => {
            let arg = call.args.first()?;
            Some(Rval::Scalar(canonify(arg)))
        }

        "getenv" => {
            let name = call.args.first()?;
            let max: usize = call.args.get(1).and_then(|m| m.parse().ok()).unwrap_or(4096);
            let mut value = std::env::var(name).unwrap_or_default();
            value.truncate(max);
            Some(Rval::Scalar(value))
        }

        "splitstring" => {
            let input = call.args.first()?;
            let pattern = call.args.get(1)?;
            let max: usize = call.args.get(2).and_then(|m| m.parse().ok()).unwrap_or(usize::MAX);
            let re = match Regex::new(pattern) {
                Ok(re) => re,
                Err(err) => {
                    warn!(function = "splitstring", pattern = %pattern, error = %err, "Bad split pattern");
                    return None;
                }
            };
            let items: Vec<String> = re
                .splitn(input, max.max(1))
                .map(|s| s.to_string())
                .collect();
            Some(Rval::List(items))
        }

        "join" => {
            let sep = call.args.first()?;
            let list_name = call.args.get(1)?;
            match vars.resolve(list_name, ns, scope) {
                Some(Rval::List(items)) => Some(Rval::Scalar(items.join(sep))),
                _ => {
                    warn!(function = "join", list = %list_name, "Argument is not a defined list");
                    None
                }
            }
        }

        "length" => {
            let list_name = call.args.first()?;
            match vars.resolve(list_name, ns, scope) {
                Some(Rval::List(items)) => Some(Rval::Scalar(items.len().to_string())),
                _ => None,
            }
        }

        other => {
            warn!(function = %other, "Unknown function call in policy");
            None
        }
    }
}
