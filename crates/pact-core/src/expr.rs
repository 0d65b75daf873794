//! Class-expression parser and evaluator
//!
//! Infix boolean expressions over class names:
//!
//! ```text
//! expr   := term ( '|' term )*
//! term   := factor ( ('.' | '&') factor )*
//! factor := '!' factor | '(' expr ')' | identifier
//! ```
//!
//! Evaluation is a pure function of the class-store snapshot; the evaluator
//! never mutates. Identifier resolution (`any`, namespace qualification,
//! negation) lives in the class store; a second entry point evaluates the
//! same grammar against a bare token set for process- and file-result
//! expressions.

use std::collections::HashSet;

use tracing::error;

use crate::classes::ClassStore;
use crate::error::{PolicyError, Result};

/// A parsed class expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprNode {
    Ident(String),
    Not(Box<ExprNode>),
    And(Vec<ExprNode>),
    Or(Vec<ExprNode>),
}

impl ExprNode {
    /// Evaluate with `resolve` deciding each identifier.
    pub fn eval(&self, resolve: &dyn Fn(&str) -> bool) -> bool {
        match self {
            ExprNode::Ident(name) => resolve(name),
            ExprNode::Not(inner) => !inner.eval(resolve),
            ExprNode::And(terms) => terms.iter().all(|t| t.eval(resolve)),
            ExprNode::Or(terms) => terms.iter().any(|t| t.eval(resolve)),
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b':'
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn fail(&self) -> PolicyError {
        PolicyError::ExpressionSyntax {
            expr: String::from_utf8_lossy(self.input).to_string(),
            position: self.pos,
        }
    }

    fn expr(&mut self) -> Result<ExprNode> {
        let mut terms = vec![self.term()?];
        while self.peek() == Some(b'|') {
            self.pos += 1;
            terms.push(self.term()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            ExprNode::Or(terms)
        })
    }

    fn term(&mut self) -> Result<ExprNode> {
        let mut factors = vec![self.factor()?];
        while matches!(self.peek(), Some(b'.') | Some(b'&')) {
            self.pos += 1;
            factors.push(self.factor()?);
        }
        Ok(if factors.len() == 1 {
            factors.pop().unwrap()
        } else {
            ExprNode::And(factors)
        })
    }

    fn factor(&mut self) -> Result<ExprNode> {
        match self.peek() {
            Some(b'!') => {
                self.pos += 1;
                Ok(ExprNode::Not(Box::new(self.factor()?)))
            }
            Some(b'(') => {
                self.pos += 1;
                let inner = self.expr()?;
                if self.peek() != Some(b')') {
                    return Err(self.fail());
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(c) if is_ident_char(c) => {
                let start = self.pos;
                while self.peek().is_some_and(is_ident_char) {
                    self.pos += 1;
                }
                let name = std::str::from_utf8(&self.input[start..self.pos])
                    .expect("identifier bytes are ASCII")
                    .to_string();
                Ok(ExprNode::Ident(name))
            }
            _ => Err(self.fail()),
        }
    }
}

/// Parse a class expression. Any balanced bracketing is accepted.
pub fn parse(input: &str) -> Result<ExprNode> {
    let mut parser = Parser::new(input);
    let node = parser.expr()?;
    if parser.pos != parser.input.len() {
        return Err(parser.fail());
    }
    Ok(node)
}

/// Surface-syntax check used while loading policy: `Ok` or a diagnostic
/// carrying the offending position.
pub fn validate(input: &str) -> Result<()> {
    parse(input).map(|_| ())
}

/// Render a two-line caret diagnostic for a syntax error position.
pub fn highlight(expr: &str, position: usize) -> String {
    format!("{expr}\n{}^", " ".repeat(position.min(expr.len())))
}

// ---------------------------------------------------------------------------
// Evaluation entry points
// ---------------------------------------------------------------------------

/// Evaluate `expr` against the class store from namespace `ns`.
///
/// A parse error is reported with a caret diagnostic and evaluates false,
/// so a malformed guard skips its promise rather than aborting the run.
pub fn is_defined(expr: &str, store: &ClassStore, ns: &str) -> bool {
    match parse(expr) {
        Ok(node) => node.eval(&|ident| store.contains(ident, ns)),
        Err(PolicyError::ExpressionSyntax { position, .. }) => {
            error!(
                "Unable to parse class expression:\n{}",
                highlight(expr, position)
            );
            false
        }
        Err(_) => false,
    }
}

/// Evaluate `expr` against an arbitrary token set (process/file selection
/// results). Identifiers resolve by plain membership.
pub fn eval_against(expr: &str, tokens: &HashSet<String>) -> bool {
    match parse(expr) {
        Ok(node) => node.eval(&|ident| tokens.contains(ident)),
        Err(PolicyError::ExpressionSyntax { position, .. }) => {
            error!("Syntax error in expression:\n{}", highlight(expr, position));
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DEFAULT_NAMESPACE;

    fn store_with(classes: &[&str]) -> ClassStore {
        let mut store = ClassStore::new();
        for class in classes {
            store.add_hard(class);
        }
        store
    }

    #[test]
    fn test_and_or_not_parse_shape() {
        let node = parse("a.b|!c").unwrap();
        assert_eq!(
            node,
            ExprNode::Or(vec![
                ExprNode::And(vec![
                    ExprNode::Ident("a".into()),
                    ExprNode::Ident("b".into())
                ]),
                ExprNode::Not(Box::new(ExprNode::Ident("c".into()))),
            ])
        );
    }

    #[test]
    fn test_ampersand_is_and() {
        let store = store_with(&["a", "b"]);
        assert!(is_defined("a&b", &store, DEFAULT_NAMESPACE));
        assert!(is_defined("a.b", &store, DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_eval_matches_boolean_connectives() {
        let store = store_with(&["a"]);
        let resolve = |name: &str| store.contains(name, DEFAULT_NAMESPACE);

        assert_eq!(
            parse("a.b").unwrap().eval(&resolve),
            parse("a").unwrap().eval(&resolve) && parse("b").unwrap().eval(&resolve)
        );
        assert_eq!(
            parse("a|b").unwrap().eval(&resolve),
            parse("a").unwrap().eval(&resolve) || parse("b").unwrap().eval(&resolve)
        );
        assert_eq!(
            parse("!a").unwrap().eval(&resolve),
            !parse("a").unwrap().eval(&resolve)
        );
    }

    #[test]
    fn test_seed_scenario_mixed_expression() {
        // {linux, Monday}: "linux.!Sunday|solaris" is true, "linux&Sunday" false.
        let store = store_with(&["linux", "Monday"]);
        assert!(is_defined("linux.!Sunday|solaris", &store, DEFAULT_NAMESPACE));
        assert!(!is_defined("linux&Sunday", &store, DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_deeply_nested_brackets_accepted() {
        let store = store_with(&["a", "b", "c", "d"]);
        assert!(is_defined("((a.b).((c)|(d)))", &store, DEFAULT_NAMESPACE));
        assert!(validate("(((((x)))))").is_ok());
    }

    #[test]
    fn test_parse_error_carries_position() {
        let err = parse("a..b").unwrap_err();
        match err {
            PolicyError::ExpressionSyntax { position, .. } => assert_eq!(position, 2),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(validate("a|").is_err());
        assert!(validate("(a").is_err());
        assert!(validate("").is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let err = parse("a)b").unwrap_err();
        match err {
            PolicyError::ExpressionSyntax { position, .. } => assert_eq!(position, 1),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_highlight_points_at_error() {
        assert_eq!(highlight("a..b", 2), "a..b\n  ^");
    }

    #[test]
    fn test_any_is_true_and_malformed_is_false() {
        let store = ClassStore::new();
        assert!(is_defined("any", &store, DEFAULT_NAMESPACE));
        assert!(!is_defined("a..b", &store, DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_namespace_qualified_identifiers() {
        let mut store = ClassStore::new();
        store.add_soft("ready", "site");
        assert!(is_defined("site:ready", &store, DEFAULT_NAMESPACE));
        assert!(is_defined("ready", &store, "site"));
        assert!(is_defined("default:any", &store, DEFAULT_NAMESPACE));
    }

    #[test]
    fn test_eval_is_pure() {
        let store = store_with(&["linux"]);
        let expr = "linux.!Sunday|solaris";
        let first = is_defined(expr, &store, DEFAULT_NAMESPACE);
        let second = is_defined(expr, &store, DEFAULT_NAMESPACE);
        assert_eq!(first, second);
    }

    #[test]
    fn test_eval_against_token_set() {
        let tokens: HashSet<String> = ["process_owner", "has_tty"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(eval_against("process_owner.has_tty", &tokens));
        assert!(eval_against("process_owner|zombie", &tokens));
        assert!(!eval_against("zombie", &tokens));
        assert!(eval_against("!zombie", &tokens));
    }
}
