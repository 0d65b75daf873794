//! Policy and knowledge reports
//!
//! Renders the loaded policy (bundles, bodies, promises) and the current
//! evaluation state (classes by partition, variables by scope) as plain
//! text and as HTML with stable anchors. Pure functions of their inputs;
//! nothing here mutates the class or variable stores.

use std::fmt::Write as _;

use crate::audit::AuditSummary;
use crate::classes::Partition;
use crate::context::EvalContext;
use crate::policy::{Policy, Promise};

// ---------------------------------------------------------------------------
// Text rendering
// ---------------------------------------------------------------------------

/// Render the full policy as indented text.
pub fn policy_text(policy: &Policy) -> String {
    let mut out = String::new();

    for bundle in &policy.bundles {
        let _ = writeln!(
            out,
            "Bundle {} (type {}, namespace {})",
            bundle.name, bundle.bundle_type, bundle.namespace
        );
        if !bundle.params.is_empty() {
            let _ = writeln!(out, "  parameters: ({})", bundle.params.join(", "));
        }
        for section in &bundle.sections {
            let _ = writeln!(out, "  {}:", section.promise_type);
            for promise in &section.promises {
                promise_text(&mut out, promise);
            }
        }
        out.push('\n');
    }

    for body in &policy.bodies {
        let _ = writeln!(out, "Body {} (type {})", body.name, body.body_type);
        for constraint in &body.constraints {
            let _ = writeln!(
                out,
                "    {} => {} if {}",
                constraint.lval,
                constraint.rval.render(),
                constraint.class_guard
            );
        }
        out.push('\n');
    }

    out
}

fn promise_text(out: &mut String, promise: &Promise) {
    let _ = writeln!(out, "    \"{}\"", promise.promiser);
    if promise.class_guard != "any" {
        let _ = writeln!(out, "      if class {}", promise.class_guard);
    }
    if let Some(promisee) = &promise.promisee {
        let _ = writeln!(out, "      -> {promisee}");
    }
    for constraint in &promise.constraints {
        let _ = writeln!(
            out,
            "      {} => {}",
            constraint.lval,
            constraint.rval.render()
        );
    }
}

/// Render the defined classes and scoped variables as text.
pub fn state_text(ctx: &EvalContext) -> String {
    let mut out = String::new();

    for (title, partition) in [
        ("Hard classes", Partition::Hard),
        ("Soft classes", Partition::Global),
        ("Bundle-local classes", Partition::BundleLocal),
        ("Negated classes", Partition::Negated),
    ] {
        let names = ctx.classes.sorted(partition);
        if names.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{title}:");
        for name in names {
            let _ = writeln!(out, "  {name}");
        }
    }

    let scopes: Vec<String> = ctx.vars.scope_names().cloned().collect();
    for scope in scopes {
        let mut lines = Vec::new();
        for (lval, var) in ctx.vars.iter_scope(&scope) {
            lines.push(format!("  {} = {}", lval, var.rval.render()));
        }
        if lines.is_empty() {
            continue;
        }
        let _ = writeln!(out, "Scope {scope}:");
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
    }

    out
}

/// One-paragraph run summary for the end of an agent run.
pub fn summary_text(summary: &AuditSummary) -> String {
    format!(
        "Outcome of {} promises: {} kept, {} repaired, {} failed, {} denied, {} timed out, {} warnings, {} interrupted",
        summary.total(),
        summary.kept,
        summary.repaired,
        summary.failed,
        summary.denied,
        summary.timeout,
        summary.warned,
        summary.interrupted,
    )
}

// ---------------------------------------------------------------------------
// HTML rendering
// ---------------------------------------------------------------------------

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Stable anchor id for a bundle or body.
pub fn anchor(kind: &str, namespace: &str, name: &str) -> String {
    crate::classes::canonify(&format!("{kind}_{namespace}_{name}"))
}

/// Render the policy as a self-contained HTML document with stable anchors
/// per bundle and body.
pub fn policy_html(policy: &Policy) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html>\n<html><head><title>Policy report</title></head><body>\n");
    out.push_str("<h1>Policy report</h1>\n");

    out.push_str("<h2>Bundles</h2>\n<ul>\n");
    for bundle in &policy.bundles {
        let id = anchor("bundle", &bundle.namespace, &bundle.name);
        let _ = writeln!(
            out,
            "<li><a href=\"#{id}\">{}</a> ({})</li>",
            escape(&bundle.name),
            escape(&bundle.bundle_type)
        );
    }
    out.push_str("</ul>\n");

    for bundle in &policy.bundles {
        let id = anchor("bundle", &bundle.namespace, &bundle.name);
        let _ = writeln!(out, "<h3 id=\"{id}\">Bundle {}</h3>", escape(&bundle.name));
        for section in &bundle.sections {
            let _ = writeln!(out, "<h4>{}</h4>\n<table>", escape(&section.promise_type));
            for promise in &section.promises {
                let _ = writeln!(
                    out,
                    "<tr><td>{}</td><td>{}</td></tr>",
                    escape(&promise.promiser),
                    escape(&promise.class_guard)
                );
                for constraint in &promise.constraints {
                    let _ = writeln!(
                        out,
                        "<tr><td></td><td>{} =&gt; {}</td></tr>",
                        escape(&constraint.lval),
                        escape(&constraint.rval.render())
                    );
                }
            }
            out.push_str("</table>\n");
        }
    }

    if !policy.bodies.is_empty() {
        out.push_str("<h2>Bodies</h2>\n");
        for body in &policy.bodies {
            let id = anchor("body", &body.namespace, &body.name);
            let _ = writeln!(
                out,
                "<h3 id=\"{id}\">Body {} ({})</h3>",
                escape(&body.name),
                escape(&body.body_type)
            );
        }
    }

    out.push_str("</body></html>\n");
    out
}
