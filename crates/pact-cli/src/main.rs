//! pact - the convergent configuration agent
//!
//! Loads a policy tree (JSON AST), computes the host's class context, and
//! converges every promise in the configured bundlesequence under
//! per-promise locking and auditing.
//!
//! ## Exit codes
//!
//! - 0: run completed (including clean aborts)
//! - 1: usage error
//! - 2: fatal policy error (unreadable policy, broken workspace)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn, Level};

use pact_core::{
    attrs, classes::canonify, report, run_policy, sys, workdir, ActuatorRegistry, ContextConfig,
    EvalContext, LockManager, Policy, ReportsActuator, ScheduleOptions, SystemProcesses,
};
use pact_core::attrs::TransactionDefaults;
use pact_state::{MemoryStateBase, StateBase, StateDb, SurrealStateBase};

#[derive(Parser)]
#[command(name = "pact")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Convergent configuration policy agent", long_about = None)]
struct Cli {
    /// Policy entry point (JSON policy tree)
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Define these soft classes at startup (comma-separated)
    #[arg(short = 'D', long = "define")]
    define: Option<String>,

    /// Negate these classes at startup (comma-separated)
    #[arg(short = 'N', long = "negate")]
    negate: Option<String>,

    /// Bypass the lock manager
    #[arg(short = 'K', long = "no-lock")]
    no_lock: bool,

    /// Dry run: evaluate everything, repair nothing
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Inform-level output
    #[arg(short = 'I', long = "inform")]
    inform: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Debug output
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Agent workspace directory
    #[arg(long, env = "PACT_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Keep all state in memory (no on-disk databases)
    #[arg(long)]
    no_persist: bool,

    /// Agent role for bundle-type filtering
    #[arg(long, default_value = "agent")]
    role: String,
}

fn init_tracing(cli: &Cli) {
    let level = if cli.debug {
        Level::TRACE
    } else if cli.verbose {
        Level::DEBUG
    } else if cli.inform {
        Level::INFO
    } else {
        Level::WARN
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("PACT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("pact={level},warn")));

    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Cannot start runtime");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "Fatal error");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let workdir = cli.workdir.clone().unwrap_or_else(workdir::default_workdir);
    workdir::ensure_workspace(&workdir).context("workspace check failed")?;

    // Storage: on-disk under state/, degrading to memory-only.
    let base: Arc<dyn StateBase> = if cli.no_persist {
        Arc::new(MemoryStateBase::new())
    } else {
        match SurrealStateBase::at_path(&workdir.join("state").join("pact.db")).await {
            Ok(base) => Arc::new(base),
            Err(err) => {
                warn!(error = %err, "State backend unavailable; continuing without persistence");
                Arc::new(MemoryStateBase::new())
            }
        }
    };

    let state = base.open(StateDb::State).await?;
    let performance = base.open(StateDb::Performance).await?;
    let locks_db = base.open(StateDb::Locks).await?;

    let hostname = sys::discover_hostname();
    let locks = Arc::new(LockManager::new(
        locks_db,
        Arc::new(SystemProcesses),
        &hostname,
        &workdir,
        cli.no_lock,
    ));

    let mut ctx = EvalContext::new(ContextConfig {
        state,
        performance,
        locks: locks.clone(),
        host: hostname.clone(),
        dry_run: cli.dry_run,
        txn_defaults: TransactionDefaults::default(),
    });

    sys::discover_hard_classes(&mut ctx.classes, &hostname);
    sys::seed_sys_scope(&mut ctx.vars, &hostname, &workdir);

    // -D / -N may not touch reserved hard classes.
    if let Some(defines) = &cli.define {
        for class in defines.split(',').filter(|c| !c.is_empty()) {
            if ctx.classes.is_hard(&canonify(class)) {
                eprintln!("pact: cannot use -D to define the reserved class \"{class}\"");
                return Ok(ExitCode::from(1));
            }
            ctx.classes.add_soft(class, "default");
        }
    }
    if let Some(negates) = &cli.negate {
        for class in negates.split(',').filter(|c| !c.is_empty()) {
            if ctx.classes.is_hard(&canonify(class)) {
                eprintln!("pact: cannot negate the reserved class \"{class}\"");
                return Ok(ExitCode::from(1));
            }
            ctx.classes.add_negated(class);
        }
    }

    let persistent_store = ctx.state.clone();
    ctx.classes.load_persistent(&persistent_store).await;

    // Policy tree.
    let text = std::fs::read_to_string(&cli.file)
        .with_context(|| format!("cannot read policy file {}", cli.file.display()))?;
    let policy = Policy::from_json(&text).context("cannot parse policy tree")?;

    let mut options = ScheduleOptions {
        role: cli.role.clone(),
        ..ScheduleOptions::default()
    };
    let max_children = apply_control_body(&policy, &mut ctx, &mut options);

    let mut registry = ActuatorRegistry::new(max_children);
    registry.register(Arc::new(ReportsActuator));

    info!(
        policy = %cli.file.display(),
        host = %hostname,
        dry_run = cli.dry_run,
        "Starting agent run"
    );

    tokio::select! {
        result = run_policy(&policy, &mut ctx, &registry, &options) => {
            if let Err(err) = result {
                error!(error = %err, "Policy run failed");
                return Ok(ExitCode::from(2));
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; releasing held lock");
            locks.cleanup().await;
            return Ok(ExitCode::SUCCESS);
        }
    }

    // End-of-run housekeeping.
    locks.cleanup().await;
    locks.purge(ctx.now()).await;
    let allclasses = workdir.join("state").join("allclasses.txt");
    if let Err(err) = ctx.classes.save_class_environment(&allclasses) {
        warn!(error = %err, "Could not write class environment cache");
    }
    write_reports(&workdir, &policy, &ctx);

    println!("{}", report::summary_text(&ctx.audit.summary()));
    Ok(ExitCode::SUCCESS)
}

/// Apply `body agent control` settings: abort classes, transaction
/// defaults, missing-bundle tolerance. Returns the background-children cap.
fn apply_control_body(
    policy: &Policy,
    ctx: &mut EvalContext,
    options: &mut ScheduleOptions,
) -> usize {
    let mut max_children = 5;

    let Some(control) = policy
        .bodies
        .iter()
        .find(|b| b.name == "control" && b.body_type == options.role)
    else {
        return max_children;
    };

    for constraint in &control.constraints {
        match (constraint.lval.as_str(), &constraint.rval) {
            ("abortclasses", pact_core::Rval::List(items)) => {
                for pattern in items {
                    ctx.classes.add_abort_pattern(pattern);
                }
            }
            ("abortbundleclasses", pact_core::Rval::List(items)) => {
                for pattern in items {
                    ctx.classes.add_abort_bundle_pattern(pattern);
                }
            }
            ("ifelapsed", rval) => {
                if let Some(minutes) = control_int(rval, ctx.start_time) {
                    ctx.txn_defaults.ifelapsed = minutes;
                }
            }
            ("expireafter", rval) => {
                if let Some(minutes) = control_int(rval, ctx.start_time) {
                    ctx.txn_defaults.expireafter = minutes;
                }
            }
            ("max_children", rval) => {
                if let Some(n) = control_int(rval, ctx.start_time) {
                    max_children = n as usize;
                }
            }
            ("ignore_missing_bundles", pact_core::Rval::Scalar(flag)) => {
                options.ignore_missing_bundles = attrs::bool_from_string(flag).unwrap_or(false);
            }
            _ => {}
        }
    }

    max_children
}

fn control_int(rval: &pact_core::Rval, start_time: i64) -> Option<u32> {
    let value = match rval {
        pact_core::Rval::Int(v) => Some(*v),
        pact_core::Rval::Scalar(s) => attrs::int_from_string(s, start_time),
        _ => None,
    }?;
    u32::try_from(value).ok()
}

fn write_reports(workdir: &std::path::Path, policy: &Policy, ctx: &EvalContext) {
    let reports = workdir.join("reports");
    for (name, content) in [
        ("policy.txt", report::policy_text(policy)),
        ("policy.html", report::policy_html(policy)),
        ("state.txt", report::state_text(ctx)),
    ] {
        if let Err(err) = std::fs::write(reports.join(name), content) {
            warn!(report = %name, error = %err, "Could not write report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pact_core::{Body, Constraint, Origin, Rval};

    fn control_policy(constraints: Vec<Constraint>) -> Policy {
        Policy {
            bundles: vec![],
            bodies: vec![Body {
                name: "control".into(),
                namespace: "default".into(),
                body_type: "agent".into(),
                params: vec![],
                constraints,
                origin: Origin::default(),
            }],
            bundlesequence: vec![],
        }
    }

    #[test]
    fn test_control_body_sets_defaults_and_aborts() {
        let mut ctx = EvalContext::ephemeral("testhost");
        let mut options = ScheduleOptions::default();
        let policy = control_policy(vec![
            Constraint::new("ifelapsed", Rval::Int(30)),
            Constraint::new("expireafter", Rval::Scalar("240".into())),
            Constraint::new("max_children", Rval::Int(8)),
            Constraint::new("ignore_missing_bundles", Rval::Scalar("true".into())),
            Constraint::new("abortclasses", Rval::List(vec!["panic_.*".into()])),
        ]);

        let max_children = apply_control_body(&policy, &mut ctx, &mut options);
        assert_eq!(max_children, 8);
        assert_eq!(ctx.txn_defaults.ifelapsed, 30);
        assert_eq!(ctx.txn_defaults.expireafter, 240);
        assert!(options.ignore_missing_bundles);

        ctx.classes.add_soft("panic_now", "default");
        assert_eq!(ctx.classes.abort_requested(), Some("panic_now"));
    }

    #[test]
    fn test_control_body_for_other_role_ignored() {
        let mut ctx = EvalContext::ephemeral("testhost");
        let mut options = ScheduleOptions {
            role: "server".into(),
            ..ScheduleOptions::default()
        };
        let policy = control_policy(vec![Constraint::new("ifelapsed", Rval::Int(30))]);

        apply_control_body(&policy, &mut ctx, &mut options);
        assert_eq!(ctx.txn_defaults.ifelapsed, 1);
    }
}
