//! Host discovery: hard classes and the `sys` scope
//!
//! Populates the class store's hard partition with facts about this host
//! (platform, architecture, hostname, time classes) and seeds the `sys`
//! variable scope. Network interface discovery belongs to the platform
//! layer and is not attempted here.

use chrono::{Datelike, Local, Timelike};

use crate::classes::ClassStore;
use crate::policy::{Origin, Rval};
use crate::vars::{VarPolicy, VarStore};

/// The host's short name, from the kernel or environment.
pub fn discover_hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim().to_string();
        if !name.is_empty() {
            return name;
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Define the hard classes for this host and the current time.
pub fn discover_hard_classes(classes: &mut ClassStore, hostname: &str) {
    classes.add_hard("any");

    classes.add_hard(std::env::consts::OS);
    if std::env::consts::OS == "macos" {
        classes.add_hard("darwin");
    }
    classes.add_hard(std::env::consts::ARCH);
    classes.add_hard(&format!("{}_{}", std::env::consts::OS, std::env::consts::ARCH));

    let short = hostname.split('.').next().unwrap_or(hostname);
    classes.add_hard(short);
    if hostname != short {
        classes.add_hard(hostname);
    }

    for class in time_classes(Local::now().naive_local()) {
        classes.add_hard(&class);
    }
}

/// The time classes for a given local time.
pub fn time_classes(now: chrono::NaiveDateTime) -> Vec<String> {
    let mut classes = Vec::new();

    const DAYS: [&str; 7] = [
        "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
    ];
    const MONTHS: [&str; 12] = [
        "January", "February", "March", "April", "May", "June", "July", "August", "September",
        "October", "November", "December",
    ];

    classes.push(DAYS[now.weekday().num_days_from_monday() as usize].to_string());
    classes.push(MONTHS[now.month0() as usize].to_string());
    classes.push(format!("Day{}", now.day()));
    classes.push(format!("Yr{}", now.year()));

    let hour = now.hour();
    classes.push(format!("Hr{hour:02}"));
    classes.push(format!("Hr{hour}"));

    let minute = now.minute();
    let low = minute - minute % 5;
    classes.push(format!("Min{:02}_{:02}", low, (low + 5) % 60));

    let quarter = minute / 15 + 1;
    classes.push(format!("Q{quarter}"));
    classes.push(format!("Hr{hour:02}_Q{quarter}"));

    classes.push(
        match hour {
            0..=5 => "Night",
            6..=11 => "Morning",
            12..=17 => "Afternoon",
            _ => "Evening",
        }
        .to_string(),
    );

    classes
}

/// Seed the `sys` scope with discovered facts.
pub fn seed_sys_scope(vars: &mut VarStore, hostname: &str, workdir: &std::path::Path) {
    let short = hostname.split('.').next().unwrap_or(hostname).to_string();
    let domain = hostname
        .split_once('.')
        .map(|(_, d)| d.to_string())
        .unwrap_or_default();

    let entries = [
        ("host", short.clone()),
        ("uqhost", short),
        ("fqhost", hostname.to_string()),
        ("domain", domain),
        ("os", std::env::consts::OS.to_string()),
        ("arch", std::env::consts::ARCH.to_string()),
        ("workdir", workdir.display().to_string()),
        ("cdate", crate::classes::canonify(&Local::now().format("%a %b %d %H:%M:%S %Y").to_string())),
        ("date", Local::now().format("%a %b %d %H:%M:%S %Y").to_string()),
    ];

    for (lval, value) in entries {
        let _ = vars.put(
            "sys",
            lval,
            Rval::Scalar(value),
            VarPolicy::Constant,
            Origin::default(),
        );
    }
}
