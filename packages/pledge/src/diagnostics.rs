//! Reporting of unobserved rejections and abandoned operations.
//!
//! Both reports go to hooks in the installed [`Config`](crate::Config) if set. Without a hook,
//! unobserved rejections are raised on the foreground context if one is configured and logged
//! otherwise; they are never silently dropped.

use crate::{config, error::Reason};
use dashmap::DashMap;
use std::{
    panic::Location,
    sync::OnceLock,
};


/// Report of an operation abandoned without ever reaching a terminal state
#[derive(Debug, Clone)]
pub struct LeakReport {
    /// Name of the operation's value type
    pub type_name: &'static str,
    /// Where the operation was created, if tracked
    pub location: Option<&'static Location<'static>>,
}

/// Record of a live tracked operation
#[derive(Debug, Clone)]
pub struct LiveOperation {
    /// Name of the operation's value type
    pub type_name: &'static str,
    /// Where the operation was created
    pub location: &'static Location<'static>,
}


// live operations keyed by cell address, only populated when tracking is enabled.
fn registry() -> &'static DashMap<usize, LiveOperation> {
    static REGISTRY: OnceLock<DashMap<usize, LiveOperation>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

pub(crate) fn track(key: usize, op: LiveOperation) {
    registry().insert(key, op);
}

pub(crate) fn untrack(key: usize) -> Option<LiveOperation> {
    registry().remove(&key).map(|(_, op)| op)
}

/// Sweep the registry of live tracked operations
///
/// Only operations created while [`Config::track_leaks`](crate::Config::track_leaks) was enabled
/// are tracked. An operation leaves the registry when it reaches a terminal state.
pub fn live_operations() -> Vec<LiveOperation> {
    registry().iter().map(|entry| entry.value().clone()).collect()
}


pub(crate) fn report_unhandled(reason: Reason) {
    let config = config::current();
    if let Some(hook) = &config.unhandled_rejection_hook {
        hook(&reason);
    } else if let Some(foreground) = &config.foreground {
        foreground.post(move |_| panic!("unhandled rejection: {}", reason));
    } else {
        error!(%reason, "unhandled rejection");
    }
}

pub(crate) fn report_leak(report: LeakReport) {
    let config = config::current();
    if let Some(hook) = &config.leak_hook {
        hook(&report);
    } else {
        warn!(
            type_name = report.type_name,
            location = ?report.location,
            "operation abandoned by all producers without reaching a terminal state",
        );
    }
}
