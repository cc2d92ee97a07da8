//! Process-wide configuration.
//!
//! A [`Config`] is built with chaining setters and installed once with [`install`]. The flags
//! read on hot paths are mirrored into atomics so that reading them never takes a lock.

use crate::{
    context::Context,
    diagnostics::LeakReport,
    error::Reason,
};
use std::{
    fmt::{self, Debug, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc,
        RwLock,
    },
};


/// Hook invoked with every rejection that no consumer observed
pub type RejectionHook = Arc<dyn Fn(&Reason) + Send + Sync>;

/// Hook invoked when an operation is abandoned without ever reaching a terminal state
pub type LeakHook = Arc<dyn Fn(&LeakReport) + Send + Sync>;


/// Engine configuration
#[derive(Clone)]
pub struct Config {
    /// Whether released objects are kept for reuse. Defaults to true.
    ///
    /// Disable for workloads that need deterministic destruction timing.
    pub pooling: bool,
    /// Whether debug-strength validation runs. Defaults to true in debug builds.
    ///
    /// Covers circular chain detection and abandoned-producer detection. Stale handle detection
    /// is always on.
    pub validation: bool,
    /// Whether live operations are tracked in a registry which can be swept with
    /// [`live_operations`](crate::diagnostics::live_operations). Defaults to false.
    pub track_leaks: bool,
    /// Context that [`Schedule::Background`](crate::Schedule::Background) continuations are
    /// posted to. If unset, they run synchronously.
    pub background: Option<Context>,
    /// Context that unhandled rejections are raised on if no rejection hook is set.
    pub foreground: Option<Context>,
    /// Hook for rejections that no consumer observed.
    pub unhandled_rejection_hook: Option<RejectionHook>,
    /// Hook for abandoned operations.
    pub leak_hook: Option<LeakHook>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pooling: true,
            validation: cfg!(debug_assertions),
            track_leaks: false,
            background: None,
            foreground: None,
            unhandled_rejection_hook: None,
            leak_hook: None,
        }
    }
}

impl Config {
    /// Construct with defaults
    pub fn new() -> Self {
        Config::default()
    }

    /// Set whether released objects are kept for reuse
    pub fn set_pooling(&mut self, pooling: bool) -> &mut Self {
        self.pooling = pooling;
        self
    }

    /// Ownership-chaining version of [`set_pooling`](Self::set_pooling)
    pub fn with_pooling(mut self, pooling: bool) -> Self {
        self.pooling = pooling;
        self
    }

    /// Set whether debug-strength validation runs
    pub fn set_validation(&mut self, validation: bool) -> &mut Self {
        self.validation = validation;
        self
    }

    /// Ownership-chaining version of [`set_validation`](Self::set_validation)
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set whether live operations are tracked
    pub fn set_track_leaks(&mut self, track_leaks: bool) -> &mut Self {
        self.track_leaks = track_leaks;
        self
    }

    /// Ownership-chaining version of [`set_track_leaks`](Self::set_track_leaks)
    pub fn with_track_leaks(mut self, track_leaks: bool) -> Self {
        self.track_leaks = track_leaks;
        self
    }

    /// Set the background context
    pub fn set_background(&mut self, background: Option<Context>) -> &mut Self {
        self.background = background;
        self
    }

    /// Ownership-chaining version of [`set_background`](Self::set_background)
    pub fn with_background(mut self, background: Context) -> Self {
        self.background = Some(background);
        self
    }

    /// Set the foreground context
    pub fn set_foreground(&mut self, foreground: Option<Context>) -> &mut Self {
        self.foreground = foreground;
        self
    }

    /// Ownership-chaining version of [`set_foreground`](Self::set_foreground)
    pub fn with_foreground(mut self, foreground: Context) -> Self {
        self.foreground = Some(foreground);
        self
    }

    /// Set the unhandled rejection hook
    pub fn set_unhandled_rejection_hook<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Reason) + Send + Sync + 'static,
    {
        self.unhandled_rejection_hook = Some(Arc::new(hook));
        self
    }

    /// Ownership-chaining version of
    /// [`set_unhandled_rejection_hook`](Self::set_unhandled_rejection_hook)
    pub fn with_unhandled_rejection_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Reason) + Send + Sync + 'static,
    {
        self.set_unhandled_rejection_hook(hook);
        self
    }

    /// Set the leak hook
    pub fn set_leak_hook<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&LeakReport) + Send + Sync + 'static,
    {
        self.leak_hook = Some(Arc::new(hook));
        self
    }

    /// Ownership-chaining version of [`set_leak_hook`](Self::set_leak_hook)
    pub fn with_leak_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&LeakReport) + Send + Sync + 'static,
    {
        self.set_leak_hook(hook);
        self
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("pooling", &self.pooling)
            .field("validation", &self.validation)
            .field("track_leaks", &self.track_leaks)
            .field("background", &self.background)
            .field("foreground", &self.foreground)
            .field("unhandled_rejection_hook", &self.unhandled_rejection_hook.is_some())
            .field("leak_hook", &self.leak_hook.is_some())
            .finish()
    }
}


// installed config. `None` until the first install.
static CURRENT: RwLock<Option<Arc<Config>>> = RwLock::new(None);

// hot path mirrors of the installed config's flags.
static POOLING: AtomicBool = AtomicBool::new(true);
static VALIDATION: AtomicBool = AtomicBool::new(cfg!(debug_assertions));
static TRACK_LEAKS: AtomicBool = AtomicBool::new(false);

/// Install a configuration process-wide, replacing the previous one
///
/// Objects already in pools stay there if pooling is disabled; call
/// [`clear_all`](crate::pool::clear_all) to drop them.
pub fn install(config: Config) {
    debug!(?config, "installing configuration");
    POOLING.store(config.pooling, Relaxed);
    VALIDATION.store(config.validation, Relaxed);
    TRACK_LEAKS.store(config.track_leaks, Relaxed);
    *CURRENT.write().unwrap() = Some(Arc::new(config));
}

/// The currently installed configuration
pub fn current() -> Arc<Config> {
    if let Some(config) = &*CURRENT.read().unwrap() {
        return Arc::clone(config);
    }
    Arc::new(Config::default())
}

pub(crate) fn pooling_enabled() -> bool {
    POOLING.load(Relaxed)
}

pub(crate) fn validation_enabled() -> bool {
    VALIDATION.load(Relaxed)
}

pub(crate) fn track_leaks() -> bool {
    TRACK_LEAKS.load(Relaxed)
}


// tests which install a config must hold this, since they share the process with each other.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::Mutex;

    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
