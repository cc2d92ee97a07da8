// execution contexts.
//
// the engine never runs a thread pool of its own. continuations that need to run somewhere in
// particular are posted to an externally supplied `ExecutionContext`. the "current" context is
// never ambient thread-local state: it is passed explicitly down the call chain as an
// `Option<&Context>`, where `None` means "not known to be running on any context".

use std::{
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
    sync::{Arc, Mutex},
};


/// Unit of work posted to an [`ExecutionContext`]
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something which can run posted tasks
///
/// Implementations decide where and when posted tasks run. A posted task must run exactly once,
/// unless the context itself is dropped first.
pub trait ExecutionContext: Send + Sync + 'static {
    /// Post a task to run on this context
    fn post(&self, task: Task);
}

/// Shared, identity-comparable handle to an [`ExecutionContext`]
///
/// Two `Context`s compare equal if and only if they refer to the same context object.
#[derive(Clone)]
pub struct Context(Arc<dyn ExecutionContext>);

impl Context {
    /// Wrap an execution context
    pub fn new<C: ExecutionContext>(context: C) -> Self {
        Context(Arc::new(context))
    }

    /// Post a task which is told the context it is running on
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let cx = self.clone();
        self.0.post(Box::new(move || f(&cx)));
    }

    // address used for identity comparison.
    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl<C: ExecutionContext> From<Arc<C>> for Context {
    fn from(context: Arc<C>) -> Self {
        Context(context)
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Context {}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Context({:p})", self.addr())
    }
}


/// Where a continuation must run
#[derive(Debug, Clone, Default)]
pub enum Schedule {
    /// Run on whichever thread completes the operation, immediately
    #[default]
    Synchronous,
    /// Run on the configured background context, or synchronously if none is configured
    Background,
    /// Run on the given context
    ///
    /// If the operation is completed by code already running on this context, the continuation
    /// runs inline. Otherwise, it is posted.
    On(Context),
}

impl Schedule {
    // resolve `Background` against the installed configuration.
    pub(crate) fn resolve(self) -> Schedule {
        match self {
            Schedule::Background => match crate::config::current().background.clone() {
                Some(cx) => Schedule::On(cx),
                None => Schedule::Synchronous,
            },
            schedule => schedule,
        }
    }

    // run `f` according to this schedule, given the context the caller is currently running on.
    //
    // `f` is told the context it ends up running on.
    pub(crate) fn run<F>(self, current: Option<&Context>, f: F)
    where
        F: FnOnce(Option<&Context>) + Send + 'static,
    {
        match self.resolve() {
            Schedule::On(cx) => {
                if current == Some(&cx) {
                    f(Some(&cx));
                } else {
                    cx.post(move |cx| f(Some(cx)));
                }
            }
            _ => f(current),
        }
    }
}


/// Context which queues posted tasks until they are explicitly run
///
/// Useful as a foreground loop, and for deterministically testing scheduling without threads.
#[derive(Default)]
pub struct ManualContext {
    queue: Mutex<VecDeque<Task>>,
}

impl ManualContext {
    /// Construct with an empty queue
    pub fn new() -> Arc<Self> {
        Arc::new(ManualContext::default())
    }

    /// Number of tasks currently queued
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Run the task at the front of the queue, if any
    ///
    /// Returns whether a task was run.
    pub fn run_one(&self) -> bool {
        // never hold the lock while running the task; it may post more tasks
        let task = self.queue.lock().unwrap().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run queued tasks, including ones posted while running, until the queue is empty
    ///
    /// Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut n = 0;
        while self.run_one() {
            n += 1;
        }
        n
    }
}

impl ExecutionContext for ManualContext {
    fn post(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
    }
}


/// Context which spawns posted tasks onto a tokio runtime
pub struct TokioContext {
    handle: tokio::runtime::Handle,
}

impl TokioContext {
    /// Post onto the given runtime
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        TokioContext { handle }
    }

    /// Post onto the runtime the caller is running within
    ///
    /// Panics if not called from within a tokio runtime.
    pub fn current() -> Self {
        TokioContext::new(tokio::runtime::Handle::current())
    }
}

impl ExecutionContext for TokioContext {
    fn post(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }
}
