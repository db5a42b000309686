//! The worker pool and the two-phase activation driver.
//!
//! Every in-flight frame request is a [`ContextInner`]; the pool executes
//! activations against contexts, resolving dependencies through child
//! contexts and the caches. Filter-mode admission serializes activations
//! per instance where the mode demands it, and a blocked host thread can
//! lend its pool slot back while it waits.

use crate::context::{ContextInner, CtxState, HostCallback};
use crate::core::CoreInner;
use crate::error::{Error, Result};
use crate::frame::FrameRef;
use crate::node::{Activation, FilterMode, Node};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

// ============================================================================
// Tasks and per-node scheduler state
// ============================================================================

/// Which activation a queued task will deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActivationKind {
    Initial,
    FrameReady,
    AllFramesReady,
}

impl ActivationKind {
    fn activation(self) -> Activation {
        match self {
            ActivationKind::Initial => Activation::Initial,
            ActivationKind::FrameReady => Activation::FrameReady,
            ActivationKind::AllFramesReady => Activation::AllFramesReady,
        }
    }
}

pub(crate) struct Task {
    ctx: Arc<ContextInner>,
    kind: ActivationKind,
    /// The task already holds its filter-mode admission slot.
    admitted: bool,
}

/// Scheduler-owned state attached to each filter instance.
pub(crate) struct NodeSched {
    /// In-flight contexts keyed by `(output, frame)`, for request dedup.
    inflight: Mutex<HashMap<(usize, usize), Arc<ContextInner>>>,
    admission: Mutex<Admission>,
}

impl NodeSched {
    pub(crate) fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            admission: Mutex::new(Admission::default()),
        }
    }
}

#[derive(Default)]
struct Admission {
    /// Activations currently running (any phase).
    running: usize,
    /// Frame-producing activations currently running.
    running_produce: usize,
    /// Tasks waiting for an admission slot.
    parked: Vec<Task>,
}

/// Try to admit `task` under the node's filter mode.
///
/// Returns a task to execute now: usually `task` itself, but a serial
/// instance may substitute a parked task with a lower frame index so
/// frames are produced in ascending order.
fn admit(node: &Node, task: Task) -> Option<Task> {
    let mode = node.mode();
    let mut adm = node.inner.sched.admission.lock().unwrap();
    match mode {
        FilterMode::Parallel => Some(task),
        FilterMode::ParallelRequests => {
            if task.kind == ActivationKind::AllFramesReady {
                if adm.running_produce == 0 {
                    adm.running_produce = 1;
                    Some(task)
                } else {
                    adm.parked.push(task);
                    None
                }
            } else {
                Some(task)
            }
        }
        FilterMode::Unordered => {
            if adm.running == 0 {
                adm.running = 1;
                Some(task)
            } else {
                adm.parked.push(task);
                None
            }
        }
        FilterMode::Serial => {
            adm.parked.push(task);
            if adm.running == 0 {
                serial_pick(node, &mut adm.parked).map(|task| {
                    adm.running = 1;
                    task
                })
            } else {
                None
            }
        }
    }
}

/// Pick the next admissible task for a serial instance: frames must be
/// produced in ascending index order per output, so a producing task runs
/// only when no lower-indexed request is still in flight on its output.
/// Dependency-declaring tasks are unconstrained; lowest index first.
fn serial_pick(node: &Node, parked: &mut Vec<Task>) -> Option<Task> {
    let inflight = node.inner.sched.inflight.lock().unwrap();
    let best = parked
        .iter()
        .enumerate()
        .filter(|(_, task)| match task.kind {
            ActivationKind::AllFramesReady => {
                let output = task.ctx.node.output;
                let min = inflight
                    .keys()
                    .filter(|(out, _)| *out == output)
                    .map(|(_, n)| *n)
                    .min();
                min.map_or(true, |min| task.ctx.n <= min)
            }
            _ => true,
        })
        .min_by_key(|(_, task)| task.ctx.n)
        .map(|(i, _)| i);
    best.map(|i| parked.swap_remove(i))
}

/// Release the admission slot `kind` held on `node`, waking one parked
/// task if the freed slot admits it.
fn release_admission(core: &Arc<CoreInner>, node: &Node, kind: ActivationKind) {
    let next = {
        let mut adm = node.inner.sched.admission.lock().unwrap();
        match node.mode() {
            FilterMode::Parallel => None,
            FilterMode::ParallelRequests => {
                if kind == ActivationKind::AllFramesReady {
                    adm.running_produce = 0;
                    let pos = adm
                        .parked
                        .iter()
                        .position(|t| t.kind == ActivationKind::AllFramesReady);
                    pos.map(|i| {
                        adm.running_produce = 1;
                        adm.parked.remove(i)
                    })
                } else {
                    None
                }
            }
            FilterMode::Unordered => {
                adm.running = 0;
                if adm.parked.is_empty() {
                    None
                } else {
                    adm.running = 1;
                    Some(adm.parked.remove(0))
                }
            }
            FilterMode::Serial => {
                adm.running = 0;
                serial_pick(node, &mut adm.parked).map(|task| {
                    adm.running = 1;
                    task
                })
            }
        }
    };
    if let Some(mut task) = next {
        task.admitted = true;
        push_queue(core, task);
    }
}

// ============================================================================
// The activation driver
// ============================================================================

/// Entry point for host requests: attach to an in-flight context, hit the
/// cache, or start a fresh context for `(node, n)`.
pub(crate) fn request_root(core: &Arc<CoreInner>, node: &Node, n: usize, callback: HostCallback) {
    if let Some(frame) = core.caches.get(&node.inner.cache, node.output, n) {
        callback(Ok(frame));
        return;
    }
    let key = (node.output, n);
    let ctx = {
        let mut inflight = node.inner.sched.inflight.lock().unwrap();
        if let Some(existing) = inflight.get(&key) {
            existing.state.lock().unwrap().host_waiters.push(callback);
            return;
        }
        let ctx = ContextInner::new(node.clone(), n);
        {
            let mut state = ctx.state.lock().unwrap();
            state.host_waiters.push(callback);
            state.scheduled = true;
        }
        inflight.insert(key, Arc::clone(&ctx));
        ctx
    };
    push_queue(
        core,
        Task {
            ctx,
            kind: ActivationKind::Initial,
            admitted: false,
        },
    );
}

fn run_task(core: &Arc<CoreInner>, task: Task) {
    // A frame may have been published between request and execution. An
    // already-admitted task skips this: it holds a slot to release.
    if task.kind == ActivationKind::Initial && !task.admitted {
        let node = &task.ctx.node;
        if let Some(frame) = core.caches.get(&node.inner.cache, node.output, task.ctx.n) {
            finish(core, &task.ctx, Some(frame));
            return;
        }
    }
    if task.admitted {
        execute(core, task);
    } else {
        let node = task.ctx.node.clone();
        if let Some(admitted) = admit(&node, task) {
            execute(core, admitted);
        }
    }
}

fn execute(core: &Arc<CoreInner>, task: Task) {
    let ctx = task.ctx;
    let kind = task.kind;
    let node = ctx.node.clone();

    if kind == ActivationKind::FrameReady {
        let mut state = ctx.state.lock().unwrap();
        if let Some(item) = state.notify_queue.pop_front() {
            state.last_completed = Some(item);
        }
    }

    let fctx = crate::context::FrameContext::from_inner(Arc::clone(&ctx));
    let core_handle = crate::core::Core::from_inner(Arc::clone(core));
    let result = node
        .inner
        .filter
        .get_frame(ctx.n, kind.activation(), &fctx, &core_handle);
    drop(fctx);

    match result {
        Err(err) => {
            {
                let mut state = ctx.state.lock().unwrap();
                if state.error.is_none() {
                    state.error = Some(err.to_string());
                    state.error_from_dependency = false;
                }
            }
            finish(core, &ctx, None);
        }
        Ok(Some(frame)) => {
            let errored = ctx.state.lock().unwrap().error.is_some();
            if errored {
                // A frame returned from an errored context is discarded.
                finish(core, &ctx, None);
            } else {
                core.caches
                    .insert(&node.inner.cache, node.output, ctx.n, Arc::clone(&frame));
                finish(core, &ctx, Some(frame));
            }
        }
        Ok(None) => match kind {
            ActivationKind::AllFramesReady => {
                {
                    let mut state = ctx.state.lock().unwrap();
                    if state.error.is_none() {
                        state.error = Some(format!(
                            "filter {} returned no frame for index {}",
                            node.name(),
                            ctx.n
                        ));
                        state.error_from_dependency = false;
                    }
                }
                finish(core, &ctx, None);
            }
            ActivationKind::Initial | ActivationKind::FrameReady => {
                if kind == ActivationKind::Initial {
                    ctx.state.lock().unwrap().initial_done = true;
                }
                process_requests(core, &ctx);
                let next = {
                    let mut state = ctx.state.lock().unwrap();
                    state.scheduled = false;
                    advance_locked(&ctx, &mut state)
                };
                if let Some(task) = next {
                    push_queue(core, task);
                }
            }
        },
    }

    // Released only after the outcome is recorded, so serial admission
    // sees a consistent in-flight table.
    release_admission(core, &node, kind);
}

/// Turn the requests a filter collected during its activation into cache
/// hits or child contexts.
fn process_requests(core: &Arc<CoreInner>, ctx: &Arc<ContextInner>) {
    let requests = {
        let mut state = ctx.state.lock().unwrap();
        if state.error.is_some() {
            // No further children are spawned for an errored context.
            state.collected.clear();
            return;
        }
        std::mem::take(&mut state.collected)
    };
    let notify = ctx.node.flags().request_notifications;

    for (dep_node, m) in requests {
        let key = dep_node.key(m);
        if ctx.state.lock().unwrap().available.contains_key(&key) {
            continue;
        }

        if let Some(frame) = core.caches.get(&dep_node.inner.cache, dep_node.output, m) {
            let mut state = ctx.state.lock().unwrap();
            state.available.insert(key, frame);
            state.last_completed = Some((dep_node.clone(), m));
            if notify {
                state.notify_queue.push_back((dep_node.clone(), m));
            }
            continue;
        }

        let map_key = (dep_node.output, m);
        let mut inflight = dep_node.inner.sched.inflight.lock().unwrap();
        if let Some(child) = inflight.get(&map_key).cloned() {
            child
                .state
                .lock()
                .unwrap()
                .waiters
                .push(Arc::downgrade(ctx));
            drop(inflight);
            ctx.pending.fetch_add(1, Ordering::AcqRel);
            ctx.state.lock().unwrap().children.push(child);
        } else {
            let child = ContextInner::new(dep_node.clone(), m);
            {
                let mut child_state = child.state.lock().unwrap();
                child_state.waiters.push(Arc::downgrade(ctx));
                child_state.scheduled = true;
            }
            inflight.insert(map_key, Arc::clone(&child));
            drop(inflight);
            ctx.pending.fetch_add(1, Ordering::AcqRel);
            ctx.state.lock().unwrap().children.push(Arc::clone(&child));
            push_queue(
                core,
                Task {
                    ctx: child,
                    kind: ActivationKind::Initial,
                    admitted: false,
                },
            );
        }
    }
}

/// Decide the context's next activation, if any. Called with the state
/// lock held; marks the context scheduled when it returns a task.
fn advance_locked(ctx: &Arc<ContextInner>, state: &mut CtxState) -> Option<Task> {
    if state.done || state.scheduled || !state.initial_done {
        return None;
    }
    if state.error.is_none() && !state.notify_queue.is_empty() {
        state.scheduled = true;
        return Some(Task {
            ctx: Arc::clone(ctx),
            kind: ActivationKind::FrameReady,
            admitted: false,
        });
    }
    if ctx.pending.load(Ordering::Acquire) == 0 {
        state.scheduled = true;
        return Some(Task {
            ctx: Arc::clone(ctx),
            kind: ActivationKind::AllFramesReady,
            admitted: false,
        });
    }
    None
}

/// Complete a context: publish the outcome to parent contexts and host
/// callbacks, release children, and drop the in-flight entry.
fn finish(core: &Arc<CoreInner>, ctx: &Arc<ContextInner>, frame: Option<FrameRef>) {
    let node = ctx.node.clone();
    let key = (node.output, ctx.n);

    let (waiters, host_waiters, error, error_from_dependency) = {
        let mut inflight = node.inner.sched.inflight.lock().unwrap();
        let mut state = ctx.state.lock().unwrap();
        if state.done {
            return;
        }
        state.done = true;
        if let Some(entry) = inflight.get(&key) {
            if Arc::ptr_eq(entry, ctx) {
                inflight.remove(&key);
            }
        }
        // Dependencies release before the context itself.
        state.available.clear();
        state.children.clear();
        (
            std::mem::take(&mut state.waiters),
            std::mem::take(&mut state.host_waiters),
            state.error.clone(),
            state.error_from_dependency,
        )
    };

    let outcome: std::result::Result<FrameRef, String> = match (&error, frame) {
        (Some(message), _) => Err(message.clone()),
        (None, Some(frame)) => Ok(frame),
        (None, None) => Err("request completed without a frame".to_string()),
    };

    if let Err(message) = &outcome {
        tracing::debug!(
            target: "vantage::scheduler",
            node = %node.name(),
            frame = ctx.n,
            error = %message,
            "request failed"
        );
    }

    for waiter in waiters {
        if let Some(parent) = waiter.upgrade() {
            notify_parent(core, &parent, ctx, &outcome);
        }
    }

    if !host_waiters.is_empty() {
        let host_result: Result<FrameRef> = match &outcome {
            Ok(frame) => Ok(Arc::clone(frame)),
            Err(message) => {
                if error_from_dependency {
                    Err(Error::Dependency(message.clone()))
                } else {
                    Err(Error::Filter(message.clone()))
                }
            }
        };
        for callback in host_waiters {
            callback(host_result.clone());
        }
    }
}

/// Deliver a completed child's outcome to one waiting parent.
fn notify_parent(
    core: &Arc<CoreInner>,
    parent: &Arc<ContextInner>,
    child: &Arc<ContextInner>,
    outcome: &std::result::Result<FrameRef, String>,
) {
    let next = {
        let mut state = parent.state.lock().unwrap();
        if state.done {
            return;
        }
        match outcome {
            Ok(frame) => {
                state
                    .available
                    .insert(child.node.key(child.n), Arc::clone(frame));
                state.last_completed = Some((child.node.clone(), child.n));
                if parent.node.flags().request_notifications && state.error.is_none() {
                    state.notify_queue.push_back((child.node.clone(), child.n));
                }
            }
            Err(message) => {
                if state.error.is_none() {
                    state.error = Some(message.clone());
                    state.error_from_dependency = true;
                }
            }
        }
        let previous = parent.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous >= 1, "pending count underflow");
        advance_locked(parent, &mut state)
    };
    if let Some(task) = next {
        push_queue(core, task);
    }
}

fn push_queue(core: &Arc<CoreInner>, task: Task) {
    core.pool.push(task);
}

// ============================================================================
// Worker pool
// ============================================================================

thread_local! {
    static WORKER_OF: RefCell<Option<Weak<PoolShared>>> = const { RefCell::new(None) };
}

struct PoolShared {
    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,
    stop: AtomicBool,
    /// Configured worker count.
    target: AtomicUsize,
    /// Slots lent back by host threads blocked inside `get_frame`.
    released: AtomicUsize,
    /// Workers currently alive.
    live: AtomicUsize,
    core: Mutex<Weak<CoreInner>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Fixed-size worker pool executing activations.
pub(crate) struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    pub(crate) fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            threads
        };
        Self {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                stop: AtomicBool::new(false),
                target: AtomicUsize::new(threads),
                released: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                core: Mutex::new(Weak::new()),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Late-bind the owning core so workers can reach the caches.
    pub(crate) fn attach_core(&self, core: &Arc<CoreInner>) {
        *self.shared.core.lock().unwrap() = Arc::downgrade(core);
        ensure_workers(&self.shared);
    }

    /// Current configured worker count.
    pub(crate) fn thread_count(&self) -> usize {
        self.shared.target.load(Ordering::Relaxed)
    }

    /// Resize the pool. Shrinking lets surplus workers retire at their
    /// next wakeup; growing spawns immediately.
    pub(crate) fn set_thread_count(&self, threads: usize) -> usize {
        let threads = if threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            threads
        };
        self.shared.target.store(threads, Ordering::Relaxed);
        ensure_workers(&self.shared);
        self.shared.cond.notify_all();
        threads
    }

    fn push(&self, task: Task) {
        self.shared.queue.lock().unwrap().push_back(task);
        self.shared.cond.notify_one();
    }

    /// Lend this worker's slot to the pool while the calling thread
    /// blocks on a nested request.
    fn release_thread(&self) {
        self.shared.released.fetch_add(1, Ordering::AcqRel);
        ensure_workers(&self.shared);
    }

    /// Reclaim the slot lent by [`Pool::release_thread`].
    fn reserve_thread(&self) {
        self.shared.released.fetch_sub(1, Ordering::AcqRel);
        self.shared.cond.notify_all();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        // Outstanding tasks drain with a terminal error via their dropped
        // callbacks; the queue must not keep contexts alive past the core.
        self.shared.queue.lock().unwrap().clear();
        self.shared.cond.notify_all();
        let current = std::thread::current().id();
        let handles = std::mem::take(&mut *self.shared.handles.lock().unwrap());
        for handle in handles {
            // The pool can be dropped from one of its own workers; that
            // thread exits on its next loop iteration instead.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn ensure_workers(shared: &Arc<PoolShared>) {
    if shared.stop.load(Ordering::Acquire) {
        return;
    }
    loop {
        let live = shared.live.load(Ordering::Acquire);
        let wanted = shared.target.load(Ordering::Relaxed) + shared.released.load(Ordering::Relaxed);
        if live >= wanted {
            return;
        }
        if shared
            .live
            .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }
        let worker_shared = Arc::clone(shared);
        let handle = std::thread::Builder::new()
            .name("vantage-worker".into())
            .spawn(move || worker_loop(worker_shared))
            .expect("spawning pool worker");
        shared.handles.lock().unwrap().push(handle);
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    WORKER_OF.with(|w| *w.borrow_mut() = Some(Arc::downgrade(&shared)));
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.stop.load(Ordering::Acquire) {
                    shared.live.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                let wanted =
                    shared.target.load(Ordering::Relaxed) + shared.released.load(Ordering::Relaxed);
                if shared.live.load(Ordering::Acquire) > wanted {
                    shared.live.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                queue = shared.cond.wait(queue).unwrap();
            }
        };
        let core = shared.core.lock().unwrap().upgrade();
        if let Some(core) = core {
            run_task(&core, task);
        }
    }
}

/// Run `wait` to completion on the calling thread. If the caller is a
/// pool worker, its slot is released for the duration so nested blocking
/// requests cannot starve the pool.
pub(crate) fn blocking_host_wait<T>(pool: &Pool, wait: impl FnOnce() -> T) -> T {
    let is_worker = WORKER_OF.with(|w| {
        w.borrow()
            .as_ref()
            .map_or(false, |weak| match weak.upgrade() {
                Some(shared) => Arc::ptr_eq(&shared, &pool.shared),
                None => false,
            })
    });
    if is_worker {
        pool.release_thread();
        let result = wait();
        pool.reserve_thread();
        result
    } else {
        wait()
    }
}
