//! Per-request frame contexts.
//!
//! A [`FrameContext`] is the state of one in-flight request for
//! `(node, output, frame index)`: the dependencies it has resolved, the
//! number still pending, an error slot, and the parties waiting on the
//! result (parent contexts and host callbacks). The scheduler owns the
//! context while the filter runs against it.

use crate::error::Result;
use crate::frame::FrameRef;
use crate::node::{DepKey, Node};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, Weak};

pub(crate) type HostCallback = Box<dyn FnOnce(Result<FrameRef>) + Send>;

#[derive(Default)]
pub(crate) struct CtxState {
    /// Resolved dependencies, keyed by `(node, output, frame)`.
    pub(crate) available: HashMap<DepKey, FrameRef>,
    /// Requests collected during the current activation.
    pub(crate) collected: Vec<(Node, usize)>,
    /// Error message; the first error wins.
    pub(crate) error: Option<String>,
    /// Whether the error came from a dependency rather than this filter.
    pub(crate) error_from_dependency: bool,
    /// The most recently completed dependency.
    pub(crate) last_completed: Option<(Node, usize)>,
    /// Completed dependencies not yet announced via `FrameReady`.
    pub(crate) notify_queue: VecDeque<(Node, usize)>,
    /// Parent contexts waiting for this frame.
    pub(crate) waiters: Vec<Weak<ContextInner>>,
    /// Host callbacks waiting for this frame.
    pub(crate) host_waiters: Vec<HostCallback>,
    /// Child contexts this one owns until completion.
    pub(crate) children: Vec<Arc<ContextInner>>,
    /// An activation is queued or running for this context.
    pub(crate) scheduled: bool,
    /// The initial activation has run.
    pub(crate) initial_done: bool,
    /// The context has completed (result published or error raised).
    pub(crate) done: bool,
}

pub(crate) struct ContextInner {
    /// The node output this context produces a frame for.
    pub(crate) node: Node,
    /// The frame index.
    pub(crate) n: usize,
    pub(crate) state: Mutex<CtxState>,
    /// Outstanding child requests.
    pub(crate) pending: AtomicUsize,
}

impl ContextInner {
    pub(crate) fn new(node: Node, n: usize) -> Arc<Self> {
        Arc::new(Self {
            node,
            n,
            state: Mutex::new(CtxState::default()),
            pending: AtomicUsize::new(0),
        })
    }
}

/// The context handed to a filter during an activation.
///
/// All methods are safe to call from inside [`Filter::get_frame`] only;
/// the scheduler invalidates nothing, but requests issued outside an
/// activation are never picked up.
///
/// [`Filter::get_frame`]: crate::node::Filter::get_frame
pub struct FrameContext {
    inner: Arc<ContextInner>,
}

impl FrameContext {
    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    /// The frame index being produced.
    pub fn frame_index(&self) -> usize {
        self.inner.n
    }

    /// Which output of the filter instance is being produced.
    pub fn output_index(&self) -> usize {
        self.inner.node.output_index()
    }

    /// Declare a dependency on frame `n` of `node`.
    ///
    /// The index is clamped into the stream. The request is picked up when
    /// the current activation returns; the dependency arrives either from
    /// the cache or from a child context.
    pub fn request_frame(&self, node: &Node, n: usize) {
        let n = node.clamp_index(n);
        let mut state = self.inner.state.lock().unwrap();
        state.collected.push((node.clone(), n));
    }

    /// Fetch a resolved dependency. A pure lookup into the resolved
    /// dictionary; returns `None` for frames that were never requested or
    /// have not resolved.
    pub fn frame(&self, node: &Node, n: usize) -> Option<FrameRef> {
        let n = node.clamp_index(n);
        let state = self.inner.state.lock().unwrap();
        state.available.get(&node.key(n)).cloned()
    }

    /// Drop a resolved dependency before the activation returns, letting
    /// the cache evict it sooner.
    pub fn release_frame_early(&self, node: &Node, n: usize) {
        let n = node.clamp_index(n);
        let mut state = self.inner.state.lock().unwrap();
        state.available.remove(&node.key(n));
    }

    /// The dependency most recently completed for this context, if any.
    pub fn last_completed(&self) -> Option<(Node, usize)> {
        let state = self.inner.state.lock().unwrap();
        state.last_completed.clone()
    }

    /// Mark the context failed. The current frame request completes with
    /// this message and the context is not rescheduled.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut state = self.inner.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(message.into());
            state.error_from_dependency = false;
        }
    }

    /// The error carried by this context, if any. Set either by this
    /// filter or by a failed dependency.
    pub fn error(&self) -> Option<String> {
        let state = self.inner.state.lock().unwrap();
        state.error.clone()
    }
}
