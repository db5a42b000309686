//! The engine core: one explicit instance owning the worker pool, the
//! memory budget, the caches, the plugin registry, and message handlers.
//!
//! Multiple independent cores can coexist in one process; nothing in the
//! engine is ambient global state.

use crate::cache::{CacheHandle, CacheRegistry};
use crate::error::{Error, Result};
use crate::format::{AudioFormat, AudioInfo, VideoFormat, VideoInfo};
use crate::frame::Frame;
use crate::log::{HandlerRegistry, MessageHandler, MessageSeverity};
use crate::map::Map;
use crate::memory::{MemoryAccountant, DEFAULT_CACHE_BYTES};
use crate::node::{Filter, FilterMode, Node, NodeFlags, NodeInner, StreamInfo};
use crate::plugin::Plugin;
use crate::scheduler::{NodeSched, Pool};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) struct CoreInner {
    pub(crate) pool: Pool,
    pub(crate) accountant: Arc<MemoryAccountant>,
    pub(crate) caches: CacheRegistry,
    plugins: Mutex<HashMap<String, Arc<Plugin>>>,
    handlers: HandlerRegistry,
    next_node_id: AtomicU64,
}

/// Handle to an engine instance. Cloning is cheap; the instance tears
/// down (draining the pool) when the last handle and the last node
/// referencing it are gone.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// Create a core with `threads` pool workers (0 picks the machine's
    /// parallelism) and the default cache budget.
    pub fn new(threads: usize) -> Core {
        let accountant = Arc::new(MemoryAccountant::new(DEFAULT_CACHE_BYTES));
        let inner = Arc::new(CoreInner {
            pool: Pool::new(threads),
            accountant: Arc::clone(&accountant),
            caches: CacheRegistry::new(accountant),
            plugins: Mutex::new(HashMap::new()),
            handlers: HandlerRegistry::new(),
            next_node_id: AtomicU64::new(1),
        });
        inner.pool.attach_core(&inner);
        let core = Core { inner };
        crate::filters::register_std(&core);
        core
    }

    pub(crate) fn from_inner(inner: Arc<CoreInner>) -> Core {
        Core { inner }
    }

    // ------------------------------------------------------------------
    // Pool and memory configuration
    // ------------------------------------------------------------------

    /// Current worker count.
    pub fn thread_count(&self) -> usize {
        self.inner.pool.thread_count()
    }

    /// Resize the worker pool; returns the effective count.
    pub fn set_thread_count(&self, threads: usize) -> usize {
        self.inner.pool.set_thread_count(threads)
    }

    /// Replace the cache byte budget, returning the previous value.
    /// Shrinking evicts immediately.
    pub fn set_max_cache_size(&self, bytes: usize) -> usize {
        let old = self.inner.accountant.set_limit(bytes);
        self.inner.caches.enforce_budget();
        old
    }

    /// The configured cache byte budget.
    pub fn max_cache_size(&self) -> usize {
        self.inner.accountant.limit()
    }

    /// Bytes currently charged by live frame data.
    pub fn memory_used(&self) -> usize {
        self.inner.accountant.used()
    }

    // ------------------------------------------------------------------
    // Message handlers
    // ------------------------------------------------------------------

    /// Register a message handler; the returned id removes it again.
    pub fn add_message_handler(&self, handler: MessageHandler) -> u64 {
        self.inner.handlers.add(handler)
    }

    /// Remove a message handler by id.
    pub fn remove_message_handler(&self, id: u64) -> bool {
        self.inner.handlers.remove(id)
    }

    /// Emit a message to every registered handler and to `tracing`.
    pub fn log(&self, severity: MessageSeverity, message: &str) {
        self.inner.handlers.dispatch(severity, message);
    }

    // ------------------------------------------------------------------
    // Frame constructors
    // ------------------------------------------------------------------

    /// Allocate a video frame; see [`Frame`] for the stride contract.
    pub fn new_video_frame(
        &self,
        format: VideoFormat,
        width: u32,
        height: u32,
        prop_src: Option<&Frame>,
    ) -> Result<Frame> {
        Frame::new_video(format, width, height, prop_src, &self.inner.accountant)
    }

    /// Allocate a video frame sharing some planes with source frames.
    pub fn new_video_frame_with_planes(
        &self,
        format: VideoFormat,
        width: u32,
        height: u32,
        sources: &[Option<(&Frame, usize)>],
        prop_src: Option<&Frame>,
    ) -> Result<Frame> {
        Frame::new_video_with_planes(format, width, height, sources, prop_src, &self.inner.accountant)
    }

    /// Allocate an audio frame of `sample_count` samples per channel.
    pub fn new_audio_frame(
        &self,
        format: AudioFormat,
        sample_count: usize,
        prop_src: Option<&Frame>,
    ) -> Result<Frame> {
        Frame::new_audio(format, sample_count, prop_src, &self.inner.accountant)
    }

    /// Deep-copy a frame, duplicating every plane.
    pub fn copy_frame(&self, src: &Frame) -> Frame {
        Frame::copy_of(src, &self.inner.accountant)
    }

    // ------------------------------------------------------------------
    // Filter instantiation
    // ------------------------------------------------------------------

    /// Create a video filter instance with one output per entry of
    /// `info`, returning the output node handles.
    pub fn create_video_filter(
        &self,
        name: impl Into<String>,
        info: &[VideoInfo],
        mode: FilterMode,
        flags: NodeFlags,
        filter: Arc<dyn Filter>,
    ) -> Vec<Node> {
        self.create_filter(
            name,
            info.iter().copied().map(StreamInfo::Video).collect(),
            mode,
            flags,
            filter,
        )
    }

    /// Create an audio filter instance with one output per entry of
    /// `info`, returning the output node handles.
    pub fn create_audio_filter(
        &self,
        name: impl Into<String>,
        info: &[AudioInfo],
        mode: FilterMode,
        flags: NodeFlags,
        filter: Arc<dyn Filter>,
    ) -> Vec<Node> {
        self.create_filter(
            name,
            info.iter().copied().map(StreamInfo::Audio).collect(),
            mode,
            flags,
            filter,
        )
    }

    fn create_filter(
        &self,
        name: impl Into<String>,
        info: SmallVec<[StreamInfo; 1]>,
        mode: FilterMode,
        flags: NodeFlags,
        filter: Arc<dyn Filter>,
    ) -> Vec<Node> {
        debug_assert!(!info.is_empty(), "a filter needs at least one output");
        let name = name.into();
        let cache = CacheHandle::new(name.clone(), flags.no_cache);
        self.inner.caches.register(&cache);
        let outputs = info.len();
        let inner = Arc::new(NodeInner {
            id: self.inner.next_node_id.fetch_add(1, Ordering::Relaxed),
            name,
            mode,
            flags,
            info,
            filter,
            core: Arc::clone(&self.inner),
            cache,
            sched: NodeSched::new(),
        });
        (0..outputs)
            .map(|output| Node {
                inner: Arc::clone(&inner),
                output,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Plugins
    // ------------------------------------------------------------------

    /// Register a plugin under its namespace.
    pub fn register_plugin(&self, plugin: Plugin) -> Result<Arc<Plugin>> {
        let mut plugins = self.inner.plugins.lock().unwrap();
        let ns = plugin.namespace().to_string();
        if plugins.contains_key(&ns) {
            return Err(Error::InvalidArgument(format!(
                "plugin namespace {ns:?} already registered"
            )));
        }
        let plugin = Arc::new(plugin);
        plugins.insert(ns, Arc::clone(&plugin));
        Ok(plugin)
    }

    /// Look up a plugin by namespace.
    pub fn plugin_by_namespace(&self, namespace: &str) -> Option<Arc<Plugin>> {
        self.inner.plugins.lock().unwrap().get(namespace).cloned()
    }

    /// Invoke a plugin function. Validation failures and function errors
    /// come back as the error string on the returned map.
    pub fn invoke(&self, plugin: &Plugin, name: &str, args: &Map) -> Map {
        plugin.invoke(name, args, self)
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("threads", &self.thread_count())
            .field("max_cache_size", &self.max_cache_size())
            .field("memory_used", &self.memory_used())
            .finish()
    }
}
