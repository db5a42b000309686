//! Node handles and the filter trait.
//!
//! A [`Node`] is a cheap handle to one output of a filter instance. Hosts
//! and downstream filters request frames from nodes; the scheduler drives
//! the owning filter's [`Filter::get_frame`] through the two-phase
//! activation protocol to produce them.

use crate::cache::CacheHandle;
use crate::context::FrameContext;
use crate::core::{Core, CoreInner};
use crate::error::{Error, Result};
use crate::format::{AudioInfo, VideoInfo};
use crate::frame::FrameRef;
use crate::scheduler;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Concurrency constraint on one filter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Any number of requests may execute concurrently.
    #[default]
    Parallel,
    /// Dependency declaration runs concurrently; frame production is
    /// serialized per instance.
    ParallelRequests,
    /// All activations serialize per instance, in any frame order.
    Unordered,
    /// All activations serialize, and frames are produced in ascending
    /// index order per output.
    Serial,
}

/// Per-node behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags {
    /// Keep only the most recent frame instead of a real cache.
    pub no_cache: bool,
    /// Deliver a [`Activation::FrameReady`] activation for every completed
    /// dependency, in completion order, so the filter can stream its
    /// requests in rounds.
    pub request_notifications: bool,
}

/// Why the scheduler is calling into a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// First call for a frame: declare dependencies via
    /// [`FrameContext::request_frame`], or produce the frame directly for
    /// source filters.
    Initial,
    /// Every declared dependency has resolved (or failed — check
    /// [`FrameContext::error`]); produce the output frame.
    AllFramesReady,
    /// One dependency completed; [`FrameContext::last_completed`] names
    /// it. Only delivered when [`NodeFlags::request_notifications`] is set.
    FrameReady,
}

/// A filter instance's frame callback.
///
/// Implementations are shared between worker threads; instance state that
/// mutates per frame needs interior synchronization (or a serializing
/// [`FilterMode`]).
pub trait Filter: Send + Sync {
    /// Produce (or make progress towards) frame `n` of this instance.
    ///
    /// Returning `Ok(None)` from [`Activation::Initial`] or
    /// [`Activation::FrameReady`] suspends the request until outstanding
    /// dependencies resolve. Returning a frame completes the request; a
    /// freshly built [`Frame`](crate::frame::Frame) publishes via
    /// `Arc::new`, and passing an input frame through unchanged is just a
    /// reference clone.
    /// Errors mark the context failed and propagate to all waiters.
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>>;
}

/// Stream description of one node output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamInfo {
    /// A video stream.
    Video(VideoInfo),
    /// An audio stream.
    Audio(AudioInfo),
}

impl StreamInfo {
    /// Total frames in the stream.
    pub fn num_frames(&self) -> usize {
        match self {
            StreamInfo::Video(vi) => vi.num_frames,
            StreamInfo::Audio(ai) => ai.num_frames,
        }
    }
}

/// Key identifying one frame of one node output across the engine.
pub(crate) type DepKey = (u64, usize, usize);

pub(crate) struct NodeInner {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) mode: FilterMode,
    pub(crate) flags: NodeFlags,
    pub(crate) info: SmallVec<[StreamInfo; 1]>,
    pub(crate) filter: Arc<dyn Filter>,
    pub(crate) core: Arc<CoreInner>,
    pub(crate) cache: Arc<CacheHandle>,
    pub(crate) sched: scheduler::NodeSched,
}

/// Handle to one output of a filter instance.
///
/// Cloning is an atomic refcount bump. When the last handle (and the last
/// context depending on the instance) goes away, the filter instance drops,
/// releasing its input nodes in turn.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
    pub(crate) output: usize,
}

impl Node {
    /// The owning filter's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Which output of the filter instance this handle refers to.
    pub fn output_index(&self) -> usize {
        self.output
    }

    /// The filter's concurrency mode.
    pub fn mode(&self) -> FilterMode {
        self.inner.mode
    }

    /// The node's behavior flags.
    pub fn flags(&self) -> NodeFlags {
        self.inner.flags
    }

    /// Stream info for this output.
    pub fn stream_info(&self) -> &StreamInfo {
        &self.inner.info[self.output]
    }

    /// Video stream info, if this output is video.
    pub fn video_info(&self) -> Option<VideoInfo> {
        match self.stream_info() {
            StreamInfo::Video(vi) => Some(*vi),
            StreamInfo::Audio(_) => None,
        }
    }

    /// Audio stream info, if this output is audio.
    pub fn audio_info(&self) -> Option<AudioInfo> {
        match self.stream_info() {
            StreamInfo::Audio(ai) => Some(*ai),
            StreamInfo::Video(_) => None,
        }
    }

    /// Whether this output is a video stream.
    pub fn is_video(&self) -> bool {
        matches!(self.stream_info(), StreamInfo::Video(_))
    }

    /// Total frames in this output's stream.
    pub fn num_frames(&self) -> usize {
        self.stream_info().num_frames()
    }

    /// Clamp a requested index into the stream.
    pub(crate) fn clamp_index(&self, n: usize) -> usize {
        let frames = self.num_frames();
        if frames == 0 {
            n
        } else {
            n.min(frames - 1)
        }
    }

    pub(crate) fn key(&self, n: usize) -> DepKey {
        (self.inner.id, self.output, n)
    }

    /// Request frame `n` and block until it completes.
    ///
    /// Safe to call from filter code running on a pool worker: the worker's
    /// slot is released for the duration of the wait and reclaimed after.
    pub fn get_frame(&self, n: usize) -> Result<FrameRef> {
        let (tx, rx) = kanal::bounded::<Result<FrameRef>>(1);
        self.get_frame_async(n, move |result| {
            let _ = tx.send(result);
        });
        scheduler::blocking_host_wait(&self.inner.core.pool, || {
            rx.recv().map_err(|_| Error::Shutdown)?
        })
    }

    /// Request frame `n`; `callback` fires exactly once on completion,
    /// from a worker thread (or inline on a cache hit).
    pub fn get_frame_async(
        &self,
        n: usize,
        callback: impl FnOnce(Result<FrameRef>) + Send + 'static,
    ) {
        let frames = self.num_frames();
        if n >= frames {
            callback(Err(Error::FrameOutOfRange {
                index: n as i64,
                num_frames: frames,
            }));
            return;
        }
        scheduler::request_root(&self.inner.core, self, n, Box::new(callback));
    }

    /// Two handles are the same node if they share the instance and output.
    pub fn same_node(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.output == other.output
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("output", &self.output)
            .field("mode", &self.inner.mode)
            .field("frames", &self.num_frames())
            .finish()
    }
}
