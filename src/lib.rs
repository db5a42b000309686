//! # Vantage
//!
//! An on-demand frame-graph engine for video and audio.
//!
//! A host (or a script layer built on top of one) constructs a directed
//! acyclic graph of filter nodes. Each node exposes one or more output
//! streams — video (frames of a declared pixel format) or audio (fixed-size
//! planar sample frames) — and individual frames are computed on demand,
//! concurrently, by a work pool that resolves inter-frame dependencies,
//! caches results under a global byte budget, and propagates errors.
//!
//! ## The two-phase request protocol
//!
//! Filters never block on their own inputs. A filter's [`Filter::get_frame`]
//! callback is invoked at least twice per output frame:
//!
//! 1. [`Activation::Initial`] — the filter declares its dependencies by
//!    calling [`FrameContext::request_frame`] and returns `None`.
//! 2. [`Activation::AllFramesReady`] — every dependency has resolved; the
//!    filter fetches them with [`FrameContext::frame`] (a pure map lookup),
//!    computes its output, and returns the new frame.
//!
//! Filters that stream their requests in rounds additionally receive
//! [`Activation::FrameReady`] once per completed dependency, in completion
//! order.
//!
//! ## Quick start
//!
//! ```rust
//! use vantage::prelude::*;
//!
//! let core = Core::new(0);
//! let mut args = Map::new();
//! args.set_int("samplerate", 48_000, AppendMode::Replace).unwrap();
//! args.set_int("length", 96_000, AppendMode::Replace).unwrap();
//!
//! let std = core.plugin_by_namespace("std").unwrap();
//! let out = core.invoke(&std, "BlankAudio", &args);
//! let clip = out.get_audio_node("clip", 0).unwrap();
//! let frame = clip.get_frame(0).unwrap();
//! assert_eq!(frame.sample_count(), 3072);
//! ```
//!
//! The [`avi`] module turns a video node plus an optional audio node into a
//! byte-addressable AVI v2 file image served by random-access reads.
//!
//! [`Filter::get_frame`]: crate::node::Filter::get_frame
//! [`Activation::Initial`]: crate::node::Activation::Initial
//! [`Activation::AllFramesReady`]: crate::node::Activation::AllFramesReady
//! [`Activation::FrameReady`]: crate::node::Activation::FrameReady
//! [`FrameContext::request_frame`]: crate::context::FrameContext::request_frame
//! [`FrameContext::frame`]: crate::context::FrameContext::frame

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod avi;
pub mod cache;
pub mod context;
pub mod core;
pub mod error;
pub mod filters;
pub mod format;
pub mod frame;
pub mod log;
pub mod map;
pub mod memory;
pub mod node;
pub mod plugin;
pub mod scheduler;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::context::FrameContext;
    pub use crate::core::Core;
    pub use crate::error::{Error, Result};
    pub use crate::format::{
        AudioFormat, AudioInfo, ColorFamily, SampleType, VideoFormat, VideoInfo,
        AUDIO_FRAME_SAMPLES,
    };
    pub use crate::frame::{Frame, FrameRef};
    pub use crate::map::{AppendMode, Map, PropError};
    pub use crate::node::{Activation, Filter, FilterMode, Node, NodeFlags};
}

pub use crate::core::Core;
pub use crate::error::{Error, Result};
pub use crate::format::AUDIO_FRAME_SAMPLES;
pub use crate::frame::{Frame, FrameRef};
pub use crate::map::Map;
pub use crate::node::{Activation, Filter, FilterMode, Node};
