//! Video source filters.

use crate::context::FrameContext;
use crate::core::Core;
use crate::error::Result;
use crate::format::{SampleType, VideoFormat, VideoInfo};
use crate::frame::{Frame, FrameRef};
use crate::map::{AppendMode, Map};
use crate::node::{Activation, Filter, FilterMode, NodeFlags};
use crate::plugin::Plugin;
use std::sync::{Arc, Mutex};

macro_rules! ret_error {
    ($out:expr, $($arg:tt)*) => {{
        $out.set_error(format!($($arg)*));
        return;
    }};
}

pub(super) fn register(plugin: &Plugin) {
    plugin
        .register_function(
            "BlankClip",
            "width:int:opt;height:int:opt;format:data:opt;fpsnum:int:opt;fpsden:int:opt;length:int:opt;color:float[]:opt;keep:int:opt;",
            blank_clip_create,
        )
        .unwrap();
}

fn format_by_name(name: &str) -> Option<VideoFormat> {
    Some(match name {
        "GRAY8" => VideoFormat::gray8(),
        "GRAY16" => VideoFormat::gray16(),
        "YUV420P8" => VideoFormat::yuv420p8(),
        "YUV422P8" => VideoFormat::yuv422p8(),
        "YUV444P8" => VideoFormat::yuv444p8(),
        "RGB24" => VideoFormat::rgb24(),
        _ => return None,
    })
}

/// Fill one plane with a constant sample value.
fn fill_plane(frame: &mut Frame, plane: usize, value: f64) {
    let format = frame.video_format().expect("video frame");
    let data = frame.plane_data_mut(plane);
    match (format.sample_type, format.bytes_per_sample) {
        (SampleType::Integer, 1) => data.fill(value as u8),
        (SampleType::Integer, 2) => {
            let v = (value as u16).to_le_bytes();
            for chunk in data.chunks_exact_mut(2) {
                chunk.copy_from_slice(&v);
            }
        }
        (SampleType::Float, _) => {
            let v = (value as f32).to_le_bytes();
            for chunk in data.chunks_exact_mut(4) {
                chunk.copy_from_slice(&v);
            }
        }
        (SampleType::Integer, _) => {
            let v = (value as u32).to_le_bytes();
            for chunk in data.chunks_exact_mut(4) {
                chunk.copy_from_slice(&v);
            }
        }
    }
}

struct BlankClip {
    vi: VideoInfo,
    color: Vec<f64>,
    keep: bool,
    cached: Mutex<Option<FrameRef>>,
}

impl BlankClip {
    fn make_frame(&self, core: &Core) -> Result<FrameRef> {
        let mut frame =
            core.new_video_frame(self.vi.format, self.vi.width, self.vi.height, None)?;
        for plane in 0..self.vi.format.num_planes as usize {
            let value = self
                .color
                .get(plane)
                .or_else(|| self.color.last())
                .copied()
                .unwrap_or(0.0);
            fill_plane(&mut frame, plane, value);
        }
        Ok(Arc::new(frame))
    }
}

impl Filter for BlankClip {
    fn get_frame(
        &self,
        _n: usize,
        activation: Activation,
        _ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        if activation != Activation::Initial {
            return Ok(None);
        }
        if self.keep {
            let mut cached = self.cached.lock().unwrap();
            if cached.is_none() {
                *cached = Some(self.make_frame(core)?);
            }
            Ok(cached.clone())
        } else {
            Ok(Some(self.make_frame(core)?))
        }
    }
}

fn blank_clip_create(args: &Map, out: &mut Map, core: &Core) {
    let width = args.get_int_opt("width", 0).unwrap_or(None).unwrap_or(640);
    let height = args.get_int_opt("height", 0).unwrap_or(None).unwrap_or(480);
    let fps_num = args.get_int_opt("fpsnum", 0).unwrap_or(None).unwrap_or(24);
    let fps_den = args.get_int_opt("fpsden", 0).unwrap_or(None).unwrap_or(1);
    let length = args.get_int_opt("length", 0).unwrap_or(None).unwrap_or(240);
    let keep = args.get_int_opt("keep", 0).unwrap_or(None).unwrap_or(0) != 0;
    let color = match args.get_floats("color") {
        Ok(values) => values.to_vec(),
        Err(_) => Vec::new(),
    };

    if width <= 0 || height <= 0 {
        ret_error!(out, "BlankClip: invalid dimensions");
    }
    if fps_num <= 0 || fps_den <= 0 {
        ret_error!(out, "BlankClip: invalid frame rate");
    }
    if length <= 0 {
        ret_error!(out, "BlankClip: invalid length");
    }

    let format_name = args.get_utf8("format", 0).unwrap_or("YUV420P8").to_string();
    let Some(format) = format_by_name(&format_name) else {
        ret_error!(out, "BlankClip: unknown format {format_name:?}");
    };
    if width as u32 % (1 << format.sub_sampling_w) != 0
        || height as u32 % (1 << format.sub_sampling_h) != 0
    {
        ret_error!(out, "BlankClip: dimensions not compatible with subsampling");
    }

    let vi = VideoInfo {
        format,
        width: width as u32,
        height: height as u32,
        fps_num: fps_num as u64,
        fps_den: fps_den as u64,
        num_frames: length as usize,
    };

    let mode = if keep {
        FilterMode::Unordered
    } else {
        FilterMode::Parallel
    };
    let nodes = core.create_video_filter(
        "BlankClip",
        &[vi],
        mode,
        NodeFlags {
            no_cache: true,
            ..NodeFlags::default()
        },
        Arc::new(BlankClip {
            vi,
            color,
            keep,
            cached: Mutex::new(None),
        }),
    );
    out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
}
