//! Audio source and utility filters.

use super::Sample;
use crate::context::FrameContext;
use crate::core::Core;
use crate::error::{Error, Result};
use crate::format::{channels, AudioFormat, AudioInfo, SampleType, AUDIO_FRAME_SAMPLES};
use crate::frame::FrameRef;
use crate::map::{AppendMode, Map};
use crate::node::{Activation, Filter, FilterMode, Node, NodeFlags};
use crate::plugin::Plugin;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

const FS: i64 = AUDIO_FRAME_SAMPLES as i64;

macro_rules! ret_error {
    ($out:expr, $($arg:tt)*) => {{
        $out.set_error(format!($($arg)*));
        return;
    }};
}

fn missing_dep(name: &str) -> Error {
    Error::Filter(format!("{name}: dependency frame missing"))
}

fn no_cache() -> NodeFlags {
    NodeFlags {
        no_cache: true,
        ..NodeFlags::default()
    }
}

pub(super) fn register(plugin: &Plugin) {
    plugin
        .register_function(
            "AudioTrim",
            "clip:anode;first:int:opt;last:int:opt;length:int:opt;",
            audio_trim_create,
        )
        .unwrap();
    plugin
        .register_function("AudioSplice", "clips:anode[];", audio_splice_create)
        .unwrap();
    plugin
        .register_function("AudioLoop", "clip:anode;times:int:opt;", audio_loop_create)
        .unwrap();
    plugin
        .register_function("AudioReverse", "clip:anode;", audio_reverse_create)
        .unwrap();
    plugin
        .register_function("AudioGain", "clip:anode;gain:float[]:opt;", audio_gain_create)
        .unwrap();
    plugin
        .register_function(
            "AudioMix",
            "clips:anode[];matrix:float[];channels_out:int[];",
            audio_mix_create,
        )
        .unwrap();
    plugin
        .register_function(
            "ShuffleChannels",
            "clip:anode[];channels_in:int[];channels_out:int[];",
            shuffle_channels_create,
        )
        .unwrap();
    plugin
        .register_function("SplitChannels", "clip:anode;", split_channels_create)
        .unwrap();
    plugin
        .register_function(
            "AssumeSampleRate",
            "clip:anode;src:anode:opt;samplerate:int:opt;",
            assume_sample_rate_create,
        )
        .unwrap();
    plugin
        .register_function(
            "BlankAudio",
            "channels:int:opt;bits:int:opt;isfloat:int:opt;samplerate:int:opt;length:int:opt;keep:int:opt;",
            blank_audio_create,
        )
        .unwrap();
    plugin
        .register_function(
            "TestAudio",
            "channels:int:opt;bits:int:opt;isfloat:int:opt;samplerate:int:opt;length:int:opt;",
            test_audio_create,
        )
        .unwrap();
}

/// Parse the shared source-filter arguments (format, rate, length).
fn parse_source_args(args: &Map, name: &str) -> std::result::Result<AudioInfo, String> {
    let layout = args
        .get_int_opt("channels", 0)
        .map_err(|e| e.to_string())?
        .unwrap_or(channels::STEREO as i64) as u64;
    let bits = args
        .get_int_opt("bits", 0)
        .map_err(|e| e.to_string())?
        .unwrap_or(16) as u32;
    let is_float = args
        .get_int_opt("isfloat", 0)
        .map_err(|e| e.to_string())?
        .unwrap_or(0)
        != 0;
    let sample_rate = args
        .get_int_opt("samplerate", 0)
        .map_err(|e| e.to_string())?
        .unwrap_or(44_100);
    let length = args
        .get_int_opt("length", 0)
        .map_err(|e| e.to_string())?
        .unwrap_or(sample_rate * 60 * 60);

    if sample_rate <= 0 {
        return Err(format!("{name}: invalid sample rate"));
    }
    if length <= 0 {
        return Err(format!("{name}: invalid length"));
    }
    let sample_type = if is_float {
        SampleType::Float
    } else {
        SampleType::Integer
    };
    let format = AudioFormat::new(sample_type, bits, layout)
        .map_err(|_| format!("{name}: invalid format"))?;
    Ok(AudioInfo::new(format, sample_rate as u32, length as u64))
}

// ============================================================================
// BlankAudio
// ============================================================================

struct BlankAudio {
    ai: AudioInfo,
    keep: bool,
    cached: Mutex<Option<FrameRef>>,
}

impl Filter for BlankAudio {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        _ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        if activation != Activation::Initial {
            return Ok(None);
        }
        if self.keep {
            let mut cached = self.cached.lock().unwrap();
            if let Some(frame) = cached.as_ref() {
                return Ok(Some(Arc::clone(frame)));
            }
            let frame: FrameRef = Arc::new(core.new_audio_frame(
                self.ai.format,
                self.ai.frame_samples(n),
                None,
            )?);
            *cached = Some(Arc::clone(&frame));
            Ok(Some(frame))
        } else {
            let frame = core.new_audio_frame(self.ai.format, self.ai.frame_samples(n), None)?;
            Ok(Some(Arc::new(frame)))
        }
    }
}

fn blank_audio_create(args: &Map, out: &mut Map, core: &Core) {
    let ai = match parse_source_args(args, "BlankAudio") {
        Ok(ai) => ai,
        Err(message) => ret_error!(out, "{message}"),
    };
    let keep = args.get_int_opt("keep", 0).unwrap_or(None).unwrap_or(0) != 0;

    let mode = if keep {
        FilterMode::Unordered
    } else {
        FilterMode::Parallel
    };
    let nodes = core.create_audio_filter(
        "BlankAudio",
        &[ai],
        mode,
        no_cache(),
        Arc::new(BlankAudio {
            ai,
            keep,
            cached: Mutex::new(None),
        }),
    );
    out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
}

// ============================================================================
// TestAudio
// ============================================================================

struct TestAudio {
    ai: AudioInfo,
}

impl Filter for TestAudio {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        _ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        if activation != Activation::Initial {
            return Ok(None);
        }
        let start = n as i64 * FS;
        let samples = self.ai.frame_samples(n);
        let mut frame = core.new_audio_frame(self.ai.format, samples, None)?;
        for channel in 0..self.ai.format.num_channels as usize {
            let data = frame.plane_data_mut(channel);
            for i in 0..samples {
                let value = ((start + i as i64) % 0xFFFF) as u16;
                data[i * 2..i * 2 + 2].copy_from_slice(&value.to_le_bytes());
            }
        }
        Ok(Some(Arc::new(frame)))
    }
}

fn test_audio_create(args: &Map, out: &mut Map, core: &Core) {
    let ai = match parse_source_args(args, "TestAudio") {
        Ok(ai) => ai,
        Err(message) => ret_error!(out, "{message}"),
    };
    if ai.format.bits_per_sample != 16 || ai.format.sample_type != SampleType::Integer {
        ret_error!(out, "TestAudio: bits must be 16!");
    }
    let nodes = core.create_audio_filter(
        "TestAudio",
        &[ai],
        FilterMode::Parallel,
        no_cache(),
        Arc::new(TestAudio { ai }),
    );
    out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
}

// ============================================================================
// AudioTrim
// ============================================================================

struct AudioTrim {
    node: Node,
    ai: AudioInfo,
    first: i64,
}

impl Filter for AudioTrim {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        let start_sample = n as i64 * FS + self.first;
        let start_frame = (start_sample / FS) as usize;
        let length = (self.ai.num_samples as i64 - n as i64 * FS).min(FS) as usize;
        let bps = self.ai.format.bytes_per_sample as usize;

        if start_sample % FS == 0 && n != self.ai.num_frames - 1 {
            // Source frames pass through untouched when aligned.
            match activation {
                Activation::Initial => {
                    ctx.request_frame(&self.node, start_frame);
                    Ok(None)
                }
                Activation::AllFramesReady => {
                    if ctx.error().is_some() {
                        return Ok(None);
                    }
                    let src = ctx
                        .frame(&self.node, start_frame)
                        .ok_or_else(|| missing_dep("AudioTrim"))?;
                    if length == src.sample_count() {
                        return Ok(Some(src));
                    }
                    let mut dst = core.new_audio_frame(self.ai.format, length, Some(&src))?;
                    for channel in 0..self.ai.format.num_channels as usize {
                        dst.plane_data_mut(channel)
                            .copy_from_slice(&src.plane_data(channel)[..length * bps]);
                    }
                    Ok(Some(Arc::new(dst)))
                }
                Activation::FrameReady => Ok(None),
            }
        } else {
            let num_src1 = (FS - start_sample % FS) as usize;
            match activation {
                Activation::Initial => {
                    ctx.request_frame(&self.node, start_frame);
                    if num_src1 < length {
                        ctx.request_frame(&self.node, start_frame + 1);
                    }
                    Ok(None)
                }
                Activation::AllFramesReady => {
                    if ctx.error().is_some() {
                        return Ok(None);
                    }
                    let src1 = ctx
                        .frame(&self.node, start_frame)
                        .ok_or_else(|| missing_dep("AudioTrim"))?;
                    let mut dst = core.new_audio_frame(self.ai.format, length, Some(&src1))?;
                    let head = num_src1.min(length);
                    let src_offset = (AUDIO_FRAME_SAMPLES - num_src1) * bps;
                    for channel in 0..self.ai.format.num_channels as usize {
                        dst.plane_data_mut(channel)[..head * bps].copy_from_slice(
                            &src1.plane_data(channel)[src_offset..src_offset + head * bps],
                        );
                    }
                    if length > num_src1 {
                        let src2 = ctx
                            .frame(&self.node, start_frame + 1)
                            .ok_or_else(|| missing_dep("AudioTrim"))?;
                        let tail = length - num_src1;
                        for channel in 0..self.ai.format.num_channels as usize {
                            dst.plane_data_mut(channel)[num_src1 * bps..length * bps]
                                .copy_from_slice(&src2.plane_data(channel)[..tail * bps]);
                        }
                    }
                    Ok(Some(Arc::new(dst)))
                }
                Activation::FrameReady => Ok(None),
            }
        }
    }
}

fn audio_trim_create(args: &Map, out: &mut Map, core: &Core) {
    let first = args.get_int_opt("first", 0).unwrap_or(None);
    let last = args.get_int_opt("last", 0).unwrap_or(None);
    let length = args.get_int_opt("length", 0).unwrap_or(None);

    if last.is_some() && length.is_some() {
        ret_error!(out, "AudioTrim: both last sample and length specified");
    }
    let first_value = first.unwrap_or(0);
    if let Some(last) = last {
        if last < first_value {
            ret_error!(
                out,
                "AudioTrim: invalid last sample specified (last is less than first)"
            );
        }
    }
    if let Some(length) = length {
        if length < 1 {
            ret_error!(out, "AudioTrim: invalid length specified (less than 1)");
        }
    }
    if first_value < 0 {
        ret_error!(out, "AudioTrim: invalid first sample specified (less than 0)");
    }

    let node = args.get_audio_node("clip", 0).unwrap();
    let src_ai = node.audio_info().unwrap();

    let beyond_end = last.is_some_and(|l| l as u64 >= src_ai.num_samples)
        || length.is_some_and(|l| (first_value + l) as u64 > src_ai.num_samples)
        || src_ai.num_samples <= first_value as u64;
    if beyond_end {
        ret_error!(out, "AudioTrim: last sample beyond clip end");
    }

    let trim_len = if let Some(last) = last {
        last - first_value + 1
    } else if let Some(length) = length {
        length
    } else {
        src_ai.num_samples as i64 - first_value
    };

    // An obvious nop passes the input clip straight through.
    if (first.is_none() && last.is_none() && length.is_none())
        || (trim_len > 0 && trim_len as u64 == src_ai.num_samples)
    {
        out.set_node("clip", &node, AppendMode::Replace).unwrap();
        return;
    }

    let ai = src_ai.with_num_samples(trim_len as u64);
    let nodes = core.create_audio_filter(
        "AudioTrim",
        &[ai],
        FilterMode::Parallel,
        no_cache(),
        Arc::new(AudioTrim {
            node,
            ai,
            first: first_value,
        }),
    );
    out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
}

// ============================================================================
// AudioSplice
// ============================================================================

struct AudioSplice {
    nodes: Vec<Node>,
    ai: AudioInfo,
    num_samples: Vec<u64>,
    cum_samples: Vec<u64>,
    num_frames: Vec<usize>,
}

impl Filter for AudioSplice {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        let sample_start = n as i64 * FS;
        let mut remaining = (self.ai.num_samples as i64 - sample_start).min(FS);
        let bps = self.ai.format.bytes_per_sample as usize;

        match activation {
            Activation::Initial => {
                if let Some(first) = self
                    .cum_samples
                    .iter()
                    .position(|&cum| cum as i64 > sample_start)
                {
                    let mut i = first;
                    let before = if i > 0 { self.cum_samples[i - 1] as i64 } else { 0 };
                    let current_start = sample_start - before;
                    let mut req_offset = current_start % FS;
                    let mut req_frame = (current_start / FS) as usize;
                    loop {
                        let req_start = req_frame as i64 * FS;
                        let req_samples =
                            (FS - req_offset).min(self.num_samples[i] as i64 - req_start);
                        req_offset = 0;
                        ctx.request_frame(&self.nodes[i], req_frame);
                        remaining -= req_samples;
                        req_frame += 1;
                        if req_frame > self.num_frames[i] - 1 {
                            req_frame = 0;
                            i += 1;
                        }
                        if remaining <= 0 {
                            break;
                        }
                    }
                }
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                let mut dst: Option<crate::frame::Frame> = None;
                let mut dst_offset = 0usize;

                if let Some(first) = self
                    .cum_samples
                    .iter()
                    .position(|&cum| cum as i64 > sample_start)
                {
                    let mut i = first;
                    let before = if i > 0 { self.cum_samples[i - 1] as i64 } else { 0 };
                    let current_start = sample_start - before;
                    let mut req_offset = (current_start % FS) as usize;
                    let mut req_frame = (current_start / FS) as usize;
                    loop {
                        let src = ctx
                            .frame(&self.nodes[i], req_frame)
                            .ok_or_else(|| missing_dep("AudioSplice"))?;
                        req_frame += 1;
                        let length = src.sample_count() - req_offset;
                        if dst.is_none() {
                            dst = Some(core.new_audio_frame(
                                self.ai.format,
                                remaining as usize,
                                Some(&src),
                            )?);
                        }
                        let dst_frame = dst.as_mut().expect("allocated above");
                        let copy = length.min(remaining as usize);
                        for channel in 0..self.ai.format.num_channels as usize {
                            dst_frame.plane_data_mut(channel)
                                [dst_offset..dst_offset + copy * bps]
                                .copy_from_slice(
                                    &src.plane_data(channel)
                                        [req_offset * bps..(req_offset + copy) * bps],
                                );
                        }
                        req_offset = 0;
                        dst_offset += length * bps;
                        remaining -= length as i64;
                        if req_frame > self.num_frames[i] - 1 {
                            req_frame = 0;
                            i += 1;
                        }
                        if remaining <= 0 {
                            break;
                        }
                    }
                }
                Ok(dst.map(Arc::new))
            }
            Activation::FrameReady => Ok(None),
        }
    }
}

fn audio_splice_create(args: &Map, out: &mut Map, core: &Core) {
    let nodes: Vec<Node> = args.get_nodes("clips").unwrap().to_vec();
    if nodes.len() == 1 {
        out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
        return;
    }

    let first_ai = nodes[0].audio_info().unwrap();
    for node in &nodes[1..] {
        if !first_ai.same_stream(&node.audio_info().unwrap()) {
            ret_error!(out, "AudioSplice: format mismatch");
        }
    }

    let mut num_samples = Vec::with_capacity(nodes.len());
    let mut num_frames = Vec::with_capacity(nodes.len());
    let mut total = 0u64;
    for node in &nodes {
        let ai = node.audio_info().unwrap();
        num_samples.push(ai.num_samples);
        num_frames.push(ai.num_frames);
        total += ai.num_samples;
    }
    let mut cum_samples = Vec::with_capacity(nodes.len());
    let mut running = 0u64;
    for &samples in &num_samples {
        running += samples;
        cum_samples.push(running);
    }

    let ai = first_ai.with_num_samples(total);
    let created = core.create_audio_filter(
        "AudioSplice",
        &[ai],
        FilterMode::Parallel,
        no_cache(),
        Arc::new(AudioSplice {
            nodes,
            ai,
            num_samples,
            cum_samples,
            num_frames,
        }),
    );
    out.set_node("clip", &created[0], AppendMode::Replace).unwrap();
}

// ============================================================================
// AudioLoop
// ============================================================================

struct AudioLoop {
    node: Node,
    ai: AudioInfo,
    src_samples: u64,
    src_frames: usize,
}

impl Filter for AudioLoop {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        let mut req_start = (n as i64 * FS) % self.src_samples as i64;
        let start_frame = (req_start / FS) as usize;
        let mut req_frame = start_frame;
        let mut req_offset = req_start % FS;
        let mut remaining = (self.ai.num_samples as i64 - n as i64 * FS).min(FS);
        let bps = self.ai.format.bytes_per_sample as usize;

        match activation {
            Activation::Initial => {
                loop {
                    let req_samples = (FS - req_offset).min(self.src_samples as i64 - req_start);
                    req_offset = 0;
                    ctx.request_frame(&self.node, req_frame);
                    req_frame += 1;
                    remaining -= req_samples;
                    req_start += req_samples;
                    if req_frame > self.src_frames - 1 {
                        req_frame = 0;
                        req_start = 0;
                    }
                    if remaining <= 0 || req_frame == start_frame {
                        break;
                    }
                }
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                let mut dst: Option<crate::frame::Frame> = None;
                let mut dst_offset = 0usize;
                let mut req_offset = req_offset as usize;
                loop {
                    let src = ctx
                        .frame(&self.node, req_frame)
                        .ok_or_else(|| missing_dep("AudioLoop"))?;
                    req_frame += 1;
                    let length = src.sample_count() - req_offset;
                    if dst.is_none() {
                        dst = Some(core.new_audio_frame(
                            self.ai.format,
                            remaining as usize,
                            Some(&src),
                        )?);
                    }
                    let dst_frame = dst.as_mut().expect("allocated above");
                    let copy = length.min(remaining as usize);
                    for channel in 0..self.ai.format.num_channels as usize {
                        dst_frame.plane_data_mut(channel)[dst_offset..dst_offset + copy * bps]
                            .copy_from_slice(
                                &src.plane_data(channel)
                                    [req_offset * bps..(req_offset + copy) * bps],
                            );
                    }
                    req_offset = 0;
                    dst_offset += length * bps;
                    remaining -= length as i64;
                    if req_frame > self.src_frames - 1 {
                        req_frame = 0;
                    }
                    if remaining <= 0 {
                        break;
                    }
                }
                Ok(dst.map(Arc::new))
            }
            Activation::FrameReady => Ok(None),
        }
    }
}

fn audio_loop_create(args: &Map, out: &mut Map, core: &Core) {
    let times = args.get_int_opt("times", 0).unwrap_or(None).unwrap_or(0);
    if times < 0 {
        ret_error!(out, "AudioLoop: cannot repeat clip a negative number of times");
    }

    let node = args.get_audio_node("clip", 0).unwrap();
    let src_ai = node.audio_info().unwrap();
    let src_samples = src_ai.num_samples;
    let src_frames = src_ai.num_frames;

    if times == 1 {
        out.set_node("clip", &node, AppendMode::Replace).unwrap();
        return;
    }

    let max_samples = i32::MAX as u64 * AUDIO_FRAME_SAMPLES as u64;
    let total = if times > 0 {
        if src_samples > max_samples / times as u64 {
            ret_error!(out, "AudioLoop: resulting clip is too long");
        }
        src_samples * times as u64
    } else {
        max_samples
    };

    let ai = src_ai.with_num_samples(total);
    let nodes = core.create_audio_filter(
        "AudioLoop",
        &[ai],
        FilterMode::Parallel,
        NodeFlags::default(),
        Arc::new(AudioLoop {
            node,
            ai,
            src_samples,
            src_frames,
        }),
    );
    out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
}

// ============================================================================
// AudioReverse
// ============================================================================

struct AudioReverse<S> {
    node: Node,
    ai: AudioInfo,
    _sample: PhantomData<S>,
}

impl<S: Sample> Filter for AudioReverse<S> {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        let n1 = self.ai.num_frames - 1 - n;
        let n2 = self.ai.num_frames.saturating_sub(n + 2);

        match activation {
            Activation::Initial => {
                ctx.request_frame(&self.node, n1);
                if self.ai.num_samples % AUDIO_FRAME_SAMPLES as u64 != 0 {
                    ctx.request_frame(&self.node, n2);
                }
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                let dst_length =
                    ((self.ai.num_samples as i64 - n as i64 * FS).min(FS)) as usize;
                let src1 = ctx
                    .frame(&self.node, n1)
                    .ok_or_else(|| missing_dep("AudioReverse"))?;
                let l1 = src1.sample_count();
                let rem = (self.ai.num_samples % AUDIO_FRAME_SAMPLES as u64) as usize;
                let mut s1_offset = l1 - rem.min(l1);
                if s1_offset == AUDIO_FRAME_SAMPLES {
                    s1_offset = 0;
                }
                let s1_samples = l1 - s1_offset;

                let mut dst = core.new_audio_frame(self.ai.format, dst_length, Some(&src1))?;
                for channel in 0..self.ai.format.num_channels as usize {
                    let src_data = src1.plane_data(channel);
                    let dst_data = dst.plane_data_mut(channel);
                    for i in 0..s1_samples.min(dst_length) {
                        let v = S::read(src_data, l1 - i - 1 - s1_offset);
                        S::write(dst_data, i, v);
                    }
                }

                let remaining = dst_length.saturating_sub(s1_samples);
                if remaining > 0 {
                    let src2 = ctx
                        .frame(&self.node, n2)
                        .ok_or_else(|| missing_dep("AudioReverse"))?;
                    let l2 = src2.sample_count();
                    for channel in 0..self.ai.format.num_channels as usize {
                        let src_data = src2.plane_data(channel);
                        let dst_data = dst.plane_data_mut(channel);
                        for i in 0..remaining {
                            let v = S::read(src_data, l2 - i - 1);
                            S::write(dst_data, s1_samples + i, v);
                        }
                    }
                }
                Ok(Some(Arc::new(dst)))
            }
            Activation::FrameReady => Ok(None),
        }
    }
}

fn audio_reverse_create(args: &Map, out: &mut Map, core: &Core) {
    let node = args.get_audio_node("clip", 0).unwrap();
    let ai = node.audio_info().unwrap();

    let filter: Arc<dyn Filter> = match (ai.format.sample_type, ai.format.bytes_per_sample) {
        (SampleType::Float, _) => Arc::new(AudioReverse::<f32> {
            node,
            ai,
            _sample: PhantomData,
        }),
        (_, 2) => Arc::new(AudioReverse::<i16> {
            node,
            ai,
            _sample: PhantomData,
        }),
        _ => Arc::new(AudioReverse::<i32> {
            node,
            ai,
            _sample: PhantomData,
        }),
    };
    let nodes = core.create_audio_filter(
        "AudioReverse",
        &[ai],
        FilterMode::Parallel,
        NodeFlags::default(),
        filter,
    );
    out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
}

// ============================================================================
// AudioGain
// ============================================================================

struct AudioGain<S> {
    node: Node,
    ai: AudioInfo,
    gain: Vec<f64>,
    _sample: PhantomData<S>,
}

impl<S: Sample> Filter for AudioGain<S> {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        match activation {
            Activation::Initial => {
                ctx.request_frame(&self.node, n);
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                let src = ctx
                    .frame(&self.node, n)
                    .ok_or_else(|| missing_dep("AudioGain"))?;
                let length = src.sample_count();
                let mut dst = core.new_audio_frame(self.ai.format, length, Some(&src))?;
                for channel in 0..self.ai.format.num_channels as usize {
                    let gain = self.gain[if self.gain.len() > 1 { channel } else { 0 }];
                    let src_data = src.plane_data(channel);
                    let dst_data = dst.plane_data_mut(channel);
                    for i in 0..length {
                        let v = S::read(src_data, i).to_f64() * gain;
                        S::write(dst_data, i, S::from_f64(v));
                    }
                }
                Ok(Some(Arc::new(dst)))
            }
            Activation::FrameReady => Ok(None),
        }
    }
}

fn audio_gain_create(args: &Map, out: &mut Map, core: &Core) {
    let gain = match args.get_floats("gain") {
        Ok(values) => values.to_vec(),
        Err(_) => vec![1.0],
    };
    let node = args.get_audio_node("clip", 0).unwrap();
    let ai = node.audio_info().unwrap();

    if gain.len() != 1 && gain.len() != ai.format.num_channels as usize {
        ret_error!(
            out,
            "AudioGain: must provide one gain value per channel or a single value used for all channels"
        );
    }

    let filter: Arc<dyn Filter> = match (ai.format.sample_type, ai.format.bytes_per_sample) {
        (SampleType::Float, _) => Arc::new(AudioGain::<f32> {
            node,
            ai,
            gain,
            _sample: PhantomData,
        }),
        (_, 2) => Arc::new(AudioGain::<i16> {
            node,
            ai,
            gain,
            _sample: PhantomData,
        }),
        _ => Arc::new(AudioGain::<i32> {
            node,
            ai,
            gain,
            _sample: PhantomData,
        }),
    };
    let nodes = core.create_audio_filter(
        "AudioGain",
        &[ai],
        FilterMode::Parallel,
        NodeFlags::default(),
        filter,
    );
    out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
}

// ============================================================================
// AudioMix
// ============================================================================

struct MixSource {
    node: Node,
    channel: usize,
    weights: Vec<f64>,
}

struct AudioMix<S> {
    req_nodes: Vec<Node>,
    sources: Vec<MixSource>,
    output_idx: Vec<usize>,
    ai: AudioInfo,
    _sample: PhantomData<S>,
}

impl<S: Sample> Filter for AudioMix<S> {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        match activation {
            Activation::Initial => {
                for node in &self.req_nodes {
                    ctx.request_frame(node, n);
                }
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                let frames: Vec<FrameRef> = self
                    .sources
                    .iter()
                    .map(|source| {
                        ctx.frame(&source.node, n)
                            .ok_or_else(|| missing_dep("AudioMix"))
                    })
                    .collect::<Result<_>>()?;

                let src_length = frames[0].sample_count();
                let out_channels = self.ai.format.num_channels as usize;
                let mut dst =
                    core.new_audio_frame(self.ai.format, src_length, Some(&frames[0]))?;

                for i in 0..src_length {
                    for (dst_idx, &out_pos) in self.output_idx.iter().enumerate().take(out_channels)
                    {
                        let mut acc = 0.0;
                        for (source, frame) in self.sources.iter().zip(&frames) {
                            let v = S::read(frame.plane_data(source.channel), i).to_f64();
                            acc += v * source.weights[dst_idx];
                        }
                        S::write(dst.plane_data_mut(out_pos), i, S::from_f64(acc));
                    }
                }
                Ok(Some(Arc::new(dst)))
            }
            Activation::FrameReady => Ok(None),
        }
    }
}

fn audio_mix_create(args: &Map, out: &mut Map, core: &Core) {
    let clips: Vec<Node> = args.get_nodes("clips").unwrap().to_vec();
    let matrix = args.get_floats("matrix").unwrap().to_vec();
    let channels_out = args.get_ints("channels_out").unwrap().to_vec();
    let num_dst_channels = channels_out.len();

    let mut channel_layout = 0u64;
    for &channel in &channels_out {
        if !(0..64).contains(&channel) {
            ret_error!(out, "AudioMix: invalid output channel {channel}");
        }
        channel_layout |= 1u64 << channel;
    }

    let mut output_idx = Vec::with_capacity(num_dst_channels);
    for &channel in &channels_out {
        let below = channel_layout & ((1u64 << channel) - 1);
        output_idx.push(below.count_ones() as usize);
    }

    // One mix source per input channel across all clips.
    let mut sources: Vec<MixSource> = Vec::new();
    for node in &clips {
        let format = node.audio_info().unwrap().format;
        for channel in 0..format.num_channels as usize {
            sources.push(MixSource {
                node: node.clone(),
                channel,
                weights: Vec::new(),
            });
        }
    }
    let num_src_channels = sources.len();

    if clips.len() > num_src_channels {
        ret_error!(out, "AudioMix: cannot have more input nodes than selected input channels");
    }
    if num_dst_channels * num_src_channels != matrix.len() {
        ret_error!(
            out,
            "AudioMix: the number of matrix weights must equal (input channels * output channels)"
        );
    }

    let mut ai = clips[0].audio_info().unwrap();
    for (i, source) in sources.iter_mut().enumerate() {
        let src_ai = source.node.audio_info().unwrap();
        if src_ai.num_samples != ai.num_samples
            || src_ai.sample_rate != ai.sample_rate
            || src_ai.format.bits_per_sample != ai.format.bits_per_sample
            || src_ai.format.sample_type != ai.format.sample_type
        {
            ret_error!(
                out,
                "AudioMix: all inputs must have the same length, samplerate, bits per sample and sample type"
            );
        }
        ai.num_samples = ai.num_samples.max(src_ai.num_samples);
        for j in 0..num_dst_channels {
            source.weights.push(matrix[j * num_src_channels + i]);
        }
    }

    let format = match AudioFormat::new(
        ai.format.sample_type,
        ai.format.bits_per_sample,
        channel_layout,
    ) {
        Ok(format) => format,
        Err(_) => ret_error!(out, "AudioMix: invalid output channel configuration"),
    };
    if format.num_channels as usize != num_dst_channels {
        ret_error!(out, "AudioMix: output channel specified twice");
    }
    let ai = AudioInfo::new(format, ai.sample_rate, ai.num_samples);

    let mut req_nodes: Vec<Node> = Vec::new();
    for source in &sources {
        if !req_nodes.iter().any(|n| n.same_node(&source.node)) {
            req_nodes.push(source.node.clone());
        }
    }

    let filter: Arc<dyn Filter> = match (ai.format.sample_type, ai.format.bytes_per_sample) {
        (SampleType::Float, _) => Arc::new(AudioMix::<f32> {
            req_nodes,
            sources,
            output_idx,
            ai,
            _sample: PhantomData,
        }),
        (_, 2) => Arc::new(AudioMix::<i16> {
            req_nodes,
            sources,
            output_idx,
            ai,
            _sample: PhantomData,
        }),
        _ => Arc::new(AudioMix::<i32> {
            req_nodes,
            sources,
            output_idx,
            ai,
            _sample: PhantomData,
        }),
    };
    let nodes = core.create_audio_filter(
        "AudioMix",
        &[ai],
        FilterMode::Parallel,
        NodeFlags::default(),
        filter,
    );
    out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
}

// ============================================================================
// ShuffleChannels
// ============================================================================

struct ShuffleSource {
    node: Node,
    channel: usize,
    num_frames: usize,
}

struct ShuffleChannels {
    req_nodes: Vec<Node>,
    sources: Vec<ShuffleSource>,
    ai: AudioInfo,
}

impl Filter for ShuffleChannels {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        match activation {
            Activation::Initial => {
                for node in &self.req_nodes {
                    ctx.request_frame(node, n);
                }
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                let bps = self.ai.format.bytes_per_sample as usize;
                let dst_length =
                    ((self.ai.num_samples as i64 - n as i64 * FS).min(FS)) as usize;
                let mut dst: Option<crate::frame::Frame> = None;
                for (idx, source) in self.sources.iter().enumerate() {
                    let src = ctx
                        .frame(&source.node, n)
                        .ok_or_else(|| missing_dep("ShuffleChannels"))?;
                    let src_length = if n < source.num_frames {
                        src.sample_count()
                    } else {
                        0
                    };
                    let copy = dst_length.min(src_length);
                    if dst.is_none() {
                        dst = Some(core.new_audio_frame(self.ai.format, dst_length, Some(&src))?);
                    }
                    let dst_frame = dst.as_mut().expect("allocated above");
                    if copy > 0 {
                        dst_frame.plane_data_mut(idx)[..copy * bps]
                            .copy_from_slice(&src.plane_data(source.channel)[..copy * bps]);
                    }
                    if dst_length > copy {
                        dst_frame.plane_data_mut(idx)[copy * bps..dst_length * bps].fill(0);
                    }
                }
                Ok(dst.map(Arc::new))
            }
            Activation::FrameReady => Ok(None),
        }
    }
}

fn shuffle_channels_create(args: &Map, out: &mut Map, core: &Core) {
    let clips: Vec<Node> = args.get_nodes("clip").unwrap().to_vec();
    let channels_in = args.get_ints("channels_in").unwrap().to_vec();
    let channels_out = args.get_ints("channels_out").unwrap().to_vec();

    if channels_in.len() != channels_out.len() {
        ret_error!(
            out,
            "ShuffleChannels: must have the same number of input and output channels"
        );
    }
    if clips.len() > channels_in.len() {
        ret_error!(
            out,
            "ShuffleChannels: cannot have more input nodes than selected input channels"
        );
    }

    let mut channel_layout = 0u64;
    let mut picks: Vec<(i64, i64, Node)> = Vec::new();
    for (i, (&channel, &dst_channel)) in channels_in.iter().zip(&channels_out).enumerate() {
        if !(0..64).contains(&dst_channel) {
            ret_error!(out, "ShuffleChannels: invalid output channel {dst_channel}");
        }
        channel_layout |= 1u64 << dst_channel;
        let node = clips[i.min(clips.len() - 1)].clone();
        picks.push((channel, dst_channel, node));
    }
    picks.sort_by_key(|(_, dst, _)| *dst);

    let mut ai = picks[0].2.audio_info().unwrap();
    let mut sources = Vec::with_capacity(picks.len());
    for (channel, _, node) in picks {
        let src_ai = node.audio_info().unwrap();
        if src_ai.sample_rate != ai.sample_rate
            || src_ai.format.bits_per_sample != ai.format.bits_per_sample
            || src_ai.format.sample_type != ai.format.sample_type
        {
            ret_error!(
                out,
                "ShuffleChannels: all inputs must have the same samplerate, bits per sample and sample type"
            );
        }
        // Negative channel values address channels by position instead of
        // by layout bit.
        let index = if channel < 0 {
            let index = (-channel - 1) as usize;
            if src_ai.format.num_channels as usize <= index {
                ret_error!(out, "ShuffleChannels: specified channel is not present in input");
            }
            index
        } else {
            if channel > 0 && src_ai.format.channel_layout & (1u64 << channel) == 0 {
                ret_error!(out, "ShuffleChannels: specified channel is not present in input");
            }
            (src_ai.format.channel_layout & ((1u64 << channel) - 1)).count_ones() as usize
        };
        ai.num_samples = ai.num_samples.max(src_ai.num_samples);
        sources.push(ShuffleSource {
            node,
            channel: index,
            num_frames: src_ai.num_frames,
        });
    }

    let format = match AudioFormat::new(
        ai.format.sample_type,
        ai.format.bits_per_sample,
        channel_layout,
    ) {
        Ok(format) => format,
        Err(_) => ret_error!(out, "ShuffleChannels: invalid output channel configuration"),
    };
    if format.num_channels as usize != sources.len() {
        ret_error!(out, "ShuffleChannels: output channel specified twice");
    }
    let ai = AudioInfo::new(format, ai.sample_rate, ai.num_samples);

    let mut req_nodes: Vec<Node> = Vec::new();
    for source in &sources {
        if !req_nodes.iter().any(|n| n.same_node(&source.node)) {
            req_nodes.push(source.node.clone());
        }
    }

    let nodes = core.create_audio_filter(
        "ShuffleChannels",
        &[ai],
        FilterMode::Parallel,
        NodeFlags::default(),
        Arc::new(ShuffleChannels {
            req_nodes,
            sources,
            ai,
        }),
    );
    out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
}

// ============================================================================
// SplitChannels
// ============================================================================

struct SplitChannels {
    node: Node,
    infos: Vec<AudioInfo>,
}

impl Filter for SplitChannels {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        match activation {
            Activation::Initial => {
                ctx.request_frame(&self.node, n);
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                let out_idx = ctx.output_index();
                let src = ctx
                    .frame(&self.node, n)
                    .ok_or_else(|| missing_dep("SplitChannels"))?;
                let length = src.sample_count();
                let bps = self.infos[out_idx].format.bytes_per_sample as usize;
                let mut dst =
                    core.new_audio_frame(self.infos[out_idx].format, length, Some(&src))?;
                dst.plane_data_mut(0)
                    .copy_from_slice(&src.plane_data(out_idx)[..length * bps]);
                Ok(Some(Arc::new(dst)))
            }
            Activation::FrameReady => Ok(None),
        }
    }
}

fn split_channels_create(args: &Map, out: &mut Map, core: &Core) {
    let node = args.get_audio_node("clip", 0).unwrap();
    let src_ai = node.audio_info().unwrap();
    let layout = src_ai.format.channel_layout;

    let mut infos = Vec::with_capacity(src_ai.format.num_channels as usize);
    let mut bit = 0u32;
    for _ in 0..src_ai.format.num_channels {
        while layout & (1u64 << bit) == 0 {
            bit += 1;
        }
        let format = AudioFormat::new(
            src_ai.format.sample_type,
            src_ai.format.bits_per_sample,
            1u64 << bit,
        )
        .expect("single-channel layout is valid");
        infos.push(AudioInfo::new(format, src_ai.sample_rate, src_ai.num_samples));
        bit += 1;
    }

    let nodes = core.create_audio_filter(
        "SplitChannels",
        &infos,
        FilterMode::Parallel,
        NodeFlags::default(),
        Arc::new(SplitChannels {
            node,
            infos: infos.clone(),
        }),
    );
    for node in &nodes {
        out.set_node("clip", node, AppendMode::Append).unwrap();
    }
}

// ============================================================================
// AssumeSampleRate
// ============================================================================

struct AssumeSampleRate {
    node: Node,
}

impl Filter for AssumeSampleRate {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        _core: &Core,
    ) -> Result<Option<FrameRef>> {
        match activation {
            Activation::Initial => {
                ctx.request_frame(&self.node, n);
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                Ok(ctx.frame(&self.node, n))
            }
            Activation::FrameReady => Ok(None),
        }
    }
}

fn assume_sample_rate_create(args: &Map, out: &mut Map, core: &Core) {
    let node = args.get_audio_node("clip", 0).unwrap();
    let mut ai = node.audio_info().unwrap();

    let rate = args.get_int_opt("samplerate", 0).unwrap_or(None);
    let src = args.get_audio_node("src", 0).ok();

    match (&rate, &src) {
        (Some(_), Some(_)) | (None, None) => {
            ret_error!(out, "AssumeSampleRate: need to specify source clip or samplerate");
        }
        (Some(rate), None) => {
            if *rate < 1 {
                ret_error!(out, "AssumeSampleRate: invalid samplerate specified");
            }
            ai.sample_rate = *rate as u32;
        }
        (None, Some(src)) => {
            ai.sample_rate = src.audio_info().unwrap().sample_rate;
        }
    }

    let nodes = core.create_audio_filter(
        "AssumeSampleRate",
        &[ai],
        FilterMode::Parallel,
        no_cache(),
        Arc::new(AssumeSampleRate { node }),
    );
    out.set_node("clip", &nodes[0], AppendMode::Replace).unwrap();
}
