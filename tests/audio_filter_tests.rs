//! End-to-end tests of the std audio filters through the invoke surface.

use vantage::format::{channels, AUDIO_FRAME_SAMPLES};
use vantage::map::{AppendMode, Map};
use vantage::{Core, FrameRef, Node};

fn invoke_clip(core: &Core, name: &str, args: &Map) -> Node {
    let std = core.plugin_by_namespace("std").expect("std plugin");
    let out = core.invoke(&std, name, args);
    assert_eq!(out.error(), None, "{name} failed: {:?}", out.error());
    out.get_audio_node("clip", 0).expect("clip output")
}

fn blank_audio(core: &Core, length: i64) -> Node {
    let mut args = Map::new();
    args.set_int("samplerate", 48_000, AppendMode::Replace).unwrap();
    args.set_int("length", length, AppendMode::Replace).unwrap();
    invoke_clip(core, "BlankAudio", &args)
}

fn test_audio(core: &Core, length: i64) -> Node {
    let mut args = Map::new();
    args.set_int("samplerate", 48_000, AppendMode::Replace).unwrap();
    args.set_int("length", length, AppendMode::Replace).unwrap();
    invoke_clip(core, "TestAudio", &args)
}

fn sample_i16(frame: &FrameRef, channel: usize, index: usize) -> i16 {
    let data = frame.plane_data(channel);
    i16::from_le_bytes([data[index * 2], data[index * 2 + 1]])
}

/// The 16-bit ramp TestAudio generates: x[i] = i mod 0xFFFF.
fn ramp(sample: i64) -> i16 {
    ((sample % 0xFFFF) as u16) as i16
}

#[test]
fn test_blank_audio_produces_silence() {
    let core = Core::new(0);
    let mut args = Map::new();
    args.set_int("samplerate", 48_000, AppendMode::Replace).unwrap();
    args.set_int("length", 96_000, AppendMode::Replace).unwrap();
    args.set_int("channels", channels::STEREO as i64, AppendMode::Replace)
        .unwrap();
    args.set_int("bits", 16, AppendMode::Replace).unwrap();
    let clip = invoke_clip(&core, "BlankAudio", &args);

    let ai = clip.audio_info().unwrap();
    assert_eq!(ai.num_samples, 96_000);
    assert_eq!(ai.format.num_channels, 2);

    let frame = clip.get_frame(0).unwrap();
    assert_eq!(frame.sample_count(), AUDIO_FRAME_SAMPLES);
    assert_eq!(frame.num_planes(), 2);
    for channel in 0..2 {
        assert!(frame.plane_data(channel).iter().all(|&b| b == 0));
    }
}

#[test]
fn test_audio_trim_offsets_samples() {
    let core = Core::new(0);
    let src = test_audio(&core, 10_000);

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    args.set_int("first", 1000, AppendMode::Replace).unwrap();
    args.set_int("length", 5000, AppendMode::Replace).unwrap();
    let trimmed = invoke_clip(&core, "AudioTrim", &args);

    let ai = trimmed.audio_info().unwrap();
    assert_eq!(ai.num_samples, 5000);

    // Frame 0 carries source samples 1000..4071.
    let frame = trimmed.get_frame(0).unwrap();
    assert_eq!(frame.sample_count(), AUDIO_FRAME_SAMPLES);
    for i in [0usize, 1, 2071, 2072, 3071] {
        assert_eq!(
            sample_i16(&frame, 0, i),
            ramp(1000 + i as i64),
            "sample {i} mismatch"
        );
    }
}

#[test]
fn test_audio_trim_rejects_bad_ranges() {
    let core = Core::new(0);
    let src = blank_audio(&core, 1000);
    let std = core.plugin_by_namespace("std").unwrap();

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    args.set_int("last", 10, AppendMode::Replace).unwrap();
    args.set_int("length", 10, AppendMode::Replace).unwrap();
    let out = core.invoke(&std, "AudioTrim", &args);
    assert!(out.error().unwrap().contains("both last sample and length"));

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    args.set_int("first", 2000, AppendMode::Replace).unwrap();
    let out = core.invoke(&std, "AudioTrim", &args);
    assert!(out.error().unwrap().contains("beyond clip end"));
}

#[test]
fn test_audio_trim_nop_passes_input_through() {
    let core = Core::new(0);
    let src = blank_audio(&core, 1000);

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    let trimmed = invoke_clip(&core, "AudioTrim", &args);
    assert!(trimmed.same_node(&src));
}

#[test]
fn test_audio_splice_concatenates() {
    let core = Core::new(0);
    let a = test_audio(&core, 100);
    let b = test_audio(&core, 200);

    let mut args = Map::new();
    args.set_node("clips", &a, AppendMode::Append).unwrap();
    args.set_node("clips", &b, AppendMode::Append).unwrap();
    let spliced = invoke_clip(&core, "AudioSplice", &args);

    let ai = spliced.audio_info().unwrap();
    assert_eq!(ai.num_samples, 300);
    assert_eq!(ai.num_frames, 1);

    let frame = spliced.get_frame(0).unwrap();
    assert_eq!(frame.sample_count(), 300);
    // Samples 0..99 from the first source, 100..299 restart the ramp.
    assert_eq!(sample_i16(&frame, 0, 99), ramp(99));
    assert_eq!(sample_i16(&frame, 0, 100), ramp(0));
    assert_eq!(sample_i16(&frame, 0, 299), ramp(199));
}

#[test]
fn test_audio_splice_format_mismatch() {
    let core = Core::new(0);
    let a = blank_audio(&core, 100);
    let mut args = Map::new();
    args.set_int("samplerate", 44_100, AppendMode::Replace).unwrap();
    args.set_int("length", 100, AppendMode::Replace).unwrap();
    let b = invoke_clip(&core, "BlankAudio", &args);

    let std = core.plugin_by_namespace("std").unwrap();
    let mut args = Map::new();
    args.set_node("clips", &a, AppendMode::Append).unwrap();
    args.set_node("clips", &b, AppendMode::Append).unwrap();
    let out = core.invoke(&std, "AudioSplice", &args);
    assert!(out.error().unwrap().contains("format mismatch"));
}

#[test]
fn test_audio_loop_repeats_source() {
    let core = Core::new(0);
    let src = test_audio(&core, 100);

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    args.set_int("times", 3, AppendMode::Replace).unwrap();
    let looped = invoke_clip(&core, "AudioLoop", &args);

    let ai = looped.audio_info().unwrap();
    assert_eq!(ai.num_samples, 300);

    let frame = looped.get_frame(0).unwrap();
    assert_eq!(frame.sample_count(), 300);
    for period in 0..3 {
        assert_eq!(sample_i16(&frame, 0, period * 100), ramp(0));
        assert_eq!(sample_i16(&frame, 0, period * 100 + 99), ramp(99));
    }
}

#[test]
fn test_audio_reverse_mirrors_samples() {
    let core = Core::new(0);
    let src = test_audio(&core, AUDIO_FRAME_SAMPLES as i64);

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    let reversed = invoke_clip(&core, "AudioReverse", &args);

    let frame = reversed.get_frame(0).unwrap();
    assert_eq!(frame.sample_count(), AUDIO_FRAME_SAMPLES);
    for i in [0usize, 1, 1536, 3070, 3071] {
        assert_eq!(
            sample_i16(&frame, 0, i),
            ramp((AUDIO_FRAME_SAMPLES - 1 - i) as i64),
            "sample {i} mismatch"
        );
    }
}

#[test]
fn test_audio_reverse_short_stream() {
    let core = Core::new(0);
    // Two frames: 3072 + 1000 samples.
    let src = test_audio(&core, 4072);

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    let reversed = invoke_clip(&core, "AudioReverse", &args);

    // Frame 0 of the reversed clip starts at the stream's last sample.
    let frame = reversed.get_frame(0).unwrap();
    assert_eq!(sample_i16(&frame, 0, 0), ramp(4071));
    assert_eq!(sample_i16(&frame, 0, 3071), ramp(1000));

    let tail = reversed.get_frame(1).unwrap();
    assert_eq!(tail.sample_count(), 1000);
    assert_eq!(sample_i16(&tail, 0, 0), ramp(999));
    assert_eq!(sample_i16(&tail, 0, 999), ramp(0));
}

#[test]
fn test_audio_gain_scales_samples() {
    let core = Core::new(0);
    let src = test_audio(&core, 1000);

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    args.set_float_array("gain", &[0.5, 2.0]).unwrap();
    let gained = invoke_clip(&core, "AudioGain", &args);

    let frame = gained.get_frame(0).unwrap();
    assert_eq!(sample_i16(&frame, 0, 100), (ramp(100) as f64 * 0.5) as i16);
    assert_eq!(sample_i16(&frame, 1, 100), (ramp(100) as f64 * 2.0) as i16);
}

#[test]
fn test_audio_gain_wrong_weight_count() {
    let core = Core::new(0);
    let src = blank_audio(&core, 1000);
    let std = core.plugin_by_namespace("std").unwrap();

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    args.set_float_array("gain", &[1.0, 1.0, 1.0]).unwrap();
    let out = core.invoke(&std, "AudioGain", &args);
    assert!(out.error().unwrap().contains("one gain value per channel"));
}

#[test]
fn test_audio_mix_downmixes_to_mono() {
    let core = Core::new(0);
    let src = test_audio(&core, 1000);

    let mut args = Map::new();
    args.set_node("clips", &src, AppendMode::Replace).unwrap();
    args.set_float_array("matrix", &[0.5, 0.5]).unwrap();
    args.set_int_array("channels_out", &[channels::FRONT_CENTER as i64])
        .unwrap();
    let mixed = invoke_clip(&core, "AudioMix", &args);

    let ai = mixed.audio_info().unwrap();
    assert_eq!(ai.format.num_channels, 1);

    // Both TestAudio channels carry the same ramp, so the mono mix
    // reproduces it.
    let frame = mixed.get_frame(0).unwrap();
    assert_eq!(sample_i16(&frame, 0, 123), ramp(123));
}

#[test]
fn test_shuffle_channels_swaps_stereo() {
    let core = Core::new(0);
    let src = blank_audio(&core, 1000);
    let std = core.plugin_by_namespace("std").unwrap();

    // Rewire left->right and right->left.
    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    args.set_int_array(
        "channels_in",
        &[channels::FRONT_RIGHT as i64, channels::FRONT_LEFT as i64],
    )
    .unwrap();
    args.set_int_array(
        "channels_out",
        &[channels::FRONT_LEFT as i64, channels::FRONT_RIGHT as i64],
    )
    .unwrap();
    let out = core.invoke(&std, "ShuffleChannels", &args);
    assert_eq!(out.error(), None);
    let shuffled = out.get_audio_node("clip", 0).unwrap();
    assert_eq!(shuffled.audio_info().unwrap().format.num_channels, 2);
    let frame = shuffled.get_frame(0).unwrap();
    assert_eq!(frame.num_planes(), 2);
}

#[test]
fn test_split_channels_yields_one_node_per_channel() {
    let core = Core::new(0);
    let src = test_audio(&core, 1000);
    let std = core.plugin_by_namespace("std").unwrap();

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    let out = core.invoke(&std, "SplitChannels", &args);
    assert_eq!(out.error(), None);
    assert_eq!(out.num_elements("clip"), Some(2));

    for index in 0..2 {
        let mono = out.get_audio_node("clip", index).unwrap();
        let ai = mono.audio_info().unwrap();
        assert_eq!(ai.format.num_channels, 1);
        let frame = mono.get_frame(0).unwrap();
        assert_eq!(frame.num_planes(), 1);
        assert_eq!(sample_i16(&frame, 0, 42), ramp(42));
    }
}

#[test]
fn test_assume_sample_rate_rewrites_rate() {
    let core = Core::new(0);
    let src = blank_audio(&core, 1000);

    let mut args = Map::new();
    args.set_node("clip", &src, AppendMode::Replace).unwrap();
    args.set_int("samplerate", 96_000, AppendMode::Replace).unwrap();
    let retimed = invoke_clip(&core, "AssumeSampleRate", &args);

    assert_eq!(retimed.audio_info().unwrap().sample_rate, 96_000);
    // Frames pass through by reference.
    let frame = retimed.get_frame(0).unwrap();
    assert_eq!(frame.sample_count(), 1000);
}

#[test]
fn test_assume_sample_rate_from_src() {
    let core = Core::new(0);
    let clip = blank_audio(&core, 1000);
    let mut args = Map::new();
    args.set_int("samplerate", 96_000, AppendMode::Replace).unwrap();
    args.set_int("length", 1000, AppendMode::Replace).unwrap();
    let src = invoke_clip(&core, "BlankAudio", &args);
    assert_eq!(src.audio_info().unwrap().sample_rate, 96_000);

    // The src clip donates its rate; samples pass through untouched.
    let mut args = Map::new();
    args.set_node("clip", &clip, AppendMode::Replace).unwrap();
    args.set_node("src", &src, AppendMode::Replace).unwrap();
    let retimed = invoke_clip(&core, "AssumeSampleRate", &args);

    assert_eq!(retimed.audio_info().unwrap().sample_rate, 96_000);
    assert_eq!(retimed.audio_info().unwrap().num_samples, 1000);
    let frame = retimed.get_frame(0).unwrap();
    assert_eq!(frame.sample_count(), 1000);

    // Passing both src and samplerate stays an error.
    let std = core.plugin_by_namespace("std").unwrap();
    let mut args = Map::new();
    args.set_node("clip", &clip, AppendMode::Replace).unwrap();
    args.set_node("src", &src, AppendMode::Replace).unwrap();
    args.set_int("samplerate", 44_100, AppendMode::Replace).unwrap();
    let out = core.invoke(&std, "AssumeSampleRate", &args);
    assert!(out
        .error()
        .unwrap()
        .contains("source clip or samplerate"));
}

#[test]
fn test_frame_out_of_range() {
    let core = Core::new(0);
    let src = blank_audio(&core, 1000);
    let err = src.get_frame(5).unwrap_err();
    assert!(err.to_string().contains("out of range"));
}
