//! Scheduler, cache, and core behavior tests using purpose-built filters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vantage::context::FrameContext;
use vantage::error::{Error, Result};
use vantage::format::{channels, AudioFormat, AudioInfo, SampleType, AUDIO_FRAME_SAMPLES};
use vantage::log::MessageSeverity;
use vantage::node::{Activation, Filter, FilterMode, Node, NodeFlags};
use vantage::{Core, FrameRef};

fn mono16(length: u64) -> AudioInfo {
    AudioInfo::new(
        AudioFormat::new(SampleType::Integer, 16, channels::MONO).unwrap(),
        48_000,
        length,
    )
}

/// Constant-tone source that counts invocations and can stall or fail.
struct CountingSource {
    ai: AudioInfo,
    invocations: Arc<AtomicUsize>,
    delay: Duration,
    fail_from: Option<usize>,
}

impl Filter for CountingSource {
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
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.fail_from.is_some_and(|from| n >= from) {
            return Err(Error::Filter(format!("source refused frame {n}")));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut frame = core.new_audio_frame(self.ai.format, self.ai.frame_samples(n), None)?;
        frame.plane_data_mut(0).fill(n as u8);
        Ok(Some(Arc::new(frame)))
    }
}

fn counting_source(
    core: &Core,
    frames: usize,
    invocations: Arc<AtomicUsize>,
    delay: Duration,
    fail_from: Option<usize>,
    flags: NodeFlags,
) -> Node {
    let ai = mono16(frames as u64 * AUDIO_FRAME_SAMPLES as u64);
    core.create_audio_filter(
        "CountingSource",
        &[ai],
        FilterMode::Parallel,
        flags,
        Arc::new(CountingSource {
            ai,
            invocations,
            delay,
            fail_from,
        }),
    )
    .remove(0)
}

#[test]
fn test_concurrent_requests_deduplicate() {
    let core = Core::new(4);
    let invocations = Arc::new(AtomicUsize::new(0));
    let node = counting_source(
        &core,
        4,
        Arc::clone(&invocations),
        Duration::from_millis(50),
        None,
        NodeFlags::default(),
    );

    let a = {
        let node = node.clone();
        std::thread::spawn(move || node.get_frame(0).unwrap())
    };
    let b = {
        let node = node.clone();
        std::thread::spawn(move || node.get_frame(0).unwrap())
    };
    let frame_a = a.join().unwrap();
    let frame_b = b.join().unwrap();

    // The filter ran at most once while both requests were pending, and
    // both callers see byte-identical planes.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(frame_a.plane_data(0), frame_b.plane_data(0));
}

#[test]
fn test_cache_hit_skips_filter() {
    let core = Core::new(2);
    let invocations = Arc::new(AtomicUsize::new(0));
    let node = counting_source(
        &core,
        4,
        Arc::clone(&invocations),
        Duration::ZERO,
        None,
        NodeFlags::default(),
    );

    let first = node.get_frame(2).unwrap();
    let second = node.get_frame(2).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn test_cache_eviction_under_budget() {
    let core = Core::new(2);
    let invocations = Arc::new(AtomicUsize::new(0));
    let node = counting_source(
        &core,
        10,
        Arc::clone(&invocations),
        Duration::ZERO,
        None,
        NodeFlags::default(),
    );

    let frame_bytes = node.get_frame(0).unwrap().total_bytes();
    core.set_max_cache_size(2 * frame_bytes);

    for n in 0..10 {
        let frame = node.get_frame(n).unwrap();
        drop(frame);
        // Budget plus at most one in-flight frame of slack.
        assert!(
            core.memory_used() <= 3 * frame_bytes,
            "memory {} exceeds bound at frame {n}",
            core.memory_used()
        );
    }
    // With room for two cached frames, at least eight of ten requests
    // missed.
    assert!(invocations.load(Ordering::SeqCst) >= 8);

    // The most recent frame is still cached.
    let before = invocations.load(Ordering::SeqCst);
    node.get_frame(9).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), before);
}

/// Records the order in which frames are produced.
struct OrderRecorder {
    source: Node,
    produced: Arc<Mutex<Vec<usize>>>,
}

impl Filter for OrderRecorder {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        _core: &Core,
    ) -> Result<Option<FrameRef>> {
        match activation {
            Activation::Initial => {
                ctx.request_frame(&self.source, n);
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                self.produced.lock().unwrap().push(n);
                Ok(ctx.frame(&self.source, n))
            }
            Activation::FrameReady => Ok(None),
        }
    }
}

#[test]
fn test_serial_mode_produces_in_ascending_order() {
    let core = Core::new(4);
    let invocations = Arc::new(AtomicUsize::new(0));
    let source = counting_source(
        &core,
        10,
        invocations,
        Duration::from_millis(2),
        None,
        NodeFlags::default(),
    );
    let produced = Arc::new(Mutex::new(Vec::new()));
    let ai = source.audio_info().unwrap();
    let node = core
        .create_audio_filter(
            "OrderRecorder",
            &[ai],
            FilterMode::Serial,
            NodeFlags::default(),
            Arc::new(OrderRecorder {
                source,
                produced: Arc::clone(&produced),
            }),
        )
        .remove(0);

    let (tx, rx) = kanal::bounded::<Result<FrameRef>>(16);
    for n in 0..10 {
        let tx = tx.clone();
        node.get_frame_async(n, move |result| {
            let _ = tx.send(result);
        });
    }
    for _ in 0..10 {
        rx.recv().unwrap().unwrap();
    }

    let produced = produced.lock().unwrap();
    assert_eq!(produced.len(), 10);
    assert!(
        produced.windows(2).all(|pair| pair[0] < pair[1]),
        "serial production order not ascending: {produced:?}"
    );
}

#[test]
fn test_dependency_error_propagates() {
    let core = Core::new(2);
    let invocations = Arc::new(AtomicUsize::new(0));
    let source = counting_source(
        &core,
        4,
        invocations,
        Duration::ZERO,
        Some(0),
        NodeFlags::default(),
    );
    let produced = Arc::new(Mutex::new(Vec::new()));
    let ai = source.audio_info().unwrap();
    let node = core
        .create_audio_filter(
            "OrderRecorder",
            &[ai],
            FilterMode::Parallel,
            NodeFlags::default(),
            Arc::new(OrderRecorder { source, produced }),
        )
        .remove(0);

    let err = node.get_frame(0).unwrap_err();
    match err {
        Error::Dependency(message) => assert!(message.contains("source refused frame 0")),
        other => panic!("expected dependency error, got {other:?}"),
    }
}

/// Declares three dependencies and counts FrameReady notifications.
struct StreamingConsumer {
    source: Node,
    notifications: Arc<AtomicUsize>,
}

impl Filter for StreamingConsumer {
    fn get_frame(
        &self,
        _n: usize,
        activation: Activation,
        ctx: &FrameContext,
        _core: &Core,
    ) -> Result<Option<FrameRef>> {
        match activation {
            Activation::Initial => {
                for m in 0..3 {
                    ctx.request_frame(&self.source, m);
                }
                Ok(None)
            }
            Activation::FrameReady => {
                // Each completed dependency announces itself exactly once.
                assert!(ctx.last_completed().is_some());
                self.notifications.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                Ok(ctx.frame(&self.source, 0))
            }
        }
    }
}

#[test]
fn test_frame_ready_notifications_fire_per_dependency() {
    let core = Core::new(4);
    let invocations = Arc::new(AtomicUsize::new(0));
    let source = counting_source(
        &core,
        4,
        invocations,
        Duration::from_millis(1),
        None,
        NodeFlags::default(),
    );
    let notifications = Arc::new(AtomicUsize::new(0));
    let ai = source.audio_info().unwrap();
    let node = core
        .create_audio_filter(
            "StreamingConsumer",
            &[ai],
            FilterMode::Parallel,
            NodeFlags {
                request_notifications: true,
                ..NodeFlags::default()
            },
            Arc::new(StreamingConsumer {
                source,
                notifications: Arc::clone(&notifications),
            }),
        )
        .remove(0);

    node.get_frame(0).unwrap();
    assert_eq!(notifications.load(Ordering::SeqCst), 3);
}

/// Consumes its dependency and drops it early.
struct EarlyReleaser {
    source: Node,
}

impl Filter for EarlyReleaser {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        ctx: &FrameContext,
        core: &Core,
    ) -> Result<Option<FrameRef>> {
        match activation {
            Activation::Initial => {
                ctx.request_frame(&self.source, n);
                Ok(None)
            }
            Activation::AllFramesReady => {
                if ctx.error().is_some() {
                    return Ok(None);
                }
                let src = ctx
                    .frame(&self.source, n)
                    .ok_or_else(|| Error::Filter("missing dependency".into()))?;
                let mut out =
                    core.new_audio_frame(src.audio_format().unwrap(), src.sample_count(), None)?;
                out.plane_data_mut(0).copy_from_slice(src.plane_data(0));
                drop(src);
                ctx.release_frame_early(&self.source, n);
                assert!(ctx.frame(&self.source, n).is_none());
                Ok(Some(Arc::new(out)))
            }
            Activation::FrameReady => Ok(None),
        }
    }
}

#[test]
fn test_release_frame_early() {
    let core = Core::new(2);
    let invocations = Arc::new(AtomicUsize::new(0));
    let source = counting_source(
        &core,
        2,
        invocations,
        Duration::ZERO,
        None,
        NodeFlags::default(),
    );
    let ai = source.audio_info().unwrap();
    let node = core
        .create_audio_filter(
            "EarlyReleaser",
            &[ai],
            FilterMode::Parallel,
            NodeFlags::default(),
            Arc::new(EarlyReleaser { source }),
        )
        .remove(0);

    let frame = node.get_frame(1).unwrap();
    assert_eq!(frame.plane_data(0)[0], 1);
}

/// Blocks on a nested synchronous request from inside an activation, the
/// way an embedded host would.
struct NestedBlocker {
    source: Node,
}

impl Filter for NestedBlocker {
    fn get_frame(
        &self,
        n: usize,
        activation: Activation,
        _ctx: &FrameContext,
        _core: &Core,
    ) -> Result<Option<FrameRef>> {
        if activation != Activation::Initial {
            return Ok(None);
        }
        // A blocking request from a worker thread must lend its pool slot
        // back, or a single-threaded pool would deadlock here.
        let frame = self.source.get_frame(n)?;
        Ok(Some(frame))
    }
}

#[test]
fn test_nested_blocking_request_on_single_thread_pool() {
    let core = Core::new(1);
    let invocations = Arc::new(AtomicUsize::new(0));
    let source = counting_source(
        &core,
        2,
        invocations,
        Duration::ZERO,
        None,
        NodeFlags::default(),
    );
    let ai = source.audio_info().unwrap();
    let node = core
        .create_audio_filter(
            "NestedBlocker",
            &[ai],
            FilterMode::Parallel,
            NodeFlags::default(),
            Arc::new(NestedBlocker { source }),
        )
        .remove(0);

    let frame = node.get_frame(0).unwrap();
    assert_eq!(frame.plane_data(0)[0], 0);
}

#[test]
fn test_no_cache_node_recomputes() {
    let core = Core::new(2);
    let invocations = Arc::new(AtomicUsize::new(0));
    let node = counting_source(
        &core,
        4,
        Arc::clone(&invocations),
        Duration::ZERO,
        None,
        NodeFlags {
            no_cache: true,
            ..NodeFlags::default()
        },
    );

    // The single-slot cache absorbs immediate re-asks of the same frame.
    node.get_frame(0).unwrap();
    node.get_frame(0).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // A different frame displaces the slot.
    node.get_frame(1).unwrap();
    node.get_frame(0).unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

#[test]
fn test_message_handlers_have_stable_ids() {
    let core = Core::new(1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = core.add_message_handler(Box::new(move |severity, message| {
        sink.lock().unwrap().push((severity, message.to_string()));
    }));

    core.log(MessageSeverity::Warning, "pool saturated");
    assert!(core.remove_message_handler(id));
    assert!(!core.remove_message_handler(id));
    core.log(MessageSeverity::Warning, "ignored");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, MessageSeverity::Warning);
    assert_eq!(seen[0].1, "pool saturated");
}

#[test]
fn test_set_thread_count() {
    let core = Core::new(2);
    assert_eq!(core.thread_count(), 2);
    assert_eq!(core.set_thread_count(4), 4);
    let invocations = Arc::new(AtomicUsize::new(0));
    let node = counting_source(
        &core,
        4,
        invocations,
        Duration::ZERO,
        None,
        NodeFlags::default(),
    );
    node.get_frame(3).unwrap();
}

#[test]
fn test_get_frame_async_callback() {
    let core = Core::new(2);
    let invocations = Arc::new(AtomicUsize::new(0));
    let node = counting_source(
        &core,
        4,
        invocations,
        Duration::ZERO,
        None,
        NodeFlags::default(),
    );

    let (tx, rx) = kanal::bounded::<Result<FrameRef>>(1);
    node.get_frame_async(1, move |result| {
        let _ = tx.send(result);
    });
    let frame = rx.recv().unwrap().unwrap();
    assert_eq!(frame.plane_data(0)[0], 1);
}
