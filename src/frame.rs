//! Reference-counted video and audio frames.
//!
//! A [`Frame`] is immutable after publication: filters build one, fill its
//! planes, and hand it to the engine as a [`FrameRef`]. Plane buffers are
//! individually reference-counted so a frame may share planes with another
//! frame (see [`Frame::new_video_with_planes`]); mutable access detaches a
//! shared plane by copying it first.
//!
//! Every plane allocation charges the core's [`MemoryAccountant`] and
//! credits it back when the last reference goes away.

use crate::error::{Error, Result};
use crate::format::{AudioFormat, VideoFormat, AUDIO_FRAME_SAMPLES};
use crate::map::Map;
use crate::memory::MemoryAccountant;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Shared handle to a published, immutable frame.
pub type FrameRef = Arc<Frame>;

/// Row alignment of video plane strides, in bytes.
pub const FRAME_ALIGN: usize = 64;

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// One contiguous, accounted allocation backing a plane.
struct PlaneBuf {
    data: Vec<u8>,
    accountant: Arc<MemoryAccountant>,
}

impl PlaneBuf {
    fn new(len: usize, accountant: Arc<MemoryAccountant>) -> Self {
        accountant.charge(len);
        Self {
            data: vec![0; len],
            accountant,
        }
    }
}

impl Clone for PlaneBuf {
    fn clone(&self) -> Self {
        self.accountant.charge(self.data.len());
        Self {
            data: self.data.clone(),
            accountant: Arc::clone(&self.accountant),
        }
    }
}

impl Drop for PlaneBuf {
    fn drop(&mut self) {
        self.accountant.credit(self.data.len());
    }
}

/// A plane of pixel rows (or one audio channel), possibly shared between
/// frames.
#[derive(Clone)]
struct Plane {
    buf: Arc<PlaneBuf>,
    stride: usize,
    width: u32,
    height: u32,
}

impl Plane {
    fn alloc(width: u32, height: u32, bytes_per_sample: u32, acc: &Arc<MemoryAccountant>) -> Self {
        let stride = align_up(width as usize * bytes_per_sample as usize, FRAME_ALIGN);
        Self {
            buf: Arc::new(PlaneBuf::new(stride * height as usize, Arc::clone(acc))),
            stride,
            width,
            height,
        }
    }

    fn alloc_audio(samples: usize, bytes_per_sample: u32, acc: &Arc<MemoryAccountant>) -> Self {
        let len = samples * bytes_per_sample as usize;
        Self {
            buf: Arc::new(PlaneBuf::new(len, Arc::clone(acc))),
            stride: len,
            width: samples as u32,
            height: 1,
        }
    }
}

enum Body {
    Video {
        format: VideoFormat,
        width: u32,
        height: u32,
        planes: SmallVec<[Plane; 3]>,
    },
    Audio {
        format: AudioFormat,
        sample_count: usize,
        channels: SmallVec<[Plane; 8]>,
    },
}

/// A video or audio frame with its property map.
pub struct Frame {
    body: Body,
    props: Map,
}

impl Frame {
    /// Allocate a video frame, optionally copying properties from another
    /// frame.
    ///
    /// Row strides are at least `align(width * bytes_per_sample, 64)`;
    /// chroma plane dimensions follow the format's subsampling.
    pub(crate) fn new_video(
        format: VideoFormat,
        width: u32,
        height: u32,
        prop_src: Option<&Frame>,
        acc: &Arc<MemoryAccountant>,
    ) -> Result<Frame> {
        Self::check_video_dims(&format, width, height)?;
        let planes = (0..format.num_planes as usize)
            .map(|p| {
                Plane::alloc(
                    width >> format.sub_sampling_w_for(p),
                    height >> format.sub_sampling_h_for(p),
                    format.bytes_per_sample,
                    acc,
                )
            })
            .collect();
        Ok(Frame {
            body: Body::Video {
                format,
                width,
                height,
                planes,
            },
            props: prop_src.map(|f| f.props.clone()).unwrap_or_default(),
        })
    }

    /// Allocate a video frame where some planes are shared with source
    /// frames instead of freshly allocated.
    ///
    /// For each output plane `p`, `sources[p]` may name a `(frame, plane)`
    /// pair to share; `None` allocates. Shared planes must have the exact
    /// dimensions the output plane would have.
    pub(crate) fn new_video_with_planes(
        format: VideoFormat,
        width: u32,
        height: u32,
        sources: &[Option<(&Frame, usize)>],
        prop_src: Option<&Frame>,
        acc: &Arc<MemoryAccountant>,
    ) -> Result<Frame> {
        Self::check_video_dims(&format, width, height)?;
        if sources.len() != format.num_planes as usize {
            return Err(Error::InvalidArgument(format!(
                "expected {} plane sources, got {}",
                format.num_planes,
                sources.len()
            )));
        }
        let mut planes: SmallVec<[Plane; 3]> = SmallVec::new();
        for (p, src) in sources.iter().enumerate() {
            let w = width >> format.sub_sampling_w_for(p);
            let h = height >> format.sub_sampling_h_for(p);
            match src {
                Some((frame, src_plane)) => {
                    let src = frame.video_plane(*src_plane)?;
                    if src.width != w
                        || src.height != h
                        || frame.video_format_ref()?.bytes_per_sample != format.bytes_per_sample
                    {
                        return Err(Error::InvalidArgument(format!(
                            "shared plane {p} has mismatched geometry"
                        )));
                    }
                    planes.push(src.clone());
                }
                None => planes.push(Plane::alloc(w, h, format.bytes_per_sample, acc)),
            }
        }
        Ok(Frame {
            body: Body::Video {
                format,
                width,
                height,
                planes,
            },
            props: prop_src.map(|f| f.props.clone()).unwrap_or_default(),
        })
    }

    /// Allocate an audio frame holding `sample_count` samples per channel.
    pub(crate) fn new_audio(
        format: AudioFormat,
        sample_count: usize,
        prop_src: Option<&Frame>,
        acc: &Arc<MemoryAccountant>,
    ) -> Result<Frame> {
        if sample_count == 0 || sample_count > AUDIO_FRAME_SAMPLES {
            return Err(Error::InvalidArgument(format!(
                "audio frame needs 1..={AUDIO_FRAME_SAMPLES} samples, got {sample_count}"
            )));
        }
        let channels = (0..format.num_channels as usize)
            .map(|_| Plane::alloc_audio(sample_count, format.bytes_per_sample, acc))
            .collect();
        Ok(Frame {
            body: Body::Audio {
                format,
                sample_count,
                channels,
            },
            props: prop_src.map(|f| f.props.clone()).unwrap_or_default(),
        })
    }

    /// Deep-copy a frame, duplicating all planes.
    pub(crate) fn copy_of(src: &Frame, acc: &Arc<MemoryAccountant>) -> Frame {
        let body = match &src.body {
            Body::Video {
                format,
                width,
                height,
                planes,
            } => Body::Video {
                format: *format,
                width: *width,
                height: *height,
                planes: planes
                    .iter()
                    .map(|p| {
                        let mut fresh =
                            Plane::alloc(p.width, p.height, format.bytes_per_sample, acc);
                        Arc::get_mut(&mut fresh.buf)
                            .expect("freshly allocated plane is unique")
                            .data
                            .copy_from_slice(&p.buf.data);
                        fresh.stride = p.stride;
                        fresh
                    })
                    .collect(),
            },
            Body::Audio {
                format,
                sample_count,
                channels,
            } => Body::Audio {
                format: *format,
                sample_count: *sample_count,
                channels: channels
                    .iter()
                    .map(|c| {
                        let mut fresh =
                            Plane::alloc_audio(*sample_count, format.bytes_per_sample, acc);
                        Arc::get_mut(&mut fresh.buf)
                            .expect("freshly allocated plane is unique")
                            .data
                            .copy_from_slice(&c.buf.data);
                        fresh
                    })
                    .collect(),
            },
        };
        Frame {
            body,
            props: src.props.clone(),
        }
    }

    fn check_video_dims(format: &VideoFormat, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(
                "frame dimensions must be positive".into(),
            ));
        }
        if width % (1 << format.sub_sampling_w) != 0 || height % (1 << format.sub_sampling_h) != 0 {
            return Err(Error::InvalidArgument(format!(
                "dimensions {width}x{height} not divisible by subsampling"
            )));
        }
        Ok(())
    }

    fn video_plane(&self, plane: usize) -> Result<&Plane> {
        match &self.body {
            Body::Video { planes, .. } => planes.get(plane).ok_or_else(|| {
                Error::InvalidArgument(format!("plane {plane} out of range"))
            }),
            Body::Audio { .. } => Err(Error::InvalidArgument(
                "video plane access on an audio frame".into(),
            )),
        }
    }

    fn video_format_ref(&self) -> Result<&VideoFormat> {
        match &self.body {
            Body::Video { format, .. } => Ok(format),
            Body::Audio { .. } => Err(Error::InvalidArgument(
                "video format access on an audio frame".into(),
            )),
        }
    }

    /// Whether this is a video frame.
    pub fn is_video(&self) -> bool {
        matches!(self.body, Body::Video { .. })
    }

    /// Whether this is an audio frame.
    pub fn is_audio(&self) -> bool {
        matches!(self.body, Body::Audio { .. })
    }

    /// The video format, if this is a video frame.
    pub fn video_format(&self) -> Option<VideoFormat> {
        match &self.body {
            Body::Video { format, .. } => Some(*format),
            Body::Audio { .. } => None,
        }
    }

    /// The audio format, if this is an audio frame.
    pub fn audio_format(&self) -> Option<AudioFormat> {
        match &self.body {
            Body::Audio { format, .. } => Some(*format),
            Body::Video { .. } => None,
        }
    }

    /// Width in pixels of the given plane (0 for audio frames).
    pub fn width(&self, plane: usize) -> u32 {
        match &self.body {
            Body::Video { planes, .. } => planes.get(plane).map_or(0, |p| p.width),
            Body::Audio { .. } => 0,
        }
    }

    /// Height in rows of the given plane (0 for audio frames).
    pub fn height(&self, plane: usize) -> u32 {
        match &self.body {
            Body::Video { planes, .. } => planes.get(plane).map_or(0, |p| p.height),
            Body::Audio { .. } => 0,
        }
    }

    /// Row stride in bytes of the given plane.
    pub fn stride(&self, plane: usize) -> usize {
        match &self.body {
            Body::Video { planes, .. } => planes.get(plane).map_or(0, |p| p.stride),
            Body::Audio { channels, .. } => channels.get(plane).map_or(0, |c| c.stride),
        }
    }

    /// Read access to a video plane or audio channel buffer.
    ///
    /// # Panics
    ///
    /// Panics if `plane` is out of range for the frame.
    pub fn plane_data(&self, plane: usize) -> &[u8] {
        match &self.body {
            Body::Video { planes, .. } => &planes[plane].buf.data,
            Body::Audio { channels, .. } => &channels[plane].buf.data,
        }
    }

    /// Mutable access to a video plane or audio channel buffer.
    ///
    /// Requires exclusive ownership of the frame (not yet published). A
    /// plane shared with another frame is detached by copying first.
    ///
    /// # Panics
    ///
    /// Panics if `plane` is out of range for the frame.
    pub fn plane_data_mut(&mut self, plane: usize) -> &mut [u8] {
        let p = match &mut self.body {
            Body::Video { planes, .. } => &mut planes[plane],
            Body::Audio { channels, .. } => &mut channels[plane],
        };
        &mut Arc::make_mut(&mut p.buf).data
    }

    /// Number of samples in an audio frame (0 for video frames).
    pub fn sample_count(&self) -> usize {
        match &self.body {
            Body::Audio { sample_count, .. } => *sample_count,
            Body::Video { .. } => 0,
        }
    }

    /// Number of planes (video) or channels (audio).
    pub fn num_planes(&self) -> usize {
        match &self.body {
            Body::Video { planes, .. } => planes.len(),
            Body::Audio { channels, .. } => channels.len(),
        }
    }

    /// The frame's property map.
    pub fn props(&self) -> &Map {
        &self.props
    }

    /// Mutable access to the property map (requires exclusive ownership).
    pub fn props_mut(&mut self) -> &mut Map {
        &mut self.props
    }

    /// Total bytes of plane data, the frame's cache cost.
    pub fn total_bytes(&self) -> usize {
        match &self.body {
            Body::Video { planes, .. } => planes.iter().map(|p| p.buf.data.len()).sum(),
            Body::Audio { channels, .. } => channels.iter().map(|c| c.buf.data.len()).sum(),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Body::Video {
                format,
                width,
                height,
                ..
            } => f
                .debug_struct("VideoFrame")
                .field("family", &format.color_family)
                .field("bits", &format.bits_per_sample)
                .field("width", width)
                .field("height", height)
                .finish(),
            Body::Audio {
                format,
                sample_count,
                ..
            } => f
                .debug_struct("AudioFrame")
                .field("bits", &format.bits_per_sample)
                .field("channels", &format.num_channels)
                .field("samples", sample_count)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleType;

    fn accountant() -> Arc<MemoryAccountant> {
        Arc::new(MemoryAccountant::new(usize::MAX))
    }

    #[test]
    fn test_video_frame_geometry() {
        let acc = accountant();
        let frame = Frame::new_video(VideoFormat::yuv420p8(), 64, 32, None, &acc).unwrap();

        assert_eq!(frame.width(0), 64);
        assert_eq!(frame.height(0), 32);
        assert_eq!(frame.width(1), 32);
        assert_eq!(frame.height(2), 16);
        assert_eq!(frame.stride(0) % FRAME_ALIGN, 0);
        assert!(frame.stride(0) >= 64);
    }

    #[test]
    fn test_memory_accounting() {
        let acc = accountant();
        let frame = Frame::new_video(VideoFormat::gray8(), 16, 16, None, &acc).unwrap();
        let expected = frame.total_bytes();
        assert_eq!(acc.used(), expected);
        drop(frame);
        assert_eq!(acc.used(), 0);
    }

    #[test]
    fn test_plane_sharing_and_detach() {
        let acc = accountant();
        let mut src = Frame::new_video(VideoFormat::gray8(), 16, 16, None, &acc).unwrap();
        src.plane_data_mut(0).fill(7);
        let src = Arc::new(src);

        let shared = Frame::new_video_with_planes(
            VideoFormat::gray8(),
            16,
            16,
            &[Some((src.as_ref(), 0))],
            None,
            &acc,
        )
        .unwrap();
        assert_eq!(shared.plane_data(0)[0], 7);
        // Shared plane is not re-charged.
        assert_eq!(acc.used(), src.total_bytes());

        // Mutation detaches: the source frame keeps its bytes.
        let mut writable = shared;
        writable.plane_data_mut(0).fill(9);
        assert_eq!(src.plane_data(0)[0], 7);
        assert_eq!(writable.plane_data(0)[0], 9);
        assert_eq!(acc.used(), 2 * src.total_bytes());
    }

    #[test]
    fn test_cloned_refs_read_same_bytes() {
        let acc = accountant();
        let mut frame = Frame::new_video(VideoFormat::gray8(), 8, 8, None, &acc).unwrap();
        frame.plane_data_mut(0)[0] = 42;
        let a: FrameRef = Arc::new(frame);
        let b = Arc::clone(&a);
        assert_eq!(a.plane_data(0), b.plane_data(0));
    }

    #[test]
    fn test_audio_frame() {
        let acc = accountant();
        let format = AudioFormat::new(SampleType::Integer, 16, crate::format::channels::STEREO)
            .unwrap();
        let frame = Frame::new_audio(format, 3000, None, &acc).unwrap();
        assert_eq!(frame.sample_count(), 3000);
        assert_eq!(frame.num_planes(), 2);
        assert_eq!(frame.plane_data(0).len(), 6000);
        assert!(Frame::new_audio(format, 0, None, &acc).is_err());
        assert!(Frame::new_audio(format, AUDIO_FRAME_SAMPLES + 1, None, &acc).is_err());
    }

    #[test]
    fn test_copy_frame_is_deep() {
        let acc = accountant();
        let mut original = Frame::new_video(VideoFormat::gray8(), 8, 8, None, &acc).unwrap();
        original.plane_data_mut(0).fill(5);

        let mut copy = Frame::copy_of(&original, &acc);
        copy.plane_data_mut(0).fill(6);
        assert_eq!(original.plane_data(0)[0], 5);
        assert_eq!(copy.plane_data(0)[0], 6);
    }

    #[test]
    fn test_shared_plane_geometry_mismatch() {
        let acc = accountant();
        let src = Frame::new_video(VideoFormat::gray8(), 8, 8, None, &acc).unwrap();
        let err = Frame::new_video_with_planes(
            VideoFormat::gray8(),
            16,
            16,
            &[Some((&src, 0))],
            None,
            &acc,
        );
        assert!(err.is_err());
    }
}
