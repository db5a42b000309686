//! The AVI v2 muxer: a byte-addressable file image over a video node and
//! an optional audio node.
//!
//! No file is materialized. [`AviFile::new`] precomputes the complete
//! layout — segment table, headers, the three index families, padding —
//! and [`AviFile::read_media`] serves arbitrary byte ranges, invoking the
//! engine only for the frames that fall inside the requested range.
//!
//! The file is a sequence of RIFF segments laid end to end. Segment 0
//! carries the full header list (main header, stream headers, OpenDML
//! extension, super indices) and a legacy `idx1`; continuation segments
//! are bare `RIFF AVIX` envelopes. Within each segment every video frame
//! is interleaved behind its audio chunk, and each segment ends with its
//! own chunk indices framed by junk pads.

mod layout;
mod read;

use crate::error::{Error, Result};
use crate::format::ColorFamily;
use crate::map::Map;
use crate::node::Node;
use bytes::Bytes;
use layout::*;

/// Muxer options, conventionally read from the host's variable bag.
#[derive(Debug, Clone, Default)]
pub struct AviOptions {
    /// Override the video FourCC (and BITMAPINFOHEADER compression).
    pub vid_fcc: Option<[u8; 4]>,
    /// Pack each segment's audio into one chunk instead of interleaving
    /// per video frame.
    pub no_interleave: bool,
    /// Bound segments at 1 GiB instead of 4 GiB for picky readers.
    pub small_segments: bool,
}

impl AviOptions {
    /// Read the `AVFS_AVI_*` options out of a variable bag.
    pub fn from_map(vars: &Map) -> AviOptions {
        let vid_fcc = vars
            .get_data("AVFS_AVI_VidFcc", 0)
            .ok()
            .filter(|data| data.len() >= 4)
            .map(|data| [data[0], data[1], data[2], data[3]]);
        let no_interleave = vars.get_int("AVFS_AVI_NoInterleave", 0).unwrap_or(0) != 0;
        let small_segments = vars.get_int("AVFS_AVI_SmallSegments", 0).unwrap_or(0) != 0;
        AviOptions {
            vid_fcc,
            no_interleave,
            small_segments,
        }
    }
}

/// One RIFF segment's precomputed layout.
#[derive(Debug)]
struct Seg {
    start_offset: u64,
    start_frame: u32,
    vid_frame_count: u32,
    aud_frame_count: u32,
    frame_count: u32,
    last_aud_pack: u32,
    data_size: u32,
    seg_size: u32,
    /// Byte offset of each frame's chunk pair within the movi payload.
    frame_indx: Vec<u32>,
    /// Precomputed header image (`hdr_size` bytes).
    hdr: Bytes,
    /// Precomputed `ix00` image.
    vid_indx: Bytes,
    /// Precomputed `ix01` image (empty without audio).
    aud_indx: Bytes,
    /// Precomputed `idx1` image (segment 0 only).
    old_indx: Bytes,
}

/// A logically contiguous AVI v2 file of precomputed size served by
/// random-access reads.
#[derive(Debug)]
pub struct AviFile {
    video: Node,
    audio: Option<Node>,

    frame_vid_fcc: u32,
    frame_vid_data_size: u32,
    frame_vid_align_size: u32,
    /// Packed bottom-up BGR output (the `DIB ` path).
    packed_rgb: bool,

    vid_frame_count: u32,
    aud_frame_count: u32,
    file_frame_count: u32,
    dur_frame_count: u32,

    sample_size: u32,
    sample_rate: u32,
    first_aud_frame_pack_count: u32,
    file_sample_count: u64,
    fps_num: u64,
    fps_den: u64,

    segs: Vec<Seg>,
    file_size: u64,
}

struct SuperEntry {
    offset: u64,
    size: u32,
    duration: u32,
}

impl AviFile {
    /// Precompute the complete file layout for `video` plus optional
    /// `audio`.
    ///
    /// # Errors
    ///
    /// - the video node has no AVI-representable format
    /// - the audio stream exceeds 2³²−1 samples (32-bit header fields
    ///   cannot index it; refused rather than silently truncated)
    /// - the audio sample format has no PCM/float representation
    pub fn new(video: Node, audio: Option<Node>, options: AviOptions) -> Result<AviFile> {
        let vi = video
            .video_info()
            .ok_or_else(|| Error::InvalidArgument("AVI muxer needs a video node".into()))?;

        let (mut vid_type, mut vid_compress) = video_fourcc(&vi.format).ok_or_else(|| {
            Error::UnsupportedFormat("video format has no AVI representation".into())
        })?;
        if let Some(fcc) = options.vid_fcc {
            vid_type = fourcc(&fcc);
            vid_compress = vid_type;
        }
        let frame_vid_fcc = if vid_type == FCC_DIB {
            FCC_VID_RGB
        } else {
            FCC_VID_COMP
        };

        let vid_frame_count = vi.num_frames as u32;
        let frame_vid_data_size = frame_data_size(&vi.format, vi.width, vi.height);
        if vid_frame_count == 0 || frame_vid_data_size == 0 {
            return Err(Error::InvalidArgument("video stream is empty".into()));
        }
        let frame_vid_align_size = riff_align_up(frame_vid_data_size) - frame_vid_data_size;

        let mut file = AviFile {
            video,
            audio: None,
            frame_vid_fcc,
            frame_vid_data_size,
            frame_vid_align_size,
            packed_rgb: vi.format.color_family == ColorFamily::Rgb,
            vid_frame_count,
            aud_frame_count: 0,
            file_frame_count: vid_frame_count,
            dur_frame_count: vid_frame_count,
            sample_size: 0,
            sample_rate: 0,
            first_aud_frame_pack_count: 0,
            file_sample_count: 0,
            fps_num: vi.fps_num,
            fps_den: vi.fps_den,
            segs: Vec::new(),
            file_size: 0,
        };

        if let Some(audio) = audio {
            let ai = audio
                .audio_info()
                .ok_or_else(|| Error::InvalidArgument("audio leg must be an audio node".into()))?;
            if ai.format.bits_per_sample == 24 {
                return Err(Error::UnsupportedFormat(
                    "24-bit audio has no packed AVI representation here".into(),
                ));
            }
            if ai.num_samples > u32::MAX as u64 {
                return Err(Error::InvalidArgument(
                    "audio stream exceeds 2^32-1 samples, which 32-bit AVI headers cannot index"
                        .into(),
                ));
            }
            file.sample_size = ai.format.bytes_per_sample * ai.format.num_channels;
            file.sample_rate = ai.sample_rate;
            file.file_sample_count = ai.num_samples;
            file.audio = Some(audio);

            // Frames needed to represent the audio stream (ceiling).
            let mut aud_frames = file
                .frames_from_samples(file.file_sample_count + file.samples_from_frames(1) - 1)
                as u32;
            if aud_frames == 0 {
                aud_frames = 1;
            }
            file.aud_frame_count = aud_frames;
            if file.dur_frame_count < aud_frames {
                file.dur_frame_count = aud_frames;
            }

            if !options.no_interleave {
                // Preload an extra half second of samples into frame 0.
                file.first_aud_frame_pack_count =
                    ((file.fps_num + file.fps_den - 1) / (2 * file.fps_den)) as u32;
                while file.aud_frame_count > 0
                    && file.frame_sample_count(file.aud_frame_count as u64 - 1) == 0
                {
                    file.aud_frame_count -= 1;
                }
            }
            if file.aud_frame_count > file.file_frame_count {
                file.file_frame_count = file.aud_frame_count;
            }
        }

        file.build_segments(&options, vid_type, vid_compress)?;
        Ok(file)
    }

    /// Total size of the logical file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Samples covered by the first `frames` video frame durations.
    fn samples_from_frames(&self, frames: u64) -> u64 {
        (frames as u128 * self.sample_rate as u128 * self.fps_den as u128 / self.fps_num as u128)
            as u64
    }

    /// Video frame durations covered by `samples`.
    fn frames_from_samples(&self, samples: u64) -> u64 {
        (samples as u128 * self.fps_num as u128
            / (self.sample_rate as u128 * self.fps_den as u128)) as u64
    }

    /// Starting sample and sample count of the audio chunk(s) for
    /// `frame_count` frames beginning at `frame`, accounting for the
    /// frame-0 preload shift.
    fn locate_frame_samples(&self, frame: u64, frame_count: u64) -> (u64, u32) {
        let mut start_frame = frame;
        let mut end_frame = frame + frame_count;
        if start_frame != 0 {
            start_frame += self.first_aud_frame_pack_count as u64;
        }
        if end_frame != 0 {
            end_frame += self.first_aud_frame_pack_count as u64;
        }
        let mut start_sample = 0;
        let mut end_sample = 0;
        if self.file_sample_count != 0 {
            start_sample = self
                .samples_from_frames(start_frame)
                .min(self.file_sample_count);
            end_sample = self
                .samples_from_frames(end_frame)
                .min(self.file_sample_count);
        }
        (start_sample, (end_sample - start_sample) as u32)
    }

    fn frame_sample_count(&self, frame: u64) -> u32 {
        self.locate_frame_samples(frame, 1).1
    }

    fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    fn build_segments(
        &mut self,
        options: &AviOptions,
        vid_type: u32,
        vid_compress: u32,
    ) -> Result<()> {
        let max_frame_aud_data_size = if self.has_audio() {
            riff_align_up((self.samples_from_frames(1) as u32 + 1) * self.sample_size)
        } else {
            0
        };

        // Largest frame count fitting a segment under the size bound,
        // assuming worst-case audio chunks.
        let per_frame_cost = RIFF_TAG_SIZE
            + max_frame_aud_data_size
            + RIFF_TAG_SIZE
            + self.frame_vid_data_size
            + self.frame_vid_align_size
            + INDX_ENTRY_SIZE * 2
            + OLD_INDX_ENTRY_SIZE * 2;
        let budget = |data_lst: u32| {
            (data_lst
                - self.first_aud_frame_pack_count * max_frame_aud_data_size
                - INDX_PRE_PAD_SIZE
                - INDX_POST_PAD_SIZE)
                / per_frame_cost
        };

        let mut max_seg_frame_count = budget(MAX_4GB_DATA_LST_SIZE);
        if max_seg_frame_count == 0 {
            return Err(Error::InvalidArgument(
                "frames too large for a single AVI segment".into(),
            ));
        }
        let mut file_seg_count = self.file_frame_count.div_ceil(max_seg_frame_count);
        if options.small_segments {
            max_seg_frame_count = budget(MAX_DATA_LST_SIZE);
            if max_seg_frame_count == 0 {
                return Err(Error::InvalidArgument(
                    "frames too large for a single AVI segment".into(),
                ));
            }
            file_seg_count = self.file_frame_count.div_ceil(max_seg_frame_count);
        }
        if file_seg_count > MAX_SUPER_INDX_ENTRIES {
            return Err(Error::InvalidArgument(format!(
                "stream needs {file_seg_count} segments, the super index holds at most {MAX_SUPER_INDX_ENTRIES}"
            )));
        }

        // Pass 1: per-segment geometry, frame index, and chunk indices.
        let mut vid_super: Vec<SuperEntry> = Vec::with_capacity(file_seg_count as usize);
        let mut aud_super: Vec<SuperEntry> = Vec::with_capacity(file_seg_count as usize);
        let mut file_size = 0u64;
        let mut seg_start_frame = 0u32;

        for segi in 0..file_seg_count {
            let seg_frame_count = (self.file_frame_count - seg_start_frame).min(max_seg_frame_count);
            let seg_vid_frame_count = self
                .vid_frame_count
                .saturating_sub(seg_start_frame)
                .min(seg_frame_count);
            let mut seg_aud_frame_count = self
                .aud_frame_count
                .saturating_sub(seg_start_frame)
                .min(seg_frame_count);
            let mut seg_last_aud_pack = 0u32;
            if options.no_interleave && seg_aud_frame_count > 0 {
                seg_last_aud_pack = seg_aud_frame_count - 1;
                seg_aud_frame_count = 1;
            }

            let hdr_size = if segi == 0 { SEG0_HDR_SIZE } else { SEGN_HDR_SIZE };
            let vid_indx_size = INDX_HDR_SIZE + seg_vid_frame_count * INDX_ENTRY_SIZE;
            let aud_indx_size = if self.has_audio() {
                INDX_HDR_SIZE + seg_aud_frame_count * INDX_ENTRY_SIZE
            } else {
                0
            };
            let old_indx_size = if segi == 0 {
                RIFF_TAG_SIZE + (seg_vid_frame_count + seg_aud_frame_count) * OLD_INDX_ENTRY_SIZE
            } else {
                0
            };

            let mut frame_indx = Vec::with_capacity(seg_frame_count as usize);
            let mut vid_entries: Vec<(u32, u32)> = Vec::new();
            let mut aud_entries: Vec<(u32, u32)> = Vec::new();
            let mut old_entries: Vec<(u32, u32, u32)> = Vec::new();
            let mut data_size = 0u32;

            for seg_frame in 0..seg_frame_count {
                frame_indx.push(data_size);

                if seg_frame < seg_aud_frame_count {
                    let pack = if seg_frame + 1 == seg_aud_frame_count {
                        seg_last_aud_pack as u64 + 1
                    } else {
                        1
                    };
                    let (_, sample_count) =
                        self.locate_frame_samples((seg_start_frame + seg_frame) as u64, pack);
                    debug_assert!(sample_count > 0);
                    let aud_data_size = sample_count * self.sample_size;
                    aud_entries.push((hdr_size + data_size + RIFF_TAG_SIZE, aud_data_size));
                    if segi == 0 {
                        old_entries.push((FCC_AUD, hdr_size + data_size, aud_data_size));
                    }
                    data_size += RIFF_TAG_SIZE + riff_align_up(aud_data_size);
                }

                if seg_frame < seg_vid_frame_count {
                    vid_entries.push((hdr_size + data_size + RIFF_TAG_SIZE, self.frame_vid_data_size));
                    if segi == 0 {
                        old_entries.push((
                            self.frame_vid_fcc,
                            hdr_size + data_size,
                            self.frame_vid_data_size,
                        ));
                    }
                    data_size +=
                        RIFF_TAG_SIZE + self.frame_vid_data_size + self.frame_vid_align_size;
                }
            }

            let mut seg_size = hdr_size + data_size + INDX_PRE_PAD_SIZE;

            let vid_indx = build_chunk_index(
                FCC_VID_INDX,
                self.frame_vid_fcc,
                file_size,
                &vid_entries,
                vid_indx_size,
            );
            vid_super.push(SuperEntry {
                offset: file_size + seg_size as u64,
                size: INDX_HDR_SIZE + INDX_ENTRY_SIZE * seg_frame_count,
                duration: seg_vid_frame_count,
            });
            seg_size += vid_indx_size;

            let aud_indx = if self.has_audio() {
                let (_, seg_samples) = self.locate_frame_samples(
                    seg_start_frame as u64,
                    (seg_aud_frame_count + seg_last_aud_pack) as u64,
                );
                let image = build_chunk_index(
                    FCC_AUD_INDX,
                    FCC_AUD,
                    file_size,
                    &aud_entries,
                    aud_indx_size,
                );
                aud_super.push(SuperEntry {
                    offset: file_size + seg_size as u64,
                    size: INDX_HDR_SIZE + INDX_ENTRY_SIZE * seg_frame_count,
                    duration: seg_samples,
                });
                seg_size += aud_indx_size;
                image
            } else {
                Bytes::new()
            };

            let old_indx = if segi == 0 {
                build_old_index(&old_entries, old_indx_size)
            } else {
                Bytes::new()
            };
            seg_size += old_indx_size;
            seg_size += INDX_POST_PAD_SIZE;

            debug_assert_eq!(riff_align_up(seg_size), seg_size);
            debug_assert!(seg_size <= MAX_4GB_SEG_SIZE);

            self.segs.push(Seg {
                start_offset: file_size,
                start_frame: seg_start_frame,
                vid_frame_count: seg_vid_frame_count,
                aud_frame_count: seg_aud_frame_count,
                frame_count: seg_frame_count,
                last_aud_pack: seg_last_aud_pack,
                data_size,
                seg_size,
                frame_indx,
                hdr: Bytes::new(),
                vid_indx,
                aud_indx,
                old_indx,
            });
            file_size += seg_size as u64;
            seg_start_frame += seg_frame_count;
        }
        debug_assert_eq!(seg_start_frame, self.file_frame_count);
        self.file_size = file_size;

        // Pass 2: header images, now that every segment offset is known.
        for segi in 0..self.segs.len() {
            let hdr = if segi == 0 {
                self.build_seg0_header(vid_type, vid_compress, &vid_super, &aud_super)
            } else {
                self.build_segn_header(&self.segs[segi])
            };
            self.segs[segi].hdr = hdr;
        }
        Ok(())
    }

    fn movi_list_cb(&self, seg: &Seg) -> u32 {
        // The movi list covers its type FourCC, the payload, the
        // pre-index pad, and both chunk indices; the legacy index and the
        // post pad sit outside it.
        4 + seg.data_size
            + INDX_PRE_PAD_SIZE
            + seg.vid_indx.len() as u32
            + seg.aud_indx.len() as u32
    }

    fn build_seg0_header(
        &self,
        vid_type: u32,
        vid_compress: u32,
        vid_super: &[SuperEntry],
        aud_super: &[SuperEntry],
    ) -> Bytes {
        let seg = &self.segs[0];
        let vi = self.video.video_info().expect("checked video node");
        let audio_format = self.audio.as_ref().map(|n| {
            n.audio_info().expect("checked audio node").format
        });
        let seg_count = self.segs.len() as u32;
        let seg_dur_frame_count = if seg_count == 1 {
            self.dur_frame_count
        } else {
            seg.frame_count
        };

        let mut slab = Slab::with_capacity(SEG0_HDR_SIZE as usize);
        slab.list(RIFF, seg.seg_size - RIFF_TAG_SIZE, FCC_AVI);
        slab.list(LIST, HDR_LST_SIZE - RIFF_TAG_SIZE, FCC_HDRL);

        // AVIMAINHEADER
        slab.tag(FCC_AVIH, MAIN_HDR_SIZE - RIFF_TAG_SIZE);
        let micro_sec_per_frame =
            ((1_000_000u64 * self.fps_den + self.fps_num / 2) / self.fps_num) as u32;
        slab.u32(micro_sec_per_frame);
        slab.u32(0); // dwMaxBytesPerSec, patched below
        slab.u32(0); // dwPaddingGranularity
        slab.u32(AVIF_HASINDEX | AVIF_ISINTERLEAVED);
        slab.u32(seg_dur_frame_count);
        slab.u32(0); // dwInitialFrames
        slab.u32(1 + self.has_audio() as u32);
        slab.u32(0); // dwSuggestedBufferSize
        slab.u32(vi.width);
        slab.u32(vi.height);
        slab.zeros(16);

        // Video stream list
        slab.list(LIST, VID_HDR_LST_SIZE - RIFF_TAG_SIZE, FCC_STRL);
        slab.tag(FCC_STRH, STR_HDR_SIZE - RIFF_TAG_SIZE);
        slab.u32(FCC_VIDS);
        slab.u32(vid_type);
        slab.u32(0); // dwFlags
        slab.u16(0); // wPriority
        slab.u16(0); // wLanguage
        slab.u32(0); // dwInitialFrames
        slab.u32(self.fps_den as u32);
        slab.u32(self.fps_num as u32);
        slab.u32(0); // dwStart
        slab.u32(self.vid_frame_count);
        slab.u32(self.frame_vid_data_size);
        slab.u32(0xFFFF_FFFF); // dwQuality
        slab.u32(0); // dwSampleSize
        slab.i16(0);
        slab.i16(0);
        slab.i16(vi.width as i16);
        slab.i16(vi.height as i16);

        // BITMAPINFOHEADER
        slab.tag(FCC_STRF, VID_FRMT_SIZE - RIFF_TAG_SIZE);
        slab.u32(VID_FRMT_SIZE - RIFF_TAG_SIZE); // biSize
        slab.i32(vi.width as i32);
        slab.i32(vi.height as i32);
        slab.u16(1); // biPlanes
        slab.u16(bits_per_pixel(&vi.format));
        slab.u32(vid_compress);
        slab.u32(self.frame_vid_data_size);
        slab.i32(0);
        slab.i32(0);
        slab.u32(0);
        slab.u32(0);

        // Video super index
        write_super_index(&mut slab, self.frame_vid_fcc, seg_count, vid_super);

        // Audio stream list, emitted as JUNK when there is no audio.
        let aud_list_fcc = if self.has_audio() { LIST } else { JUNK };
        slab.list(aud_list_fcc, AUD_HDR_LST_SIZE - RIFF_TAG_SIZE, FCC_STRL);
        slab.tag(FCC_STRH, STR_HDR_SIZE - RIFF_TAG_SIZE);
        slab.u32(FCC_AUDS);
        slab.u32(0); // fccHandler
        slab.u32(0); // dwFlags
        slab.u16(0);
        slab.u16(0);
        slab.u32(1); // dwInitialFrames (audio preload)
        slab.u32(self.sample_size);
        slab.u32(self.sample_rate * self.sample_size);
        slab.u32(0); // dwStart
        slab.u32(self.file_sample_count as u32);
        slab.u32((self.locate_frame_samples(1, 1).0 as u32 + 1) * self.sample_size);
        slab.u32(0xFFFF_FFFF); // dwQuality
        slab.u32(self.sample_size);
        slab.i16(0);
        slab.i16(0);
        slab.i16(0);
        slab.i16(0);

        slab.tag(FCC_STRF, AUD_FRMT_SIZE - RIFF_TAG_SIZE);
        write_wave_format_extensible(&mut slab, audio_format.as_ref(), self.sample_rate);

        // Audio super index
        write_super_index(&mut slab, FCC_AUD, seg_count, aud_super);

        // OpenDML extension
        slab.list(LIST, EXT_HDR_LST_SIZE - RIFF_TAG_SIZE, FCC_ODML);
        slab.tag(FCC_DMLH, EXT_HDR_SIZE - RIFF_TAG_SIZE);
        slab.u32(self.dur_frame_count);
        slab.zeros(244);

        // Header junk pad
        slab.tag(JUNK, HDR_JUNK_SIZE - RIFF_TAG_SIZE);
        slab.zeros((HDR_JUNK_SIZE - RIFF_TAG_SIZE) as usize);

        // movi list
        slab.list(LIST, self.movi_list_cb(seg), FCC_MOVI);
        debug_assert_eq!(slab.len(), SEG0_HDR_SIZE as usize);

        // Patch dwMaxBytesPerSec now that the file size is known.
        let mut duration =
            (self.dur_frame_count as u64 * self.fps_den + self.fps_num / 2) / self.fps_num;
        duration += (duration == 0) as u64;
        slab.patch_u32(MAX_BYTES_PER_SEC_OFFSET, (self.file_size / duration) as u32);

        slab.into_bytes()
    }

    fn build_segn_header(&self, seg: &Seg) -> Bytes {
        let mut slab = Slab::with_capacity(SEGN_HDR_SIZE as usize);
        slab.list(RIFF, seg.seg_size - RIFF_TAG_SIZE, FCC_AVIX);
        slab.list(LIST, self.movi_list_cb(seg), FCC_MOVI);
        debug_assert_eq!(slab.len(), SEGN_HDR_SIZE as usize);
        slab.into_bytes()
    }
}

/// Build one `ix00`/`ix01` standard index image: 32-byte header plus
/// 8-byte `{dwOffset, dwSize}` entries relative to the segment start.
fn build_chunk_index(
    index_fcc: u32,
    chunk_id: u32,
    base_offset: u64,
    entries: &[(u32, u32)],
    total_size: u32,
) -> Bytes {
    let mut slab = Slab::with_capacity(total_size as usize);
    slab.tag(index_fcc, total_size - RIFF_TAG_SIZE);
    slab.u16((INDX_ENTRY_SIZE / 4) as u16); // wLongsPerEntry
    slab.u8(0); // bIndexSubType
    slab.u8(AVI_INDEX_OF_CHUNKS);
    slab.u32(entries.len() as u32);
    slab.u32(chunk_id);
    slab.u32(base_offset as u32);
    slab.u32((base_offset >> 32) as u32);
    slab.zeros(4);
    for &(offset, size) in entries {
        slab.u32(offset);
        slab.u32(size);
    }
    debug_assert_eq!(slab.len(), total_size as usize);
    slab.into_bytes()
}

/// Build the segment-0 legacy `idx1` image. Offsets are relative to the
/// start of segment 0 and every chunk is keyframe-flagged.
fn build_old_index(entries: &[(u32, u32, u32)], total_size: u32) -> Bytes {
    let mut slab = Slab::with_capacity(total_size as usize);
    slab.tag(FCC_IDX1, total_size - RIFF_TAG_SIZE);
    for &(chunk_id, offset, size) in entries {
        slab.u32(chunk_id);
        slab.u32(AVIIF_KEYFRAME);
        slab.u32(offset);
        slab.u32(size);
    }
    debug_assert_eq!(slab.len(), total_size as usize);
    slab.into_bytes()
}

/// Write one stream's super index: `indx` of type `AVI_INDEX_OF_INDEXES`
/// with a fixed 5000-entry table, one live entry per segment.
fn write_super_index(slab: &mut Slab, chunk_id: u32, seg_count: u32, entries: &[SuperEntry]) {
    slab.tag(FCC_INDX, SUPER_INDX_SIZE - RIFF_TAG_SIZE);
    slab.u16((SUPER_INDX_ENTRY_SIZE / 4) as u16);
    slab.u8(0); // bIndexSubType
    slab.u8(AVI_INDEX_OF_INDEXES);
    slab.u32(seg_count);
    slab.u32(chunk_id);
    slab.u32(0); // qwBaseOffset low
    slab.u32(0); // qwBaseOffset high
    slab.zeros(4);
    for entry in entries {
        slab.u32(entry.offset as u32);
        slab.u32((entry.offset >> 32) as u32);
        slab.u32(entry.size);
        slab.u32(entry.duration);
    }
    slab.zeros(((MAX_SUPER_INDX_ENTRIES - entries.len() as u32) * SUPER_INDX_ENTRY_SIZE) as usize);
}
