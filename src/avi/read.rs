//! Serving byte ranges out of the precomputed AVI layout.
//!
//! A read walks the regions of each overlapping segment in file order:
//! header image, frame chunk pairs, pre-index pad, the chunk indices,
//! the legacy index (segment 0), and the post-index pad. Static regions
//! copy out of the precomputed images; frame regions materialize just the
//! overlapping frames through the engine.

use super::layout::{riff_align_up, riff_tag_bytes, FCC_AUD, INDX_POST_PAD_SIZE, INDX_PRE_PAD_SIZE, JUNK, RIFF_TAG_SIZE};
use super::{AviFile, Seg};
use crate::error::{Error, Result};
use crate::format::{ColorFamily, AUDIO_FRAME_SAMPLES};
use crate::frame::FrameRef;

/// Tracks one read: bytes still to skip before the range starts, and the
/// caller's destination buffer.
struct Cursor<'a> {
    skip: u64,
    buf: &'a mut [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Pass over a region of `len` bytes. Returns the offset into the
    /// region where the read starts and the destination slice for the
    /// overlapping part, or `None` when the region lies fully before the
    /// requested range.
    fn region(&mut self, len: u64) -> Option<(u64, &mut [u8])> {
        if self.skip >= len {
            self.skip -= len;
            return None;
        }
        let offset = self.skip;
        self.skip = 0;
        let part = ((len - offset) as usize).min(self.remaining());
        if part == 0 {
            return None;
        }
        let start = self.pos;
        self.pos += part;
        Some((offset, &mut self.buf[start..start + part]))
    }

    /// Copy the overlapping slice of a static byte region.
    fn bytes(&mut self, data: &[u8]) {
        if let Some((offset, dest)) = self.region(data.len() as u64) {
            let at = offset as usize;
            dest.copy_from_slice(&data[at..at + dest.len()]);
        }
    }

    /// Emit the overlapping slice of a zero region.
    fn zeros(&mut self, len: u64) {
        if let Some((_, dest)) = self.region(len) {
            dest.fill(0);
        }
    }
}

impl AviFile {
    /// Fill `buf` with the file bytes at `file_offset`.
    ///
    /// Any `(offset, len)` range inside the file is valid; the engine is
    /// only invoked for frames overlapping the range.
    pub fn read_media(&self, file_offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if file_offset + buf.len() as u64 > self.file_size {
            return Err(Error::InvalidArgument(format!(
                "read of {} bytes at {file_offset} exceeds file size {}",
                buf.len(),
                self.file_size
            )));
        }

        // Locate the segment containing the first requested byte.
        let mut segi = self
            .segs
            .partition_point(|seg| seg.start_offset <= file_offset)
            - 1;
        let mut cursor = Cursor {
            skip: file_offset - self.segs[segi].start_offset,
            buf,
            pos: 0,
        };

        while !cursor.done() && segi < self.segs.len() {
            let seg = &self.segs[segi];

            cursor.bytes(&seg.hdr);
            self.read_seg_frames(seg, &mut cursor)?;

            cursor.bytes(&riff_tag_bytes(JUNK, INDX_PRE_PAD_SIZE - RIFF_TAG_SIZE));
            cursor.zeros((INDX_PRE_PAD_SIZE - RIFF_TAG_SIZE) as u64);

            cursor.bytes(&seg.vid_indx);
            cursor.bytes(&seg.aud_indx);
            cursor.bytes(&seg.old_indx);

            cursor.bytes(&riff_tag_bytes(JUNK, INDX_POST_PAD_SIZE - RIFF_TAG_SIZE));
            cursor.zeros((INDX_POST_PAD_SIZE - RIFF_TAG_SIZE) as u64);

            segi += 1;
        }
        Ok(())
    }

    /// Serve the movi payload of one segment, one frame chunk pair at a
    /// time.
    fn read_seg_frames(&self, seg: &Seg, cursor: &mut Cursor<'_>) -> Result<()> {
        if cursor.skip >= seg.data_size as u64 {
            cursor.skip -= seg.data_size as u64;
            return Ok(());
        }

        // Audio chunk sizes vary, so the per-segment frame index maps the
        // skip offset back to a frame.
        let mut frame = seg
            .frame_indx
            .partition_point(|&offset| offset as u64 <= cursor.skip)
            as u32
            - 1;
        cursor.skip -= seg.frame_indx[frame as usize] as u64;

        while !cursor.done() && frame < seg.frame_count {
            if frame < seg.aud_frame_count {
                let pack = if frame + 1 == seg.aud_frame_count {
                    seg.last_aud_pack as u64 + 1
                } else {
                    1
                };
                let (start_sample, sample_count) =
                    self.locate_frame_samples((seg.start_frame + frame) as u64, pack);
                let aud_data_size = sample_count * self.sample_size;
                let aud_align_size = riff_align_up(aud_data_size) - aud_data_size;

                cursor.bytes(&riff_tag_bytes(FCC_AUD, aud_data_size));
                if let Some((offset, dest)) = cursor.region(aud_data_size as u64) {
                    self.copy_audio(start_sample, offset, dest)?;
                }
                cursor.zeros(aud_align_size as u64);
            }

            if frame < seg.vid_frame_count {
                cursor.bytes(&riff_tag_bytes(self.frame_vid_fcc, self.frame_vid_data_size));
                if let Some((offset, dest)) = cursor.region(self.frame_vid_data_size as u64) {
                    self.copy_video(seg.start_frame + frame, offset, dest)?;
                }
                cursor.zeros(self.frame_vid_align_size as u64);
            }

            frame += 1;
        }
        Ok(())
    }

    /// Copy part of an audio chunk: interleaved samples starting at
    /// `start_sample`, beginning `byte_offset` bytes into the chunk.
    fn copy_audio(&self, start_sample: u64, byte_offset: u64, dest: &mut [u8]) -> Result<()> {
        let sample_size = self.sample_size as usize;
        let mut produced = 0usize;
        let mut sample = start_sample + byte_offset / sample_size as u64;
        let mut within = (byte_offset % sample_size as u64) as usize;

        while produced < dest.len() {
            if within == 0 && dest.len() - produced >= sample_size {
                let count = (dest.len() - produced) / sample_size;
                self.fetch_samples(sample, count, &mut dest[produced..produced + count * sample_size])?;
                produced += count * sample_size;
                sample += count as u64;
            } else {
                // Ragged edge: realign through a one-sample scratch.
                let mut scratch = vec![0u8; sample_size];
                self.fetch_samples(sample, 1, &mut scratch)?;
                let take = (sample_size - within).min(dest.len() - produced);
                dest[produced..produced + take].copy_from_slice(&scratch[within..within + take]);
                produced += take;
                within = 0;
                sample += 1;
            }
        }
        Ok(())
    }

    /// Materialize `count` interleaved samples starting at `start`.
    fn fetch_samples(&self, start: u64, count: usize, dest: &mut [u8]) -> Result<()> {
        let node = self
            .audio
            .as_ref()
            .expect("audio chunks exist only with an audio node");
        let format = node.audio_info().expect("audio node").format;
        let bps = format.bytes_per_sample as usize;
        let channels = format.num_channels as usize;

        let mut sample = start;
        let mut produced = 0usize;
        let mut out = 0usize;
        while produced < count {
            let frame_index = (sample / AUDIO_FRAME_SAMPLES as u64) as usize;
            let within = (sample % AUDIO_FRAME_SAMPLES as u64) as usize;
            let frame = node.get_frame(frame_index)?;
            let take = (frame.sample_count() - within).min(count - produced);
            for s in 0..take {
                for channel in 0..channels {
                    let at = (within + s) * bps;
                    dest[out..out + bps]
                        .copy_from_slice(&frame.plane_data(channel)[at..at + bps]);
                    out += bps;
                }
            }
            produced += take;
            sample += take as u64;
        }
        Ok(())
    }

    /// Copy part of a video frame's packed representation, beginning
    /// `byte_offset` bytes into it.
    fn copy_video(&self, n: u32, byte_offset: u64, dest: &mut [u8]) -> Result<()> {
        let frame = self.video.get_frame(n as usize)?;
        if self.packed_rgb {
            let packed = pack_rgb_dib(&frame);
            let at = byte_offset as usize;
            dest.copy_from_slice(&packed[at..at + dest.len()]);
            return Ok(());
        }

        let format = frame.video_format().expect("video frame");
        let single_plane = format.num_planes == 1;
        // 8-bit YUV FourCCs (YV12 family) store V before U.
        let order: &[usize] = if format.color_family == ColorFamily::Yuv
            && format.bits_per_sample == 8
        {
            &[0, 2, 1]
        } else if single_plane {
            &[0]
        } else {
            &[0, 1, 2]
        };

        let mut offset = byte_offset as usize;
        let mut written = 0usize;
        for &plane in order {
            let align_mask = if single_plane { 3 } else { 0 };
            copy_plane(&frame, plane, align_mask, &mut offset, dest, &mut written);
            if written == dest.len() {
                break;
            }
        }
        debug_assert_eq!(written, dest.len());
        Ok(())
    }
}

/// Copy the overlapping part of one plane's packed rows, flattening the
/// engine's aligned strides into the AVI's row-major layout.
fn copy_plane(
    frame: &FrameRef,
    plane: usize,
    align_mask: usize,
    offset: &mut usize,
    dest: &mut [u8],
    written: &mut usize,
) {
    if *written == dest.len() {
        return;
    }
    let bps = frame
        .video_format()
        .expect("video frame")
        .bytes_per_sample as usize;
    let row_size = (frame.width(plane) as usize * bps + align_mask) & !align_mask;
    let plane_size = row_size * frame.height(plane) as usize;

    if *offset < plane_size {
        let mut size = (plane_size - *offset).min(dest.len() - *written);
        let data = frame.plane_data(plane);
        let stride = frame.stride(plane);
        let mut row = *offset / row_size;
        let mut init_off = *offset % row_size;
        *offset += size;

        while size > 0 {
            let xfer = (row_size - init_off).min(size);
            let at = row * stride + init_off;
            dest[*written..*written + xfer].copy_from_slice(&data[at..at + xfer]);
            *written += xfer;
            size -= xfer;
            row += 1;
            init_off = 0;
        }
    }
    *offset = offset.saturating_sub(plane_size);
}

/// Flatten planar RGB into the bottom-up BGR DIB layout.
fn pack_rgb_dib(frame: &FrameRef) -> Vec<u8> {
    let width = frame.width(0) as usize;
    let height = frame.height(0) as usize;
    let stride = frame.stride(0);
    let row_size = (width * 3 + 3) & !3;
    let mut packed = vec![0u8; row_size * height];

    let r = frame.plane_data(0);
    let g = frame.plane_data(1);
    let b = frame.plane_data(2);
    for out_row in 0..height {
        let src_row = height - 1 - out_row;
        let src_at = src_row * stride;
        let out_at = out_row * row_size;
        for x in 0..width {
            packed[out_at + x * 3] = b[src_at + x];
            packed[out_at + x * 3 + 1] = g[src_at + x];
            packed[out_at + x * 3 + 2] = r[src_at + x];
        }
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_skips_and_copies() {
        let mut buf = [0u8; 4];
        let mut cursor = Cursor {
            skip: 3,
            buf: &mut buf,
            pos: 0,
        };
        // Region fully before the range.
        cursor.bytes(&[1, 2]);
        assert_eq!(cursor.skip, 1);
        // Region straddling the range start.
        cursor.bytes(&[3, 4, 5]);
        assert_eq!(cursor.pos, 2);
        // Region past the range end gets truncated.
        cursor.bytes(&[6, 7, 8, 9]);
        assert!(cursor.done());
        assert_eq!(buf, [4, 5, 6, 7]);
    }

    #[test]
    fn test_cursor_zero_region() {
        let mut buf = [0xFFu8; 3];
        let mut cursor = Cursor {
            skip: 0,
            buf: &mut buf,
            pos: 0,
        };
        cursor.zeros(2);
        cursor.bytes(&[9, 9]);
        assert_eq!(buf, [0, 0, 9]);
    }
}
