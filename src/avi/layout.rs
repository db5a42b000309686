//! AVI v2 byte-layout constants and builders.
//!
//! The on-disk structures are fixed-size little-endian records. Instead of
//! interior pointers into packed structs, headers and indices are emitted
//! into byte slabs by explicit writers; every size below is a fixed
//! constant independent of host alignment.

use crate::format::{AudioFormat, ColorFamily, SampleType, VideoFormat};
use bytes::BufMut;

/// Build a FourCC from its ASCII spelling.
pub(crate) const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

pub(crate) const RIFF: u32 = fourcc(b"RIFF");
pub(crate) const LIST: u32 = fourcc(b"LIST");
pub(crate) const JUNK: u32 = fourcc(b"JUNK");

pub(crate) const FCC_AVI: u32 = fourcc(b"AVI ");
pub(crate) const FCC_AVIX: u32 = fourcc(b"AVIX");
pub(crate) const FCC_HDRL: u32 = fourcc(b"hdrl");
pub(crate) const FCC_MOVI: u32 = fourcc(b"movi");
pub(crate) const FCC_AVIH: u32 = fourcc(b"avih");
pub(crate) const FCC_STRL: u32 = fourcc(b"strl");
pub(crate) const FCC_STRH: u32 = fourcc(b"strh");
pub(crate) const FCC_STRF: u32 = fourcc(b"strf");
pub(crate) const FCC_VIDS: u32 = fourcc(b"vids");
pub(crate) const FCC_AUDS: u32 = fourcc(b"auds");
pub(crate) const FCC_INDX: u32 = fourcc(b"indx");
pub(crate) const FCC_ODML: u32 = fourcc(b"odml");
pub(crate) const FCC_DMLH: u32 = fourcc(b"dmlh");
pub(crate) const FCC_IDX1: u32 = fourcc(b"idx1");
pub(crate) const FCC_VID_RGB: u32 = fourcc(b"00db");
pub(crate) const FCC_VID_COMP: u32 = fourcc(b"00dc");
pub(crate) const FCC_AUD: u32 = fourcc(b"01wb");
pub(crate) const FCC_VID_INDX: u32 = fourcc(b"ix00");
pub(crate) const FCC_AUD_INDX: u32 = fourcc(b"ix01");
pub(crate) const FCC_DIB: u32 = fourcc(b"DIB ");

pub(crate) const AVI_INDEX_OF_INDEXES: u8 = 0x00;
pub(crate) const AVI_INDEX_OF_CHUNKS: u8 = 0x01;
pub(crate) const AVIF_HASINDEX: u32 = 0x0000_0010;
pub(crate) const AVIF_ISINTERLEAVED: u32 = 0x0000_0100;
pub(crate) const AVIIF_KEYFRAME: u32 = 0x0000_0010;

/// 16-bit RIFF alignment.
pub(crate) const fn riff_align_up(size: u32) -> u32 {
    (size + 1) & !1
}

pub(crate) const RIFF_TAG_SIZE: u32 = 8;
pub(crate) const RIFF_LST_SIZE: u32 = 12;
pub(crate) const MAIN_HDR_SIZE: u32 = 64;
pub(crate) const STR_HDR_SIZE: u32 = 64;
pub(crate) const VID_FRMT_SIZE: u32 = 48;
/// 'strf' chunk carrying a WAVEFORMATEXTENSIBLE (8 + 40 bytes).
pub(crate) const AUD_FRMT_SIZE: u32 = 48;
pub(crate) const INDX_HDR_SIZE: u32 = 32;
pub(crate) const SUPER_INDX_ENTRY_SIZE: u32 = 16;
pub(crate) const INDX_ENTRY_SIZE: u32 = 8;
pub(crate) const OLD_INDX_ENTRY_SIZE: u32 = 16;
/// Upper bound on segment count, sized into the super index.
pub(crate) const MAX_SUPER_INDX_ENTRIES: u32 = 5000;
pub(crate) const SUPER_INDX_SIZE: u32 =
    INDX_HDR_SIZE + MAX_SUPER_INDX_ENTRIES * SUPER_INDX_ENTRY_SIZE;
pub(crate) const VID_HDR_LST_SIZE: u32 =
    RIFF_LST_SIZE + STR_HDR_SIZE + VID_FRMT_SIZE + SUPER_INDX_SIZE;
pub(crate) const AUD_HDR_LST_SIZE: u32 =
    RIFF_LST_SIZE + STR_HDR_SIZE + AUD_FRMT_SIZE + SUPER_INDX_SIZE;
pub(crate) const EXT_HDR_SIZE: u32 = RIFF_TAG_SIZE + 4 + 244;
pub(crate) const EXT_HDR_LST_SIZE: u32 = RIFF_LST_SIZE + EXT_HDR_SIZE;
pub(crate) const HDR_JUNK_SIZE: u32 = INDX_HDR_SIZE + 10 * 1024;
pub(crate) const HDR_LST_SIZE: u32 = RIFF_LST_SIZE
    + MAIN_HDR_SIZE
    + VID_HDR_LST_SIZE
    + AUD_HDR_LST_SIZE
    + EXT_HDR_LST_SIZE
    + HDR_JUNK_SIZE;
/// Bytes from segment 0's start to the first byte of movi payload.
pub(crate) const SEG0_HDR_SIZE: u32 = RIFF_LST_SIZE + HDR_LST_SIZE + RIFF_LST_SIZE;
/// Bytes from a continuation segment's start to its movi payload.
pub(crate) const SEGN_HDR_SIZE: u32 = RIFF_LST_SIZE + RIFF_LST_SIZE;

/// Junk pads keeping cache-block aligned index reads clear of frame data.
pub(crate) const INDX_PRE_PAD_SIZE: u32 = 0x20000;
pub(crate) const INDX_POST_PAD_SIZE: u32 = 0x20000;

pub(crate) const MAX_SEG_SIZE: u32 = 0x3FFF_FFFE;
pub(crate) const MAX_4GB_SEG_SIZE: u32 = 0xFFFF_FFFE;
/// Max movi payload for 1 GiB segments.
pub(crate) const MAX_DATA_LST_SIZE: u32 = MAX_SEG_SIZE - SEG0_HDR_SIZE - RIFF_TAG_SIZE;
/// Max movi payload for 4 GiB segments.
pub(crate) const MAX_4GB_DATA_LST_SIZE: u32 = MAX_4GB_SEG_SIZE - SEG0_HDR_SIZE - RIFF_TAG_SIZE;

/// Byte offset of `dwMaxBytesPerSec` within segment 0's header image,
/// patched after the total file size is known.
pub(crate) const MAX_BYTES_PER_SEC_OFFSET: usize =
    (RIFF_LST_SIZE + RIFF_LST_SIZE + RIFF_TAG_SIZE + 4) as usize;

/// Little-endian slab writer for header and index images.
pub(crate) struct Slab {
    data: Vec<u8>,
}

impl Slab {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    pub(crate) fn u16(&mut self, value: u16) {
        self.data.put_u16_le(value);
    }

    pub(crate) fn i16(&mut self, value: i16) {
        self.data.put_i16_le(value);
    }

    pub(crate) fn u32(&mut self, value: u32) {
        self.data.put_u32_le(value);
    }

    pub(crate) fn i32(&mut self, value: i32) {
        self.data.put_i32_le(value);
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    pub(crate) fn zeros(&mut self, count: usize) {
        self.data.put_bytes(0, count);
    }

    /// Emit a RIFF chunk tag: FourCC plus payload size.
    pub(crate) fn tag(&mut self, fcc: u32, cb: u32) {
        self.u32(fcc);
        self.u32(cb);
    }

    /// Emit a RIFF list header: tag plus the list-type FourCC.
    pub(crate) fn list(&mut self, fcc: u32, cb: u32, list_type: u32) {
        self.tag(fcc, cb);
        self.u32(list_type);
    }

    pub(crate) fn patch_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn into_bytes(self) -> bytes::Bytes {
        bytes::Bytes::from(self.data)
    }
}

/// Write the 8-byte data chunk tag used inline in the movi payload.
pub(crate) fn riff_tag_bytes(fcc: u32, cb: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&fcc.to_le_bytes());
    out[4..].copy_from_slice(&cb.to_le_bytes());
    out
}

/// FourCC and BITMAPINFOHEADER compression for a video format, or `None`
/// when the format has no AVI representation.
pub(crate) fn video_fourcc(format: &VideoFormat) -> Option<(u32, u32)> {
    if format.sample_type != SampleType::Integer {
        return None;
    }
    let fcc = match (format.color_family, format.bits_per_sample) {
        (ColorFamily::Rgb, 8) => FCC_DIB,
        (ColorFamily::Gray, 8) => fourcc(b"Y800"),
        (ColorFamily::Gray, 16) => fourcc(b"Y16 "),
        (ColorFamily::Yuv, 8) => match (format.sub_sampling_w, format.sub_sampling_h) {
            (1, 1) => fourcc(b"YV12"),
            (1, 0) => fourcc(b"YV16"),
            (0, 0) => fourcc(b"YV24"),
            _ => return None,
        },
        _ => return None,
    };
    let compression = if fcc == FCC_DIB { 0 } else { fcc };
    Some((fcc, compression))
}

/// Bits per pixel as reported in the video stream format chunk.
pub(crate) fn bits_per_pixel(format: &VideoFormat) -> u16 {
    let bits = format.bits_per_sample;
    let value = match format.color_family {
        ColorFamily::Gray => bits,
        ColorFamily::Rgb => 3 * bits,
        ColorFamily::Yuv => bits + ((2 * bits) >> (format.sub_sampling_w + format.sub_sampling_h)),
    };
    value as u16
}

/// Byte size of one frame in the AVI's packed layout.
///
/// Single-plane and packed-RGB rows are DIB-aligned to 4 bytes; planar
/// multi-plane formats are tightly packed per plane.
pub(crate) fn frame_data_size(format: &VideoFormat, width: u32, height: u32) -> u32 {
    let bps = format.bytes_per_sample;
    if format.color_family == ColorFamily::Rgb {
        let row = (width * 3 * bps + 3) & !3;
        return row * height;
    }
    if format.num_planes == 1 {
        let row = (width * bps + 3) & !3;
        return row * height;
    }
    let mut total = 0;
    for plane in 0..format.num_planes as usize {
        let w = width >> format.sub_sampling_w_for(plane);
        let h = height >> format.sub_sampling_h_for(plane);
        total += w * bps * h;
    }
    total
}

/// Emit a 40-byte WAVEFORMATEXTENSIBLE for PCM or IEEE float audio.
pub(crate) fn write_wave_format_extensible(
    slab: &mut Slab,
    format: Option<&AudioFormat>,
    sample_rate: u32,
) {
    const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;
    const KSDATAFORMAT_SUBTYPE_PCM: [u8; 16] = [
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B,
        0x71,
    ];
    const KSDATAFORMAT_SUBTYPE_IEEE_FLOAT: [u8; 16] = [
        0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B,
        0x71,
    ];

    let Some(format) = format else {
        slab.zeros(40);
        return;
    };
    let channels = format.num_channels as u16;
    let block_align = (format.bytes_per_sample * format.num_channels) as u16;
    slab.u16(WAVE_FORMAT_EXTENSIBLE);
    slab.u16(channels);
    slab.u32(sample_rate);
    slab.u32(sample_rate * block_align as u32);
    slab.u16(block_align);
    slab.u16((format.bytes_per_sample * 8) as u16);
    slab.u16(22); // cbSize
    slab.u16(format.bits_per_sample as u16);
    slab.u32(format.channel_layout as u32);
    if format.sample_type == SampleType::Float {
        slab.bytes(&KSDATAFORMAT_SUBTYPE_IEEE_FLOAT);
    } else {
        slab.bytes(&KSDATAFORMAT_SUBTYPE_PCM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(SUPER_INDX_SIZE, 80_032);
        assert_eq!(VID_HDR_LST_SIZE, 80_156);
        assert_eq!(HDR_LST_SIZE, 170_928);
        assert_eq!(SEG0_HDR_SIZE, 170_952);
        assert_eq!(SEGN_HDR_SIZE, 24);
    }

    #[test]
    fn test_riff_align() {
        assert_eq!(riff_align_up(0), 0);
        assert_eq!(riff_align_up(1), 2);
        assert_eq!(riff_align_up(2), 2);
        assert_eq!(riff_align_up(7), 8);
    }

    #[test]
    fn test_frame_data_size() {
        // 4:2:0 planar: luma + two quarter chroma planes.
        assert_eq!(frame_data_size(&VideoFormat::yuv420p8(), 64, 48), 64 * 48 * 3 / 2);
        // Gray rows align to 4 bytes.
        assert_eq!(frame_data_size(&VideoFormat::gray8(), 6, 2), 8 * 2);
        // Packed RGB rows align to 4 bytes.
        assert_eq!(frame_data_size(&VideoFormat::rgb24(), 2, 2), 8 * 2);
    }

    #[test]
    fn test_video_fourcc() {
        assert_eq!(
            video_fourcc(&VideoFormat::yuv420p8()),
            Some((fourcc(b"YV12"), fourcc(b"YV12")))
        );
        assert_eq!(video_fourcc(&VideoFormat::rgb24()), Some((FCC_DIB, 0)));
        assert!(video_fourcc(
            &VideoFormat::new(ColorFamily::Yuv, SampleType::Integer, 10, 1, 1).unwrap()
        )
        .is_none());
    }

    #[test]
    fn test_wave_format_extensible_layout() {
        let mut slab = Slab::with_capacity(40);
        write_wave_format_extensible(&mut slab, Some(&AudioFormat::stereo16()), 48_000);
        let bytes = slab.into_bytes();
        assert_eq!(bytes.len(), 40);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 0xFFFE);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 2);
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 48_000);
        // Block align: 2 channels of 2 bytes.
        assert_eq!(u16::from_le_bytes([bytes[12], bytes[13]]), 4);
    }
}
