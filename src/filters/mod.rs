//! The `std` plugin: source and utility filters.
//!
//! These filters double as the reference implementations of the request
//! protocol: sources produce in the initial activation, pass-through
//! filters forward input frames by reference, and the stitching filters
//! (trim, splice, loop) show multi-dependency requests.

mod audio;
mod video;

use crate::core::Core;
use crate::plugin::Plugin;

/// Register the `std` plugin on a freshly created core.
pub(crate) fn register_std(core: &Core) {
    let plugin = Plugin::new("std", "Vantage standard filters");
    audio::register(&plugin);
    video::register(&plugin);
    core.register_plugin(plugin)
        .expect("std namespace is free on a fresh core");
}

/// Fixed-width sample access into little-endian channel buffers.
///
/// The audio filters that do arithmetic on samples are monomorphized per
/// sample type through this trait (i16, i32, f32).
pub(crate) trait Sample: Copy + Send + Sync + 'static {
    /// Read sample `index` from a channel buffer.
    fn read(buf: &[u8], index: usize) -> Self;

    /// Write sample `index` into a channel buffer.
    fn write(buf: &mut [u8], index: usize, value: Self);

    /// Convert to f64 for mixing arithmetic.
    fn to_f64(self) -> f64;

    /// Convert back from f64, truncating like the integer sample paths do.
    fn from_f64(value: f64) -> Self;
}

impl Sample for i16 {
    fn read(buf: &[u8], index: usize) -> Self {
        let at = index * 2;
        i16::from_le_bytes([buf[at], buf[at + 1]])
    }

    fn write(buf: &mut [u8], index: usize, value: Self) {
        buf[index * 2..index * 2 + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as i16
    }
}

impl Sample for i32 {
    fn read(buf: &[u8], index: usize) -> Self {
        let at = index * 4;
        i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    fn write(buf: &mut [u8], index: usize, value: Self) {
        buf[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as i32
    }
}

impl Sample for f32 {
    fn read(buf: &[u8], index: usize) -> Self {
        let at = index * 4;
        f32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    fn write(buf: &mut [u8], index: usize, value: Self) {
        buf[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}
