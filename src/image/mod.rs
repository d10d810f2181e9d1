//! Image Primitives
//!
//! Owned RGB frames and the reusable buffer pool that backs them.
//! Frames are allocated once per size and recycled through a global
//! size-keyed pool so steady-state capture does not touch the allocator.

use std::collections::BTreeMap;
use std::mem;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Upper bound on frame size (pixels). Anything larger is a corrupt header.
pub const MAX_IMAGE_PIXELS: usize = 10_000_000;

/// Maximum bytes the buffer pool keeps cached across all sizes.
const POOL_CAP_BYTES: usize = 64 * 1024 * 1024;

/// One 8-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorRgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl ColorRgb {
    pub const BLACK: ColorRgb = ColorRgb {
        red: 0,
        green: 0,
        blue: 0,
    };

    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Normalized `[0,1]` components.
    pub fn to_f32(self) -> [f32; 3] {
        [
            self.red as f32 / 255.0,
            self.green as f32 / 255.0,
            self.blue as f32 / 255.0,
        ]
    }

    /// Quantize normalized components, clamping to `[0,1]` first.
    pub fn from_f32(rgb: [f32; 3]) -> Self {
        let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        Self::new(q(rgb[0]), q(rgb[1]), q(rgb[2]))
    }
}

/// Row-major RGB frame. The backing buffer is leased from [`BufferPool`]
/// and returned on drop.
pub struct Image {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl Image {
    /// Allocate (or recycle) a frame of `width x height` pixels.
    ///
    /// Panics if the requested size exceeds [`MAX_IMAGE_PIXELS`]; decode
    /// stages validate dimensions before getting here.
    pub fn new(width: usize, height: usize) -> Self {
        assert!(width * height <= MAX_IMAGE_PIXELS, "frame too large");
        let data = buffer_pool().take(width * height * 3);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Bytes per row.
    pub fn row_size(&self) -> usize {
        self.width * 3
    }

    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn pixel(&self, x: usize, y: usize) -> ColorRgb {
        let off = (y * self.width + x) * 3;
        ColorRgb::new(self.data[off], self.data[off + 1], self.data[off + 2])
    }

    pub fn set_pixel(&mut self, x: usize, y: usize, color: ColorRgb) {
        let off = (y * self.width + x) * 3;
        self.data[off] = color.red;
        self.data[off + 1] = color.green;
        self.data[off + 2] = color.blue;
    }

    /// Fill the whole frame with one color.
    pub fn fill(&mut self, color: ColorRgb) {
        for px in self.data.chunks_exact_mut(3) {
            px[0] = color.red;
            px[1] = color.green;
            px[2] = color.blue;
        }
    }

    /// Swap the backing buffer for one matching the new dimensions.
    /// Contents are unspecified afterwards.
    pub fn resize(&mut self, width: usize, height: usize) {
        if width == self.width && height == self.height {
            return;
        }
        assert!(width * height <= MAX_IMAGE_PIXELS, "frame too large");
        let old = mem::replace(&mut self.data, buffer_pool().take(width * height * 3));
        buffer_pool().put(old);
        self.width = width;
        self.height = height;
    }
}

impl Clone for Image {
    fn clone(&self) -> Self {
        let mut copy = Image::new(self.width, self.height);
        copy.data.copy_from_slice(&self.data);
        copy
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        buffer_pool().put(mem::take(&mut self.data));
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Size-keyed LIFO recycler for frame buffers.
///
/// Buffers are bucketed by exact byte length; a fixed cap bounds the
/// total cached bytes and eviction drops the smallest buffers first.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    cap_bytes: usize,
}

struct PoolInner {
    buckets: BTreeMap<usize, Vec<Vec<u8>>>,
    cached_bytes: usize,
}

impl BufferPool {
    pub fn new(cap_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                buckets: BTreeMap::new(),
                cached_bytes: 0,
            }),
            cap_bytes,
        }
    }

    /// Lease a buffer of exactly `len` bytes. Recycled buffers keep
    /// their previous contents.
    pub fn take(&self, len: usize) -> Vec<u8> {
        if len == 0 {
            return Vec::new();
        }
        let mut inner = self.inner.lock();
        if let Some(bucket) = inner.buckets.get_mut(&len) {
            if let Some(buf) = bucket.pop() {
                inner.cached_bytes -= len;
                return buf;
            }
        }
        drop(inner);
        vec![0; len]
    }

    /// Return a buffer. Oversized pools evict smallest-first.
    pub fn put(&self, buf: Vec<u8>) {
        let len = buf.len();
        if len == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.buckets.entry(len).or_default().push(buf);
        inner.cached_bytes += len;

        while inner.cached_bytes > self.cap_bytes {
            let smallest = match inner.buckets.keys().next() {
                Some(&k) => k,
                None => break,
            };
            let empty = {
                let bucket = inner.buckets.get_mut(&smallest).unwrap();
                bucket.pop();
                bucket.is_empty()
            };
            inner.cached_bytes -= smallest;
            if empty {
                inner.buckets.remove(&smallest);
            }
        }
    }

    /// Bytes currently cached (test hook).
    pub fn cached_bytes(&self) -> usize {
        self.inner.lock().cached_bytes
    }
}

static BUFFER_POOL: Lazy<BufferPool> = Lazy::new(|| BufferPool::new(POOL_CAP_BYTES));

/// Process-wide frame buffer pool.
pub fn buffer_pool() -> &'static BufferPool {
    &BUFFER_POOL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_roundtrip() {
        let mut img = Image::new(4, 2);
        img.fill(ColorRgb::BLACK);
        img.set_pixel(3, 1, ColorRgb::new(10, 20, 30));
        assert_eq!(img.pixel(3, 1), ColorRgb::new(10, 20, 30));
        assert_eq!(img.pixel(0, 0), ColorRgb::BLACK);
    }

    #[test]
    fn pool_recycles_exact_sizes() {
        let pool = BufferPool::new(1024);
        let buf = pool.take(300);
        assert_eq!(buf.len(), 300);
        pool.put(buf);
        assert_eq!(pool.cached_bytes(), 300);
        let again = pool.take(300);
        assert_eq!(again.len(), 300);
        assert_eq!(pool.cached_bytes(), 0);
    }

    #[test]
    fn pool_evicts_smallest_first() {
        let pool = BufferPool::new(1000);
        pool.put(vec![0; 400]);
        pool.put(vec![0; 600]);
        // Cap reached exactly; nothing evicted yet.
        assert_eq!(pool.cached_bytes(), 1000);
        pool.put(vec![0; 200]);
        // 1200 > cap: the 200-byte buffer is dropped first.
        assert_eq!(pool.cached_bytes(), 1000);
        pool.put(vec![0; 500]);
        // 1500 > cap: 400 goes, then 500.
        assert_eq!(pool.cached_bytes(), 600);
    }

    #[test]
    fn color_quantization_clamps() {
        assert_eq!(
            ColorRgb::from_f32([1.5, -0.2, 0.5]),
            ColorRgb::new(255, 0, 128)
        );
    }
}
