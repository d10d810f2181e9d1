//! Packed / planar decode loops.
//!
//! Each loop resolves chroma sharing for its layout and emits one RGB
//! pixel per output position, either through the tone-map LUT or the
//! BT.601 integer conversion.

use crate::color::yuv601_to_rgb;
use crate::image::Image;

use super::lut::{P010Tables, ToneMapLut};
use super::{Crop, DecodeError, FrameSpec};

fn need(src: &[u8], bytes: usize) -> Result<(), DecodeError> {
    if src.len() < bytes {
        return Err(DecodeError::ShortBuffer {
            need: bytes,
            got: src.len(),
        });
    }
    Ok(())
}

fn put(dst: &mut Image, dx: usize, dy: usize, rgb: [u8; 3]) {
    let off = (dy * dst.width() + dx) * 3;
    let data = dst.raw_mut();
    data[off] = rgb[0];
    data[off + 1] = rgb[1];
    data[off + 2] = rgb[2];
}

fn emit(lut: Option<&ToneMapLut>, y: u8, u: u8, v: u8) -> [u8; 3] {
    match lut {
        Some(lut) => lut.lookup(y, u, v),
        None => {
            let (r, g, b) = yuv601_to_rgb(y, u, v);
            [r, g, b]
        }
    }
}

pub(super) fn decode_yuyv(
    src: &[u8],
    spec: &FrameSpec,
    crop: &Crop,
    lut: Option<&ToneMapLut>,
    dst: &mut Image,
) -> Result<(), DecodeError> {
    decode_packed(src, spec, crop, lut, dst, |src, m, even| {
        let y = if even { src[m] } else { src[m + 2] };
        (y, src[m + 1], src[m + 3])
    })
}

pub(super) fn decode_uyvy(
    src: &[u8],
    spec: &FrameSpec,
    crop: &Crop,
    lut: Option<&ToneMapLut>,
    dst: &mut Image,
) -> Result<(), DecodeError> {
    decode_packed(src, spec, crop, lut, dst, |src, m, even| {
        let y = if even { src[m + 1] } else { src[m + 3] };
        (y, src[m], src[m + 2])
    })
}

/// Shared loop for the two 4:2:2 packed layouts. `sample` extracts
/// `(Y, U, V)` from a 4-byte macro-pixel.
fn decode_packed(
    src: &[u8],
    spec: &FrameSpec,
    crop: &Crop,
    lut: Option<&ToneMapLut>,
    dst: &mut Image,
    sample: impl Fn(&[u8], usize, bool) -> (u8, u8, u8),
) -> Result<(), DecodeError> {
    let stride = spec.stride as usize;
    need(src, stride * spec.height as usize)?;

    let step = if spec.quarter { 2 } else { 1 };
    for dy in 0..dst.height() {
        let sy = crop.top as usize + dy * step;
        let row = sy * stride + crop.left as usize * 2;
        for dx in 0..dst.width() {
            let sx = dx * step;
            let macro_off = row + (sx / 2) * 4;
            let (y, u, v) = sample(src, macro_off, sx % 2 == 0);
            put(dst, dx, dy, emit(lut, y, u, v));
        }
    }
    Ok(())
}

pub(super) fn decode_i420(
    src: &[u8],
    spec: &FrameSpec,
    crop: &Crop,
    lut: Option<&ToneMapLut>,
    dst: &mut Image,
) -> Result<(), DecodeError> {
    let stride = spec.stride as usize;
    let height = spec.height as usize;
    let y_plane = stride * height;
    need(src, y_plane + y_plane / 2)?;

    let u_base = y_plane;
    let v_base = y_plane + y_plane / 4;
    let chroma_stride = stride / 2;

    let step = if spec.quarter { 2 } else { 1 };
    for dy in 0..dst.height() {
        let sy = crop.top as usize + dy * step;
        for dx in 0..dst.width() {
            let sx = crop.left as usize + dx * step;
            let y = src[sy * stride + sx];
            let chroma = (sy / 2) * chroma_stride + sx / 2;
            let u = src[u_base + chroma];
            let v = src[v_base + chroma];
            put(dst, dx, dy, emit(lut, y, u, v));
        }
    }
    Ok(())
}

pub(super) fn decode_nv12(
    src: &[u8],
    spec: &FrameSpec,
    crop: &Crop,
    lut: Option<&ToneMapLut>,
    dst: &mut Image,
) -> Result<(), DecodeError> {
    let stride = spec.stride as usize;
    let height = spec.height as usize;
    let y_plane = stride * height;
    need(src, y_plane + y_plane / 2)?;

    let step = if spec.quarter { 2 } else { 1 };
    for dy in 0..dst.height() {
        let sy = crop.top as usize + dy * step;
        for dx in 0..dst.width() {
            let sx = crop.left as usize + dx * step;
            let y = src[sy * stride + sx];
            let uv = y_plane + (sy / 2) * stride + (sx & !1);
            put(dst, dx, dy, emit(lut, y, src[uv], src[uv + 1]));
        }
    }
    Ok(())
}

pub(super) fn decode_p010(
    src: &[u8],
    spec: &FrameSpec,
    crop: &Crop,
    lut: Option<&ToneMapLut>,
    tables: Option<&P010Tables>,
    dst: &mut Image,
) -> Result<(), DecodeError> {
    let stride = spec.stride as usize;
    let height = spec.height as usize;
    let y_plane = stride * height;
    need(src, y_plane + y_plane / 2)?;

    let sample16 = |off: usize| u16::from_le_bytes([src[off], src[off + 1]]);
    let reduce = |s: u16, table: Option<&[u8; 1024]>| -> u8 {
        match table {
            // 10 significant bits live in the container's MSBs.
            Some(t) => t[(s >> 6) as usize],
            None => (s >> 8) as u8,
        }
    };

    let step = if spec.quarter { 2 } else { 1 };
    for dy in 0..dst.height() {
        let sy = crop.top as usize + dy * step;
        for dx in 0..dst.width() {
            let sx = crop.left as usize + dx * step;
            let y16 = sample16(sy * stride + sx * 2);
            let uv = y_plane + (sy / 2) * stride + (sx & !1) * 2;
            let u16v = sample16(uv);
            let v16v = sample16(uv + 2);

            let y = reduce(y16, tables.map(|t| &t.luma));
            let u = reduce(u16v, tables.map(|t| &t.chroma));
            let v = reduce(v16v, tables.map(|t| &t.chroma));
            put(dst, dx, dy, emit(lut, y, u, v));
        }
    }
    Ok(())
}

/// RGB24 / XRGB copy with channel swap (source order is B,G,R,[X]).
/// With a LUT installed the read becomes a straight RGB-indexed lookup.
pub(super) fn decode_rgb(
    src: &[u8],
    spec: &FrameSpec,
    crop: &Crop,
    lut: Option<&ToneMapLut>,
    bpp: usize,
    dst: &mut Image,
) -> Result<(), DecodeError> {
    let stride = spec.stride as usize;
    need(src, stride * spec.height as usize)?;

    let step = if spec.quarter { 2 } else { 1 };
    for dy in 0..dst.height() {
        let sy = crop.top as usize + dy * step;
        let row = sy * stride + crop.left as usize * bpp;
        for dx in 0..dst.width() {
            let off = row + dx * step * bpp;
            let (b, g, r) = (src[off], src[off + 1], src[off + 2]);
            let rgb = match lut {
                Some(lut) => lut.lookup(r, g, b),
                None => [r, g, b],
            };
            put(dst, dx, dy, rgb);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode_frame, HdrMode, PixelFormat};
    use crate::image::ColorRgb;

    fn spec(format: PixelFormat, w: u32, h: u32, stride: u32) -> FrameSpec {
        FrameSpec {
            width: w,
            height: h,
            stride,
            format,
            crop: Crop::default(),
            quarter: false,
        }
    }

    #[test]
    fn i420_chroma_is_shared_per_quad() {
        // 2x2 frame: Y plane 4 bytes, U and V one byte each.
        let mut src = vec![0u8; 4 + 1 + 1];
        src[0] = 100;
        src[1] = 110;
        src[2] = 120;
        src[3] = 130;
        src[4] = 90; // U
        src[5] = 200; // V
        let img = decode_frame(
            &src,
            &spec(PixelFormat::I420, 2, 2, 2),
            None,
            HdrMode::Off,
            None,
        )
        .unwrap();
        let expect = crate::color::yuv601_to_rgb(130, 90, 200);
        assert_eq!(img.pixel(1, 1), ColorRgb::new(expect.0, expect.1, expect.2));
    }

    #[test]
    fn nv12_reads_interleaved_chroma() {
        let mut src = vec![0u8; 4 + 2];
        src[0] = 50;
        src[1] = 60;
        src[2] = 70;
        src[3] = 80;
        src[4] = 10; // U
        src[5] = 240; // V
        let img = decode_frame(
            &src,
            &spec(PixelFormat::Nv12, 2, 2, 2),
            None,
            HdrMode::Off,
            None,
        )
        .unwrap();
        let expect = crate::color::yuv601_to_rgb(50, 10, 240);
        assert_eq!(img.pixel(0, 0), ColorRgb::new(expect.0, expect.1, expect.2));
    }

    #[test]
    fn p010_reduces_high_bits_without_tables() {
        // One 16-bit Y sample of 0xFFC0 (10-bit max) reduces to 0xFF.
        let w = 2u32;
        let h = 2u32;
        let stride = 4u32;
        let mut src = vec![0u8; (stride * h + stride * h / 2) as usize];
        for px in 0..4 {
            let off = (px / 2) as usize * 4 + (px % 2) as usize * 2;
            src[off] = 0xC0;
            src[off + 1] = 0xFF;
        }
        // Neutral chroma: 0x8000.
        let uv = (stride * h) as usize;
        src[uv + 1] = 0x80;
        src[uv + 3] = 0x80;
        let img = decode_frame(
            &src,
            &spec(PixelFormat::P010, w, h, stride),
            None,
            HdrMode::Off,
            None,
        )
        .unwrap();
        let px = img.pixel(0, 0);
        assert!(px.red >= 235 && px.green >= 235 && px.blue >= 235);
    }

    #[test]
    fn short_buffer_is_reported() {
        let src = vec![0u8; 4];
        let err = decode_frame(
            &src,
            &spec(PixelFormat::Yuyv, 4, 4, 8),
            None,
            HdrMode::Off,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::ShortBuffer { .. }));
    }

    #[test]
    fn uyvy_swaps_luma_position() {
        // [U Y0 V Y1]: both pixels Y=200, U=100, V=150.
        let src = [100u8, 200, 150, 200];
        let img = decode_frame(
            &src,
            &spec(PixelFormat::Uyvy, 2, 1, 4),
            None,
            HdrMode::Off,
            None,
        )
        .unwrap();
        let expect = crate::color::yuv601_to_rgb(200, 100, 150);
        assert_eq!(img.pixel(0, 0), ColorRgb::new(expect.0, expect.1, expect.2));
        assert_eq!(img.pixel(0, 0), img.pixel(1, 0));
    }
}
