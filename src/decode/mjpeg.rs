//! MJPEG decode.
//!
//! Wraps `jpeg-decoder` for camera MJPEG streams. Tone mapping needs
//! the source subsampling to be 4:2:0 or 4:2:2, which the decoder does
//! not expose, so a minimal SOF marker scan runs first. Quarter mode
//! decodes at half scale through the IDCT.

use std::io::Cursor;

use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use crate::image::Image;

use super::lut::ToneMapLut;
use super::{Crop, DecodeError, FrameSpec, HdrMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subsampling {
    S420,
    S422,
    Other,
}

/// Scan the SOF header for component sampling factors.
fn scan_subsampling(src: &[u8]) -> Result<Subsampling, DecodeError> {
    let bad = |msg: &str| DecodeError::DecodeFailed(msg.to_string());

    if src.len() < 4 || src[0] != 0xFF || src[1] != 0xD8 {
        return Err(bad("not a JPEG stream"));
    }

    let mut pos = 2usize;
    while pos + 4 <= src.len() {
        if src[pos] != 0xFF {
            return Err(bad("corrupt marker stream"));
        }
        let marker = src[pos + 1];
        // Standalone markers carry no length.
        if marker == 0xD8 || (0xD0..=0xD7).contains(&marker) {
            pos += 2;
            continue;
        }
        if marker == 0xD9 || marker == 0xDA {
            break;
        }
        let len = ((src[pos + 2] as usize) << 8) | src[pos + 3] as usize;
        if matches!(marker, 0xC0 | 0xC1 | 0xC2) {
            let seg = &src[pos + 4..];
            if seg.len() < 6 {
                return Err(bad("truncated SOF"));
            }
            let ncomp = seg[5] as usize;
            if seg.len() < 6 + ncomp * 3 {
                return Err(bad("truncated SOF components"));
            }
            if ncomp < 3 {
                return Ok(Subsampling::Other);
            }
            let luma = seg[6 + 1];
            let chroma_dense = (0..ncomp).skip(1).all(|c| seg[6 + c * 3 + 1] == 0x11);
            return Ok(match (luma, chroma_dense) {
                (0x22, true) => Subsampling::S420,
                (0x21, true) => Subsampling::S422,
                _ => Subsampling::Other,
            });
        }
        pos += 2 + len;
    }
    Err(bad("no SOF marker found"))
}

/// Full-range RGB to JFIF YCbCr, used to feed decoded pixels through
/// the YUV-indexed tone-map LUT.
fn rgb_to_jfif_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let y = 0.299 * rf + 0.587 * gf + 0.114 * bf;
    let cb = -0.168_736 * rf - 0.331_264 * gf + 0.5 * bf + 128.0;
    let cr = 0.5 * rf - 0.418_688 * gf - 0.081_312 * bf + 128.0;
    let q = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    (q(y), q(cb), q(cr))
}

pub(super) fn decode(
    src: &[u8],
    spec: &FrameSpec,
    lut: Option<&ToneMapLut>,
    hdr: HdrMode,
) -> Result<Image, DecodeError> {
    let failed = |e: jpeg_decoder::Error| DecodeError::DecodeFailed(e.to_string());

    if hdr.is_on() {
        match scan_subsampling(src)? {
            Subsampling::S420 | Subsampling::S422 => {}
            Subsampling::Other => {
                return Err(DecodeError::DecodeFailed(
                    "tone mapping requires 4:2:0 or 4:2:2 subsampling".to_string(),
                ))
            }
        }
    }

    let mut decoder = Decoder::new(Cursor::new(src));
    decoder.read_info().map_err(failed)?;
    let info = decoder
        .info()
        .ok_or_else(|| DecodeError::DecodeFailed("no image info".to_string()))?;

    let (width, height) = if spec.quarter {
        decoder
            .scale(info.width / 2, info.height / 2)
            .map_err(failed)?
    } else {
        (info.width, info.height)
    };
    let (width, height) = (width as u32, height as u32);

    let pixels = decoder.decode().map_err(failed)?;
    let bpp = match decoder.info().map(|i| i.pixel_format) {
        Some(JpegPixelFormat::RGB24) => 3,
        Some(JpegPixelFormat::L8) => 1,
        other => {
            return Err(DecodeError::DecodeFailed(format!(
                "unsupported JPEG pixel format {other:?}"
            )))
        }
    };

    // Crops are given in source coordinates; at half scale they shrink
    // with the frame.
    let scale = if spec.quarter { 2 } else { 1 };
    let crop = Crop {
        left: (spec.crop.left / scale) & !1,
        right: (spec.crop.right / scale) & !1,
        top: spec.crop.top / scale,
        bottom: spec.crop.bottom / scale,
    };
    if crop.left + crop.right >= width || crop.top + crop.bottom >= height {
        return Err(DecodeError::InvalidCrop {
            left: spec.crop.left,
            right: spec.crop.right,
            top: spec.crop.top,
            bottom: spec.crop.bottom,
            width,
            height,
        });
    }

    let out_w = (width - crop.left - crop.right) as usize;
    let out_h = (height - crop.top - crop.bottom) as usize;
    let mut dst = Image::new(out_w, out_h);

    for dy in 0..out_h {
        let sy = dy + crop.top as usize;
        for dx in 0..out_w {
            let sx = dx + crop.left as usize;
            let off = (sy * width as usize + sx) * bpp;
            let (r, g, b) = if bpp == 3 {
                (pixels[off], pixels[off + 1], pixels[off + 2])
            } else {
                (pixels[off], pixels[off], pixels[off])
            };
            let rgb = match lut {
                Some(lut) => {
                    let (y, u, v) = if bpp == 1 {
                        (r, 128, 128)
                    } else {
                        rgb_to_jfif_ycbcr(r, g, b)
                    };
                    lut.lookup(y, u, v)
                }
                None => [r, g, b],
            };
            let data = dst.raw_mut();
            let out = (dy * out_w + dx) * 3;
            data[out] = rgb[0];
            data[out + 1] = rgb[1];
            data[out + 2] = rgb[2];
        }
    }

    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal SOF0 wrapper: SOI + SOF0 with the given sampling bytes.
    fn sof_stream(luma: u8, cb: u8, cr: u8) -> Vec<u8> {
        let mut s = vec![0xFF, 0xD8];
        let comps = [(1u8, luma), (2, cb), (3, cr)];
        let len = 8 + comps.len() * 3;
        s.extend_from_slice(&[0xFF, 0xC0, (len >> 8) as u8, (len & 0xFF) as u8]);
        s.push(8); // precision
        s.extend_from_slice(&[0, 16, 0, 16]); // height, width
        s.push(comps.len() as u8);
        for (id, sampling) in comps {
            s.extend_from_slice(&[id, sampling, 0]);
        }
        s.extend_from_slice(&[0xFF, 0xD9]);
        s
    }

    #[test]
    fn sof_scan_classifies_subsampling() {
        assert_eq!(
            scan_subsampling(&sof_stream(0x22, 0x11, 0x11)).unwrap(),
            Subsampling::S420
        );
        assert_eq!(
            scan_subsampling(&sof_stream(0x21, 0x11, 0x11)).unwrap(),
            Subsampling::S422
        );
        assert_eq!(
            scan_subsampling(&sof_stream(0x11, 0x11, 0x11)).unwrap(),
            Subsampling::Other
        );
    }

    #[test]
    fn sof_scan_rejects_non_jpeg() {
        assert!(scan_subsampling(&[0, 1, 2, 3]).is_err());
    }

    #[test]
    fn jfif_ycbcr_grey_axis() {
        let (y, cb, cr) = rgb_to_jfif_ycbcr(128, 128, 128);
        assert_eq!((y, cb, cr), (128, 128, 128));
        let (y, _, _) = rgb_to_jfif_ycbcr(255, 255, 255);
        assert_eq!(y, 255);
    }

    #[test]
    fn corrupt_stream_reports_decode_failure() {
        let spec = FrameSpec {
            width: 16,
            height: 16,
            stride: 0,
            format: super::super::PixelFormat::Mjpeg,
            crop: Crop::default(),
            quarter: false,
        };
        let err = decode(&[0xFF, 0xD8, 0xFF, 0xFF], &spec, None, HdrMode::Off).unwrap_err();
        assert!(matches!(err, DecodeError::DecodeFailed(_)));
    }
}
