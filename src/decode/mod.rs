//! Pixel Decode
//!
//! Converts one packed source buffer into a linear RGB [`Image`],
//! optionally through the 3D tone-map LUT. Format-specific inner loops
//! live in `yuv`; MJPEG goes through `mjpeg`.

pub mod hdr;
pub mod lut;
pub mod mjpeg;
mod yuv;

use thiserror::Error;

use crate::image::{Image, MAX_IMAGE_PIXELS};
use lut::{P010Tables, ToneMapLut};

/// Source pixel layouts accepted by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Uyvy,
    I420,
    Nv12,
    P010,
    Rgb24,
    Xrgb,
    Mjpeg,
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::I420 => "I420",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::P010 => "P010",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Xrgb => "XRGB",
            PixelFormat::Mjpeg => "MJPEG",
        };
        f.write_str(name)
    }
}

/// Tone-mapping mode requested by configuration or the HDR detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdrMode {
    #[default]
    Off,
    Full,
    Partial,
}

impl HdrMode {
    pub fn is_on(self) -> bool {
        !matches!(self, HdrMode::Off)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(PixelFormat),
    #[error("tone mapping enabled but no LUT installed")]
    LutRequired,
    #[error("invalid crop ({left},{right},{top},{bottom}) for {width}x{height}")]
    InvalidCrop {
        left: u32,
        right: u32,
        top: u32,
        bottom: u32,
        width: u32,
        height: u32,
    },
    #[error("source buffer too small: need {need}, got {got}")]
    ShortBuffer { need: usize, got: usize },
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// Crop applied inside the source frame, in pixels per edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crop {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// Geometry and layout of one source buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameSpec {
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane.
    pub stride: u32,
    pub format: PixelFormat,
    pub crop: Crop,
    /// Sample every second pixel in both axes.
    pub quarter: bool,
}

impl FrameSpec {
    /// Crop with left/right rounded down to even, as chroma is shared
    /// between adjacent horizontal pixels.
    fn even_crop(&self) -> Crop {
        Crop {
            left: self.crop.left & !1,
            right: self.crop.right & !1,
            ..self.crop
        }
    }

    /// Validated output dimensions after crop (full resolution).
    fn output_size(&self) -> Result<(usize, usize), DecodeError> {
        let crop = self.even_crop();
        let invalid = || DecodeError::InvalidCrop {
            left: self.crop.left,
            right: self.crop.right,
            top: self.crop.top,
            bottom: self.crop.bottom,
            width: self.width,
            height: self.height,
        };
        if crop.left + crop.right >= self.width || crop.top + crop.bottom >= self.height {
            return Err(invalid());
        }
        let w = (self.width - crop.left - crop.right) as usize;
        let h = (self.height - crop.top - crop.bottom) as usize;
        if w * h > MAX_IMAGE_PIXELS {
            return Err(invalid());
        }
        Ok((w, h))
    }
}

/// Decode one source buffer into an RGB frame.
///
/// With a LUT every output pixel is one 24-bit table read; without it,
/// YUV sources go through the BT.601 integer conversion and RGB sources
/// are channel-swapped copies. Tone mapping without a LUT is an error.
pub fn decode_frame(
    src: &[u8],
    spec: &FrameSpec,
    lut: Option<&ToneMapLut>,
    hdr: HdrMode,
    p010_tables: Option<&P010Tables>,
) -> Result<Image, DecodeError> {
    if hdr.is_on() && lut.is_none() {
        return Err(DecodeError::LutRequired);
    }

    if spec.format == PixelFormat::Mjpeg {
        return mjpeg::decode(src, spec, lut, hdr);
    }

    let (out_w, out_h) = spec.output_size()?;
    let (out_w, out_h) = if spec.quarter {
        (out_w.div_ceil(2), out_h.div_ceil(2))
    } else {
        (out_w, out_h)
    };
    let mut dst = Image::new(out_w, out_h);
    let crop = spec.even_crop();

    match spec.format {
        PixelFormat::Yuyv => yuv::decode_yuyv(src, spec, &crop, lut, &mut dst)?,
        PixelFormat::Uyvy => yuv::decode_uyvy(src, spec, &crop, lut, &mut dst)?,
        PixelFormat::I420 => yuv::decode_i420(src, spec, &crop, lut, &mut dst)?,
        PixelFormat::Nv12 => yuv::decode_nv12(src, spec, &crop, lut, &mut dst)?,
        PixelFormat::P010 => yuv::decode_p010(src, spec, &crop, lut, p010_tables, &mut dst)?,
        PixelFormat::Rgb24 => yuv::decode_rgb(src, spec, &crop, lut, 3, &mut dst)?,
        PixelFormat::Xrgb => yuv::decode_rgb(src, spec, &crop, lut, 4, &mut dst)?,
        PixelFormat::Mjpeg => unreachable!(),
    }

    Ok(dst)
}
