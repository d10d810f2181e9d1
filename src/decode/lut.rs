//! Tone-map LUT
//!
//! The 256x256x256 table of RGB triples addressed by `(Y, U, V)` that
//! folds HDR-to-SDR tone mapping and colorspace conversion into one
//! read per pixel, plus the 10-bit reduction tables for P010 sources.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

use super::HdrMode;

/// Entries in the 3D table.
pub const LUT_ENTRIES: usize = 256 * 256 * 256;
/// Bytes of one table segment (3 bytes per entry).
pub const LUT_SEGMENT_BYTES: usize = LUT_ENTRIES * 3;

/// One loaded LUT segment.
pub struct ToneMapLut {
    data: Vec<u8>,
}

impl ToneMapLut {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() != LUT_SEGMENT_BYTES {
            bail!(
                "LUT segment must be {} bytes, got {}",
                LUT_SEGMENT_BYTES,
                data.len()
            );
        }
        Ok(Self { data })
    }

    /// Load one segment of a LUT file. Files carry one segment per
    /// tone-mapping mode, back to back.
    pub fn load(path: &Path, segment: usize) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("opening LUT {}", path.display()))?;
        let offset = (segment * LUT_SEGMENT_BYTES) as u64;
        let len = file.metadata()?.len();
        if len < offset + LUT_SEGMENT_BYTES as u64 {
            bail!(
                "LUT {} too small for segment {} ({} bytes)",
                path.display(),
                segment,
                len
            );
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; LUT_SEGMENT_BYTES];
        file.read_exact(&mut data)?;
        info!(
            "loaded tone-map LUT segment {} from {}",
            segment,
            path.display()
        );
        Ok(Self { data })
    }

    /// Pass-through table: every `(y,u,v)` maps to `(y,u,v)`. Test hook.
    pub fn passthrough() -> Self {
        let mut data = vec![0u8; LUT_SEGMENT_BYTES];
        for v in 0..256usize {
            for u in 0..256usize {
                let base = (v << 16 | u << 8) * 3;
                for y in 0..256usize {
                    let off = base + y * 3;
                    data[off] = y as u8;
                    data[off + 1] = u as u8;
                    data[off + 2] = v as u8;
                }
            }
        }
        Self { data }
    }

    #[inline]
    pub fn lookup(&self, y: u8, u: u8, v: u8) -> [u8; 3] {
        let idx = ((y as usize) | (u as usize) << 8 | (v as usize) << 16) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

/// 10-bit to 8-bit reduction tables for P010 sources.
///
/// The chroma table is always a plain `>>2` reduction. The luma table
/// additionally runs the PQ-to-SDR curve in partial tone-mapping mode,
/// where the full 3D LUT is bypassed for chroma.
pub struct P010Tables {
    pub luma: [u8; 1024],
    pub chroma: [u8; 1024],
}

impl P010Tables {
    pub fn new(mode: HdrMode) -> Self {
        let mut luma = [0u8; 1024];
        let mut chroma = [0u8; 1024];
        for i in 0..1024usize {
            chroma[i] = (i >> 2) as u8;
            luma[i] = match mode {
                HdrMode::Partial => pq_luma_to_sdr(i as f32 / 1023.0),
                _ => (i >> 2) as u8,
            };
        }
        Self { luma, chroma }
    }
}

/// PQ-coded luma to an 8-bit SDR value: ST 2084 EOTF, Reinhard rolloff
/// around the 203-nit reference white, BT.709-ish display gamma.
fn pq_luma_to_sdr(pq: f32) -> u8 {
    const M1: f32 = 0.1593017578125;
    const M2: f32 = 78.84375;
    const C1: f32 = 0.8359375;
    const C2: f32 = 18.8515625;
    const C3: f32 = 18.6875;
    const SDR_WHITE_NITS: f32 = 203.0;

    let e_inv_m2 = pq.max(0.0).powf(1.0 / M2);
    let num = (e_inv_m2 - C1).max(0.0);
    let den = C2 - C3 * e_inv_m2;
    let nits = 10000.0 * (num / den).powf(1.0 / M1);

    let rel = nits / SDR_WHITE_NITS;
    let mapped = rel / (1.0 + rel);
    (mapped.powf(1.0 / 2.2) * 255.0).round().clamp(0.0, 255.0) as u8
}
