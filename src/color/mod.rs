//! Color Math
//!
//! Shared conversions used by the mapper, smoothing, and calibration
//! stages: HSL round-trips, BT.601/BT.709 YUV, and the linearization
//! table used for region averaging.

pub mod calibration;

use once_cell::sync::Lazy;

/// Gamma of the averaging linearization curve.
const AVERAGING_GAMMA: f32 = 1.8;

/// 256-entry table mapping gamma-encoded bytes to linear `u16` values.
pub static LINEAR_TABLE: Lazy<[u16; 256]> = Lazy::new(|| {
    let mut table = [0u16; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let linear = (i as f32 / 255.0).powf(AVERAGING_GAMMA);
        *slot = (linear * 65535.0).round() as u16;
    }
    table
});

/// Inverse of [`LINEAR_TABLE`] for a normalized linear value.
pub fn delinearize(linear: f32) -> f32 {
    linear.clamp(0.0, 1.0).powf(1.0 / AVERAGING_GAMMA)
}

/// RGB to HSL. Hue in degrees `[0,360)`, saturation and luminance in `[0,1]`.
pub fn rgb_to_hsl(red: u8, green: u8, blue: u8) -> (u16, f32, f32) {
    let r = red as f32 / 255.0;
    let g = green as f32 / 255.0;
    let b = blue as f32 / 255.0;

    let min = r.min(g).min(b);
    let max = r.max(g).max(b);
    let diff = max - min;

    let luminance = (min + max) / 2.0;

    if diff == 0.0 {
        return (0, 0.0, luminance);
    }

    let saturation = if luminance < 0.5 {
        diff / (min + max)
    } else {
        diff / (2.0 - min - max)
    };

    // Start from 360 so the red branch never goes negative.
    let hue = if max == r {
        let mut h = 360.0 + 60.0 * (g - b) / diff;
        if h >= 360.0 {
            h -= 360.0;
        }
        h
    } else if max == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };

    (hue as u16, saturation, luminance)
}

/// HSL back to RGB bytes.
pub fn hsl_to_rgb(hue: u16, saturation: f32, luminance: f32) -> (u8, u8, u8) {
    if saturation == 0.0 {
        let v = (luminance * 255.0) as u8;
        return (v, v, v);
    }

    let q = if luminance < 0.5 {
        luminance * (1.0 + saturation)
    } else {
        (luminance + saturation) - (luminance * saturation)
    };
    let p = 2.0 * luminance - q;
    let h = hue as f32 / 360.0;

    let mut t = [h + 1.0 / 3.0, h, h - 1.0 / 3.0];
    for v in t.iter_mut() {
        if *v < 0.0 {
            *v += 1.0;
        }
        if *v > 1.0 {
            *v -= 1.0;
        }
    }

    let mut out = [0.0f32; 3];
    for (o, &tc) in out.iter_mut().zip(t.iter()) {
        *o = if tc * 6.0 < 1.0 {
            p + (q - p) * 6.0 * tc
        } else if tc * 2.0 < 1.0 {
            q
        } else if tc * 3.0 < 2.0 {
            p + (q - p) * (2.0 / 3.0 - tc) * 6.0
        } else {
            p
        };
    }

    (
        (out[0] * 255.0) as u8,
        (out[1] * 255.0) as u8,
        (out[2] * 255.0) as u8,
    )
}

/// Normalized RGB to BT.709 YUV (`Y` in `[0,1]`, `U`/`V` in `[-0.5,0.5]`).
pub fn rgb_to_bt709(rgb: [f32; 3]) -> [f32; 3] {
    let [r, g, b] = rgb;
    [
        0.2126 * r + 0.7152 * g + 0.0722 * b,
        -0.1146 * r - 0.3854 * g + 0.5000 * b,
        0.5000 * r - 0.4542 * g - 0.0458 * b,
    ]
}

/// Inverse of [`rgb_to_bt709`].
pub fn bt709_to_rgb(yuv: [f32; 3]) -> [f32; 3] {
    let [y, u, v] = yuv;
    [
        y + 1.5748 * v,
        y - 0.1873 * u - 0.4681 * v,
        y + 1.8556 * u,
    ]
}

/// BT.709 luma of an 8-bit color, as an 8-bit value.
pub fn luma709(red: u8, green: u8, blue: u8) -> u8 {
    let y = 0.2126 * red as f64 + 0.7152 * green as f64 + 0.0722 * blue as f64;
    y.round().clamp(0.0, 255.0) as u8
}

/// Integer BT.601 limited-range YUV to RGB, the conversion used when no
/// tone-map LUT is installed.
pub fn yuv601_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let clamp = |x: i32| x.clamp(0, 255) as u8;
    (
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hsl_roundtrip_primaries() {
        for &(r, g, b) in &[
            (255u8, 0u8, 0u8),
            (0, 255, 0),
            (0, 0, 255),
            (255, 255, 0),
            (128, 128, 128),
            (10, 200, 90),
        ] {
            let (h, s, l) = rgb_to_hsl(r, g, b);
            let (r2, g2, b2) = hsl_to_rgb(h, s, l);
            assert!(
                (r as i16 - r2 as i16).abs() <= 2
                    && (g as i16 - g2 as i16).abs() <= 2
                    && (b as i16 - b2 as i16).abs() <= 2,
                "({r},{g},{b}) -> ({r2},{g2},{b2})"
            );
        }
    }

    #[test]
    fn hsl_grey_has_no_hue() {
        let (h, s, l) = rgb_to_hsl(77, 77, 77);
        assert_eq!(h, 0);
        assert_eq!(s, 0.0);
        assert!((l - 77.0 / 255.0).abs() < 1e-4);
    }

    #[test]
    fn bt709_roundtrip() {
        for &rgb in &[[1.0f32, 0.0, 0.0], [0.3, 0.7, 0.2], [1.0, 1.0, 1.0]] {
            let back = bt709_to_rgb(rgb_to_bt709(rgb));
            for i in 0..3 {
                assert!((back[i] - rgb[i]).abs() < 1e-3, "{rgb:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn yuv601_white_saturates() {
        let (r, g, b) = yuv601_to_rgb(255, 128, 128);
        assert!(r >= 235 && g >= 235 && b >= 235);
    }

    #[test]
    fn linear_table_endpoints() {
        assert_eq!(LINEAR_TABLE[0], 0);
        assert_eq!(LINEAR_TABLE[255], 65535);
        assert!((delinearize(1.0) - 1.0).abs() < 1e-6);
        assert_eq!(delinearize(0.0), 0.0);
    }
}
