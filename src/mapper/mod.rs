//! Image-to-LED Mapping
//!
//! Precomputes, per LED, the byte offsets of the pixels that feed it,
//! then folds each frame into one color per LED. The offset lists are
//! rebuilt on resize or strip replacement only; the per-frame path is
//! pure accumulation.

use std::collections::HashMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::color::{delinearize, LINEAR_TABLE};
use crate::image::Image;

/// Region area above which sampling is forced to sparse (stride 2).
const SPARSE_FORCE_AREA: usize = 1600;

/// One LED of the strip: the fractional image region feeding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Led {
    /// Horizontal region, fractions of the bordered area.
    pub hmin: f32,
    pub hmax: f32,
    /// Vertical region.
    pub vmin: f32,
    pub vmax: f32,
    /// LEDs sharing a non-zero group get identical output from their
    /// combined region.
    pub group: i32,
    pub disabled: bool,
}

impl Default for Led {
    fn default() -> Self {
        Self {
            hmin: 0.0,
            hmax: 1.0,
            vmin: 0.0,
            vmax: 1.0,
            group: 0,
            disabled: false,
        }
    }
}

/// Ordered LED strip definition (the `leds` settings document).
pub type LedString = Vec<Led>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    /// Per-LED arithmetic mean over the LED's region.
    #[default]
    MulticolorMean,
    /// Mean of the whole bordered image, replicated to every LED.
    UnicolorMean,
}

/// Precomputed relation between pixel offsets and LEDs.
pub struct ImageToLedMap {
    width: usize,
    height: usize,
    horizontal_border: usize,
    vertical_border: usize,
    sparse: bool,
    mode: MappingMode,
    /// Averaging in linear light; off = gamma-space arithmetic mean.
    linear: bool,
    /// Byte offsets into the frame, per LED.
    colors_map: Vec<Vec<u32>>,
    /// Group key -> member LED indices (first member holds the merged list).
    color_groups: HashMap<i32, Vec<usize>>,
}

impl ImageToLedMap {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: MappingMode,
        sparse: bool,
        linear: bool,
        width: usize,
        height: usize,
        horizontal_border: usize,
        vertical_border: usize,
        leds: &[Led],
    ) -> Self {
        assert!(width > 2 * vertical_border && height > 2 * horizontal_border);

        let x_offset = vertical_border as i64;
        let actual_width = (width - 2 * vertical_border) as i64;
        let y_offset = horizontal_border as i64;
        let actual_height = (height - 2 * horizontal_border) as i64;

        let mut colors_map: Vec<Vec<u32>> = Vec::with_capacity(leds.len());
        let mut color_groups: HashMap<i32, Vec<usize>> = HashMap::new();
        let mut total_count = 0usize;

        for (led_index, led) in leds.iter().enumerate() {
            if (led.hmax - led.hmin) < 1e-6 || (led.vmax - led.vmin) < 1e-6 {
                colors_map.push(Vec::new());
                continue;
            }

            let mut min_x = x_offset + (actual_width as f32 * led.hmin).round() as i64;
            let mut max_x = x_offset + (actual_width as f32 * led.hmax).round() as i64;
            let mut min_y = y_offset + (actual_height as f32 * led.vmin).round() as i64;
            let mut max_y = y_offset + (actual_height as f32 * led.vmax).round() as i64;

            min_x = min_x.min(x_offset + actual_width - 1);
            if min_x == max_x {
                max_x += 1;
            }
            min_y = min_y.min(y_offset + actual_height - 1);
            if min_y == max_y {
                max_y += 1;
            }

            let x_end = max_x.min(x_offset + actual_width);
            let y_end = max_y.min(y_offset + actual_height);
            let area = ((y_end - min_y) * (x_end - min_x)).unsigned_abs() as usize;

            let mut sparse_region = sparse;
            if !sparse_region && area > SPARSE_FORCE_AREA {
                warn!(
                    "LED {} covers {} pixels; forcing sparse sampling for it \
                     (enable sparse processing to silence this)",
                    led_index, area
                );
                sparse_region = true;
            }
            let step: i64 = if sparse_region { 2 } else { 1 };

            let mut offsets = Vec::new();
            if !led.disabled {
                offsets.reserve(area / (step * step) as usize + 1);
                let mut y = min_y;
                while y < y_end {
                    let mut x = min_x;
                    while x < x_end {
                        offsets.push(((y * width as i64 + x) * 3) as u32);
                        x += step;
                    }
                    y += step;
                }
            }
            total_count += offsets.len();
            colors_map.push(offsets);

            if led.group > 0 {
                if let Some(members) = color_groups.get_mut(&led.group) {
                    let master = members[0];
                    let moved = std::mem::take(&mut colors_map[led_index]);
                    colors_map[master].extend(moved);
                    members.push(led_index);
                } else {
                    color_groups.insert(led.group, vec![led_index]);
                }
            }
        }

        info!(
            "LED mapping: {} areas over {}x{} image, {} sampled offsets, sparse: {}",
            leds.len(),
            width,
            height,
            total_count,
            sparse
        );

        Self {
            width,
            height,
            horizontal_border,
            vertical_border,
            sparse,
            mode,
            linear,
            colors_map,
            color_groups,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn horizontal_border(&self) -> usize {
        self.horizontal_border
    }

    pub fn vertical_border(&self) -> usize {
        self.vertical_border
    }

    pub fn led_count(&self) -> usize {
        self.colors_map.len()
    }

    /// Fold one frame into per-LED colors, `[0,1]` per channel.
    pub fn process(&self, image: &Image) -> Vec<[f32; 3]> {
        let mut led_colors = match self.mode {
            MappingMode::UnicolorMean => {
                vec![self.calc_unicolor(image); self.colors_map.len()]
            }
            MappingMode::MulticolorMean => self
                .colors_map
                .iter()
                .map(|offsets| self.calc_multicolor(image, offsets))
                .collect(),
        };

        if self.mode != MappingMode::UnicolorMean {
            for members in self.color_groups.values() {
                let combined = led_colors[members[0]];
                for &member in &members[1..] {
                    led_colors[member] = combined;
                }
            }
        }

        led_colors
    }

    fn calc_multicolor(&self, image: &Image, offsets: &[u32]) -> [f32; 3] {
        if offsets.is_empty() {
            return [0.0; 3];
        }

        let data = image.raw();
        if self.linear {
            let mut sum = [0u64; 3];
            for &off in offsets {
                let off = off as usize;
                sum[0] += LINEAR_TABLE[data[off] as usize] as u64;
                sum[1] += LINEAR_TABLE[data[off + 1] as usize] as u64;
                sum[2] += LINEAR_TABLE[data[off + 2] as usize] as u64;
            }
            let n = (offsets.len() as f64 * 65535.0) as f32;
            [
                delinearize(sum[0] as f32 / n),
                delinearize(sum[1] as f32 / n),
                delinearize(sum[2] as f32 / n),
            ]
        } else {
            let mut sum = [0u64; 3];
            for &off in offsets {
                let off = off as usize;
                sum[0] += data[off] as u64;
                sum[1] += data[off + 1] as u64;
                sum[2] += data[off + 2] as u64;
            }
            let n = (offsets.len() * 255) as f32;
            [
                sum[0] as f32 / n,
                sum[1] as f32 / n,
                sum[2] as f32 / n,
            ]
        }
    }

    fn calc_unicolor(&self, image: &Image) -> [f32; 3] {
        let data = image.raw();
        let row_size = image.row_size();
        let step = if self.sparse { 2 } else { 1 };

        let mut sum = [0u64; 3];
        let mut count = 0u64;
        let mut y = 0;
        while y < image.height() {
            let mut off = y * row_size;
            let row_end = off + row_size;
            while off < row_end {
                if self.linear {
                    sum[0] += LINEAR_TABLE[data[off] as usize] as u64;
                    sum[1] += LINEAR_TABLE[data[off + 1] as usize] as u64;
                    sum[2] += LINEAR_TABLE[data[off + 2] as usize] as u64;
                } else {
                    sum[0] += data[off] as u64;
                    sum[1] += data[off + 1] as u64;
                    sum[2] += data[off + 2] as u64;
                }
                count += 1;
                off += step * 3;
            }
            y += step;
        }

        if count == 0 {
            return [0.0; 3];
        }
        if self.linear {
            let n = (count as f64 * 65535.0) as f32;
            [
                delinearize(sum[0] as f32 / n),
                delinearize(sum[1] as f32 / n),
                delinearize(sum[2] as f32 / n),
            ]
        } else {
            let n = (count * 255) as f32;
            [
                sum[0] as f32 / n,
                sum[1] as f32 / n,
                sum[2] as f32 / n,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ColorRgb;

    fn full_led() -> Led {
        Led::default()
    }

    fn map_for(
        leds: &[Led],
        width: usize,
        height: usize,
        linear: bool,
        sparse: bool,
    ) -> ImageToLedMap {
        ImageToLedMap::new(
            MappingMode::MulticolorMean,
            sparse,
            linear,
            width,
            height,
            0,
            0,
            leds,
        )
    }

    #[test]
    fn linear_mean_of_primaries() {
        let mut img = Image::new(4, 1);
        img.set_pixel(0, 0, ColorRgb::BLACK);
        img.set_pixel(1, 0, ColorRgb::new(255, 0, 0));
        img.set_pixel(2, 0, ColorRgb::new(0, 255, 0));
        img.set_pixel(3, 0, ColorRgb::new(0, 0, 255));

        let map = map_for(&[full_led()], 4, 1, true, false);
        let colors = map.process(&img);
        assert_eq!(colors.len(), 1);
        for ch in colors[0] {
            let byte = (ch * 255.0).round();
            assert!(
                (byte - 119.0).abs() <= 1.0,
                "expected ~119 per channel, got {byte}"
            );
        }
    }

    #[test]
    fn gamma_space_mean_without_linearization() {
        let mut img = Image::new(2, 1);
        img.set_pixel(0, 0, ColorRgb::new(100, 0, 0));
        img.set_pixel(1, 0, ColorRgb::new(200, 0, 0));

        let map = map_for(&[full_led()], 2, 1, false, false);
        let colors = map.process(&img);
        let byte = (colors[0][0] * 255.0).round();
        assert!((byte - 150.0).abs() <= 1.0);
    }

    #[test]
    fn disabled_led_yields_black() {
        let led = Led {
            disabled: true,
            ..full_led()
        };
        let mut img = Image::new(2, 2);
        img.fill(ColorRgb::new(255, 255, 255));
        let map = map_for(&[led], 2, 2, false, false);
        assert_eq!(map.process(&img)[0], [0.0; 3]);
    }

    #[test]
    fn zero_area_led_yields_black() {
        let led = Led {
            hmin: 0.5,
            hmax: 0.5,
            ..full_led()
        };
        let mut img = Image::new(4, 4);
        img.fill(ColorRgb::new(200, 200, 200));
        let map = map_for(&[led], 4, 4, false, false);
        assert_eq!(map.process(&img)[0], [0.0; 3]);
    }

    #[test]
    fn grouped_leds_share_combined_region() {
        // Left half red, right half blue; both LEDs in group 1 must see
        // the combined (purple) mean.
        let mut img = Image::new(4, 1);
        for x in 0..2 {
            img.set_pixel(x, 0, ColorRgb::new(255, 0, 0));
        }
        for x in 2..4 {
            img.set_pixel(x, 0, ColorRgb::new(0, 0, 255));
        }

        let left = Led {
            hmax: 0.5,
            group: 1,
            ..full_led()
        };
        let right = Led {
            hmin: 0.5,
            group: 1,
            ..full_led()
        };
        let map = map_for(&[left, right], 4, 1, false, false);
        let colors = map.process(&img);
        assert_eq!(colors[0], colors[1]);
        let r = (colors[0][0] * 255.0).round();
        let b = (colors[0][2] * 255.0).round();
        assert!((r - 127.0).abs() <= 1.0 && (b - 127.0).abs() <= 1.0);
    }

    #[test]
    fn large_region_is_forced_sparse() {
        // 50x50 = 2500 px > 1600: stride 2 in both axes -> 625 samples.
        let map = map_for(&[full_led()], 50, 50, false, false);
        assert_eq!(map.colors_map[0].len(), 625);
    }

    #[test]
    fn unicolor_replicates_whole_image_mean() {
        let mut img = Image::new(2, 1);
        img.set_pixel(0, 0, ColorRgb::new(0, 100, 0));
        img.set_pixel(1, 0, ColorRgb::new(0, 200, 0));
        let map = ImageToLedMap::new(
            MappingMode::UnicolorMean,
            false,
            false,
            2,
            1,
            0,
            0,
            &[full_led(), full_led(), full_led()],
        );
        let colors = map.process(&img);
        assert_eq!(colors.len(), 3);
        assert_eq!(colors[0], colors[2]);
        let g = (colors[0][1] * 255.0).round();
        assert!((g - 150.0).abs() <= 1.0);
    }

    #[test]
    fn borders_are_excluded_from_sampling() {
        // 4x4 with 1px borders all around: only the center 2x2 sampled.
        let mut img = Image::new(4, 4);
        img.fill(ColorRgb::new(255, 255, 255));
        for x in 1..3 {
            for y in 1..3 {
                img.set_pixel(x, y, ColorRgb::BLACK);
            }
        }
        let map = ImageToLedMap::new(
            MappingMode::MulticolorMean,
            false,
            false,
            4,
            4,
            1,
            1,
            &[full_led()],
        );
        assert_eq!(map.process(&img)[0], [0.0; 3]);
    }
}
