//! Output Calibration
//!
//! Per-channel gamma, saturation/luminance, primary-channel adjustment,
//! temperature correction, brightness compensation, and the backlight
//! floor. Two pipelines exist: the classic HSL-based one and the
//! multilinear primary-weight one; `classic_config` selects between
//! them per calibration instance.

use serde::{Deserialize, Serialize};

use crate::color::{hsl_to_rgb, rgb_to_hsl};
use crate::image::ColorRgb;

fn clamp255(v: u32) -> u8 {
    v.min(255) as u8
}

/// What one primary should appear as on the strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RgbChannelAdjustment {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// Calibration of a single primary (or black/white anchor).
#[derive(Debug, Clone)]
pub struct ChannelCalibration {
    adjustment: RgbChannelAdjustment,
    canonical: RgbChannelAdjustment,
    /// Temperature correction, 255 = neutral.
    correction: u8,
}

impl ChannelCalibration {
    fn new(canonical: (u8, u8, u8)) -> Self {
        let canonical = RgbChannelAdjustment {
            red: canonical.0,
            green: canonical.1,
            blue: canonical.2,
        };
        Self {
            adjustment: canonical,
            canonical,
            correction: 255,
        }
    }

    fn set_adjustment(&mut self, rgb: Option<[u8; 3]>) {
        if let Some([r, g, b]) = rgb {
            self.adjustment = RgbChannelAdjustment {
                red: r,
                green: g,
                blue: b,
            };
        }
    }

    fn set_correction(&mut self, correction: Option<u8>) {
        if let Some(c) = correction {
            self.correction = c;
        }
    }

    /// A channel left at its canonical value is skipped entirely.
    fn is_enabled(&self) -> bool {
        self.adjustment != self.canonical
    }

    fn adjust_r(&self, v: u8) -> u32 {
        v as u32 * self.adjustment.red as u32 / 255
    }

    fn adjust_g(&self, v: u8) -> u32 {
        v as u32 * self.adjustment.green as u32 / 255
    }

    fn adjust_b(&self, v: u8) -> u32 {
        v as u32 * self.adjustment.blue as u32 / 255
    }

    fn correction(&self, v: u8) -> u8 {
        (v as u32 * self.correction as u32 / 255) as u8
    }

    /// Contribution of this primary for the multilinear pipeline:
    /// `weight * adjustment * brightness / 255^2` per channel.
    fn apply(&self, weight: u8, brightness: u8) -> (u32, u32, u32) {
        let f = weight as u32 * brightness as u32;
        (
            f * self.adjustment.red as u32 / 65025,
            f * self.adjustment.green as u32 / 65025,
            f * self.adjustment.blue as u32 / 65025,
        )
    }
}

/// Gamma / saturation / backlight / brightness portion of a calibration.
#[derive(Debug, Clone)]
pub struct ColorSpaceCalibration {
    classic_config: bool,
    saturation_gain: f32,
    luminance_gain: f32,
    luminance_minimum: f32,
    gamma_r: f64,
    gamma_g: f64,
    gamma_b: f64,
    mapping_r: [u8; 256],
    mapping_g: [u8; 256],
    mapping_b: [u8; 256],
    backlight_threshold: u8,
    backlight_colored: bool,
    backlight_enabled: bool,
    brightness: u8,
    brightness_compensation: u8,
    brightness_rgb: u8,
    brightness_cmy: u8,
    brightness_w: u8,
}

impl ColorSpaceCalibration {
    fn new(cfg: &CalibrationConfig) -> Self {
        let mut c = Self {
            classic_config: cfg.classic_config,
            saturation_gain: cfg.saturation_gain as f32,
            luminance_gain: cfg.luminance_gain as f32,
            luminance_minimum: 0.0,
            gamma_r: cfg.gamma_red,
            gamma_g: cfg.gamma_green,
            gamma_b: cfg.gamma_blue,
            mapping_r: [0; 256],
            mapping_g: [0; 256],
            mapping_b: [0; 256],
            backlight_threshold: cfg.backlight_threshold,
            backlight_colored: cfg.backlight_colored,
            backlight_enabled: true,
            brightness: cfg.brightness,
            brightness_compensation: cfg.brightness_compensation,
            brightness_rgb: 0,
            brightness_cmy: 0,
            brightness_w: 0,
        };
        c.initialize_mapping();
        c.update_brightness_components();
        c
    }

    fn initialize_mapping(&mut self) {
        for i in 0..256 {
            let x = i as f64 / 255.0;
            self.mapping_r[i] = (x.powf(self.gamma_r) * 255.0).round().clamp(0.0, 255.0) as u8;
            self.mapping_g[i] = (x.powf(self.gamma_g) * 255.0).round().clamp(0.0, 255.0) as u8;
            self.mapping_b[i] = (x.powf(self.gamma_b) * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }

    fn update_brightness_components(&mut self) {
        let fw = self.brightness_compensation as f64 * 2.0 / 100.0 + 1.0;
        let fcmy = self.brightness_compensation as f64 / 100.0 + 1.0;

        self.brightness_rgb = 0;
        self.brightness_cmy = 0;
        self.brightness_w = 0;

        if self.brightness > 0 {
            let b = self.brightness as f64;
            let b_in = if self.brightness < 50 {
                -0.09 * b + 7.5
            } else {
                -0.04 * b + 5.0
            };

            self.brightness_rgb = (255.0 / b_in).min(255.0).ceil() as u8;
            self.brightness_cmy = (255.0 / (b_in * fcmy)).min(255.0).ceil() as u8;
            self.brightness_w = (255.0 / (b_in * fw)).min(255.0).ceil() as u8;
        }
    }

    pub fn brightness_components(&self) -> (u8, u8, u8) {
        (self.brightness_rgb, self.brightness_cmy, self.brightness_w)
    }

    fn is_brightness_correction_enabled(&self) -> bool {
        self.brightness != 100 || self.brightness_compensation != 100
    }

    fn apply_gamma(&self, red: &mut u8, green: &mut u8, blue: &mut u8) {
        *red = self.mapping_r[*red as usize];
        *green = self.mapping_g[*green as usize];
        *blue = self.mapping_b[*blue as usize];
    }

    fn apply_saturation_luminance(&self, red: &mut u8, green: &mut u8, blue: &mut u8) {
        if self.saturation_gain == 1.0 && self.luminance_gain == 1.0 && self.luminance_minimum == 0.0
        {
            return;
        }

        let (hue, mut saturation, luminance) = rgb_to_hsl(*red, *green, *blue);

        saturation = (saturation * self.saturation_gain).min(1.0);

        let mut l = luminance * self.luminance_gain;
        if l < self.luminance_minimum {
            saturation = 0.0;
            l = self.luminance_minimum;
        }
        let luminance = l.min(1.0);

        let (r, g, b) = hsl_to_rgb(hue, saturation, luminance);
        *red = r;
        *green = g;
        *blue = b;
    }

    fn apply_backlight(&self, red: &mut u8, green: &mut u8, blue: &mut u8) {
        if !self.backlight_enabled || self.backlight_threshold == 0 {
            return;
        }
        let floor = self.backlight_threshold;
        if self.backlight_colored {
            *red = (*red).max(floor);
            *green = (*green).max(floor);
            *blue = (*blue).max(floor);
        } else {
            let min = (*red).min(*green).min(*blue) as i32;
            let max = (*red).max(*green).max(*blue) as i32;
            if (min + max) / 2 < floor as i32 {
                *red = floor;
                *green = floor;
                *blue = floor;
            }
        }
    }

    pub fn set_backlight_enabled(&mut self, enabled: bool) {
        self.backlight_enabled = enabled;
    }
}

/// Full calibration instance: eight primary calibrations plus the
/// colorspace stage. Long-lived; replaced atomically on settings change.
#[derive(Debug, Clone)]
pub struct ColorCalibration {
    id: String,
    black: ChannelCalibration,
    white: ChannelCalibration,
    red: ChannelCalibration,
    green: ChannelCalibration,
    blue: ChannelCalibration,
    cyan: ChannelCalibration,
    magenta: ChannelCalibration,
    yellow: ChannelCalibration,
    colorspace: ColorSpaceCalibration,
}

impl ColorCalibration {
    pub fn from_config(cfg: &CalibrationConfig) -> Self {
        let mut red = ChannelCalibration::new((255, 0, 0));
        let mut green = ChannelCalibration::new((0, 255, 0));
        let mut blue = ChannelCalibration::new((0, 0, 255));
        let mut black = ChannelCalibration::new((0, 0, 0));
        let mut white = ChannelCalibration::new((255, 255, 255));
        let mut cyan = ChannelCalibration::new((0, 255, 255));
        let mut magenta = ChannelCalibration::new((255, 0, 255));
        let mut yellow = ChannelCalibration::new((255, 255, 0));

        black.set_adjustment(cfg.black);
        white.set_adjustment(cfg.white);
        red.set_adjustment(cfg.red);
        green.set_adjustment(cfg.green);
        blue.set_adjustment(cfg.blue);
        cyan.set_adjustment(cfg.cyan);
        magenta.set_adjustment(cfg.magenta);
        yellow.set_adjustment(cfg.yellow);

        red.set_correction(cfg.temperature_red);
        green.set_correction(cfg.temperature_green);
        blue.set_correction(cfg.temperature_blue);

        Self {
            id: cfg.id.clone(),
            black,
            white,
            red,
            green,
            blue,
            cyan,
            magenta,
            yellow,
            colorspace: ColorSpaceCalibration::new(cfg),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_backlight_enabled(&mut self, enabled: bool) {
        self.colorspace.set_backlight_enabled(enabled);
    }

    pub fn calibrate(&self, color: &mut ColorRgb) {
        let mut r = color.red;
        let mut g = color.green;
        let mut b = color.blue;

        if self.colorspace.classic_config {
            self.colorspace.apply_saturation_luminance(&mut r, &mut g, &mut b);
            self.colorspace.apply_gamma(&mut r, &mut g, &mut b);

            if self.red.is_enabled() || self.green.is_enabled() || self.blue.is_enabled() {
                let rr = self.red.adjust_r(r);
                let rg = if r > g { self.red.adjust_g(r - g) } else { 0 };
                let rb = if r > b { self.red.adjust_b(r - b) } else { 0 };

                let gr = if g > r { self.green.adjust_r(g - r) } else { 0 };
                let gg = self.green.adjust_g(g);
                let gb = if g > b { self.green.adjust_b(g - b) } else { 0 };

                let br = if b > r { self.blue.adjust_r(b - r) } else { 0 };
                let bg = if b > g { self.blue.adjust_g(b - g) } else { 0 };
                let bb = self.blue.adjust_b(b);

                r = clamp255((rr + gr + br).min(self.red.adjustment.red as u32));
                g = clamp255((rg + gg + bg).min(self.green.adjustment.green as u32));
                b = clamp255((rb + gb + bb).min(self.blue.adjustment.blue as u32));
            }

            r = self.red.correction(r);
            g = self.green.correction(g);
            b = self.blue.correction(b);
        } else {
            let (b_rgb, b_cmy, b_w) = self.colorspace.brightness_components();
            self.colorspace.apply_gamma(&mut r, &mut g, &mut b);

            let any_channel = self.black.is_enabled()
                || self.red.is_enabled()
                || self.green.is_enabled()
                || self.blue.is_enabled()
                || self.cyan.is_enabled()
                || self.magenta.is_enabled()
                || self.yellow.is_enabled()
                || self.white.is_enabled();

            if !any_channel && !self.colorspace.is_brightness_correction_enabled() {
                if b_rgb != 255 {
                    r = (r as u32 * b_rgb as u32 / 255) as u8;
                    g = (g as u32 * b_rgb as u32 / 255) as u8;
                    b = (b as u32 * b_rgb as u32 / 255) as u8;
                }
            } else {
                // Multilinear decomposition over the RGB unit cube.
                let (ri, gi, bi) = (r as u32, g as u32, b as u32);
                let nrng = (255 - ri) * (255 - gi);
                let rng = ri * (255 - gi);
                let nrg = (255 - ri) * gi;
                let rg_w = ri * gi;

                let w_black = (nrng * (255 - bi) / 65025) as u8;
                let w_red = (rng * (255 - bi) / 65025) as u8;
                let w_green = (nrg * (255 - bi) / 65025) as u8;
                let w_blue = (nrng * bi / 65025) as u8;
                let w_cyan = (nrg * bi / 65025) as u8;
                let w_magenta = (rng * bi / 65025) as u8;
                let w_yellow = (rg_w * (255 - bi) / 65025) as u8;
                let w_white = (rg_w * bi / 65025) as u8;

                let parts = [
                    self.black.apply(w_black, 255),
                    self.red.apply(w_red, b_rgb),
                    self.green.apply(w_green, b_rgb),
                    self.blue.apply(w_blue, b_rgb),
                    self.cyan.apply(w_cyan, b_cmy),
                    self.magenta.apply(w_magenta, b_cmy),
                    self.yellow.apply(w_yellow, b_cmy),
                    self.white.apply(w_white, b_w),
                ];

                let (mut sr, mut sg, mut sb) = (0u32, 0u32, 0u32);
                for (pr, pg, pb) in parts {
                    sr += pr;
                    sg += pg;
                    sb += pb;
                }
                r = clamp255(sr);
                g = clamp255(sg);
                b = clamp255(sb);
            }
        }

        self.colorspace.apply_backlight(&mut r, &mut g, &mut b);

        color.red = r;
        color.green = g;
        color.blue = b;
    }
}

impl Default for ColorCalibration {
    fn default() -> Self {
        Self::from_config(&CalibrationConfig::default())
    }
}

/// One entry of the `color.channelAdjustment` settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CalibrationConfig {
    pub id: String,
    pub black: Option<[u8; 3]>,
    pub white: Option<[u8; 3]>,
    pub red: Option<[u8; 3]>,
    pub green: Option<[u8; 3]>,
    pub blue: Option<[u8; 3]>,
    pub cyan: Option<[u8; 3]>,
    pub magenta: Option<[u8; 3]>,
    pub yellow: Option<[u8; 3]>,
    pub backlight_threshold: u8,
    pub backlight_colored: bool,
    pub brightness: u8,
    pub brightness_compensation: u8,
    pub gamma_red: f64,
    pub gamma_green: f64,
    pub gamma_blue: f64,
    pub temperature_red: Option<u8>,
    pub temperature_green: Option<u8>,
    pub temperature_blue: Option<u8>,
    pub saturation_gain: f64,
    pub luminance_gain: f64,
    #[serde(rename = "classic_config")]
    pub classic_config: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            black: None,
            white: None,
            red: None,
            green: None,
            blue: None,
            cyan: None,
            magenta: None,
            yellow: None,
            backlight_threshold: 0,
            backlight_colored: false,
            brightness: 100,
            brightness_compensation: 100,
            gamma_red: 1.0,
            gamma_green: 1.0,
            gamma_blue: 1.0,
            temperature_red: None,
            temperature_green: None,
            temperature_blue: None,
            saturation_gain: 1.0,
            luminance_gain: 1.0,
            classic_config: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classic_defaults() -> CalibrationConfig {
        CalibrationConfig {
            classic_config: true,
            ..CalibrationConfig::default()
        }
    }

    #[test]
    fn default_calibration_is_identity() {
        for cfg in [CalibrationConfig::default(), classic_defaults()] {
            let calib = ColorCalibration::from_config(&cfg);
            for &(r, g, b) in &[(0u8, 0u8, 0u8), (255, 255, 255), (13, 87, 211), (200, 1, 99)] {
                let mut c = ColorRgb::new(r, g, b);
                calib.calibrate(&mut c);
                assert_eq!(c, ColorRgb::new(r, g, b), "classic={}", cfg.classic_config);
            }
        }
    }

    #[test]
    fn gamma_darkens_midtones() {
        let cfg = CalibrationConfig {
            gamma_red: 2.2,
            gamma_green: 2.2,
            gamma_blue: 2.2,
            classic_config: true,
            ..CalibrationConfig::default()
        };
        let calib = ColorCalibration::from_config(&cfg);
        let mut c = ColorRgb::new(128, 128, 128);
        calib.calibrate(&mut c);
        assert!(c.red < 128 && c.green < 128 && c.blue < 128);
        // Endpoints survive any gamma.
        let mut w = ColorRgb::new(255, 255, 255);
        calib.calibrate(&mut w);
        assert_eq!(w, ColorRgb::new(255, 255, 255));
    }

    #[test]
    fn backlight_colored_floors_channels() {
        let cfg = CalibrationConfig {
            backlight_threshold: 20,
            backlight_colored: true,
            ..CalibrationConfig::default()
        };
        let calib = ColorCalibration::from_config(&cfg);
        let mut c = ColorRgb::new(5, 40, 0);
        calib.calibrate(&mut c);
        assert_eq!((c.red, c.green, c.blue), (20, 40, 20));
    }

    #[test]
    fn backlight_grey_floor_uses_midrange() {
        let cfg = CalibrationConfig {
            backlight_threshold: 30,
            backlight_colored: false,
            ..CalibrationConfig::default()
        };
        let calib = ColorCalibration::from_config(&cfg);
        // (min+max)/2 = 25 < 30: whole pixel floors.
        let mut dark = ColorRgb::new(10, 20, 40);
        calib.calibrate(&mut dark);
        assert_eq!((dark.red, dark.green, dark.blue), (30, 30, 30));
        // (min+max)/2 = 110: untouched.
        let mut bright = ColorRgb::new(20, 100, 200);
        calib.calibrate(&mut bright);
        assert_eq!((bright.red, bright.green, bright.blue), (20, 100, 200));
    }

    #[test]
    fn brightness_components_reference_values() {
        let cfg = CalibrationConfig::default();
        let calib = ColorCalibration::from_config(&cfg);
        assert_eq!(calib.colorspace.brightness_components(), (255, 128, 85));
    }

    #[test]
    fn brightness_compensation_dims_white_harder_than_red() {
        let cfg = CalibrationConfig {
            brightness: 50,
            ..CalibrationConfig::default()
        };
        let calib = ColorCalibration::from_config(&cfg);
        // B_in = 3.0: rgb 85, cmy 43, w 29.
        assert_eq!(calib.colorspace.brightness_components(), (85, 43, 29));

        let mut red = ColorRgb::new(255, 0, 0);
        calib.calibrate(&mut red);
        assert_eq!((red.red, red.green, red.blue), (85, 0, 0));

        let mut white = ColorRgb::new(255, 255, 255);
        calib.calibrate(&mut white);
        assert_eq!((white.red, white.green, white.blue), (29, 29, 29));
    }

    #[test]
    fn saturation_gain_saturates_in_classic_mode() {
        let cfg = CalibrationConfig {
            saturation_gain: 2.0,
            classic_config: true,
            ..CalibrationConfig::default()
        };
        let calib = ColorCalibration::from_config(&cfg);
        let mut c = ColorRgb::new(180, 120, 120);
        let (_, s_before, _) = rgb_to_hsl(180, 120, 120);
        calib.calibrate(&mut c);
        let (_, s_after, _) = rgb_to_hsl(c.red, c.green, c.blue);
        assert!(s_after > s_before);
    }
}
