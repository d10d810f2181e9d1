//! YUV-limited interpolation.
//!
//! Interpolates in BT.709 YUV with an explicit per-step cap on the
//! luminance delta: chroma scales down with luma whenever the cap
//! engages, so hue stays stable through fast brightness changes. The
//! RGB view is memoized per step.

use crate::color::{bt709_to_rgb, rgb_to_bt709};

use super::Interpolator;

/// Channel distance below which the color snaps to target.
const FINISH_THRESHOLD: f32 = 0.5 / 255.0;

pub struct YuvInterpolator {
    initial_duration: f32,
    max_luminance_step: f32,
    smoothing_factor: f32,
    start_time_ms: f32,
    target_time_ms: f32,
    last_update_ms: f32,
    current_yuv: Vec<[f32; 3]>,
    target_yuv: Vec<[f32; 3]>,
    target_rgb: Vec<[f32; 3]>,
    /// Memoized RGB view of `current_yuv`.
    current_rgb: Option<Vec<[f32; 3]>>,
    complete: bool,
}

impl YuvInterpolator {
    pub fn new() -> Self {
        Self {
            initial_duration: 150.0,
            max_luminance_step: 0.02,
            smoothing_factor: 0.0,
            start_time_ms: 0.0,
            target_time_ms: 0.0,
            last_update_ms: 0.0,
            current_yuv: Vec::new(),
            target_yuv: Vec::new(),
            target_rgb: Vec::new(),
            current_rgb: None,
            complete: true,
        }
    }

    pub fn set_max_luminance_change_per_step(&mut self, max_step: f32) {
        self.max_luminance_step = max_step.max(0.0);
    }

    pub fn set_smoothing_factor(&mut self, factor: f32) {
        self.smoothing_factor = factor.clamp(0.0, 1.0);
    }
}

impl Default for YuvInterpolator {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpolator for YuvInterpolator {
    fn set_transition_duration(&mut self, duration_ms: f32) {
        self.initial_duration = duration_ms.max(1.0);
    }

    fn reset_to_colors(&mut self, colors: Vec<[f32; 3]>, now_ms: f32) {
        self.current_yuv.clear();
        self.set_target_colors(colors, now_ms);
    }

    fn set_target_colors(&mut self, targets: Vec<[f32; 3]>, now_ms: f32) {
        if targets.is_empty() {
            return;
        }

        let delta = if !self.complete {
            (now_ms - self.last_update_ms).max(0.0)
        } else {
            0.0
        };
        let start_ms = now_ms - delta;

        let mut targets = targets;
        if self.smoothing_factor > 0.0 && self.target_rgb.len() == targets.len() {
            let inv = 1.0 - self.smoothing_factor;
            for (new, old) in targets.iter_mut().zip(self.target_rgb.iter()) {
                for ch in 0..3 {
                    new[ch] = old[ch] * self.smoothing_factor + new[ch] * inv;
                }
            }
        }

        self.target_rgb = targets.clone();
        let yuv_targets: Vec<[f32; 3]> = targets.into_iter().map(rgb_to_bt709).collect();

        if self.current_yuv.len() != yuv_targets.len() || self.target_yuv.len() != yuv_targets.len()
        {
            self.last_update_ms = start_ms;
            self.current_yuv = yuv_targets.clone();
            self.target_yuv = yuv_targets;
            self.complete = true;
        } else {
            self.target_yuv = yuv_targets;
            self.complete = false;
        }

        self.start_time_ms = start_ms;
        self.target_time_ms = start_ms + self.initial_duration;
        self.current_rgb = None;
    }

    fn update_current_colors(&mut self, now_ms: f32) {
        if self.complete {
            return;
        }

        let remaining = self.target_time_ms - now_ms;
        let total = self.target_time_ms - self.start_time_ms;
        let k = (1.0 - remaining / total).clamp(1e-4, 1.0);
        self.last_update_ms = now_ms;

        self.complete = true;
        for (cur, tgt) in self.current_yuv.iter_mut().zip(self.target_yuv.iter()) {
            let diff = [tgt[0] - cur[0], tgt[1] - cur[1], tgt[2] - cur[2]];
            let max_diff = diff.iter().fold(0.0f32, |m, d| m.max(d.abs()));

            if max_diff < FINISH_THRESHOLD {
                *cur = *tgt;
                continue;
            }

            if self.max_luminance_step == 0.0 {
                for ch in 0..3 {
                    cur[ch] += k * diff[ch];
                }
            } else {
                let mut scale = k;
                let mut step_y = k * diff[0];
                if step_y.abs() > self.max_luminance_step {
                    let unclamped = step_y;
                    step_y = self.max_luminance_step.copysign(step_y);
                    scale = (step_y / unclamped).abs() * k;
                }
                cur[0] += step_y;
                for ch in 1..3 {
                    cur[ch] += scale * diff[ch];
                }
            }
            self.complete = false;
        }

        self.current_rgb = None;
    }

    fn current_colors(&self) -> Vec<[f32; 3]> {
        if let Some(rgb) = &self.current_rgb {
            return rgb.clone();
        }
        if self.complete {
            return self.target_rgb.clone();
        }
        self.current_yuv
            .iter()
            .map(|yuv| {
                let rgb = bt709_to_rgb(*yuv);
                [
                    rgb[0].clamp(0.0, 1.0),
                    rgb[1].clamp(0.0, 1.0),
                    rgb[2].clamp(0.0, 1.0),
                ]
            })
            .collect()
    }

    fn is_animation_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luminance_step_is_capped() {
        let mut it = YuvInterpolator::new();
        it.set_max_luminance_change_per_step(0.02);
        it.set_transition_duration(10.0);
        it.reset_to_colors(vec![[0.0; 3]], 0.0);
        it.set_target_colors(vec![[1.0; 3]], 0.0);

        // One big step at the deadline: k=1, wanted delta-Y is 1.0, the
        // cap keeps it at 0.02.
        it.update_current_colors(10.0);
        let y = it.current_yuv[0][0];
        assert!((y - 0.02).abs() < 1e-6, "y = {y}");
    }

    #[test]
    fn uncapped_mode_steps_proportionally() {
        let mut it = YuvInterpolator::new();
        it.set_max_luminance_change_per_step(0.0);
        it.set_transition_duration(100.0);
        it.reset_to_colors(vec![[0.0; 3]], 0.0);
        it.set_target_colors(vec![[1.0; 3]], 0.0);

        it.update_current_colors(50.0);
        let y = it.current_yuv[0][0];
        assert!((y - 0.5).abs() < 1e-3);
    }

    #[test]
    fn chroma_scales_with_capped_luma() {
        let mut it = YuvInterpolator::new();
        it.set_max_luminance_change_per_step(0.02);
        it.set_transition_duration(10.0);
        it.reset_to_colors(vec![[0.0; 3]], 0.0);
        // Saturated red target: non-zero chroma.
        it.set_target_colors(vec![[1.0, 0.0, 0.0]], 0.0);

        it.update_current_colors(10.0);
        let yuv = it.current_yuv[0];
        let target = rgb_to_bt709([1.0, 0.0, 0.0]);
        // Chroma advanced by the same ratio as luma: hue preserved.
        let luma_ratio = yuv[0] / target[0];
        let v_ratio = yuv[2] / target[2];
        assert!((luma_ratio - v_ratio).abs() < 1e-4);
    }

    #[test]
    fn rgb_view_is_clamped_and_converges() {
        let mut it = YuvInterpolator::new();
        it.set_max_luminance_change_per_step(0.1);
        it.set_transition_duration(50.0);
        it.reset_to_colors(vec![[0.2, 0.4, 0.9]], 0.0);
        it.set_target_colors(vec![[0.9, 0.1, 0.3]], 0.0);

        let mut t = 0.0;
        while !it.is_animation_complete() && t < 10_000.0 {
            t += 10.0;
            it.update_current_colors(t);
            for c in it.current_colors() {
                for ch in c {
                    assert!((0.0..=1.0).contains(&ch));
                }
            }
        }
        let c = it.current_colors()[0];
        assert!((c[0] - 0.9).abs() < 5e-3 && (c[1] - 0.1).abs() < 5e-3 && (c[2] - 0.3).abs() < 5e-3);
    }
}
