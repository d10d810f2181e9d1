//! Hybrid interpolation: spring on luminance, linear on chroma.
//!
//! Brightness gets the springy, velocity-continuous response while hue
//! and saturation glide linearly, which keeps fast scene changes from
//! ringing in color.

use crate::color::{bt709_to_rgb, rgb_to_bt709};

use super::Interpolator;

const FINISH_THRESHOLD: f32 = 1.4e-4;
const VELOCITY_THRESHOLD: f32 = 5e-4;

pub struct HybridInterpolator {
    initial_duration: f32,
    stiffness: f32,
    damping: f32,
    start_time_ms: f32,
    last_update_ms: f32,
    start_yuv: Vec<[f32; 3]>,
    current_yuv: Vec<[f32; 3]>,
    target_yuv: Vec<[f32; 3]>,
    velocity_y: Vec<f32>,
    complete: bool,
}

impl HybridInterpolator {
    pub fn new() -> Self {
        Self {
            initial_duration: 150.0,
            stiffness: 200.0,
            damping: 26.0,
            start_time_ms: 0.0,
            last_update_ms: 0.0,
            start_yuv: Vec::new(),
            current_yuv: Vec::new(),
            target_yuv: Vec::new(),
            velocity_y: Vec::new(),
            complete: true,
        }
    }

    pub fn set_springiness(&mut self, stiffness: f32, damping: f32) {
        self.stiffness = stiffness.max(0.1);
        self.damping = damping.max(0.1);
    }
}

impl Default for HybridInterpolator {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpolator for HybridInterpolator {
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

        let yuv: Vec<[f32; 3]> = targets.into_iter().map(rgb_to_bt709).collect();

        if self.current_yuv.len() != yuv.len() {
            self.current_yuv = yuv.clone();
            self.start_yuv = yuv.clone();
            self.target_yuv = yuv;
            self.velocity_y = vec![0.0; self.current_yuv.len()];
            self.last_update_ms = now_ms;
            self.start_time_ms = now_ms;
            self.complete = true;
            return;
        }

        self.start_yuv = self.current_yuv.clone();
        self.target_yuv = yuv;
        self.start_time_ms = now_ms;
        self.last_update_ms = now_ms;
        self.complete = false;
    }

    fn update_current_colors(&mut self, now_ms: f32) {
        if self.complete {
            return;
        }

        let dt = (now_ms - self.last_update_ms).max(0.001) * 0.001;
        self.last_update_ms = now_ms;
        let t = ((now_ms - self.start_time_ms) / self.initial_duration).clamp(0.0, 1.0);

        self.complete = true;
        for i in 0..self.current_yuv.len() {
            let tgt = self.target_yuv[i];
            let cur = &mut self.current_yuv[i];

            // Chroma: time-based glide.
            cur[1] = self.start_yuv[i][1] + (tgt[1] - self.start_yuv[i][1]) * t;
            cur[2] = self.start_yuv[i][2] + (tgt[2] - self.start_yuv[i][2]) * t;

            // Luminance: second-order spring.
            let diff_y = tgt[0] - cur[0];
            let vel = &mut self.velocity_y[i];
            if diff_y.abs() < FINISH_THRESHOLD && vel.abs() < VELOCITY_THRESHOLD && t >= 1.0 {
                cur[0] = tgt[0];
                *vel = 0.0;
            } else {
                let accel = self.stiffness * diff_y - self.damping * *vel;
                *vel += accel * dt;
                cur[0] += *vel * dt;
                self.complete = false;
            }
        }
    }

    fn current_colors(&self) -> Vec<[f32; 3]> {
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
    fn luminance_springs_while_chroma_glides() {
        let mut it = HybridInterpolator::new();
        it.set_springiness(400.0, 40.0);
        it.set_transition_duration(100.0);
        it.reset_to_colors(vec![[0.0; 3]], 0.0);
        it.set_target_colors(vec![[1.0, 0.0, 0.0]], 0.0);

        let target = rgb_to_bt709([1.0, 0.0, 0.0]);
        it.update_current_colors(50.0);

        // Chroma is exactly halfway at t = 0.5.
        let yuv = it.current_yuv[0];
        assert!((yuv[1] - target[1] * 0.5).abs() < 1e-4);
        assert!((yuv[2] - target[2] * 0.5).abs() < 1e-4);
        // Luminance follows the spring, not the clock.
        assert!(yuv[0] > 0.0 && yuv[0] != target[0] * 0.5);
    }

    #[test]
    fn settles_completely() {
        let mut it = HybridInterpolator::new();
        it.set_transition_duration(100.0);
        it.reset_to_colors(vec![[0.1, 0.8, 0.3]], 0.0);
        it.set_target_colors(vec![[0.7, 0.2, 0.9]], 0.0);

        let mut t = 0.0;
        while !it.is_animation_complete() && t < 30_000.0 {
            t += 10.0;
            it.update_current_colors(t);
        }
        assert!(it.is_animation_complete());
        let c = it.current_colors()[0];
        for (got, want) in c.iter().zip([0.7, 0.2, 0.9].iter()) {
            assert!((got - want).abs() < 5e-3, "{c:?}");
        }
    }

    #[test]
    fn reset_teleports_and_clears_velocity() {
        let mut it = HybridInterpolator::new();
        it.reset_to_colors(vec![[0.0; 3]], 0.0);
        it.set_target_colors(vec![[1.0; 3]], 0.0);
        it.update_current_colors(20.0);

        it.reset_to_colors(vec![[0.5; 3]], 20.0);
        assert!(it.is_animation_complete());
        assert_eq!(it.velocity_y[0], 0.0);
        let c = it.current_colors()[0];
        for ch in c {
            assert!((ch - 0.5).abs() < 1e-3);
        }
    }
}
