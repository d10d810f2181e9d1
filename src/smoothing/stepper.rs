//! Four-band stepper interpolation.
//!
//! Time progress `k` is raised to a per-band exponent selected by the
//! magnitude of the remaining delta: small deltas use gentler bands
//! (anti-flicker), large deltas snap with the raw progress.

use super::Interpolator;

/// Channel distance below which the color snaps to target.
const FINISH_THRESHOLD: f32 = 0.2 / 255.0;

/// Band limits over the remaining per-channel distance.
const LIMITS: [f32; 3] = [16.0 / 255.0, 32.0 / 255.0, 60.0 / 255.0];
/// Exponents applied to progress, largest band first.
const EXPONENTS: [f32; 4] = [1.0, 0.9, 0.75, 0.6];

pub struct StepperInterpolator {
    initial_duration: f32,
    start_time_ms: f32,
    target_time_ms: f32,
    last_update_ms: f32,
    current: Vec<[f32; 3]>,
    target: Vec<[f32; 3]>,
    complete: bool,
}

impl StepperInterpolator {
    pub fn new() -> Self {
        Self {
            initial_duration: 150.0,
            start_time_ms: 0.0,
            target_time_ms: 0.0,
            last_update_ms: 0.0,
            current: Vec::new(),
            target: Vec::new(),
            complete: true,
        }
    }
}

impl Default for StepperInterpolator {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpolator for StepperInterpolator {
    fn set_transition_duration(&mut self, duration_ms: f32) {
        self.initial_duration = duration_ms.max(1.0);
    }

    fn reset_to_colors(&mut self, colors: Vec<[f32; 3]>, now_ms: f32) {
        self.current.clear();
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

        if self.current.len() != targets.len() || self.target.len() != targets.len() {
            self.last_update_ms = start_ms;
            self.current = targets.clone();
            self.target = targets;
            self.complete = true;
        } else {
            self.target = targets;
            self.complete = false;
        }

        self.start_time_ms = start_ms;
        self.target_time_ms = start_ms + self.initial_duration;
    }

    fn update_current_colors(&mut self, now_ms: f32) {
        if self.complete {
            return;
        }

        let remaining = self.target_time_ms - now_ms;
        let total = self.target_time_ms - self.start_time_ms;
        let k = (1.0 - remaining / total).clamp(1e-4, 1.0);
        self.last_update_ms = now_ms;

        let aspect: Vec<f32> = EXPONENTS.iter().map(|e| k.powf(*e).min(1.0)).collect();

        self.complete = true;
        for (cur, tgt) in self.current.iter_mut().zip(self.target.iter()) {
            let diff = [tgt[0] - cur[0], tgt[1] - cur[1], tgt[2] - cur[2]];
            let max_diff = diff.iter().fold(0.0f32, |m, d| m.max(d.abs()));

            if max_diff < FINISH_THRESHOLD {
                *cur = *tgt;
                continue;
            }

            let band = if max_diff < LIMITS[0] {
                3
            } else if max_diff < LIMITS[1] {
                2
            } else if max_diff < LIMITS[2] {
                1
            } else {
                0
            };
            for ch in 0..3 {
                cur[ch] = (cur[ch] + aspect[band] * diff[ch]).clamp(0.0, 1.0);
            }
            self.complete = false;
        }
    }

    fn current_colors(&self) -> Vec<[f32; 3]> {
        self.current.clone()
    }

    fn is_animation_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snaps_large_deltas_faster_than_small_ones() {
        let mut it = StepperInterpolator::new();
        it.set_transition_duration(100.0);
        // LED 0: large delta (1.0). LED 1: small delta (0.05).
        it.reset_to_colors(vec![[0.0; 3], [0.0; 3]], 0.0);
        it.set_target_colors(vec![[1.0; 3], [0.05; 3]], 0.0);

        it.update_current_colors(50.0);
        let colors = it.current_colors();
        let large_progress = colors[0][0] / 1.0;
        let small_progress = colors[1][0] / 0.05;
        // The small delta uses a gentler exponent: k^0.6 > k^1.0 at k=0.5,
        // so relatively it actually moves faster, but the absolute step
        // stays tiny, which is the anti-flicker property.
        assert!(colors[0][0] - colors[1][0] > 0.3);
        assert!(small_progress >= large_progress);
    }

    #[test]
    fn finishes_at_duration_end() {
        let mut it = StepperInterpolator::new();
        it.set_transition_duration(100.0);
        it.reset_to_colors(vec![[0.2; 3]], 0.0);
        it.set_target_colors(vec![[0.9; 3]], 0.0);

        // k = 1 at the deadline: everything snaps onto the target, and
        // the following update observes the zero delta and completes.
        it.update_current_colors(100.0);
        for ch in it.current_colors()[0] {
            assert!((ch - 0.9).abs() < 1e-5);
        }
        it.update_current_colors(110.0);
        assert!(it.is_animation_complete());
    }

    #[test]
    fn tiny_deltas_complete_immediately() {
        let mut it = StepperInterpolator::new();
        it.reset_to_colors(vec![[0.5; 3]], 0.0);
        it.set_target_colors(vec![[0.5 + 0.1 / 255.0; 3]], 0.0);
        it.update_current_colors(10.0);
        assert!(it.is_animation_complete());
    }

    #[test]
    fn size_change_teleports() {
        let mut it = StepperInterpolator::new();
        it.reset_to_colors(vec![[0.0; 3]], 0.0);
        it.set_target_colors(vec![[1.0; 3], [0.5; 3]], 0.0);
        assert!(it.is_animation_complete());
        assert_eq!(it.current_colors().len(), 2);
    }
}
