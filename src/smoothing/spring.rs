//! Critically-dampable spring interpolation.
//!
//! Second-order dynamics per channel with semi-implicit Euler
//! integration. Incoming targets can be blended with the previous
//! targets (`smoothing_factor`) to soften rapid retargeting.

use super::Interpolator;

/// Channel distance below which a color counts as arrived.
const FINISH_THRESHOLD: f32 = 1.4e-4;
/// Velocity magnitude below which the spring counts as settled.
const VELOCITY_THRESHOLD: f32 = 5e-4;

pub struct SpringInterpolator {
    initial_duration: f32,
    stiffness: f32,
    damping: f32,
    smoothing_factor: f32,
    last_update_ms: f32,
    current: Vec<[f32; 3]>,
    target: Vec<[f32; 3]>,
    velocity: Vec<[f32; 3]>,
    complete: bool,
}

impl SpringInterpolator {
    pub fn new() -> Self {
        Self {
            initial_duration: 150.0,
            stiffness: 200.0,
            damping: 26.0,
            smoothing_factor: 0.0,
            last_update_ms: 0.0,
            current: Vec::new(),
            target: Vec::new(),
            velocity: Vec::new(),
            complete: true,
        }
    }

    pub fn set_springiness(&mut self, stiffness: f32, damping: f32) {
        self.stiffness = stiffness.max(0.1);
        self.damping = damping.max(0.1);
    }

    pub fn set_smoothing_factor(&mut self, factor: f32) {
        self.smoothing_factor = factor.clamp(0.0, 1.0);
    }
}

impl Default for SpringInterpolator {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpolator for SpringInterpolator {
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

        // Catch up missed wall time so a stalled loop does not turn
        // into a velocity spike on the next step.
        let delta = if !self.complete {
            (now_ms - self.last_update_ms).max(0.0)
        } else {
            0.0
        };
        let start_ms = now_ms - delta;

        if self.current.len() != targets.len() {
            self.last_update_ms = start_ms;
            self.current = targets.clone();
            self.target = targets;
            self.velocity = vec![[0.0; 3]; self.current.len()];
            self.complete = true;
            return;
        }

        if self.smoothing_factor > 0.0 && self.target.len() == targets.len() {
            let inv = 1.0 - self.smoothing_factor;
            for (old, new) in self.target.iter_mut().zip(targets.iter()) {
                for ch in 0..3 {
                    old[ch] = old[ch] * self.smoothing_factor + new[ch] * inv;
                }
            }
        } else {
            self.target = targets;
        }
        self.complete = false;
    }

    fn update_current_colors(&mut self, now_ms: f32) {
        if self.complete {
            return;
        }

        let dt = (now_ms - self.last_update_ms).max(0.001) * 0.001;
        self.last_update_ms = now_ms;

        self.complete = true;
        for ((cur, tgt), vel) in self
            .current
            .iter_mut()
            .zip(self.target.iter())
            .zip(self.velocity.iter_mut())
        {
            let diff = [tgt[0] - cur[0], tgt[1] - cur[1], tgt[2] - cur[2]];
            let max_diff = diff.iter().fold(0.0f32, |m, d| m.max(d.abs()));
            let max_vel = vel.iter().fold(0.0f32, |m, v| m.max(v.abs()));

            if max_diff < FINISH_THRESHOLD && max_vel < VELOCITY_THRESHOLD {
                *cur = *tgt;
                *vel = [0.0; 3];
            } else {
                for ch in 0..3 {
                    let accel = self.stiffness * diff[ch] - self.damping * vel[ch];
                    vel[ch] += accel * dt;
                    cur[ch] += vel[ch] * dt;
                }
                self.complete = false;
            }
        }
    }

    fn current_colors(&self) -> Vec<[f32; 3]> {
        self.current
            .iter()
            .map(|c| [c[0].clamp(0.0, 1.0), c[1].clamp(0.0, 1.0), c[2].clamp(0.0, 1.0)])
            .collect()
    }

    fn is_animation_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_until_settled(it: &mut SpringInterpolator, start_ms: f32) -> f32 {
        let mut t = start_ms;
        while !it.is_animation_complete() && t < 60_000.0 {
            t += 10.0;
            it.update_current_colors(t);
        }
        t
    }

    #[test]
    fn spring_settles_on_target() {
        let mut it = SpringInterpolator::new();
        it.set_springiness(200.0, 26.0);
        it.reset_to_colors(vec![[0.0; 3]], 0.0);
        it.set_target_colors(vec![[1.0, 0.2, 0.6]], 0.0);

        run_until_settled(&mut it, 0.0);
        assert!(it.is_animation_complete());
        let c = it.current_colors()[0];
        assert!((c[0] - 1.0).abs() < 1e-3 && (c[1] - 0.2).abs() < 1e-3 && (c[2] - 0.6).abs() < 1e-3);
    }

    #[test]
    fn termination_requires_low_velocity_too() {
        let mut it = SpringInterpolator::new();
        it.set_springiness(400.0, 5.0); // underdamped: overshoots
        it.reset_to_colors(vec![[0.0; 3]], 0.0);
        it.set_target_colors(vec![[1.0; 3]], 0.0);

        // Step until the position first crosses the target.
        let mut t = 0.0;
        while it.current_colors()[0][0] < 1.0 - 1e-4 && t < 10_000.0 {
            t += 5.0;
            it.update_current_colors(t);
        }
        // Near the target but still moving: not complete.
        assert!(!it.is_animation_complete());
    }

    #[test]
    fn target_smoothing_blends_retargets() {
        let mut it = SpringInterpolator::new();
        it.set_smoothing_factor(0.5);
        it.reset_to_colors(vec![[0.0; 3]], 0.0);
        // The incoming target blends with the previous one:
        // 0.5*0.0 + 0.5*1.0 = 0.5, then 0.5*0.5 + 0.5*0.0 = 0.25.
        it.set_target_colors(vec![[1.0; 3]], 0.0);
        assert!((it.target[0][0] - 0.5).abs() < 1e-6);
        it.set_target_colors(vec![[0.0; 3]], 10.0);
        assert!((it.target[0][0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn reset_clears_velocity() {
        let mut it = SpringInterpolator::new();
        it.reset_to_colors(vec![[0.0; 3]], 0.0);
        it.set_target_colors(vec![[1.0; 3]], 0.0);
        it.update_current_colors(50.0);
        it.update_current_colors(100.0);

        it.reset_to_colors(vec![[0.3; 3]], 100.0);
        assert!(it.is_animation_complete());
        assert_eq!(it.velocity[0], [0.0; 3]);
        let c = it.current_colors()[0];
        assert!((c[0] - 0.3).abs() < 1e-6);
    }
}
