//! Temporal Smoothing
//!
//! Animates the output vector toward the visible source's target
//! vector. One interpolator family runs per engine instance, chosen by
//! the active smoothing configuration; families share the
//! [`Interpolator`] contract so the engine loop is family-agnostic.

mod hybrid;
mod linear;
mod spring;
mod stepper;
mod yuv;

pub use hybrid::HybridInterpolator;
pub use linear::LinearInterpolator;
pub use spring::SpringInterpolator;
pub use stepper::StepperInterpolator;
pub use yuv::YuvInterpolator;

use serde::{Deserialize, Serialize};

/// Contract shared by all interpolator families. Time is passed in
/// explicitly (milliseconds) so the engine clock stays the single
/// source of truth and tests can drive animations deterministically.
pub trait Interpolator: Send {
    fn set_transition_duration(&mut self, duration_ms: f32);

    /// Interrupt the current animation and re-anchor at `now_ms`.
    fn set_target_colors(&mut self, targets: Vec<[f32; 3]>, now_ms: f32);

    /// Advance the animation state.
    fn update_current_colors(&mut self, now_ms: f32);

    /// Current vector, clamped to `[0,1]`.
    fn current_colors(&self) -> Vec<[f32; 3]>;

    /// Teleport: current = target = `colors`, velocities cleared.
    fn reset_to_colors(&mut self, colors: Vec<[f32; 3]>, now_ms: f32);

    fn is_animation_complete(&self) -> bool;
}

/// Interpolator family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingFamily {
    #[default]
    Linear,
    Spring,
    Stepper,
    YuvLimited,
    Hybrid,
}

/// One named smoothing configuration, referenced by `smooth_cfg` ids.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub family: SmoothingFamily,
    pub duration_ms: f32,
    /// Target blending `[0,1]`; 0 disables.
    pub smoothing_factor: f32,
    pub stiffness: f32,
    pub damping: f32,
    /// Per-step luminance cap for the YUV family; 0 disables.
    pub max_luminance_step: f32,
    /// Pause smoothing entirely (targets pass through).
    pub pause: bool,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            family: SmoothingFamily::Linear,
            duration_ms: 150.0,
            smoothing_factor: 0.0,
            stiffness: 200.0,
            damping: 26.0,
            max_luminance_step: 0.02,
            pause: false,
        }
    }
}

impl SmoothingConfig {
    /// Build the configured interpolator.
    pub fn build(&self) -> Box<dyn Interpolator> {
        match self.family {
            SmoothingFamily::Linear => {
                let mut it = LinearInterpolator::new();
                it.set_smoothing_factor(self.smoothing_factor);
                it.set_transition_duration(self.duration_ms);
                Box::new(it)
            }
            SmoothingFamily::Spring => {
                let mut it = SpringInterpolator::new();
                it.set_springiness(self.stiffness, self.damping);
                it.set_smoothing_factor(self.smoothing_factor);
                it.set_transition_duration(self.duration_ms);
                Box::new(it)
            }
            SmoothingFamily::Stepper => {
                let mut it = StepperInterpolator::new();
                it.set_transition_duration(self.duration_ms);
                Box::new(it)
            }
            SmoothingFamily::YuvLimited => {
                let mut it = YuvInterpolator::new();
                it.set_max_luminance_change_per_step(self.max_luminance_step);
                it.set_smoothing_factor(self.smoothing_factor);
                it.set_transition_duration(self.duration_ms);
                Box::new(it)
            }
            SmoothingFamily::Hybrid => {
                let mut it = HybridInterpolator::new();
                it.set_springiness(self.stiffness, self.damping);
                it.set_transition_duration(self.duration_ms);
                Box::new(it)
            }
        }
    }
}

/// Registry of named smoothing configurations. Id 0 is the system
/// default; callers (effects, API clients) register their own and refer
/// to them through the muxer's `smooth_cfg` field.
pub struct SmoothingRegistry {
    configs: Vec<SmoothingConfig>,
}

impl SmoothingRegistry {
    pub fn new(system_default: SmoothingConfig) -> Self {
        Self {
            configs: vec![system_default],
        }
    }

    pub fn register(&mut self, config: SmoothingConfig) -> u32 {
        self.configs.push(config);
        (self.configs.len() - 1) as u32
    }

    /// Resolve an id, falling back to the system default for unknown ids.
    pub fn resolve(&self, id: u32) -> SmoothingConfig {
        self.configs
            .get(id as usize)
            .copied()
            .unwrap_or(self.configs[0])
    }

    pub fn update_system_default(&mut self, config: SmoothingConfig) {
        self.configs[0] = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_completes_immediately_for_every_family() {
        let families = [
            SmoothingFamily::Linear,
            SmoothingFamily::Spring,
            SmoothingFamily::Stepper,
            SmoothingFamily::YuvLimited,
            SmoothingFamily::Hybrid,
        ];
        for family in families {
            let cfg = SmoothingConfig {
                family,
                ..SmoothingConfig::default()
            };
            let mut it = cfg.build();
            let colors = vec![[0.25, 0.5, 0.75]];
            it.reset_to_colors(colors.clone(), 0.0);
            assert!(it.is_animation_complete(), "{family:?}");
            let current = it.current_colors();
            for (a, b) in current[0].iter().zip(colors[0].iter()) {
                assert!((a - b).abs() < 1e-5, "{family:?}");
            }
        }
    }

    #[test]
    fn every_family_converges_to_target() {
        let families = [
            SmoothingFamily::Linear,
            SmoothingFamily::Spring,
            SmoothingFamily::Stepper,
            SmoothingFamily::YuvLimited,
            SmoothingFamily::Hybrid,
        ];
        for family in families {
            let cfg = SmoothingConfig {
                family,
                duration_ms: 100.0,
                ..SmoothingConfig::default()
            };
            let mut it = cfg.build();
            it.reset_to_colors(vec![[0.0; 3]], 0.0);
            it.set_target_colors(vec![[1.0, 0.5, 0.25]], 0.0);
            let mut t = 0.0f32;
            while !it.is_animation_complete() && t < 10_000.0 {
                t += 10.0;
                it.update_current_colors(t);
            }
            assert!(it.is_animation_complete(), "{family:?} never converged");
            let current = it.current_colors();
            for (a, b) in current[0].iter().zip([1.0, 0.5, 0.25].iter()) {
                assert!((a - b).abs() < 5e-3, "{family:?}: {current:?}");
            }
        }
    }

    #[test]
    fn registry_resolves_and_falls_back() {
        let mut reg = SmoothingRegistry::new(SmoothingConfig::default());
        let id = reg.register(SmoothingConfig {
            family: SmoothingFamily::Stepper,
            ..SmoothingConfig::default()
        });
        assert_eq!(id, 1);
        assert_eq!(reg.resolve(id).family, SmoothingFamily::Stepper);
        assert_eq!(reg.resolve(999).family, SmoothingFamily::Linear);
    }
}
