//! HDR Auto-Detection
//!
//! Watches per-frame YUV maxima against configured thresholds and
//! toggles tone mapping with a two-sided hysteresis: a breach must hold
//! for `time_on` seconds before tone mapping turns on, and calm must
//! hold for `time_off` milliseconds before it turns off again.

use log::info;

/// YUV trigger thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub y: u8,
    pub u: u8,
    pub v: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        // Just above limited-range video ceilings.
        Self {
            y: 236,
            u: 241,
            v: 241,
        }
    }
}

/// Requested tone-mapping state change, emitted by [`HdrDetector::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneMappingRequest {
    Enable,
    Disable,
}

/// Per-grabber HDR state machine. Rows are scanned before decode; the
/// per-frame verdict is folded in `finalize`, once per frame.
pub struct HdrDetector {
    enabled: bool,
    config: Thresholds,
    peak: Thresholds,
    triggered: bool,
    mode_sdr: bool,
    /// Arming timestamp for HDR-on, seconds.
    started_time_s: Option<i64>,
    /// Arming timestamp for HDR-off, milliseconds.
    ending_time_ms: Option<i64>,
    time_on_s: i64,
    time_off_ms: i64,
}

impl HdrDetector {
    pub fn new() -> Self {
        Self {
            enabled: false,
            config: Thresholds::default(),
            peak: Thresholds::default(),
            triggered: false,
            mode_sdr: true,
            started_time_s: None,
            ending_time_ms: None,
            time_on_s: 30,
            time_off_ms: 500,
        }
    }

    pub fn set_config(
        &mut self,
        enabled: bool,
        thresholds: Thresholds,
        time_on_s: i64,
        time_off_ms: i64,
    ) {
        self.enabled = enabled;
        self.config = thresholds;
        self.peak = thresholds;
        self.time_on_s = time_on_s;
        self.time_off_ms = time_off_ms;
        self.triggered = false;
        info!(
            "HDR detection {}: on after {}s, off after {}ms, thresholds y/u/v {}/{}/{}",
            if enabled { "enabled" } else { "disabled" },
            time_on_s,
            time_off_ms,
            thresholds.y,
            thresholds.u,
            thresholds.v
        );
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// External override (settings change). Resets both timers.
    pub fn set_tone_mapping(&mut self, enabled: bool) {
        self.mode_sdr = !enabled;
        self.started_time_s = None;
        self.ending_time_ms = None;
    }

    /// Scan one YUYV row (4-byte macro-pixels).
    pub fn scan_yuyv(&mut self, row: &[u8]) {
        if !self.enabled || self.triggered {
            return;
        }
        for m in row.chunks_exact(4) {
            let y = m[0].max(m[2]);
            if y > self.config.y || m[1] > self.config.u || m[3] > self.config.v {
                self.peak.y = self.peak.y.max(y);
                self.peak.u = self.peak.u.max(m[1]);
                self.peak.v = self.peak.v.max(m[3]);
                self.triggered = true;
                return;
            }
        }
    }

    /// Scan one dense Y row plus one interleaved 8-bit UV row.
    pub fn scan_y_uv8(&mut self, y_row: &[u8], uv_row: &[u8]) {
        if !self.enabled || self.triggered {
            return;
        }
        for &y in y_row {
            if y > self.config.y {
                self.peak.y = self.peak.y.max(y);
                self.triggered = true;
                return;
            }
        }
        for uv in uv_row.chunks_exact(2) {
            if uv[0] > self.config.u || uv[1] > self.config.v {
                self.peak.u = self.peak.u.max(uv[0]);
                self.peak.v = self.peak.v.max(uv[1]);
                self.triggered = true;
                return;
            }
        }
    }

    /// Scan 16-bit container rows (P010): only high bytes participate.
    pub fn scan_y_uv16(&mut self, y_row: &[u8], uv_row: &[u8]) {
        if !self.enabled || self.triggered {
            return;
        }
        for s in y_row.chunks_exact(2) {
            if s[1] > self.config.y {
                self.peak.y = self.peak.y.max(s[1]);
                self.triggered = true;
                return;
            }
        }
        for s in uv_row.chunks_exact(4) {
            if s[1] > self.config.u || s[3] > self.config.v {
                self.peak.u = self.peak.u.max(s[1]);
                self.peak.v = self.peak.v.max(s[3]);
                self.triggered = true;
                return;
            }
        }
    }

    /// Fold the frame verdict into the hysteresis. Returns a request
    /// when the state flips; the caller forwards it on the
    /// component-state channel.
    pub fn finalize(&mut self, now_ms: i64) -> Option<ToneMappingRequest> {
        if !self.enabled {
            return None;
        }

        let triggered = self.triggered;
        let mut request = None;

        if triggered && self.mode_sdr {
            let now_s = now_ms / 1000;
            match self.started_time_s {
                None => self.started_time_s = Some(now_s),
                Some(started) if started > now_s => self.started_time_s = Some(now_s),
                Some(started) if started + self.time_on_s <= now_s => {
                    self.mode_sdr = false;
                    info!(
                        "tone mapping ON after {}s (peak y/u/v {}/{}/{})",
                        now_s - started,
                        self.peak.y,
                        self.peak.u,
                        self.peak.v
                    );
                    request = Some(ToneMappingRequest::Enable);
                }
                Some(_) => {}
            }
        } else if !triggered && !self.mode_sdr {
            match self.ending_time_ms {
                None => self.ending_time_ms = Some(now_ms),
                Some(ending) if ending > now_ms => self.ending_time_ms = Some(now_ms),
                Some(ending) if ending + self.time_off_ms <= now_ms => {
                    self.mode_sdr = true;
                    info!("tone mapping OFF after {}ms of calm", now_ms - ending);
                    request = Some(ToneMappingRequest::Disable);
                }
                Some(_) => {}
            }
        }

        // A calm frame disarms the on-timer; a breaching frame disarms
        // the off-timer.
        if !triggered {
            self.started_time_s = None;
        } else {
            self.ending_time_ms = None;
        }

        self.triggered = false;
        self.peak = self.config;
        request
    }
}

impl Default for HdrDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(time_on_s: i64, time_off_ms: i64) -> HdrDetector {
        let mut d = HdrDetector::new();
        d.set_config(true, Thresholds::default(), time_on_s, time_off_ms);
        d
    }

    fn breach_frame(d: &mut HdrDetector) {
        // Y above threshold in the first macro-pixel.
        d.scan_yuyv(&[250, 128, 250, 128]);
    }

    fn calm_frame(d: &mut HdrDetector) {
        d.scan_yuyv(&[100, 128, 100, 128]);
    }

    #[test]
    fn continuous_breach_enables_after_time_on() {
        let mut d = detector(2, 500);

        breach_frame(&mut d);
        assert_eq!(d.finalize(0), None); // arms
        breach_frame(&mut d);
        assert_eq!(d.finalize(1000), None);
        breach_frame(&mut d);
        assert_eq!(d.finalize(2000), Some(ToneMappingRequest::Enable));
    }

    #[test]
    fn one_calm_frame_resets_the_arming_timer() {
        let mut d = detector(2, 500);

        breach_frame(&mut d);
        assert_eq!(d.finalize(0), None);
        calm_frame(&mut d);
        assert_eq!(d.finalize(1000), None); // disarmed
        breach_frame(&mut d);
        assert_eq!(d.finalize(2000), None); // re-armed, not elapsed
        breach_frame(&mut d);
        assert_eq!(d.finalize(4000), Some(ToneMappingRequest::Enable));
    }

    #[test]
    fn calm_disables_after_time_off() {
        let mut d = detector(1, 500);
        d.set_tone_mapping(true); // already HDR

        calm_frame(&mut d);
        assert_eq!(d.finalize(10_000), None); // arms
        calm_frame(&mut d);
        assert_eq!(d.finalize(10_400), None);
        calm_frame(&mut d);
        assert_eq!(d.finalize(10_500), Some(ToneMappingRequest::Disable));
    }

    #[test]
    fn breach_mid_calm_resets_off_timer() {
        let mut d = detector(1, 500);
        d.set_tone_mapping(true);

        calm_frame(&mut d);
        assert_eq!(d.finalize(0), None);
        breach_frame(&mut d);
        assert_eq!(d.finalize(200), None); // off-timer disarmed
        calm_frame(&mut d);
        assert_eq!(d.finalize(600), None); // re-armed
        calm_frame(&mut d);
        assert_eq!(d.finalize(1200), Some(ToneMappingRequest::Disable));
    }

    #[test]
    fn disabled_detector_is_silent() {
        let mut d = HdrDetector::new();
        breach_frame(&mut d);
        assert_eq!(d.finalize(0), None);
        assert_eq!(d.finalize(100_000), None);
    }

    #[test]
    fn p010_scan_uses_high_bytes() {
        let mut d = detector(0, 500);
        // Y sample 0xF000 -> high byte 0xF0 = 240 > 236.
        d.scan_y_uv16(&[0x00, 0xF0], &[0, 0, 0, 0]);
        assert_eq!(d.finalize(5000), None); // arms
        d.scan_y_uv16(&[0x00, 0xF0], &[0, 0, 0, 0]);
        assert_eq!(d.finalize(5000), Some(ToneMappingRequest::Enable));
    }
}
