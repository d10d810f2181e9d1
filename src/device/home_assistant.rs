//! Home Assistant REST lamp driver.
//!
//! Each frame maps LED colors onto configured lamps through
//! `light/turn_on` service calls. Brightness is either pinned
//! (`constantBrightness`) or follows the content, with a periodic
//! resend so lamps that drop state converge again. Original lamp states
//! can be snapshotted at power-on and replayed at power-off.

use log::{debug, error, warn};
use serde_json::{json, Value};
use tokio::runtime::Handle;

use crate::color::{luma709, rgb_to_hsl};
use crate::engine::clock;
use crate::image::ColorRgb;
use crate::net::RestApi;

use super::{DeviceError, DeviceResult, LedDriver};

const DEFAULT_API_PORT: u16 = 8123;
/// Cached brightness is resent after this much silence.
const BRIGHTNESS_REFRESH_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb,
    Hs,
}

struct Lamp {
    name: String,
    mode: ColorMode,
    /// Last brightness sent; <= 0 means off.
    current_brightness: i32,
    saved_state: Option<Value>,
}

/// Decide whether this frame must carry a brightness field.
/// Mirrors the lamp-side state machine: dynamic mode always sends,
/// constant mode only on on/off edges or when the refresh is due.
fn brightness_update(
    constant: u8,
    current: &mut i32,
    computed: u8,
    refresh_due: bool,
) -> Option<u8> {
    if constant == 0 {
        *current = computed as i32;
        return Some(computed);
    }
    if *current <= 0 && computed > 0 {
        *current = constant as i32;
        return Some(constant);
    }
    if *current > 0 && computed == 0 {
        *current = 0;
        return Some(0);
    }
    if refresh_due && *current > 0 {
        return Some(*current as u8);
    }
    None
}

/// Service-call body for one lamp and color.
fn lamp_payload(
    name: &str,
    mode: ColorMode,
    color: ColorRgb,
    transition_ms: u32,
    brightness: Option<u8>,
) -> Value {
    let mut row = json!({ "entity_id": name });
    if transition_ms > 0 {
        row["transition"] = json!(transition_ms as f64 / 1000.0);
    }
    match mode {
        ColorMode::Rgb => {
            row["rgb_color"] = json!([color.red, color.green, color.blue]);
        }
        ColorMode::Hs => {
            let (h, s, _) = rgb_to_hsl(color.red, color.green, color.blue);
            row["hs_color"] = json!([h, (s * 100.0).round() as u32]);
        }
    }
    if let Some(b) = brightness {
        row["brightness"] = json!(b);
    }
    row
}

/// Content brightness for a color, per mode.
fn computed_brightness(mode: ColorMode, color: ColorRgb) -> u8 {
    match mode {
        ColorMode::Rgb => luma709(color.red, color.green, color.blue),
        ColorMode::Hs => {
            let (_, _, l) = rgb_to_hsl(color.red, color.green, color.blue);
            (l * 255.0).round().clamp(0.0, 255.0) as u8
        }
    }
}

pub struct HomeAssistantDriver {
    runtime: Handle,
    rest: Option<RestApi>,
    lamps: Vec<Lamp>,
    transition_ms: u32,
    constant_brightness: u8,
    restore_state: bool,
    last_brightness_update_ms: i64,
}

impl HomeAssistantDriver {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            rest: None,
            lamps: Vec::new(),
            transition_ms: 0,
            constant_brightness: 255,
            restore_state: false,
            last_brightness_update_ms: 0,
        }
    }

    fn power_on_off(&mut self, is_on: bool) -> DeviceResult<()> {
        let rest = self.rest.as_ref().ok_or(DeviceError::NotReady)?;
        let entities: Vec<&str> = self.lamps.iter().map(|l| l.name.as_str()).collect();
        let body = json!({ "entity_id": entities }).to_string();
        let service = if is_on { "turn_on" } else { "turn_off" };
        let response = rest.post(&format!("/api/services/light/{service}"), body);
        if response.is_error() {
            return Err(DeviceError::Io(response.error_reason()));
        }
        Ok(())
    }

    fn save_states(&mut self) -> DeviceResult<()> {
        let rest = self.rest.as_ref().ok_or(DeviceError::NotReady)?;
        for lamp in &mut self.lamps {
            let response = rest.get(&format!("/api/states/{}", lamp.name));
            if response.is_error() {
                return Err(DeviceError::Io(response.error_reason()));
            }
            if response.body.is_object() {
                lamp.saved_state = Some(response.body.clone());
            } else {
                error!("current state of light {} is unknown", lamp.name);
            }
        }
        Ok(())
    }

    fn restore_states(&mut self) {
        let Some(rest) = self.rest.as_ref() else {
            return;
        };
        for lamp in &self.lamps {
            let Some(saved) = &lamp.saved_state else {
                continue;
            };
            let was_on = saved["state"]
                .as_str()
                .is_some_and(|s| s.eq_ignore_ascii_case("on"));
            let body = if was_on {
                let mut row = json!({ "entity_id": lamp.name });
                if let Some(bri) = saved["attributes"]["brightness"].as_u64() {
                    row["brightness"] = json!(bri);
                }
                row.to_string()
            } else {
                json!({ "entity_id": lamp.name }).to_string()
            };
            let service = if was_on { "turn_on" } else { "turn_off" };
            let response = rest.post(&format!("/api/services/light/{service}"), body);
            if response.is_error() {
                warn!(
                    "restoring light {} failed: {}",
                    lamp.name,
                    response.error_reason()
                );
            }
        }
    }
}

impl LedDriver for HomeAssistantDriver {
    fn name(&self) -> &str {
        "home_assistant"
    }

    fn init(&mut self, config: &Value) -> DeviceResult<()> {
        let host = config["homeAssistantHost"]
            .as_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DeviceError::Config("no Home Assistant host".to_string()))?;
        let token = config["longLivedAccessToken"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DeviceError::Config("no access token".to_string()))?;

        let mut parts = host.splitn(2, ':');
        let hostname = parts.next().unwrap_or_default();
        let port = parts
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_API_PORT);

        let mut rest = RestApi::new(self.runtime.clone(), hostname, port);
        rest.add_header("Authorization", &format!("Bearer {token}"));
        self.rest = Some(rest);

        self.transition_ms = config["transition"].as_u64().unwrap_or(0) as u32;
        self.constant_brightness = config["constantBrightness"].as_u64().unwrap_or(255) as u8;
        self.restore_state = config["restoreOriginalState"].as_bool().unwrap_or(false);

        self.lamps = config["lamps"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|lamp| {
                        let name = lamp["name"].as_str()?.to_string();
                        let mode = match lamp["colorModel"].as_u64().unwrap_or(0) {
                            1 => ColorMode::Hs,
                            _ => ColorMode::Rgb,
                        };
                        debug!("configured lamp ({mode:?}): {name}");
                        Some(Lamp {
                            name,
                            mode,
                            current_brightness: self.constant_brightness as i32,
                            saved_state: None,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        if self.lamps.is_empty() {
            return Err(DeviceError::Config("no lamps configured".to_string()));
        }
        Ok(())
    }

    fn open(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn power_on(&mut self) -> DeviceResult<()> {
        if self.restore_state {
            self.save_states()?;
        }
        // Make the first frame resend brightness immediately.
        self.last_brightness_update_ms = clock::now_ms() - BRIGHTNESS_REFRESH_MS + 1000;
        self.power_on_off(true)
    }

    fn power_off(&mut self) -> DeviceResult<()> {
        if self.restore_state {
            self.restore_states();
            return Ok(());
        }
        self.power_on_off(false)
    }

    fn write(&mut self, values: &[ColorRgb]) -> DeviceResult<()> {
        let now = clock::now_ms();
        let refresh_due = now - self.last_brightness_update_ms >= BRIGHTNESS_REFRESH_MS;
        if refresh_due {
            self.last_brightness_update_ms = now;
        }

        let constant = self.constant_brightness;
        let transition = self.transition_ms;

        let mut requests = Vec::with_capacity(self.lamps.len());
        for (lamp, color) in self.lamps.iter_mut().zip(values.iter()) {
            let computed = computed_brightness(lamp.mode, *color);
            let brightness = brightness_update(
                constant,
                &mut lamp.current_brightness,
                computed,
                refresh_due,
            );
            requests.push(
                lamp_payload(&lamp.name, lamp.mode, *color, transition, brightness).to_string(),
            );
        }

        let rest = self.rest.as_ref().ok_or(DeviceError::NotReady)?;
        for body in requests {
            let response = rest.post("/api/services/light/turn_on", body);
            if response.is_error() {
                return Err(DeviceError::Io(response.error_reason()));
            }
        }
        Ok(())
    }

    /// REST lamps need generous spacing; the service calls themselves
    /// rate-limit the effective frame rate.
    fn latch_time_ms(&self) -> u64 {
        100
    }
}
