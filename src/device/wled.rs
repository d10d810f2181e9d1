//! WLED driver (UDP realtime stream + REST pre-roll).
//!
//! Frames go out as WARLS/DNRGB datagrams; a `/json` handshake learns
//! the stream port and device facts, and the JSON state API flips the
//! live flag around power transitions.

use std::net::UdpSocket;

use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::runtime::Handle;

use crate::image::ColorRgb;
use crate::net::RestApi;

use super::{DeviceError, DeviceResult, LedDriver};

/// LED count fitting one non-chunked datagram.
const MAX_SINGLE_DATAGRAM_LEDS: usize = 490;
/// LEDs per chunk in chunked mode (4-byte header).
const MAX_CHUNK_LEDS: usize = 489;
const DEFAULT_STREAM_PORT: u16 = 21324;
const DEFAULT_API_PORT: u16 = 80;

/// Pack a color vector into WLED datagrams: mode 2 (WARLS-style, one
/// datagram) up to 490 LEDs, mode 4 (DNRGB, offset chunks) above.
pub(crate) fn pack_datagrams(values: &[ColorRgb]) -> Vec<Vec<u8>> {
    if values.len() <= MAX_SINGLE_DATAGRAM_LEDS {
        let mut data = Vec::with_capacity(2 + values.len() * 3);
        data.push(0x02);
        data.push(0xFF);
        for c in values {
            data.extend_from_slice(&[c.red, c.green, c.blue]);
        }
        return vec![data];
    }

    let mut datagrams = Vec::new();
    let mut offset = 0usize;
    while offset < values.len() {
        let chunk = &values[offset..(offset + MAX_CHUNK_LEDS).min(values.len())];
        let mut data = Vec::with_capacity(4 + chunk.len() * 3);
        data.push(0x04);
        data.push(0xFF);
        data.push(((offset >> 8) & 0xFF) as u8);
        data.push((offset & 0xFF) as u8);
        for c in chunk {
            data.extend_from_slice(&[c.red, c.green, c.blue]);
        }
        datagrams.push(data);
        offset += chunk.len();
    }
    datagrams
}

pub struct WledDriver {
    runtime: Handle,
    hostname: String,
    api_port: u16,
    stream_port: u16,
    socket: Option<UdpSocket>,
    rest: Option<RestApi>,
    led_count: usize,
    override_brightness: bool,
    brightness_level: u8,
    restore_config: bool,
    config_backup: Option<Value>,
}

impl WledDriver {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            hostname: String::new(),
            api_port: DEFAULT_API_PORT,
            stream_port: DEFAULT_STREAM_PORT,
            socket: None,
            rest: None,
            led_count: 0,
            override_brightness: true,
            brightness_level: 255,
            restore_config: false,
            config_backup: None,
        }
    }

    /// JSON state body for the live-stream transitions. Power-off with
    /// a stored snapshot replays it instead.
    fn on_off_request(&self, is_on: bool) -> String {
        if !is_on {
            if let Some(backup) = &self.config_backup {
                if self.restore_config {
                    return backup.to_string();
                }
            }
        }
        let mut state = json!({ "on": is_on, "live": is_on });
        if is_on && self.override_brightness {
            state["bri"] = json!(self.brightness_level);
        }
        state.to_string()
    }

    fn connect_stream(&mut self) -> DeviceResult<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((self.hostname.as_str(), self.stream_port))?;
        self.socket = Some(socket);
        Ok(())
    }
}

impl LedDriver for WledDriver {
    fn name(&self) -> &str {
        "wled"
    }

    fn init(&mut self, config: &Value) -> DeviceResult<()> {
        let address = config["host"]
            .as_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DeviceError::Config("no target hostname nor IP defined".to_string()))?;

        let mut parts = address.splitn(2, ':');
        self.hostname = parts.next().unwrap_or_default().to_string();
        self.api_port = parts
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_API_PORT);

        self.led_count = config["currentLedCount"].as_u64().unwrap_or(1) as usize;
        self.override_brightness = config["brightnessMax"].as_bool().unwrap_or(true);
        self.brightness_level = config["brightnessMaxLevel"].as_u64().unwrap_or(255) as u8;
        self.restore_config = config["restoreOriginalState"].as_bool().unwrap_or(false);
        self.config_backup = None;

        let mut rest = RestApi::new(self.runtime.clone(), &self.hostname, self.api_port);
        rest.set_base_path("/json");
        self.rest = Some(rest);

        debug!(
            "wled init: host {} api {} leds {} brightnessMax {} level {}",
            self.hostname, self.api_port, self.led_count, self.override_brightness,
            self.brightness_level
        );
        Ok(())
    }

    fn open(&mut self) -> DeviceResult<()> {
        self.connect_stream()
    }

    fn close(&mut self) -> DeviceResult<()> {
        self.socket = None;
        Ok(())
    }

    fn power_on(&mut self) -> DeviceResult<()> {
        let rest = self.rest.as_ref().ok_or(DeviceError::NotReady)?;

        let response = rest.get("");
        if response.is_error() || response.body.is_null() {
            return Err(DeviceError::Io(format!(
                "WLED config fetch failed: {}",
                response.error_reason()
            )));
        }

        let info = &response.body["info"];
        let leds = info["leds"]["count"].as_u64().unwrap_or(0) as usize;
        let power_limit = info["leds"]["maxpwr"].as_i64().unwrap_or(0);
        let signal = info["wifi"]["signal"].as_i64().unwrap_or(0);
        let udp_port = info["udpport"].as_u64().unwrap_or(self.stream_port as u64) as u16;

        info!(
            "WLED info: wifi {}%{}, leds {}, arch {}, ver {}, udp port {}, power limit {}mA",
            signal,
            if signal < 80 { " (LOW)" } else { "" },
            leds,
            info["arch"].as_str().unwrap_or("?"),
            info["ver"].as_str().unwrap_or("?"),
            udp_port,
            power_limit
        );
        if power_limit > 0 {
            warn!(
                "the WLED power limiter is active ({power_limit} mA); expect clipped brightness \
                 under load"
            );
        }
        if leds != 0 && leds != self.led_count {
            warn!(
                "configured LED count ({}) differs from the WLED device ({})",
                self.led_count, leds
            );
        }

        if self.restore_config {
            let mut state = response.body["state"].clone();
            if state.is_object() {
                state["live"] = json!(false);
                self.config_backup = Some(state);
            }
        }

        if udp_port != self.stream_port {
            self.stream_port = udp_port;
            self.connect_stream()?;
        }

        let rest = self.rest.as_ref().ok_or(DeviceError::NotReady)?;
        let response = rest.put("/state", self.on_off_request(true));
        if response.is_error() {
            return Err(DeviceError::Io(response.error_reason()));
        }
        Ok(())
    }

    fn power_off(&mut self) -> DeviceResult<()> {
        if let Some(rest) = &self.rest {
            let response = rest.put("/state", self.on_off_request(false));
            if response.is_error() {
                return Err(DeviceError::Io(response.error_reason()));
            }
        }
        Ok(())
    }

    fn write(&mut self, values: &[ColorRgb]) -> DeviceResult<()> {
        if values.len() != self.led_count {
            // Strip replacement in flight; adopt the new size.
            self.led_count = values.len();
            return Ok(());
        }
        let socket = self.socket.as_ref().ok_or(DeviceError::NotReady)?;
        for datagram in pack_datagrams(values) {
            socket.send(&datagram)?;
        }
        Ok(())
    }

    fn get_properties(&mut self, _params: &Value) -> DeviceResult<Value> {
        let rest = self.rest.as_ref().ok_or(DeviceError::NotReady)?;
        let response = rest.get("");
        if response.is_error() {
            return Err(DeviceError::Io(response.error_reason()));
        }
        Ok(response.body)
    }
}
