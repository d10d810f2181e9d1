//! Zigbee2mqtt driver.
//!
//! Publishes per-lamp color state to `zigbee2mqtt/<name>/set` and
//! paces itself on the lamps' state echoes: the next frame waits until
//! every lamp reported back or a fixed budget elapsed, whichever comes
//! first. Without that gate a fast source floods the Zigbee mesh.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};

use crate::color::{luma709, rgb_to_hsl};
use crate::image::ColorRgb;

use super::{DeviceError, DeviceResult, LedDriver};

/// Ack-wait budget per frame.
const ACK_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb,
    Hs,
}

struct Lamp {
    name: String,
    mode: ColorMode,
}

/// `/set` body for one lamp and color.
fn lamp_payload(
    mode: ColorMode,
    color: ColorRgb,
    transition_ms: u32,
    constant_brightness: u8,
) -> Value {
    let mut row = json!({});
    if transition_ms > 0 {
        row["transition"] = json!(transition_ms as f64 / 1000.0);
    }
    let mut brightness = match mode {
        ColorMode::Rgb => {
            row["color"] = json!({
                "r": color.red,
                "g": color.green,
                "b": color.blue,
            });
            luma709(color.red, color.green, color.blue)
        }
        ColorMode::Hs => {
            let (h, s, l) = rgb_to_hsl(color.red, color.green, color.blue);
            row["color"] = json!({
                "hue": h,
                "saturation": (s * 100.0).round() as u32,
            });
            (l * 255.0).round().clamp(0.0, 255.0) as u8
        }
    };
    if brightness > 0 && constant_brightness > 0 {
        brightness = constant_brightness;
    }
    row["brightness"] = json!(brightness);
    row
}

/// Pending-ack latch shared with the connection thread.
#[derive(Default)]
struct AckGate {
    pending: Mutex<usize>,
    settled: Condvar,
}

impl AckGate {
    fn arm(&self, count: usize) {
        *self.pending.lock() = count;
    }

    fn acknowledge(&self) {
        let mut pending = self.pending.lock();
        if *pending > 0 {
            *pending -= 1;
            if *pending == 0 {
                self.settled.notify_all();
            }
        }
    }

    /// Wait until all acks arrived or the budget elapsed. Returns the
    /// number of lamps that never answered.
    fn wait(&self, budget: Duration) -> usize {
        let mut pending = self.pending.lock();
        if *pending > 0 {
            self.settled.wait_for(&mut pending, budget);
        }
        let left = *pending;
        *pending = 0;
        left
    }
}

pub struct MqttDriver {
    lamps: Vec<Lamp>,
    transition_ms: u32,
    constant_brightness: u8,
    host: String,
    port: u16,
    username: String,
    password: String,
    client: Option<Client>,
    connection_thread: Option<JoinHandle<()>>,
    gate: Arc<AckGate>,
}

impl MqttDriver {
    pub fn new() -> Self {
        Self {
            lamps: Vec::new(),
            transition_ms: 0,
            constant_brightness: 0,
            host: String::new(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client: None,
            connection_thread: None,
            gate: Arc::new(AckGate::default()),
        }
    }
}

impl Default for MqttDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LedDriver for MqttDriver {
    fn name(&self) -> &str {
        "zigbee2mqtt"
    }

    fn init(&mut self, config: &Value) -> DeviceResult<()> {
        self.host = config["mqttHost"]
            .as_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DeviceError::Config("no MQTT broker host".to_string()))?
            .to_string();
        self.port = config["mqttPort"].as_u64().unwrap_or(1883) as u16;
        self.username = config["mqttUsername"].as_str().unwrap_or_default().to_string();
        self.password = config["mqttPassword"].as_str().unwrap_or_default().to_string();
        self.transition_ms = config["transition"].as_u64().unwrap_or(0) as u32;
        self.constant_brightness = config["constantBrightness"].as_u64().unwrap_or(0) as u8;

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
                        Some(Lamp { name, mode })
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
        let mut options = MqttOptions::new("glowstream", self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(5));
        if !self.username.is_empty() {
            options.set_credentials(self.username.clone(), self.password.clone());
        }

        let (client, mut connection) = Client::new(options, 16);

        // Lamp state echoes arrive on the bare device topics.
        for lamp in &self.lamps {
            client
                .subscribe(format!("zigbee2mqtt/{}", lamp.name), QoS::AtMostOnce)
                .map_err(|e| DeviceError::Io(e.to_string()))?;
        }

        let gate = self.gate.clone();
        self.connection_thread = Some(
            thread::Builder::new()
                .name("zigbee2mqtt-link".to_string())
                .spawn(move || {
                    for event in connection.iter() {
                        match event {
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                if !publish.topic.ends_with("/set") {
                                    gate.acknowledge();
                                }
                            }
                            Ok(_) => {}
                            Err(err) => {
                                debug!("MQTT connection ended: {err}");
                                break;
                            }
                        }
                    }
                })
                .expect("spawn MQTT connection thread"),
        );

        info!("MQTT link to {}:{} established", self.host, self.port);
        self.client = Some(client);
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect();
        }
        if let Some(handle) = self.connection_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn power_on(&mut self) -> DeviceResult<()> {
        self.publish_state(true)
    }

    fn power_off(&mut self) -> DeviceResult<()> {
        self.publish_state(false)
    }

    fn write(&mut self, values: &[ColorRgb]) -> DeviceResult<()> {
        let client = self.client.as_mut().ok_or(DeviceError::NotReady)?;
        let count = values.len().min(self.lamps.len());
        self.gate.arm(count);

        for (lamp, color) in self.lamps.iter().zip(values.iter()) {
            let payload = lamp_payload(
                lamp.mode,
                *color,
                self.transition_ms,
                self.constant_brightness,
            );
            client
                .publish(
                    format!("zigbee2mqtt/{}/set", lamp.name),
                    QoS::AtMostOnce,
                    false,
                    payload.to_string(),
                )
                .map_err(|e| DeviceError::Io(e.to_string()))?;
        }

        let unanswered = self.gate.wait(ACK_TIMEOUT);
        if unanswered > 0 {
            warn!(
                "{} of {} lamps did not confirm within {:?}",
                unanswered,
                count,
                ACK_TIMEOUT
            );
        }
        Ok(())
    }

    fn latch_time_ms(&self) -> u64 {
        10
    }
}

impl MqttDriver {
    fn publish_state(&mut self, is_on: bool) -> DeviceResult<()> {
        let client = self.client.as_mut().ok_or(DeviceError::NotReady)?;
        let body = json!({ "state": if is_on { "ON" } else { "OFF" } }).to_string();
        for lamp in &self.lamps {
            client
                .publish(
                    format!("zigbee2mqtt/{}/set", lamp.name),
                    QoS::AtMostOnce,
                    false,
                    body.clone(),
                )
                .map_err(|e| DeviceError::Io(e.to_string()))?;
        }
        Ok(())
    }
}
