//! Serial driver (Adalight RGB framing).
//!
//! Frames are the classic `Ada` header plus raw RGB payload. Device
//! selection either takes a fixed port or walks the USB descriptor
//! table in preference rounds (known ESP and RP2040 bridges first).
//! The optional ESP handshake waits for the controller's boot banner on
//! open and trades a sleep command for a goodbye line on close.

use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{json, Value};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};

use crate::image::ColorRgb;

use super::{DeviceError, DeviceResult, LedDriver};

const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);
/// Consecutive write timeouts tolerated before declaring the device dead.
const MAX_WRITE_TIMEOUTS: u32 = 20;
/// Boot-banner wait after opening with the ESP handshake on.
const BOOT_BANNER_WAIT: Duration = Duration::from_millis(500);
/// Goodbye-line budget at close.
const GOODBYE_WAIT: Duration = Duration::from_millis(600);
/// Command asking the firmware to park the strip.
const SLEEP_COMMAND: &[u8] = b"*sleep*\n";
/// Black frames written before closing the port.
const POWEROFF_BLACK_FRAMES: usize = 3;

/// (VID, PID) pairs probed per preference round.
const DETECTION_ROUNDS: [&[(u16, u16)]; 4] = [
    // Espressif native USB and RP2040.
    &[(0x303A, 0x1001), (0x2E8A, 0x000A), (0x2E8A, 0x0003)],
    // CP210x bridges common on ESP dev boards.
    &[(0x10C4, 0xEA60)],
    // CH340 bridges.
    &[(0x1A86, 0x7523), (0x1A86, 0x55D4)],
    // FTDI bridges.
    &[(0x0403, 0x6001), (0x0403, 0x6015)],
];

/// Adalight frame: `A d a`, LED count minus one (big-endian), checksum
/// `hi ^ lo ^ 0x55`, then RGB triples.
pub(crate) fn frame(values: &[ColorRgb]) -> Vec<u8> {
    let count = values.len().saturating_sub(1) as u16;
    let hi = (count >> 8) as u8;
    let lo = (count & 0xFF) as u8;
    let mut out = Vec::with_capacity(6 + values.len() * 3);
    out.extend_from_slice(b"Ada");
    out.push(hi);
    out.push(lo);
    out.push(hi ^ lo ^ 0x55);
    for c in values {
        out.extend_from_slice(&[c.red, c.green, c.blue]);
    }
    out
}

fn usb_ids(info: &SerialPortInfo) -> Option<(u16, u16)> {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => Some((usb.vid, usb.pid)),
        _ => None,
    }
}

/// First port whose descriptors match a detection round, in round
/// order; any USB serial port as the last resort.
pub(crate) fn discover_first(ports: &[SerialPortInfo]) -> Option<String> {
    for round in DETECTION_ROUNDS {
        for info in ports {
            if let Some(ids) = usb_ids(info) {
                if round.contains(&ids) {
                    return Some(info.port_name.clone());
                }
            }
        }
    }
    ports
        .iter()
        .find(|p| usb_ids(p).is_some())
        .map(|p| p.port_name.clone())
}

pub struct SerialDriver {
    device_name: String,
    auto_device: bool,
    baud_rate: u32,
    delay_after_connect: Duration,
    esp_handshake: bool,
    force_detection: bool,
    port: Option<Box<dyn SerialPort>>,
    timeout_drops: u32,
}

impl SerialDriver {
    pub fn new() -> Self {
        Self {
            device_name: String::new(),
            auto_device: true,
            baud_rate: 1_000_000,
            delay_after_connect: Duration::ZERO,
            esp_handshake: false,
            force_detection: false,
            port: None,
            timeout_drops: 0,
        }
    }

    fn try_open(&mut self) -> DeviceResult<()> {
        if self.auto_device {
            let ports = serialport::available_ports()
                .map_err(|e| DeviceError::Io(e.to_string()))?;
            self.device_name = discover_first(&ports).ok_or_else(|| {
                DeviceError::Io("no serial device found automatically".to_string())
            })?;
        }
        if self.device_name.is_empty() {
            return Err(DeviceError::Config("no serial device name".to_string()));
        }

        info!("opening UART {} at {} baud", self.device_name, self.baud_rate);
        let mut port = serialport::new(&self.device_name, self.baud_rate)
            .timeout(WRITE_TIMEOUT)
            .open()
            .map_err(|e| DeviceError::Io(format!("{}: {}", self.device_name, e)))?;

        if self.esp_handshake || self.force_detection {
            // The controller reboots on DTR assert; give the banner a
            // bounded window and log whatever arrived.
            std::thread::sleep(BOOT_BANNER_WAIT);
            let mut banner = [0u8; 256];
            match port.read(&mut banner) {
                Ok(n) if n > 0 => {
                    debug!(
                        "boot banner: {}",
                        String::from_utf8_lossy(&banner[..n]).trim_end()
                    );
                }
                _ => debug!("no boot banner received"),
            }
        }

        if !self.delay_after_connect.is_zero() {
            debug!("delay after connect: {:?}", self.delay_after_connect);
            std::thread::sleep(self.delay_after_connect);
        }

        self.timeout_drops = 0;
        self.port = Some(port);
        Ok(())
    }

    /// Send the sleep command and wait (bounded) for the goodbye line.
    fn esp_goodbye(&mut self) {
        let Some(port) = self.port.as_mut() else {
            return;
        };
        if port.write_all(SLEEP_COMMAND).is_err() {
            return;
        }
        let _ = port.flush();

        let deadline = std::time::Instant::now() + GOODBYE_WAIT;
        let mut collected = Vec::new();
        let mut buf = [0u8; 64];
        while std::time::Instant::now() < deadline {
            match port.read(&mut buf) {
                Ok(n) if n > 0 => {
                    collected.extend_from_slice(&buf[..n]);
                    if collected.contains(&b'\n') {
                        info!(
                            "received goodbye: '{}'",
                            String::from_utf8_lossy(&collected).trim_end()
                        );
                        return;
                    }
                }
                _ => break,
            }
        }
        debug!("no goodbye line before the deadline");
    }
}

impl Default for SerialDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LedDriver for SerialDriver {
    fn name(&self) -> &str {
        "serial"
    }

    fn init(&mut self, config: &Value) -> DeviceResult<()> {
        let output = config["output"].as_str().unwrap_or("auto");
        // Unix device paths reduce to the port name serialport expects.
        self.device_name = output.to_string();
        self.auto_device = output.eq_ignore_ascii_case("auto");
        self.baud_rate = config["rate"].as_u64().unwrap_or(1_000_000) as u32;
        self.delay_after_connect =
            Duration::from_millis(config["delayAfterConnect"].as_u64().unwrap_or(0));
        self.esp_handshake = config["espHandshake"].as_bool().unwrap_or(false);
        self.force_detection = config["forceSerialDetection"].as_bool().unwrap_or(false);

        debug!(
            "serial init: device '{}' (auto: {}), {} baud, esp handshake {}",
            self.device_name, self.auto_device, self.baud_rate, self.esp_handshake
        );
        Ok(())
    }

    fn open(&mut self) -> DeviceResult<()> {
        self.try_open()
    }

    fn close(&mut self) -> DeviceResult<()> {
        if self.port.is_some() {
            if self.esp_handshake {
                self.esp_goodbye();
            }
            self.port = None;
            debug!("serial port closed: {}", self.device_name);
        }
        Ok(())
    }

    fn write(&mut self, values: &[ColorRgb]) -> DeviceResult<()> {
        let port = self.port.as_mut().ok_or(DeviceError::NotReady)?;
        let data = frame(values);
        match port.write_all(&data) {
            Ok(()) => {
                self.timeout_drops = 0;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                self.timeout_drops += 1;
                warn!(
                    "serial write timeout; {} frames dropped so far",
                    self.timeout_drops
                );
                if self.timeout_drops > MAX_WRITE_TIMEOUTS {
                    Err(DeviceError::Timeout(format!(
                        "timeout writing data to {}",
                        self.device_name
                    )))
                } else {
                    // Drop the frame, keep the device.
                    Ok(())
                }
            }
            Err(err) => Err(DeviceError::Io(format!(
                "serial port error: {err}"
            ))),
        }
    }

    fn discover(&mut self, _params: &Value) -> DeviceResult<Value> {
        let ports = serialport::available_ports().map_err(|e| DeviceError::Io(e.to_string()))?;
        let devices: Vec<Value> = ports
            .iter()
            .filter_map(|p| {
                usb_ids(p).map(|(vid, pid)| {
                    json!({
                        "value": p.port_name,
                        "name": format!("{} ({:04x}:{:04x})", p.port_name, vid, pid),
                    })
                })
            })
            .collect();
        Ok(json!({ "devices": devices }))
    }

    fn power_off_black_frames(&self) -> usize {
        POWEROFF_BLACK_FRAMES
    }

    fn latch_time_ms(&self) -> u64 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb_port(name: &str, vid: u16, pid: u16) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
        }
    }

    #[test]
    fn frame_header_and_checksum() {
        let data = frame(&[ColorRgb::new(10, 20, 30); 10]);
        assert_eq!(&data[..3], b"Ada");
        // count = 9 -> hi 0, lo 9, checksum 0 ^ 9 ^ 0x55.
        assert_eq!(data[3], 0);
        assert_eq!(data[4], 9);
        assert_eq!(data[5], 0x09 ^ 0x55);
        assert_eq!(data.len(), 6 + 30);
        assert_eq!(&data[6..9], &[10, 20, 30]);
    }

    #[test]
    fn frame_large_count_uses_both_bytes() {
        let data = frame(&vec![ColorRgb::BLACK; 300]);
        // count = 299 = 0x012B.
        assert_eq!(data[3], 0x01);
        assert_eq!(data[4], 0x2B);
        assert_eq!(data[5], 0x01 ^ 0x2B ^ 0x55);
    }

    #[test]
    fn detection_prefers_esp_over_generic_bridges() {
        let ports = vec![
            usb_port("/dev/ttyUSB0", 0x0403, 0x6001), // FTDI
            usb_port("/dev/ttyACM0", 0x303A, 0x1001), // ESP native
        ];
        assert_eq!(discover_first(&ports).as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn detection_falls_back_to_any_usb_port() {
        let ports = vec![usb_port("/dev/ttyUSB7", 0x1234, 0x5678)];
        assert_eq!(discover_first(&ports).as_deref(), Some("/dev/ttyUSB7"));
        assert_eq!(discover_first(&[]), None);
    }

    #[test]
    fn write_without_port_is_not_ready() {
        let mut d = SerialDriver::new();
        assert!(matches!(
            d.write(&[ColorRgb::BLACK]),
            Err(DeviceError::NotReady)
        ));
    }
}
