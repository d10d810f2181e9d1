//! Settings Kinds
//!
//! One serde struct per settings document. Every struct deserializes
//! from an empty object into production defaults, which is what the
//! store's auto-correction falls back to for damaged documents.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::color::calibration::CalibrationConfig;
use crate::decode::hdr::Thresholds;
use crate::decode::HdrMode;
use crate::mapper::{Led, MappingMode};
use crate::smoothing::SmoothingConfig;

/// Current settings document schema version. The settings collaborator
/// migrates older documents up to this before the core sees them.
pub const CURRENT_SETTINGS_VERSION: i64 = 2;

/// The settings document kinds, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsKind {
    General,
    Color,
    Device,
    Leds,
    Grabber,
    NetForward,
    NetServers,
    Effects,
    VideoDetection,
    Performance,
}

impl SettingsKind {
    pub const ALL: [SettingsKind; 10] = [
        SettingsKind::General,
        SettingsKind::Color,
        SettingsKind::Device,
        SettingsKind::Leds,
        SettingsKind::Grabber,
        SettingsKind::NetForward,
        SettingsKind::NetServers,
        SettingsKind::Effects,
        SettingsKind::VideoDetection,
        SettingsKind::Performance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SettingsKind::General => "general",
            SettingsKind::Color => "color",
            SettingsKind::Device => "device",
            SettingsKind::Leds => "leds",
            SettingsKind::Grabber => "grabber",
            SettingsKind::NetForward => "netForward",
            SettingsKind::NetServers => "netServers",
            SettingsKind::Effects => "effects",
            SettingsKind::VideoDetection => "videoDetection",
            SettingsKind::Performance => "performance",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneralSettings {
    pub name: String,
    /// Settings schema version; bumped by store migrations.
    pub version: i64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            name: "glowstream".to_string(),
            version: CURRENT_SETTINGS_VERSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ColorSettings {
    pub channel_adjustment: Vec<CalibrationConfig>,
    pub smoothing: SmoothingConfig,
}

impl Default for ColorSettings {
    fn default() -> Self {
        Self {
            channel_adjustment: vec![CalibrationConfig::default()],
            smoothing: SmoothingConfig::default(),
        }
    }
}

/// The device document: a typed discriminator plus the driver's own
/// parameters, passed through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_type: "wled".to_string(),
            params: serde_json::Map::new(),
        }
    }
}

impl DeviceSettings {
    /// Full config document handed to the driver, LED count injected.
    pub fn driver_config(&self, led_count: usize) -> Value {
        let mut config = Value::Object(self.params.clone());
        config["type"] = Value::from(self.device_type.clone());
        config["currentLedCount"] = Value::from(led_count as u64);
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GrabberSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: String,
    pub crop_left: u32,
    pub crop_right: u32,
    pub crop_top: u32,
    pub crop_bottom: u32,
    /// Decode at half resolution in both axes.
    pub quarter_frame: bool,
    /// Sample LED regions with stride 2.
    pub sparse_processing: bool,
    /// Average in linear light.
    pub linear_averaging: bool,
    pub mapping_type: MappingMode,
    pub hdr_mode: HdrMode,
    pub lut_path: Option<PathBuf>,
}

impl Default for GrabberSettings {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            width: 1920,
            height: 1080,
            fps: 60,
            pixel_format: "auto".to_string(),
            crop_left: 0,
            crop_right: 0,
            crop_top: 0,
            crop_bottom: 0,
            quarter_frame: false,
            sparse_processing: false,
            linear_averaging: true,
            mapping_type: MappingMode::MulticolorMean,
            hdr_mode: HdrMode::Off,
            lut_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetForwardSettings {
    pub enabled: bool,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetServersSettings {
    pub json_port: u16,
    pub flatbuffers_port: u16,
    pub protobuf_port: u16,
}

impl Default for NetServersSettings {
    fn default() -> Self {
        Self {
            json_port: 8090,
            flatbuffers_port: 19400,
            protobuf_port: 19401,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EffectsSettings {
    pub disabled: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoDetectionSettings {
    pub enabled: bool,
    pub threshold_y: u8,
    pub threshold_u: u8,
    pub threshold_v: u8,
    pub time_to_enable_s: i64,
    pub time_to_disable_ms: i64,
}

impl Default for VideoDetectionSettings {
    fn default() -> Self {
        let t = Thresholds::default();
        Self {
            enabled: false,
            threshold_y: t.y,
            threshold_u: t.u,
            threshold_v: t.v,
            time_to_enable_s: 30,
            time_to_disable_ms: 500,
        }
    }
}

impl VideoDetectionSettings {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            y: self.threshold_y,
            u: self.threshold_u,
            v: self.threshold_v,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceSettings {
    pub report_interval_s: i64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            report_interval_s: 60,
        }
    }
}

/// The full persisted settings document: one field per kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub color: ColorSettings,
    pub device: DeviceSettings,
    pub leds: Vec<Led>,
    pub grabber: GrabberSettings,
    #[serde(rename = "netForward")]
    pub net_forward: NetForwardSettings,
    #[serde(rename = "netServers")]
    pub net_servers: NetServersSettings,
    pub effects: EffectsSettings,
    #[serde(rename = "videoDetection")]
    pub video_detection: VideoDetectionSettings,
    pub performance: PerformanceSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_documents_deserialize_to_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.general.name, "glowstream");
        assert_eq!(settings.device.device_type, "wled");
        assert_eq!(settings.grabber.width, 1920);
        assert_eq!(settings.color.channel_adjustment.len(), 1);
    }

    #[test]
    fn kind_names_match_storage_keys() {
        let names: Vec<&str> = SettingsKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            [
                "general",
                "color",
                "device",
                "leds",
                "grabber",
                "netForward",
                "netServers",
                "effects",
                "videoDetection",
                "performance"
            ]
        );
    }

    #[test]
    fn driver_config_injects_type_and_led_count() {
        let mut device = DeviceSettings::default();
        device
            .params
            .insert("host".to_string(), Value::from("10.0.0.1"));
        let config = device.driver_config(42);
        assert_eq!(config["type"], Value::from("wled"));
        assert_eq!(config["currentLedCount"], Value::from(42u64));
        assert_eq!(config["host"], Value::from("10.0.0.1"));
    }

    #[test]
    fn unknown_device_params_round_trip() {
        let json = r#"{ "type": "serial", "output": "/dev/ttyACM0", "rate": 2000000 }"#;
        let device: DeviceSettings = serde_json::from_str(json).unwrap();
        assert_eq!(device.device_type, "serial");
        assert_eq!(device.params["rate"], Value::from(2_000_000u64));
        let back = serde_json::to_value(&device).unwrap();
        assert_eq!(back["output"], Value::from("/dev/ttyACM0"));
    }
}
