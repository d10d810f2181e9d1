//! Settings Collaborator
//!
//! The persistence side of configuration, hosted by the daemon
//! bootstrap and deliberately outside the engine core: the core never
//! touches disk. One JSON file holds all settings kinds, versioned
//! through `general.version`; loading runs registered migrations in
//! order, creates a timestamped backup before the first rewrite of a
//! session, and auto-corrects documents that no longer deserialize
//! instead of refusing to start. Subscribers receive every changed
//! document as a `(kind, document)` pair over a channel; the engine
//! consumes those pairs and nothing else.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};

use anyhow::{Context, Result};
use log::{info, warn};
use serde_json::Value;

use crate::engine::config::{Settings, SettingsKind, CURRENT_SETTINGS_VERSION};

/// Run all applicable migrations in place. Returns true when the
/// document changed.
pub fn migrate(doc: &mut Value) -> bool {
    let version = doc["general"]["version"].as_i64().unwrap_or(0);
    if version >= CURRENT_SETTINGS_VERSION {
        return false;
    }

    if version < 1 {
        // v1 rescaled the backlight threshold by one step.
        if let Some(adjustments) = doc["color"]["channelAdjustment"].as_array_mut() {
            for entry in adjustments {
                if let Some(threshold) = entry["backlightThreshold"].as_i64() {
                    if threshold > 1 {
                        entry["backlightThreshold"] = Value::from(threshold - 1);
                    }
                }
            }
        }
        info!("settings upgraded to version 1");
    }

    if version < 2 {
        // v2 introduced LED grouping.
        if let Some(leds) = doc["leds"].as_array_mut() {
            for led in leds {
                if led.is_object() && led.get("group").is_none() {
                    led["group"] = Value::from(0);
                }
            }
        }
        info!("settings upgraded to version 2");
    }

    doc["general"]["version"] = Value::from(CURRENT_SETTINGS_VERSION);
    true
}

/// Deserialize kind by kind, replacing damaged documents with their
/// defaults. Returns the settings and whether anything was corrected.
pub fn validate(doc: &Value) -> (Settings, bool) {
    let mut corrected = false;
    let defaults = serde_json::to_value(Settings::default()).expect("defaults serialize");

    let mut fixed = serde_json::Map::new();
    for kind in SettingsKind::ALL {
        let key = kind.as_str();
        let value = doc.get(key).cloned().unwrap_or(Value::Null);
        let candidate = if value.is_null() {
            defaults[key].clone()
        } else {
            value
        };

        // Probe the kind in isolation against the full document type.
        let mut probe = serde_json::Map::new();
        probe.insert(key.to_string(), candidate.clone());
        match serde_json::from_value::<Settings>(Value::Object(probe)) {
            Ok(_) => {
                fixed.insert(key.to_string(), candidate);
            }
            Err(err) => {
                warn!("settings kind '{key}' is invalid ({err}); resetting to defaults");
                fixed.insert(key.to_string(), defaults[key].clone());
                corrected = true;
            }
        }
    }

    let settings = serde_json::from_value(Value::Object(fixed)).unwrap_or_default();
    (settings, corrected)
}

/// One kind's document, cut out of the full settings value.
pub fn document_of(settings: &Settings, kind: SettingsKind) -> Value {
    serde_json::to_value(settings)
        .map(|mut doc| doc[kind.as_str()].take())
        .unwrap_or(Value::Null)
}

pub struct SettingsStore {
    path: PathBuf,
    backup_made: bool,
    subscribers: Vec<Sender<(SettingsKind, Value)>>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_made: false,
            subscribers: Vec::new(),
        }
    }

    /// Default location under the platform data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("glowstream")
            .join("settings.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a subscriber. Every changed document is delivered as a
    /// `(kind, document)` pair; this is the only surface the core sees.
    pub fn subscribe(&mut self) -> Receiver<(SettingsKind, Value)> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, kind: SettingsKind, document: &Value) {
        self.subscribers
            .retain(|tx| tx.send((kind, document.clone())).is_ok());
    }

    /// Deliver every kind once, e.g. right after a subscriber attached.
    pub fn publish_all(&mut self, settings: &Settings) {
        for kind in SettingsKind::ALL {
            let document = document_of(settings, kind);
            self.emit(kind, &document);
        }
    }

    /// Load, migrate, validate. A fresh install writes the defaults.
    pub fn load(&mut self) -> Result<Settings> {
        if !self.path.exists() {
            let settings = Settings::default();
            self.save(&settings)?;
            info!("settings database created at {}", self.path.display());
            return Ok(settings);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let mut doc: Value = serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!("settings file unreadable ({err}); starting from defaults");
            Value::Object(serde_json::Map::new())
        });

        let upgraded = migrate(&mut doc);
        let (settings, corrected) = validate(&doc);

        if upgraded || corrected {
            self.backup()?;
            self.save(&settings)?;
            info!("settings rewritten at version {CURRENT_SETTINGS_VERSION}");
        }

        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, body)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    /// Replace one kind's document: validate against the full schema
    /// (auto-correcting on failure), persist, and notify subscribers
    /// with the document as stored.
    pub fn update_document(
        &mut self,
        settings: &mut Settings,
        kind: SettingsKind,
        document: Value,
    ) -> Result<()> {
        let mut doc = serde_json::to_value(&*settings)?;
        doc[kind.as_str()] = document;

        let (merged, corrected) = validate(&doc);
        if corrected {
            warn!(
                "incoming '{}' document failed validation; stored auto-corrected version",
                kind.as_str()
            );
        }
        *settings = merged;
        self.save(settings)?;

        let stored = document_of(settings, kind);
        self.emit(kind, &stored);
        Ok(())
    }

    /// Copy the current file aside once per session, before the first
    /// rewrite.
    fn backup(&mut self) -> Result<()> {
        if self.backup_made || !self.path.exists() {
            return Ok(());
        }
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let backup = self.path.with_extension(format!("backup.{stamp}.json"));
        fs::copy(&self.path, &backup)
            .with_context(|| format!("backing up to {}", backup.display()))?;
        info!("settings backup saved as {}", backup.display());
        self.backup_made = true;
        Ok(())
    }
}
