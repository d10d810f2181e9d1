//! glowstream
//!
//! Ambient LED lighting engine: ingests live video frames, folds them
//! into per-LED colors, smooths and calibrates the result, and drives a
//! physical LED strip through a pluggable device driver.

mod color;
mod decode;
mod device;
mod engine;
mod grabber;
mod image;
mod mapper;
mod net;
mod perf;
mod settings;
mod smoothing;

use std::sync::mpsc;
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use decode::hdr::HdrDetector;
use decode::lut::{P010Tables, ToneMapLut};
use decode::HdrMode;
use engine::{Engine, GrabberLink};
use grabber::{DecodeParams, GrabberPool};
use settings::SettingsStore;

/// LUT files carry one table segment per tone-mapping mode.
fn lut_segment(mode: HdrMode) -> usize {
    match mode {
        HdrMode::Partial => 1,
        _ => 0,
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // The settings collaborator owns all persistence; the core only
    // ever sees (kind, document) pairs on its channel.
    let mut store = SettingsStore::new(SettingsStore::default_path());
    let settings = store.load()?;
    let settings_rx = store.subscribe();
    info!("instance '{}' starting", settings.general.name);

    perf::init(settings.performance.report_interval_s * 1000);

    let runtime = tokio::runtime::Runtime::new()?;

    // Output side: driver plus its dispatcher thread.
    let driver = device::create_driver(&settings.device.device_type, runtime.handle().clone())?;
    let led_count = settings.leds.len().max(1);
    let dispatcher = device::Dispatcher::spawn(driver, settings.device.driver_config(led_count));

    // Decode side: tone-map LUT, HDR detection, worker pool.
    let lut = settings.grabber.lut_path.as_ref().and_then(|path| {
        match ToneMapLut::load(path, lut_segment(settings.grabber.hdr_mode)) {
            Ok(lut) => Some(Arc::new(lut)),
            Err(err) => {
                warn!("tone-map LUT unavailable: {err:#}");
                None
            }
        }
    });
    let params = Arc::new(RwLock::new(DecodeParams {
        hdr_mode: if lut.is_some() {
            settings.grabber.hdr_mode
        } else {
            HdrMode::Off
        },
        p010: Some(Arc::new(P010Tables::new(settings.grabber.hdr_mode))),
        lut,
    }));

    let mut detector = HdrDetector::new();
    let detection = &settings.video_detection;
    detector.set_config(
        detection.enabled,
        detection.thresholds(),
        detection.time_to_enable_s,
        detection.time_to_disable_ms,
    );
    let detector = Arc::new(Mutex::new(detector));

    let (hdr_tx, hdr_rx) = mpsc::channel();
    let (pool, frames) = GrabberPool::new(params.clone(), detector, hdr_tx);

    let engine = Engine::spawn(
        &settings,
        dispatcher.handle(),
        Some(GrabberLink {
            frames,
            params,
            hdr_requests: hdr_rx,
        }),
    );

    // Settings channel: changed documents flow from the collaborator
    // into the engine, one (kind, document) pair at a time.
    let settings_engine = engine.handle();
    std::thread::Builder::new()
        .name("settings-channel".to_string())
        .spawn(move || {
            for (kind, document) in settings_rx {
                settings_engine.apply_settings(kind, document);
            }
        })?;

    // Capture back-ends and network push servers are external
    // collaborators: they feed raw buffers into the pool and colors
    // into the engine handle.
    info!("engine running; ctrl-c to exit");
    runtime.block_on(tokio::signal::ctrl_c())?;
    info!("shutting down");

    engine.stop();
    pool.stop();
    dispatcher.stop();
    Ok(())
}
