//! Engine Core
//!
//! One engine instance drives one LED strip: it owns the priority
//! muxer, the active interpolator, the calibration snapshot, and the
//! image-to-LED mapper, all serialized on a single engine thread.
//! External producers reach it through [`EngineHandle`]; the grabber
//! pool feeds it decoded frames through a channel.

pub mod clock;
pub mod config;
pub mod muxer;

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::color::calibration::{CalibrationConfig, ColorCalibration};
use crate::decode::hdr::ToneMappingRequest;
use crate::device::DispatcherHandle;
use crate::grabber::{DecodeParams, PoolOutput};
use crate::image::{ColorRgb, Image};
use crate::mapper::{ImageToLedMap, Led};
use crate::smoothing::{Interpolator, SmoothingConfig, SmoothingRegistry};

use config::{GrabberSettings, Settings};
use muxer::{Component, MuxerEvent, PriorityMuxer};

/// Muxer evaluation cadence.
const MUXER_TICK_MS: i64 = 250;
/// Smoothing step cadence.
const SMOOTHING_TICK: Duration = Duration::from_millis(20);
/// A grabber input expires this long after its last frame.
const GRABBER_INPUT_TIMEOUT_MS: i64 = 2000;
/// Priority the video grabber feeds.
pub const PRIORITY_GRABBER: u8 = 240;

pub enum EngineCommand {
    SetColor {
        priority: u8,
        colors: Vec<ColorRgb>,
        duration_ms: i64,
        origin: String,
        owner: String,
    },
    SetImage {
        priority: u8,
        image: Image,
        duration_ms: i64,
        origin: String,
        owner: String,
    },
    ClearInput {
        priority: u8,
        /// When set, only a matching owner may clear the input.
        owner: Option<String>,
    },
    ClearAll {
        force: bool,
    },
    SetAutoSelect(bool),
    SetManualPriority(u8),
    SetCalibration(Vec<CalibrationConfig>),
    SetSmoothing(SmoothingConfig),
    /// One `(kind, document)` notification from the settings store.
    ApplySettings {
        kind: config::SettingsKind,
        document: serde_json::Value,
    },
    Stop,
}

/// Wiring between a grabber pool and the engine.
pub struct GrabberLink {
    pub frames: Receiver<PoolOutput>,
    pub params: Arc<RwLock<DecodeParams>>,
    pub hdr_requests: Receiver<ToneMappingRequest>,
}

/// Cheap-to-clone front door for external producers (API servers,
/// effect engines, network streams).
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn set_color(
        &self,
        priority: u8,
        colors: Vec<ColorRgb>,
        duration_ms: i64,
        owner: &str,
    ) {
        let _ = self.tx.send(EngineCommand::SetColor {
            priority,
            colors,
            duration_ms,
            origin: owner.to_string(),
            owner: owner.to_string(),
        });
    }

    pub fn set_image(&self, priority: u8, image: Image, duration_ms: i64, owner: &str) {
        let _ = self.tx.send(EngineCommand::SetImage {
            priority,
            image,
            duration_ms,
            origin: owner.to_string(),
            owner: owner.to_string(),
        });
    }

    pub fn clear(&self, priority: u8, owner: Option<&str>) {
        let _ = self.tx.send(EngineCommand::ClearInput {
            priority,
            owner: owner.map(str::to_string),
        });
    }

    pub fn clear_all(&self, force: bool) {
        let _ = self.tx.send(EngineCommand::ClearAll { force });
    }

    pub fn set_auto_select(&self, enabled: bool) {
        let _ = self.tx.send(EngineCommand::SetAutoSelect(enabled));
    }

    pub fn set_manual_priority(&self, priority: u8) {
        let _ = self.tx.send(EngineCommand::SetManualPriority(priority));
    }

    pub fn set_calibration(&self, configs: Vec<CalibrationConfig>) {
        let _ = self.tx.send(EngineCommand::SetCalibration(configs));
    }

    pub fn set_smoothing(&self, config: SmoothingConfig) {
        let _ = self.tx.send(EngineCommand::SetSmoothing(config));
    }

    /// Settings-channel intake: one changed document per call.
    pub fn apply_settings(&self, kind: config::SettingsKind, document: serde_json::Value) {
        let _ = self.tx.send(EngineCommand::ApplySettings { kind, document });
    }
}

pub struct Engine {
    handle: EngineHandle,
    thread: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn spawn(
        settings: &Settings,
        dispatcher: DispatcherHandle,
        grabber: Option<GrabberLink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = EngineHandle { tx };

        let strip = settings.leds.clone();
        let led_count = strip.len().max(1);
        let calibration = settings
            .color
            .channel_adjustment
            .first()
            .map(ColorCalibration::from_config)
            .unwrap_or_default();
        let smoothing = settings.color.smoothing;
        let registry = SmoothingRegistry::new(smoothing);
        let interpolator = smoothing.build();
        let grabber_cfg = settings.grabber.clone();

        let thread = thread::Builder::new()
            .name("engine".to_string())
            .spawn(move || {
                let mut engine = EngineLoop {
                    muxer: PriorityMuxer::new(),
                    registry,
                    active_smoothing: smoothing,
                    interpolator,
                    calibration,
                    strip,
                    led_count,
                    grabber_cfg,
                    mapper: None,
                    input_colors: HashMap::new(),
                    dispatcher,
                    grabber,
                    last_muxer_tick: 0,
                    write_pending: true,
                };
                engine.run(rx);
            })
            .expect("spawn engine thread");

        info!("engine started ({} LEDs)", led_count);
        Self {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn stop(mut self) {
        let _ = self.handle.tx.send(EngineCommand::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct EngineLoop {
    muxer: PriorityMuxer,
    registry: SmoothingRegistry,
    active_smoothing: SmoothingConfig,
    interpolator: Box<dyn Interpolator>,
    calibration: ColorCalibration,
    strip: Vec<Led>,
    led_count: usize,
    grabber_cfg: GrabberSettings,
    /// Mapper cache; rebuilt when the frame geometry changes.
    mapper: Option<ImageToLedMap>,
    /// Latest target vector per priority.
    input_colors: HashMap<u8, Vec<[f32; 3]>>,
    dispatcher: DispatcherHandle,
    grabber: Option<GrabberLink>,
    last_muxer_tick: i64,
    write_pending: bool,
}

impl EngineLoop {
    fn run(&mut self, rx: Receiver<EngineCommand>) {
        let now = clock::now_ms();
        self.interpolator
            .reset_to_colors(vec![[0.0; 3]; self.led_count], now as f32);

        loop {
            match rx.recv_timeout(SMOOTHING_TICK) {
                Ok(EngineCommand::Stop) => break,
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            self.drain_grabber();

            let now = clock::now_ms();
            if now - self.last_muxer_tick >= MUXER_TICK_MS {
                self.last_muxer_tick = now;
                let events = self.muxer.update(now);
                self.handle_muxer_events(&events, now);
            }

            self.step_output(now);
        }
        debug!("engine loop ended");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        let now = clock::now_ms();
        match command {
            EngineCommand::SetColor {
                priority,
                colors,
                duration_ms,
                origin,
                owner,
            } => {
                let first = colors.first().copied().unwrap_or(ColorRgb::BLACK);
                let events = self.muxer.register_input(
                    priority,
                    Component::Color,
                    &origin,
                    first,
                    0,
                    &owner,
                );
                self.handle_muxer_events(&events, now);
                let expanded = self.expand_colors(&colors);
                self.input_colors.insert(priority, expanded);
                let (_, events) = self.muxer.set_input(priority, duration_ms, now);
                self.handle_muxer_events(&events, now);
                self.retarget_if_visible(priority, now);
            }
            EngineCommand::SetImage {
                priority,
                image,
                duration_ms,
                origin,
                owner,
            } => {
                let colors = self.map_image(&image);
                let events = self.muxer.register_input(
                    priority,
                    Component::Image,
                    &origin,
                    ColorRgb::BLACK,
                    0,
                    &owner,
                );
                self.handle_muxer_events(&events, now);
                self.input_colors.insert(priority, colors);
                let (_, events) = self.muxer.set_input(priority, duration_ms, now);
                self.handle_muxer_events(&events, now);
                self.retarget_if_visible(priority, now);
            }
            EngineCommand::ClearInput { priority, owner } => {
                if let Some(owner) = owner {
                    let registered = &self.muxer.input_info(priority).owner;
                    if *registered != owner {
                        warn!(
                            "'{}' may not clear priority {} owned by '{}'",
                            owner, priority, registered
                        );
                        return;
                    }
                }
                self.input_colors.remove(&priority);
                let (_, events) = self.muxer.clear_input(priority, now);
                self.handle_muxer_events(&events, now);
            }
            EngineCommand::ClearAll { force } => {
                self.input_colors.clear();
                let events = self.muxer.clear_all(force, now);
                self.handle_muxer_events(&events, now);
            }
            EngineCommand::SetAutoSelect(enabled) => {
                let (_, events) = self.muxer.set_auto_select(enabled, now);
                self.handle_muxer_events(&events, now);
            }
            EngineCommand::SetManualPriority(priority) => {
                let (_, events) = self.muxer.set_manual_priority(priority, now);
                self.handle_muxer_events(&events, now);
            }
            EngineCommand::SetCalibration(configs) => {
                if let Some(cfg) = configs.first() {
                    self.calibration = ColorCalibration::from_config(cfg);
                    self.write_pending = true;
                }
            }
            EngineCommand::SetSmoothing(config) => {
                self.registry.update_system_default(config);
                self.apply_smoothing(config, now);
            }
            EngineCommand::ApplySettings { kind, document } => {
                self.apply_settings(kind, document, now)
            }
            EngineCommand::Stop => unreachable!("handled by the loop"),
        }
    }

    /// Apply one changed settings document. The strip and calibration
    /// snapshots swap atomically from the loop's point of view; kinds
    /// owned by other components are ignored here.
    fn apply_settings(&mut self, kind: config::SettingsKind, document: serde_json::Value, now: i64) {
        use config::SettingsKind;
        match kind {
            SettingsKind::Color => {
                match serde_json::from_value::<config::ColorSettings>(document) {
                    Ok(color) => {
                        if let Some(cfg) = color.channel_adjustment.first() {
                            self.calibration = ColorCalibration::from_config(cfg);
                        }
                        self.registry.update_system_default(color.smoothing);
                        self.apply_smoothing(color.smoothing, now);
                        self.write_pending = true;
                    }
                    Err(err) => warn!("ignoring invalid color settings: {err}"),
                }
            }
            SettingsKind::Leds => match serde_json::from_value::<Vec<Led>>(document) {
                Ok(strip) if !strip.is_empty() => {
                    self.led_count = strip.len();
                    self.strip = strip;
                    self.mapper = None;
                    self.write_pending = true;
                    info!("LED strip replaced ({} LEDs)", self.led_count);
                }
                Ok(_) => warn!("ignoring empty LED strip document"),
                Err(err) => warn!("ignoring invalid LED strip document: {err}"),
            },
            SettingsKind::Grabber => {
                match serde_json::from_value::<GrabberSettings>(document) {
                    Ok(grabber) => {
                        self.grabber_cfg = grabber;
                        self.mapper = None;
                    }
                    Err(err) => warn!("ignoring invalid grabber settings: {err}"),
                }
            }
            other => debug!("settings kind {:?} is handled elsewhere", other),
        }
    }

    /// Pull everything the grabber produced since the last pass.
    fn drain_grabber(&mut self) {
        let Some(link) = &self.grabber else {
            return;
        };

        // Tone-mapping flips first so a following frame decodes right.
        while let Ok(request) = link.hdr_requests.try_recv() {
            let mut params = link.params.write();
            match request {
                ToneMappingRequest::Enable => {
                    if params.lut.is_some() {
                        params.hdr_mode = self.grabber_cfg.hdr_mode;
                        info!("tone mapping enabled by HDR detection");
                    } else {
                        warn!("HDR detected but no LUT installed; tone mapping stays off");
                    }
                }
                ToneMappingRequest::Disable => {
                    params.hdr_mode = crate::decode::HdrMode::Off;
                    info!("tone mapping disabled by HDR detection");
                }
            }
        }

        let mut latest: Option<Image> = None;
        while let Ok(output) = link.frames.try_recv() {
            match output {
                PoolOutput::Frame { image, .. } => latest = Some(image),
                PoolOutput::Error { worker, error, seq } => {
                    warn!("decode failed on worker {worker} (frame {seq}): {error}");
                }
            }
        }

        if let Some(image) = latest {
            let now = clock::now_ms();
            let colors = self.map_image(&image);
            if !self.muxer.has_priority(PRIORITY_GRABBER)
                || self.muxer.input_info(PRIORITY_GRABBER).component != Component::VideoGrabber
            {
                let events = self.muxer.register_input(
                    PRIORITY_GRABBER,
                    Component::VideoGrabber,
                    &self.grabber_cfg.device,
                    ColorRgb::BLACK,
                    0,
                    "",
                );
                self.handle_muxer_events(&events, now);
            }
            self.input_colors.insert(PRIORITY_GRABBER, colors);
            let (_, events) = self
                .muxer
                .set_input(PRIORITY_GRABBER, GRABBER_INPUT_TIMEOUT_MS, now);
            self.handle_muxer_events(&events, now);
            self.retarget_if_visible(PRIORITY_GRABBER, now);
        }
    }

    fn handle_muxer_events(&mut self, events: &[MuxerEvent], now: i64) {
        for event in events {
            match event {
                MuxerEvent::VisiblePriorityChanged(priority) => {
                    self.retarget(*priority, now);
                }
                MuxerEvent::TimeRunner => {
                    // Re-process the visible input so color/effect
                    // sources with deadlines keep rendering.
                    self.retarget(self.muxer.current_priority(), now);
                }
                MuxerEvent::PrioritiesChanged | MuxerEvent::VisibleComponentChanged(_) => {}
            }
        }
    }

    fn retarget_if_visible(&mut self, priority: u8, now: i64) {
        if self.muxer.current_priority() == priority {
            self.retarget(priority, now);
        }
    }

    /// Point the interpolator at the visible input's colors, swapping
    /// the smoothing configuration when the input asks for another one.
    fn retarget(&mut self, priority: u8, now: i64) {
        let info = self.muxer.input_info(priority).clone();

        let wanted = self.registry.resolve(info.smooth_cfg);
        self.apply_smoothing(wanted, now);

        let target = self
            .input_colors
            .get(&priority)
            .cloned()
            .unwrap_or_else(|| vec![info.static_color.to_f32(); self.led_count]);

        if wanted.pause {
            self.interpolator.reset_to_colors(target, now as f32);
        } else {
            self.interpolator.set_target_colors(target, now as f32);
        }
        self.write_pending = true;
    }

    fn apply_smoothing(&mut self, config: SmoothingConfig, now: i64) {
        let active = &self.active_smoothing;
        let same = active.family == config.family
            && active.duration_ms == config.duration_ms
            && active.smoothing_factor == config.smoothing_factor
            && active.stiffness == config.stiffness
            && active.damping == config.damping
            && active.max_luminance_step == config.max_luminance_step;
        if same {
            return;
        }
        debug!("switching smoothing to {:?}", config.family);
        let current = self.interpolator.current_colors();
        self.interpolator = config.build();
        self.interpolator.reset_to_colors(current, now as f32);
        self.active_smoothing = config;
    }

    /// Spread a pushed color vector over the strip: a single color
    /// repeats everywhere, longer vectors map one-to-one.
    fn expand_colors(&self, colors: &[ColorRgb]) -> Vec<[f32; 3]> {
        if colors.len() == 1 {
            return vec![colors[0].to_f32(); self.led_count];
        }
        let mut out: Vec<[f32; 3]> = colors.iter().map(|c| c.to_f32()).collect();
        out.resize(self.led_count, [0.0; 3]);
        out
    }

    /// Resolve per-LED colors for a pushed or captured image, rebuilding
    /// the pixel-index map when the geometry changed.
    fn map_image(&mut self, image: &Image) -> Vec<[f32; 3]> {
        let dims = (image.width(), image.height());
        let stale = self
            .mapper
            .as_ref()
            .map(|m| (m.width(), m.height()) != dims)
            .unwrap_or(true);
        if stale {
            self.mapper = Some(ImageToLedMap::new(
                self.grabber_cfg.mapping_type,
                self.grabber_cfg.sparse_processing,
                self.grabber_cfg.linear_averaging,
                dims.0,
                dims.1,
                0,
                0,
                &self.strip,
            ));
        }
        self.mapper.as_ref().unwrap().process(image)
    }

    /// Advance the animation and push the calibrated vector out.
    fn step_output(&mut self, now: i64) {
        self.interpolator.update_current_colors(now as f32);
        let animating = !self.interpolator.is_animation_complete();
        if !animating && !self.write_pending {
            return;
        }
        self.write_pending = animating;

        let mut output: Vec<ColorRgb> = self
            .interpolator
            .current_colors()
            .into_iter()
            .map(ColorRgb::from_f32)
            .collect();
        output.resize(self.led_count, ColorRgb::BLACK);
        for color in &mut output {
            self.calibration.calibrate(color);
        }
        let _ = self.dispatcher.update_leds(&output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceResult, Dispatcher, LedDriver};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    struct SinkInner {
        writes: parking_lot::Mutex<Vec<Vec<ColorRgb>>>,
        failing: AtomicBool,
    }

    struct SinkDriver {
        inner: StdArc<SinkInner>,
    }

    impl LedDriver for SinkDriver {
        fn name(&self) -> &str {
            "sink"
        }
        fn init(&mut self, _config: &Value) -> DeviceResult<()> {
            Ok(())
        }
        fn open(&mut self) -> DeviceResult<()> {
            Ok(())
        }
        fn close(&mut self) -> DeviceResult<()> {
            Ok(())
        }
        fn write(&mut self, values: &[ColorRgb]) -> DeviceResult<()> {
            if self.inner.failing.load(Ordering::Relaxed) {
                return Err(crate::device::DeviceError::Io("sink down".to_string()));
            }
            self.inner.writes.lock().push(values.to_vec());
            Ok(())
        }
    }

    fn engine_with_sink(led_count: usize) -> (Engine, Dispatcher, StdArc<SinkInner>) {
        let inner = StdArc::new(SinkInner {
            writes: parking_lot::Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        });
        let dispatcher = Dispatcher::spawn(
            Box::new(SinkDriver {
                inner: inner.clone(),
            }),
            serde_json::json!({ "currentLedCount": led_count }),
        );

        let mut settings = Settings::default();
        settings.leds = vec![Led::default(); led_count];
        settings.color.smoothing.duration_ms = 40.0;

        let engine = Engine::spawn(&settings, dispatcher.handle(), None);
        (engine, dispatcher, inner)
    }

    fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..300 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn set_color_reaches_the_device() {
        let (engine, dispatcher, inner) = engine_with_sink(2);
        let handle = engine.handle();

        let red = ColorRgb::new(255, 0, 0);
        handle.set_color(100, vec![red], 0, "test");

        wait_for(|| {
            inner
                .writes
                .lock()
                .last()
                .is_some_and(|w| w == &vec![red, red])
        });

        engine.stop();
        dispatcher.stop();
    }

    #[test]
    fn clearing_the_color_falls_back_to_black() {
        let (engine, dispatcher, inner) = engine_with_sink(1);
        let handle = engine.handle();

        handle.set_color(50, vec![ColorRgb::new(0, 255, 0)], 0, "test");
        wait_for(|| {
            inner
                .writes
                .lock()
                .last()
                .is_some_and(|w| w[0].green == 255)
        });

        handle.clear(50, None);
        wait_for(|| {
            inner
                .writes
                .lock()
                .last()
                .is_some_and(|w| w[0] == ColorRgb::BLACK)
        });

        engine.stop();
        dispatcher.stop();
    }

    #[test]
    fn owner_mismatch_cannot_clear() {
        let (engine, dispatcher, inner) = engine_with_sink(1);
        let handle = engine.handle();

        let blue = ColorRgb::new(0, 0, 255);
        handle.set_color(60, vec![blue], 0, "owner-a");
        wait_for(|| inner.writes.lock().last().is_some_and(|w| w[0] == blue));

        handle.clear(60, Some("owner-b"));
        // The input survives; output stays blue.
        std::thread::sleep(Duration::from_millis(100));
        assert!(inner.writes.lock().last().is_some_and(|w| w[0] == blue));

        handle.clear(60, Some("owner-a"));
        wait_for(|| {
            inner
                .writes
                .lock()
                .last()
                .is_some_and(|w| w[0] == ColorRgb::BLACK)
        });

        engine.stop();
        dispatcher.stop();
    }

    #[test]
    fn strip_replacement_resizes_the_output() {
        let (engine, dispatcher, inner) = engine_with_sink(2);
        let handle = engine.handle();

        handle.apply_settings(
            config::SettingsKind::Leds,
            serde_json::to_value(vec![Led::default(); 3]).unwrap(),
        );
        handle.set_color(70, vec![ColorRgb::new(9, 9, 9)], 0, "test");

        wait_for(|| inner.writes.lock().last().is_some_and(|w| w.len() == 3));

        engine.stop();
        dispatcher.stop();
    }

    #[test]
    fn set_image_is_mapped_to_leds() {
        let (engine, dispatcher, inner) = engine_with_sink(1);
        let handle = engine.handle();

        let mut image = Image::new(4, 4);
        image.fill(ColorRgb::new(200, 0, 0));
        handle.set_image(80, image, 0, "pusher");

        wait_for(|| {
            inner
                .writes
                .lock()
                .last()
                .is_some_and(|w| w[0].red > 150 && w[0].green == 0)
        });

        engine.stop();
        dispatcher.stop();
    }
}
