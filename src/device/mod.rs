//! Device Dispatcher
//!
//! Owns the side-effectful boundary to LED hardware. A dispatcher runs
//! one driver on its own thread: callers hand it color vectors through
//! [`DispatcherHandle::update_leds`] (never blocking on I/O), and the
//! thread serializes writes, enforces the refresh cadence, and recovers
//! from transient transport errors with a bounded retry budget.

pub mod dtls;
pub mod home_assistant;
pub mod mqtt;
pub mod serial;
pub mod spi_ftdi;
pub mod wled;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use crate::image::ColorRgb;
use crate::perf;

pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not ready")]
    NotReady,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("network timeout: {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("retry budget exhausted: {0}")]
    Permanent(String),
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            DeviceError::Timeout(err.to_string())
        } else {
            DeviceError::Io(err.to_string())
        }
    }
}

/// Contract every concrete driver implements. All calls happen on the
/// dispatcher thread; drivers are free to block within the network
/// budget.
pub trait LedDriver: Send {
    fn name(&self) -> &str;

    fn init(&mut self, config: &Value) -> DeviceResult<()>;
    fn open(&mut self) -> DeviceResult<()>;
    fn close(&mut self) -> DeviceResult<()>;
    fn write(&mut self, values: &[ColorRgb]) -> DeviceResult<()>;

    fn power_on(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// Default power-off leaves the final black frame to the
    /// dispatcher; drivers with a real power command override this.
    fn power_off(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn discover(&mut self, _params: &Value) -> DeviceResult<Value> {
        Ok(serde_json::json!({ "devices": [] }))
    }

    fn get_properties(&mut self, _params: &Value) -> DeviceResult<Value> {
        Ok(Value::Null)
    }

    fn identify(&mut self, _params: &Value) -> DeviceResult<()> {
        Ok(())
    }

    /// Minimum idle interval the controller needs between frames.
    fn latch_time_ms(&self) -> u64 {
        0
    }

    /// Black frames written at power-off.
    fn power_off_black_frames(&self) -> usize {
        1
    }
}

/// Build a driver by its configured type.
pub fn create_driver(
    device_type: &str,
    runtime: tokio::runtime::Handle,
) -> DeviceResult<Box<dyn LedDriver>> {
    match device_type {
        "wled" => Ok(Box::new(wled::WledDriver::new(runtime))),
        "dtls" => Ok(Box::new(dtls::DtlsDriver::new())),
        "serial" | "adalight" => Ok(Box::new(serial::SerialDriver::new())),
        "spi_ftdi" => Ok(Box::new(spi_ftdi::SpiFtdiDriver::new())),
        "home_assistant" => Ok(Box::new(home_assistant::HomeAssistantDriver::new(runtime))),
        "zigbee2mqtt" => Ok(Box::new(mqtt::MqttDriver::new())),
        other => Err(DeviceError::Config(format!(
            "unknown device type '{other}'"
        ))),
    }
}

/// Dispatcher lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    Off = 0,
    Ready = 1,
    On = 2,
    Error = 3,
}

impl DeviceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DeviceState::Ready,
            2 => DeviceState::On,
            3 => DeviceState::Error,
            _ => DeviceState::Off,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub led_count: usize,
    pub refresh_time_ms: u64,
    pub max_retry: u32,
    pub retry_delay_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            led_count: 1,
            refresh_time_ms: 0,
            max_retry: 60,
            retry_delay_ms: 3000,
        }
    }
}

impl DispatcherConfig {
    pub fn from_value(config: &Value) -> Self {
        let d = Self::default();
        Self {
            led_count: config["currentLedCount"].as_u64().unwrap_or(1).max(1) as usize,
            refresh_time_ms: config["refreshTime"].as_u64().unwrap_or(d.refresh_time_ms),
            max_retry: config["maxRetry"].as_u64().unwrap_or(d.max_retry as u64) as u32,
            retry_delay_ms: config["retryDelay"]
                .as_u64()
                .unwrap_or(d.retry_delay_ms)
                .clamp(1500, 5000),
        }
    }
}

enum Command {
    Enable,
    Disable,
    ManualUpdate,
    SetRefreshTime(u64),
    Stop,
}

struct SharedState {
    last_values: Mutex<Vec<ColorRgb>>,
    state: AtomicU8,
    in_error: AtomicBool,
    /// Retry budget exhausted; only an external enable recovers.
    permanent: AtomicBool,
    refresh_active: AtomicBool,
    manual_pending: AtomicBool,
}

/// Caller-side handle. Cheap to clone; all mutation is queued to the
/// dispatcher thread.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: Sender<Command>,
    shared: Arc<SharedState>,
    component: String,
}

impl DispatcherHandle {
    /// Store a new color vector for the device. Never blocks on I/O.
    /// Returns [`DeviceError::NotReady`] while the device is not `On`
    /// or is in error; the values are discarded in that case.
    pub fn update_leds(&self, values: &[ColorRgb]) -> DeviceResult<()> {
        perf::global().record_incoming(&self.component);

        if self.shared.permanent.load(Ordering::Acquire) {
            return Err(DeviceError::Permanent(
                "retry budget exhausted; enable the device to recover".to_string(),
            ));
        }
        if self.shared.in_error.load(Ordering::Acquire)
            || DeviceState::from_u8(self.shared.state.load(Ordering::Acquire)) != DeviceState::On
        {
            return Err(DeviceError::NotReady);
        }

        {
            let mut last = self.shared.last_values.lock();
            last.clear();
            last.extend_from_slice(values);
        }

        // With the refresh timer running the next tick picks the values
        // up; otherwise queue exactly one manual write.
        if !self.shared.refresh_active.load(Ordering::Acquire)
            && !self.shared.manual_pending.swap(true, Ordering::AcqRel)
        {
            let _ = self.tx.send(Command::ManualUpdate);
        }
        Ok(())
    }

    pub fn enable(&self) {
        let _ = self.tx.send(Command::Enable);
    }

    pub fn disable(&self) {
        let _ = self.tx.send(Command::Disable);
    }

    pub fn set_refresh_time(&self, ms: u64) {
        let _ = self.tx.send(Command::SetRefreshTime(ms));
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_in_error(&self) -> bool {
        self.shared.in_error.load(Ordering::Acquire)
    }

    pub fn last_values(&self) -> Vec<ColorRgb> {
        self.shared.last_values.lock().clone()
    }
}

/// A driver bound to its dispatcher thread.
pub struct Dispatcher {
    handle: DispatcherHandle,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the dispatcher. The driver is initialized on its own
    /// thread; an init failure parks the device in `Error` until an
    /// external `enable`.
    pub fn spawn(driver: Box<dyn LedDriver>, device_config: Value) -> Self {
        let config = DispatcherConfig::from_value(&device_config);
        let component = format!("leddevice_{}", driver.name());
        let shared = Arc::new(SharedState {
            last_values: Mutex::new(Vec::new()),
            state: AtomicU8::new(DeviceState::Off as u8),
            in_error: AtomicBool::new(false),
            permanent: AtomicBool::new(false),
            refresh_active: AtomicBool::new(false),
            manual_pending: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel();
        let handle = DispatcherHandle {
            tx,
            shared: shared.clone(),
            component: component.clone(),
        };

        let thread = thread::Builder::new()
            .name(component.clone())
            .spawn(move || {
                let mut loop_state = DispatcherLoop {
                    driver,
                    device_config,
                    config,
                    shared,
                    component,
                    state: DeviceState::Off,
                    enabled: false,
                    ready: false,
                    on: false,
                    refresh_deadline: None,
                    retry_deadline: None,
                    retry_attempts: 0,
                };
                loop_state.run(rx);
            })
            .expect("spawn dispatcher thread");

        Self {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn stop(mut self) {
        let _ = self.handle.tx.send(Command::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct DispatcherLoop {
    driver: Box<dyn LedDriver>,
    device_config: Value,
    config: DispatcherConfig,
    shared: Arc<SharedState>,
    component: String,
    state: DeviceState,
    enabled: bool,
    ready: bool,
    on: bool,
    refresh_deadline: Option<std::time::Instant>,
    retry_deadline: Option<std::time::Instant>,
    retry_attempts: u32,
}

impl DispatcherLoop {
    fn run(&mut self, rx: Receiver<Command>) {
        info!("starting LED device '{}'", self.driver.name());
        match self.driver.init(&self.device_config) {
            Ok(()) => {
                self.set_state(DeviceState::Ready);
                self.handle_enable();
            }
            Err(err) => self.set_in_error(&err.to_string()),
        }

        loop {
            let timeout = self.next_timeout();
            match rx.recv_timeout(timeout) {
                Ok(Command::Stop) => break,
                Ok(Command::Enable) => self.handle_enable(),
                Ok(Command::Disable) => self.handle_disable(),
                Ok(Command::ManualUpdate) => {
                    self.shared.manual_pending.store(false, Ordering::Release);
                    self.rewrite_leds();
                }
                Ok(Command::SetRefreshTime(ms)) => {
                    self.config.refresh_time_ms = ms;
                    self.arm_refresh_timer();
                }
                Err(RecvTimeoutError::Timeout) => self.handle_deadlines(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
            perf::global().maybe_report(crate::engine::clock::now_ms());
        }

        self.handle_disable();
        info!("stopped LED device '{}'", self.driver.name());
    }

    fn next_timeout(&self) -> Duration {
        let now = std::time::Instant::now();
        let mut next = now + Duration::from_secs(1);
        if let Some(d) = self.refresh_deadline {
            next = next.min(d);
        }
        if let Some(d) = self.retry_deadline {
            next = next.min(d);
        }
        next.saturating_duration_since(now)
    }

    fn handle_deadlines(&mut self) {
        let now = std::time::Instant::now();
        if self.retry_deadline.is_some_and(|d| d <= now) {
            self.retry_deadline = None;
            self.attempt_recovery();
        }
        if self.refresh_deadline.is_some_and(|d| d <= now) {
            self.arm_refresh_timer();
            self.rewrite_leds();
        }
    }

    fn set_state(&mut self, state: DeviceState) {
        self.state = state;
        self.shared.state.store(state as u8, Ordering::Release);
    }

    fn set_in_error(&mut self, message: &str) {
        self.on = false;
        self.ready = false;
        self.enabled = false;
        self.refresh_deadline = None;
        self.shared.refresh_active.store(false, Ordering::Release);
        self.shared.in_error.store(true, Ordering::Release);
        error!(
            "device '{}' disabled, signals error: {}",
            self.driver.name(),
            message
        );

        if self.retry_attempts >= self.config.max_retry {
            warn!(
                "device '{}': retry budget ({}) exhausted; manual enable required",
                self.driver.name(),
                self.config.max_retry
            );
            self.shared.permanent.store(true, Ordering::Release);
            self.set_state(DeviceState::Error);
            self.retry_deadline = None;
            return;
        }

        self.retry_attempts += 1;
        self.set_state(DeviceState::Error);
        self.retry_deadline = Some(
            std::time::Instant::now() + Duration::from_millis(self.config.retry_delay_ms),
        );
        debug!(
            "device '{}': retry {}/{} scheduled in {} ms",
            self.driver.name(),
            self.retry_attempts,
            self.config.max_retry,
            self.config.retry_delay_ms
        );
    }

    fn attempt_recovery(&mut self) {
        debug!("device '{}': recovery attempt", self.driver.name());
        self.shared.in_error.store(false, Ordering::Release);
        match self
            .driver
            .init(&self.device_config)
            .and_then(|_| self.driver.open())
        {
            Ok(()) => {
                self.ready = true;
                self.set_state(DeviceState::Ready);
                self.handle_enable();
            }
            Err(err) => self.set_in_error(&err.to_string()),
        }
    }

    fn handle_enable(&mut self) {
        if self.enabled {
            return;
        }
        self.shared.in_error.store(false, Ordering::Release);
        if self.state == DeviceState::Error {
            // Manual enable resets the budget.
            self.retry_attempts = 0;
            self.shared.permanent.store(false, Ordering::Release);
            self.set_state(DeviceState::Off);
        }

        if !self.ready {
            match self.driver.open() {
                Ok(()) => self.ready = true,
                Err(err) => {
                    self.set_in_error(&err.to_string());
                    return;
                }
            }
        }

        self.enabled = true;
        if self.switch_on() {
            self.set_state(DeviceState::On);
        }
        self.arm_refresh_timer();
    }

    fn handle_disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        self.refresh_deadline = None;
        self.shared.refresh_active.store(false, Ordering::Release);
        self.switch_off();
        if let Err(err) = self.driver.close() {
            warn!("device '{}': close failed: {}", self.driver.name(), err);
        }
        self.ready = false;
        self.set_state(DeviceState::Ready);
    }

    fn switch_on(&mut self) -> bool {
        if self.on {
            return true;
        }
        if !self.enabled {
            return false;
        }
        match self.driver.power_on() {
            Ok(()) => {
                self.on = true;
                true
            }
            Err(err) => {
                self.set_in_error(&err.to_string());
                false
            }
        }
    }

    fn switch_off(&mut self) {
        if !self.on {
            return;
        }
        self.on = false;
        if self.ready {
            // A defined outcome first, then the driver's own power
            // command.
            self.write_black(self.driver.power_off_black_frames());
            if let Err(err) = self.driver.power_off() {
                warn!("device '{}': power off failed: {}", self.driver.name(), err);
            }
        }
    }

    fn arm_refresh_timer(&mut self) {
        if self.enabled && self.ready && self.config.refresh_time_ms > 0 {
            self.refresh_deadline = Some(
                std::time::Instant::now() + Duration::from_millis(self.config.refresh_time_ms),
            );
            self.shared.refresh_active.store(true, Ordering::Release);
        } else {
            self.refresh_deadline = None;
            self.shared.refresh_active.store(false, Ordering::Release);
        }
    }

    fn rewrite_leds(&mut self) {
        if !(self.ready && self.enabled) {
            self.refresh_deadline = None;
            self.shared.refresh_active.store(false, Ordering::Release);
            return;
        }
        let copy = self.shared.last_values.lock().clone();
        if copy.is_empty() || !self.on || self.shared.in_error.load(Ordering::Acquire) {
            return;
        }
        match self.driver.write(&copy) {
            Ok(()) => perf::global().record_written(&self.component),
            Err(err) => self.set_in_error(&err.to_string()),
        }
    }

    /// Write `count` all-black frames, separated by the driver's latch
    /// time, and leave the stored vector black.
    fn write_black(&mut self, count: usize) {
        let black = vec![ColorRgb::BLACK; self.config.led_count];
        for i in 0..count {
            {
                let mut last = self.shared.last_values.lock();
                last.clear();
                last.extend_from_slice(&black);
            }
            if let Err(err) = self.driver.write(&black) {
                warn!("device '{}': write black failed: {}", self.driver.name(), err);
                return;
            }
            let latch = self.driver.latch_time_ms();
            if latch > 0 && i + 1 < count {
                thread::sleep(Duration::from_millis(latch));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockInner {
        writes: Mutex<Vec<Vec<ColorRgb>>>,
        power_ons: AtomicUsize,
        power_offs: AtomicUsize,
        fail_writes: AtomicBool,
        fail_opens: AtomicBool,
    }

    struct MockDriver {
        inner: Arc<MockInner>,
    }

    impl LedDriver for MockDriver {
        fn name(&self) -> &str {
            "mock"
        }

        fn init(&mut self, _config: &Value) -> DeviceResult<()> {
            Ok(())
        }

        fn open(&mut self) -> DeviceResult<()> {
            if self.inner.fail_opens.load(Ordering::Relaxed) {
                return Err(DeviceError::Io("open failed".to_string()));
            }
            Ok(())
        }

        fn close(&mut self) -> DeviceResult<()> {
            Ok(())
        }

        fn write(&mut self, values: &[ColorRgb]) -> DeviceResult<()> {
            if self.inner.fail_writes.load(Ordering::Relaxed) {
                return Err(DeviceError::Io("write failed".to_string()));
            }
            self.inner.writes.lock().push(values.to_vec());
            Ok(())
        }

        fn power_on(&mut self) -> DeviceResult<()> {
            self.inner.power_ons.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn power_off(&mut self) -> DeviceResult<()> {
            self.inner.power_offs.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn spawn_mock(config: Value) -> (Dispatcher, Arc<MockInner>) {
        let inner = Arc::new(MockInner::default());
        let driver = MockDriver {
            inner: inner.clone(),
        };
        (Dispatcher::spawn(Box::new(driver), config), inner)
    }

    fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn enable_powers_on_and_updates_write() {
        let (dispatcher, inner) = spawn_mock(serde_json::json!({ "currentLedCount": 2 }));
        let handle = dispatcher.handle();

        wait_for(|| handle.state() == DeviceState::On);
        assert_eq!(inner.power_ons.load(Ordering::Relaxed), 1);

        let values = vec![ColorRgb::new(1, 2, 3), ColorRgb::new(4, 5, 6)];
        handle.update_leds(&values).unwrap();
        wait_for(|| !inner.writes.lock().is_empty());
        assert_eq!(inner.writes.lock()[0], values);

        dispatcher.stop();
    }

    #[test]
    fn disable_writes_black_and_powers_off() {
        let (dispatcher, inner) = spawn_mock(serde_json::json!({ "currentLedCount": 3 }));
        let handle = dispatcher.handle();
        wait_for(|| handle.state() == DeviceState::On);

        handle.disable();
        wait_for(|| handle.state() == DeviceState::Ready);

        let writes = inner.writes.lock();
        let black = vec![ColorRgb::BLACK; 3];
        assert!(writes.iter().any(|w| *w == black));
        assert_eq!(inner.power_offs.load(Ordering::Relaxed), 1);
        assert_eq!(handle.last_values(), black);
        drop(writes);

        // While disabled, updates are rejected.
        assert!(matches!(
            handle.update_leds(&[ColorRgb::BLACK; 3]),
            Err(DeviceError::NotReady)
        ));

        dispatcher.stop();
    }

    #[test]
    fn write_failure_enters_error_and_recovers() {
        let (dispatcher, inner) = spawn_mock(serde_json::json!({
            "currentLedCount": 1,
            "retryDelay": 1500,
        }));
        let handle = dispatcher.handle();
        wait_for(|| handle.state() == DeviceState::On);

        inner.fail_writes.store(true, Ordering::Relaxed);
        let _ = handle.update_leds(&[ColorRgb::new(9, 9, 9)]);
        wait_for(|| handle.is_in_error());
        assert_eq!(handle.state(), DeviceState::Error);

        // Updates bounce while in error.
        assert!(matches!(
            handle.update_leds(&[ColorRgb::BLACK]),
            Err(DeviceError::NotReady)
        ));

        // Let the cooldown elapse; the device re-opens and resumes.
        inner.fail_writes.store(false, Ordering::Relaxed);
        wait_for(|| handle.state() == DeviceState::On);
        handle.update_leds(&[ColorRgb::new(7, 7, 7)]).unwrap();
        wait_for(|| {
            inner
                .writes
                .lock()
                .iter()
                .any(|w| w == &vec![ColorRgb::new(7, 7, 7)])
        });

        dispatcher.stop();
    }

    #[test]
    fn refresh_timer_rewrites_last_values() {
        let (dispatcher, inner) = spawn_mock(serde_json::json!({
            "currentLedCount": 1,
            "refreshTime": 20,
        }));
        let handle = dispatcher.handle();
        wait_for(|| handle.state() == DeviceState::On);

        handle.update_leds(&[ColorRgb::new(5, 5, 5)]).unwrap();
        // Several refresh periods: the same vector is rewritten.
        wait_for(|| inner.writes.lock().len() >= 3);
        let writes = inner.writes.lock();
        assert!(writes.iter().all(|w| *w == vec![ColorRgb::new(5, 5, 5)]));

        dispatcher.stop();
    }
}
