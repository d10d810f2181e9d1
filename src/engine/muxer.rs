//! Priority Multiplexer
//!
//! Arbitrates between concurrent color sources. Every registered input
//! lives under a numeric priority (lower wins); activation carries an
//! absolute deadline, and a reserved black sentinel at priority 255
//! keeps the selection total. State changes surface as [`MuxerEvent`]s
//! returned to the engine loop, which forwards them on its channels.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::image::ColorRgb;

/// Reserved lowest priority, always present.
pub const LOWEST_PRIORITY: u8 = 255;
/// Below this, effect/color records with deadlines get periodic
/// time-runner service.
const LOWEST_EFFECT_PRIORITY: u8 = 254;
/// Deadline value meaning "registered but awaiting data".
pub const TIMEOUT_INACTIVE: i64 = -100;
/// Sticky deadline (never expires).
const TIMEOUT_STICKY: i64 = 0;

/// Origin component of a priority input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Color,
    Effect,
    Image,
    VideoGrabber,
    NetworkStream,
    Audio,
}

/// One registered color source.
#[derive(Debug, Clone)]
pub struct InputInfo {
    pub priority: u8,
    /// Absolute deadline (ms since epoch), [`TIMEOUT_STICKY`], or
    /// [`TIMEOUT_INACTIVE`]. The sentinel uses -1.
    pub timeout_ms: i64,
    pub component: Component,
    pub origin: String,
    pub smooth_cfg: u32,
    pub static_color: ColorRgb,
    pub owner: String,
}

/// Notifications produced by state-changing calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerEvent {
    PrioritiesChanged,
    VisiblePriorityChanged(u8),
    VisibleComponentChanged(Component),
    /// Throttled tick for active color/effect inputs with deadlines.
    TimeRunner,
}

pub struct PriorityMuxer {
    current_priority: u8,
    previous_priority: u8,
    manual_selected: Option<u8>,
    auto_select: bool,
    active_inputs: BTreeMap<u8, InputInfo>,
    prev_visible_component: Component,
    /// Time-runner throttle: no emission before this instant.
    block_until_ms: i64,
    /// Deferred time-runner retry while blocked.
    timer_deadline_ms: Option<i64>,
}

fn sentinel() -> InputInfo {
    InputInfo {
        priority: LOWEST_PRIORITY,
        timeout_ms: -1,
        component: Component::Color,
        origin: "System".to_string(),
        smooth_cfg: 0,
        static_color: ColorRgb::BLACK,
        owner: String::new(),
    }
}

impl PriorityMuxer {
    pub fn new() -> Self {
        let mut active_inputs = BTreeMap::new();
        active_inputs.insert(LOWEST_PRIORITY, sentinel());
        debug!("muxer initialized");
        Self {
            current_priority: LOWEST_PRIORITY,
            previous_priority: LOWEST_PRIORITY,
            manual_selected: None,
            auto_select: true,
            active_inputs,
            prev_visible_component: Component::Color,
            block_until_ms: 0,
            timer_deadline_ms: None,
        }
    }

    pub fn current_priority(&self) -> u8 {
        self.current_priority
    }

    pub fn previous_priority(&self) -> u8 {
        self.previous_priority
    }

    pub fn auto_select(&self) -> bool {
        self.auto_select
    }

    pub fn priorities(&self) -> Vec<u8> {
        self.active_inputs.keys().copied().collect()
    }

    pub fn has_priority(&self, priority: u8) -> bool {
        priority == LOWEST_PRIORITY || self.active_inputs.contains_key(&priority)
    }

    /// Info for a priority, falling back to the sentinel.
    pub fn input_info(&self, priority: u8) -> &InputInfo {
        self.active_inputs
            .get(&priority)
            .unwrap_or_else(|| &self.active_inputs[&LOWEST_PRIORITY])
    }

    pub fn visible_input(&self) -> &InputInfo {
        self.input_info(self.current_priority)
    }

    fn component_of(&self, priority: u8) -> Component {
        self.input_info(priority).component
    }

    /// Create or refresh a record. New records start inactive.
    pub fn register_input(
        &mut self,
        priority: u8,
        component: Component,
        origin: &str,
        static_color: ColorRgb,
        smooth_cfg: u32,
        owner: &str,
    ) -> Vec<MuxerEvent> {
        let new_input = !self.active_inputs.contains_key(&priority);
        let reused = !new_input
            && (self.prev_visible_component == component
                || self.active_inputs[&priority].component == component);

        let entry = self.active_inputs.entry(priority).or_insert_with(|| InputInfo {
            priority,
            timeout_ms: TIMEOUT_INACTIVE,
            component,
            origin: origin.to_string(),
            smooth_cfg,
            static_color,
            owner: owner.to_string(),
        });
        entry.component = component;
        entry.origin = origin.to_string();
        entry.smooth_cfg = smooth_cfg;
        entry.static_color = static_color;
        entry.owner = owner.to_string();

        if new_input {
            info!(
                "registered new input '{}' ({:?}) at priority {} as inactive",
                origin, component, priority
            );
            if !self.auto_select {
                return vec![MuxerEvent::PrioritiesChanged];
            }
            return Vec::new();
        }

        // Streams re-register per frame; only interactive sources need
        // the refresh notification.
        if reused && component != Component::NetworkStream {
            return vec![MuxerEvent::PrioritiesChanged];
        }
        Vec::new()
    }

    /// Activate (or deactivate) a registered record. `timeout_ms` is
    /// relative: positive values become absolute deadlines, 0 is
    /// sticky, [`TIMEOUT_INACTIVE`] parks the record.
    pub fn set_input(&mut self, priority: u8, timeout_ms: i64, now_ms: i64) -> (bool, Vec<MuxerEvent>) {
        if !self.active_inputs.contains_key(&priority) {
            warn!(
                "set_input without register_input for priority {}; \
                 the record probably timed out",
                priority
            );
            return (false, Vec::new());
        }

        let deadline = if timeout_ms > 0 {
            now_ms + timeout_ms
        } else {
            timeout_ms
        };

        let input = self.active_inputs.get_mut(&priority).unwrap();
        let was_active = input.timeout_ms != TIMEOUT_INACTIVE;
        let now_active = deadline != TIMEOUT_INACTIVE;
        input.timeout_ms = deadline;

        let mut events = Vec::new();
        if was_active != now_active {
            info!(
                "priority {} is now {}",
                priority,
                if now_active { "active" } else { "inactive" }
            );
            if priority > self.current_priority {
                events.push(MuxerEvent::PrioritiesChanged);
            }
            events.extend(self.update(now_ms));
        }
        (true, events)
    }

    pub fn set_input_inactive(&mut self, priority: u8, now_ms: i64) -> (bool, Vec<MuxerEvent>) {
        self.set_input(priority, TIMEOUT_INACTIVE, now_ms)
    }

    /// Remove a record entirely. The sentinel cannot be cleared.
    pub fn clear_input(&mut self, priority: u8, now_ms: i64) -> (bool, Vec<MuxerEvent>) {
        if priority >= LOWEST_PRIORITY {
            return (false, Vec::new());
        }
        let mut events = Vec::new();
        if self.active_inputs.remove(&priority).is_some() {
            info!("removed source priority {}", priority);
            events.extend(self.update(now_ms));
        }
        if !self.auto_select || self.current_priority > priority {
            events.push(MuxerEvent::PrioritiesChanged);
        }
        (true, events)
    }

    /// Drop inputs. Forced: everything goes and the sentinel is
    /// reinstalled. Non-forced: only color/effect/image sources clear,
    /// preserving video and network streams.
    pub fn clear_all(&mut self, force: bool, now_ms: i64) -> Vec<MuxerEvent> {
        if force {
            self.previous_priority = self.current_priority;
            self.active_inputs.clear();
            self.active_inputs.insert(LOWEST_PRIORITY, sentinel());
            self.current_priority = LOWEST_PRIORITY;
            return self.update(now_ms);
        }

        let clearable: Vec<u8> = self
            .active_inputs
            .iter()
            .filter(|(&p, info)| {
                p < LOWEST_PRIORITY - 1
                    && matches!(
                        info.component,
                        Component::Color | Component::Effect | Component::Image
                    )
            })
            .map(|(&p, _)| p)
            .collect();

        let mut events = Vec::new();
        for p in clearable {
            events.extend(self.clear_input(p, now_ms).1);
        }
        events
    }

    /// Toggle automatic source selection. Disabling requires the last
    /// manual selection to still exist.
    pub fn set_auto_select(&mut self, enable: bool, now_ms: i64) -> (bool, Vec<MuxerEvent>) {
        if self.auto_select == enable {
            return (false, Vec::new());
        }
        if !enable
            && !self
                .manual_selected
                .is_some_and(|p| self.active_inputs.contains_key(&p))
        {
            warn!("cannot disable auto selection: manual priority no longer available");
            return (false, Vec::new());
        }
        self.auto_select = enable;
        debug!(
            "source auto select is now {}",
            if enable { "enabled" } else { "disabled" }
        );
        (true, self.update(now_ms))
    }

    /// Pin the visible source to a registered priority.
    pub fn set_manual_priority(&mut self, priority: u8, now_ms: i64) -> (bool, Vec<MuxerEvent>) {
        if !self.active_inputs.contains_key(&priority) {
            return (false, Vec::new());
        }
        self.manual_selected = Some(priority);
        if self.auto_select {
            self.auto_select = false;
            debug!("source auto select is now disabled");
        }
        (true, self.update(now_ms))
    }

    /// Expire deadlines, re-evaluate the visible source, and service
    /// the time-runner. Called on a 250 ms tick and after every
    /// state-changing operation.
    pub fn update(&mut self, now_ms: i64) -> Vec<MuxerEvent> {
        let mut events = Vec::new();
        let mut new_priority = LOWEST_PRIORITY;
        let mut want_time_runner = false;

        let expired: Vec<u8> = self
            .active_inputs
            .values()
            .filter(|i| i.timeout_ms > 0 && i.timeout_ms <= now_ms)
            .map(|i| i.priority)
            .collect();
        for p in expired {
            self.active_inputs.remove(&p);
            info!("timeout clear for priority {}", p);
            events.push(MuxerEvent::PrioritiesChanged);
        }

        for info in self.active_inputs.values() {
            if info.timeout_ms > TIMEOUT_INACTIVE {
                new_priority = new_priority.min(info.priority);
            }
            if info.priority < LOWEST_EFFECT_PRIORITY
                && info.timeout_ms > TIMEOUT_STICKY
                && matches!(
                    info.component,
                    Component::Effect | Component::Color | Component::Image
                )
            {
                want_time_runner = true;
            }
        }

        if !self.auto_select {
            match self.manual_selected {
                Some(p) if self.active_inputs.contains_key(&p) => new_priority = p,
                _ => {
                    debug!("manual priority gone; switching back to auto selection");
                    self.auto_select = true;
                }
            }
        }

        let component = self.component_of(new_priority);
        if self.current_priority != new_priority || component != self.prev_visible_component {
            self.previous_priority = self.current_priority;
            self.current_priority = new_priority;
            info!("set visible priority to {}", new_priority);
            events.push(MuxerEvent::VisiblePriorityChanged(new_priority));
            if component != self.prev_visible_component {
                self.prev_visible_component = component;
                events.push(MuxerEvent::VisibleComponentChanged(component));
            }
            events.push(MuxerEvent::PrioritiesChanged);
        }

        // Deferred retry armed while the throttle window was closed.
        if let Some(deadline) = self.timer_deadline_ms {
            if deadline <= now_ms {
                self.timer_deadline_ms = None;
                want_time_runner = true;
            }
        }
        if want_time_runner {
            events.extend(self.time_trigger(now_ms));
        }

        events
    }

    /// At most one time-runner emission per second; re-arm otherwise.
    fn time_trigger(&mut self, now_ms: i64) -> Vec<MuxerEvent> {
        if now_ms < self.block_until_ms {
            self.timer_deadline_ms = Some(now_ms + 500);
            Vec::new()
        } else {
            self.block_until_ms = now_ms + 1000;
            vec![MuxerEvent::TimeRunner]
        }
    }
}

impl Default for PriorityMuxer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: ColorRgb = ColorRgb::new(255, 0, 0);
    const GREEN: ColorRgb = ColorRgb::new(0, 255, 0);

    fn register_color(m: &mut PriorityMuxer, priority: u8, color: ColorRgb) {
        m.register_input(priority, Component::Color, "test", color, 0, "");
    }

    #[test]
    fn sentinel_is_always_selectable() {
        let mut m = PriorityMuxer::new();
        m.update(0);
        assert_eq!(m.current_priority(), LOWEST_PRIORITY);
        assert_eq!(m.visible_input().static_color, ColorRgb::BLACK);
    }

    #[test]
    fn lowest_active_priority_wins_and_timeouts_expire() {
        let mut m = PriorityMuxer::new();

        register_color(&mut m, 100, RED);
        m.set_input(100, 1000, 0);
        register_color(&mut m, 50, GREEN);
        m.set_input(50, 500, 100);

        m.update(200);
        assert_eq!(m.current_priority(), 50);
        assert_eq!(m.visible_input().static_color, GREEN);

        m.update(700);
        assert_eq!(m.current_priority(), 100);
        assert_eq!(m.visible_input().static_color, RED);

        m.update(1500);
        assert_eq!(m.current_priority(), LOWEST_PRIORITY);
        assert_eq!(m.visible_input().static_color, ColorRgb::BLACK);
    }

    #[test]
    fn register_set_clear_restores_initial_state() {
        let mut m = PriorityMuxer::new();
        let initial_priorities = m.priorities();

        register_color(&mut m, 80, RED);
        m.set_input(80, 1000, 0);
        m.update(10);
        assert_eq!(m.current_priority(), 80);

        m.clear_input(80, 20);
        assert_eq!(m.priorities(), initial_priorities);
        assert_eq!(m.current_priority(), LOWEST_PRIORITY);
        assert!(m.auto_select());
    }

    #[test]
    fn set_input_requires_registration() {
        let mut m = PriorityMuxer::new();
        let (ok, _) = m.set_input(42, 1000, 0);
        assert!(!ok);
    }

    #[test]
    fn inactive_records_are_not_selected() {
        let mut m = PriorityMuxer::new();
        register_color(&mut m, 60, RED);
        m.update(0);
        assert_eq!(m.current_priority(), LOWEST_PRIORITY);

        m.set_input(60, TIMEOUT_STICKY, 0);
        m.update(10);
        assert_eq!(m.current_priority(), 60);

        m.set_input_inactive(60, 20);
        m.update(30);
        assert_eq!(m.current_priority(), LOWEST_PRIORITY);
        // Still registered.
        assert!(m.has_priority(60));
    }

    #[test]
    fn manual_selection_overrides_and_falls_back() {
        let mut m = PriorityMuxer::new();
        register_color(&mut m, 10, RED);
        m.set_input(10, TIMEOUT_STICKY, 0);
        register_color(&mut m, 200, GREEN);
        m.set_input(200, TIMEOUT_STICKY, 0);
        m.update(0);
        assert_eq!(m.current_priority(), 10);

        let (ok, _) = m.set_manual_priority(200, 10);
        assert!(ok);
        assert!(!m.auto_select());
        assert_eq!(m.current_priority(), 200);

        // Clearing the manual selection silently re-enables auto.
        m.clear_input(200, 20);
        assert!(m.auto_select());
        assert_eq!(m.current_priority(), 10);
    }

    #[test]
    fn clear_all_non_forced_preserves_video() {
        let mut m = PriorityMuxer::new();
        register_color(&mut m, 20, RED);
        m.set_input(20, TIMEOUT_STICKY, 0);
        m.register_input(30, Component::VideoGrabber, "grabber", ColorRgb::BLACK, 0, "");
        m.set_input(30, TIMEOUT_STICKY, 0);

        m.clear_all(false, 10);
        assert!(!m.has_priority(20));
        assert!(m.has_priority(30));
        assert_eq!(m.current_priority(), 30);

        m.clear_all(true, 20);
        assert_eq!(m.priorities(), vec![LOWEST_PRIORITY]);
        assert_eq!(m.current_priority(), LOWEST_PRIORITY);
    }

    #[test]
    fn visible_change_emits_events() {
        let mut m = PriorityMuxer::new();
        register_color(&mut m, 90, RED);
        let (_, events) = m.set_input(90, TIMEOUT_STICKY, 0);
        assert!(events.contains(&MuxerEvent::VisiblePriorityChanged(90)));
        assert!(events.contains(&MuxerEvent::PrioritiesChanged));
    }

    #[test]
    fn time_runner_is_throttled_to_one_per_second() {
        let mut m = PriorityMuxer::new();
        register_color(&mut m, 40, RED);
        m.set_input(40, 60_000, 0);

        let count = |events: &[MuxerEvent]| {
            events
                .iter()
                .filter(|e| matches!(e, MuxerEvent::TimeRunner))
                .count()
        };

        // Activation itself consumed the first throttle window at t=0.
        let mut seen = 0;
        for t in (0..2250).step_by(250) {
            seen += count(&m.update(t));
        }
        // Only the t=1000 and t=2000 windows fire during the sweep.
        assert_eq!(seen, 2);
    }
}
