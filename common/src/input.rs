use crate::{config::LatchConfig, store::StateStore, types::DeviceState};

/// One poll of the physical inputs, already converted from active-low levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputSample {
    pub door_closed: bool,
    pub toggle_pressed: bool,
    pub bell_pressed: bool,
}

/// Minimum spacing between accepted edges of a noisy button.
#[derive(Debug, Clone, Copy)]
pub struct DebounceTimer {
    window_ms: u64,
    last_event_ms: Option<u64>,
}

impl DebounceTimer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_event_ms: None,
        }
    }

    /// Accepts the press when the window since the last accepted one has
    /// elapsed, and restarts the window.
    pub fn accept(&mut self, now_ms: u64) -> bool {
        let open = self
            .last_event_ms
            .map(|last| now_ms.saturating_sub(last) >= self.window_ms)
            .unwrap_or(true);
        if open {
            self.last_event_ms = Some(now_ms);
        }
        open
    }

    pub fn last_event_ms(&self) -> Option<u64> {
        self.last_event_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputOutcome {
    /// State as written by this evaluation, read in the same critical section.
    pub state: DeviceState,
    /// New lock value when the manual toggle flipped it.
    pub toggled: Option<bool>,
    /// New door reading when it changed.
    pub door_changed: Option<bool>,
    /// Doorbell went from released to pressed.
    pub bell_pressed: bool,
}

/// Input debouncer and alarm evaluator for the hardware loop.
#[derive(Debug, Clone)]
pub struct InputEvaluator {
    toggle: DebounceTimer,
    bell_was_pressed: bool,
}

impl InputEvaluator {
    pub fn new(config: &LatchConfig) -> Self {
        Self {
            toggle: DebounceTimer::new(config.debounce_ms),
            bell_was_pressed: false,
        }
    }

    pub fn evaluate(&mut self, store: &StateStore, sample: InputSample, now_ms: u64) -> InputOutcome {
        let toggle_accepted = sample.toggle_pressed && self.toggle.accept(now_ms);

        let bell_pressed = sample.bell_pressed && !self.bell_was_pressed;
        self.bell_was_pressed = sample.bell_pressed;

        // Door, lock and the derived alarm land in one critical section.
        let (state, door_changed, toggled) = store.mutate(|state| {
            let door_changed = state
                .set_door_closed(sample.door_closed)
                .then_some(sample.door_closed);
            let toggled = toggle_accepted.then(|| state.toggle_locked());
            (*state, door_changed, toggled)
        });

        InputOutcome {
            state,
            toggled,
            door_changed,
            bell_pressed,
        }
    }
}
