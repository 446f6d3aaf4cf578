use std::sync::Arc;

use crate::{
    actuator::{ActuatorController, ActuatorFrame},
    config::LatchConfig,
    inbox::CommandReceiver,
    input::{InputEvaluator, InputSample},
    persist::{LockStore, LOCKED_KEY},
    store::StateStore,
    types::{ActuatorAction, DeviceState, LatchStatus, LockSource},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatchEvent {
    LockChanged { locked: bool, source: LockSource },
    /// Remote command matched the current lock state.
    CommandIgnored { locked: bool },
    DoorChanged { closed: bool },
    BellRung,
    PersistFailed { locked: bool, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatchTick {
    pub actions: Vec<ActuatorAction>,
    pub events: Vec<LatchEvent>,
}

/// Startup state: persisted lock value plus a live door reading.
pub fn restore_state(persistence: &impl LockStore, door_closed: bool) -> DeviceState {
    DeviceState::new(persistence.get_bool(LOCKED_KEY, false), door_closed)
}

pub fn latch_status(state: DeviceState, frame: &ActuatorFrame, cloud_connected: bool) -> LatchStatus {
    LatchStatus {
        is_locked: state.locked(),
        door_closed: state.door_closed(),
        alarm_triggered: state.alarm_active(),
        servo_angle: frame.servo_angle,
        servo_attached: frame.servo_attached,
        indicator: frame.indicator.map(|color| color.as_str()).unwrap_or("OFF"),
        tone_hz: frame.tone_hz,
        alarm_sequence: frame.alarm.as_str(),
        bell_sequence: frame.bell.as_str(),
        cloud_connected,
    }
}

/// Body of the hardware loop. Owns everything that may touch actuators.
///
/// Each `tick` applies at most one remote command, then the manual inputs,
/// then re-evaluates the actuators against the resulting state. A command and
/// a manual toggle landing in the same tick are applied command first.
pub struct LatchEngine<S> {
    state: Arc<StateStore>,
    inbox: CommandReceiver,
    inputs: InputEvaluator,
    actuators: ActuatorController,
    persistence: S,
}

impl<S: LockStore> LatchEngine<S> {
    pub fn new(
        config: &LatchConfig,
        state: Arc<StateStore>,
        inbox: CommandReceiver,
        persistence: S,
    ) -> Self {
        Self {
            state,
            inbox,
            inputs: InputEvaluator::new(config),
            actuators: ActuatorController::new(config),
            persistence,
        }
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn actuators(&self) -> &ActuatorController {
        &self.actuators
    }

    pub fn persistence(&self) -> &S {
        &self.persistence
    }

    /// Drives every output once from the current state.
    pub fn start(&mut self, now_ms: u64) -> Vec<ActuatorAction> {
        let snapshot = self.state.read();
        self.actuators.update(snapshot, now_ms)
    }

    pub fn tick(&mut self, sample: InputSample, now_ms: u64) -> LatchTick {
        let mut events = Vec::new();
        let mut persist = None;

        if let Some(command) = self.inbox.poll() {
            let changed = self.state.mutate(|state| state.set_locked(command.locked));
            if changed {
                events.push(LatchEvent::LockChanged {
                    locked: command.locked,
                    source: LockSource::Remote,
                });
                persist = Some(command.locked);
            } else {
                events.push(LatchEvent::CommandIgnored {
                    locked: command.locked,
                });
            }
        }

        let outcome = self.inputs.evaluate(&self.state, sample, now_ms);

        if let Some(closed) = outcome.door_changed {
            events.push(LatchEvent::DoorChanged { closed });
        }
        if let Some(locked) = outcome.toggled {
            events.push(LatchEvent::LockChanged {
                locked,
                source: LockSource::Manual,
            });
            persist = Some(locked);
        }
        if outcome.bell_pressed && self.actuators.ring_bell(now_ms) {
            events.push(LatchEvent::BellRung);
        }

        // Written after the state lock is released.
        if let Some(locked) = persist {
            if let Err(err) = self.persistence.put_bool(LOCKED_KEY, locked) {
                events.push(LatchEvent::PersistFailed {
                    locked,
                    error: err.to_string(),
                });
            }
        }

        let actions = self.actuators.update(outcome.state, now_ms);
        LatchTick { actions, events }
    }
}
