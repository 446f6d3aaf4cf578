use serde::{Deserialize, Serialize};

/// Authoritative lock/door/alarm state of the latch.
///
/// `alarm_active` is derived: every setter re-evaluates it, so
/// `alarm_active == locked && !door_closed` holds for every value of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceState {
    locked: bool,
    door_closed: bool,
    alarm_active: bool,
}

impl DeviceState {
    pub fn new(locked: bool, door_closed: bool) -> Self {
        let mut state = Self {
            locked,
            door_closed,
            alarm_active: false,
        };
        state.derive_alarm();
        state
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn door_closed(&self) -> bool {
        self.door_closed
    }

    pub fn alarm_active(&self) -> bool {
        self.alarm_active
    }

    /// Returns `true` when the lock state actually changed.
    pub fn set_locked(&mut self, locked: bool) -> bool {
        let changed = self.locked != locked;
        self.locked = locked;
        self.derive_alarm();
        changed
    }

    pub fn toggle_locked(&mut self) -> bool {
        self.set_locked(!self.locked);
        self.locked
    }

    /// Returns `true` when the door reading actually changed.
    pub fn set_door_closed(&mut self, door_closed: bool) -> bool {
        let changed = self.door_closed != door_closed;
        self.door_closed = door_closed;
        self.derive_alarm();
        changed
    }

    pub fn status_payload(&self) -> StatusPayload {
        StatusPayload {
            is_locked: self.locked,
            door_closed: self.door_closed,
            alarm_triggered: self.alarm_active,
        }
    }

    fn derive_alarm(&mut self) {
        self.alarm_active = self.locked && !self.door_closed;
    }
}

/// A requested lock state received from the remote control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockCommand {
    pub locked: bool,
}

impl LockCommand {
    pub fn new(locked: bool) -> Self {
        Self { locked }
    }
}

/// Who changed the lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSource {
    Manual,
    Remote,
}

impl LockSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Remote => "remote",
        }
    }
}

pub fn lock_label(locked: bool) -> &'static str {
    if locked {
        "LOCKED"
    } else {
        "UNLOCKED"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndicatorColor {
    Off,
    Red,
    Green,
}

impl IndicatorColor {
    /// Per-channel on/off for the red, green and blue LEDs.
    pub fn channels(self) -> (bool, bool, bool) {
        match self {
            Self::Off => (false, false, false),
            Self::Red => (true, false, false),
            Self::Green => (false, true, false),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Red => "RED",
            Self::Green => "GREEN",
        }
    }
}

/// Output command for the physical actuators, executed by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorAction {
    MoveServo(u32),
    ReleaseServo,
    SetIndicator(IndicatorColor),
    SetTone(u32),
}

/// Record published on the remote status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub is_locked: bool,
    pub door_closed: bool,
    pub alarm_triggered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatchStatus {
    #[serde(rename = "isLocked")]
    pub is_locked: bool,
    #[serde(rename = "doorClosed")]
    pub door_closed: bool,
    #[serde(rename = "alarmTriggered")]
    pub alarm_triggered: bool,
    #[serde(rename = "servoAngle")]
    pub servo_angle: Option<u32>,
    #[serde(rename = "servoAttached")]
    pub servo_attached: bool,
    pub indicator: &'static str,
    #[serde(rename = "toneHz")]
    pub tone_hz: u32,
    #[serde(rename = "alarmSequence")]
    pub alarm_sequence: &'static str,
    #[serde(rename = "bellSequence")]
    pub bell_sequence: &'static str,
    #[serde(rename = "cloudConnected")]
    pub cloud_connected: bool,
}
