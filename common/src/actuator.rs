//! Maps the device state onto servo, indicator and tone outputs.
//!
//! The controller owns two timed sequences. The alarm sequence blinks the
//! indicator and alternates two tones while the alarm condition holds. The
//! bell sequence plays two tones after a doorbell press. The alarm preempts the
//! bell on every iteration, but the bell timer keeps running underneath it: a
//! bell that outlives the alarm resumes at its current phase, and one whose
//! deadline passes during the alarm ends silently.
//!
//! Outputs are emitted as [`ActuatorAction`]s only when they change, except
//! that an idle tone generator is silenced on every iteration.

use crate::{
    config::LatchConfig,
    types::{ActuatorAction, DeviceState, IndicatorColor},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmPhase {
    /// Phase 0: low tone, indicator dark.
    Low,
    /// Phase 1: high tone, indicator red.
    High,
}

impl AlarmPhase {
    fn flipped(self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmSequence {
    Idle,
    Blinking { phase: AlarmPhase, flipped_at: u64 },
}

impl AlarmSequence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Blinking { .. } => "BLINKING",
        }
    }

    fn advance(self, alarm_active: bool, now_ms: u64, blink_ms: u64) -> Self {
        if !alarm_active {
            return Self::Idle;
        }

        match self {
            Self::Idle => Self::Blinking {
                phase: AlarmPhase::Low,
                flipped_at: now_ms,
            },
            Self::Blinking { phase, flipped_at } if now_ms.saturating_sub(flipped_at) >= blink_ms => {
                Self::Blinking {
                    phase: phase.flipped(),
                    flipped_at: now_ms,
                }
            }
            blinking => blinking,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BellSequence {
    Idle,
    RingPhase1 { started_at: u64 },
    RingPhase2 { started_at: u64 },
}

impl BellSequence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::RingPhase1 { .. } => "RING_PHASE_1",
            Self::RingPhase2 { .. } => "RING_PHASE_2",
        }
    }

    pub fn is_ringing(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    fn advance(self, now_ms: u64, phase_ms: u64) -> Self {
        let started_at = match self {
            Self::Idle => return Self::Idle,
            Self::RingPhase1 { started_at } | Self::RingPhase2 { started_at } => started_at,
        };

        let elapsed = now_ms.saturating_sub(started_at);
        if elapsed < phase_ms {
            Self::RingPhase1 { started_at }
        } else if elapsed < phase_ms.saturating_mul(2) {
            Self::RingPhase2 { started_at }
        } else {
            Self::Idle
        }
    }
}

/// Snapshot of what the actuators are currently driven to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorFrame {
    pub servo_angle: Option<u32>,
    pub servo_attached: bool,
    pub indicator: Option<IndicatorColor>,
    pub tone_hz: u32,
    pub alarm: AlarmSequence,
    pub bell: BellSequence,
}

#[derive(Debug, Clone, Copy, Default)]
struct ServoState {
    angle: Option<u32>,
    attached: bool,
    release_at: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ActuatorController {
    config: LatchConfig,
    alarm: AlarmSequence,
    bell: BellSequence,
    servo: ServoState,
    indicator: Option<IndicatorColor>,
    tone_hz: Option<u32>,
}

impl ActuatorController {
    pub fn new(config: &LatchConfig) -> Self {
        Self {
            config: config.clone(),
            alarm: AlarmSequence::Idle,
            bell: BellSequence::Idle,
            servo: ServoState::default(),
            indicator: None,
            tone_hz: None,
        }
    }

    pub fn alarm(&self) -> AlarmSequence {
        self.alarm
    }

    pub fn bell(&self) -> BellSequence {
        self.bell
    }

    pub fn frame(&self) -> ActuatorFrame {
        ActuatorFrame {
            servo_angle: self.servo.angle,
            servo_attached: self.servo.attached,
            indicator: self.indicator,
            tone_hz: self.tone_hz.unwrap_or(0),
            alarm: self.alarm,
            bell: self.bell,
        }
    }

    /// Arms the bell sequence. A press while the bell is already ringing is
    /// ignored so the running sequence is not restarted.
    pub fn ring_bell(&mut self, now_ms: u64) -> bool {
        self.bell = self.bell.advance(now_ms, self.config.bell_phase_ms);
        if self.bell.is_ringing() {
            return false;
        }
        self.bell = BellSequence::RingPhase1 { started_at: now_ms };
        true
    }

    pub fn update(&mut self, state: DeviceState, now_ms: u64) -> Vec<ActuatorAction> {
        let mut actions = Vec::new();

        self.update_servo(state.locked(), now_ms, &mut actions);

        self.alarm = self
            .alarm
            .advance(state.alarm_active(), now_ms, self.config.alarm_blink_ms);
        self.bell = self.bell.advance(now_ms, self.config.bell_phase_ms);

        let (indicator, tone_hz) = match (self.alarm, self.bell) {
            (AlarmSequence::Blinking { phase, .. }, _) => match phase {
                AlarmPhase::High => (IndicatorColor::Red, self.config.alarm_tone_high_hz),
                AlarmPhase::Low => (IndicatorColor::Off, self.config.alarm_tone_low_hz),
            },
            (AlarmSequence::Idle, BellSequence::RingPhase1 { .. }) => {
                (solid_color(state), self.config.bell_tone_first_hz)
            }
            (AlarmSequence::Idle, BellSequence::RingPhase2 { .. }) => {
                (solid_color(state), self.config.bell_tone_second_hz)
            }
            (AlarmSequence::Idle, BellSequence::Idle) => (solid_color(state), 0),
        };

        if self.indicator != Some(indicator) {
            self.indicator = Some(indicator);
            actions.push(ActuatorAction::SetIndicator(indicator));
        }

        let idle = self.alarm == AlarmSequence::Idle && !self.bell.is_ringing();
        if idle || self.tone_hz != Some(tone_hz) {
            self.tone_hz = Some(tone_hz);
            actions.push(ActuatorAction::SetTone(tone_hz));
        }

        actions
    }

    fn update_servo(&mut self, locked: bool, now_ms: u64, actions: &mut Vec<ActuatorAction>) {
        let target = if locked {
            self.config.locked_angle
        } else {
            self.config.unlocked_angle
        };

        if self.servo.angle != Some(target) {
            actions.push(ActuatorAction::MoveServo(target));
            self.servo = ServoState {
                angle: Some(target),
                attached: true,
                release_at: self
                    .config
                    .servo_release_after_ms
                    .map(|delay| now_ms.saturating_add(delay)),
            };
            return;
        }

        if let Some(release_at) = self.servo.release_at {
            if now_ms >= release_at {
                actions.push(ActuatorAction::ReleaseServo);
                self.servo.attached = false;
                self.servo.release_at = None;
            }
        }
    }
}

fn solid_color(state: DeviceState) -> IndicatorColor {
    if state.locked() {
        IndicatorColor::Red
    } else {
        IndicatorColor::Green
    }
}
