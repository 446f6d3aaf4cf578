use serde::{Deserialize, Serialize};

use crate::topics::DEFAULT_DEVICE_ID;

/// Shortest delay before the servo may be released after a move.
pub const SERVO_SETTLE_MIN_MS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatchConfig {
    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
    pub alarm_blink_ms: u64,
    pub alarm_tone_high_hz: u32,
    pub alarm_tone_low_hz: u32,
    pub bell_phase_ms: u64,
    pub bell_tone_first_hz: u32,
    pub bell_tone_second_hz: u32,
    pub locked_angle: u32,
    pub unlocked_angle: u32,
    /// Detach the servo this long after a move; `None` keeps it powered.
    #[serde(default)]
    pub servo_release_after_ms: Option<u64>,
    pub status_publish_interval_ms: u64,
    pub inbox_capacity: usize,
}

impl Default for LatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            debounce_ms: 250,
            alarm_blink_ms: 300,
            alarm_tone_high_hz: 2_000,
            alarm_tone_low_hz: 1_000,
            bell_phase_ms: 500,
            bell_tone_first_hz: 600,
            bell_tone_second_hz: 400,
            locked_angle: 90,
            unlocked_angle: 0,
            servo_release_after_ms: None,
            status_publish_interval_ms: 3_000,
            inbox_capacity: 5,
        }
    }
}

impl LatchConfig {
    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(1, 100);
        self.debounce_ms = self.debounce_ms.clamp(20, 2_000);
        self.alarm_blink_ms = self.alarm_blink_ms.clamp(50, 5_000);
        self.bell_phase_ms = self.bell_phase_ms.clamp(50, 5_000);
        self.locked_angle = self.locked_angle.min(180);
        self.unlocked_angle = self.unlocked_angle.min(180);
        self.servo_release_after_ms = self
            .servo_release_after_ms
            .map(|delay| delay.clamp(SERVO_SETTLE_MIN_MS, 5_000));
        self.status_publish_interval_ms = self.status_publish_interval_ms.clamp(500, 60_000);
        self.inbox_capacity = self.inbox_capacity.clamp(1, 64);
    }
}

/// GPIO wiring of the latch board. All inputs are active-low with pull-ups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinConfig {
    pub bell_button: i32,
    pub toggle_button: i32,
    pub door_switch: i32,
    pub rgb_red: i32,
    pub rgb_green: i32,
    pub rgb_blue: i32,
    pub servo: i32,
    pub buzzer: i32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            bell_button: 21,
            toggle_button: 19,
            door_switch: 18,
            rgb_red: 25,
            rgb_green: 33,
            rgb_blue: 32,
            servo: 26,
            buzzer: 23,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub device_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            device_id: DEFAULT_DEVICE_ID.to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        let cleaned: String = self
            .device_id
            .trim()
            .chars()
            .filter(|ch| !matches!(ch, '/' | '#' | '+') && !ch.is_whitespace())
            .collect();
        self.device_id = if cleaned.is_empty() {
            DEFAULT_DEVICE_ID.to_string()
        } else {
            cleaned
        };

        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub latch: LatchConfig,
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.latch.sanitize();
        self.network.sanitize();
    }
}
