use anyhow::{anyhow, Context};
use esp_idf_hal::{
    gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcChannel, LedcDriver, LedcTimer, LedcTimerDriver},
    peripheral::Peripheral,
    units::FromValueType,
};
use log::warn;

use latch_common::{ActuatorAction, IndicatorColor, InputSample, PinConfig};

const SERVO_FREQ_HZ: u32 = 50;
const SERVO_PERIOD_US: u32 = 20_000;
const SERVO_MIN_PULSE_US: u32 = 500;
const SERVO_MAX_PULSE_US: u32 = 2_400;
const SERVO_MAX_ANGLE: u32 = 180;
const BUZZER_IDLE_FREQ_HZ: u32 = 1_000;

type InputPin = PinDriver<'static, AnyIOPin, Input>;
type OutputPin = PinDriver<'static, AnyOutputPin, Output>;

/// Pulled-up buttons and the door switch. All read active-low.
pub struct LatchInputs {
    bell: InputPin,
    toggle: InputPin,
    door: InputPin,
}

impl LatchInputs {
    pub fn new(pins: &PinConfig) -> anyhow::Result<Self> {
        Ok(Self {
            bell: pulled_up_input(pins.bell_button).context("bell button")?,
            toggle: pulled_up_input(pins.toggle_button).context("toggle button")?,
            door: pulled_up_input(pins.door_switch).context("door switch")?,
        })
    }

    pub fn sample(&self) -> InputSample {
        InputSample {
            door_closed: self.door.is_low(),
            toggle_pressed: self.toggle.is_low(),
            bell_pressed: self.bell.is_low(),
        }
    }
}

fn pulled_up_input(pin: i32) -> anyhow::Result<InputPin> {
    let mut driver = PinDriver::input(unsafe { AnyIOPin::new(pin) })
        .with_context(|| format!("GPIO{pin} input init failed"))?;
    driver.set_pull(Pull::Up)?;
    Ok(driver)
}

/// Servo, RGB indicator and buzzer.
pub struct LatchOutputs {
    servo: LedcDriver<'static>,
    buzzer: LedcDriver<'static>,
    buzzer_timer: u32,
    red: OutputPin,
    green: OutputPin,
    blue: OutputPin,
}

impl LatchOutputs {
    pub fn new<TS, CS, TB, CB>(
        servo_timer: impl Peripheral<P = TS> + 'static,
        servo_channel: impl Peripheral<P = CS> + 'static,
        buzzer_timer: impl Peripheral<P = TB> + 'static,
        buzzer_channel: impl Peripheral<P = CB> + 'static,
        pins: &PinConfig,
    ) -> anyhow::Result<Self>
    where
        TS: LedcTimer + 'static,
        CS: LedcChannel<SpeedMode = TS::SpeedMode>,
        TB: LedcTimer + 'static,
        CB: LedcChannel<SpeedMode = TB::SpeedMode>,
    {
        let servo_timer = LedcTimerDriver::new(
            servo_timer,
            &TimerConfig::default().frequency(SERVO_FREQ_HZ.Hz().into()),
        )
        .context("servo LEDC timer init failed")?;
        let servo = LedcDriver::new(servo_channel, servo_timer, unsafe {
            AnyOutputPin::new(pins.servo)
        })
        .context("servo LEDC channel init failed")?;

        let buzzer_timer_id = TB::timer();
        let buzzer_timer = LedcTimerDriver::new(
            buzzer_timer,
            &TimerConfig::default().frequency(BUZZER_IDLE_FREQ_HZ.Hz().into()),
        )
        .context("buzzer LEDC timer init failed")?;
        let mut buzzer = LedcDriver::new(buzzer_channel, buzzer_timer, unsafe {
            AnyOutputPin::new(pins.buzzer)
        })
        .context("buzzer LEDC channel init failed")?;
        buzzer.set_duty(0)?;

        let mut outputs = Self {
            servo,
            buzzer,
            buzzer_timer: buzzer_timer_id,
            red: output(pins.rgb_red)?,
            green: output(pins.rgb_green)?,
            blue: output(pins.rgb_blue)?,
        };
        outputs.set_indicator(IndicatorColor::Off)?;
        Ok(outputs)
    }

    pub fn execute(&mut self, action: ActuatorAction) {
        let result = match action {
            ActuatorAction::MoveServo(angle) => self.move_servo(angle),
            ActuatorAction::ReleaseServo => self.servo.set_duty(0).map_err(Into::into),
            ActuatorAction::SetIndicator(color) => self.set_indicator(color),
            ActuatorAction::SetTone(hz) => self.set_tone(hz),
        };
        if let Err(err) = result {
            warn!("actuator {action:?} failed: {err:#}");
        }
    }

    fn move_servo(&mut self, angle: u32) -> anyhow::Result<()> {
        let max_duty = self.servo.get_max_duty();
        self.servo.set_duty(servo_duty(angle, max_duty))?;
        Ok(())
    }

    fn set_indicator(&mut self, color: IndicatorColor) -> anyhow::Result<()> {
        let (red, green, blue) = color.channels();
        drive_active_low(&mut self.red, red)?;
        drive_active_low(&mut self.green, green)?;
        drive_active_low(&mut self.blue, blue)?;
        Ok(())
    }

    fn set_tone(&mut self, hz: u32) -> anyhow::Result<()> {
        if hz == 0 {
            self.buzzer.set_duty(0)?;
            return Ok(());
        }

        let rc = unsafe {
            esp_idf_hal::sys::ledc_set_freq(
                esp_idf_hal::sys::ledc_mode_t_LEDC_LOW_SPEED_MODE,
                self.buzzer_timer,
                hz,
            )
        };
        if rc != esp_idf_hal::sys::ESP_OK {
            return Err(anyhow!("ledc_set_freq({hz}) failed with code {rc}"));
        }
        let half = self.buzzer.get_max_duty() / 2;
        self.buzzer.set_duty(half)?;
        Ok(())
    }
}

fn output(pin: i32) -> anyhow::Result<OutputPin> {
    PinDriver::output(unsafe { AnyOutputPin::new(pin) })
        .with_context(|| format!("GPIO{pin} output init failed"))
}

fn drive_active_low(pin: &mut OutputPin, on: bool) -> anyhow::Result<()> {
    if on {
        pin.set_low()?;
    } else {
        pin.set_high()?;
    }
    Ok(())
}

fn servo_duty(angle: u32, max_duty: u32) -> u32 {
    let angle = angle.min(SERVO_MAX_ANGLE);
    let pulse_us =
        SERVO_MIN_PULSE_US + (SERVO_MAX_PULSE_US - SERVO_MIN_PULSE_US) * angle / SERVO_MAX_ANGLE;
    let duty = u64::from(max_duty) * u64::from(pulse_us) / u64::from(SERVO_PERIOD_US);
    duty.try_into().unwrap_or(max_duty)
}
