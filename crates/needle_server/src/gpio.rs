//! Panel GPIO: five debounced inputs and the three indicator LEDs.
//!
//! Inputs are wired active-low against internal pull-ups. A watcher task
//! samples the lines and pushes debounced edges onto a channel the server's
//! event loop consumes; the debouncer itself is pure so it can be driven by
//! synthetic samples in tests. The LED bank is handed to the indicator
//! controller, the only writer of the output pins.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use needle_types::{HardwareError, IndicatorState};
use rppal::gpio::{Gpio, InputPin, OutputPin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::indicator::LedSink;
use crate::protocol::{GpioSnapshot, unix_now};

/// Debounce window for every input line.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

/// Input sampling interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub const LED_BLUE_PIN: u8 = 17;
pub const LED_RED_PIN: u8 = 27;
pub const LED_GREEN_PIN: u8 = 22;

/// The five panel inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputLine {
    /// Needle tip seated in the holder.
    TipPresent,

    /// Needle short-circuit sense.
    ShortSense,

    /// Operator START button.
    StartButton,

    /// Operator PASS button.
    PassButton,

    /// Operator NG button.
    NgButton,
}

impl InputLine {
    pub const ALL: [InputLine; 5] = [
        InputLine::TipPresent,
        InputLine::ShortSense,
        InputLine::StartButton,
        InputLine::PassButton,
        InputLine::NgButton,
    ];

    /// BCM pin number of this line.
    #[must_use]
    pub fn bcm(self) -> u8 {
        match self {
            InputLine::TipPresent => 11,
            InputLine::ShortSense => 5,
            InputLine::StartButton => 6,
            InputLine::PassButton => 13,
            InputLine::NgButton => 19,
        }
    }

    fn index(self) -> usize {
        match self {
            InputLine::TipPresent => 0,
            InputLine::ShortSense => 1,
            InputLine::StartButton => 2,
            InputLine::PassButton => 3,
            InputLine::NgButton => 4,
        }
    }
}

/// One debounced edge on a panel input.
#[derive(Debug, Clone, Copy)]
pub struct InputEvent {
    pub line: InputLine,
    pub active: bool,
    pub timestamp: f64,
}

/// 50 ms debouncer for one line. A change of level must hold for the whole
/// window before it is accepted.
#[derive(Debug, Clone)]
pub struct Debouncer {
    stable: bool,
    candidate: bool,
    since: Option<Instant>,
    window: Duration,
}

impl Debouncer {
    #[must_use]
    pub fn new(initial: bool, window: Duration) -> Self {
        Debouncer {
            stable: initial,
            candidate: initial,
            since: None,
            window,
        }
    }

    /// Feed one sample. Returns the new stable level when an edge is
    /// accepted.
    pub fn sample(&mut self, level: bool, now: Instant) -> Option<bool> {
        if level == self.stable {
            self.candidate = level;
            self.since = None;
            return None;
        }
        if level != self.candidate {
            self.candidate = level;
            self.since = Some(now);
            return None;
        }
        match self.since {
            Some(start) if now.duration_since(start) >= self.window => {
                self.stable = level;
                self.since = None;
                Some(level)
            }
            Some(_) => None,
            None => {
                self.since = Some(now);
                None
            }
        }
    }

    /// Current debounced level.
    #[must_use]
    pub fn state(&self) -> bool {
        self.stable
    }
}

/// The five input pins, pulled up; a line reads active when low.
#[derive(Debug)]
pub struct InputBank {
    pins: [InputPin; 5],
}

impl InputBank {
    /// Claim the panel input pins.
    pub fn open(gpio: &Gpio) -> Result<Self, HardwareError> {
        let mut pins = Vec::with_capacity(InputLine::ALL.len());
        for line in InputLine::ALL {
            let pin = gpio
                .get(line.bcm())
                .map_err(|err| {
                    HardwareError::GpioUnavailable(format!("input pin {}: {err}", line.bcm()))
                })?
                .into_input_pullup();
            pins.push(pin);
        }
        let pins = pins
            .try_into()
            .map_err(|_| HardwareError::GpioUnavailable("input pin count mismatch".to_owned()))?;
        Ok(InputBank { pins })
    }

    /// Raw (undebounced) read of one line.
    #[must_use]
    pub fn read(&self, line: InputLine) -> bool {
        self.pins[line.index()].is_low()
    }

    /// Raw read of every line, for the `gpio_read` command.
    #[must_use]
    pub fn snapshot(&self) -> GpioSnapshot {
        GpioSnapshot {
            tip_present: self.read(InputLine::TipPresent),
            short: self.read(InputLine::ShortSense),
            start: self.read(InputLine::StartButton),
            pass: self.read(InputLine::PassButton),
            ng: self.read(InputLine::NgButton),
        }
    }
}

/// Lock-free mirror of the raw input levels, kept fresh by the watcher so
/// the `gpio_read` command never touches the pins from another task.
#[derive(Debug)]
pub struct InputLevels {
    bits: [AtomicBool; 5],
}

impl Default for InputLevels {
    fn default() -> Self {
        InputLevels {
            bits: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }
}

impl InputLevels {
    pub fn set(&self, line: InputLine, active: bool) {
        self.bits[line.index()].store(active, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, line: InputLine) -> bool {
        self.bits[line.index()].load(Ordering::Relaxed)
    }

    /// Copy the current raw levels from the pins.
    pub fn seed(&self, bank: &InputBank) {
        for line in InputLine::ALL {
            self.set(line, bank.read(line));
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> GpioSnapshot {
        GpioSnapshot {
            tip_present: self.get(InputLine::TipPresent),
            short: self.get(InputLine::ShortSense),
            start: self.get(InputLine::StartButton),
            pass: self.get(InputLine::PassButton),
            ng: self.get(InputLine::NgButton),
        }
    }
}

/// Spawn the sampling task, which takes ownership of the pins. Debounced
/// edges land on `events`; raw levels mirror into `levels`.
#[must_use]
pub fn spawn_input_watcher(
    bank: InputBank,
    levels: Arc<InputLevels>,
    events: mpsc::Sender<InputEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        levels.seed(&bank);
        let mut debouncers: Vec<Debouncer> = InputLine::ALL
            .iter()
            .map(|&line| Debouncer::new(bank.read(line), DEBOUNCE_WINDOW))
            .collect();
        debug!("gpio input watcher running");
        loop {
            sleep(POLL_INTERVAL).await;
            let now = Instant::now();
            for line in InputLine::ALL {
                let level = bank.read(line);
                levels.set(line, level);
                if let Some(active) = debouncers[line.index()].sample(level, now) {
                    let event = InputEvent {
                        line,
                        active,
                        timestamp: unix_now(),
                    };
                    if events.send(event).await.is_err() {
                        debug!("event channel closed, input watcher stopping");
                        return;
                    }
                }
            }
        }
    })
}

/// The three indicator output pins.
#[derive(Debug)]
pub struct GpioLeds {
    blue: OutputPin,
    red: OutputPin,
    green: OutputPin,
}

impl GpioLeds {
    /// Claim the LED pins, all off.
    pub fn open(gpio: &Gpio) -> Result<Self, HardwareError> {
        let claim = |pin: u8| {
            gpio.get(pin)
                .map(rppal::gpio::Pin::into_output_low)
                .map_err(|err| HardwareError::GpioUnavailable(format!("led pin {pin}: {err}")))
        };
        Ok(GpioLeds {
            blue: claim(LED_BLUE_PIN)?,
            red: claim(LED_RED_PIN)?,
            green: claim(LED_GREEN_PIN)?,
        })
    }
}

impl LedSink for GpioLeds {
    fn apply(&mut self, state: IndicatorState) {
        self.blue.set_low();
        self.red.set_low();
        self.green.set_low();
        match state {
            IndicatorState::Off => {}
            IndicatorState::Blue => self.blue.set_high(),
            IndicatorState::Red => self.red.set_high(),
            IndicatorState::Green => self.green.set_high(),
        }
    }
}

/// LED sink for hosts without GPIO. Keeps the rest of the server alive.
#[derive(Debug, Default)]
pub struct NullLeds;

impl LedSink for NullLeds {
    fn apply(&mut self, _state: IndicatorState) {}
}
