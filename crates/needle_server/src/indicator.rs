//! Indicator controller: owns the latches and the LED bank.
//!
//! Every input edge, latch command, and recorded verdict funnels through
//! this controller, which reruns the pure lamp evaluation and writes the
//! LED bank only when the result changes. Nothing else in the process
//! touches the LED pins.

use needle_types::{IndicatorState, LatchFlags, NeedleState, Verdict, evaluate};
use serde::Serialize;
use tracing::{debug, info};

/// Destination for lamp changes. The production sink drives the GPIO LED
/// bank; tests record transitions.
pub trait LedSink: Send {
    fn apply(&mut self, state: IndicatorState);
}

/// Per-LED levels for the `led_control status` query.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct LedStatus {
    pub blue: bool,
    pub red: bool,
    pub green: bool,
}

impl From<IndicatorState> for LedStatus {
    fn from(state: IndicatorState) -> Self {
        LedStatus {
            blue: state == IndicatorState::Blue,
            red: state == IndicatorState::Red,
            green: state == IndicatorState::Green,
        }
    }
}

pub struct IndicatorController {
    tip_present: bool,
    short_active: bool,
    latches: LatchFlags,
    verdict: Option<Verdict>,
    current: IndicatorState,
    leds: Box<dyn LedSink>,
}

impl IndicatorController {
    /// Build with everything off and no tip.
    pub fn new(mut leds: Box<dyn LedSink>) -> Self {
        leds.apply(IndicatorState::Off);
        IndicatorController {
            tip_present: false,
            short_active: false,
            latches: LatchFlags::default(),
            verdict: None,
            current: IndicatorState::Off,
            leds,
        }
    }

    /// Seed the input levels read at startup (a tip may already be seated).
    pub fn sync_inputs(&mut self, tip_present: bool, short_active: bool) -> IndicatorState {
        self.tip_present = tip_present;
        self.short_active = short_active;
        self.reevaluate()
    }

    fn needle(&self) -> NeedleState {
        NeedleState::from_inputs(self.tip_present, self.short_active)
    }

    fn reevaluate(&mut self) -> IndicatorState {
        let next = evaluate(self.needle(), self.latches, self.verdict, self.current);
        if next != self.current {
            debug!(from = self.current.as_str(), to = next.as_str(), "lamp change");
            self.current = next;
            self.leds.apply(next);
        }
        self.current
    }

    /// Debounced tip-present edge. Removal ends the operator cycle: every
    /// latch and the verdict are cleared.
    pub fn on_tip_present(&mut self, present: bool) -> IndicatorState {
        if !present && self.tip_present {
            info!("tip removed, clearing cycle latches");
            self.latches.clear();
            self.verdict = None;
        }
        self.tip_present = present;
        self.reevaluate()
    }

    /// Debounced short-sense edge.
    pub fn on_short_sense(&mut self, active: bool) -> IndicatorState {
        self.short_active = active;
        self.reevaluate()
    }

    /// START/STOP from the UI. START latches a live short as a fixed
    /// abnormality; STOP clears the cycle latches and verdict.
    pub fn set_started(&mut self, started: bool) -> IndicatorState {
        if started {
            self.latches.started = true;
            if self.needle() == NeedleState::NeedleShort {
                info!("short present at START, latching red");
                self.latches.needle_short_fixed = true;
            }
        } else {
            self.latches.clear();
            self.verdict = None;
        }
        self.reevaluate()
    }

    /// Explicit short-fixed latch from the UI.
    pub fn set_short_fixed(&mut self, state: bool) -> IndicatorState {
        self.latches.needle_short_fixed = state;
        self.reevaluate()
    }

    /// Record a PASS/NG verdict. Only a started cycle with a tip seated can
    /// be judged, and the first judgment of a cycle wins.
    pub fn record_verdict(&mut self, verdict: Verdict) -> IndicatorState {
        if !self.latches.started || !self.tip_present || self.latches.judgment_completed {
            return self.current;
        }
        self.verdict = Some(verdict);
        let state = self.reevaluate();
        self.latches.judgment_completed = true;
        info!(?verdict, lamp = state.as_str(), "judgment latched");
        state
    }

    /// Force a lamp from the `led_control` command. Latches are untouched.
    pub fn force(&mut self, state: IndicatorState) -> IndicatorState {
        self.current = state;
        self.leds.apply(state);
        state
    }

    /// Turn everything off (last client gone, shutdown).
    pub fn all_off(&mut self) {
        self.force(IndicatorState::Off);
    }

    #[must_use]
    pub fn current(&self) -> IndicatorState {
        self.current
    }

    #[must_use]
    pub fn led_status(&self) -> LedStatus {
        LedStatus::from(self.current)
    }

    #[must_use]
    pub fn tip_present(&self) -> bool {
        self.tip_present
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.latches.started
    }
}
