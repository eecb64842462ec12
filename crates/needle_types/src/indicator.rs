//! Indicator-lamp state machine.
//!
//! The lamp is a pure function of the needle state, the latch flags, and the
//! current measurement verdict. No other code path decides LED colors; the
//! server feeds every input change through [`evaluate`] and writes whatever
//! comes back to the LED bank.

use serde::{Deserialize, Serialize};

/// Needle connection state derived from the tip-present and short-sense
/// inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedleState {
    /// No tip inserted.
    Disconnected,

    /// Tip inserted and the short-sense line is active.
    NeedleShort,

    /// Tip inserted, no short.
    Connected,
}

impl NeedleState {
    /// Derive the needle state from the two panel inputs.
    #[must_use]
    pub fn from_inputs(tip_present: bool, short_active: bool) -> Self {
        match (tip_present, short_active) {
            (false, _) => NeedleState::Disconnected,
            (true, true) => NeedleState::NeedleShort,
            (true, false) => NeedleState::Connected,
        }
    }
}

/// Which indicator lamp is lit. Exactly one color, or all off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorState {
    #[default]
    Off,
    Blue,
    Red,
    Green,
}

impl IndicatorState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IndicatorState::Off => "off",
            IndicatorState::Blue => "blue",
            IndicatorState::Red => "red",
            IndicatorState::Green => "green",
        }
    }
}

/// PASS/NG outcome of a single inspection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Ng,
}

/// Operator-cycle latches. Mutated by the control server on explicit UI
/// commands or button edges; cleared on STOP or tip removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatchFlags {
    /// START was received and the inspection cycle is running.
    pub started: bool,

    /// A PASS/NG verdict has been recorded this cycle; the lamp holds it.
    pub judgment_completed: bool,

    /// A short was present at the moment of START; red is latched even if
    /// the short later clears.
    pub needle_short_fixed: bool,
}

impl LatchFlags {
    /// Clear everything an operator cycle latched. Applied on STOP and on
    /// tip removal.
    pub fn clear(&mut self) {
        *self = LatchFlags::default();
    }
}

/// Select the indicator lamp for the given inputs.
///
/// Priority ladder, highest first:
/// 1. tip absent masks everything — off
/// 2. a completed judgment holds the current lamp
/// 3. short-at-START latch — red
/// 4. live short while started — red
/// 5. verdict while started — red (NG) or green (PASS)
/// 6. tip connected — blue (idle ready)
/// 7. otherwise off
#[must_use]
pub fn evaluate(
    needle: NeedleState,
    latches: LatchFlags,
    verdict: Option<Verdict>,
    current: IndicatorState,
) -> IndicatorState {
    if needle == NeedleState::Disconnected {
        return IndicatorState::Off;
    }
    if latches.judgment_completed {
        return current;
    }
    if latches.needle_short_fixed {
        return IndicatorState::Red;
    }
    if needle == NeedleState::NeedleShort && latches.started {
        return IndicatorState::Red;
    }
    if latches.started {
        match verdict {
            Some(Verdict::Ng) => return IndicatorState::Red,
            Some(Verdict::Pass) => return IndicatorState::Green,
            None => {}
        }
    }
    if needle == NeedleState::Connected {
        return IndicatorState::Blue;
    }
    IndicatorState::Off
}
