//! Two-phase deceleration planning for motor 2 speed moves.
//!
//! The drive has no "decelerate at position X" primitive, so a decelerated
//! move is split into two queued commands: fast to the decel point with a
//! completion wait, then slow to the target. Queue ordering guarantees
//! phase 2 is issued only after phase 1 arrives (or its wait times out);
//! nothing races the polling loop.

use needle_types::MotorId;
use typed_builder::TypedBuilder;

use crate::coordinator::COMPLETION_TOLERANCE;
use crate::frame;
use crate::queue::QueuedCommand;

/// Deceleration parameters for a speed move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct DecelProfile {
    /// Distance before the target at which to slow down, in millimetres.
    pub distance_mm: u16,

    /// Speed for the final approach.
    pub slow_speed: u16,
}

/// A speed-mode move request, optionally decelerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct SpeedMove {
    /// Which motor to move.
    pub motor: MotorId,

    /// Absolute target position in encoder counts.
    pub target: i16,

    /// Travel speed (final speed for an undecelerated move).
    pub speed: u16,

    /// Two-phase deceleration, when enabled by the UI.
    #[builder(default)]
    pub decel: Option<DecelProfile>,
}

impl SpeedMove {
    /// Absolute position at which the slow phase begins. Motor 2 travels
    /// toward smaller counts, so the decel point sits *above* the target.
    #[must_use]
    pub fn decel_point(&self, profile: DecelProfile) -> i16 {
        let point = i32::from(self.target)
            + i32::from(profile.distance_mm) * self.motor.counts_per_mm();
        point.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
    }

    /// Expand into the commands to enqueue, in order. The pair must be
    /// queued atomically (`CommandQueue::push_all`) so nothing lands
    /// between the phases.
    #[must_use]
    pub fn plan(&self) -> Vec<QueuedCommand> {
        match self.decel {
            Some(profile) if profile.distance_mm > 0 && profile.slow_speed > 0 => {
                let decel_point = self.decel_point(profile);
                vec![
                    QueuedCommand::awaiting_arrival(
                        frame::speed_move(self.motor, self.speed, decel_point),
                        self.motor,
                        decel_point,
                        COMPLETION_TOLERANCE,
                    ),
                    QueuedCommand::fire_and_forget(
                        frame::speed_move(self.motor, profile.slow_speed, self.target),
                        self.motor,
                    ),
                ]
            }
            _ => vec![QueuedCommand::fire_and_forget(
                frame::speed_move(self.motor, self.speed, self.target),
                self.motor,
            )],
        }
    }
}
