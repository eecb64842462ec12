//! Bounded FIFO of motion commands with wait-for-arrival semantics.
//!
//! Producers are the control-server handlers; the only consumer is the
//! coordinator task. A command may carry a [`CompletionWait`], in which case
//! the coordinator holds the queue until the motor reports a position within
//! tolerance of the target (or the wait times out) before issuing the next
//! command. The two-phase deceleration planner relies on that ordering.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use needle_types::{DriveError, MotorId};

/// Default queue capacity. Far above anything the UI produces; hitting it
/// means the bus is wedged and the push is refused rather than blocking.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Positional completion condition attached to a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionWait {
    /// Absolute target position in encoder counts.
    pub target: i16,

    /// Acceptance window around the target, in counts.
    pub tolerance: u16,
}

/// One framed command awaiting transmission. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    /// Fully framed bytes, ready for the wire.
    pub bytes: Vec<u8>,

    /// Which motor the command addresses.
    pub motor: MotorId,

    /// When present, the coordinator waits for arrival before moving on.
    pub wait: Option<CompletionWait>,
}

impl QueuedCommand {
    /// Command the coordinator issues and immediately moves past.
    #[must_use]
    pub fn fire_and_forget(bytes: Vec<u8>, motor: MotorId) -> Self {
        QueuedCommand {
            bytes,
            motor,
            wait: None,
        }
    }

    /// Command the coordinator issues and then holds the queue on until the
    /// motor arrives at `target` (± `tolerance`) or the wait times out.
    #[must_use]
    pub fn awaiting_arrival(bytes: Vec<u8>, motor: MotorId, target: i16, tolerance: u16) -> Self {
        QueuedCommand {
            bytes,
            motor,
            wait: Some(CompletionWait { target, tolerance }),
        }
    }
}

/// Bounded FIFO shared between the server handlers and the coordinator.
#[derive(Debug)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<QueuedCommand>>,
    capacity: usize,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl CommandQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        CommandQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedCommand>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue one command. Fails with `QueueFull` at capacity instead of
    /// blocking the server.
    pub fn push(&self, command: QueuedCommand) -> Result<(), DriveError> {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            return Err(DriveError::QueueFull {
                capacity: self.capacity,
            });
        }
        queue.push_back(command);
        Ok(())
    }

    /// Enqueue a batch atomically: either every command is admitted in
    /// order with nothing interleaved, or none are.
    pub fn push_all(&self, commands: Vec<QueuedCommand>) -> Result<(), DriveError> {
        let mut queue = self.lock();
        if queue.len() + commands.len() > self.capacity {
            return Err(DriveError::QueueFull {
                capacity: self.capacity,
            });
        }
        queue.extend(commands);
        Ok(())
    }

    /// Take the oldest command, if any. Single consumer.
    pub fn try_pop(&self) -> Option<QueuedCommand> {
        self.lock().pop_front()
    }

    /// Drop everything queued. Invoked on disconnect and force recovery.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of commands waiting. Telemetry gauge.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(tag: u8) -> QueuedCommand {
        QueuedCommand::fire_and_forget(vec![tag], MotorId::One)
    }

    #[test]
    fn pops_in_push_order() {
        let queue = CommandQueue::default();
        for tag in 0..5 {
            queue.push(cmd(tag)).unwrap();
        }
        for tag in 0..5 {
            assert_eq!(queue.try_pop().unwrap().bytes, vec![tag]);
        }
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn push_refuses_when_full() {
        let queue = CommandQueue::new(2);
        queue.push(cmd(0)).unwrap();
        queue.push(cmd(1)).unwrap();
        assert!(matches!(
            queue.push(cmd(2)),
            Err(DriveError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn push_all_is_all_or_nothing() {
        let queue = CommandQueue::new(3);
        queue.push(cmd(0)).unwrap();
        assert!(queue.push_all(vec![cmd(1), cmd(2), cmd(3)]).is_err());
        assert_eq!(queue.depth(), 1);

        queue.push_all(vec![cmd(1), cmd(2)]).unwrap();
        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.try_pop().unwrap().bytes, vec![0]);
        assert_eq!(queue.try_pop().unwrap().bytes, vec![1]);
        assert_eq!(queue.try_pop().unwrap().bytes, vec![2]);
    }

    #[test]
    fn clear_empties_the_queue() {
        let queue = CommandQueue::default();
        queue.push(cmd(0)).unwrap();
        queue.push(cmd(1)).unwrap();
        queue.clear();
        assert_eq!(queue.depth(), 0);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn interleaved_producers_stay_fifo() {
        let queue = std::sync::Arc::new(CommandQueue::new(64));
        let a = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for tag in 0..16 {
                    queue.push(cmd(tag)).unwrap();
                }
            })
        };
        let b = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for tag in 16..32 {
                    queue.push(cmd(tag)).unwrap();
                }
            })
        };
        a.join().unwrap();
        b.join().unwrap();

        // Each producer's commands come out in its own push order.
        let mut last_a = None;
        let mut last_b = None;
        while let Some(command) = queue.try_pop() {
            let tag = command.bytes[0];
            if tag < 16 {
                assert!(last_a < Some(tag));
                last_a = Some(tag);
            } else {
                assert!(last_b < Some(tag));
                last_b = Some(tag);
            }
        }
        assert_eq!(last_a, Some(15));
        assert_eq!(last_b, Some(31));
    }
}
