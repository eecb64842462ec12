//! Motor coordinator: the single task allowed to write the motor bus.
//!
//! The writer loop drains the command queue; while the queue is empty it
//! round-robins status polls across both motors with the half-duplex
//! turn-around gap between writes. Commands carrying a completion wait hold
//! the queue until the motor reports arrival or the wait times out. A
//! companion reader task reframes inbound bytes and updates per-motor state
//! keyed by the frame id byte; state never changes anywhere else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use needle_types::{MotorId, MotorState};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};

use crate::frame::{self, StatusReport};
use crate::queue::CommandQueue;
use crate::transport::{FrameAccumulator, SerialTransport};

/// Default acceptance window for completion waits, in encoder counts
/// (≈1.25 mm on motor 2).
pub const COMPLETION_TOLERANCE: u16 = 50;

/// Hard cap on a completion wait.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between position checks during a completion wait.
pub const POSITION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Minimum gap between writes; the drives need turn-around time on the
/// half-duplex bus.
pub const BUS_TURNAROUND: Duration = Duration::from_millis(5);

/// Shared per-motor state, updated only by the coordinator's reader path.
#[derive(Debug, Clone, Default)]
pub struct MotorStates {
    inner: Arc<Mutex<[MotorState; MotorId::COUNT]>>,
}

impl MotorStates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [MotorState; MotorId::COUNT]> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest state of one motor.
    #[must_use]
    pub fn snapshot(&self, motor: MotorId) -> MotorState {
        self.lock()[motor.index()]
    }

    /// Latest state of both motors, taken under one lock.
    #[must_use]
    pub fn snapshot_all(&self) -> [MotorState; MotorId::COUNT] {
        *self.lock()
    }

    /// Apply a parsed status report for `motor`.
    pub fn apply(&self, motor: MotorId, report: StatusReport) {
        let mut states = self.lock();
        states[motor.index()] = MotorState {
            set_pos: report.set_pos,
            position: report.position,
            force_raw: report.force_raw,
            sensor: report.sensor,
        };
    }

    /// Reset both motors to defaults. Used when a link is (re)opened.
    pub fn reset(&self) {
        *self.lock() = [MotorState::default(); MotorId::COUNT];
    }
}

/// Handle on a running coordinator: its two tasks and its liveness counter.
#[derive(Debug)]
pub struct CoordinatorHandle {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    heartbeat: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    /// Monotonic count of writer-loop iterations. The supervisor watches
    /// this advance; a frozen value means the loop is stuck.
    #[must_use]
    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Relaxed)
    }

    /// Whether both tasks are still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.writer.is_finished() && !self.reader.is_finished()
    }

    /// Stop both tasks. The transport (and the port it owns) survives.
    pub fn shutdown(&self) {
        self.writer.abort();
        self.reader.abort();
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the coordinator's writer and reader tasks on the given transport.
#[must_use]
pub fn spawn_coordinator(
    transport: Arc<SerialTransport>,
    queue: Arc<CommandQueue>,
    states: MotorStates,
) -> CoordinatorHandle {
    let heartbeat = Arc::new(AtomicU64::new(0));
    let writer = tokio::spawn(write_loop(
        transport.clone(),
        queue,
        states.clone(),
        heartbeat.clone(),
    ));
    let reader = tokio::spawn(read_loop(transport, states));
    CoordinatorHandle {
        writer,
        reader,
        heartbeat,
    }
}

async fn write_loop(
    transport: Arc<SerialTransport>,
    queue: Arc<CommandQueue>,
    states: MotorStates,
    heartbeat: Arc<AtomicU64>,
) {
    loop {
        heartbeat.fetch_add(1, Ordering::Relaxed);
        if let Some(command) = queue.try_pop() {
            trace!(motor = u8::from(command.motor), "issuing queued command");
            if let Err(err) = transport.write_frame(&command.bytes).await {
                warn!(%err, "dropping queued command after write failure");
                sleep(Duration::from_millis(100)).await;
                continue;
            }
            sleep(BUS_TURNAROUND).await;
            if let Some(wait) = command.wait {
                wait_for_arrival(&transport, &states, command.motor, wait).await;
            }
        } else {
            for motor in [MotorId::One, MotorId::Two] {
                if let Err(err) = transport.write_frame(&frame::status_read(motor)).await {
                    warn!(%err, "status poll write failed");
                    sleep(Duration::from_millis(100)).await;
                    break;
                }
                sleep(BUS_TURNAROUND).await;
            }
        }
    }
}

/// Hold the queue until `motor` reports a position within the wait's
/// tolerance, polling its status so fresh reports keep arriving. On
/// timeout, log and move on; the position latch is left as the last report
/// set it.
async fn wait_for_arrival(
    transport: &SerialTransport,
    states: &MotorStates,
    motor: MotorId,
    wait: crate::queue::CompletionWait,
) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let position = states.snapshot(motor).position;
        let distance = (i32::from(position) - i32::from(wait.target)).unsigned_abs();
        if distance <= u32::from(wait.tolerance) {
            debug!(
                motor = u8::from(motor),
                position,
                target = wait.target,
                "arrival detected, releasing queue"
            );
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                motor = u8::from(motor),
                position,
                target = wait.target,
                timeout = ?WAIT_TIMEOUT,
                "completion wait timed out, proceeding with next command"
            );
            return;
        }
        if let Err(err) = transport.write_frame(&frame::status_read(motor)).await {
            warn!(%err, "status poll during completion wait failed");
        }
        sleep(POSITION_POLL_INTERVAL).await;
    }
}

async fn read_loop(transport: Arc<SerialTransport>, states: MotorStates) {
    let mut accumulator = FrameAccumulator::new();
    let mut buf = [0u8; 256];
    loop {
        match transport.read_chunk(&mut buf).await {
            Ok(0) => {
                // EOF: the port went away. The writer will surface errors;
                // nothing more to read here.
                debug!("motor port reached EOF, reader stopping");
                return;
            }
            Ok(n) => {
                accumulator.push(&buf[..n]);
                while let Some(frame) = accumulator.next_frame() {
                    let Ok(motor) = MotorId::try_from(frame.id) else {
                        trace!(id = frame.id, "status frame for unknown motor id");
                        continue;
                    };
                    match StatusReport::parse(&frame) {
                        Ok(report) => states.apply(motor, report),
                        Err(err) => trace!(%err, "undersized status frame ignored"),
                    }
                }
            }
            Err(err) => {
                warn!(%err, "serial read failed");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
