//! Coordinator watchdog.
//!
//! Checks the coordinator's liveness counter on a slow cadence. A frozen
//! counter triggers force recovery (clear the queue, restart the reader and
//! writer tasks on the preserved port); three consecutive failures close
//! the port, tell every client, and signal the process to exit nonzero.

use std::sync::Arc;
use std::time::Duration;

use futures::Sink;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, warn};

use crate::protocol::ServerMessage;
use crate::server::App;

/// How often the watchdog samples the heartbeat.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Stall detections before the port is declared unrecoverable.
pub const MAX_RECOVERY_FAILURES: u32 = 3;

/// Spawn the watchdog. When recovery fails [`MAX_RECOVERY_FAILURES`] times
/// in a row the port is closed, clients are notified, and `fatal` is
/// signalled so `main` can return a nonzero exit code.
#[must_use]
pub fn spawn_supervisor<S>(app: Arc<App<S>>, fatal: Arc<Notify>) -> JoinHandle<()>
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    tokio::spawn(async move {
        let mut last_beat: Option<u64> = None;
        let mut failures: u32 = 0;
        loop {
            sleep(WATCHDOG_INTERVAL).await;
            match app.instrument.heartbeat().await {
                None => {
                    last_beat = None;
                    failures = 0;
                }
                Some(beat) if last_beat == Some(beat) => {
                    failures += 1;
                    if failures >= MAX_RECOVERY_FAILURES {
                        error!("coordinator unrecoverable, closing motor port");
                        app.instrument.disconnect().await;
                        app.clients
                            .broadcast(&ServerMessage::Error {
                                result: "motor coordinator unrecoverable; port closed".to_owned(),
                            })
                            .await;
                        fatal.notify_one();
                        return;
                    }
                    warn!(failures, "coordinator stalled, forcing recovery");
                    app.instrument.force_recovery().await;
                    // Baseline against the fresh counter so a still-stuck
                    // coordinator keeps counting as a failure.
                    last_beat = app.instrument.heartbeat().await;
                }
                Some(beat) => {
                    failures = 0;
                    last_beat = Some(beat);
                }
            }
        }
    })
}
