//! Status broadcast loop.
//!
//! Samples both motor states, the queue depth, and the operator flags at
//! the status cadence and pushes one `type="status"` line to every client.
//! A slow or failing client only loses its own stream; when the last client
//! drops, the lamps go dark.

use std::sync::Arc;
use std::time::Duration;

use futures::Sink;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::ServerMessage;
use crate::server::App;

/// Cadence of the status stream (~200 Hz).
pub const STATUS_INTERVAL: Duration = Duration::from_millis(5);

/// Poll interval while no motor link is up.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(100);

#[must_use]
pub fn spawn_telemetry<S>(app: Arc<App<S>>) -> JoinHandle<()>
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    tokio::spawn(async move {
        loop {
            sleep(STATUS_INTERVAL).await;
            if !app.instrument.is_connected().await {
                sleep(IDLE_INTERVAL).await;
                continue;
            }
            if app.clients.count().await == 0 {
                continue;
            }
            let message = ServerMessage::Status {
                data: app.status_snapshot(),
            };
            let outcome = app.clients.broadcast(&message).await;
            if outcome.dropped > 0 && outcome.remaining == 0 {
                app.indicator().all_off();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{recv_json, test_app};
    use needle_drive::SerialTransport;

    #[tokio::test(start_paused = true)]
    async fn status_lines_flow_while_connected() {
        let (app, mut rx) = test_app().await;
        let (ours, _far) = tokio::io::duplex(4096);
        app.instrument
            .attach(Arc::new(SerialTransport::new(ours)))
            .await;

        let task = spawn_telemetry(app.clone());
        let value = recv_json(&mut rx).await.unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["data"]["command_queue_size"], 0);
        assert_eq!(value["data"]["is_started"], false);
        task.abort();
    }
}
