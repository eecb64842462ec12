//! Panel event fan-out.
//!
//! Consumes debounced GPIO edges, feeds the indicator controller first so
//! lamps and telemetry agree, then notifies clients: every edge goes to the
//! debugging panel as `gpio_state_change`, and button presses additionally
//! raise their dedicated events while a tip is connected.

use std::sync::Arc;

use futures::Sink;
use needle_types::Verdict;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::gpio::{InputEvent, InputLine};
use crate::protocol::{ButtonPress, GpioEdge, ServerMessage};
use crate::server::App;

pub async fn event_loop<S>(app: Arc<App<S>>, mut events: mpsc::Receiver<InputEvent>)
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    while let Some(event) = events.recv().await {
        debug!(line = ?event.line, active = event.active, "panel edge");
        let tip_present = {
            let mut indicator = app.indicator();
            match event.line {
                InputLine::TipPresent => {
                    indicator.on_tip_present(event.active);
                }
                InputLine::ShortSense => {
                    indicator.on_short_sense(event.active);
                }
                InputLine::PassButton if event.active => {
                    indicator.record_verdict(Verdict::Pass);
                }
                InputLine::NgButton if event.active => {
                    indicator.record_verdict(Verdict::Ng);
                }
                _ => {}
            }
            indicator.tip_present()
        };

        let edge = ServerMessage::GpioStateChange {
            data: GpioEdge {
                pin: event.line.bcm(),
                state: if event.active { "HIGH" } else { "LOW" }.to_owned(),
                timestamp: event.timestamp,
            },
        };
        app.clients.broadcast(&edge).await;

        if event.active && tip_present {
            let press = ButtonPress {
                triggered: true,
                timestamp: event.timestamp,
            };
            let button = match event.line {
                InputLine::StartButton => Some(ServerMessage::GpioStartButton { data: press }),
                InputLine::PassButton => Some(ServerMessage::GpioPassButton { data: press }),
                InputLine::NgButton => Some(ServerMessage::GpioNgButton { data: press }),
                _ => None,
            };
            if let Some(message) = button {
                app.clients.broadcast(&message).await;
            }
        }
    }
    debug!("input event channel closed, event loop ending");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{test_app, try_recv_json};
    use needle_types::IndicatorState;

    fn event(line: InputLine, active: bool) -> InputEvent {
        InputEvent {
            line,
            active,
            timestamp: 1.0,
        }
    }

    #[tokio::test]
    async fn pass_button_with_tip_absent_emits_no_button_event() {
        let (app, mut rx) = test_app().await;
        let (tx, events) = mpsc::channel(8);
        let task = tokio::spawn(event_loop(app.clone(), events));

        tx.send(event(InputLine::PassButton, true)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        // Only the raw edge reaches the debug panel.
        let first = try_recv_json(&mut rx).unwrap();
        assert_eq!(first["type"], "gpio_state_change");
        assert_eq!(first["data"]["pin"], 13);
        assert!(try_recv_json(&mut rx).is_none());
        assert_eq!(app.indicator().current(), IndicatorState::Off);
    }

    #[tokio::test]
    async fn start_button_with_tip_present_fans_out() {
        let (app, mut rx) = test_app().await;
        let (tx, events) = mpsc::channel(8);
        let task = tokio::spawn(event_loop(app.clone(), events));

        tx.send(event(InputLine::TipPresent, true)).await.unwrap();
        tx.send(event(InputLine::StartButton, true)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let tip_edge = try_recv_json(&mut rx).unwrap();
        assert_eq!(tip_edge["data"]["pin"], 11);
        let start_edge = try_recv_json(&mut rx).unwrap();
        assert_eq!(start_edge["data"]["pin"], 6);
        let button = try_recv_json(&mut rx).unwrap();
        assert_eq!(button["type"], "gpio_start_button");
        assert_eq!(button["data"]["triggered"], true);
    }

    #[tokio::test]
    async fn ng_button_records_verdict_during_started_cycle() {
        let (app, mut rx) = test_app().await;
        let (tx, events) = mpsc::channel(8);
        let task = tokio::spawn(event_loop(app.clone(), events));

        tx.send(event(InputLine::TipPresent, true)).await.unwrap();
        app.indicator().set_started(true);
        tx.send(event(InputLine::NgButton, true)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(app.indicator().current(), IndicatorState::Red);
        // tip edge, ng edge, ng button
        let mut types = Vec::new();
        while let Some(value) = try_recv_json(&mut rx) {
            types.push(value["type"].as_str().unwrap().to_owned());
        }
        assert!(types.contains(&"gpio_ng_button".to_owned()));
    }
}
