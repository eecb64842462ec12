//! WebSocket control server.
//!
//! One accept loop, one task per client. Each client owns a UUID and a
//! mutex-guarded sink so concurrent senders (command replies, telemetry,
//! event fan-out) cannot interleave partial frames. Messages are JSON lines
//! dispatched on their `cmd` field; see [`crate::protocol`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{Sink, SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use needle_drive::{DecelProfile, QueuedCommand, SerialSettings, SpeedMove, frame};
use needle_types::{
    BadCommand, ControlMode, DriveError, GRAMS_PER_NEWTON, HardwareError, IndicatorState, MotorId,
    TipLayout, TipRecord,
};

use crate::config::Config;
use crate::eeprom::TipEeprom;
use crate::gpio::InputLevels;
use crate::indicator::{IndicatorController, LedSink};
use crate::instrument::Instrument;
use crate::ohmmeter::Ohmmeter;
use crate::protocol::{
    ClientCommand, ConnectRequest, DEFAULT_NEEDLE_SPEED, EepromReadRequest, EepromWriteRequest,
    LedControlRequest, MeasureRequest, MoveRequest, NeedleChange, ServerMessage, StateRequest,
    StatusData, hex_pretty, unix_now,
};

/// A client's send half on a real WebSocket connection.
pub type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Deadline for one client send; a wedged socket is dropped, not waited on.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of a broadcast pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOutcome {
    /// Clients still registered after the pass.
    pub remaining: usize,

    /// Clients removed by this pass.
    pub dropped: usize,
}

/// Connected-clients table with one write lock per client.
pub struct ClientPool<S = WsSink> {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<S>>>>,
}

impl<S> Default for ClientPool<S> {
    fn default() -> Self {
        ClientPool {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> ClientPool<S>
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    pub async fn register(&self, sink: S) -> Uuid {
        let id = Uuid::new_v4();
        self.inner
            .lock()
            .await
            .insert(id, Arc::new(Mutex::new(sink)));
        id
    }

    pub async fn unregister(&self, id: Uuid) -> usize {
        let mut clients = self.inner.lock().await;
        clients.remove(&id);
        clients.len()
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Send to one client; a failure removes it. Returns whether the send
    /// landed.
    pub async fn send_to(&self, id: Uuid, message: &ServerMessage) -> bool {
        let client = self.inner.lock().await.get(&id).cloned();
        let Some(client) = client else {
            return false;
        };
        match send_line(&client, message).await {
            Ok(()) => true,
            Err(reason) => {
                warn!(%id, %reason, "client send failed, dropping client");
                self.unregister(id).await;
                false
            }
        }
    }

    /// Send to every client concurrently, dropping the ones that fail.
    pub async fn broadcast(&self, message: &ServerMessage) -> BroadcastOutcome {
        let clients: Vec<(Uuid, Arc<Mutex<S>>)> = self
            .inner
            .lock()
            .await
            .iter()
            .map(|(id, sink)| (*id, sink.clone()))
            .collect();
        if clients.is_empty() {
            return BroadcastOutcome::default();
        }

        let sends = clients.iter().map(|(id, client)| async move {
            (*id, send_line(client, message).await)
        });
        let results = futures::future::join_all(sends).await;

        let mut dropped = 0;
        let mut table = self.inner.lock().await;
        for (id, result) in results {
            if let Err(reason) = result {
                warn!(%id, %reason, "broadcast send failed, dropping client");
                table.remove(&id);
                dropped += 1;
            }
        }
        BroadcastOutcome {
            remaining: table.len(),
            dropped,
        }
    }
}

async fn send_line<S>(client: &Mutex<S>, message: &ServerMessage) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let line = message.to_line();
    let mut sink = client.lock().await;
    timeout(SEND_TIMEOUT, sink.send(Message::Text(line.into())))
        .await
        .map_err(|_| "send timed out".to_owned())?
        .map_err(|err| err.to_string())
}

/// Everything a connection handler needs, owned in one place.
pub struct App<S = WsSink> {
    pub config: Config,
    pub instrument: Instrument,
    pub clients: ClientPool<S>,
    pub indicator: std::sync::Mutex<IndicatorController>,
    pub inputs: Option<Arc<InputLevels>>,
    pub eeprom: TipEeprom,
    pub ohmmeter: Ohmmeter,
}

impl<S> App<S>
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    #[must_use]
    pub fn new(config: Config, leds: Box<dyn LedSink>, inputs: Option<Arc<InputLevels>>) -> Self {
        let eeprom = TipEeprom::new(config.i2c_bus);
        let ohmmeter = Ohmmeter::new(config.ohmmeter_port.clone());
        App {
            config,
            instrument: Instrument::new(),
            clients: ClientPool::default(),
            indicator: std::sync::Mutex::new(IndicatorController::new(leds)),
            inputs,
            eeprom,
            ohmmeter,
        }
    }

    /// Lock the indicator controller. Short critical sections only; never
    /// held across an await.
    pub fn indicator(&self) -> std::sync::MutexGuard<'_, IndicatorController> {
        self.indicator
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sample everything the status stream carries.
    #[must_use]
    pub fn status_snapshot(&self) -> StatusData {
        let [motor1, motor2] = self.instrument.states.snapshot_all();
        let (tip_present, is_started) = {
            let indicator = self.indicator();
            (indicator.tip_present(), indicator.is_started())
        };
        StatusData {
            position: motor1.position,
            force: motor1.force_newtons(),
            sensor: motor1.sensor,
            set_pos: motor1.set_pos,
            motor2_position: motor2.position,
            motor2_force: motor2.force_newtons(),
            motor2_sensor: motor2.sensor,
            motor2_set_pos: motor2.set_pos,
            command_queue_size: self.instrument.queue.depth(),
            needle_tip_connected: tip_present,
            is_started,
        }
    }
}

/// Accept clients until the listener fails.
pub async fn run(app: Arc<App>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(app, stream).await {
                debug!(%peer, %err, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(app: Arc<App>, stream: TcpStream) -> Result<(), String> {
    let ws = accept_async(stream)
        .await
        .map_err(|err| format!("websocket handshake failed: {err}"))?;
    let (sink, mut source) = ws.split();
    let id = app.clients.register(sink).await;
    info!(%id, "client connected");

    while let Some(incoming) = source.next().await {
        match incoming {
            Ok(Message::Text(text)) => {
                let reply = dispatch(&app, text.as_str()).await;
                app.clients.send_to(id, &reply).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%id, %err, "client read failed");
                break;
            }
        }
    }

    let remaining = app.clients.unregister(id).await;
    info!(%id, remaining, "client disconnected");
    if remaining == 0 {
        app.indicator().all_off();
    }
    Ok(())
}

/// Parse and execute one client message, producing the direct reply.
pub async fn dispatch<S>(app: &App<S>, text: &str) -> ServerMessage
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(err) => {
            return ServerMessage::Error {
                result: BadCommand(err.to_string()).to_string(),
            };
        }
    };
    match command {
        ClientCommand::Connect(req) => handle_connect(app, req).await,
        ClientCommand::Disconnect => {
            let result = if app.instrument.disconnect().await {
                "motor port disconnected"
            } else {
                "port was already closed"
            };
            ServerMessage::Serial {
                result: result.to_owned(),
            }
        }
        ClientCommand::Check => ServerMessage::Serial {
            result: if app.instrument.is_connected().await {
                "connected"
            } else {
                "disconnected"
            }
            .to_owned(),
        },
        ClientCommand::Move(req) => handle_move(app, req).await,
        ClientCommand::GpioRead => match &app.inputs {
            Some(levels) => ServerMessage::Gpio {
                data: levels.snapshot(),
            },
            None => ServerMessage::Error {
                result: HardwareError::GpioUnavailable("panel inputs not initialized".to_owned())
                    .to_string(),
            },
        },
        ClientCommand::EepromWrite(req) => handle_eeprom_write(app, req).await,
        ClientCommand::EepromRead(req) => handle_eeprom_read(app, req).await,
        ClientCommand::MeasureResistance(req) => handle_measure(app, req).await,
        ClientCommand::LedControl(req) => handle_led_control(app, &req),
        ClientCommand::SetStartState(StateRequest { state }) => {
            let lamp = app.indicator().set_started(state);
            app.clients
                .broadcast(&ServerMessage::NeedleStateChange {
                    data: NeedleChange {
                        is_started: state,
                        timestamp: unix_now(),
                    },
                })
                .await;
            ServerMessage::SetStartState {
                result: json!({ "success": true, "is_started": state, "lamp": lamp.as_str() }),
            }
        }
        ClientCommand::SetNeedleShortFixed(StateRequest { state }) => {
            let lamp = app.indicator().set_short_fixed(state);
            ServerMessage::SetNeedleShortFixed {
                result: json!({ "success": true, "needle_short_fixed": state, "lamp": lamp.as_str() }),
            }
        }
    }
}

async fn handle_connect<S>(app: &App<S>, req: ConnectRequest) -> ServerMessage
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    let settings = match SerialSettings::from_request(
        &req.port,
        req.baudrate,
        &req.parity,
        req.databits,
        &req.stopbits,
        &app.config.motor_port,
    ) {
        Ok(settings) => settings,
        Err(err) => {
            return ServerMessage::Serial {
                result: format!("port open failed: {err}"),
            };
        }
    };
    match app.instrument.connect(&settings).await {
        Ok(true) => ServerMessage::Serial {
            result: format!("motor port {} connected, coordinator started", settings.port),
        },
        Ok(false) => ServerMessage::Serial {
            result: "already connected".to_owned(),
        },
        Err(err) => ServerMessage::Serial {
            result: format!("port open failed: {err}"),
        },
    }
}

fn missing(field: &str) -> ServerMessage {
    ServerMessage::Error {
        result: format!("{field} value is missing"),
    }
}

async fn handle_move<S>(app: &App<S>, req: MoveRequest) -> ServerMessage
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    if !app.instrument.is_connected().await {
        return ServerMessage::Error {
            result: DriveError::NotConnected.to_string(),
        };
    }
    let Ok(motor) = MotorId::try_from(req.motor_id) else {
        return ServerMessage::Error {
            result: format!("unknown motor id {}", req.motor_id),
        };
    };

    let mut mode = req.mode.clone().unwrap_or_else(|| "servo".to_owned());
    let mut speed = req.speed;
    if let Some(needle_speed) = req.needle_speed {
        // UI compatibility: the presence of needle_speed rewrites the mode.
        speed = Some(needle_speed);
        mode = "speed".to_owned();
    }

    let queue = &app.instrument.queue;
    let outcome: Result<String, DriveError> = match mode.as_str() {
        "servo" | "position" => {
            let Some(position) = req.position else {
                return missing("position");
            };
            if motor == MotorId::Two {
                // Motor 2 positioning always rides the speed path, default
                // needle speed when the UI names none.
                queue_speed_move(
                    queue,
                    motor,
                    position,
                    speed.unwrap_or(DEFAULT_NEEDLE_SPEED),
                    &req,
                )
            } else {
                let control = if mode == "servo" {
                    ControlMode::Servo
                } else {
                    ControlMode::Position
                };
                let bytes = frame::mode_move(motor, control, 0, 0, position);
                queue
                    .push(QueuedCommand::fire_and_forget(bytes.clone(), motor))
                    .map(|()| format!("motor 1 {mode} move queued: {}", hex_pretty(&bytes)))
            }
        }
        "speed" => {
            let Some(position) = req.position else {
                return missing("position");
            };
            let Some(speed) = speed else {
                return missing("speed");
            };
            queue_speed_move(queue, motor, position, speed, &req)
        }
        "speed_force" => {
            let (Some(force), Some(speed), Some(position)) = (req.force, speed, req.position)
            else {
                return missing("force, speed or position");
            };
            let bytes = frame::mode_move(
                motor,
                ControlMode::SpeedForce,
                force_to_grams(force),
                speed,
                position,
            );
            queue
                .push(QueuedCommand::fire_and_forget(bytes.clone(), motor))
                .map(|()| {
                    format!(
                        "motor {} speed/force move queued: {}",
                        u8::from(motor),
                        hex_pretty(&bytes)
                    )
                })
        }
        "force" => {
            let Some(force) = req.force else {
                return missing("force");
            };
            let bytes = frame::force_only(motor, force_to_grams(force));
            queue
                .push(QueuedCommand::fire_and_forget(bytes.clone(), motor))
                .map(|()| {
                    format!(
                        "motor {} force command queued: {}",
                        u8::from(motor),
                        hex_pretty(&bytes)
                    )
                })
        }
        other => {
            return ServerMessage::Error {
                result: format!("unsupported mode: {other}"),
            };
        }
    };

    match outcome {
        Ok(result) => ServerMessage::Serial { result },
        Err(err) => ServerMessage::Error {
            result: err.to_string(),
        },
    }
}

fn force_to_grams(force_newtons: f64) -> u16 {
    let grams = (force_newtons * GRAMS_PER_NEWTON).round();
    grams.clamp(0.0, f64::from(u16::MAX)) as u16
}

fn queue_speed_move(
    queue: &needle_drive::CommandQueue,
    motor: MotorId,
    position: i16,
    speed: u16,
    req: &MoveRequest,
) -> Result<String, DriveError> {
    let decel = (motor == MotorId::Two && req.deceleration_enabled).then(|| DecelProfile {
        distance_mm: req.deceleration_position,
        slow_speed: req.deceleration_speed,
    });
    let plan = SpeedMove::builder()
        .motor(motor)
        .target(position)
        .speed(speed)
        .decel(decel)
        .build()
        .plan();
    let frames: Vec<String> = plan.iter().map(|cmd| hex_pretty(&cmd.bytes)).collect();
    let phases = plan.len();
    queue.push_all(plan)?;
    Ok(format!(
        "motor {} speed move queued ({phases} phase{}): {}",
        u8::from(motor),
        if phases == 1 { "" } else { "s" },
        frames.join(" | ")
    ))
}

fn eeprom_reply(layout: TipLayout, record: TipRecord) -> serde_json::Value {
    let mut value = serde_json::to_value(record).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.insert("success".to_owned(), json!(true));
        map.insert("mtrVersion".to_owned(), json!(layout.mtr_version()));
        map.insert("country".to_owned(), json!(layout.country()));
        map.insert(
            "eepromAddress".to_owned(),
            json!(format!("0x{:02X}", layout.address())),
        );
        map.insert("offset".to_owned(), json!(format!("0x{:02X}", layout.base())));
    }
    value
}

async fn handle_eeprom_write<S>(app: &App<S>, req: EepromWriteRequest) -> ServerMessage
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    let layout = TipLayout::from_request(&req.mtr_version, &req.country);
    let record = TipRecord {
        tip_type: req.tip_type,
        shot_count: req.shot_count,
        year: req.year,
        month: req.month,
        day: req.day,
        maker_code: req.maker_code,
    };
    if let Err(err) = app.eeprom.write(layout, record).await {
        return ServerMessage::EepromWrite {
            result: json!({ "success": false, "error": err.to_string() }),
        };
    }
    // Verify by reading back through the same layout.
    match app.eeprom.read(layout).await {
        Ok(readback) => ServerMessage::EepromWrite {
            result: json!({
                "success": true,
                "message": format!(
                    "MTR {} {} eeprom write verified",
                    layout.mtr_version(),
                    layout.country()
                ),
                "data": eeprom_reply(layout, readback),
            }),
        },
        Err(err) => ServerMessage::EepromWrite {
            result: json!({
                "success": false,
                "error": format!("write succeeded but verification read failed: {err}"),
            }),
        },
    }
}

async fn handle_eeprom_read<S>(app: &App<S>, req: EepromReadRequest) -> ServerMessage
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    let layout = TipLayout::from_request(&req.mtr_version, &req.country);
    match app.eeprom.read(layout).await {
        Ok(record) => ServerMessage::EepromRead {
            result: eeprom_reply(layout, record),
        },
        Err(err) => ServerMessage::EepromRead {
            result: json!({ "success": false, "error": err.to_string() }),
        },
    }
}

async fn handle_measure<S>(app: &App<S>, req: MeasureRequest) -> ServerMessage
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    let reading = app.ohmmeter.measure().await;
    let threshold_mohm = (req.threshold * 1000.0).max(0.0) as u32;
    if reading.verdict(threshold_mohm) == needle_types::Verdict::Ng {
        // Only a started cycle latches the judgment; the controller
        // enforces that.
        app.indicator().record_verdict(needle_types::Verdict::Ng);
    }
    ServerMessage::Resistance { data: reading }
}

fn handle_led_control<S>(app: &App<S>, req: &LedControlRequest) -> ServerMessage
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: std::fmt::Display,
{
    let result = match req.led.as_str() {
        "blue" => {
            app.indicator().force(IndicatorState::Blue);
            json!({ "success": true, "message": "BLUE LED ON" })
        }
        "red" => {
            app.indicator().force(IndicatorState::Red);
            json!({ "success": true, "message": "RED LED ON" })
        }
        "green" => {
            app.indicator().force(IndicatorState::Green);
            json!({ "success": true, "message": "GREEN LED ON" })
        }
        "all_off" => {
            app.indicator().all_off();
            json!({ "success": true, "message": "all LEDs off" })
        }
        "status" => json!({ "success": true, "status": app.indicator().led_status() }),
        other => json!({ "success": false, "error": format!("unsupported LED type: {other}") }),
    };
    ServerMessage::LedControl { result }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::gpio::NullLeds;
    use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};

    pub type TestSink = UnboundedSender<Message>;
    pub type TestApp = App<TestSink>;

    /// An app with no hardware, one registered fake client, and the
    /// receiver draining that client's messages.
    pub async fn test_app() -> (Arc<TestApp>, UnboundedReceiver<Message>) {
        let app = Arc::new(App::new(Config::default(), Box::new(NullLeds), None));
        let (tx, rx) = unbounded();
        app.clients.register(tx).await;
        (app, rx)
    }

    /// Wait for the next message and parse it as JSON. Returns `None` when
    /// the client was dropped from the pool.
    pub async fn recv_json(rx: &mut UnboundedReceiver<Message>) -> Option<serde_json::Value> {
        match futures::StreamExt::next(rx).await {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).ok(),
            _ => None,
        }
    }

    /// Non-blocking pop of an already-delivered message.
    pub fn try_recv_json(rx: &mut UnboundedReceiver<Message>) -> Option<serde_json::Value> {
        match rx.try_next() {
            Ok(Some(Message::Text(text))) => serde_json::from_str(text.as_str()).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{TestApp, recv_json, test_app};
    use super::*;
    use needle_drive::{COMPLETION_TOLERANCE, SerialTransport};
    use needle_types::Verdict;

    async fn connected_app() -> (Arc<TestApp>, tokio::io::DuplexStream) {
        let (app, _rx) = test_app().await;
        let (ours, theirs) = tokio::io::duplex(4096);
        app.instrument
            .attach(Arc::new(SerialTransport::new(ours)))
            .await;
        (app, theirs)
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let (app, _rx) = test_app().await;
        let reply = dispatch(&app, r#"{"cmd":"reboot"}"#).await;
        assert!(matches!(reply, ServerMessage::Error { .. }));

        let reply = dispatch(&app, "not json").await;
        let ServerMessage::Error { result } = reply else {
            panic!("expected an error");
        };
        assert!(result.starts_with("bad command"));
    }

    #[tokio::test]
    async fn check_reports_link_state() {
        let (app, _rx) = test_app().await;
        let ServerMessage::Serial { result } = dispatch(&app, r#"{"cmd":"check"}"#).await else {
            panic!("expected serial reply");
        };
        assert_eq!(result, "disconnected");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn connect_auto_uses_configured_motor_port() {
        let config = Config {
            motor_port: "/dev/nonexistent-motor".to_owned(),
            ..Config::default()
        };
        let app: Arc<TestApp> =
            Arc::new(App::new(config, Box::new(crate::gpio::NullLeds), None));
        let reply = dispatch(
            &app,
            r#"{"cmd":"connect","port":"auto","baudrate":115200,"parity":"none","databits":8,"stopbits":"1"}"#,
        )
        .await;
        let ServerMessage::Serial { result } = reply else {
            panic!("expected serial reply");
        };
        // The open fails on this host, but against the configured device.
        assert!(result.contains("/dev/nonexistent-motor"), "{result}");
    }

    #[tokio::test]
    async fn move_without_link_is_refused() {
        let (app, _rx) = test_app().await;
        let reply = dispatch(
            &app,
            r#"{"cmd":"move","mode":"position","position":0}"#,
        )
        .await;
        let ServerMessage::Error { result } = reply else {
            panic!("expected an error");
        };
        assert!(result.contains("not connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn motor1_position_move_queues_one_frame() {
        let (app, _far) = connected_app().await;
        let reply = dispatch(
            &app,
            r#"{"cmd":"move","motor_id":1,"mode":"position","position":0}"#,
        )
        .await;
        let ServerMessage::Serial { result } = reply else {
            panic!("expected serial reply");
        };
        assert!(result.contains("motor 1 position move queued"));
        assert!(result.contains("55 AA 0D 01 32"));
    }

    #[tokio::test(start_paused = true)]
    async fn needle_speed_rewrites_mode_to_speed() {
        let (app, _far) = connected_app().await;
        let reply = dispatch(
            &app,
            r#"{"cmd":"move","motor_id":1,"mode":"servo","position":500,"needle_speed":1500}"#,
        )
        .await;
        let ServerMessage::Serial { result } = reply else {
            panic!("expected serial reply");
        };
        assert!(result.contains("speed move queued"), "{result}");
    }

    #[tokio::test(start_paused = true)]
    async fn motor2_decelerated_move_queues_two_phases() {
        let (app, _rx) = test_app().await;
        let (ours, _theirs) = tokio::io::duplex(4096);
        app.instrument
            .attach(Arc::new(SerialTransport::new(ours)))
            .await;
        let reply = dispatch(
            &app,
            r#"{"cmd":"move","motor_id":2,"mode":"speed","position":1000,"needle_speed":3000,
                "deceleration_enabled":true,"deceleration_position":5,"deceleration_speed":500}"#,
        )
        .await;
        let ServerMessage::Serial { result } = reply else {
            panic!("expected serial reply");
        };
        assert!(result.contains("2 phases"), "{result}");
    }

    #[test]
    fn decel_plan_carries_spec_example_targets() {
        // move motor2 speed 3000 to 1000 with 5 mm decel at 500:
        // phase 1 waits at 1200, phase 2 runs to 1000.
        let req = MoveRequest {
            motor_id: 2,
            mode: Some("speed".to_owned()),
            position: Some(1000),
            speed: Some(3000),
            needle_speed: None,
            force: None,
            deceleration_enabled: true,
            deceleration_position: 5,
            deceleration_speed: 500,
        };
        let queue = needle_drive::CommandQueue::default();
        queue_speed_move(&queue, MotorId::Two, 1000, 3000, &req).unwrap();
        let phase1 = queue.try_pop().unwrap();
        let phase2 = queue.try_pop().unwrap();
        let wait = phase1.wait.unwrap();
        assert_eq!(wait.target, 1200);
        assert_eq!(wait.tolerance, COMPLETION_TOLERANCE);
        assert!(phase2.wait.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn motor2_servo_move_rides_the_speed_path() {
        let (app, _far) = connected_app().await;
        let reply = dispatch(
            &app,
            r#"{"cmd":"move","motor_id":2,"mode":"servo","position":2000}"#,
        )
        .await;
        let ServerMessage::Serial { result } = reply else {
            panic!("expected serial reply");
        };
        assert!(result.contains("speed move queued"), "{result}");
    }

    #[tokio::test]
    async fn led_control_forces_and_reports() {
        let (app, _rx) = test_app().await;
        let reply = dispatch(&app, r#"{"cmd":"led_control","type":"red"}"#).await;
        let ServerMessage::LedControl { result } = reply else {
            panic!("expected led reply");
        };
        assert_eq!(result["success"], true);
        assert_eq!(app.indicator().current(), IndicatorState::Red);

        let reply = dispatch(&app, r#"{"cmd":"led_control","type":"status"}"#).await;
        let ServerMessage::LedControl { result } = reply else {
            panic!("expected led reply");
        };
        assert_eq!(result["status"]["red"], true);
        assert_eq!(result["status"]["blue"], false);

        let reply = dispatch(&app, r#"{"cmd":"led_control","type":"purple"}"#).await;
        let ServerMessage::LedControl { result } = reply else {
            panic!("expected led reply");
        };
        assert_eq!(result["success"], false);
    }

    #[tokio::test]
    async fn start_state_latches_and_broadcasts() {
        let (app, mut rx) = test_app().await;
        app.indicator().sync_inputs(true, false);

        let reply = dispatch(&app, r#"{"cmd":"set_start_state","state":true}"#).await;
        let ServerMessage::SetStartState { result } = reply else {
            panic!("expected start-state reply");
        };
        assert_eq!(result["success"], true);
        assert!(app.indicator().is_started());

        let broadcast = recv_json(&mut rx).await.unwrap();
        assert_eq!(broadcast["type"], "needle_state_change");
        assert_eq!(broadcast["data"]["is_started"], true);

        // STOP clears the judgment latch.
        app.indicator().record_verdict(Verdict::Ng);
        dispatch(&app, r#"{"cmd":"set_start_state","state":false}"#).await;
        assert!(!app.indicator().is_started());
        assert_eq!(app.indicator().current(), IndicatorState::Blue);
    }

    #[tokio::test]
    async fn short_fixed_command_latches_red() {
        let (app, _rx) = test_app().await;
        app.indicator().sync_inputs(true, false);
        dispatch(&app, r#"{"cmd":"set_needle_short_fixed","state":true}"#).await;
        assert_eq!(app.indicator().current(), IndicatorState::Red);
    }

    #[tokio::test]
    async fn gpio_read_without_hardware_reports_unavailable() {
        let (app, _rx) = test_app().await;
        let reply = dispatch(&app, r#"{"cmd":"gpio_read"}"#).await;
        let ServerMessage::Error { result } = reply else {
            panic!("expected an error");
        };
        assert!(result.contains("gpio unavailable"));
    }

    #[tokio::test]
    async fn broadcast_drops_only_the_failed_client() {
        let (app, mut healthy_rx) = test_app().await;
        // A second client whose receiver is gone fails on send.
        let (dead_tx, dead_rx) = futures::channel::mpsc::unbounded();
        drop(dead_rx);
        app.clients.register(dead_tx).await;
        assert_eq!(app.clients.count().await, 2);

        let outcome = app
            .clients
            .broadcast(&ServerMessage::Serial {
                result: "ping".to_owned(),
            })
            .await;
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.remaining, 1);

        let value = recv_json(&mut healthy_rx).await.unwrap();
        assert_eq!(value["result"], "ping");
    }

    #[test]
    fn force_conversion_matches_production_scale() {
        assert_eq!(force_to_grams(1.0), 102); // 101.97 rounded
        assert_eq!(force_to_grams(0.0), 0);
        assert_eq!(force_to_grams(-2.0), 0);
        assert_eq!(force_to_grams(10_000.0), u16::MAX);
    }

    #[test]
    fn eeprom_reply_echoes_layout_addressing() {
        let record = TipRecord {
            tip_type: 208,
            shot_count: 1234,
            year: 2025,
            month: 3,
            day: 14,
            maker_code: 5,
        };
        let value = eeprom_reply(TipLayout::Mtr20Cutera, record);
        assert_eq!(value["success"], true);
        assert_eq!(value["tipType"], 208);
        assert_eq!(value["shotCount"], 1234);
        assert_eq!(value["year"], 2025);
        assert_eq!(value["eepromAddress"], "0x50");
        assert_eq!(value["offset"], "0x80");
        assert_eq!(value["mtrVersion"], "2.0");
        assert_eq!(value["country"], "CUTERA");
    }
}
