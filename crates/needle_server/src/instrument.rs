//! Owned motor-link lifecycle.
//!
//! The production firmware kept one global controller object; here the
//! link (transport + coordinator tasks) is an owned component the server
//! connects, disconnects, and recovers explicitly. The command queue and
//! motor state registry outlive individual links so telemetry and handlers
//! always have something to read.

use std::sync::Arc;

use needle_drive::{
    CommandQueue, CoordinatorHandle, MotorStates, SerialSettings, SerialTransport,
    spawn_coordinator,
};
use needle_types::DriveError;
use tokio::sync::Mutex;
use tracing::{info, warn};

struct MotorLink {
    transport: Arc<SerialTransport>,
    handle: CoordinatorHandle,
}

/// The motor side of the instrument.
pub struct Instrument {
    pub queue: Arc<CommandQueue>,
    pub states: MotorStates,
    link: Mutex<Option<MotorLink>>,
}

impl Default for Instrument {
    fn default() -> Self {
        Self::new()
    }
}

impl Instrument {
    #[must_use]
    pub fn new() -> Self {
        Instrument {
            queue: Arc::new(CommandQueue::default()),
            states: MotorStates::new(),
            link: Mutex::new(None),
        }
    }

    /// Open the motor port and start the coordinator. Returns `false` if a
    /// link is already up (production answers "already connected").
    pub async fn connect(&self, settings: &SerialSettings) -> Result<bool, DriveError> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(false);
        }
        let transport = Arc::new(SerialTransport::open(settings)?);
        self.install(&mut link, transport);
        info!(port = %settings.port, "motor port connected, coordinator running");
        Ok(true)
    }

    /// Attach an already-open byte stream instead of a serial device.
    /// Exercised by tests; the semantics match [`Instrument::connect`].
    pub async fn attach(&self, transport: Arc<SerialTransport>) -> bool {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return false;
        }
        self.install(&mut link, transport);
        true
    }

    fn install(&self, link: &mut Option<MotorLink>, transport: Arc<SerialTransport>) {
        self.queue.clear();
        self.states.reset();
        let handle = spawn_coordinator(transport.clone(), self.queue.clone(), self.states.clone());
        *link = Some(MotorLink { transport, handle });
    }

    /// Stop the coordinator and drop the port. Queued commands are
    /// discarded. Returns `false` if nothing was connected.
    pub async fn disconnect(&self) -> bool {
        let mut link = self.link.lock().await;
        self.queue.clear();
        match link.take() {
            Some(old) => {
                old.handle.shutdown();
                info!("motor port disconnected");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    /// Writer-loop liveness counter, when a link is up.
    pub async fn heartbeat(&self) -> Option<u64> {
        self.link.lock().await.as_ref().map(|l| l.handle.heartbeat())
    }

    /// Restart the coordinator tasks on the preserved port. The queue is
    /// cleared; the port itself is not reopened.
    pub async fn force_recovery(&self) -> bool {
        let mut link = self.link.lock().await;
        let Some(old) = link.as_mut() else {
            return false;
        };
        warn!("force recovery: restarting coordinator tasks");
        old.handle.shutdown();
        self.queue.clear();
        old.handle = spawn_coordinator(
            old.transport.clone(),
            self.queue.clone(),
            self.states.clone(),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use needle_drive::frame::OP_STATUS_READ;
    use tokio::io::AsyncReadExt;

    #[tokio::test(start_paused = true)]
    async fn attach_runs_the_coordinator_and_disconnect_stops_it() {
        let instrument = Instrument::new();
        let (ours, theirs) = tokio::io::duplex(1024);
        assert!(instrument.attach(Arc::new(SerialTransport::new(ours))).await);
        assert!(instrument.is_connected().await);
        // Second attach is refused while the link is up.
        let (dup, _keep) = tokio::io::duplex(64);
        assert!(!instrument.attach(Arc::new(SerialTransport::new(dup))).await);

        // Status polls appear on the far end.
        let (mut far_rx, _far_tx) = tokio::io::split(theirs);
        let mut buf = [0u8; 6];
        far_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[4], OP_STATUS_READ);

        assert!(instrument.disconnect().await);
        assert!(!instrument.is_connected().await);
        assert!(!instrument.disconnect().await);
    }

    #[tokio::test(start_paused = true)]
    async fn force_recovery_restarts_on_the_same_wire() {
        let instrument = Instrument::new();
        let (ours, theirs) = tokio::io::duplex(4096);
        instrument.attach(Arc::new(SerialTransport::new(ours))).await;
        assert!(instrument.heartbeat().await.is_some());

        assert!(instrument.force_recovery().await);
        // New tasks write to the same duplex.
        let (mut far_rx, _far_tx) = tokio::io::split(theirs);
        let mut buf = [0u8; 6];
        far_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[4], OP_STATUS_READ);
        assert!(instrument.is_connected().await);
    }

    #[tokio::test]
    async fn recovery_without_a_link_is_refused() {
        let instrument = Instrument::new();
        assert!(!instrument.force_recovery().await);
        assert!(instrument.heartbeat().await.is_none());
    }
}
