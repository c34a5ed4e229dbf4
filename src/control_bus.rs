//! In-memory pub/sub of control signals to attached phase workers (spec
//! §4.3). Generalizes the teacher's single `CancellationToken`-based
//! shutdown signal (`scheduler.rs`) into a 3-signal, acked, buffered
//! channel per `(campaign, phase)`.

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{ControlSignal, PhaseType};

pub struct ControlCommand {
    pub signal: ControlSignal,
    pub ack: Option<oneshot::Sender<Result<(), String>>>,
}

pub struct PhaseControlBus {
    buffer: usize,
    subscriptions: DashMap<(Uuid, PhaseType), mpsc::Sender<ControlCommand>>,
}

impl PhaseControlBus {
    pub fn new(buffer: usize) -> Self {
        PhaseControlBus {
            buffer,
            subscriptions: DashMap::new(),
        }
    }

    /// Creates (or re-creates) the channel for `(campaign_id, phase)` and
    /// returns the receiver half for the worker to poll. Replacing an
    /// existing subscription is how re-attach-after-restart works (spec
    /// §4.5 PausePhase step 4): only one subscriber is ever meant to hold
    /// the receiver at a time.
    pub fn subscribe(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
    ) -> mpsc::Receiver<ControlCommand> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscriptions.insert((campaign_id, phase), tx);
        rx
    }

    pub fn is_subscribed(&self, campaign_id: Uuid, phase: PhaseType) -> bool {
        self.subscriptions.contains_key(&(campaign_id, phase))
    }

    /// Non-blocking send of a control signal. `CHANNEL_MISSING` if nobody
    /// is subscribed, `CONTROL_CHANNEL_FULL` if the buffer is saturated —
    /// both are returned to the caller rather than silently dropped, so a
    /// pause request never lies about whether it actually reached the
    /// worker.
    pub fn broadcast(
        &self,
        campaign_id: Uuid,
        phase: PhaseType,
        signal: ControlSignal,
        ack: Option<oneshot::Sender<Result<(), String>>>,
    ) -> Result<(), OrchestratorError> {
        let sender = self
            .subscriptions
            .get(&(campaign_id, phase))
            .ok_or(OrchestratorError::PhaseNotRunning)?
            .clone();

        sender
            .try_send(ControlCommand { signal, ack })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => OrchestratorError::ControlChannelFull,
                mpsc::error::TrySendError::Closed(_) => OrchestratorError::PhaseNotRunning,
            })
    }

    /// Drains the subscription map entry for `(campaign_id, phase)`,
    /// dropping the sender so the worker's receiver observes channel
    /// closure.
    pub fn close(&self, campaign_id: Uuid, phase: PhaseType) {
        self.subscriptions.remove(&(campaign_id, phase));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PhaseType;

    #[tokio::test]
    async fn broadcast_without_subscription_is_channel_missing() {
        let bus = PhaseControlBus::new(8);
        let err = bus
            .broadcast(Uuid::new_v4(), PhaseType::DnsValidation, ControlSignal::Pause, None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PhaseNotRunning));
    }

    #[tokio::test]
    async fn subscribe_then_broadcast_delivers_command() {
        let bus = PhaseControlBus::new(8);
        let campaign = Uuid::new_v4();
        let mut rx = bus.subscribe(campaign, PhaseType::DnsValidation);

        bus.broadcast(campaign, PhaseType::DnsValidation, ControlSignal::Pause, None)
            .unwrap();

        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.signal, ControlSignal::Pause);
    }

    #[tokio::test]
    async fn full_buffer_surfaces_channel_full() {
        let bus = PhaseControlBus::new(1);
        let campaign = Uuid::new_v4();
        let _rx = bus.subscribe(campaign, PhaseType::DnsValidation);

        bus.broadcast(campaign, PhaseType::DnsValidation, ControlSignal::Pause, None)
            .unwrap();
        let err = bus
            .broadcast(campaign, PhaseType::DnsValidation, ControlSignal::Pause, None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ControlChannelFull));
    }

    #[tokio::test]
    async fn close_drops_sender_and_closes_receiver() {
        let bus = PhaseControlBus::new(8);
        let campaign = Uuid::new_v4();
        let mut rx = bus.subscribe(campaign, PhaseType::DnsValidation);
        bus.close(campaign, PhaseType::DnsValidation);
        assert!(rx.recv().await.is_none());
    }
}
