//! Announcement sink
//!
//! The engine publishes `RoomEvent`s into a bounded queue drained by one task
//! that hands them to an `Announcer`. Publishing never blocks and never fails
//! the caller; delivery errors are logged and dropped. Settlement is always
//! committed before its events are published.

use crate::errors::NotifyError;
use crate::types::{AccountId, Amount, HistoryEntry, Outcome, RoomId, RoundIndex};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Per-winner line of a settlement summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinnerPayout {
    pub account: AccountId,
    pub stake: Amount,
    pub payout: Amount,
}

/// Round-lifecycle and operator notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RoomEvent {
    /// A room asked to be approved
    ApprovalRequested { room: RoomId, title: String },
    RoundOpened {
        room: RoomId,
        round: RoundIndex,
        closes_at: DateTime<Utc>,
    },
    Countdown {
        room: RoomId,
        round: RoundIndex,
        seconds_left: u64,
    },
    /// Bets are closed; the transport may lock the chat
    RoundLocked { room: RoomId, round: RoundIndex },
    ResultAnnounced {
        room: RoomId,
        round: RoundIndex,
        outcome: Outcome,
        /// Total paid out of the jackpot this round, zero when no triple paid
        jackpot_distributed: Amount,
        jackpot_balance: Amount,
        history: Vec<HistoryEntry>,
    },
    SettlementSummary {
        room: RoomId,
        round: RoundIndex,
        winners: Vec<WinnerPayout>,
    },
    RoomStopped { room: RoomId },
    WageringCompleted {
        account: AccountId,
        /// None for the start bonus
        promo_code: Option<String>,
    },
    OperatorAlert {
        room: Option<RoomId>,
        severity: AlertSeverity,
        message: String,
    },
}

impl RoomEvent {
    pub fn room(&self) -> Option<RoomId> {
        match self {
            RoomEvent::ApprovalRequested { room, .. }
            | RoomEvent::RoundOpened { room, .. }
            | RoomEvent::Countdown { room, .. }
            | RoomEvent::RoundLocked { room, .. }
            | RoomEvent::ResultAnnounced { room, .. }
            | RoomEvent::SettlementSummary { room, .. }
            | RoomEvent::RoomStopped { room } => Some(*room),
            RoomEvent::OperatorAlert { room, .. } => *room,
            RoomEvent::WageringCompleted { .. } => None,
        }
    }

    pub fn alert(room: Option<RoomId>, severity: AlertSeverity, message: impl Into<String>) -> Self {
        RoomEvent::OperatorAlert {
            room,
            severity,
            message: message.into(),
        }
    }
}

/// Delivery target for engine events (chat transport, log, test probe)
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, event: &RoomEvent) -> Result<(), NotifyError>;
}

/// Fans events out to any number of in-process subscribers
#[derive(Debug, Clone)]
pub struct BroadcastAnnouncer {
    sender: broadcast::Sender<RoomEvent>,
}

impl BroadcastAnnouncer {
    pub fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Announcer for BroadcastAnnouncer {
    async fn announce(&self, event: &RoomEvent) -> Result<(), NotifyError> {
        if self.sender.send(event.clone()).is_err() {
            tracing::trace!("No subscribers for room event");
        }
        Ok(())
    }
}

/// Writes events to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    async fn announce(&self, event: &RoomEvent) -> Result<(), NotifyError> {
        match event {
            RoomEvent::OperatorAlert { severity: AlertSeverity::Critical, message, room } => {
                tracing::error!(room = ?room, "{}", message)
            }
            RoomEvent::OperatorAlert { message, room, .. } => tracing::warn!(room = ?room, "{}", message),
            RoomEvent::ResultAnnounced { room, round, outcome, jackpot_balance, .. } => tracing::info!(
                room = %room,
                round,
                dice = ?outcome.dice,
                total = outcome.total,
                side = %outcome.side,
                triple = outcome.triple,
                jackpot = jackpot_balance,
                "Round result"
            ),
            other => {
                let json = serde_json::to_string(other).map_err(|e| NotifyError::Delivery(e.to_string()))?;
                tracing::debug!("{}", json)
            }
        }
        Ok(())
    }
}

/// Ordered, fire-and-forget publisher
#[derive(Clone)]
pub struct Notifier {
    sender: mpsc::Sender<RoomEvent>,
    dropped: Arc<AtomicU64>,
}

impl Notifier {
    /// Spawn the dispatcher task. Must be called within a tokio runtime.
    pub fn spawn(announcer: Arc<dyn Announcer>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<RoomEvent>(capacity.max(1));

        tokio::spawn(async move {
            tracing::debug!("Announcement dispatcher started");
            while let Some(event) = receiver.recv().await {
                if let Err(e) = announcer.announce(&event).await {
                    tracing::warn!(room = ?event.room(), "Announcement delivery failed: {}", e);
                }
            }
            tracing::debug!("Announcement dispatcher stopped");
        });

        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, event: RoomEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(room = ?event.room(), "Announcement queue full; event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Announcement dispatcher gone; event dropped");
            }
        }
    }

    pub fn alert(&self, room: Option<RoomId>, severity: AlertSeverity, message: impl Into<String>) {
        self.publish(RoomEvent::alert(room, severity, message));
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FailingAnnouncer;

    #[async_trait]
    impl Announcer for FailingAnnouncer {
        async fn announce(&self, _event: &RoomEvent) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("chat offline".into()))
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let broadcast = BroadcastAnnouncer::new(16);
        let mut rx = broadcast.subscribe();
        let notifier = Notifier::spawn(Arc::new(broadcast), 16);

        for seconds_left in [30, 10, 5] {
            notifier.publish(RoomEvent::Countdown {
                room: RoomId(1),
                round: 9,
                seconds_left,
            });
        }

        for expected in [30, 10, 5] {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("event not delivered")
                .unwrap();
            assert!(matches!(event, RoomEvent::Countdown { seconds_left, .. } if seconds_left == expected));
        }
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let notifier = Notifier::spawn(Arc::new(FailingAnnouncer), 4);
        notifier.alert(None, AlertSeverity::Warning, "first");
        notifier.publish(RoomEvent::RoomStopped { room: RoomId(2) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(notifier.dropped(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let event = RoomEvent::RoundLocked { room: RoomId(-5), round: 3 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "round_locked");
        assert_eq!(json["room"], -5);
        assert_eq!(event.room(), Some(RoomId(-5)));
    }
}
