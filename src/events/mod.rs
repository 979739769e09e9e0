use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::policy::{DeleteMode, EditMode};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Ledger changes published after the database transaction committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    UsageCommitted {
        transaction_id: Uuid,
        consuming_entity_id: Uuid,
        total_quantity: Decimal,
        total_cost: Decimal,
        line_count: usize,
        occurred_at: DateTime<Utc>,
    },
    UsageEdited {
        /// Transaction the edit was requested against.
        original_transaction_id: Uuid,
        /// Transaction holding the edited lines; equal to the original under direct update.
        transaction_id: Uuid,
        mode: EditMode,
        occurred_at: DateTime<Utc>,
    },
    UsageDeleted {
        transaction_id: Uuid,
        mode: DeleteMode,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    UsageReactivated {
        transaction_id: Uuid,
        occurred_at: DateTime<Utc>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::UsageCommitted { .. } => "usage_committed",
            Event::UsageEdited { .. } => "usage_edited",
            Event::UsageDeleted { .. } => "usage_deleted",
            Event::UsageReactivated { .. } => "usage_reactivated",
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("stockledger.events.processed", 1, "event" => event.name());

        match &event {
            Event::UsageCommitted {
                transaction_id,
                consuming_entity_id,
                total_quantity,
                total_cost,
                line_count,
                ..
            } => {
                info!(
                    %transaction_id,
                    %consuming_entity_id,
                    %total_quantity,
                    %total_cost,
                    line_count,
                    "Usage committed"
                );
            }
            Event::UsageEdited {
                original_transaction_id,
                transaction_id,
                mode,
                ..
            } => {
                info!(%original_transaction_id, %transaction_id, %mode, "Usage edited");
            }
            Event::UsageDeleted {
                transaction_id,
                mode,
                reason,
                ..
            } => {
                info!(%transaction_id, %mode, reason = reason.as_deref().unwrap_or(""), "Usage deleted");
            }
            Event::UsageReactivated { transaction_id, .. } => {
                info!(%transaction_id, "Usage reactivated");
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sender_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let id = Uuid::new_v4();

        sender
            .send(Event::UsageReactivated {
                transaction_id: id,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
        sender
            .send(Event::UsageDeleted {
                transaction_id: id,
                mode: DeleteMode::Soft,
                reason: None,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "usage_reactivated");
        assert_eq!(rx.recv().await.unwrap().name(), "usage_deleted");
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        let result = sender
            .send(Event::UsageReactivated {
                transaction_id: Uuid::nil(),
                occurred_at: Utc::now(),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn processing_loop_ends_when_senders_drop() {
        let (tx, rx) = mpsc::channel(2);
        let handle = tokio::spawn(process_events(rx));
        EventSender::new(tx)
            .send(Event::UsageReactivated {
                transaction_id: Uuid::new_v4(),
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
        // sender dropped at end of statement above
        handle.await.unwrap();
    }
}
