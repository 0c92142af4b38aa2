use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::constants::USAGE_QUEUE_CAPACITY;
use crate::ledger::{SubscriptionLedger, today_utc};

/// One model invocation to be recorded
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub account_id: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub streaming: bool,
    pub tool_name: Option<String>,
}

/// Fire-and-forget usage writer. Events ride a bounded queue to a
/// background task, so recording never blocks or fails a proxied request.
/// When the queue is full the event is dropped and logged.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<UsageEvent>,
}

impl UsageRecorder {
    pub fn spawn(ledger: SubscriptionLedger) -> Self {
        let (tx, rx) = mpsc::channel(USAGE_QUEUE_CAPACITY);
        tokio::spawn(drain(rx, ledger));
        Self { tx }
    }

    pub fn enqueue(&self, event: UsageEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    "Usage queue full, dropping record for account {}",
                    event.account_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Usage recorder task is gone, dropping record");
            }
        }
    }
}

async fn drain(mut rx: mpsc::Receiver<UsageEvent>, ledger: SubscriptionLedger) {
    while let Some(event) = rx.recv().await {
        persist(&ledger, &event).await;
    }
}

/// Two independent writes; losing one must not block the other
pub(crate) async fn persist(ledger: &SubscriptionLedger, event: &UsageEvent) {
    if let Err(e) = ledger.append_usage_record(event).await {
        warn!("Failed to append usage record: {}", e);
    }
    if let Err(e) = ledger
        .bump_daily_usage(
            &event.account_id,
            &today_utc(),
            event.input_tokens,
            event.output_tokens,
        )
        .await
    {
        warn!("Failed to update daily usage: {}", e);
    }
}

/// Read token counts out of an upstream response usage block
pub fn usage_counts_from_json(usage: &Value) -> (u64, u64) {
    let input = usage
        .get("input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    (input, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn usage_counts_read_both_fields() {
        let usage = json!({"input_tokens": 120, "output_tokens": 48});
        assert_eq!(usage_counts_from_json(&usage), (120, 48));
    }

    #[test]
    fn usage_counts_default_missing_fields_to_zero() {
        assert_eq!(usage_counts_from_json(&json!({})), (0, 0));
        assert_eq!(
            usage_counts_from_json(&json!({"input_tokens": "many"})),
            (0, 0)
        );
        assert_eq!(usage_counts_from_json(&json!({"output_tokens": 5})), (0, 5));
    }

    #[tokio::test]
    async fn recorder_persists_queued_events() {
        db::init_test_db().await;
        let ledger = SubscriptionLedger::new();
        let recorder = UsageRecorder::spawn(ledger.clone());

        recorder.enqueue(UsageEvent {
            account_id: "acct-rec-queue".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            input_tokens: 200,
            output_tokens: 80,
            latency_ms: 1234,
            streaming: false,
            tool_name: None,
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let totals = ledger
            .daily_totals("acct-rec-queue", &today_utc())
            .await
            .unwrap();
        assert_eq!(totals.input_tokens, 200);
        assert_eq!(totals.output_tokens, 80);
        assert_eq!(totals.request_count, 1);

        let conn = db::get_conn().await.unwrap();
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM usage_records WHERE account_id = ?",
                ["acct-rec-queue"],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }

    #[tokio::test]
    async fn streaming_placeholder_counts_the_request_without_tokens() {
        db::init_test_db().await;
        let ledger = SubscriptionLedger::new();
        let recorder = UsageRecorder::spawn(ledger.clone());

        recorder.enqueue(UsageEvent {
            account_id: "acct-rec-stream".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 90,
            streaming: true,
            tool_name: None,
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let totals = ledger
            .daily_totals("acct-rec-stream", &today_utc())
            .await
            .unwrap();
        assert_eq!(totals.request_count, 1);
        assert_eq!(totals.input_tokens, 0);
        assert_eq!(totals.output_tokens, 0);
    }
}
