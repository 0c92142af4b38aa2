use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Days, Timelike, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::PlanTier;
use crate::db::{self, get_u64};
use crate::error::GatewayError;
use crate::usage::UsageEvent;

/// Aggregate token/request counts for one period
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub request_count: u64,
}

/// One day's aggregate, keyed by its UTC date string
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DayUsage {
    pub day: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub request_count: u64,
}

pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Current UTC date as the day-bucket key
pub fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// First day of the current UTC month
pub fn month_start_utc() -> String {
    Utc::now().format("%Y-%m-01").to_string()
}

/// Seconds until the UTC date rolls over, used as the quota retry hint
pub fn secs_until_day_rollover() -> u64 {
    let elapsed = Utc::now().time().num_seconds_from_midnight() as u64;
    (86_400 - elapsed).max(1)
}

/// Persistent store for plans, usage aggregates, billing identity, and
/// webhook event records.
#[derive(Clone)]
pub struct SubscriptionLedger;

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self
    }

    /// Resolve an account's plan. Accounts without a row are on the free plan,
    /// as are rows holding an unknown tier value.
    pub async fn get_plan(&self, account_id: &str) -> Result<PlanTier, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT plan FROM account_plans WHERE account_id = ?",
                [account_id],
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to read plan: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to read plan row: {e}")))?
        else {
            return Ok(PlanTier::Free);
        };

        let plan = row.get::<String>(0).unwrap_or_default();
        Ok(PlanTier::parse(&plan).unwrap_or_default())
    }

    pub async fn set_plan(&self, account_id: &str, plan: PlanTier) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "INSERT OR REPLACE INTO account_plans (account_id, plan, updated_at) VALUES (?, ?, ?)",
            (account_id, plan.as_str(), timestamp_millis() as i64),
        )
        .await
        .map_err(|e| GatewayError::DatabaseError(format!("Failed to set plan: {e}")))?;
        Ok(())
    }

    /// Add token counts to the account's aggregate for the given day.
    /// Each statement is atomic on the server side; the INSERT OR IGNORE
    /// handles racing creators of the day row.
    pub async fn bump_daily_usage(
        &self,
        account_id: &str,
        day: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;

        let update = "UPDATE usage_daily SET \
             input_tokens = input_tokens + ?, \
             output_tokens = output_tokens + ?, \
             request_count = request_count + 1 \
             WHERE account_id = ? AND day = ?";
        let params = (input_tokens as i64, output_tokens as i64, account_id, day);

        let affected = conn
            .execute(update, params.clone())
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to update usage: {e}")))?;
        if affected > 0 {
            return Ok(());
        }

        conn.execute(
            "INSERT OR IGNORE INTO usage_daily (account_id, day, input_tokens, output_tokens, request_count) VALUES (?, ?, 0, 0, 0)",
            (account_id, day),
        )
        .await
        .map_err(|e| GatewayError::DatabaseError(format!("Failed to create day row: {e}")))?;

        conn.execute(update, params)
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to update usage: {e}")))?;
        Ok(())
    }

    /// Aggregate for a single UTC day. Missing row reads as zero.
    pub async fn daily_totals(
        &self,
        account_id: &str,
        day: &str,
    ) -> Result<UsageTotals, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT input_tokens, output_tokens, request_count FROM usage_daily WHERE account_id = ? AND day = ?",
                (account_id, day),
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to read daily usage: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to read usage row: {e}")))?
        else {
            return Ok(UsageTotals::default());
        };

        Ok(UsageTotals {
            input_tokens: get_u64(&row, 0),
            output_tokens: get_u64(&row, 1),
            request_count: get_u64(&row, 2),
        })
    }

    /// Aggregate across all days from `since_day` onward (inclusive).
    /// ISO date strings compare lexicographically, so a plain >= works.
    pub async fn totals_since(
        &self,
        account_id: &str,
        since_day: &str,
    ) -> Result<UsageTotals, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0), COALESCE(SUM(request_count), 0) \
                 FROM usage_daily WHERE account_id = ? AND day >= ?",
                (account_id, since_day),
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to sum usage: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to read sum row: {e}")))?
        else {
            return Ok(UsageTotals::default());
        };

        Ok(UsageTotals {
            input_tokens: get_u64(&row, 0),
            output_tokens: get_u64(&row, 1),
            request_count: get_u64(&row, 2),
        })
    }

    /// Per-day aggregates for the last `days` days, newest first.
    /// Days without traffic are filled with zeros.
    pub async fn usage_history(
        &self,
        account_id: &str,
        days: u32,
    ) -> Result<Vec<DayUsage>, GatewayError> {
        let today = Utc::now().date_naive();
        let cutoff = today - Days::new(days.saturating_sub(1) as u64);

        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT day, input_tokens, output_tokens, request_count \
                 FROM usage_daily WHERE account_id = ? AND day >= ?",
                (account_id, cutoff.format("%Y-%m-%d").to_string()),
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to read history: {e}")))?;

        let mut by_day = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let Ok(day) = row.get::<String>(0) else {
                continue;
            };
            by_day.insert(
                day.clone(),
                DayUsage {
                    day,
                    input_tokens: get_u64(&row, 1),
                    output_tokens: get_u64(&row, 2),
                    request_count: get_u64(&row, 3),
                },
            );
        }

        let mut entries = Vec::with_capacity(days as usize);
        for offset in 0..days {
            let day = (today - Days::new(offset as u64))
                .format("%Y-%m-%d")
                .to_string();
            entries.push(by_day.remove(&day).unwrap_or(DayUsage {
                day,
                input_tokens: 0,
                output_tokens: 0,
                request_count: 0,
            }));
        }
        Ok(entries)
    }

    /// Append one row to the usage log
    pub async fn append_usage_record(&self, event: &UsageEvent) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "INSERT INTO usage_records (account_id, model, input_tokens, output_tokens, latency_ms, streaming, tool_name, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                event.account_id.as_str(),
                event.model.as_str(),
                event.input_tokens as i64,
                event.output_tokens as i64,
                event.latency_ms as i64,
                event.streaming as i64,
                event.tool_name.as_deref(),
                timestamp_millis() as i64,
            ),
        )
        .await
        .map_err(|e| GatewayError::DatabaseError(format!("Failed to append usage record: {e}")))?;
        Ok(())
    }

    pub async fn get_customer(&self, account_id: &str) -> Result<Option<String>, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT customer_id FROM billing_customers WHERE account_id = ?",
                [account_id],
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to read customer: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to read customer row: {e}")))?
        else {
            return Ok(None);
        };
        Ok(row.get::<String>(0).ok())
    }

    pub async fn put_customer(
        &self,
        account_id: &str,
        customer_id: &str,
    ) -> Result<(), GatewayError> {
        let conn = db::get_conn().await?;
        conn.execute(
            "INSERT OR REPLACE INTO billing_customers (account_id, customer_id, created_at) VALUES (?, ?, ?)",
            (account_id, customer_id, timestamp_millis() as i64),
        )
        .await
        .map_err(|e| GatewayError::DatabaseError(format!("Failed to store customer: {e}")))?;
        Ok(())
    }

    pub async fn has_subscription_event(&self, event_id: &str) -> Result<bool, GatewayError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM subscription_events WHERE event_id = ?",
                [event_id],
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to look up event: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to read event row: {e}")))?;
        Ok(row.is_some())
    }

    /// Record a webhook event. Returns false when the event id was already
    /// present; the primary key makes this the race-proof idempotency gate.
    pub async fn insert_subscription_event(
        &self,
        event_id: &str,
        account_id: &str,
        event_type: &str,
        plan: PlanTier,
    ) -> Result<bool, GatewayError> {
        let conn = db::get_conn().await?;
        let affected = conn
            .execute(
                "INSERT OR IGNORE INTO subscription_events (event_id, account_id, event_type, plan, created_at) VALUES (?, ?, ?, ?, ?)",
                (
                    event_id,
                    account_id,
                    event_type,
                    plan.as_str(),
                    timestamp_millis() as i64,
                ),
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to record event: {e}")))?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn day_keys_are_iso_dates() {
        let today = today_utc();
        assert_eq!(today.len(), 10);
        assert_eq!(&today[4..5], "-");
        let month = month_start_utc();
        assert!(month.ends_with("-01"));
        assert_eq!(&month[..7], &today[..7]);
    }

    #[test]
    fn day_rollover_hint_is_within_a_day() {
        let secs = secs_until_day_rollover();
        assert!(secs >= 1);
        assert!(secs <= 86_400);
    }

    #[tokio::test]
    async fn plan_defaults_to_free() {
        db::init_test_db().await;
        let ledger = SubscriptionLedger::new();
        let plan = ledger.get_plan("acct-ledger-missing").await.unwrap();
        assert_eq!(plan, PlanTier::Free);
    }

    #[tokio::test]
    async fn set_plan_overwrites_previous_value() {
        db::init_test_db().await;
        let ledger = SubscriptionLedger::new();
        ledger.set_plan("acct-ledger-plan", PlanTier::Pro).await.unwrap();
        assert_eq!(
            ledger.get_plan("acct-ledger-plan").await.unwrap(),
            PlanTier::Pro
        );
        ledger.set_plan("acct-ledger-plan", PlanTier::Free).await.unwrap();
        assert_eq!(
            ledger.get_plan("acct-ledger-plan").await.unwrap(),
            PlanTier::Free
        );
    }

    #[tokio::test]
    async fn daily_usage_accumulates() {
        db::init_test_db().await;
        let ledger = SubscriptionLedger::new();
        ledger
            .bump_daily_usage("acct-ledger-daily", "2026-08-20", 100, 50)
            .await
            .unwrap();
        ledger
            .bump_daily_usage("acct-ledger-daily", "2026-08-20", 7, 3)
            .await
            .unwrap();

        let totals = ledger
            .daily_totals("acct-ledger-daily", "2026-08-20")
            .await
            .unwrap();
        assert_eq!(totals.input_tokens, 107);
        assert_eq!(totals.output_tokens, 53);
        assert_eq!(totals.request_count, 2);

        let empty = ledger
            .daily_totals("acct-ledger-daily", "2026-08-21")
            .await
            .unwrap();
        assert_eq!(empty.input_tokens, 0);
        assert_eq!(empty.request_count, 0);
    }

    #[tokio::test]
    async fn totals_since_spans_days() {
        db::init_test_db().await;
        let ledger = SubscriptionLedger::new();
        ledger
            .bump_daily_usage("acct-ledger-month", "2026-07-31", 10, 0)
            .await
            .unwrap();
        ledger
            .bump_daily_usage("acct-ledger-month", "2026-08-01", 20, 0)
            .await
            .unwrap();
        ledger
            .bump_daily_usage("acct-ledger-month", "2026-08-15", 30, 0)
            .await
            .unwrap();

        let totals = ledger
            .totals_since("acct-ledger-month", "2026-08-01")
            .await
            .unwrap();
        assert_eq!(totals.input_tokens, 50);
        assert_eq!(totals.request_count, 2);
    }

    #[tokio::test]
    async fn history_fills_missing_days_newest_first() {
        db::init_test_db().await;
        let ledger = SubscriptionLedger::new();
        let today = today_utc();
        ledger
            .bump_daily_usage("acct-ledger-history", &today, 42, 8)
            .await
            .unwrap();

        let entries = ledger.usage_history("acct-ledger-history", 7).await.unwrap();
        assert_eq!(entries.len(), 7);
        assert_eq!(entries[0].day, today);
        assert_eq!(entries[0].input_tokens, 42);
        assert_eq!(entries[1].input_tokens, 0);
        assert!(entries[0].day > entries[1].day);
    }

    #[tokio::test]
    async fn subscription_event_insert_is_idempotent() {
        db::init_test_db().await;
        let ledger = SubscriptionLedger::new();
        let inserted = ledger
            .insert_subscription_event(
                "evt_ledger_1",
                "acct-ledger-evt",
                "customer.subscription.created",
                PlanTier::Pro,
            )
            .await
            .unwrap();
        assert!(inserted);
        assert!(ledger.has_subscription_event("evt_ledger_1").await.unwrap());

        let inserted_again = ledger
            .insert_subscription_event(
                "evt_ledger_1",
                "acct-ledger-evt",
                "customer.subscription.created",
                PlanTier::Pro,
            )
            .await
            .unwrap();
        assert!(!inserted_again);
    }

    #[tokio::test]
    async fn customer_mapping_roundtrip() {
        db::init_test_db().await;
        let ledger = SubscriptionLedger::new();
        assert_eq!(ledger.get_customer("acct-ledger-cust").await.unwrap(), None);
        ledger
            .put_customer("acct-ledger-cust", "cus_123")
            .await
            .unwrap();
        assert_eq!(
            ledger.get_customer("acct-ledger-cust").await.unwrap(),
            Some("cus_123".to_string())
        );
    }
}
