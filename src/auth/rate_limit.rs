use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::auth::PlanTier;
use crate::constants::RATE_WINDOW_MS;
use crate::error::GatewayError;
use crate::ledger::{SubscriptionLedger, secs_until_day_rollover, timestamp_millis, today_utc};

/// Pluggable fixed-window request counter. The gateway ships with the
/// in-process implementation; a shared store can be swapped in behind
/// this trait without touching the governor.
#[async_trait]
pub trait RateWindowStore: Send + Sync {
    /// Count one request against the account's window. `Err` carries the
    /// seconds until the window resets.
    async fn admit(&self, account_id: &str, ceiling: u32, now_ms: u64) -> Result<(), u64>;
}

struct RateWindow {
    count: u32,
    reset_at: u64,
}

/// Per-process fixed windows keyed by account id
pub struct InMemoryRateWindows {
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl InMemoryRateWindows {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateWindowStore for InMemoryRateWindows {
    async fn admit(&self, account_id: &str, ceiling: u32, now_ms: u64) -> Result<(), u64> {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(account_id.to_string()).or_insert(RateWindow {
            count: 0,
            reset_at: now_ms + RATE_WINDOW_MS,
        });

        // An expired window starts over rather than sliding
        if now_ms >= window.reset_at {
            window.count = 0;
            window.reset_at = now_ms + RATE_WINDOW_MS;
        }

        if window.count >= ceiling {
            return Err((window.reset_at - now_ms).div_ceil(1000));
        }
        window.count += 1;
        Ok(())
    }
}

/// Enforces per-plan request and token ceilings before a request may
/// reach the upstream.
#[derive(Clone)]
pub struct RateGovernor {
    windows: Arc<dyn RateWindowStore>,
    ledger: SubscriptionLedger,
}

impl RateGovernor {
    pub fn new(windows: Arc<dyn RateWindowStore>, ledger: SubscriptionLedger) -> Self {
        Self { windows, ledger }
    }

    /// Admit one request for the account or explain when to retry.
    /// The daily token quota is read-then-decide: a request is admitted
    /// while the recorded total is still below the ceiling, so the day's
    /// final request may overshoot.
    pub async fn check(&self, account_id: &str) -> Result<PlanTier, GatewayError> {
        let plan = self.ledger.get_plan(account_id).await?;
        let limits = plan.limits();

        if let Err(retry_after_secs) = self
            .windows
            .admit(account_id, limits.requests_per_minute, timestamp_millis())
            .await
        {
            return Err(GatewayError::RateLimitExceeded {
                limit: limits.requests_per_minute,
                retry_after_secs,
            });
        }

        let totals = self.ledger.daily_totals(account_id, &today_utc()).await?;
        let used = totals.input_tokens + totals.output_tokens;
        if used >= limits.tokens_per_day {
            return Err(GatewayError::QuotaExceeded {
                used,
                limit: limits.tokens_per_day,
                retry_after_secs: secs_until_day_rollover(),
            });
        }

        Ok(plan)
    }
}
