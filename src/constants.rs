/// Anthropic API version header value sent upstream when the caller omits one
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Fixed rate-limit window length
pub const RATE_WINDOW_MS: u64 = 60_000;

/// Free plan: requests per minute
pub const FREE_REQUESTS_PER_MINUTE: u32 = 10;

/// Free plan: tokens per UTC day (input + output)
pub const FREE_TOKENS_PER_DAY: u64 = 100_000;

/// Pro plan: requests per minute
pub const PRO_REQUESTS_PER_MINUTE: u32 = 60;

/// Pro plan: tokens per UTC day (input + output)
pub const PRO_TOKENS_PER_DAY: u64 = 5_000_000;

/// Largest token count accepted in a single reported usage record
pub const MAX_TOKENS_PER_RECORD: i64 = 10_000_000;

/// Largest latency accepted in a reported usage record (1 hour)
pub const MAX_LATENCY_MS: i64 = 3_600_000;

/// Pending usage events buffered before new records are dropped
pub const USAGE_QUEUE_CAPACITY: usize = 1024;

/// Webhook timestamps older or newer than this are rejected as replays
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Models callers may request through the gateway
pub static ALLOWED_MODELS: &[&str] = &[
    "claude-opus-4-5-20251101",
    "claude-opus-4-5",
    "claude-sonnet-4-5-20250929",
    "claude-sonnet-4-5",
    "claude-haiku-4-5-20251001",
    "claude-haiku-4-5",
    "claude-sonnet-4-0",
    "claude-haiku-3-5",
];
