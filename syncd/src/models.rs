use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription plan, governing sync cadence and priority (§4.6 cadence table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Plan {
    Free,
    Starter,
    Growth,
    Pro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    PastDue,
    Cancelled,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub plan: Plan,
    pub plan_status: PlanStatus,
    pub notification_email: Option<String>,
}

/// One of the upstream platforms an adapter integrates with. The first `_`-delimited
/// token of a `job_type` string names one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
pub enum Platform {
    CommerceA,
    CommerceB,
    FulfillmentF,
    NewsletterN,
}

impl Platform {
    pub fn as_job_prefix(&self) -> &'static str {
        match self {
            Platform::CommerceA => "commerce-A",
            Platform::CommerceB => "commerce-B",
            Platform::FulfillmentF => "fulfillment-F",
            Platform::NewsletterN => "newsletter-N",
        }
    }

    pub fn from_job_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "commerce-A" => Some(Platform::CommerceA),
            "commerce-B" => Some(Platform::CommerceB),
            "fulfillment-F" => Some(Platform::FulfillmentF),
            "newsletter-N" => Some(Platform::NewsletterN),
            _ => None,
        }
    }

    /// The pseudo-platform used for backfill jobs at the scheduler's admission gates;
    /// real rate checks still happen against the true upstream inside the worker.
    pub fn backfill_pseudo() -> &'static str {
        "backfill"
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConnectedAccount {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub platform: Platform,
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub shop_identifier: Option<String>,
    pub sync_cursor: serde_json::Value,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub records_processed: Option<i64>,
    pub metadata: serde_json::Value,
}

impl SyncJob {
    /// The first `_`-delimited token, e.g. `commerce-A` from `commerce-A_orders`,
    /// `backfill` from `backfill_commerce-A`.
    pub fn platform_key(&self) -> &str {
        self.job_type.split('_').next().unwrap_or(&self.job_type)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncLog {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub platform: Option<Platform>,
    pub job_type: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub records_count: Option<i64>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RateLimitLedgerRow {
    pub utc_date: chrono::NaiveDate,
    pub platform: Platform,
    pub tenant_id: Option<Uuid>,
    pub request_count: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub platform: Platform,
    pub platform_order_id: String,
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub ordered_at: DateTime<Utc>,
    pub fulfillment_status: Option<String>,
    pub printify_production_cost_cents: Option<i64>,
    pub printify_shipping_cost_cents: Option<i64>,
    pub raw_data: serde_json::Value,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LineItem {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub platform_line_item_id: String,
    pub title: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub total_cents: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Product {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub platform: Platform,
    pub platform_product_id: String,
    pub title: String,
    pub production_cost_cents: Option<i64>,
    pub raw_data: serde_json::Value,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub platform: Platform,
    pub platform_customer_id: String,
    pub email: Option<String>,
    pub raw_data: serde_json::Value,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Fee {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub platform: Platform,
    pub platform_ledger_entry_id: String,
    pub order_id: Option<Uuid>,
    pub amount_cents: i64,
    pub fee_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SubscriberStatus {
    Pending,
    ConfirmationSent,
    Failed,
    PendingUnsub,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NewsletterSubscriber {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub upstream_status: Option<String>,
    pub downstream_status: SubscriberStatus,
    pub last_webhook_at: Option<DateTime<Utc>>,
}
