use chrono::{Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::{commerce_a, commerce_b, fulfillment_f, AdapterCtx};
use crate::httpclient::RetryingHttpClient;
use crate::models::{Platform, PlanStatus, SyncJob};
use crate::notify;
use crate::queue::Queue;
use crate::ratelimit::Budgeter;
use crate::scheduler::{cadence_minutes, recurring_priority, StreamFamily};
use crate::vault::Vault;

type AdapterFn = for<'a> fn(
    &'a AdapterCtx,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<i64>> + Send + 'a>>;

/// Static `job_type -> adapter fn` registry. Backfill is handled separately in
/// `run()` since it fans out across every connected platform rather than mapping
/// to a single adapter call.
static ADAPTER_REGISTRY: Lazy<HashMap<&'static str, AdapterFn>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, AdapterFn> = HashMap::new();
    m.insert("commerce-A_orders", |ctx| Box::pin(async move { Ok(commerce_a::run_orders(ctx).await?) }));
    m.insert("commerce-A_listings", |ctx| Box::pin(async move { Ok(commerce_a::run_listings(ctx).await?) }));
    m.insert("commerce-A_payments", |ctx| Box::pin(async move { Ok(commerce_a::run_payments(ctx).await?) }));
    m.insert("commerce-B_orders", |ctx| Box::pin(async move { Ok(commerce_b::run_orders(ctx).await?) }));
    m.insert("commerce-B_products", |ctx| Box::pin(async move { Ok(commerce_b::run_products(ctx).await?) }));
    m.insert("commerce-B_customers", |ctx| Box::pin(async move { Ok(commerce_b::run_customers(ctx).await?) }));
    m.insert("fulfillment-F_orders", |ctx| Box::pin(async move { Ok(fulfillment_f::run_orders(ctx).await?) }));
    m.insert("fulfillment-F_products", |ctx| Box::pin(async move { Ok(fulfillment_f::run_products(ctx).await?) }));
    m
});

/// Executes queued jobs (§4.7). One `WorkerRuntime` is shared by the scheduler; each
/// dispatched job gets its own `AdapterCtx` built fresh from shared dependencies.
pub struct WorkerRuntime {
    pool: PgPool,
    queue: Arc<Queue>,
    vault: Arc<Vault>,
    http: RetryingHttpClient,
    budgeter: Arc<Budgeter>,
    commerce_a_api_key: Option<String>,
    commerce_b_client: Option<(String, String)>,
    notification_api_key: Option<String>,
    from_email: Option<String>,
}

impl WorkerRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        queue: Arc<Queue>,
        vault: Arc<Vault>,
        http: RetryingHttpClient,
        budgeter: Arc<Budgeter>,
        commerce_a_api_key: Option<String>,
        commerce_b_client: Option<(String, String)>,
        notification_api_key: Option<String>,
        from_email: Option<String>,
    ) -> Self {
        Self {
            pool,
            queue,
            vault,
            http,
            budgeter,
            commerce_a_api_key,
            commerce_b_client,
            notification_api_key,
            from_email,
        }
    }

    fn ctx_for(&self, tenant_id: Uuid, platform: Platform) -> AdapterCtx {
        AdapterCtx {
            tenant_id,
            platform,
            pool: self.pool.clone(),
            vault: self.vault.clone(),
            http: self.http.clone(),
            budgeter: self.budgeter.clone(),
            commerce_a_api_key: self.commerce_a_api_key.clone(),
            commerce_b_client: self.commerce_b_client.clone(),
        }
    }

    /// Runs one job end-to-end per the §4.7 five-step contract.
    pub async fn run(&self, job: SyncJob) -> anyhow::Result<()> {
        let job_id = job.id;
        let tenant_id = job.tenant_id;
        let job_type = job.job_type.clone();

        let result = if job_type.starts_with("backfill") {
            self.run_backfill(tenant_id).await
        } else {
            self.run_single(tenant_id, &job_type).await
        };

        match result {
            Ok(records) => {
                self.queue.transition_completed(job_id, records).await?;
                info!(job_id = %job_id, job_type, records, "job completed");
            }
            Err(err) => {
                warn!(job_id = %job_id, job_type, error = %err, "job failed");
                self.queue.transition_failed(job_id, &err.to_string()).await?;
                self.notify_failure(tenant_id, &job_type, &err.to_string()).await;
            }
        }

        // Step 5 always runs, independent of success/failure above.
        if !job_type.starts_with("backfill") {
            if let Err(err) = self.schedule_next(tenant_id, &job_type).await {
                error!(job_id = %job_id, ?err, "failed to schedule next recurring run");
            }
        }

        Ok(())
    }

    async fn run_single(&self, tenant_id: Uuid, job_type: &str) -> anyhow::Result<i64> {
        let platform_prefix = job_type.split('_').next().unwrap_or(job_type);
        let platform = Platform::from_job_prefix(platform_prefix)
            .ok_or_else(|| anyhow::anyhow!("unknown platform prefix: {platform_prefix}"))?;
        let ctx = self.ctx_for(tenant_id, platform);

        let adapter = ADAPTER_REGISTRY
            .get(job_type)
            .ok_or_else(|| anyhow::anyhow!("no adapter registered for job_type: {job_type}"))?;
        let records = adapter(&ctx).await?;
        Ok(records)
    }

    /// Runs the full-history adapters for every connected platform for one tenant.
    /// Per-platform failures are logged but don't abort the whole backfill; one
    /// completion SyncLog record is written at the end.
    async fn run_backfill(&self, tenant_id: Uuid) -> anyhow::Result<i64> {
        let platforms: Vec<Platform> = sqlx::query_scalar(
            "SELECT platform FROM connected_accounts WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut total = 0i64;
        for platform in platforms {
            let ctx = self.ctx_for(tenant_id, platform);
            let job_types: Vec<&str> = ADAPTER_REGISTRY
                .keys()
                .copied()
                .filter(|k| k.starts_with(platform.as_job_prefix()))
                .collect();

            for job_type in job_types {
                let adapter = ADAPTER_REGISTRY.get(job_type).expect("just filtered from registry");
                match adapter(&ctx).await {
                    Ok(records) => total += records,
                    Err(err) => {
                        warn!(tenant_id = %tenant_id, job_type, error = %err, "backfill stream failed, continuing");
                        self.log_sync_event(tenant_id, Some(platform), job_type, "failed", &err.to_string())
                            .await;
                    }
                }
            }
        }

        self.log_sync_event(tenant_id, None, "backfill", "completed", &format!("{total} records"))
            .await;
        Ok(total)
    }

    async fn log_sync_event(
        &self,
        tenant_id: Uuid,
        platform: Option<Platform>,
        job_type: &str,
        status: &str,
        detail: &str,
    ) {
        let result = sqlx::query(
            "INSERT INTO sync_logs (id, tenant_id, platform, job_type, status, error_message, details, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, '{}'::jsonb, now())",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(platform)
        .bind(job_type)
        .bind(status)
        .bind(detail)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(?err, "failed to write sync log entry");
        }
    }

    async fn notify_failure(&self, tenant_id: Uuid, job_type: &str, error_message: &str) {
        if self.notification_api_key.is_none() || self.from_email.is_none() {
            return;
        }
        let email: Option<String> =
            sqlx::query_scalar("SELECT notification_email FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await
                .ok()
                .flatten();

        let Some(email) = email else { return };
        notify::send_sync_failure_email(
            self.notification_api_key.as_deref(),
            self.from_email.as_deref(),
            &email,
            job_type,
            error_message,
        )
        .await;
    }

    /// Enqueues the next recurring run for `(tenant, job_type)` at `now + cadence`,
    /// subject to the single-pending-run invariant enforced by `Queue::enqueue`.
    async fn schedule_next(&self, tenant_id: Uuid, job_type: &str) -> anyhow::Result<()> {
        let (plan,): (crate::models::Plan,) =
            sqlx::query_as("SELECT plan FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;
        let plan_status: PlanStatus = sqlx::query_scalar("SELECT plan_status FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        if plan_status != PlanStatus::Active {
            return Ok(());
        }

        let family = StreamFamily::from_job_type(job_type);
        let cadence = cadence_minutes(plan, family);
        let next_run = Utc::now() + ChronoDuration::minutes(cadence);
        let priority = recurring_priority(plan);

        self.queue
            .enqueue(tenant_id, job_type, priority, next_run, serde_json::json!({}))
            .await?;
        Ok(())
    }
}

