use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, Registry, TextEncoder};

#[derive(Clone)]
pub struct SyncMetrics {
    registry: Registry,
    pub jobs_claimed_total: IntCounter,
    pub jobs_completed_total: IntCounter,
    pub jobs_failed_total: IntCounter,
    pub jobs_deferred_rate_limited_total: IntCounter,
    pub jobs_reaped_stale_total: IntCounter,
    pub adapter_requests_total: IntCounterVec,
    pub adapter_request_duration_seconds: Histogram,
    pub vault_refresh_total: IntCounterVec,
    pub webhook_signature_failures_total: IntCounter,
}

impl SyncMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let jobs_claimed_total = IntCounter::new(
            "syncd_jobs_claimed_total",
            "Jobs claimed by the dispatcher",
        )?;
        let jobs_completed_total =
            IntCounter::new("syncd_jobs_completed_total", "Jobs completed successfully")?;
        let jobs_failed_total = IntCounter::new("syncd_jobs_failed_total", "Jobs that failed terminally")?;
        let jobs_deferred_rate_limited_total = IntCounter::new(
            "syncd_jobs_deferred_rate_limited_total",
            "Jobs deferred by the rate gate",
        )?;
        let jobs_reaped_stale_total = IntCounter::new(
            "syncd_jobs_reaped_stale_total",
            "Jobs forcibly failed by the stale reaper",
        )?;
        let adapter_requests_total = IntCounterVec::new(
            prometheus::Opts::new(
                "syncd_adapter_requests_total",
                "Adapter HTTP requests issued, by platform and outcome",
            ),
            &["platform", "outcome"],
        )?;
        let adapter_request_duration_seconds = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "syncd_adapter_request_duration_seconds",
                "Adapter HTTP request duration including retries",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let vault_refresh_total = IntCounterVec::new(
            prometheus::Opts::new(
                "syncd_vault_refresh_total",
                "Token refresh attempts, by platform and outcome",
            ),
            &["platform", "outcome"],
        )?;
        let webhook_signature_failures_total = IntCounter::new(
            "syncd_webhook_signature_failures_total",
            "Inbound webhook requests rejected for signature mismatch",
        )?;

        registry.register(Box::new(jobs_claimed_total.clone()))?;
        registry.register(Box::new(jobs_completed_total.clone()))?;
        registry.register(Box::new(jobs_failed_total.clone()))?;
        registry.register(Box::new(jobs_deferred_rate_limited_total.clone()))?;
        registry.register(Box::new(jobs_reaped_stale_total.clone()))?;
        registry.register(Box::new(adapter_requests_total.clone()))?;
        registry.register(Box::new(adapter_request_duration_seconds.clone()))?;
        registry.register(Box::new(vault_refresh_total.clone()))?;
        registry.register(Box::new(webhook_signature_failures_total.clone()))?;

        Ok(Self {
            registry,
            jobs_claimed_total,
            jobs_completed_total,
            jobs_failed_total,
            jobs_deferred_rate_limited_total,
            jobs_reaped_stale_total,
            adapter_requests_total,
            adapter_request_duration_seconds,
            vault_refresh_total,
            webhook_signature_failures_total,
        })
    }

    pub fn render(&self) -> anyhow::Result<Response> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", encoder.format_type())
            .body(Body::from(buf))?)
    }
}
