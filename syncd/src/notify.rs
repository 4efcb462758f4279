use tracing::warn;

/// Best-effort transactional failure email. Per §4.7 step 4, a failure here MUST
/// NOT prevent the job's own failure transition or the next-run scheduling step,
/// so every error is logged and swallowed rather than propagated.
pub async fn send_sync_failure_email(
    api_key: Option<&str>,
    from_email: Option<&str>,
    to_email: &str,
    job_type: &str,
    error_message: &str,
) {
    let (Some(api_key), Some(from_email)) = (api_key, from_email) else {
        return;
    };

    let client = reqwest::Client::new();
    let result = client
        .post("https://api.notification-provider.example/v3/mail/send")
        .bearer_auth(api_key)
        .json(&serde_json::json!({
            "from": from_email,
            "to": to_email,
            "subject": format!("Sync failed: {job_type}"),
            "text": error_message,
        }))
        .send()
        .await;

    if let Err(err) = result {
        warn!(?err, to_email, job_type, "failed to send sync failure notification");
    }
}
