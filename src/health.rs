use crate::shutdown::ShutdownFlag;
use std::time::Duration;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Dead-man-switch pinger: a plain GET to the configured URL every
/// `interval`. The switch alerts out-of-band when the pings stop, so every
/// failure here is logged and swallowed — this task must never die on its
/// own. `max_iterations` bounds the loop for tests.
pub async fn run_health_pinger(
    url: String,
    interval: Duration,
    max_iterations: Option<u64>,
    mut shutdown: ShutdownFlag,
) {
    let client = reqwest::Client::new();
    let mut iterations: u64 = 0;
    loop {
        if shutdown.is_triggered() {
            break;
        }
        ping(&client, &url).await;
        iterations += 1;
        if max_iterations.is_some_and(|max| iterations >= max) {
            break;
        }
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    tracing::info!("health pinger stopped");
}

async fn ping(client: &reqwest::Client, url: &str) {
    match client.get(url).timeout(PING_TIMEOUT).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::info!(url, "dead man switch pinged");
        }
        Ok(response) => {
            tracing::warn!(url, status = %response.status(), "dead man switch ping rejected");
        }
        Err(err) => {
            tracing::warn!(url, error = %err, "dead man switch ping failed");
        }
    }
}
