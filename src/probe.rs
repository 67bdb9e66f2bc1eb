use futures::future::join_all;
use serde_json::Value;
use std::time::Duration;

/// An endpoint lagging more than this many blocks behind the best responder
/// is serving stale state and must not be used for verdicts.
pub const MAX_BLOCK_HEIGHT_LAG: u64 = 25;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LatestBlock {
    pub height: u64,
    pub time: String,
}

/// Probe result for one configured endpoint; `block` is None on timeout,
/// non-200, or a malformed body.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub base_url: String,
    pub block: Option<LatestBlock>,
}

/// Fetches `/cosmos/base/tendermint/v1beta1/blocks/latest` from one endpoint.
///
/// Tendermint encodes the height as a decimal string.
pub async fn fetch_latest_block(client: &reqwest::Client, base_url: &str) -> Option<LatestBlock> {
    let url = format!("{base_url}/cosmos/base/tendermint/v1beta1/blocks/latest");
    let response = match client.get(&url).timeout(PROBE_TIMEOUT).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(url = %url, error = %err, "latest block probe failed");
            return None;
        }
    };
    if !response.status().is_success() {
        tracing::warn!(url = %url, status = %response.status(), "latest block probe rejected");
        return None;
    }
    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(url = %url, error = %err, "latest block body was not JSON");
            return None;
        }
    };
    let header = body.get("block").and_then(|block| block.get("header"))?;
    let height = header
        .get("height")
        .and_then(Value::as_str)
        .and_then(|height| height.parse::<u64>().ok())?;
    let time = header.get("time").and_then(Value::as_str)?.to_owned();
    tracing::debug!(base_url, height, time = %time, "latest block probed");
    Some(LatestBlock { height, time })
}

/// Probes every configured endpoint concurrently and returns the healthy
/// subset in input order. Empty when nothing responded.
pub async fn check_endpoints(client: &reqwest::Client, endpoints: &[String]) -> Vec<String> {
    let statuses = join_all(endpoints.iter().map(|base_url| async move {
        EndpointStatus {
            base_url: base_url.clone(),
            block: fetch_latest_block(client, base_url).await,
        }
    }))
    .await;

    let healthy = classify_healthy(&statuses);
    let unhealthy: Vec<&str> = statuses
        .iter()
        .filter(|status| !healthy.contains(&status.base_url))
        .map(|status| status.base_url.as_str())
        .collect();
    if healthy.is_empty() {
        tracing::warn!(unhealthy = ?unhealthy, "no healthy API endpoints");
    } else {
        tracing::info!(healthy = ?healthy, unhealthy = ?unhealthy, "endpoint probe complete");
    }
    healthy
}

/// An endpoint is healthy iff it responded and sits within
/// `MAX_BLOCK_HEIGHT_LAG` blocks of the best responding height.
pub fn classify_healthy(statuses: &[EndpointStatus]) -> Vec<String> {
    let max_height = statuses
        .iter()
        .filter_map(|status| status.block.as_ref().map(|block| block.height))
        .max();
    let Some(max_height) = max_height else {
        return Vec::new();
    };
    statuses
        .iter()
        .filter(|status| {
            status
                .block
                .as_ref()
                .is_some_and(|block| max_height - block.height <= MAX_BLOCK_HEIGHT_LAG)
        })
        .map(|status| status.base_url.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(url: &str, height: Option<u64>) -> EndpointStatus {
        EndpointStatus {
            base_url: url.to_owned(),
            block: height.map(|height| LatestBlock {
                height,
                time: "2024-01-01T00:00:00Z".to_owned(),
            }),
        }
    }

    #[test]
    fn healthy_set_is_empty_when_nothing_responded() {
        let statuses = [status("a", None), status("b", None)];
        assert!(classify_healthy(&statuses).is_empty());
    }

    #[test]
    fn laggards_beyond_threshold_are_excluded() {
        let statuses = [
            status("a", Some(1000)),
            status("b", Some(975)),
            status("c", Some(974)),
            status("d", None),
        ];
        assert_eq!(classify_healthy(&statuses), vec!["a", "b"]);
    }

    #[test]
    fn input_order_is_preserved() {
        let statuses = [
            status("b", Some(990)),
            status("a", Some(1000)),
            status("c", Some(999)),
        ];
        assert_eq!(classify_healthy(&statuses), vec!["b", "a", "c"]);
    }

    #[test]
    fn single_responder_is_always_healthy() {
        let statuses = [status("a", None), status("b", Some(5))];
        assert_eq!(classify_healthy(&statuses), vec!["b"]);
    }
}
