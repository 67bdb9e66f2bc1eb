use crate::config::MonitorConfig;
use crate::epoch::epoch_number;
use crate::probe::fetch_latest_block;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Error sentinel the oracle module returns in a 200 body when the validator
/// has no aggregate vote/prevote for the current window.
const CODE_ERROR: i64 = 2;

/// Everything one monitor tick needs from the chain.
#[derive(Debug, Clone)]
pub struct CollectTick {
    pub endpoint: String,
    pub miss_counter: u64,
    pub signed_this_tick: bool,
    pub current_epoch: u64,
    pub wallet_balance: u64,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected status {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("malformed response from {url}: missing or invalid '{field}'")]
    Malformed { url: String, field: &'static str },
    #[error("latest block unavailable from {0}")]
    LatestBlock(String),
    #[error("no healthy endpoint to collect from")]
    NoHealthyEndpoint,
}

/// Picks one healthy endpoint uniformly at random and assembles a tick from
/// it. Any failed required query aborts the tick; the caller backs off and
/// retries without touching state.
pub async fn collect_from_random_healthy(
    client: &reqwest::Client,
    healthy: &[String],
    config: &MonitorConfig,
) -> Result<CollectTick, CollectError> {
    let endpoint = healthy
        .choose(&mut rand::thread_rng())
        .ok_or(CollectError::NoHealthyEndpoint)?
        .clone();
    tracing::debug!(endpoint = %endpoint, "collecting from endpoint");

    let miss_counter = check_miss_counter(client, &endpoint, &config.validator_address).await?;

    // The prevote is informational only; the verdict hangs on the reveal.
    log_aggregate_prevote(client, &endpoint, &config.validator_address).await;

    let vote_targets = collect_vote_targets(client, &endpoint).await?;
    let signed_this_tick =
        check_aggregate_vote(client, &endpoint, &config.validator_address, &vote_targets).await;

    let slash_window = collect_slash_window(client, &endpoint).await?;
    let latest = fetch_latest_block(client, &endpoint)
        .await
        .ok_or_else(|| CollectError::LatestBlock(endpoint.clone()))?;
    let current_epoch = epoch_number(latest.height, slash_window);

    let wallet_balance = check_wallet_balance(client, &endpoint, &config.price_feed_addr).await?;

    tracing::info!(
        endpoint = %endpoint,
        miss_counter,
        signed = signed_this_tick,
        epoch = current_epoch,
        balance = wallet_balance,
        "tick collected"
    );

    Ok(CollectTick {
        endpoint,
        miss_counter,
        signed_this_tick,
        current_epoch,
        wallet_balance,
    })
}

async fn get_json(client: &reqwest::Client, url: &str) -> Result<Value, CollectError> {
    let response = client
        .get(url)
        .timeout(QUERY_TIMEOUT)
        .send()
        .await
        .map_err(|source| CollectError::Http {
            url: url.to_owned(),
            source,
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(CollectError::Status {
            url: url.to_owned(),
            status,
        });
    }
    response.json().await.map_err(|source| CollectError::Http {
        url: url.to_owned(),
        source,
    })
}

async fn check_miss_counter(
    client: &reqwest::Client,
    api: &str,
    validator: &str,
) -> Result<u64, CollectError> {
    let url = format!("{api}/nibiru/oracle/v1beta1/validators/{validator}/miss");
    let body = get_json(client, &url).await?;
    body.get("miss_counter")
        .and_then(u64_from_value)
        .ok_or(CollectError::Malformed {
            url,
            field: "miss_counter",
        })
}

async fn log_aggregate_prevote(client: &reqwest::Client, api: &str, validator: &str) {
    let url = format!("{api}/nibiru/oracle/v1beta1/validators/{validator}/aggregate_prevote");
    match get_json(client, &url).await {
        Ok(body) => {
            if let Some(prevote) = body.get("aggregate_prevote") {
                let hash = prevote.get("hash").and_then(Value::as_str).unwrap_or("");
                let submit_block = prevote.get("submit_block").and_then(u64_from_value);
                tracing::debug!(hash, submit_block, "aggregate prevote present");
            } else {
                tracing::warn!(url = %url, "no aggregate prevote in response");
            }
        }
        Err(err) => tracing::warn!(error = %err, "failed to collect aggregate prevote"),
    }
}

async fn collect_vote_targets(
    client: &reqwest::Client,
    api: &str,
) -> Result<HashSet<String>, CollectError> {
    let url = format!("{api}/nibiru/oracle/v1beta1/pairs/vote_targets");
    let body = get_json(client, &url).await?;
    let targets = body
        .get("vote_targets")
        .and_then(Value::as_array)
        .ok_or(CollectError::Malformed {
            url,
            field: "vote_targets",
        })?;
    Ok(targets
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect())
}

/// True iff the validator's aggregate vote landed and covers every required
/// pair. Anything else — transport error, non-200, the `code == 2` sentinel,
/// a missing vote, a pair outside the target set — counts as unsigned.
async fn check_aggregate_vote(
    client: &reqwest::Client,
    api: &str,
    validator: &str,
    vote_targets: &HashSet<String>,
) -> bool {
    // "valdiators" is not a typo here: the deployed oracle REST route is
    // misspelled, and the correctly spelled path 404s.
    let url = format!("{api}/nibiru/oracle/v1beta1/valdiators/{validator}/aggregate_vote");
    match get_json(client, &url).await {
        Ok(body) => vote_covers_targets(&body, vote_targets),
        Err(err) => {
            tracing::warn!(error = %err, "failed to collect aggregate vote");
            false
        }
    }
}

fn vote_covers_targets(body: &Value, vote_targets: &HashSet<String>) -> bool {
    if body.get("code").and_then(Value::as_i64) == Some(CODE_ERROR) {
        let message = body.get("message").and_then(Value::as_str).unwrap_or("");
        tracing::warn!(message, "oracle reports no aggregate vote");
        return false;
    }
    let Some(tuples) = body
        .get("aggregate_vote")
        .and_then(|vote| vote.get("exchange_rate_tuples"))
        .and_then(Value::as_array)
    else {
        tracing::warn!("aggregate vote response had no exchange rate tuples");
        return false;
    };
    for tuple in tuples {
        let Some(pair) = tuple.get("pair").and_then(Value::as_str) else {
            return false;
        };
        if !vote_targets.contains(pair) {
            tracing::warn!(pair, "voted pair is not a vote target");
            return false;
        }
    }
    true
}

async fn collect_slash_window(client: &reqwest::Client, api: &str) -> Result<u64, CollectError> {
    let url = format!("{api}/nibiru/oracle/v1beta1/params");
    let body = get_json(client, &url).await?;
    body.get("params")
        .and_then(|params| params.get("slash_window"))
        .and_then(u64_from_value)
        .filter(|window| *window > 0)
        .ok_or(CollectError::Malformed {
            url,
            field: "params.slash_window",
        })
}

async fn check_wallet_balance(
    client: &reqwest::Client,
    api: &str,
    wallet: &str,
) -> Result<u64, CollectError> {
    let url = format!("{api}/cosmos/bank/v1beta1/spendable_balances/{wallet}");
    let body = get_json(client, &url).await?;
    unibi_balance(&body).ok_or(CollectError::Malformed {
        url,
        field: "balances",
    })
}

/// Sums the `unibi` entries of a spendable-balances reply. A reply with no
/// `unibi` entry is a drained wallet, not an error, and reads as 0.
fn unibi_balance(body: &Value) -> Option<u64> {
    let balances = body.get("balances").and_then(Value::as_array)?;
    let mut total: u64 = 0;
    for balance in balances {
        if balance.get("denom").and_then(Value::as_str) == Some("unibi") {
            total += balance.get("amount").and_then(u64_from_value)?;
        }
    }
    Some(total)
}

/// Cosmos LCD responses encode u64 as JSON strings; accept both forms.
fn u64_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}
