use std::future::Future;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::error::PixyStreamError;
use crate::fetch::{Fetch, FetchRequest, FetchResponse};
use crate::source::ByteSource;
use crate::types::{RateLimitNotice, RetryPolicy};

pub type RateLimitHook = dyn FnMut(RateLimitNotice) + Send;

const RATE_LIMIT_TYPE: &str = "RATE_LIMIT_REACHED";
const RATE_LIMIT_CODE: &str = "429";
const TOO_MANY_REQUESTS: u16 = 429;

/// Sends `request` through `fetch`, retrying while the upstream reports a
/// rate limit.
pub async fn execute_with_backoff(
    fetch: Option<&dyn Fetch>,
    request: &FetchRequest,
    policy: &RetryPolicy,
    on_rate_limited: Option<&mut RateLimitHook>,
) -> Result<FetchResponse, PixyStreamError> {
    let Some(fetch) = fetch else {
        return Err(PixyStreamError::Config(
            "no fetch capability configured for the request".to_string(),
        ));
    };
    retry_rate_limited(policy, on_rate_limited, || fetch.fetch(request.clone())).await
}

/// Runs `operation` until it returns something other than a rate limit.
///
/// Transport errors return immediately. A non-success response that is not a
/// rate limit is handed back untouched. Each retry waits twice as long as the
/// one before, starting at the policy's initial delay.
pub async fn retry_rate_limited<F, Fut>(
    policy: &RetryPolicy,
    mut on_rate_limited: Option<&mut RateLimitHook>,
    mut operation: F,
) -> Result<FetchResponse, PixyStreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<FetchResponse, PixyStreamError>>,
{
    let mut delay = policy.initial_delay();
    let mut attempt = 0u32;
    loop {
        let response = operation().await?;
        if response.is_ok() {
            return Ok(response);
        }

        let (response, rate_limited) = inspect_rate_limit(response).await?;
        if !rate_limited {
            return Ok(response);
        }

        if attempt >= policy.max_retries {
            error!(retries = attempt, "rate limit retries exhausted");
            return Err(PixyStreamError::MaxRetriesExceeded { retries: attempt });
        }

        warn!(
            retry = attempt,
            delay_ms = delay.as_millis() as u64,
            "rate limit reached, backing off"
        );
        if let Some(hook) = on_rate_limited.as_deref_mut() {
            hook(RateLimitNotice {
                retries: attempt,
                delay,
            });
        }
        sleep(delay).await;
        delay = delay.saturating_mul(2);
        attempt += 1;
    }
}

/// Buffers a failed response body so it can be checked and still returned.
async fn inspect_rate_limit(
    response: FetchResponse,
) -> Result<(FetchResponse, bool), PixyStreamError> {
    let FetchResponse {
        status,
        headers,
        body,
    } = response;
    let bytes = body.read_to_end().await?;
    let rate_limited = status == TOO_MANY_REQUESTS
        || serde_json::from_slice::<Value>(&bytes)
            .map(|value| is_rate_limit_body(&value))
            .unwrap_or(false);

    Ok((
        FetchResponse {
            status,
            headers,
            body: ByteSource::from_bytes(bytes),
        },
        rate_limited,
    ))
}

fn is_rate_limit_body(body: &Value) -> bool {
    if body.get("type").and_then(Value::as_str) == Some(RATE_LIMIT_TYPE) {
        return true;
    }
    match body.get("error").and_then(|error| error.get("code")) {
        Some(Value::String(code)) => code == RATE_LIMIT_CODE,
        Some(Value::Number(code)) => code.as_u64() == Some(u64::from(TOO_MANY_REQUESTS)),
        _ => false,
    }
}
