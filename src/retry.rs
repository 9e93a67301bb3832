pub const MAX_FETCH_ATTEMPTS: u32 = 3;
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 8000;

/// Exponential backoff with +/-25% jitter for the given 1-based attempt.
pub fn retry_delay(attempt: u32) -> std::time::Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay_ms = (BASE_RETRY_DELAY_MS * 2_u64.pow(exponent)).min(MAX_RETRY_DELAY_MS);
    let jitter_range = delay_ms / 4;
    let jitter = fastrand::u64(0..=jitter_range * 2);
    std::time::Duration::from_millis(delay_ms.saturating_sub(jitter_range).saturating_add(jitter))
}

/// Retries a record store fetch a bounded number of times before giving up.
macro_rules! retry_db_operation {
    ($context:expr, $operation:expr) => {{
        let context_value: String = $context.into();
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= $crate::retry::MAX_FETCH_ATTEMPTS => break Err(err),
                Err(err) => {
                    let delay = $crate::retry::retry_delay(attempt);
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                        attempt,
                        $crate::retry::MAX_FETCH_ATTEMPTS,
                        context_value,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_db_operation;
