//! Escalating-timeout retries for mesh requests.

use crate::ProcedureError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Reply deadlines of the successive attempts
pub const RETRY_TIMEOUTS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

/// Run `op` once per entry of `timeouts`, passing the deadline to use.
///
/// Stops at the first success or non-retryable error; the last error is
/// returned when every attempt fails.
pub async fn with_retries<T, F, Fut>(
    what: &str,
    timeouts: &[Duration],
    mut op: F,
) -> Result<T, ProcedureError>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T, ProcedureError>>,
{
    let mut last = ProcedureError::InvalidState("no attempt configured");
    for (attempt, timeout) in timeouts.iter().enumerate() {
        match op(*timeout).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                warn!(
                    "{} attempt {}/{} failed: {}",
                    what,
                    attempt + 1,
                    timeouts.len(),
                    e
                );
                last = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_session::SessionError;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_escalates_then_succeeds() {
        let seen = Mutex::new(Vec::new());
        let result = with_retries("probe", &RETRY_TIMEOUTS, |t| {
            seen.lock().unwrap().push(t);
            let attempt = seen.lock().unwrap().len();
            async move {
                if attempt < 3 {
                    Err(ProcedureError::Session(SessionError::ReplyTimeout))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(*seen.lock().unwrap(), RETRY_TIMEOUTS.to_vec());
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries("probe", &RETRY_TIMEOUTS, |_| {
            calls += 1;
            async { Err(ProcedureError::Session(SessionError::Disconnected)) }
        })
        .await;
        assert!(matches!(
            result,
            Err(ProcedureError::Session(SessionError::Disconnected))
        ));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_last_timeout() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries("probe", &RETRY_TIMEOUTS, |_| {
            calls += 1;
            async { Err(ProcedureError::Session(SessionError::ReplyTimeout)) }
        })
        .await;
        assert!(matches!(
            result,
            Err(ProcedureError::Session(SessionError::ReplyTimeout))
        ));
        assert_eq!(calls, 3);
    }
}
