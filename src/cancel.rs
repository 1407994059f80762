//! Cooperative cancellation threaded into every blocking operation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::DockvmError;

/// Races a future against cancellation and a deadline.
///
/// Returns `Err(DockvmError::cancelled)` if `token` fires first, or the
/// error built by `on_timeout` if the deadline elapses first.
pub async fn race<F, T>(
    token: &CancellationToken,
    deadline: Duration,
    what: &str,
    fut: F,
    on_timeout: impl FnOnce() -> DockvmError,
) -> Result<T, DockvmError>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(DockvmError::cancelled(what)),
        result = tokio::time::timeout(deadline, fut) => {
            result.map_err(|_| on_timeout())
        }
    }
}
