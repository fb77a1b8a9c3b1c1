use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Run `task` until `token` is cancelled, restarting it after `backoff`
/// whenever it returns, fails or panics.
///
/// Each attempt runs in its own spawned task so a panic is contained.
/// Returns the number of restarts performed.
pub async fn supervise<F, Fut>(
    name: &'static str,
    backoff: Duration,
    token: CancellationToken,
    mut task: F,
) -> u64
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut restarts: u64 = 0;

    loop {
        let mut handle = tokio::spawn(task());

        let joined = tokio::select! {
            _ = token.cancelled() => {
                handle.abort();
                break;
            }
            joined = &mut handle => joined,
        };

        match joined {
            Ok(Ok(())) => tracing::warn!(task = name, "Supervised task exited, restarting"),
            Ok(Err(e)) => {
                tracing::error!(task = name, error = %e, "Supervised task failed, restarting")
            }
            Err(e) => {
                tracing::error!(task = name, error = %e, "Supervised task panicked, restarting")
            }
        }
        restarts += 1;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    tracing::info!(task = name, restarts, "Supervised task stopped");
    restarts
}
