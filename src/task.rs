use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::Result;

#[derive(Debug)]
pub struct Cancelled;

/// Spawned future that can be cancelled from the outside. Dropping the
/// handle cancels the future.
pub struct Task<T> {
    handle: JoinHandle<std::result::Result<T, Cancelled>>,
    cancellation_token: CancellationToken,
}

impl<T> Task<T>
where
    T: Send + 'static,
{
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let cancellation_token = CancellationToken::new();
        let cancellation_token_clone = cancellation_token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                result = future => Ok(result),
                _ = cancellation_token_clone.cancelled() => Err(Cancelled)
            }
        });

        Self {
            handle,
            cancellation_token,
        }
    }

    /// Resolves to `None` if the task was cancelled before finishing.
    pub async fn join(mut self) -> Result<Option<T>> {
        let result = (&mut self.handle).await?;
        Ok(result.ok())
    }
}

impl<T> Task<T> {
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
