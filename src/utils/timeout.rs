use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Default upper bound for resolving and opening a transport
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for a cancelled receive loop to finish before the transport is dropped
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Run `fut` with a deadline, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
