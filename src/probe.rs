//! TCP readiness probe for backends started outside the cache

use crate::address::BackendAddress;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Per-attempt connect timeout
const CONNECT_TIMEOUT_MS: u64 = 1000;

/// Poll `address` until it accepts a TCP connection or `timeout` elapses.
///
/// Returns `true` once a connect succeeds. Always makes at least one attempt.
pub async fn wait_until_accepting(address: &BackendAddress, timeout: Duration, interval: Duration) -> bool {
    let authority = address.authority();
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let connect = tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS).min(timeout.max(interval)),
            TcpStream::connect(authority.as_str()),
        )
        .await;

        match connect {
            Ok(Ok(_)) => {
                debug!(%address, attempts, elapsed_ms = start.elapsed().as_millis() as u64, "Backend accepting connections");
                return true;
            }
            Ok(Err(e)) => {
                debug!(%address, attempts, error = %e, "Readiness probe failed");
            }
            Err(_) => {
                debug!(%address, attempts, "Readiness probe connect timed out");
            }
        }

        if start.elapsed() + interval > timeout {
            debug!(%address, attempts, "Backend not ready before timeout");
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
