//! Post-build reachability diagnostics.
//!
//! A freshly built device is only handed to the pool once it answers TCP
//! and can see enough of the job-queue fleet: at least two-thirds of the
//! configured queue servers must be reachable from the controller's
//! vantage point, otherwise the build is treated as failed.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Whether a `host:port` answers a TCP connect within the timeout.
pub async fn tcp_reachable(addr: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "tcp probe refused");
            false
        }
        Err(_) => {
            debug!(%addr, "tcp probe timed out");
            false
        }
    }
}

/// Whether at least two-thirds of the given addresses are reachable.
/// Vacuously true for an empty list.
pub async fn quorum_reachable(addrs: &[String], timeout: Duration) -> bool {
    if addrs.is_empty() {
        return true;
    }
    let mut reachable = 0usize;
    for addr in addrs {
        if tcp_reachable(addr, timeout).await {
            reachable += 1;
        }
    }
    reachable * 3 >= addrs.len() * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener_addr() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn live_listener_is_reachable() {
        let (_listener, addr) = listener_addr().await;
        assert!(tcp_reachable(&addr, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn dead_port_is_not_reachable() {
        assert!(!tcp_reachable("127.0.0.1:1", Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn two_of_three_is_quorum() {
        let (_a, addr_a) = listener_addr().await;
        let (_b, addr_b) = listener_addr().await;
        let addrs = vec![addr_a, addr_b, "127.0.0.1:1".to_string()];
        assert!(quorum_reachable(&addrs, Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn one_of_three_is_not_quorum() {
        let (_a, addr_a) = listener_addr().await;
        let addrs = vec![
            addr_a,
            "127.0.0.1:1".to_string(),
            "127.0.0.1:1".to_string(),
        ];
        assert!(!quorum_reachable(&addrs, Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn empty_fleet_is_vacuous_quorum() {
        assert!(quorum_reachable(&[], Duration::from_millis(200)).await);
    }
}
