use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};

fn local(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Check if a local port is accepting connections (tunnel is healthy).
pub async fn check_port(port: u16) -> bool {
    matches!(
        timeout(Duration::from_secs(2), TcpStream::connect(local(port))).await,
        Ok(Ok(_))
    )
}

/// Check if a local port is free (not already bound by another process).
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(local(port)).is_ok()
}

/// Probe local ports until all accept connections or `limit` elapses.
pub async fn wait_healthy_ports(ports: &[u16], limit: Duration) -> bool {
    let start = Instant::now();
    loop {
        let mut all_ok = true;
        for &p in ports {
            if !check_port(p).await {
                all_ok = false;
                break;
            }
        }
        if all_ok {
            return true;
        }
        if start.elapsed() >= limit {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listening_port_is_healthy_and_busy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(check_port(port).await);
        assert!(!is_port_free(port));
        assert!(wait_healthy_ports(&[port], Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn closed_port_is_unhealthy() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        assert!(is_port_free(port));
        assert!(!check_port(port).await);
        assert!(!wait_healthy_ports(&[port], Duration::ZERO).await);
    }
}
