use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::debug;

/// Ask the OS for an unused loopback port.
///
/// The listener is released before returning, so another process may take
/// the port before the supervised server binds it. That shows up later as a
/// failed start.
pub async fn find_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    debug!(port, "Allocated port");
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_bindable_port() {
        let port = find_free_port().await.unwrap();
        assert_ne!(port, 0);
        TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .unwrap();
    }
}
