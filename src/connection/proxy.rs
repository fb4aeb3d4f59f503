/**
 * connection/proxy.rs
 *
 * Loopback UDP proxy between the local WireGuard socket and the selected path
 */

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::ice::SelectedPath;

const MAX_DATAGRAM: usize = 65535;

/// Bind the loopback endpoint WireGuard will use for the peer
pub async fn bind() -> std::io::Result<UdpSocket> {
    UdpSocket::bind("127.0.0.1:0").await
}

/// Relay datagrams until the path is torn down
///
/// Datagrams from WireGuard go out on the path; datagrams from the path are
/// delivered to `wg_listen_addr`.
pub async fn run(socket: UdpSocket, wg_listen_addr: SocketAddr, mut path: SelectedPath) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, from)) => {
                    if from != wg_listen_addr {
                        trace!("Proxy ignoring datagram from {}", from);
                        continue;
                    }
                    if path.outbound.send(buffer[..len].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!("Proxy receive error: {}", e),
            },
            inbound = path.inbound.recv() => match inbound {
                Some(datagram) => {
                    if let Err(e) = socket.send_to(&datagram, wg_listen_addr).await {
                        debug!("Failed to deliver datagram to WireGuard: {}", e);
                    }
                }
                None => break,
            },
        }
    }
    debug!("Proxy for {} stopped", path.remote);
}
