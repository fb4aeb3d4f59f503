/**
 * ice/stun.rs
 *
 * STUN client for server reflexive candidate discovery
 */

use anyhow::{anyhow, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// STUN message types
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;

/// STUN magic cookie
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const HEADER_LEN: usize = 20;

/// True if the datagram carries a STUN header
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == STUN_MAGIC_COOKIE
}

/// STUN client bound to one server
///
/// The query runs on a socket owned by the caller so that the discovered
/// mapping belongs to the socket later used for connectivity checks.
pub struct StunClient {
    server_addr: SocketAddr,
}

impl StunClient {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self { server_addr }
    }

    /// Query STUN server for the external address of `socket`
    ///
    /// Datagrams that are not the expected response are discarded.
    pub async fn query(&self, socket: &UdpSocket, timeout: Duration) -> Result<SocketAddr> {
        let transaction_id: [u8; 12] = rand::random();
        let request = build_binding_request(&transaction_id);

        socket
            .send_to(&request, self.server_addr)
            .await
            .context("Failed to send STUN request")?;

        let deadline = Instant::now() + timeout;
        let mut buffer = vec![0u8; 1024];
        loop {
            let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer))
                .await
                .map_err(|_| anyhow!("STUN query to {} timed out", self.server_addr))?
                .context("Failed to receive STUN response")?;

            if from != self.server_addr || !is_stun(&buffer[..len]) {
                continue;
            }
            return parse_binding_response(&buffer[..len], &transaction_id);
        }
    }
}

/// Build a STUN binding request
fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut request = Vec::with_capacity(HEADER_LEN);

    // Message type (16 bits)
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());

    // Message length (16 bits) - no attributes
    request.extend_from_slice(&0u16.to_be_bytes());

    // Magic cookie (32 bits)
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());

    // Transaction ID (96 bits)
    request.extend_from_slice(transaction_id);

    request
}

/// Parse STUN binding response
fn parse_binding_response(data: &[u8], expected_transaction_id: &[u8; 12]) -> Result<SocketAddr> {
    if data.len() < HEADER_LEN {
        return Err(anyhow!("STUN response too short"));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(anyhow!("Invalid STUN response type: 0x{:04x}", msg_type));
    }

    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != STUN_MAGIC_COOKIE {
        return Err(anyhow!("Invalid magic cookie"));
    }

    if &data[8..20] != expected_transaction_id {
        return Err(anyhow!("Transaction ID mismatch"));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < HEADER_LEN + msg_len {
        return Err(anyhow!("STUN response truncated"));
    }

    let mut mapped = None;
    let mut offset = HEADER_LEN;
    while offset + 4 <= HEADER_LEN + msg_len {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_len > data.len() {
            break;
        }

        let attr_data = &data[offset..offset + attr_len];

        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            return parse_address(attr_data, Some(expected_transaction_id));
        } else if attr_type == ATTR_MAPPED_ADDRESS && mapped.is_none() {
            mapped = Some(parse_address(attr_data, None));
        }

        // Attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;
    }

    mapped.unwrap_or_else(|| Err(anyhow!("No address attribute found in STUN response")))
}

/// Parse (XOR-)MAPPED-ADDRESS; `xor` carries the transaction id when the
/// attribute is obfuscated
fn parse_address(data: &[u8], xor: Option<&[u8; 12]>) -> Result<SocketAddr> {
    if data.len() < 8 {
        return Err(anyhow!("Address attribute too short"));
    }

    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if xor.is_some() {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            let mut addr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            if xor.is_some() {
                addr ^= STUN_MAGIC_COOKIE;
            }
            IpAddr::from(addr.to_be_bytes())
        }
        0x02 => {
            if data.len() < 20 {
                return Err(anyhow!("Invalid IPv6 address length"));
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);

            if let Some(transaction_id) = xor {
                let mut xor_key = [0u8; 16];
                xor_key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
                xor_key[4..16].copy_from_slice(transaction_id);
                for (byte, key) in addr_bytes.iter_mut().zip(xor_key) {
                    *byte ^= key;
                }
            }
            IpAddr::from(addr_bytes)
        }
        _ => {
            return Err(anyhow!("Unknown address family: {}", family));
        }
    };

    Ok(SocketAddr::new(ip, port))
}
