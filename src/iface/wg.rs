/**
 * iface/wg.rs
 *
 * Kernel WireGuard interface driven through the `ip` and `wg` tools
 */

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::Iface;
use crate::error::IfaceError;
use crate::keys::{Key, PublicKey};

#[derive(Debug, Clone, Default)]
pub struct WgIface;

impl WgIface {
    pub fn new() -> Self {
        Self
    }
}

/// Run a command, feeding `stdin` if given; returns stdout
async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<String, IfaceError> {
    let command = format!("{} {}", program, args.join(" "));
    debug!("Running {}", command);

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| IfaceError::Spawn {
            command: command.clone(),
            source,
        })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|source| IfaceError::Spawn {
                command: command.clone(),
                source,
            })?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| IfaceError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(IfaceError::Command {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_listen_port(iface: &str, output: &str) -> Result<u16, IfaceError> {
    match output.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(IfaceError::ListenPort {
            iface: iface.to_string(),
            output: output.trim().to_string(),
        }),
    }
}

#[async_trait]
impl Iface for WgIface {
    async fn create(&self, name: &str, address: &str) -> Result<(), IfaceError> {
        if run("ip", &["link", "show", "dev", name], None).await.is_err() {
            info!("Creating interface {}", name);
            run("ip", &["link", "add", "dev", name, "type", "wireguard"], None).await?;
        }
        run("ip", &["address", "replace", address, "dev", name], None).await?;
        run("ip", &["link", "set", "up", "dev", name], None).await?;
        Ok(())
    }

    async fn configure(&self, name: &str, private_key: &Key) -> Result<(), IfaceError> {
        let key = private_key.to_string();
        run("wg", &["set", name, "private-key", "/dev/stdin"], Some(&key)).await?;
        Ok(())
    }

    async fn listen_port(&self, name: &str) -> Result<u16, IfaceError> {
        let output = run("wg", &["show", name, "listen-port"], None)
            .await
            .map_err(|e| match e {
                IfaceError::Command { .. } => IfaceError::NotFound(name.to_string()),
                other => other,
            })?;
        parse_listen_port(name, &output)
    }

    async fn update_peer(
        &self,
        name: &str,
        peer: &PublicKey,
        allowed_ips: &str,
        endpoint: SocketAddr,
        keepalive: Option<Duration>,
    ) -> Result<(), IfaceError> {
        let peer = peer.to_string();
        let endpoint = endpoint.to_string();
        let keepalive = keepalive
            .map(|k| k.as_secs().to_string())
            .unwrap_or_else(|| "off".to_string());
        run(
            "wg",
            &[
                "set",
                name,
                "peer",
                &peer,
                "allowed-ips",
                allowed_ips,
                "endpoint",
                &endpoint,
                "persistent-keepalive",
                &keepalive,
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn remove_peer(&self, name: &str, peer: &PublicKey) -> Result<(), IfaceError> {
        let peer = peer.to_string();
        run("wg", &["set", name, "peer", &peer, "remove"], None).await?;
        Ok(())
    }
}
