/**
 * config.rs
 *
 * Agent configuration file (JSON)
 */

use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::Peer;
use crate::ice::IceUrl;
use crate::keys::Key;

pub const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:7777";

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7777))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base64 WireGuard private key
    pub private_key: String,
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub stun_turn_urls: Vec<IceUrl>,
    /// `ws://` or `wss://` URL of the signal server
    pub signal_addr: String,
    /// Accept self-signed signal server certificates
    #[serde(default)]
    pub signal_insecure_tls: bool,
    /// Address of the tunnel interface, e.g. `100.64.0.1/24`
    pub wg_addr: String,
    pub wg_iface: String,
    #[serde(default)]
    pub iface_black_list: Vec<String>,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
}

impl Config {
    /// Fresh configuration with a new private key
    pub fn generate() -> Self {
        Self {
            private_key: Key::generate().to_string(),
            peers: Vec::new(),
            stun_turn_urls: vec![IceUrl {
                scheme: crate::ice::Scheme::Stun,
                host: "stun.l.google.com".to_string(),
                port: 19302,
            }],
            signal_addr: "wss://signal.example.com:443/ws".to_string(),
            signal_insecure_tls: false,
            wg_addr: "100.64.0.1/24".to_string(),
            wg_iface: "wt0".to_string(),
            iface_black_list: vec!["wt0".to_string(), "docker0".to_string()],
            admin_addr: default_admin_addr(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Write as pretty JSON; the file is only readable by its owner
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_dir(dir)?;
        }

        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        let mut file = open_private(path)
            .with_context(|| format!("Failed to create config {}", path.display()))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn private_key(&self) -> Result<Key> {
        self.private_key
            .parse()
            .context("Invalid private_key in config")
    }
}

#[cfg(unix)]
fn create_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))
}

#[cfg(not(unix))]
fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create directory {}", dir.display()))
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies to newly created files
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}
