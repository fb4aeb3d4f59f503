#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod admin;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod ice;
pub mod iface;
pub mod keys;
pub mod signal;

pub use config::Config;
pub use connection::{Connection, Status};
pub use engine::{Engine, EngineConfig, Peer};
pub use keys::{Key, PublicKey};
