//! Tor bootstrap helpers: local SOCKS daemon discovery and per-connection
//! stream-isolation credentials.
//!
//! Tor isolates circuits by SOCKS username/password, so handing it a fresh
//! random pair per connection keeps sessions on independent circuits.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::ProxyAuth;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "9050";

/// Address of the local Tor SOCKS daemon, honoring the `TOR_SOCKS_HOST`
/// and `TOR_SOCKS_PORT` environment overrides.
pub fn proxy_addr() -> String {
    let host = std::env::var("TOR_SOCKS_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let port = std::env::var("TOR_SOCKS_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());
    format!("{host}:{port}")
}

/// Fresh stream-isolation credentials: unique per session, not
/// attacker-predictable. Derived by hashing a random seed so the pair is
/// internally consistent but carries no identifying structure.
pub fn isolation_auth() -> ProxyAuth {
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    let user = Sha256::digest(seed);
    let pass = Sha256::digest(user);
    ProxyAuth {
        username: hex::encode(user),
        password: hex::encode(pass),
    }
}
