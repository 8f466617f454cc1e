//! Session configuration: transport target, proxy, TLS flags, identity.

use crate::tor;

/// SOCKS5 username/password pair.
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Connection configuration for one session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host name (no port).
    pub server: String,
    pub port: u16,
    /// SOCKS5 proxy address (host:port).
    pub proxy: String,
    pub proxy_auth: Option<ProxyAuth>,
    pub tls: bool,
    pub tls_insecure: bool,
    /// Client certificate prefix for SASL EXTERNAL (`<prefix>.crt` /
    /// `<prefix>.key`).
    pub sasl_cert: Option<String>,
    /// Display nickname.
    pub nick: String,
    /// Show join/part/quit/nick background chatter.
    pub show_chatter: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "irc.oftc.net".to_string(),
            port: 6697,
            proxy: "127.0.0.1:9050".to_string(),
            proxy_auth: None,
            tls: true,
            tls_insecure: false,
            sasl_cert: None,
            nick: "tirc".to_string(),
            show_chatter: true,
        }
    }
}

impl Config {
    /// Apply a proxy spec: the literal `tor` selects the local Tor daemon
    /// with fresh per-connection isolation credentials, anything else is a
    /// plain SOCKS5 address.
    pub fn set_proxy(&mut self, spec: &str) {
        if spec == "tor" {
            self.proxy = tor::proxy_addr();
            self.proxy_auth = Some(tor::isolation_auth());
        } else {
            self.proxy = spec.to_string();
            self.proxy_auth = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tor_spec_sets_isolation_credentials() {
        let mut cfg = Config::default();
        cfg.set_proxy("tor");
        assert!(cfg.proxy_auth.is_some());

        cfg.set_proxy("10.0.0.1:1080");
        assert_eq!(cfg.proxy, "10.0.0.1:1080");
        assert!(cfg.proxy_auth.is_none());
    }
}
