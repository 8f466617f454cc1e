//! tirc entry point: flag parsing, logging, and session wiring.

use anyhow::Result;
use clap::Parser;
use rand::distributions::Alphanumeric;
use rand::Rng;

use tirc::config::Config;
use tirc::e2e::E2eEngine;
use tirc::session::Session;
use tirc::term::ReadlineTerm;

#[derive(Parser)]
#[command(name = "tirc", about = "Tor-friendly IRC client with end-to-end encrypted DMs")]
struct Args {
    /// IRC server (host:port)
    #[arg(long, default_value = "irc.oftc.net:6697")]
    server: String,

    /// SOCKS5 proxy (host:port), or "tor" for the local Tor daemon with
    /// fresh per-connection isolation credentials
    #[arg(long, default_value = "tor")]
    proxy: String,

    /// Client certificate prefix for SASL EXTERNAL (expects <prefix>.crt
    /// and <prefix>.key)
    #[arg(long)]
    sasl: Option<String>,

    /// Nickname (random if omitted)
    #[arg(long)]
    nick: Option<String>,

    /// Use TLS
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    tls: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    badtls: bool,

    /// Hide join/part/quit/nick chatter
    #[arg(long)]
    quiet: bool,
}

/// Pseudo-random session nick: unique per run, no identifying structure.
fn generate_nick() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("t{suffix}")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tirc=error".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let (server, port) = match args.server.split_once(':') {
        Some((host, port)) => (host.to_string(), port.parse()?),
        None => (args.server.clone(), 6697),
    };

    let mut cfg = Config {
        server,
        port,
        tls: args.tls,
        sasl_cert: args.sasl,
        nick: args.nick.unwrap_or_else(generate_nick),
        show_chatter: !args.quiet,
        ..Config::default()
    };
    if args.badtls {
        cfg.tls = true;
        cfg.tls_insecure = true;
    }
    cfg.set_proxy(&args.proxy);

    let session = Session::new(cfg, Box::new(E2eEngine::new()));
    let term = ReadlineTerm::spawn("> ")?;

    // A connect failure surfaces here and sets the exit code; anything
    // after a successful connect ends the interactive session instead.
    if let Err(e) = session.run(term).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
    Ok(())
}
