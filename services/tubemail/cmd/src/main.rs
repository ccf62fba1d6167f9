//! Tubemail chat peer.
//!
//! Joins a hood and turns it into a line based chat: every line read from
//! stdin is broadcast to all neighbours, `@name text` goes to the neighbour
//! whose certificate carries the common name `name`.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tubemail_hood::{start, Hood, HoodEvent, Neigh, PortCandidates};

mod config;
mod logging;

use config::{parse_peer, PeerConfig};
use logging::PeerLogFormatter;

/// Chat over a tubemail hood
#[derive(Parser, Debug)]
#[command(name = "tubemail-peer", version, about = "Chat over a self-organizing TLS mesh")]
struct Args {
    /// Configuration file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peer name, selects hood.<name>.key, hood.<name>.crt and hood.crt
    #[arg(long)]
    name: Option<String>,

    /// Private key (PEM)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Certificate (PEM)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// CA certificate (PEM)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Port to listen on, the 4816-4819 range when absent
    #[arg(long)]
    port: Option<String>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<IpAddr>,

    /// Peer to announce, e.g. 10.0.0.2:4816 (repeatable)
    #[arg(long)]
    peer: Vec<String>,

    /// Re-announce --peer entries at this interval
    #[arg(long)]
    peer_interval: Option<humantime::Duration>,

    /// Redial lost neighbours at this interval
    #[arg(long)]
    reconnect_interval: Option<humantime::Duration>,

    /// Give up redialling lost neighbours after this long
    #[arg(long)]
    reconnect_timeout: Option<humantime::Duration>,

    /// Time allowed for each handshake stage
    #[arg(long)]
    handshake_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// What a line typed by the user asks for
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Direct { name: &'a str, text: &'a str },
    Broadcast(&'a str),
    Nothing,
}

fn parse_line(line: &str) -> Command<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Command::Nothing;
    }
    if let Some(rest) = line.strip_prefix('@') {
        if let Some((name, text)) = rest.split_once(char::is_whitespace) {
            if !name.is_empty() {
                return Command::Direct {
                    name,
                    text: text.trim_start(),
                };
            }
        }
    }
    Command::Broadcast(line)
}

fn display_name(neigh: &Neigh) -> String {
    neigh
        .info()
        .common_name
        .clone()
        .unwrap_or_else(|| neigh.id().short())
}

fn timestamp() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}

/// Flags win over environment variables and the configuration file
fn apply_args(config: &mut PeerConfig, args: &Args) -> anyhow::Result<()> {
    if let Some(key) = &args.key {
        config.tls.key_file = Some(key.clone());
    }
    if let Some(cert) = &args.cert {
        config.tls.cert_file = Some(cert.clone());
    }
    if let Some(ca) = &args.ca {
        config.tls.ca_file = Some(ca.clone());
    }
    if let Some(name) = &args.name {
        config.default_files(name);
    }
    if let Some(port) = &args.port {
        config.port = Some(PortCandidates::parse(port));
    }
    if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }
    for peer in &args.peer {
        let mut entry = parse_peer(peer)?;
        entry.interval = args.peer_interval.map(Into::into);
        config.peers.push(entry);
    }
    if let Some(interval) = args.reconnect_interval {
        config.reconnect.interval = Some(interval.into());
    }
    if let Some(timeout) = args.reconnect_timeout {
        config.reconnect.timeout = Some(timeout.into());
    }
    if let Some(timeout) = args.handshake_timeout {
        config.handshake_timeout = Some(timeout.into());
    }
    Ok(())
}

async fn handle_line(hood: &Hood, line: &str) {
    match parse_line(line) {
        Command::Nothing => {}
        Command::Direct { name, text } => {
            let target = hood
                .neighbours()
                .into_iter()
                .find(|neigh| neigh.info().common_name.as_deref() == Some(name));
            match target {
                Some(neigh) => {
                    if let Err(e) = neigh.send(Bytes::copy_from_slice(text.as_bytes())).await {
                        warn!("Failed to send to {}: {}", name, e);
                    }
                }
                None => println!("{} not found!", name),
            }
        }
        Command::Broadcast(text) => {
            match hood.send(Bytes::copy_from_slice(text.as_bytes())).await {
                Ok(sent) => debug!("Message delivered to {} neighbours", sent.len()),
                Err(e) => warn!("Broadcast failed: {}", e),
            }
        }
    }
}

fn handle_event(event: HoodEvent) {
    match event {
        HoodEvent::FoundNeigh(neigh) => {
            println!("[{}] {} joins the chat", timestamp(), display_name(&neigh))
        }
        HoodEvent::LostNeigh(neigh) => {
            println!("[{}] {} leaves the chat", timestamp(), display_name(&neigh))
        }
        HoodEvent::Message { neigh, payload } => println!(
            "[{}] <{}> {}",
            timestamp(),
            display_name(&neigh),
            String::from_utf8_lossy(&payload)
        ),
        HoodEvent::ParserError { neigh, error } => {
            warn!("Garbage from {}: {}", display_name(&neigh), error)
        }
        HoodEvent::Error(e) => warn!("Hood error: {}", e),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = &args.log_level;
    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("tubemail_peer={}", level).parse()?)
        .add_directive(format!("tubemail_hood={}", level).parse()?)
        .add_directive(format!("tubemail_session={}", level).parse()?)
        .add_directive(format!("tubemail_wire={}", level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(PeerLogFormatter::new("tubemail-peer"))
        .init();

    info!("Starting tubemail peer v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => PeerConfig::load_from_file(path)?,
        None => PeerConfig::default(),
    };
    config.apply_environment_overrides()?;
    apply_args(&mut config, &args)?;

    let (hood, mut events) = start(config.into_hood_config()?)
        .await
        .context("failed to join the hood")?;
    info!(
        "Joined hood {} as {} ({}) on port {}",
        &hood.fingerprint()[..16.min(hood.fingerprint().len())],
        hood.info(),
        hood.id().short(),
        hood.port()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&hood, &line).await,
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            },
            event = events.recv() => match event {
                Some(event) => handle_event(event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    hood.leave().await;
    while let Some(event) = events.recv().await {
        handle_event(event);
    }
    info!("Left the hood");
    Ok(())
}
