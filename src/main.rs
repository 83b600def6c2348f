//! nfmangle - SNI-aware packet mangler
//!
//! Offline tooling around the engine: generate and check configurations,
//! locate hostnames in captured bytes, and dry-run the engine on a packet.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use nfmangle::{
    locate_sni, Engine, EvasionConfig, Packet, QuicSniLocator, ReassemblyCache, RecordingSink,
    UdpPacket,
};

#[derive(Parser)]
#[command(name = "nfmangle")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_DATE"), ")"))]
#[command(about = "SNI-aware TLS/QUIC packet mangler", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "NFMANGLE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the default configuration as TOML
    DefaultConfig {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file
    CheckConfig,

    /// Find the SNI in hex-encoded bytes
    Locate {
        /// TLS record, IP packet, or QUIC datagram as hex
        #[arg(long)]
        hex: String,

        /// Treat the bytes as a QUIC Initial (UDP payload)
        #[arg(long)]
        quic: bool,
    },

    /// Run the engine on one hex-encoded IP packet
    Simulate {
        /// Raw IPv4/IPv6 packet as hex
        #[arg(long)]
        hex: String,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    match cli.command {
        Commands::DefaultConfig { output } => {
            let text = EvasionConfig::default()
                .to_toml()
                .context("Failed to encode default configuration")?;
            match output {
                Some(path) => {
                    std::fs::write(&path, text)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Default configuration written to {}", path.display());
                }
                None => print!("{}", text),
            }
        }

        Commands::CheckConfig => {
            let Some(path) = cli.config.as_ref() else {
                bail!("check-config needs --config FILE");
            };
            let config = load_config(Some(path))?;
            print_summary(&config);
            println!("Configuration OK");
        }

        Commands::Locate { hex, quic } => {
            let bytes = decode_hex(&hex)?;
            if quic {
                locate_quic(&load_config(cli.config.as_ref())?, &bytes).await?;
            } else {
                locate_tls(&bytes)?;
            }
        }

        Commands::Simulate { hex, json } => {
            let config = load_config(cli.config.as_ref())?;
            let raw = decode_hex(&hex)?;
            simulate(config, &raw, json)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<EvasionConfig> {
    let config = match path {
        Some(path) => EvasionConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EvasionConfig::default(),
    };
    config.validate().context("Configuration is invalid")?;
    Ok(config)
}

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && *c != ':')
        .collect();
    hex::decode(cleaned).context("Input is not valid hex")
}

fn print_summary(config: &EvasionConfig) {
    println!("TLS:            {} (port {})", on_off(config.tls.enabled), config.tls.port);
    if config.tls.domains.is_empty() {
        println!("Domains:        all");
    } else {
        println!("Domains:        {}", config.tls.domains.join(", "));
    }
    if config.faking.enabled {
        println!(
            "Decoys:         {} x {:?} via {:?} (ttl {}, seq {:?})",
            config.faking.count,
            config.faking.payload,
            config.faking.strategy,
            config.faking.ttl,
            config.faking.seq_offset
        );
    } else {
        println!("Decoys:         off");
    }
    println!(
        "Fragmentation:  {:?} (midpoint {}, position {}, reverse {})",
        config.fragmentation.strategy,
        on_off(config.fragmentation.sni_midpoint),
        config.fragmentation.position,
        on_off(config.fragmentation.reverse)
    );
    println!(
        "Segment delay:  {}",
        humantime::format_duration(config.inter_segment_delay)
    );
    if config.tcp_window_override != 0 {
        println!("TCP window:     {}", config.tcp_window_override);
    }
    println!(
        "QUIC cache:     {} entries, ttl {}, sweep every {}",
        config.quic.max_entries,
        humantime::format_duration(config.quic.ttl),
        humantime::format_duration(config.quic.sweep_interval)
    );
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

fn locate_tls(bytes: &[u8]) -> Result<()> {
    // accept either a bare TLS record or a whole IP packet
    let (span, data) = match locate_sni(bytes) {
        Some(span) => (span, bytes),
        None => {
            let packet = Packet::from_slice(bytes).context("No ClientHello SNI found")?;
            let offset = packet.payload_offset();
            let span = locate_sni(packet.payload()).context("No ClientHello SNI found")?;
            (span.shifted(offset), bytes)
        }
    };
    let hostname = span.hostname(data).unwrap_or("<non-utf8>");
    println!("{} at offset {} (length {})", hostname, span.offset, span.len);
    Ok(())
}

async fn locate_quic(config: &EvasionConfig, datagram: &[u8]) -> Result<()> {
    let cache = Arc::new(ReassemblyCache::new(config.quic));
    cache.start()?;
    let locator = QuicSniLocator::new(Arc::clone(&cache));

    if let Some((offset, pn_len)) = locator.payload_offset(datagram) {
        let how = if pn_len.is_recovered() {
            "recovered"
        } else {
            "assumed"
        };
        println!(
            "Protected payload at offset {} (packet number length {} {})",
            offset,
            pn_len.len(),
            how
        );
    }

    let result = locator.locate(datagram);
    cache.stop().await;

    match result {
        Some(sni) => {
            match sni.packet_span {
                Some(span) => println!(
                    "{} at datagram offset {} (length {}), dcid {}",
                    sni.hostname,
                    span.offset,
                    span.len,
                    hex::encode(&sni.dcid)
                ),
                None => println!("{} (reassembled), dcid {}", sni.hostname, hex::encode(&sni.dcid)),
            }
            Ok(())
        }
        None => bail!("No SNI found in QUIC datagram"),
    }
}

fn simulate(config: EvasionConfig, raw: &[u8], json: bool) -> Result<()> {
    // one packet, so the cache needs no sweeper
    let cache = Arc::new(ReassemblyCache::new(config.quic));
    let engine = Engine::new(config).with_quic(QuicSniLocator::new(cache));
    let sink = RecordingSink::new();
    let (verdict, error) = engine.handle(raw, &sink);
    let packets = sink.take();

    if json {
        let out = serde_json::json!({
            "verdict": verdict,
            "error": error.as_ref().map(|e| e.to_string()),
            "packets": packets.iter().map(hex::encode).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Verdict: {}", verdict);
    if let Some(e) = error {
        println!("Error:   {}", e);
    }
    for (i, packet) in packets.iter().enumerate() {
        let detail = match (Packet::from_slice(packet), UdpPacket::from_slice(packet)) {
            (Some(p), _) => format!(
                "seq {} ttl {} payload {} bytes",
                p.seq(),
                p.ttl(),
                p.payload().len()
            ),
            (None, Some(d)) => format!("udp ttl {} payload {} bytes", d.ttl(), d.payload().len()),
            (None, None) => "ip fragment".to_string(),
        };
        println!("#{:<2} {:>5} bytes  {}  {}", i, packet.len(), detail, hex::encode(packet));
    }
    Ok(())
}
