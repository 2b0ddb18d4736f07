//! hammesh command-line interface
//!
//! This CLI provides tools for:
//! - Encoding and decoding mesh frames (L3 text and L2 radio bytes)
//! - Checking callsigns
//! - Editing the node settings file
//! - Running multi-node mesh simulations on a virtual clock

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hammesh_core::config::{keys, ConfigStore, MemoryStore, NodeSettings};
use hammesh_core::mesh::crypto::{hmac_tag, CipherKey, HMAC_HEX_LEN};
use hammesh_core::mesh::fec::{FecProfile, CORRECTABLE, PARITY_LEN};
use hammesh_core::mesh::packet::MAX_L3_LEN;
use hammesh_core::mesh::simulation::{MeshSimulator, SimConfig, Topology};
use hammesh_core::mesh::{Callsign, Packet, Params};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "hammesh")]
#[command(author, version, about = "LoRa ham mesh toolkit", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Node settings file (JSON)
    #[arg(short, long, global = true, default_value = "node.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a frame from its parts
    Encode {
        /// Destination callsign
        #[arg(short, long)]
        to: String,

        /// Source callsign (defaults to the configured callsign)
        #[arg(short, long)]
        from: Option<String>,

        /// Packet ident
        #[arg(short, long, default_value = "1")]
        ident: u32,

        /// Extra parameters, e.g. "C,PING"
        #[arg(short, long, default_value = "")]
        params: String,

        /// Sign with the configured HMAC key
        #[arg(long)]
        sign: bool,

        /// Message
        message: String,
    },

    /// Parse a radio frame given as hex
    Decode {
        /// Frame bytes in hex (L2), or L3 text with --l3
        frame: String,

        /// Treat the input as L3 text
        #[arg(long)]
        l3: bool,

        /// RSSI to attach to the packet
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        rssi: i32,
    },

    /// Validate callsigns
    Callsign {
        #[arg(required = true)]
        callsigns: Vec<String>,
    },

    /// Show or change node settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run a mesh simulation
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Link layout
        #[arg(long, value_enum, default_value = "chain")]
        topology: TopologyArg,

        /// Virtual seconds to run
        #[arg(short, long, default_value = "60")]
        duration: u64,

        /// Every node relays
        #[arg(long)]
        repeaters: bool,

        /// Enable periodic beacons
        #[arg(long)]
        beacons: bool,

        /// Message sent by the first node
        #[arg(short, long)]
        message: Option<String>,

        /// Destination node index (broadcast when omitted)
        #[arg(long)]
        to: Option<usize>,

        /// Parameters of the message, e.g. "PING" or "RREQ"
        #[arg(short, long, default_value = "")]
        params: String,

        /// HMAC key shared by all nodes
        #[arg(long)]
        psk: Option<String>,

        /// Encryption key shared by all nodes
        #[arg(long)]
        cpsk: Option<String>,

        /// RSSI of every link (dBm)
        #[arg(long, default_value = "-80", allow_hyphen_values = true)]
        rssi: i32,

        /// Random seed (random when omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Run in real time until Ctrl+C
        #[arg(long)]
        live: bool,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show protocol constants and node settings
    Info,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print all settings
    Show,
    /// Print one setting
    Get { key: String },
    /// Change one setting
    Set { key: String, value: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum TopologyArg {
    Chain,
    Mesh,
}

fn load_store(path: &Path) -> Result<MemoryStore> {
    if !path.exists() {
        info!("{} not found, using defaults", path.display());
        return Ok(MemoryStore::new());
    }
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    MemoryStore::from_json(&json).with_context(|| format!("Invalid settings file {}", path.display()))
}

fn save_store(path: &Path, store: &MemoryStore) -> Result<()> {
    let json = store.to_json().context("Failed to serialize settings")?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

fn parse_callsign(s: &str) -> Result<Callsign> {
    let callsign = Callsign::new(s);
    if !callsign.is_valid() {
        anyhow::bail!("Invalid callsign: {}", s);
    }
    Ok(callsign)
}

fn parse_params(s: &str) -> Result<Params> {
    let params = Params::parse(s);
    if !params.is_valid_without_ident() {
        anyhow::bail!("Invalid parameters: {}", s);
    }
    Ok(params)
}

fn print_packet(packet: &Packet) {
    println!("To:        {}", packet.to());
    println!("From:      {}", packet.from());
    println!("Ident:     {}", packet.ident());
    println!("Params:    {}", packet.params());
    println!("Message:   {}", packet.msg_str());
    println!("Encrypted: {}", packet.was_encrypted());
}

fn cmd_encode(
    store: &MemoryStore,
    to: String,
    from: Option<String>,
    ident: u32,
    params: String,
    sign: bool,
    message: String,
) -> Result<()> {
    let to = parse_callsign(&to)?;
    let from = match from {
        Some(from) => parse_callsign(&from)?,
        None => store.callsign(),
    };
    if ident == 0 {
        anyhow::bail!("Ident must be non-zero");
    }

    let mut params = parse_params(&params)?;
    params.set_ident(ident);

    if sign {
        let psk = store
            .hmac_psk()
            .context("No HMAC key configured (setting \"psk\")")?;
        let tag = hmac_tag(psk.as_bytes(), &to, &from, ident, message.as_bytes())?;
        params.put("H", tag);
    }

    let packet = Packet::new(to, from, params, message);
    let key = store.crypto_psk().map(|psk| CipherKey::from_psk(psk.as_bytes()));
    let l3 = packet.encode_l3()?;
    let l2 = packet.encode_l2(key.as_ref())?;

    println!("L3 ({} bytes): {}", l3.len(), String::from_utf8_lossy(&l3));
    println!(
        "L2 ({} bytes{}): {}",
        l2.len(),
        if key.is_some() { ", encrypted" } else { "" },
        hex::encode(&l2)
    );
    Ok(())
}

fn cmd_decode(store: &MemoryStore, frame: String, l3: bool, rssi: i32) -> Result<()> {
    let result = if l3 {
        Packet::decode_l3(frame.as_bytes(), rssi)
    } else {
        let bytes = hex::decode(frame.trim()).context("Invalid hex frame")?;
        let key = store.crypto_psk().map(|psk| CipherKey::from_psk(psk.as_bytes()));
        Packet::decode_l2(&bytes, rssi, key.as_ref())
    };

    match result {
        Ok(packet) => {
            print_packet(&packet);
            Ok(())
        }
        Err(e) => anyhow::bail!("Decode failed (code {}): {}", e.code(), e),
    }
}

fn cmd_callsign(callsigns: Vec<String>) -> Result<()> {
    for s in callsigns {
        let callsign = Callsign::new(&s);
        if !callsign.is_valid() {
            println!("{:<12} invalid", s);
        } else if callsign.is_q() {
            println!("{:<12} reserved ({})", s, callsign);
        } else {
            println!("{:<12} valid ({}, prefix {})", s, callsign, callsign.prefix());
        }
    }
    Ok(())
}

fn cmd_config(path: &Path, mut store: MemoryStore, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            for (key, value) in store.iter() {
                let shown = if key == keys::HMAC_PSK || key == keys::CRYPTO_PSK || key == keys::WIFI_PASSWORD {
                    "********"
                } else {
                    value
                };
                println!("{:<10} {}", key, shown);
            }
            println!();
            println!("Effective callsign: {}", store.callsign());
            match store.beacon_interval() {
                Some(interval) => println!("Beacon interval:    {} s", interval.as_secs()),
                None => println!("Beacon interval:    off"),
            }
        }
        ConfigAction::Get { key } => match store.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Setting {} not found", key),
        },
        ConfigAction::Set { key, value } => {
            if key == keys::CALLSIGN {
                let callsign = parse_callsign(&value)?;
                if callsign.is_q() {
                    anyhow::bail!("Reserved callsign: {}", value);
                }
                store.set_callsign(&callsign);
            } else {
                store.set(&key, &value);
            }
            save_store(path, &store)?;
            println!("{} = {}", key, value);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_simulate(
    nodes: usize,
    topology: TopologyArg,
    duration: u64,
    repeaters: bool,
    beacons: bool,
    message: Option<String>,
    to: Option<usize>,
    params: String,
    psk: Option<String>,
    cpsk: Option<String>,
    rssi: i32,
    seed: Option<u64>,
    live: bool,
    json: bool,
) -> Result<()> {
    if nodes < 2 {
        anyhow::bail!("At least 2 nodes are needed");
    }
    if matches!(to, Some(to) if to >= nodes) {
        anyhow::bail!("Destination index out of range (0..{})", nodes);
    }

    let seed = seed.unwrap_or_else(rand::random);
    let mut config = SimConfig::default()
        .with_node_count(nodes)
        .with_topology(match topology {
            TopologyArg::Chain => Topology::Chain,
            TopologyArg::Mesh => Topology::FullMesh,
        })
        .with_repeaters(repeaters)
        .with_beacons(beacons)
        .with_rssi(rssi)
        .with_seed(seed);
    if let Some(psk) = &psk {
        config = config.with_hmac_psk(psk);
    }
    if let Some(cpsk) = &cpsk {
        config = config.with_crypto_psk(cpsk);
    }

    let mut sim = MeshSimulator::new(config);
    info!("simulation seed {}", seed);

    if let Some(message) = message {
        let dest = match to {
            Some(i) => sim.callsign(i).clone(),
            None => Callsign::broadcast(),
        };
        let id = sim
            .send(0, dest.clone(), parse_params(&params)?, message)
            .context("Send failed")?;
        println!("{} sent #{} to {}", sim.callsign(0), id, dest);
    }

    if live {
        run_live(&mut sim)?;
    } else {
        sim.run(duration * 1000);
    }

    for i in 0..sim.node_count() {
        for packet in sim.deliveries(i) {
            println!("[{}] {} (RSSI {})", sim.callsign(i), packet, packet.rssi());
        }
    }

    let stats = sim.stats();
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!();
    println!("=== Mesh Simulation Summary ===");
    println!("Elapsed:     {} s", stats.elapsed_ms / 1000);
    println!("On air:      {} frames", stats.frames_transmitted);
    println!("Receptions:  {}", stats.frames_received);
    println!("Deliveries:  {}", stats.deliveries);
    println!();
    for node in &stats.per_node {
        println!(
            "  {:<8} TX={} RX={} fwd={} dup={} neighbors={} delivered={}",
            node.callsign,
            node.mesh.tx_frames,
            node.mesh.rx_frames,
            node.mesh.packets_forwarded,
            node.mesh.duplicates_dropped,
            node.neighbors,
            node.deliveries
        );
    }
    Ok(())
}

/// Step the simulation against the wall clock until Ctrl+C
fn run_live(sim: &mut MeshSimulator) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    println!("Running, press Ctrl+C to stop");
    let start = Instant::now();
    let mut seen = vec![0usize; sim.node_count()];
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(10));
        let elapsed = start.elapsed().as_millis() as u64;
        if elapsed > sim.now() {
            sim.step(elapsed - sim.now());
        }

        for (i, count) in seen.iter_mut().enumerate() {
            let got = sim.deliveries(i);
            for packet in &got[*count..] {
                println!("{:>8} ms [{}] {}", sim.now(), sim.callsign(i), packet);
            }
            *count = got.len();
        }
    }
    warn!("interrupted after {} ms", sim.now());
    Ok(())
}

fn cmd_info(store: &MemoryStore) -> Result<()> {
    println!("=== hammesh ===");
    println!();
    println!("Max L3 frame:     {} bytes", MAX_L3_LEN);
    println!("FEC parity:       {} bytes, corrects {} bytes", PARITY_LEN, CORRECTABLE);
    for profile in FecProfile::ALL {
        println!(
            "  {:<8} data {:>3} bytes, frame up to {:>3} bytes",
            format!("{:?}", profile),
            profile.data_len(),
            profile.max_frame_len()
        );
    }
    println!("HMAC tag:         {} hex chars", HMAC_HEX_LEN);
    println!();
    println!("Node:");
    println!("  Callsign:       {}", store.callsign());
    println!("  Repeater:       {}", if store.repeater() { "on" } else { "off" });
    println!("  Last packet id: {}", store.last_packet_id());
    println!(
        "  HMAC:           {}",
        if store.hmac_psk().is_some() { "configured" } else { "off" }
    );
    println!(
        "  Encryption:     {}",
        if store.crypto_psk().is_some() { "configured" } else { "off" }
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let store = load_store(&cli.config)?;

    match cli.command {
        Commands::Encode {
            to,
            from,
            ident,
            params,
            sign,
            message,
        } => cmd_encode(&store, to, from, ident, params, sign, message),

        Commands::Decode { frame, l3, rssi } => cmd_decode(&store, frame, l3, rssi),

        Commands::Callsign { callsigns } => cmd_callsign(callsigns),

        Commands::Config { action } => cmd_config(&cli.config, store, action),

        Commands::Simulate {
            nodes,
            topology,
            duration,
            repeaters,
            beacons,
            message,
            to,
            params,
            psk,
            cpsk,
            rssi,
            seed,
            live,
            json,
        } => cmd_simulate(
            nodes, topology, duration, repeaters, beacons, message, to, params, psk, cpsk, rssi,
            seed, live, json,
        ),

        Commands::Info => cmd_info(&store),
    }
}
