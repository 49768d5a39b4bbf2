// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use anyhow::{anyhow, bail, Result};
use chrono::Local;
use clap::{Args as ClapArgs, CommandFactory, FromArgMatches, Parser, Subcommand};
use directories_next::ProjectDirs;
use env_logger::fmt::Formatter;
use env_logger::Builder;
use log::*;
use sha2::{Digest, Sha256};
use std::{
    env,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use cubecomm_link::{
    decode, loopback_pair, rmpv::Value, LinkConfigBuilder, Loss, Message, Transport,
    DEFAULT_PACKET_SIZE, HEADER_SIZE,
};
use cubecomm_transfer::{
    artifact_key, image_filename, image_key, FsStore, FtpConfigBuilder, GroundStation,
    HandshakeConfigBuilder, PersistentState, ResponsePlan, Satellite, SimSpacecraft, Store,
    TransferJob, BIN_OVERHEAD, IMAGE_COUNT_KEY,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        alias = "data-dir",
        help = "The data directory",
        default_value_t = default_data_dir() // Use a function for default value
    )]
    data_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run contact windows between a ground station and a simulated
    /// satellite over a lossy in-process link
    Simulate(SimulateArgs),

    /// Decode a hex encoded frame and show its message
    Decode {
        #[arg(help = "The frame bytes in hex")]
        frame: String,
    },

    /// Show the ground station's saved contact state
    Status,
}

#[derive(ClapArgs, Debug)]
struct SimulateArgs {
    #[arg(short = 'n', long, default_value_t = 3, help = "Number of contact windows")]
    contacts: u32,

    #[arg(long, default_value_t = 0.1, help = "Downlink packet loss probability")]
    loss: f64,

    #[arg(long, default_value_t = 0.0, help = "Uplink packet loss probability")]
    uplink_loss: f64,

    #[arg(long, default_value_t = 1, help = "Seed for the channel and the camera")]
    seed: u64,

    #[arg(long, default_value_t = 4096, help = "Size of each captured image in bytes")]
    image_size: usize,

    #[arg(long, default_value_t = DEFAULT_PACKET_SIZE, help = "Radio packet size in bytes")]
    packet_size: usize,

    #[arg(long, help = "Chunk size in bytes, defaults to the largest that fits a packet")]
    chunk_size: Option<usize>,

    #[arg(long, default_value_t = cubecomm_transfer::DEFAULT_REQUEST_SIZE,
          help = "Chunk indices per re-request")]
    request_size: usize,

    #[arg(long, default_value_t = 2.0,
          help = "Receive timeout in seconds; handshake and serving waits are three times this")]
    timeout: f64,

    #[arg(long, default_value_t = 0, help = "Delay between data packets in milliseconds")]
    packet_delay_ms: u64,

    #[arg(long, help = "Re-request batches per image before giving up, unbounded if absent")]
    retry_limit: Option<u32>,

    #[arg(long, default_value_t = 5, help = "Silent ping windows before the ground gives up")]
    ping_attempts: u32,

    #[arg(long = "defer", help = "Leave received images unassembled until the end of the contact")]
    defer_assembly: bool,

    #[arg(long = "delete", help = "Ask the satellite to delete images once received")]
    send_delete: bool,

    #[arg(long = "no-picture", help = "Don't ask the satellite to take a picture")]
    no_picture: bool,

    #[arg(long = "set", value_parser = parse_setting,
          help = "Camera setting to send in the handshake, e.g. --set quality=12")]
    settings: Vec<(String, Value)>,

    #[arg(long, help = "Discard saved ground and satellite data before starting")]
    fresh: bool,
}

fn parse_setting(arg: &str) -> Result<(String, Value), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", arg))?;
    let value = match value.parse::<i64>() {
        Ok(num) => Value::from(num),
        Err(_) => Value::from(value),
    };
    Ok((key.to_string(), value))
}

fn default_data_dir() -> String {
    ProjectDirs::from("com", "bonsai", "cubecomm")
        .map(|dirs| dirs.data_dir().to_string_lossy().to_string())
        .unwrap_or_else(|| "~/.cubecomm".to_string())
}

fn build_args_with_help() -> Result<Args> {
    let default_dir = default_data_dir();
    let default_dir_static: &'static str = Box::leak(default_dir.into_boxed_str());
    let mut cmd = Args::command();
    cmd = cmd.mut_arg("data_dir", |arg| {
        arg.help(format!(
            "The data directory, defaults to {}",
            default_dir_static
        ))
        .default_value(default_dir_static) // Set the default value dynamically
    });
    Ok(Args::from_arg_matches(&cmd.get_matches())?)
}

fn init_logger() {
    let mut builder = Builder::new();
    if let Ok(rust_log) = env::var("RUST_LOG") {
        builder.parse_filters(&rust_log);
    } else {
        builder.filter(None, log::LevelFilter::Debug); // Default to Debug
    }
    builder
        .format(|buf: &mut Formatter, record: &Record| {
            let now = Local::now();
            writeln!(
                buf,
                "{} {:<5} {}: {}",
                now.format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

fn ground_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("ground")
}

fn satellite_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("satellite")
}

/// Ground side store key of an assembled image.
fn image_artifact_key(image_id: u32) -> String {
    artifact_key(image_id, &image_filename(image_id))
}

async fn simulate(data_dir: &Path, args: SimulateArgs) -> Result<()> {
    if args.fresh {
        for dir in [ground_dir(data_dir), satellite_dir(data_dir)] {
            if tokio::fs::try_exists(&dir).await? {
                info!("discarding {}", dir.display());
                tokio::fs::remove_dir_all(&dir).await?;
            }
        }
    }

    let unit = Duration::from_secs_f64(args.timeout);
    let chunk_size = args
        .chunk_size
        .unwrap_or_else(|| args.packet_size.saturating_sub(HEADER_SIZE + BIN_OVERHEAD));

    let (ground_end, satellite_end) = loopback_pair();
    let ground_end = ground_end.with_name("ground").with_loss(Loss::Random {
        probability: args.uplink_loss,
        seed: args.seed,
    });
    let satellite_end = satellite_end.with_name("satellite").with_loss(Loss::Random {
        probability: args.loss,
        seed: args.seed.wrapping_add(1),
    });

    let link_config = LinkConfigBuilder::new()
        .packet_size(args.packet_size)
        .timeout(unit)
        .build();
    let handshake_config = HandshakeConfigBuilder::new()
        .inventory_timeout(unit * 3)
        .ping_attempts(args.ping_attempts)
        .cooldown(unit * 3)
        .build();

    let mut ground_ftp = FtpConfigBuilder::new()
        .chunk_size(chunk_size)
        .request_size(args.request_size)
        .stall_timeout(unit)
        .defer_assembly(args.defer_assembly)
        .send_delete(args.send_delete);
    if let Some(retry_limit) = args.retry_limit {
        ground_ftp = ground_ftp.retry_limit(retry_limit);
    }
    let satellite_ftp = FtpConfigBuilder::new()
        .chunk_size(chunk_size)
        .packet_delay(Duration::from_millis(args.packet_delay_ms))
        .build();

    // the satellite must keep serving longer than the ground waits on a stall
    let plan = ResponsePlan {
        camera_settings: (!args.settings.is_empty()).then(|| {
            args.settings
                .iter()
                .map(|(key, value)| (Value::from(key.as_str()), value.clone()))
                .collect()
        }),
        new_timeout: Some(unit * 3),
        take_picture: !args.no_picture,
    };

    let ground_store: Arc<dyn Store> = Arc::new(FsStore::new(ground_dir(data_dir)));
    let satellite_store: Arc<dyn Store> = Arc::new(FsStore::new(satellite_dir(data_dir)));

    let mut ground = GroundStation::new(
        Transport::new(ground_end, link_config.clone())?,
        ground_store.clone(),
        ground_ftp.build(),
        handshake_config.clone(),
        plan,
    )
    .await?;
    let craft = SimSpacecraft::load(satellite_store.clone(), args.seed, args.image_size).await?;
    let mut satellite = Satellite::new(
        Transport::new(satellite_end, link_config)?,
        satellite_store.clone(),
        satellite_ftp,
        handshake_config,
        craft,
    )?;
    ground.transport().report_diagnostics();

    for contact in 1..=args.contacts {
        info!("contact {} of {} starting", contact, args.contacts);
        let (ground_result, satellite_result) =
            tokio::join!(ground.run_contact(), satellite.run_contact());
        match ground_result {
            Ok(report) => {
                info!(
                    "contact {}: {}, received {:?}, assembled {:?}",
                    contact, report.session, report.received, report.assembled
                );
                if let Some((image_id, err)) = report.failed {
                    warn!("contact {}: image {} stopped the contact: {}", contact, image_id, err);
                }
            }
            Err(err) => warn!("contact {}: ground station failed: {}", contact, err),
        }
        match satellite_result {
            Ok(summary) => info!("contact {}: satellite served {:?}", contact, summary),
            Err(err) => warn!("contact {}: satellite failed: {}", contact, err),
        }
    }

    info!(
        "ground link {:?}, lost {} of {} sent",
        ground.transport().stats(),
        ground.transport().transceiver().frames_lost(),
        ground.transport().transceiver().frames_sent()
    );
    info!(
        "satellite link {:?}, lost {} of {} sent",
        satellite.transport().stats(),
        satellite.transport().transceiver().frames_lost(),
        satellite.transport().transceiver().frames_sent()
    );

    compare_images(ground.state(), ground_store.as_ref(), satellite_store.as_ref()).await
}

async fn compare_images(
    state: &PersistentState,
    ground_store: &dyn Store,
    satellite_store: &dyn Store,
) -> Result<()> {
    let mut mismatched = Vec::new();
    for image_id in 1..=state.images_known {
        let ground_copy = ground_store.read(&image_artifact_key(image_id)).await?;
        let satellite_copy = satellite_store.read(&image_key(image_id)).await?;
        match (ground_copy, satellite_copy) {
            (Some(ours), Some(theirs)) => {
                let ours = hex::encode(Sha256::digest(&ours));
                let theirs = hex::encode(Sha256::digest(&theirs));
                if ours == theirs {
                    info!("image {}: match, sha256: {}", image_id, ours);
                } else {
                    error!("image {}: MISMATCH, ground {} satellite {}", image_id, ours, theirs);
                    mismatched.push(image_id);
                }
            }
            (Some(ours), None) => info!(
                "image {}: received, satellite copy deleted, sha256: {}",
                image_id,
                hex::encode(Sha256::digest(&ours))
            ),
            (None, _) if state.to_assemble.contains(&image_id) => {
                info!("image {}: received, awaiting assembly", image_id)
            }
            (None, _) if state.incomplete.contains(&image_id) => {
                info!("image {}: incomplete", image_id)
            }
            (None, _) => warn!("image {}: not found on the ground", image_id),
        }
    }
    if !mismatched.is_empty() {
        bail!("images {:?} differ between ground and satellite", mismatched);
    }
    Ok(())
}

fn decode_frame(text: &str) -> Result<()> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned).map_err(|err| anyhow!("bad hex: {}", err))?;
    let frame = decode(&bytes)?;
    let message = Message::from_frame(&frame);
    println!("frame:    {}", frame);
    println!("category: {}", message.category());
    println!("message:  {}", message);
    Ok(())
}

async fn show_status(data_dir: &Path) -> Result<()> {
    let ground_store = FsStore::new(ground_dir(data_dir));
    let state = PersistentState::load(&ground_store).await?;
    println!("images known: {}", state.images_known);
    for &image_id in &state.incomplete {
        match TransferJob::load(&ground_store, image_id).await? {
            Some(job) => println!(
                "image {}: incomplete, missing {} of {} chunks",
                image_id,
                job.missing().missing_count(),
                job.total_chunks()
            ),
            None => println!("image {}: not started", image_id),
        }
    }
    for &image_id in &state.to_assemble {
        println!("image {}: awaiting assembly", image_id);
    }
    for image_id in 1..=state.images_known {
        if let Some(artifact) = ground_store.read(&image_artifact_key(image_id)).await? {
            println!(
                "image {}: {}, sz: {}, sha256: {}",
                image_id,
                image_artifact_key(image_id),
                artifact.len(),
                hex::encode(Sha256::digest(&artifact))
            );
        }
    }

    let satellite_store = FsStore::new(satellite_dir(data_dir));
    if let Some(count) = satellite_store.read(IMAGE_COUNT_KEY).await? {
        let images = satellite_store.list(cubecomm_transfer::IMAGE_DIR).await?;
        println!(
            "satellite: {} images taken, {} on board",
            String::from_utf8_lossy(&count).trim(),
            images.len()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let args = build_args_with_help()?;
    let data_dir = PathBuf::from(&args.data_dir);
    match args.command {
        Command::Simulate(sim_args) => simulate(&data_dir, sim_args).await,
        Command::Decode { frame } => decode_frame(&frame),
        Command::Status => show_status(&data_dir).await,
    }
}
