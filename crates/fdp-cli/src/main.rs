// SPDX-License-Identifier: Apache-2.0
//! FDP developer CLI: run the demo world, record it, replay recordings,
//! and benchmark per-phase timings.
//!
//! Exit codes: 0 success, 2 I/O failure, 3 usage error, 4 corrupt
//! recording, 5 schema mismatch.

// The CLI is the one place stdout/stderr are the product.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use comfy_table::Table;
use fdp_core::demo::{register_demo_components, spawn_drifters, MotionAuditModule, MotionModule};
use fdp_core::{
    ComponentRegistry, EntityStore, ModuleHost, Phase, RecordingError, RecordingReader,
    RecordingWriter,
};
use tracing::info;

const EXIT_IO: u8 = 2;
const EXIT_USAGE: u8 = 3;
const EXIT_CORRUPT: u8 = 4;
const EXIT_SCHEMA: u8 = 5;

#[derive(Parser)]
#[command(name = "fdp", version, about = "FDP simulation core tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the demo world for N frames and write a recording.
    Record {
        /// Output recording path.
        #[arg(long)]
        out: PathBuf,
        /// Frames to simulate.
        #[arg(long)]
        frames: u32,
        /// Entities to spawn.
        #[arg(long, default_value_t = 64)]
        entities: u32,
        /// Frames between keyframes (falls back to FDP_KEYFRAME_INTERVAL,
        /// then 60).
        #[arg(long)]
        keyframe_interval: Option<u32>,
    },
    /// Read a recording into a fresh store, validating header and schema.
    Replay {
        /// Input recording path.
        #[arg(long = "in")]
        input: PathBuf,
    },
    /// Run the demo world and report per-phase timings.
    Bench {
        /// Entities to spawn.
        #[arg(long)]
        entities: u32,
        /// Frames to simulate.
        #[arg(long)]
        frames: u32,
    },
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help/version requests are not usage errors.
            if err.use_stderr() {
                let _ = err.print();
                return ExitCode::from(EXIT_USAGE);
            }
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    let outcome = match cli.command {
        Command::Record {
            out,
            frames,
            entities,
            keyframe_interval,
        } => record(&out, frames, entities, keyframe_interval),
        Command::Replay { input } => replay(&input),
        Command::Bench { entities, frames } => bench(entities, frames),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

fn demo_host(entities: u32, with_audit: bool) -> Result<ModuleHost, u8> {
    let mut registry = ComponentRegistry::new();
    register_demo_components(&mut registry).map_err(|err| {
        eprintln!("error: {err}");
        EXIT_USAGE
    })?;
    let mut builder = ModuleHost::builder(registry).with_module(Box::new(MotionModule));
    if with_audit {
        builder = builder.with_module(Box::new(MotionAuditModule::new()));
    }
    let mut host = builder.build().map_err(|err| {
        eprintln!("error: {err}");
        EXIT_USAGE
    })?;
    spawn_drifters(host.store_mut(), entities);
    Ok(host)
}

fn keyframe_cadence(cli_value: Option<u32>) -> u32 {
    cli_value
        .or_else(|| {
            std::env::var("FDP_KEYFRAME_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(60)
        .max(1)
}

fn record(
    out: &PathBuf,
    frames: u32,
    entities: u32,
    keyframe_interval: Option<u32>,
) -> Result<(), u8> {
    let cadence = keyframe_cadence(keyframe_interval);
    let mut host = demo_host(entities, false)?;

    let file = File::create(out).map_err(|err| {
        eprintln!("error: cannot create {}: {err}", out.display());
        EXIT_IO
    })?;
    let mut writer = RecordingWriter::create(BufWriter::new(file), host.registry().clone())
        .map_err(|err| {
            eprintln!("error: {err}");
            EXIT_IO
        })?;

    writer
        .capture_keyframe(host.store(), host.poly())
        .map_err(|err| {
            eprintln!("error: {err}");
            EXIT_IO
        })?;

    for frame in 1..=frames {
        let baseline = writer.baseline_version();
        host.run_frame().map_err(|err| {
            eprintln!("error: {err}");
            EXIT_USAGE
        })?;
        let result = if frame % cadence == 0 {
            writer.capture_keyframe(host.store(), host.poly())
        } else {
            writer.capture_delta(host.store(), baseline, host.poly())
        };
        result.map_err(|err| {
            eprintln!("error: {err}");
            EXIT_IO
        })?;
    }

    let stats = writer.close().map_err(|err| {
        eprintln!("error: {err}");
        EXIT_IO
    })?;
    info!(
        frames = stats.frames_written,
        keyframes = stats.keyframes,
        "recording complete"
    );
    println!(
        "recorded {} frame(s) ({} keyframe(s)) to {}",
        stats.frames_written,
        stats.keyframes,
        out.display()
    );
    Ok(())
}

fn replay_error_code(err: &RecordingError) -> u8 {
    match err {
        RecordingError::CorruptRecording | RecordingError::TruncatedFrame => EXIT_CORRUPT,
        RecordingError::SchemaMismatch(_)
        | RecordingError::UnregisteredPolymorphicType
        | RecordingError::Poly(_) => EXIT_SCHEMA,
        _ => EXIT_IO,
    }
}

fn replay(input: &PathBuf) -> Result<(), u8> {
    let file = File::open(input).map_err(|err| {
        eprintln!("error: cannot open {}: {err}", input.display());
        EXIT_IO
    })?;

    // The replay target registers the same schema the recorder ran with.
    let host = demo_host(0, false)?;
    let mut store = EntityStore::new(host.registry().clone());

    let mut reader = RecordingReader::open(BufReader::new(file)).map_err(|err| {
        eprintln!("error: {err}");
        replay_error_code(&err)
    })?;

    let mut frames = 0u64;
    loop {
        match reader.read_next_frame(&mut store, host.poly()) {
            Ok(true) => frames += 1,
            Ok(false) => break,
            Err(err) => {
                eprintln!("error: {err}");
                return Err(replay_error_code(&err));
            }
        }
    }
    println!(
        "replayed {frames} frame(s); {} live entities",
        store.entity_count()
    );
    Ok(())
}

fn bench(entities: u32, frames: u32) -> Result<(), u8> {
    let mut host = demo_host(entities, true)?;
    let started = std::time::Instant::now();
    for _ in 0..frames {
        host.run_frame().map_err(|err| {
            eprintln!("error: {err}");
            EXIT_USAGE
        })?;
    }
    let elapsed = started.elapsed();

    let mut table = Table::new();
    table.set_header(["phase", "system", "runs", "total ms", "avg µs/run"]);
    for phase in Phase::ALL {
        for profile in host.profiles().iter().filter(|p| p.phase == phase) {
            let runs = profile.runs.max(1);
            table.add_row([
                format!("{phase:?}"),
                profile.name.to_string(),
                profile.runs.to_string(),
                format!("{:.2}", profile.total.as_secs_f64() * 1e3),
                format!("{:.1}", profile.total.as_secs_f64() * 1e6 / runs as f64),
            ]);
        }
    }
    println!("{table}");
    println!(
        "{frames} frame(s), {entities} entities in {:.2} ms ({:.1} µs/frame)",
        elapsed.as_secs_f64() * 1e3,
        elapsed.as_secs_f64() * 1e6 / f64::from(frames.max(1))
    );
    Ok(())
}
