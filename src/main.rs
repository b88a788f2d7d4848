//! Headless arcade session
//!
//! Runs the demo game on the simulation core for a fixed number of frames
//! and prints a JSON summary.
//!
//! ```text
//! asteroids-core [--frames N] [--preset sparse|standard|dense]
//!                [--config FILE] [--seed N] [--asteroids N]
//! ```

use std::sync::atomic::Ordering;
use std::time::Instant;

use serde::Serialize;

use asteroids_core::SimError;
use asteroids_core::arcade::{self, ArcadeReport};
use asteroids_core::settings::{DensityPreset, SimConfig};
use asteroids_core::sim::Simulation;

const FRAME_DT: f32 = 1.0 / 60.0;

struct Options {
    frames: u64,
    seed: u64,
    asteroids: usize,
    config: SimConfig,
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, SimError> {
        let mut options = Options {
            frames: 600,
            seed: 0xA57E_7017,
            asteroids: 4,
            config: SimConfig::default(),
        };
        let mut preset = None;

        while let Some(flag) = args.next() {
            let mut value = || {
                args.next()
                    .ok_or_else(|| SimError::InvalidConfig(format!("{flag} needs a value")))
            };
            match flag.as_str() {
                "--frames" => options.frames = parse_number(&value()?)?,
                "--seed" => options.seed = parse_number(&value()?)?,
                "--asteroids" => options.asteroids = parse_number(&value()?)?,
                "--preset" => {
                    let name = value()?;
                    preset = Some(
                        DensityPreset::from_str(&name)
                            .ok_or_else(|| SimError::InvalidConfig(format!("unknown preset {name:?}")))?,
                    );
                }
                "--config" => {
                    let path = value()?;
                    options.config = SimConfig::from_json(&std::fs::read_to_string(&path)?)?;
                    log::info!("Loaded configuration from {path}");
                }
                other => return Err(SimError::InvalidConfig(format!("unknown argument {other:?}"))),
            }
        }

        if let Some(preset) = preset {
            options.config.apply_preset(preset);
        }
        options.config.validate()?;
        Ok(options)
    }
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Result<T, SimError> {
    s.parse()
        .map_err(|_| SimError::InvalidConfig(format!("expected a number, got {s:?}")))
}

#[derive(Serialize)]
struct PoolReport {
    name: String,
    free: usize,
    total: usize,
}

#[derive(Serialize)]
struct SessionReport {
    frames: u64,
    elapsed_ms: u128,
    preset: &'static str,
    active_entities: usize,
    contacts: u64,
    grid_faults: u64,
    retired: u64,
    arcade: ArcadeReport,
    pools: Vec<PoolReport>,
}

fn run() -> Result<(), SimError> {
    let options = Options::parse(std::env::args().skip(1))?;
    let preset = options.config.preset.as_str();
    log::info!(
        "Asteroids core (headless) starting: {} frames, preset {preset}, {} workers",
        options.frames,
        options.config.worker_threads
    );

    let mut sim = Simulation::new(options.config)?;
    let stats = arcade::install_arcade(sim.world(), options.seed, options.asteroids)?;

    let started = Instant::now();
    let mut frames = 0;
    while frames < options.frames && sim.step(FRAME_DT) {
        frames += 1;
        if frames % 60 == 0 {
            let world = sim.world();
            log::info!(
                "Frame {frames}: {} active, {} contacts, score {}",
                world.active_count(),
                world.stats().contacts.load(Ordering::Relaxed),
                stats.score.load(Ordering::Relaxed)
            );
        }
    }
    let elapsed = started.elapsed();
    sim.stop();

    let world = sim.world();
    let report = SessionReport {
        frames,
        elapsed_ms: elapsed.as_millis(),
        preset,
        active_entities: world.active_count(),
        contacts: world.stats().contacts.load(Ordering::Relaxed),
        grid_faults: world.stats().grid_faults.load(Ordering::Relaxed),
        retired: world.stats().retired.load(Ordering::Relaxed),
        arcade: stats.report(),
        pools: world
            .pools()
            .stats()
            .into_iter()
            .map(|(name, free, total)| PoolReport { name, free, total })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        log::error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
