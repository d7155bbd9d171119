//! BATHY SIM: runs the bathymetric RBPF over a synthetic survey.
//!
//! The vehicle drives a straight line over a planar, sloped seabed. Its odometry overestimates the speed, so the
//! dead-reckoned track drifts; the filter weighs its particles against perfect per-particle seabed maps and
//! resamples when the swarm degenerates. Diagnostics are written to CSV, one row per odometry message.
//!
//! - `simulate`: run a survey and write the diagnostics
//! - `config`: write a template filter configuration (TOML/JSON)

mod common;

use clap::{Args, Parser, Subcommand};
use common::{ensure_parent_dir, init_logger, validate_input_path};
use log::{error, info};
use std::error::Error;
use std::path::PathBuf;

use bathy_rbpf::FilterConfig;
use bathy_rbpf::sim::{Seabed, SurveyScenario, run_survey, write_stats_csv};

#[derive(Parser)]
#[command(author, version, about = "Runs the bathymetric RBPF over synthetic surveys.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(name = "simulate", about = "Run a synthetic survey through the filter")]
    Simulate(SimulateArgs),
    #[command(name = "config", about = "Generate a template filter configuration file")]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Output CSV file for the filter diagnostics
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Filter configuration file (TOML/JSON); defaults are used if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of particles
    #[arg(long)]
    particles: Option<usize>,

    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Survey duration in seconds
    #[arg(long, default_value_t = 120.0)]
    duration: f64,

    /// Vehicle speed in m/s
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Relative odometry speed error
    #[arg(long, default_value_t = 0.05)]
    velocity_bias: f64,

    /// Along-track seabed slope
    #[arg(long, default_value_t = 0.2)]
    slope_x: f64,

    /// Across-track seabed slope
    #[arg(long, default_value_t = 0.0)]
    slope_y: f64,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output configuration file path (.toml or .json)
    #[arg(short, long, value_parser)]
    output: PathBuf,
}

impl SimulateArgs {
    fn filter_config(&self) -> Result<FilterConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => {
                validate_input_path(path)?;
                FilterConfig::from_file(path)?
            }
            None => FilterConfig::default(),
        };
        if let Some(particles) = self.particles {
            config.particle_count = particles;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }

    fn scenario(&self) -> SurveyScenario {
        let defaults = SurveyScenario::default();
        SurveyScenario {
            duration_s: self.duration,
            speed: self.speed,
            velocity_bias: self.velocity_bias,
            seabed: Seabed {
                slope_x: self.slope_x,
                slope_y: self.slope_y,
                ..defaults.seabed
            },
            ..defaults
        }
    }
}

async fn run_simulation(args: &SimulateArgs) -> Result<(), Box<dyn Error>> {
    let config = args.filter_config()?;
    let scenario = args.scenario();
    info!(
        "Simulating {:.0} s survey with {} particles (seed {})",
        scenario.duration_s, config.particle_count, config.seed
    );
    let report = run_survey(config, &scenario).await?;

    ensure_parent_dir(&args.output)?;
    write_stats_csv(&report.stats, &args.output)?;
    info!(
        "Wrote {} records to {}",
        report.stats.len(),
        args.output.display()
    );
    info!(
        "{} resampling events, {} maps plotted",
        report.resampling_events, report.maps_plotted
    );
    if let (Some(estimate), Some(last)) = (report.final_estimate, report.stats.last()) {
        info!(
            "Final along-track error: filter {:.2} m, dead reckoning {:.2} m",
            estimate.mean[0] - report.true_x,
            last.dr_x - report.true_x
        );
    }
    Ok(())
}

fn create_config_file(args: &CreateConfigArgs) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(&args.output)?;
    FilterConfig::default().to_file(&args.output)?;
    info!("Template configuration written to {}", args.output.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    let result = match &cli.command {
        Command::Simulate(args) => run_simulation(args).await,
        Command::CreateConfig(args) => create_config_file(args),
    };
    if let Err(e) = &result {
        error!("{e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulate_args(config: Option<PathBuf>) -> SimulateArgs {
        SimulateArgs {
            output: PathBuf::from("stats.csv"),
            config,
            particles: Some(6),
            seed: None,
            duration: 30.0,
            speed: 1.5,
            velocity_bias: 0.1,
            slope_x: 0.3,
            slope_y: 0.0,
        }
    }

    #[test]
    fn cli_overrides_config_defaults() {
        let args = simulate_args(None);
        let config = args.filter_config().unwrap();
        assert_eq!(config.particle_count, 6);
        assert_eq!(config.seed, FilterConfig::default().seed);

        let scenario = args.scenario();
        assert_eq!(scenario.speed, 1.5);
        assert_eq!(scenario.seabed.slope_x, 0.3);
        assert_eq!(scenario.seabed.depth, Seabed::default().depth);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = simulate_args(Some(PathBuf::from("does/not/exist.toml")));
        assert!(args.filter_config().is_err());
    }

    #[test]
    fn template_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("cfg").join("filter.toml");
        create_config_file(&CreateConfigArgs {
            output: output.clone(),
        })
        .unwrap();
        let args = simulate_args(Some(output));
        assert_eq!(args.filter_config().unwrap().particle_count, 6);
    }
}
