//! `tomotilt` command-line tool.
//!
//! ```text
//! tomotilt fit samples.json --model curved
//! tomotilt register ref.png target.png --grid 4 --hfw 1e-5
//! tomotilt simulate series.json --offset-y 5e-6 --offset-z 3e-6 --calibrate
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, LevelFilter};
use serde::{Deserialize, Serialize};
use tomotilt::acquisition::sim::{SimulatedMicroscope, SimulatedStage};
use tomotilt::acquisition::{
    AcquisitionConfig, AcquisitionError, AcquisitionReport, AxisLimits, CalibrationOutcome, ConfigError,
    EucentricCalibration, ModelFocusTracker, TiltSeriesController,
};
use tomotilt::core::{AngularPosition, DisplacementComponent, DisplacementSample, SweepDirection};
use tomotilt::eucentric::{CalibrationError, CalibratorParams, EucentricAxisCalibrator, EucentricModel};
use tomotilt::io::{load_frame, FrameIoError, PngDirectorySink};
use tomotilt::registration::{PatchCorrelationRegistrar, RegistrationError, RegistrationParams, DEFAULT_MAX_SHIFT};

#[derive(Parser, Debug)]
#[command(name = "tomotilt", version, about = "Closed-loop tilt-series acquisition tools")]
struct Cli {
    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON tracing events instead of plain log lines.
    #[cfg(feature = "tracing")]
    #[arg(long, global = true)]
    json_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit the rotation-axis offset to a drift curve.
    Fit(FitArgs),
    /// Register two PNG frames.
    Register(RegisterArgs),
    /// Run a tilt series against the simulated microscope.
    Simulate(SimulateArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModelArg {
    Planar,
    Curved,
    Tilted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ComponentArg {
    X,
    Y,
}

#[derive(Args, Debug)]
struct FitArgs {
    /// JSON array of `{ "angle_deg", "dx", "dy" }` records.
    samples: PathBuf,

    #[arg(long, value_enum, default_value_t = ModelArg::Planar)]
    model: ModelArg,

    /// Detector viewing tilt for `--model tilted`, degrees.
    #[arg(long, value_name = "DEGREES", default_value_t = 0.0)]
    tilt_deg: f64,

    /// Fit planar and curved models and keep the better one.
    #[arg(long)]
    compare: bool,

    #[arg(long, value_enum, default_value_t = ComponentArg::Y)]
    component: ComponentArg,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    reference: PathBuf,
    target: PathBuf,

    #[arg(long, default_value_t = 4)]
    grid: usize,

    #[arg(long, default_value_t = 0.5)]
    ratio: f64,

    /// Horizontal field width of both frames, meters.
    #[arg(long, default_value_t = 1e-5)]
    hfw: f64,

    /// Largest shift searched per axis, pixels.
    #[arg(long, value_name = "PIXELS", default_value_t = DEFAULT_MAX_SHIFT, conflicts_with = "full_search")]
    max_shift: usize,

    /// Search the whole target frame for every patch.
    #[arg(long)]
    full_search: bool,

    #[arg(long)]
    subpixel: bool,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Acquisition configuration (JSON).
    config: PathBuf,

    /// Offset of the imaged point from the rotation axis along y, meters.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    offset_y: f64,

    /// Offset of the imaged point from the rotation axis along z, meters.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    offset_z: f64,

    /// Scene seed.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Run a ±20° eucentric calibration sweep first and apply it.
    #[arg(long)]
    calibrate: bool,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write output: {0}")]
    Output(#[from] serde_json::Error),
    #[error("failed to prepare {path}: {source}")]
    SaveDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Frame(#[from] FrameIoError),
}

/// One drift measurement as written by hand or by other tools.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SampleRecord {
    angle_deg: f64,
    #[serde(default)]
    dx: f64,
    #[serde(default)]
    dy: f64,
}

impl From<SampleRecord> for DisplacementSample {
    fn from(r: SampleRecord) -> Self {
        DisplacementSample::new(AngularPosition::from_degrees(r.angle_deg), r.dx, r.dy)
    }
}

#[derive(Serialize)]
struct SimulationOutput {
    calibration: Option<CalibrationOutcome>,
    report: AcquisitionReport,
    /// Content offset left in the last frame, pixels `[x, y]`.
    residual_px: [f64; 2],
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_fit(args: &FitArgs) -> Result<(), CliError> {
    let records: Vec<SampleRecord> = read_json(&args.samples)?;
    let samples: Vec<DisplacementSample> = records.into_iter().map(DisplacementSample::from).collect();
    if SweepDirection::of_sequence(&samples) == SweepDirection::Descending {
        info!("samples are in descending tilt order");
    }

    let model = match args.model {
        ModelArg::Planar => EucentricModel::Planar,
        ModelArg::Curved => EucentricModel::Curved,
        ModelArg::Tilted => EucentricModel::Tilted {
            tilt_deg: args.tilt_deg,
        },
    };
    let calibrator = EucentricAxisCalibrator::new(CalibratorParams {
        component: match args.component {
            ComponentArg::X => DisplacementComponent::X,
            ComponentArg::Y => DisplacementComponent::Y,
        },
        model,
        ..CalibratorParams::default()
    });

    let fit = if args.compare {
        calibrator.fit_best(&samples, &[EucentricModel::Planar, EucentricModel::Curved])?
    } else {
        calibrator.fit(&samples)?
    };
    info!("{} fit on {} samples, rms {:.3e}", fit.model.name(), fit.samples_used, fit.rms_residual);
    print_json(&fit)
}

fn run_register(args: &RegisterArgs) -> Result<(), CliError> {
    let reference = load_frame(&args.reference, args.hfw)?;
    let target = load_frame(&args.target, args.hfw)?;
    let registrar = PatchCorrelationRegistrar::new(RegistrationParams {
        grid_size: args.grid,
        template_ratio: args.ratio,
        max_shift: (!args.full_search).then_some(args.max_shift),
        subpixel: args.subpixel,
        ..RegistrationParams::default()
    });
    let result = registrar.register(&reference, &target)?;
    print_json(&result)
}

fn run_simulate(args: &SimulateArgs) -> Result<(), CliError> {
    let config = AcquisitionConfig::from_path(&args.config)?;
    let stage = SimulatedStage::new().with_eucentric_offset(args.offset_y, args.offset_z);
    let mut positioner = stage
        .positioner(AxisLimits::default())
        .settle_timeout(config.settle_timeout())
        .poll_interval(config.poll_interval());
    let mut scope = SimulatedMicroscope::new(stage.clone(), args.seed);

    let calibration = if args.calibrate {
        let sweep = EucentricCalibration::new(
            AngularPosition::from_degrees(-20.0),
            AngularPosition::from_degrees(20.0),
            AngularPosition::from_degrees(5.0),
            config.capture_settings(),
        )
        .with_apply(true);
        let registrar = PatchCorrelationRegistrar::new(config.registration.clone());
        Some(sweep.run(&mut positioner, &mut scope, &registrar, &EucentricAxisCalibrator::default())?)
    } else {
        None
    };

    let mut controller = TiltSeriesController::from_config(positioner, scope, &config);
    if let Some(outcome) = calibration.as_ref() {
        if config.focus_correction {
            controller = controller.with_focus(Box::new(ModelFocusTracker::from_model(&outcome.model)));
        }
    }
    if let Some(dir) = config.save_dir.as_ref() {
        let sink = PngDirectorySink::create(dir).map_err(|source| CliError::SaveDir {
            path: dir.clone(),
            source,
        })?;
        controller = controller.with_sink(Box::new(sink));
    }

    let report = controller.run()?;
    let residual = controller.actuator().with_gateway(|g| g.content_offset()) / config.capture_settings().pixel_size();
    print_json(&SimulationOutput {
        calibration,
        report,
        residual_px: [residual.x, residual.y],
    })
}

fn init_logging(cli: &Cli) {
    #[cfg(feature = "tracing")]
    if cli.json_log {
        tomotilt::core::init_tracing(true);
        return;
    }
    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Warn };
    let _ = tomotilt::core::init_with_level(level);
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    #[cfg(feature = "tracing")]
    let _span = tracing::info_span!("tomotilt", command = ?cli.command).entered();

    let result = match &cli.command {
        Command::Fit(args) => run_fit(args),
        Command::Register(args) => run_register(args),
        Command::Simulate(args) => run_simulate(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
