//! Posture CLI - Command-line interface for the posture fusion core
//!
//! Commands:
//! - replay: Run recorded estimator outcomes through a session (batch mode)
//! - validate-config: Validate a system config file
//! - doctor: Diagnose configuration and environment
//! - schema: Print record schemas

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::cell::RefCell;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use posture_fusion::config::{ModeConfig, SessionSettings, SharedConfig, SystemConfig};
use posture_fusion::estimator::CameraFn;
use posture_fusion::types::{DetectionMode, EstimateOutcome, OutcomeRecord, SensorReading, TickOutput};
use posture_fusion::{FusionError, MonitorSession, CORE_VERSION};

/// Posture - real-time fusion of sensor and camera posture estimates
#[derive(Parser)]
#[command(name = "posture")]
#[command(version = CORE_VERSION)]
#[command(about = "Fuse sensor and camera posture estimates", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run recorded estimator outcomes through a session (batch mode)
    Replay {
        /// Input file path, one tick record per line (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// System config file (mode config plus session settings)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Detection mode, overriding the config file
        #[arg(long)]
        mode: Option<String>,

        /// Stability window in ticks
        #[arg(long)]
        window: Option<usize>,

        /// Consecutive bad ticks before warning
        #[arg(long)]
        bad_threshold: Option<u32>,

        /// Bad-posture duration before warning, in seconds
        #[arg(long)]
        window_seconds: Option<u64>,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Write session statistics to this file after the replay
        #[arg(long)]
        stats: Option<PathBuf>,
    },

    /// Validate a system config file
    ValidateConfig {
        /// Config file path (use - for stdin)
        #[arg(short, long)]
        config: PathBuf,

        /// Print the effective config as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and environment
    Doctor {
        /// Check a system config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print schema information
    Schema {
        /// Schema to print (input or output)
        #[arg(value_enum)]
        schema_type: SchemaType,

        /// Output as JSON schema
        #[arg(long)]
        json_schema: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one tick per line)
    Ndjson,
    /// JSON array of ticks
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

#[derive(Clone, ValueEnum)]
enum SchemaType {
    /// Replay tick record
    Input,
    /// Tick output
    Output,
}

/// One line of a replay file
#[derive(Debug, Deserialize)]
struct TickRecord {
    timestamp: DateTime<Utc>,
    /// Raw pressure channels; zeros when absent
    #[serde(default)]
    reading: Option<Vec<f64>>,
    /// Sensor estimator outcome; absent means unavailable
    #[serde(default)]
    sensor: Option<OutcomeRecord>,
    /// Camera estimator outcome; absent means no frame was captured
    #[serde(default)]
    camera: Option<OutcomeRecord>,
    /// Switch the detection mode from this tick on
    #[serde(default)]
    mode: Option<DetectionMode>,
    /// Reset the session before this tick
    #[serde(default)]
    reset: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), PostureCliError> {
    match cli.command {
        Commands::Replay {
            input,
            output,
            config,
            mode,
            window,
            bad_threshold,
            window_seconds,
            output_format,
            stats,
        } => {
            let mut system = match config {
                Some(path) => SystemConfig::load(&path)?,
                None => SystemConfig::default(),
            };
            if let Some(mode) = mode {
                system.mode.mode = mode.parse()?;
            }
            if let Some(window) = window {
                system.session.stability.window = window;
            }
            if let Some(ticks) = bad_threshold {
                system.session.warning.bad_threshold_ticks = ticks;
            }
            if let Some(seconds) = window_seconds {
                system.session.warning.window_seconds = seconds;
            }
            system.validate()?;

            cmd_replay(&input, &output, system, output_format, stats.as_deref())
        }

        Commands::ValidateConfig { config, json } => cmd_validate_config(&config, json),

        Commands::Doctor { config, json } => cmd_doctor(config.as_deref(), json),

        Commands::Schema {
            schema_type,
            json_schema,
        } => cmd_schema(schema_type, json_schema),
    }
}

fn cmd_replay(
    input: &Path,
    output: &Path,
    system: SystemConfig,
    output_format: OutputFormat,
    stats_path: Option<&Path>,
) -> Result<(), PostureCliError> {
    let reader: Box<dyn BufRead> = if input.to_string_lossy() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(fs::File::open(input)?))
    };

    // Recorded outcomes are handed to the estimators through these slots
    let sensor_slot: Rc<RefCell<Option<EstimateOutcome>>> = Rc::new(RefCell::new(None));
    let camera_slot: Rc<RefCell<Option<EstimateOutcome>>> = Rc::new(RefCell::new(None));

    let sensor = {
        let slot = Rc::clone(&sensor_slot);
        move |_: &SensorReading, _: DateTime<Utc>| {
            slot.borrow_mut().take().unwrap_or(EstimateOutcome::Unavailable)
        }
    };
    let camera = {
        let slot = Rc::clone(&camera_slot);
        CameraFn::new(move |_: &(), _: DateTime<Utc>| {
            slot.borrow_mut().take().unwrap_or(EstimateOutcome::Unavailable)
        })
    };

    let config = SharedConfig::new(system.mode)?;
    let mut session =
        MonitorSession::with_settings(sensor, camera, config.clone(), system.session)?;
    info!(mode = %system.mode.mode, "replay started");

    let mut outputs: Vec<TickOutput> = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: TickRecord = serde_json::from_str(trimmed).map_err(|e| {
            PostureCliError::ParseError(format!("Line {}: {}", index + 1, e))
        })?;

        if record.reset {
            session.reset();
        }
        if let Some(mode) = record.mode {
            config.set_mode(mode);
        }

        let reading = match &record.reading {
            Some(values) => SensorReading::from_slice(values)?,
            None => SensorReading::new([0.0; 7])?,
        };

        let now = record.timestamp;
        *sensor_slot.borrow_mut() = record.sensor.map(|r| r.into_outcome(now));
        let has_frame = record.camera.is_some();
        *camera_slot.borrow_mut() = record.camera.map(|r| r.into_outcome(now));

        let frame = if has_frame { Some(&()) } else { None };
        let tick = session.tick(&reading, frame, now);
        debug!(sequence = tick.sequence, label = ?tick.label, "replayed tick");
        outputs.push(tick);

        // Unused outcomes must not leak into the next tick
        sensor_slot.borrow_mut().take();
        camera_slot.borrow_mut().take();
    }

    if outputs.is_empty() {
        return Err(PostureCliError::NoRecords);
    }

    let output_data = format_output(&outputs, &output_format)?;
    if output.to_string_lossy() == "-" {
        let mut stdout = io::stdout();
        write!(stdout, "{}", output_data)?;
        stdout.flush()?;
    } else {
        fs::write(output, output_data)?;
    }

    let stats = session.stats();
    info!(
        ticks = stats.ticks,
        camera_activation_rate = stats.camera_activation_rate(),
        conflict_rate = stats.conflict_rate(),
        "replay finished"
    );
    if let Some(path) = stats_path {
        fs::write(path, serde_json::to_string_pretty(stats)?)?;
    }

    Ok(())
}

fn cmd_validate_config(config: &Path, json: bool) -> Result<(), PostureCliError> {
    let content = if config.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(config)?
    };

    let system = SystemConfig::from_json(&content)?;

    if json {
        println!("{}", system.to_json_pretty()?);
    } else {
        let mode = &system.mode;
        let session = &system.session;
        println!("Config OK");
        println!("=========");
        println!("Mode:              {}", mode.mode);
        println!("Auto threshold:    {:.2}", mode.auto_threshold);
        println!(
            "Fusion weights:    sensor {:.2} / camera {:.2}",
            mode.fusion_weights.sensor, mode.fusion_weights.camera
        );
        println!(
            "Stability window:  {} ticks (majority {})",
            session.stability.window,
            session.stability.majority()
        );
        println!(
            "Warning after:     {} bad ticks or {} s",
            session.warning.bad_threshold_ticks, session.warning.window_seconds
        );
    }

    Ok(())
}

fn cmd_doctor(config: Option<&Path>, json: bool) -> Result<(), PostureCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "core_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Posture fusion core {}", CORE_VERSION),
    });

    let defaults = ModeConfig::default();
    checks.push(DoctorCheck {
        name: "defaults".to_string(),
        status: if defaults.validate().is_ok() && SessionSettings::default().validate().is_ok() {
            CheckStatus::Ok
        } else {
            CheckStatus::Error
        },
        message: format!(
            "Default mode {} (threshold {:.2}, weights {:.1}/{:.1})",
            defaults.mode,
            defaults.auto_threshold,
            defaults.fusion_weights.sensor,
            defaults.fusion_weights.camera
        ),
    });

    if let Some(path) = config {
        let check = if path.exists() {
            match SystemConfig::load(path) {
                Ok(system) => DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Ok,
                    message: format!("Config file valid (mode {})", system.mode.mode),
                },
                Err(e) => DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: format!("Invalid config file: {}", e),
                },
            }
        } else {
            DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Warning,
                message: "Config file does not exist; defaults will be used".to_string(),
            }
        };
        checks.push(check);
    }

    // Replay reads records from stdin when piped
    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (replay input ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        version: CORE_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Posture Doctor Report");
        println!("=====================");
        println!("Version:  {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(PostureCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_schema(schema_type: SchemaType, json_schema: bool) -> Result<(), PostureCliError> {
    match schema_type {
        SchemaType::Input => {
            if json_schema {
                println!("{}", get_input_json_schema());
            } else {
                println!("Input: one tick record per line");
                println!();
                println!("- timestamp: RFC 3339 tick time (required)");
                println!("- reading: 7 pressure channel values (optional)");
                println!("- sensor: estimator outcome (optional, absent = unavailable)");
                println!("- camera: estimator outcome (optional, absent = no frame)");
                println!("- mode: sensor_only, camera_only, auto, fusion (optional)");
                println!("- reset: reset the session before this tick (optional)");
                println!();
                println!("Estimator outcome is either an estimate:");
                println!("  {{ label, confidence (0-1), source (sensor|camera), timestamp? }}");
                println!("or a status:");
                println!("  {{ status: unavailable | timeout | failed, reason? }}");
                println!();
                println!("Labels: Correct_posture, Leaning_backward, Leaning_forward, Leaning_left,");
                println!("        Leaning_right, Left_leg_crossed, Right_leg_crossed,");
                println!("        Sitting_at_front_edge, Upper_body_hunched");
            }
        }
        SchemaType::Output => {
            if json_schema {
                println!("{}", get_output_json_schema());
            } else {
                println!("Output: one tick output per line");
                println!();
                println!("- session_id, sequence, timestamp");
                println!("- label, confidence: visible (stabilized) posture");
                println!("- mode: detection mode in effect for the tick");
                println!("- warning: bad posture persisted past the warning policy");
                println!("- fusion_reason: sensor_only_fallback, camera_only_fallback,");
                println!("  agreement_boost, sensor_override, camera_override, tie_break_camera");
                println!("- reason_detail: human-readable account of the decision");
                println!("- contributing_sources, sensor_confidence, camera_confidence");
                println!("- camera_invoked: the camera estimator ran this tick");
                println!("- stale: no new decision, previous state reported unchanged");
            }
        }
    }

    Ok(())
}

// Helper functions

fn format_output(outputs: &[TickOutput], format: &OutputFormat) -> Result<String, PostureCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut lines: Vec<String> = Vec::new();
            for output in outputs {
                lines.push(serde_json::to_string(output)?);
            }
            Ok(lines.join("\n") + "\n")
        }
        OutputFormat::Json => Ok(serde_json::to_string(outputs)?),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(outputs)?),
    }
}

fn label_enum() -> serde_json::Value {
    serde_json::json!([
        "Correct_posture", "Leaning_backward", "Leaning_forward", "Leaning_left",
        "Leaning_right", "Left_leg_crossed", "Right_leg_crossed",
        "Sitting_at_front_edge", "Upper_body_hunched"
    ])
}

fn get_input_json_schema() -> String {
    let outcome = serde_json::json!({
        "oneOf": [
            {
                "type": "object",
                "required": ["label", "confidence", "source"],
                "properties": {
                    "label": { "enum": label_enum() },
                    "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                    "source": { "enum": ["sensor", "camera"] },
                    "timestamp": { "type": "string", "format": "date-time" }
                }
            },
            {
                "type": "object",
                "required": ["status"],
                "properties": {
                    "status": { "enum": ["unavailable", "timeout", "failed"] },
                    "reason": { "type": "string" }
                }
            }
        ]
    });

    serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "posture tick record",
        "type": "object",
        "required": ["timestamp"],
        "properties": {
            "timestamp": { "type": "string", "format": "date-time" },
            "reading": {
                "type": "array",
                "items": { "type": "number" },
                "minItems": 7,
                "maxItems": 7
            },
            "sensor": outcome,
            "camera": outcome,
            "mode": { "enum": ["sensor_only", "camera_only", "auto", "fusion"] },
            "reset": { "type": "boolean" }
        }
    })
    .to_string()
}

fn get_output_json_schema() -> String {
    serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "posture tick output",
        "type": "object",
        "required": ["session_id", "sequence", "timestamp", "confidence", "mode", "warning", "stale"],
        "properties": {
            "session_id": { "type": "string", "format": "uuid" },
            "sequence": { "type": "integer" },
            "timestamp": { "type": "string", "format": "date-time" },
            "label": { "enum": label_enum() },
            "confidence": { "type": "number" },
            "mode": { "enum": ["sensor_only", "camera_only", "auto", "fusion"] },
            "warning": { "type": "boolean" },
            "fusion_reason": {
                "enum": [
                    "sensor_only_fallback", "camera_only_fallback", "agreement_boost",
                    "sensor_override", "camera_override", "tie_break_camera", null
                ]
            },
            "reason_detail": { "type": "string" },
            "contributing_sources": { "type": "array", "items": { "enum": ["sensor", "camera"] } },
            "sensor_confidence": { "type": ["number", "null"] },
            "camera_confidence": { "type": ["number", "null"] },
            "camera_invoked": { "type": "boolean" },
            "stale": { "type": "boolean" }
        }
    })
    .to_string()
}

// Error types

#[derive(Debug)]
enum PostureCliError {
    Io(io::Error),
    Fusion(FusionError),
    Json(serde_json::Error),
    NoRecords,
    DoctorFailed,
    ParseError(String),
}

impl From<io::Error> for PostureCliError {
    fn from(e: io::Error) -> Self {
        PostureCliError::Io(e)
    }
}

impl From<FusionError> for PostureCliError {
    fn from(e: FusionError) -> Self {
        PostureCliError::Fusion(e)
    }
}

impl From<serde_json::Error> for PostureCliError {
    fn from(e: serde_json::Error) -> Self {
        PostureCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<PostureCliError> for CliError {
    fn from(e: PostureCliError) -> Self {
        match e {
            PostureCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            PostureCliError::Fusion(e @ FusionError::InvalidConfig(_)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'posture validate-config' for details".to_string()),
            },
            PostureCliError::Fusion(e) => CliError {
                code: "FUSION_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'posture schema input' for the record format".to_string()),
            },
            PostureCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            PostureCliError::NoRecords => CliError {
                code: "NO_RECORDS".to_string(),
                message: "No tick records found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            PostureCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
            PostureCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'posture schema input' for the record format".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
