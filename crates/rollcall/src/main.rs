use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_hw::Camera;
use rollcall_vision::OnnxAnalyzer;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod cache;
mod config;
mod display;
mod enroll;
mod font;
mod ledger;
mod registry;
mod session;
#[cfg(test)]
mod testing;

use config::Config;
use display::{HeadlessViewer, Viewer, WindowViewer};
use enroll::{EnrollError, EnrollOptions};
use ledger::Ledger;
use registry::Registry;
use session::{Session, SessionOptions};

#[derive(Parser)]
#[command(name = "rollcall", about = "Webcam face-recognition attendance")]
struct Cli {
    /// Config file (default: ./rollcall.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture reference images for a person
    Enroll {
        /// Person's name; also the name of their directory
        name: String,
        /// Replace an existing enrollment of the same name
        #[arg(long)]
        force: bool,
    },
    /// Recognise faces and mark attendance until stopped
    Run {
        /// No window; stop with Ctrl-C or --max-frames
        #[arg(long)]
        headless: bool,
        /// Stop after this many frames
        #[arg(long)]
        max_frames: Option<usize>,
    },
    /// List enrolled people
    List,
    /// Print a day's attendance
    Report {
        /// Date as YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// List video capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Enroll { name, force } => cmd_enroll(&config, &name, force),
        Commands::Run {
            headless,
            max_frames,
        } => cmd_run(&config, headless, max_frames),
        Commands::List => cmd_list(&config),
        Commands::Report { date } => cmd_report(&config, date),
        Commands::Devices => cmd_devices(),
    }
}

fn open_camera(config: &Config) -> Result<Camera> {
    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)
        .with_context(|| format!("cannot open camera {}", config.camera_device))?;
    tracing::info!(
        device = %camera.device_path,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera ready"
    );
    Ok(camera)
}

fn load_analyzer(config: &Config) -> Result<OnnxAnalyzer> {
    OnnxAnalyzer::load(&config.model_dir)
        .with_context(|| format!("cannot load face models from {}", config.model_dir.display()))
}

fn cmd_enroll(config: &Config, name: &str, force: bool) -> Result<()> {
    enroll::validate_name(name)?;
    let mut analyzer = load_analyzer(config)?;
    let camera = open_camera(config)?;
    let mut stream = camera.stream()?;
    stream.discard(config.warmup_frames);

    let mut viewer = WindowViewer::new(
        &format!("rollcall - enrolling {name}"),
        camera.width as usize,
        camera.height as usize,
        None,
    )?;
    let opts = EnrollOptions {
        min_confidence: config.enroll_min_confidence,
        max_attempts: config.enroll_max_attempts,
        settle: Duration::from_millis(config.enroll_settle_ms),
        overwrite: force,
    };

    println!("Enrolling {name}. Press Q to cancel.");
    let report = match enroll::enroll(
        name,
        &config.known_faces_dir,
        &opts,
        &mut analyzer,
        &mut stream,
        &mut viewer,
    ) {
        Ok(report) => report,
        Err(EnrollError::Cancelled) => {
            println!("Enrollment cancelled; nothing was saved.");
            return Ok(());
        }
        Err(e) => return Err(e).context("enrollment failed"),
    };

    println!(
        "Enrolled {} with {} of {} poses in {}",
        report.name,
        report.captured.len(),
        enroll::Pose::ALL.len(),
        report.dir.display()
    );
    for pose in &report.failed {
        println!("  skipped pose: {}", pose.file_stem());
    }
    Ok(())
}

fn cmd_run(config: &Config, headless: bool, max_frames: Option<usize>) -> Result<()> {
    let mut analyzer = load_analyzer(config)?;
    let registry = Registry::load(&config.known_faces_dir, &mut analyzer)?;
    if registry.is_empty() {
        bail!(
            "no usable enrollments in {}; run `rollcall enroll NAME` first",
            config.known_faces_dir.display()
        );
    }
    for (name, encodings) in registry.people() {
        tracing::debug!(name, encodings, "known person");
    }
    println!("Loaded {} known people", registry.people().len());

    let camera = open_camera(config)?;
    let mut stream = camera.stream()?;
    stream.discard(config.warmup_frames);

    let mut viewer: Box<dyn Viewer> = if headless {
        Box::new(HeadlessViewer::new(max_frames))
    } else {
        Box::new(WindowViewer::new(
            "rollcall",
            camera.width as usize,
            camera.height as usize,
            max_frames,
        )?)
    };

    let session = Session::new(
        analyzer,
        registry,
        Ledger::new(&config.reports_dir),
        SessionOptions {
            threshold: config.match_threshold,
            frame_interval: config.frame_interval,
            process_scale: config.process_scale,
        },
    );

    if !headless {
        println!("Press Q to quit");
    }
    let summary = session
        .run(&mut stream, viewer.as_mut(), || Local::now().naive_local())
        .context("recognition stopped")?;

    println!(
        "Processed {} frames ({} analysed); {} newly marked present",
        summary.frames,
        summary.analysed,
        summary.recorded.len()
    );
    Ok(())
}

fn cmd_list(config: &Config) -> Result<()> {
    let enrollments = registry::scan(&config.known_faces_dir)?;
    if enrollments.is_empty() {
        println!("No one enrolled in {}", config.known_faces_dir.display());
        return Ok(());
    }
    for e in enrollments {
        println!("{:<24} {} image(s)", e.name, e.images.len());
    }
    Ok(())
}

fn cmd_report(config: &Config, date: Option<NaiveDate>) -> Result<()> {
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    let mut ledger = Ledger::new(&config.reports_dir);
    let path = ledger.path_for(date);
    let rows = ledger.entries(date)?;

    if rows.is_empty() {
        println!("No attendance recorded for {date}");
        return Ok(());
    }
    println!("Attendance for {date} ({})", path.display());
    for row in rows {
        println!("{:<24} {}", row.name, row.time);
    }
    Ok(())
}

fn cmd_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No video capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}
