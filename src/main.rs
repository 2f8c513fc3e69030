use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use log::{info, warn, LevelFilter};

use pullscale::analysis::{derivatives, dominant_excursion};
use pullscale::logging::init_logging_with;
use pullscale::{
    discover, is_reserved_name, list_ports, load_buffer, AcquisitionConfig, DeviceLink,
    FinishedSession, JsonFileStore, Renderer, Sample, SessionEnd, SessionRecorder, SessionStore,
    StreamDelay, StreamSession,
};

/// How often the live view drains the sample channel.
const RENDER_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "pullscale", about = "Stream, record and analyze serial sensor sessions")]
struct Args {
    /// JSON config file; flags below override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Serial port (skips discovery)
    #[arg(long, global = true)]
    port: Option<String>,
    /// Session store file
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List serial ports and their manufacturers
    Ports,
    /// Collect a fixed number of samples and record them
    Record {
        #[arg(short = 'n', long, default_value_t = 100)]
        samples: usize,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Stream until Ctrl-C, then record
    Live {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Derivative summary of a recorded session (latest if no key given)
    Analyze {
        /// Session key, `<date>/<time>`
        key: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Milliseconds between samples
    #[arg(long, default_value_t = 100)]
    delay: u32,
    /// Zero the scale before streaming
    #[arg(long)]
    tare: bool,
    /// Session attribute, repeatable (e.g. --attr name=alex --attr arm=left)
    #[arg(long = "attr", value_parser = parse_attr)]
    attrs: Vec<(String, String)>,
    /// Do not write the session to the store
    #[arg(long)]
    no_save: bool,
}

fn parse_attr(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, _)) if is_reserved_name(k.trim()) => {
            Err(format!("{:?} is recorded automatically", k.trim()))
        }
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}

/// Prints samples as they arrive.
struct ConsoleRenderer;

impl Renderer for ConsoleRenderer {
    fn on_sample(&mut self, sample: &Sample) {
        println!("{:>8} ms  {:>10.4}", sample.device_time_ms, sample.value);
    }

    fn on_rescale(&mut self, time_bound_ms: u64, value_bound: f64) {
        info!("view now {time_bound_ms} ms x {value_bound:.2}");
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    init_logging_with(match args.verbose {
        0 => None,
        1 => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    });

    let mut cfg = match &args.config {
        Some(path) => AcquisitionConfig::load(path)?,
        None => AcquisitionConfig::default(),
    };
    if args.port.is_some() {
        cfg.port = args.port.clone();
    }
    if let Some(store) = &args.store {
        cfg.store_path = store.clone();
    }

    match args.command {
        Cmd::Ports => print_ports(),
        Cmd::Record { samples, run } => record(&cfg, samples, &run),
        Cmd::Live { run } => live(&cfg, &run),
        Cmd::Analyze { key } => analyze(&cfg, key.as_deref()),
    }
}

fn print_ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for p in ports {
        println!(
            "{}  {}",
            p.device_id,
            p.manufacturer.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn connect(cfg: &AcquisitionConfig, tare: bool) -> Result<DeviceLink> {
    let port = match &cfg.port {
        Some(p) => p.clone(),
        None => discover(Some(cfg.manufacturer_filter.as_str()))?,
    };
    println!("Using port {port}");

    let mut link = DeviceLink::open(&port, cfg.link)
        .with_context(|| format!("failed to open serial port {port}"))?;
    if tare {
        link.tare()?;
        thread::sleep(cfg.link.settle_delay);
    }
    let hs = link.handshake()?;
    println!("Handshake: {}", hs.message);
    if !hs.ok {
        warn!("device answered the handshake with an empty line");
    }
    Ok(link)
}

fn new_session(cfg: &AcquisitionConfig, link: DeviceLink, run: &RunArgs) -> StreamSession {
    let mut session = StreamSession::new(link, cfg.session, cfg.horizon);
    for (k, v) in &run.attrs {
        session.set_attribute(k.as_str(), v.as_str());
    }
    session
}

fn record(cfg: &AcquisitionConfig, samples: usize, run: &RunArgs) -> Result<()> {
    let link = connect(cfg, run.tare)?;
    let mut session = new_session(cfg, link, run);
    let delay = StreamDelay::from_millis(run.delay);

    let mut renderer = ConsoleRenderer;
    let result = session.acquire_with(samples, delay, |s, rescale| {
        renderer.on_sample(s);
        if let Some(r) = rescale {
            renderer.on_rescale(r.time_bound_ms, r.value_bound);
        }
    });
    let finished = session.finish();
    summarize_and_save(cfg, &finished, run)?;
    result.context("acquisition failed")?;
    Ok(())
}

fn live(cfg: &AcquisitionConfig, run: &RunArgs) -> Result<()> {
    let link = connect(cfg, run.tare)?;
    let session = new_session(cfg, link, run);

    let acquisition = session.spawn_live(StreamDelay::from_millis(run.delay))?;
    let stop = acquisition.cancel_flag();
    ctrlc::set_handler(move || stop.store(true, Ordering::Release))
        .context("failed to install Ctrl-C handler")?;
    println!("Streaming, press Ctrl-C to stop.");

    let mut renderer = ConsoleRenderer;
    let flag = acquisition.cancel_flag();
    while !flag.load(Ordering::Acquire) && !acquisition.is_finished() {
        acquisition.poll(&mut renderer);
        thread::sleep(RENDER_INTERVAL);
    }

    let finished = acquisition.stop(&mut renderer)?;
    summarize_and_save(cfg, &finished, run)
}

fn summarize_and_save(
    cfg: &AcquisitionConfig,
    finished: &FinishedSession,
    run: &RunArgs,
) -> Result<()> {
    let stats = finished.stats;
    println!(
        "Collected {} samples ({} rejected frames, {} timeouts).",
        finished.buffer.len(),
        stats.rejected_frames(),
        stats.timeouts
    );
    if let Some(peak) = finished.buffer.peak() {
        println!("Peak value was {} at {} ms.", peak.value, peak.device_time_ms);
    }
    if let SessionEnd::LinkLost(reason) = &finished.end {
        warn!("session ended early: {reason}");
    }

    if run.no_save || finished.buffer.is_empty() {
        return Ok(());
    }
    let mut store = JsonFileStore::open(&cfg.store_path)?;
    let key = SessionRecorder::default().persist_finished(finished, &mut store)?;
    println!("Saved session {key} to {}", cfg.store_path.display());
    Ok(())
}

fn analyze(cfg: &AcquisitionConfig, key: Option<&str>) -> Result<()> {
    let store = JsonFileStore::open(&cfg.store_path)?;
    let key = match key {
        Some(k) => k.to_string(),
        None => match store.session_keys().pop() {
            Some(k) => k,
            None => bail!("no sessions in {}", cfg.store_path.display()),
        },
    };

    let buffer = load_buffer(&store, &key, cfg.horizon)?;
    let series = derivatives(&buffer);
    println!("Session {key}: {} samples", buffer.len());
    if let Some(peak) = buffer.peak() {
        println!("  peak      {} at {} ms", peak.value, peak.device_time_ms);
    }

    let Some(ex) = dominant_excursion(&series.first) else {
        println!("  too few samples for derivatives");
        return Ok(());
    };
    let times = &series.first_time_ms;
    println!(
        "  steepest rise  {:.5}/ms at {} ms",
        series.first[ex.max_index], times[ex.max_index]
    );
    println!(
        "  steepest fall  {:.5}/ms at {} ms",
        series.first[ex.min_index], times[ex.min_index]
    );
    match ex.ordered_range() {
        Some(range) => {
            let slice = &buffer.samples()[range];
            let mean = slice.iter().map(|s| s.value).sum::<f64>() / slice.len() as f64;
            println!("  pull window    {} samples, mean {:.4}", slice.len(), mean);
        }
        None => println!("  pull window    fall precedes rise, no window"),
    }
    Ok(())
}
