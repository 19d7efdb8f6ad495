//! beatline-host - the audio engine as a line-protocol child process.
//!
//! Reads one command per line on stdin and answers with `EVENT` / `ERROR`
//! lines on stdout. Logs go to stderr and are filtered with `RUST_LOG`.
//!
//! # Usage
//!
//! ```bash
//! beatline-host                                   # default device, 44.1 kHz
//! beatline-host --sample-rate 48000 --block-size 256
//! beatline-host --config engine.json --plugin-dir ~/synths
//! beatline-host --null-output                     # no audio device
//! ```

use anyhow::{Context, Result};
use beatline::control::protocol::event_line;
use beatline::{EngineConfig, EngineHandle, Flow, NullOutput, RealtimeOutput};
use crossbeam_channel::{select, tick, unbounded};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

/// How often engine events and garbage are collected.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Time the device gets to play the final panic before exit.
const EXIT_GRACE: Duration = Duration::from_millis(50);

/// Command-line options for the host.
struct CliOptions {
    /// JSON configuration file.
    config: Option<PathBuf>,
    sample_rate: Option<u32>,
    block_size: Option<usize>,
    /// Extra plugin directories, in addition to the configured ones.
    plugin_dirs: Vec<PathBuf>,
    /// Drive the engine from a timer instead of an audio device.
    null_output: bool,
}

impl CliOptions {
    /// Parses command-line arguments.
    ///
    /// Supports:
    /// - `--config <path>` or `-c <path>`: Load engine settings from JSON
    /// - `--sample-rate <hz>`: Override the output rate
    /// - `--block-size <frames>`: Override the block size
    /// - `--plugin-dir <path>`: Add a plugin search directory (repeatable)
    /// - `--null-output`: Run without an audio device
    /// - `--help` or `-h`: Print help and exit
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut options = Self {
            config: None,
            sample_rate: None,
            block_size: None,
            plugin_dirs: Vec::new(),
            null_output: false,
        };
        let mut i = 1;

        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--config" | "-c" => {
                    options.config = Some(PathBuf::from(next_value(&args, &mut i, flag)?));
                }
                "--sample-rate" => {
                    let raw = next_value(&args, &mut i, flag)?;
                    options.sample_rate =
                        Some(raw.parse().with_context(|| format!("Invalid sample rate: {}", raw))?);
                }
                "--block-size" => {
                    let raw = next_value(&args, &mut i, flag)?;
                    options.block_size =
                        Some(raw.parse().with_context(|| format!("Invalid block size: {}", raw))?);
                }
                "--plugin-dir" => {
                    options.plugin_dirs.push(PathBuf::from(next_value(&args, &mut i, flag)?));
                }
                "--null-output" => options.null_output = true,
                "--help" | "-h" => {
                    eprintln!("beatline-host - audio engine driven over stdin/stdout");
                    eprintln!();
                    eprintln!(
                        "Usage: {} [OPTIONS]",
                        args.first().map(String::as_str).unwrap_or("beatline-host")
                    );
                    eprintln!();
                    eprintln!("Options:");
                    eprintln!("  -c, --config PATH       Engine settings (JSON)");
                    eprintln!("      --sample-rate HZ    Output sample rate");
                    eprintln!("      --block-size N      Frames per block");
                    eprintln!("      --plugin-dir PATH   Extra plugin directory (repeatable)");
                    eprintln!("      --null-output       Run without an audio device");
                    eprintln!("  -h, --help              Print this help message");
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
            i += 1;
        }
        Ok(options)
    }

    /// Builds the engine configuration: file first, then flags.
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(block) = self.block_size {
            config.block_size = block;
        }
        config.plugin_dirs.extend(self.plugin_dirs.iter().cloned());
        config.validate().context("Invalid engine configuration")?;
        Ok(config)
    }
}

/// Advances past a flag and returns its value.
fn next_value(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .with_context(|| format!("{} requires a value", flag))
}

/// Writes reply lines and clears the buffer.
fn emit(out: &mut Vec<String>) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    for line in out.drain(..) {
        writeln!(lock, "{}", line).context("Failed to write to stdout")?;
    }
    lock.flush().context("Failed to flush stdout")
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = cli.engine_config()?;
    let block_size = config.block_size;
    let (mut handle, engine) =
        EngineHandle::new(config).context("Failed to initialize engine")?;

    // Exactly one of these keeps the engine running until exit.
    let (_device, _null) = if cli.null_output {
        (None, Some(NullOutput::start(engine, block_size)?))
    } else {
        let device = RealtimeOutput::start(engine, block_size)
            .context("No audio device (use --null-output to run without one)")?;
        (Some(device), None)
    };

    let (line_tx, line_rx) = unbounded::<String>();
    std::thread::Builder::new()
        .name("beatline-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        })
        .context("Failed to start stdin reader")?;

    let outcomes = handle.outcome_receiver();
    let renders = handle.render_receiver();
    let ticker = tick(POLL_INTERVAL);
    let mut out = vec![event_line("READY", &[])];
    emit(&mut out)?;

    loop {
        select! {
            recv(line_rx) -> msg => match msg {
                Ok(line) => {
                    if handle.handle_line(&line, &mut out) == Flow::Quit {
                        emit(&mut out)?;
                        break;
                    }
                }
                Err(_) => {
                    tracing::info!("stdin closed, shutting down");
                    handle.shutdown();
                    break;
                }
            },
            recv(outcomes) -> msg => {
                if let Ok(outcome) = msg {
                    handle.handle_outcome(outcome, &mut out);
                }
            },
            recv(renders) -> msg => {
                if let Ok(update) = msg {
                    handle.handle_render_update(update, &mut out);
                }
            },
            recv(ticker) -> _ => handle.poll(&mut out),
        }
        emit(&mut out)?;
    }

    std::thread::sleep(EXIT_GRACE);
    Ok(())
}
