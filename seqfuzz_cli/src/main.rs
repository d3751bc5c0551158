use seqfuzz_core::config::{SeqfuzzConfig, TargetSettings, default_timeout_ms};
use seqfuzz_core::{
    InjectedStructure, ProcessEvent, ProcessHandle, ProcessOutcome, ProtocolBlock,
    ProtocolStructure, Recordings, SharedRng, TargetAddress, TcpTransmitter, load_captures,
    spawn_fuzzing, spawn_learning,
};

use clap::{Parser, Subcommand};
use log::{info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Log at debug level.
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Learn a protocol structure from captured messages.
    Learn {
        /// Capture files or directories. Defaults to learn.capture-paths.
        captures: Vec<PathBuf>,
        #[clap(short, long, default_value = "structure.json")]
        out: PathBuf,
    },
    /// Print the blocks of a learned structure.
    Show {
        structure: PathBuf,
        #[clap(long)]
        json: bool,
    },
    /// Fuzz a target using a learned structure.
    Fuzz {
        structure: PathBuf,
        /// Target as host:port, overriding [target].
        #[clap(short, long)]
        target: Option<String>,
        #[clap(short, long)]
        iterations: Option<u64>,
        /// Directory receiving the recordings, overriding output.dir.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

fn setup_logger(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filters = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("seqfuzz_core={level},seqfuzz_cli={level}"));
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&filters)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<SeqfuzzConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            SeqfuzzConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("seqfuzz.toml");
            if default_config_path.exists() {
                info!("Loading default configuration {default_config_path:?}");
                SeqfuzzConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file found, using built-in defaults");
                Ok(SeqfuzzConfig::default())
            }
        }
    }
}

fn parse_target(value: &str) -> Result<TargetAddress, anyhow::Error> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Target {value:?} is not in host:port form"))?;
    let port: u16 = port
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid port in target {value:?}: {e}"))?;
    anyhow::ensure!(!host.is_empty() && port != 0, "Invalid target {value:?}");
    Ok(TargetAddress::new(host.trim_matches(|c| c == '[' || c == ']'), port))
}

fn print_progress(label: &str, done: u64, total: Option<u64>) -> Result<(), anyhow::Error> {
    match total {
        Some(total) => print!("\r{label}: {done}/{total}   "),
        None => print!("\r{label}: {done}   "),
    }
    std::io::stdout().flush()?;
    Ok(())
}

/// Relays events until the worker ends, cancelling it once `deadline` passes.
fn watch<T: Send + 'static>(
    handle: &mut ProcessHandle<T>,
    label: &str,
    deadline: Option<Instant>,
) -> Result<(), anyhow::Error> {
    loop {
        match handle.recv_event(POLL_INTERVAL) {
            Some(ProcessEvent::Progress(progress)) => {
                print_progress(label, progress.done, progress.total)?
            }
            Some(ProcessEvent::State(state)) => {
                log::debug!("{label} is now {state:?}");
                if state.is_terminal() {
                    break;
                }
            }
            None if handle.is_done() => break,
            None => {}
        }
        if deadline.is_some_and(|d| Instant::now() >= d) && !handle.cancel_token().is_cancelled()
        {
            info!("Time limit reached, stopping");
            handle.cancel();
        }
    }
    println!();
    Ok(())
}

fn print_structure(structure: &ProtocolStructure) {
    if structure.is_empty() {
        println!("(empty structure)");
        return;
    }
    for (i, block) in structure.iter().enumerate() {
        match block {
            ProtocolBlock::Fixed { bytes } => {
                println!("{i:>4}  fixed     {:>5} bytes  \"{}\"", bytes.len(), bytes.escape_ascii())
            }
            ProtocolBlock::Variable {
                min_length,
                max_length,
            } => println!("{i:>4}  variable  {min_length}..={max_length} bytes"),
        }
    }
}

fn run_learn(
    config: &SeqfuzzConfig,
    captures: Vec<PathBuf>,
    out: &Path,
) -> Result<(), anyhow::Error> {
    let paths = if captures.is_empty() {
        config.learn.capture_paths.clone()
    } else {
        captures
    };
    anyhow::ensure!(
        !paths.is_empty(),
        "No captures given on the command line or in learn.capture-paths"
    );
    let captures = load_captures(&paths)?;
    let data: Vec<Vec<u8>> = captures.into_iter().map(|c| c.data).collect();

    let mut handle = spawn_learning(data, config.learn_settings())?;
    watch(&mut handle, "Merging", None)?;
    let structure = match handle.join() {
        ProcessOutcome::Finished(structure) => structure,
        ProcessOutcome::Cancelled(_) => anyhow::bail!("Learning was cancelled"),
        ProcessOutcome::Failed(e, _) => return Err(e),
    };

    structure.save_json(out)?;
    info!("Structure written to {out:?}");
    print_structure(&structure);
    Ok(())
}

fn run_show(structure: &Path, json: bool) -> Result<(), anyhow::Error> {
    let structure = ProtocolStructure::load_json(structure)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&structure)?);
    } else {
        print_structure(&structure);
    }
    Ok(())
}

fn run_fuzz(
    mut config: SeqfuzzConfig,
    structure_path: &Path,
    target: Option<String>,
    iterations: Option<u64>,
    output: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    if let Some(value) = target {
        let address = parse_target(&value)?;
        let timeout_ms = config
            .target
            .as_ref()
            .map_or(default_timeout_ms(), |t| t.timeout_ms);
        config.target = Some(TargetSettings {
            host: address.host,
            port: address.port,
            timeout_ms,
        });
    }
    if let Some(iterations) = iterations {
        config.fuzzer.max_iterations = Some(iterations);
    }
    let target = config
        .target
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No target configured; set [target] or pass --target"))?;
    let output_dir = output.unwrap_or_else(|| config.output.dir.clone());

    let learned = ProtocolStructure::load_json(structure_path)?;
    let mut structure = InjectedStructure::from_structure(&learned);
    config.injection.apply(&mut structure)?;
    if structure.variable_indices().is_empty() {
        warn!("Structure has no variable blocks; every message will be identical");
    }

    let rng = match config.fuzzer.seed {
        Some(seed) => SharedRng::from_seed(seed),
        None => SharedRng::from_entropy(),
    };
    std::fs::create_dir_all(&output_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create output dir {output_dir:?}: {e}"))?;
    let address = target.address();
    let transmitter = TcpTransmitter::new(address.clone(), target.timeout());
    let settings = config.fuzzer.fuzz_settings(&address);
    let deadline = config
        .fuzzer
        .max_duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let mut handle = spawn_fuzzing(
        &structure,
        transmitter,
        rng,
        settings,
        Recordings::in_dir(&output_dir),
    )?;
    watch(&mut handle, "Messages", deadline)?;

    let outcome = handle.join();
    let state = outcome.state();
    let failure = match &outcome {
        ProcessOutcome::Failed(e, _) => Some(format!("{e:#}")),
        _ => None,
    };
    let report = outcome
        .into_value()
        .ok_or_else(|| anyhow::anyhow!("Fuzzing ended {state:?} without a report"))?;

    let started = report
        .started_at
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    println!("Target:     {}", report.target);
    println!("State:      {:?}", report.state);
    println!("Started:    {started} (unix)");
    println!("Duration:   {:.2?}", report.duration);
    println!("Messages:   {} ({} attempts)", report.messages, report.attempts);
    println!("Crashes:    {}", report.crashes);
    println!("Downtime:   {:.2?}", report.downtime);

    let index = report.recordings.persist(&output_dir)?;
    println!("Recordings: {} in {:?}", index.len(), output_dir);

    match failure {
        Some(message) => anyhow::bail!("Fuzzing failed: {message}"),
        None => Ok(()),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    setup_logger(cli.verbose);
    let config = load_config(cli.config_file)?;

    match cli.command {
        Command::Learn { captures, out } => run_learn(&config, captures, &out),
        Command::Show { structure, json } => run_show(&structure, json),
        Command::Fuzz {
            structure,
            target,
            iterations,
            output,
        } => run_fuzz(config, &structure, target, iterations, output),
    }
}
