//! `grr-play`: the CLI harness that revives one or more snapshotted
//! processes, runs them to completion (or until interrupted) under
//! `grr-scheduler`, and persists whatever the run produced — the code
//! cache/index, path coverage, and captured stdout — back to disk.
//!
//! Grounded on the teacher's `linux-user` binary entry point for overall
//! shape (parse args, build the engine, run it, report the outcome), with
//! the flag set taken verbatim from the external interface this harness
//! implements (`--snapshot_dir`, `--persist_dir`, `--num_exe`, ...).

mod mutate;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use grr_dispatch::Dispatcher;
use grr_scheduler::{ProcessSlot, RoundOutcome, Scheduler};
use grr_snapshot::{FileCoverageSink, Snapshot};
use grr_syscall::InputTape;

#[derive(Parser, Debug)]
#[command(name = "grr-play", about = "Run one or more snapshotted DECREE processes")]
struct Cli {
    /// Directory holding `{exe_num}.snapshot` for each process to revive.
    #[arg(long)]
    snapshot_dir: PathBuf,

    /// Directory the code cache/index persist to across runs. Without
    /// this, every run starts with a cold, in-memory cache.
    #[arg(long)]
    persist_dir: Option<PathBuf>,

    /// How many processes to revive, numbered `0..num_exe`.
    #[arg(long, default_value_t = 1)]
    num_exe: usize,

    /// File the shared input tape is read from; every revived process's
    /// `receive` calls draw from an independent copy of it.
    #[arg(long)]
    input: PathBuf,

    /// Directory captured stdout/stderr and the final coverage file (if
    /// not overridden by `--output_coverage_file`) are written under.
    #[arg(long)]
    output_dir: PathBuf,

    /// Name of a built-in input transform (see `mutate.rs`) applied to the
    /// whole input tape once before the run starts.
    #[arg(long)]
    input_mutator: Option<String>,

    /// Enable path-coverage recording for this run.
    #[arg(long)]
    path_coverage: bool,

    /// Prior coverage file to load and keep accumulating into.
    #[arg(long)]
    coverage_file: Option<PathBuf>,

    /// Where to write coverage at the end of the run; defaults to
    /// `--coverage_file` if given.
    #[arg(long)]
    output_coverage_file: Option<PathBuf>,

    /// Disables hot-patching a direct jump/fall-through block's `JMP rel32`
    /// onto its successor once the successor is indexed, so every block
    /// keeps round-tripping through the dispatcher instead of chaining.
    #[arg(long)]
    disable_patching: bool,

    #[arg(long)]
    disable_tracing: bool,

    #[arg(long)]
    disable_inline_cache: bool,

    #[arg(long)]
    max_instructions_per_block: Option<usize>,

    /// Accepted for CLI compatibility; this port does not yet implement
    /// the original's live auto-snapshot-on-Nth-`receive`-byte behavior
    /// (see DESIGN.md's `grr-play` entry).
    #[arg(long)]
    snapshot_before_input_byte: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("creating --output_dir {}", cli.output_dir.display()))?;

    let mut input_bytes = std::fs::read(&cli.input)
        .with_context(|| format!("reading --input {}", cli.input.display()))?;
    if let Some(name) = &cli.input_mutator {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        mutate::apply(name, &mut input_bytes, seed);
    }

    let mut dispatcher = match &cli.persist_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating --persist_dir {}", dir.display()))?;
            Dispatcher::new_persistent(dir).context("opening persistent code cache")?
        }
        None => Dispatcher::new().context("building in-memory code cache")?,
    };
    if let Some(max) = cli.max_instructions_per_block {
        dispatcher.set_max_instructions_per_block(max);
    }
    if cli.disable_tracing {
        dispatcher.set_tracing_enabled(false);
    }
    if cli.disable_inline_cache {
        dispatcher.set_inline_cache_enabled(false);
    }
    if cli.disable_patching {
        dispatcher.set_patching_enabled(false);
    }

    if cli.path_coverage {
        let sink = match &cli.coverage_file {
            Some(path) => FileCoverageSink::load(path).context("loading --coverage_file")?,
            None => FileCoverageSink::new(),
        };
        dispatcher.set_coverage_sink(Box::new(sink));
    }

    let stdout_path = cli.output_dir.join("stdout.log");
    let stdout = BufWriter::new(
        File::create(&stdout_path).with_context(|| format!("creating {}", stdout_path.display()))?,
    );

    let mut scheduler = Scheduler::new(dispatcher, stdout);
    for exe_num in 0..cli.num_exe {
        let snapshot_path = cli.snapshot_dir.join(format!("{exe_num}.snapshot"));
        let snapshot = Snapshot::read_from_file(&snapshot_path)
            .with_context(|| format!("reading snapshot {}", snapshot_path.display()))?;
        let process = snapshot
            .revive(exe_num as i32)
            .with_context(|| format!("reviving process {exe_num}"))?;
        scheduler.add_process(ProcessSlot::new(process, InputTape::new(input_bytes.clone())));
    }

    let outcome = scheduler.run();
    match outcome {
        RoundOutcome::AllDone => log::info!("every process reached a terminal state"),
        RoundOutcome::Interrupted(sig) => log::info!("run interrupted by signal {sig}"),
        RoundOutcome::NoProgress => log::warn!("run ended: no process made progress this round"),
    }

    if let Some(sink) = scheduler
        .dispatcher_mut()
        .coverage_sink_mut()
        .and_then(|s| s.as_any_mut().downcast_mut::<FileCoverageSink>())
    {
        log::info!("{} new coverage paths this run", sink.new_path_count());
        match &cli.output_coverage_file {
            Some(path) => sink.save(path).context("writing --output_coverage_file")?,
            None => {
                if !sink.save_to_loaded_path().context("writing coverage file")? {
                    log::warn!("--path_coverage set with no --coverage_file/--output_coverage_file; coverage not saved");
                }
            }
        }
    }

    if let Some(dir) = &cli.persist_dir {
        scheduler
            .dispatcher_mut()
            .save_persistent(dir)
            .context("saving persistent code cache index")?;
    }

    Ok(())
}
