use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use psg_lib::{
    access::ChannelAccess,
    analysis::AhiAnalyzer,
    config::PsgConfig,
    error::{ErrorKind, ErrorReport},
    io::{edf::EdfRecording, events_tsv},
    synth::SyntheticPsg,
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

#[derive(Parser)]
#[command(
    name = "psg",
    version,
    about = "PSG: EDF channel access and apnea-hypopnea analysis"
)]
struct Cli {
    /// TOML file overriding access and analysis defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Header summary: channels, rates, duration and patient fields
    Info {
        #[arg(long)]
        file: PathBuf,
        /// Leading samples to include per channel
        #[arg(long, default_value_t = 0)]
        preview: usize,
        /// Add whole-recording statistics per channel
        #[arg(long)]
        diagnostics: bool,
    },
    /// Raw samples of one channel by sample index
    Chunk {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        channel: String,
        #[arg(long, default_value_t = 0)]
        start: usize,
        #[arg(long)]
        count: usize,
    },
    /// Bucket-mean downsampled samples of one channel by sample index
    ChunkDownsampled {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        channel: String,
        #[arg(long, default_value_t = 0)]
        start: usize,
        #[arg(long)]
        count: usize,
        #[arg(long)]
        target: usize,
    },
    /// Time-aligned downsampled window over several channels
    MultiChunk {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, value_delimiter = ',', required = true)]
        channels: Vec<String>,
        #[arg(long)]
        start_sec: f64,
        #[arg(long)]
        end_sec: f64,
        #[arg(long)]
        max_points: Option<usize>,
    },
    /// Per-channel min/max over a time range (default: to the end)
    MinMax {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, value_delimiter = ',', required = true)]
        channels: Vec<String>,
        #[arg(long, default_value_t = 0.0)]
        start_sec: f64,
        #[arg(long)]
        end_sec: Option<f64>,
    },
    /// Whole-recording statistics per channel
    Stats {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, value_delimiter = ',', required = true)]
        channels: Vec<String>,
    },
    /// Chunked apnea-hypopnea analysis
    Ahi {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "Flow")]
        flow_channel: String,
        #[arg(long, default_value = "SpO2")]
        spo2_channel: String,
        /// Worker threads (overrides the config file)
        #[arg(long)]
        workers: Option<usize>,
        /// Also write the detected events as BIDS events.tsv
        #[arg(long)]
        events_tsv: Option<PathBuf>,
    },
    /// Write a synthetic flow/SpO2 EDF with scripted events
    Synth {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 3600.0)]
        duration: f64,
        #[arg(long, default_value_t = 10.0)]
        apneas_per_hour: f64,
        #[arg(long, default_value_t = 5.0)]
        hypopneas_per_hour: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let report = ErrorReport::from_anyhow(&err);
            let body = serde_json::json!({ "error": report });
            println!("{}", body);
            eprintln!("error: {:#}", err);
            ExitCode::from(exit_code(report.kind))
        }
    }
}

fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::InvalidArgument | ErrorKind::NotFound | ErrorKind::OutOfRange => 2,
        ErrorKind::FileUnavailable => 3,
        ErrorKind::Timeout | ErrorKind::Cancelled => 4,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = PsgConfig::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Commands::Info {
            file,
            preview,
            diagnostics,
        } => {
            let access = ChannelAccess::open(&file, config.access)?;
            print_json(&access.summary(preview, diagnostics)?)
        }
        Commands::Chunk {
            file,
            channel,
            start,
            count,
        } => {
            let access = ChannelAccess::open(&file, config.access)?;
            print_json(&access.get_chunk(&channel, start, count)?)
        }
        Commands::ChunkDownsampled {
            file,
            channel,
            start,
            count,
            target,
        } => {
            let access = ChannelAccess::open(&file, config.access)?;
            print_json(&access.get_chunk_downsampled(&channel, start, count, target)?)
        }
        Commands::MultiChunk {
            file,
            channels,
            start_sec,
            end_sec,
            max_points,
        } => {
            let access = ChannelAccess::open(&file, config.access)?;
            print_json(&access.get_multi_chunk_downsampled(
                &channels, start_sec, end_sec, max_points,
            )?)
        }
        Commands::MinMax {
            file,
            channels,
            start_sec,
            end_sec,
        } => {
            let access = ChannelAccess::open(&file, config.access)?;
            print_json(&access.get_min_max(&channels, start_sec, end_sec)?)
        }
        Commands::Stats { file, channels } => {
            let access = ChannelAccess::open(&file, config.access)?;
            print_json(&access.get_full_statistics(&channels)?)
        }
        Commands::Ahi {
            file,
            flow_channel,
            spo2_channel,
            workers,
            events_tsv,
        } => cmd_ahi(
            &config,
            &file,
            &flow_channel,
            &spo2_channel,
            workers,
            events_tsv.as_deref(),
        ),
        Commands::Synth {
            out,
            duration,
            apneas_per_hour,
            hypopneas_per_hour,
            seed,
        } => cmd_synth(&out, duration, apneas_per_hour, hypopneas_per_hour, seed),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn cmd_ahi(
    config: &PsgConfig,
    file: &Path,
    flow_channel: &str,
    spo2_channel: &str,
    workers: Option<usize>,
    events_tsv: Option<&Path>,
) -> Result<()> {
    let mut analysis = config.analysis;
    if let Some(workers) = workers {
        analysis.max_workers = workers;
    }
    let recording =
        EdfRecording::open(file)?.with_stream_block(config.access.stream_block_samples);
    let result =
        AhiAnalyzer::new(analysis)?.analyze(Arc::new(recording), flow_channel, spo2_channel)?;
    if let Some(path) = events_tsv {
        events_tsv::write_events_tsv(path, &result.all_events)
            .with_context(|| format!("writing events to {}", path.display()))?;
        events_tsv::write_events_json(&path.with_extension("json"))?;
        info!("wrote {} events to {}", result.all_events.len(), path.display());
    }
    print_json(&result)
}

fn cmd_synth(
    out: &Path,
    duration: f64,
    apneas_per_hour: f64,
    hypopneas_per_hour: f64,
    seed: u64,
) -> Result<()> {
    let psg = SyntheticPsg::new(duration, seed)
        .with_event_rates(apneas_per_hour, hypopneas_per_hour)?;
    psg.write_edf(out)?;
    print_json(&serde_json::json!({
        "path": out,
        "duration_s": duration,
        "seed": seed,
        "events": psg.events,
    }))
}
