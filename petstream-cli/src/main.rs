//! petstream CLI: inspect and decode PET raw acquisitions.
#![allow(clippy::cast_precision_loss, clippy::uninlined_format_args)]

use clap::{Parser, Subcommand, ValueEnum};
use petstream_core::CLOCKS_PER_FRAME;
use petstream_io::{HitFormat, RawHitWriter, RawReader, ReaderOptions, StepReport};
use petstream_raw::{AcquisitionConfig, TimeReference};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    PetstreamIo(#[from] petstream_io::Error),

    #[error("Configuration error: {0}")]
    Raw(#[from] petstream_raw::Error),
}

/// Time reference selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Reference {
    /// Relative to the synchronization epoch
    Sync,
    /// Relative to the file creation time
    Wall,
    /// Relative to the first frame of each step
    Step,
}

impl From<Reference> for TimeReference {
    fn from(reference: Reference) -> Self {
        match reference {
            Reference::Sync => TimeReference::Sync,
            Reference::Wall => TimeReference::Wall,
            Reference::Step => TimeReference::Step,
        }
    }
}

/// Output format selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    /// Comma-separated text
    Csv,
    /// Fixed-size little-endian records
    Binary,
}

/// Reader and decoder for PET front-end acquisitions.
#[derive(Parser)]
#[command(name = "petstream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header fields and steps of an acquisition
    Info {
        /// Acquisition prefix (without .rawf/.idxf)
        prefix: PathBuf,

        /// Acquisition configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the step index of an acquisition
    Steps {
        /// Acquisition prefix (without .rawf/.idxf)
        prefix: PathBuf,
    },

    /// Decode every step into a hit file
    Decode {
        /// Acquisition prefix (without .rawf/.idxf)
        prefix: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Output format; inferred from the output extension when omitted
        #[arg(short, long, value_enum)]
        format: Option<Format>,

        /// Acquisition configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Time reference; overrides the configuration file
        #[arg(short, long, value_enum)]
        time_reference: Option<Reference>,

        /// Events per decoder buffer
        #[arg(long)]
        buffer_capacity: Option<usize>,

        /// Number of decoder threads
        #[arg(long)]
        threads: Option<usize>,

        /// Bounded queue depth between pipeline threads
        #[arg(long, default_value = "4")]
        queue_depth: usize,
    },
}

fn load_config(path: Option<&Path>) -> Result<AcquisitionConfig> {
    Ok(match path {
        Some(path) => {
            log::info!("Loading acquisition configuration from {}", path.display());
            AcquisitionConfig::from_file(path)?
        }
        None => AcquisitionConfig::default(),
    })
}

fn print_report(index: usize, values: (f32, f32), report: &StepReport) {
    println!(
        "Step {:>4} ({}, {}): {} frames ({} lost, {} skipped), {} events, {} hits, {} decode errors",
        index,
        values.0,
        values.1,
        report.frames,
        report.frames_lost,
        report.skipped_frames,
        report.events,
        report.hits,
        report.decode_errors
    );
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { prefix, config } => {
            let config = load_config(config.as_deref())?;
            let reader = RawReader::open(&prefix, config, ReaderOptions::default())?;
            let header = reader.header();
            let frame_us = CLOCKS_PER_FRAME as f64 / f64::from(header.frequency.max(1)) * 1e6;

            println!("Data file: {}", reader.data_path().display());
            println!("Frequency: {} Hz", reader.frequency());
            println!("Frame length: {} clocks ({:.3} us)", CLOCKS_PER_FRAME, frame_us);
            println!("Sync epoch: {:.6}", reader.sync_epoch());
            match reader.trigger_id() {
                Some(id) => println!("Trigger id: {}", id),
                None => println!("Trigger id: none"),
            }
            println!("File creation DAQ time: {}", header.file_creation_daq_time);
            println!("Channel limit: {}", reader.channel_modes().limit());
            println!(
                "Default mode: {}",
                if header.default_mode.is_qdc() { "QDC" } else { "TOT" }
            );
            println!(
                "QDC channels: {}, any TOT: {}",
                reader.channel_modes().qdc_channel_count(),
                reader.is_tot()
            );
            println!("Time reference: {}", reader.time_reference());
            println!(
                "Index: {}{}",
                reader.steps().len(),
                if reader.index_is_temp() { " step(s) (rebuilt)" } else { " step(s)" }
            );
            for (i, step) in reader.steps().iter().enumerate() {
                println!(
                    "  {:>4}: bytes {}..{}  frames {}..{}  values ({}, {})",
                    i, step.begin, step.end, step.first_frame, step.end_frame, step.value1, step.value2
                );
            }
        }

        Commands::Steps { prefix } => {
            let reader = RawReader::open_default(&prefix)?;
            for step in reader.steps() {
                println!("{}", step);
            }
        }

        Commands::Decode {
            prefix,
            output,
            format,
            config,
            time_reference,
            buffer_capacity,
            threads,
            queue_depth,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(reference) = time_reference {
                config = config.with_time_reference(reference.into());
            }

            let mut options = ReaderOptions::default().try_with_queue_depth(queue_depth)?;
            if let Some(capacity) = buffer_capacity {
                options = options.try_with_buffer_capacity(capacity)?;
            }
            if let Some(threads) = threads {
                options = options.try_with_parallelism(threads)?;
            }

            let format = match format {
                Some(Format::Csv) => HitFormat::Csv,
                Some(Format::Binary) => HitFormat::Binary,
                None => HitFormat::from_path(&output),
            };

            let start = Instant::now();
            let mut reader = RawReader::open(&prefix, config, options)?;
            if reader.index_is_temp() {
                eprintln!("Index file missing; decoding the whole file as one step");
            }
            let mut writer = RawHitWriter::create(&output, format)?;

            let mut total = StepReport::default();
            let mut index = 0;
            while reader.next_step()? {
                let values = reader.step_values().unwrap_or_default();
                let report = reader.process_step(&mut writer)?;
                print_report(index, values, &report);
                total.frames += report.frames;
                total.events += report.events;
                total.hits += report.hits;
                total.decode_errors += report.decode_errors;
                index += 1;
            }
            let written = writer.close()?;

            println!(
                "Decoded {} step(s) in {:.2}s",
                index,
                start.elapsed().as_secs_f64()
            );
            println!("Total frames: {}", total.frames);
            println!("Total events: {}", total.events);
            println!("Total hits: {} ({} written to {})", total.hits, written, output.display());
            println!("Total decode errors: {}", total.decode_errors);
        }
    }

    Ok(())
}
