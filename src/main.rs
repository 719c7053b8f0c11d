//! CLI Entry Point for seaflow-opp
//!
//! Provides command-line interface for:
//! - Filtering EVT files into OPP files plus database summaries
//! - Counting events from file headers
//! - Validating EVT/OPP file contents
//! - Sampling random rows across a cruise
//!
//! # Usage
//!
//! Filter a cruise:
//! ```bash
//! seaflow-opp filter --cruise testcruise --db testcruise.db -o oppdir testcruise/
//! ```
//!
//! Count events:
//! ```bash
//! seaflow-opp count testcruise/2014_185
//! ```
//!
//! Sample 10,000 rows from half of the files:
//! ```bash
//! seaflow-opp sample -o sample.gz -c 10000 -f 0.5 --seed 1 testcruise/
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use seaflow_opp::batch::BatchOrchestrator;
use seaflow_opp::config::{OppConfig, DEFAULT_CONFIG_PATH};
use seaflow_opp::db::Repository;
use seaflow_opp::evt::{decode_file, expand_file_list, read_row_count, write_file, SeaflowFile};
use seaflow_opp::logging;
use seaflow_opp::sample::{sample, select_evt_files, SampleOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "seaflow-opp")]
#[command(about = "SeaFlow EVT particle filtering", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Gate EVT files and store OPP output and summaries
    Filter {
        /// EVT files or directories searched recursively
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Cruise name
        #[arg(short, long)]
        cruise: Option<String>,

        /// SQLite database file
        #[arg(short, long)]
        db: Option<PathBuf>,

        /// Output directory for OPP files
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Number of files processed concurrently
        #[arg(short = 'p', long)]
        workers: Option<usize>,

        /// Alignment band half-width
        #[arg(long)]
        width: Option<f64>,

        /// Notch line shift
        #[arg(long)]
        offset: Option<f64>,

        /// D1 notch slope
        #[arg(long)]
        notch1: Option<f64>,

        /// D2 notch slope
        #[arg(long)]
        notch2: Option<f64>,

        /// D2 - D1 correction
        #[arg(long, allow_hyphen_values = true)]
        origin: Option<f64>,
    },

    /// Report event counts from file headers
    Count {
        /// Don't print column headers
        #[arg(short = 'H', long)]
        no_header: bool,

        /// EVT/OPP files or directories
        files: Vec<PathBuf>,
    },

    /// Fully decode EVT/OPP files and report problems
    Validate {
        /// Show every file, not only failures
        #[arg(short, long)]
        all: bool,

        /// EVT/OPP files or directories
        files: Vec<PathBuf>,
    },

    /// Write a random subset of EVT rows drawn from a fraction of the files
    Sample {
        /// Output file; a ".gz" extension gzips it
        #[arg(short, long)]
        outfile: PathBuf,

        /// Rows to keep, before noise filtering
        #[arg(short, long, default_value_t = 100_000)]
        count: usize,

        /// Fraction of files to sample from, in (0, 1]
        #[arg(short, long, default_value_t = 0.1)]
        file_fraction: f64,

        /// Minimum chl_small value
        #[arg(long, default_value_t = 0)]
        min_chl: u16,

        /// Minimum fsc_small value
        #[arg(long, default_value_t = 0)]
        min_fsc: u16,

        /// Minimum pe value
        #[arg(long, default_value_t = 0)]
        min_pe: u16,

        /// Earliest file timestamp (RFC 3339)
        #[arg(long)]
        min_date: Option<DateTime<Utc>>,

        /// Latest file timestamp (RFC 3339)
        #[arg(long)]
        max_date: Option<DateTime<Utc>>,

        /// Drop noise rows after sampling
        #[arg(short, long)]
        noise_filter: bool,

        /// PRNG seed
        #[arg(short, long)]
        seed: Option<u32>,

        /// EVT files or directories
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = OppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Filter {
            files,
            cruise,
            db,
            output_dir,
            workers,
            width,
            offset,
            notch1,
            notch2,
            origin,
        } => {
            if let Some(cruise) = cruise {
                config.batch.cruise = cruise;
            }
            if let Some(db) = db {
                config.storage.db_path = db;
            }
            if let Some(dir) = output_dir {
                config.batch.output_dir = dir;
            }
            if let Some(n) = workers {
                config.batch.workers = n;
            }
            if let Some(width) = width {
                config.filter.width = width;
            }
            if let Some(offset) = offset {
                config.filter.offset = offset;
            }
            config.filter.notch1 = notch1.or(config.filter.notch1);
            config.filter.notch2 = notch2.or(config.filter.notch2);
            config.filter.origin = origin.or(config.filter.origin);
            run_filter(config, files).await
        }
        Commands::Count { no_header, files } => {
            count_files(no_header, &files, &mut std::io::stdout().lock())
        }
        Commands::Validate { all, files } => validate_files(all, &files),
        Commands::Sample {
            outfile,
            count,
            file_fraction,
            min_chl,
            min_fsc,
            min_pe,
            min_date,
            max_date,
            noise_filter,
            seed,
            files,
        } => {
            let options = SampleOptions {
                count,
                file_fraction,
                min_fsc,
                min_pe,
                min_chl,
                filter_noise: noise_filter,
                seed: seed.map(u64::from),
            };
            sample_files(&outfile, &options, &files, min_date, max_date)
        }
    }
}

async fn run_filter(config: OppConfig, inputs: Vec<PathBuf>) -> Result<()> {
    config.validate().map_err(anyhow::Error::msg)?;

    let files: Vec<PathBuf> = expand_file_list(&inputs)?
        .into_iter()
        .filter(|p| SeaflowFile::parse(p).map_or(true, |f| !f.is_opp()))
        .collect();
    if files.is_empty() {
        bail!("no EVT files found");
    }

    let repo = Repository::open(&config.storage.db_path, config.storage.storage_config())?;
    let orchestrator = BatchOrchestrator::new(repo, config.batch_config());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight files");
            let _ = cancel_tx.send(true);
        }
    });

    let report = orchestrator.run(files, cancel_rx).await?;

    for failure in &report.failed {
        eprintln!("{}\t{}", failure.path.display(), failure.error);
    }
    eprintln!(
        "{}/{} files filtered (filter id {}){}",
        report.succeeded.len(),
        report.processed(),
        report.filter_id,
        if report.cancelled { ", cancelled" } else { "" }
    );
    Ok(())
}

fn describe(path: &Path) -> (String, &'static str) {
    match SeaflowFile::parse(path) {
        Ok(f) if f.is_opp() => (f.file_id(), "opp"),
        Ok(f) => (f.file_id(), "evt"),
        Err(_) => ("-".to_string(), "-"),
    }
}

fn count_files(no_header: bool, inputs: &[PathBuf], out: &mut impl Write) -> Result<()> {
    if inputs.is_empty() {
        return Ok(());
    }
    let mut header_printed = no_header;
    for path in expand_file_list(inputs)? {
        if !header_printed {
            writeln!(out, "path\tfile_id\ttype\tevents")?;
            header_printed = true;
        }
        let (file_id, kind) = describe(&path);
        let events = read_row_count(&path).unwrap_or(0);
        writeln!(out, "{}\t{}\t{}\t{}", path.display(), file_id, kind, events)?;
    }
    Ok(())
}

fn validate_files(all: bool, inputs: &[PathBuf]) -> Result<()> {
    if inputs.is_empty() {
        return Ok(());
    }
    let files = expand_file_list(inputs)?;
    let mut ok = 0usize;

    println!("path\tfile_id\ttype\tstatus\tevents");
    for path in &files {
        let (file_id, kind) = describe(path);
        let (status, events) = match decode_file(path) {
            Ok(data) => {
                ok += 1;
                ("OK".to_string(), data.len())
            }
            Err(e) => (e.to_string(), 0),
        };
        if all || status != "OK" {
            println!("{}\t{}\t{}\t{}\t{}", path.display(), file_id, kind, status, events);
        }
    }
    eprintln!("{}/{} files passed validation", ok, files.len());
    Ok(())
}

fn sample_files(
    outfile: &Path,
    options: &SampleOptions,
    inputs: &[PathBuf],
    min_date: Option<DateTime<Utc>>,
    max_date: Option<DateTime<Utc>>,
) -> Result<()> {
    let files = select_evt_files(expand_file_list(inputs)?, min_date, max_date);
    if files.is_empty() {
        bail!("no EVT files found");
    }
    let drawn = sample(&files, options)?;
    if drawn.events.is_empty() {
        bail!("no rows matched the sampling thresholds");
    }
    write_file(outfile, &drawn.events)
        .with_context(|| format!("could not write {}", outfile.display()))?;
    eprintln!(
        "{} rows from {} files written to {}",
        drawn.events.len(),
        drawn.files.len(),
        outfile.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use seaflow_opp::evt::ParticleEvent;

    fn counted(no_header: bool, inputs: &[PathBuf]) -> String {
        let mut out = Vec::new();
        count_files(no_header, inputs, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_count_header_only_before_first_row() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(counted(false, &[dir.path().to_path_buf()]), "");

        let day = dir.path().join("2014_185");
        std::fs::create_dir_all(&day).unwrap();
        let evt = day.join("2014-07-04T00-00-02+00-00");
        write_file(&evt, &[ParticleEvent::new([1; 10]); 3]).unwrap();

        let text = counted(false, &[dir.path().to_path_buf()]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "path\tfile_id\ttype\tevents");
        assert_eq!(
            lines[1],
            format!("{}\t2014_185/2014-07-04T00-00-02+00-00\tevt\t3", evt.display())
        );
        assert_eq!(lines.len(), 2);

        assert_eq!(counted(true, &[evt]).lines().count(), 1);
    }
}
