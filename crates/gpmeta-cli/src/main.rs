use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::to_writer_pretty;

use gpmeta_core::{
    run_geocode_pass, DuplicateMode, GeocodeOptions, NominatimClient, ProcessOptions,
    ThrottledProgress,
};

#[derive(Parser)]
#[command(
    name = "gpmeta",
    version,
    about = "Merge Google Photos sidecar metadata into EXIF and enrich GPS with place names"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum DuplicateArg {
    /// Keep every copy (logged, nothing discarded unless byte-identical)
    KeepAll,
    /// Keep the copy with the latest modification time
    KeepNewest,
    /// Keep the largest copy
    KeepLargest,
}

impl From<DuplicateArg> for DuplicateMode {
    fn from(arg: DuplicateArg) -> Self {
        match arg {
            DuplicateArg::KeepAll => DuplicateMode::KeepAll,
            DuplicateArg::KeepNewest => DuplicateMode::KeepNewest,
            DuplicateArg::KeepLargest => DuplicateMode::KeepLargest,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Merge sidecar timestamps, GPS and descriptions into media files
    Merge {
        /// Extracted Google Photos export directory
        source: PathBuf,

        /// Output directory; omit to rewrite files in place
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Prefix output names with the capture date (YYYY-MM-DD_)
        #[arg(long)]
        rename: bool,

        /// Snapshot originals to <file>.bak before in-place modification
        #[arg(long)]
        backups: bool,

        /// Leave filesystem timestamps untouched
        #[arg(long)]
        keep_file_times: bool,

        /// Resolution policy for same-named files found in several folders
        #[arg(long, value_enum, default_value = "keep-all")]
        duplicates: DuplicateArg,

        /// Export the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Reverse-geocode embedded GPS coordinates into place names
    Geocode {
        /// Directory of processed media files
        root: PathBuf,

        /// Coordinate-to-place cache store, reused across runs
        #[arg(long, default_value = "geocode-cache.json")]
        cache: PathBuf,

        /// Write resolved place names back into the files
        #[arg(long)]
        write: bool,

        /// Skip .bak snapshots when writing back
        #[arg(long)]
        no_backups: bool,

        /// Minimum seconds between lookup requests
        #[arg(long, default_value_t = 1.0)]
        interval: f64,

        /// Export the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn progress_bar() -> anyhow::Result<ProgressBar> {
    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::with_template(
        "{msg:>8} [{bar:40.cyan/blue}] {pos}/{len}",
    )?);
    Ok(bar)
}

fn export_report<T: serde::Serialize>(path: &Path, report: &T) -> anyhow::Result<()> {
    let file = File::create(path)?;
    to_writer_pretty(BufWriter::new(file), report)?;
    eprintln!("Report written to {}", path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let t_total = std::time::Instant::now();

    match cli.command {
        Command::Merge {
            source,
            output,
            rename,
            backups,
            keep_file_times,
            duplicates,
            report,
        } => {
            let options = ProcessOptions {
                source,
                output,
                rename,
                backups,
                update_file_times: !keep_file_times,
                duplicate_policy: duplicates.into(),
            };

            let bar = progress_bar()?;
            let bar_cb = bar.clone();
            let result = gpmeta_core::process(&options, &move |stage, current, total, _msg| {
                bar_cb.set_length(total.max(1));
                bar_cb.set_position(current);
                bar_cb.set_message(stage.to_string());
            })?;
            bar.finish_and_clear();

            eprintln!(
                "Done! {} files: {} merged, {} copied, {} videos, {} thumbnails, {} errors ({:.2}s)",
                result.total_files,
                result.merged,
                result.copied,
                result.video_copied,
                result.thumbnail_copied,
                result.errored,
                t_total.elapsed().as_secs_f64()
            );
            if result.duplicate_groups > 0 {
                eprintln!(
                    "Duplicates: {} group(s), {} copie(s) discarded",
                    result.duplicate_groups, result.duplicate_copies_discarded
                );
            }
            for rec in result.records.iter() {
                if let gpmeta_core::Outcome::Errored(reason) = &rec.outcome {
                    eprintln!("  error: {}: {}", rec.source.display(), reason);
                }
            }

            if let Some(path) = report {
                export_report(&path, &result)?;
            }
        }
        Command::Geocode {
            root,
            cache,
            write,
            no_backups,
            interval,
            report,
        } => {
            let mut options = GeocodeOptions::new(root, cache);
            options.write_back = write;
            options.backups = !no_backups;
            options.min_interval = Duration::from_secs_f64(interval.max(0.0));

            let client = NominatimClient::new()
                .map_err(|e| anyhow::anyhow!("geocoding client setup failed: {e}"))?;

            let bar = progress_bar()?;
            let bar_cb = bar.clone();
            let callback = move |stage: &str, current: u64, total: u64, _msg: &str| {
                bar_cb.set_length(total.max(1));
                bar_cb.set_position(current);
                bar_cb.set_message(stage.to_string());
            };
            let progress = ThrottledProgress::new(&callback);
            let result = run_geocode_pass(&options, &client, &progress)?;
            bar.finish_and_clear();

            eprintln!(
                "Done! {} files scanned, {} with GPS: {} cached, {} pre-existing, {} resolved, {} unresolved ({:.2}s)",
                result.files_scanned,
                result.files_with_gps,
                result.cache_hits,
                result.pre_existing,
                result.network_resolved,
                result.unresolved,
                t_total.elapsed().as_secs_f64()
            );
            if write {
                eprintln!("Place names written to {} file(s)", result.files_written);
            }

            if let Some(path) = report {
                export_report(&path, &result)?;
            }
        }
    }

    Ok(())
}
