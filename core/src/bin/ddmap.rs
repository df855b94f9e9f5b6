//! `ddmap`: command-line front end for delay-Doppler post-processing of
//! UAV channel measurements.
//!
//! ```text
//! ddmap info  -c 1_sinwave_channel.h5 -t 1_sinwave_target.h5
//! ddmap frame -c 1_sinwave_channel.h5 --start 5000 --window 200 --filter-clutter
//! ddmap sweep -c 1_sinwave_channel.h5 --window 100 --hop 500
//! ddmap view  -c 1_sinwave_channel.h5 -t 1_sinwave_target.h5   # needs the `gui` feature
//! ddmap fetch -s 1_sinwave --output-dir data
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use num_complex::Complex32;

use ddmap_core::acquire::{AcquireOptions, Acquirer, ChecksumManifest, CHECKSUM_FILE};
use ddmap_core::{
    AntennaPair, ChannelDataset, DelayDopplerEngine, DelayDopplerFrame, MeasurementParams, ViewerConfig,
};

const PASSWORD_ENV: &str = "DDMAP_PASSWORD";

#[derive(Parser, Debug)]
#[command(
    name = "ddmap",
    version,
    about = "Delay-Doppler maps from UAV channel measurements"
)]
struct Cli {
    /// JSON file with session settings; command-line flags take precedence.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct DataArgs {
    /// Channel file (`*_channel.h5`).
    #[arg(short = 'c', long = "channel", value_name = "FILE")]
    channel: PathBuf,

    /// Target file with the UAV trajectory (`*_target.h5`).
    #[arg(short = 't', long = "target", value_name = "FILE")]
    target: Option<PathBuf>,
}

impl DataArgs {
    fn load(&self) -> Result<ChannelDataset> {
        ChannelDataset::load(&self.channel, self.target.as_deref())
            .with_context(|| format!("failed to load {}", self.channel.display()))
    }
}

#[derive(Args, Debug)]
struct WindowArgs {
    /// Slow-time window length in samples.
    #[arg(short = 'w', long)]
    window: Option<usize>,

    /// Suppress static paths with a first-order difference along slow time.
    #[arg(long)]
    filter_clutter: bool,

    /// Zero-padding factor for both map axes.
    #[arg(long)]
    upsample: Option<usize>,

    /// Number of delay bins to keep (before upsampling).
    #[arg(long)]
    delay_bins: Option<usize>,
}

impl WindowArgs {
    fn apply(&self, config: &mut ViewerConfig) {
        if let Some(window) = self.window {
            config.window_len = window;
        }
        if self.filter_clutter {
            config.filter_clutter = true;
        }
        if let Some(up) = self.upsample {
            config.upsample_factor = up;
        }
        if let Some(bins) = self.delay_bins {
            config.transform.delay_bins = Some(bins);
        }
    }
}

#[derive(Args, Debug)]
struct AntennaArgs {
    /// Tx port, 1-based.
    #[arg(long, default_value_t = 1)]
    tx: usize,

    /// Rx port, 1-based.
    #[arg(long, default_value_t = 1)]
    rx: usize,
}

impl AntennaArgs {
    fn pair(&self) -> Result<AntennaPair> {
        one_based_pair(self.tx, self.rx)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a summary of a scenario.
    Info {
        #[command(flatten)]
        data: DataArgs,
    },

    /// Print the magnitude of one snapshot as (subcarrier, sample).
    Slice {
        #[command(flatten)]
        data: DataArgs,

        /// Snapshot number, 1-based.
        #[arg(short = 's', long)]
        snapshot: usize,

        /// Tx port, 1-based.
        tx: usize,

        /// Rx port, 1-based.
        rx: usize,

        /// Snapshot length in samples.
        #[arg(short = 'w', long)]
        window: Option<usize>,
    },

    /// Compute one delay-Doppler map.
    Frame {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        window: WindowArgs,

        #[command(flatten)]
        antennas: AntennaArgs,

        /// First sample of the window.
        #[arg(long, default_value_t = 0)]
        start: usize,

        /// Write the frame as JSON instead of a summary; bins below the
        /// display floor are written as the floor.
        #[arg(long)]
        json: bool,
    },

    /// Compute maps over the whole scenario.
    Sweep {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        window: WindowArgs,

        #[command(flatten)]
        antennas: AntennaArgs,

        /// Samples between window starts; defaults to the window length.
        #[arg(long)]
        hop: Option<usize>,
    },

    /// Open the interactive viewer.
    #[cfg(feature = "gui")]
    View {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        window: WindowArgs,
    },

    /// Download, decrypt, unpack and verify published scenarios.
    Fetch {
        /// Scenarios to fetch; all listed in the checksum file if omitted.
        #[arg(short = 's', long = "scenario", num_args = 1..)]
        scenarios: Vec<String>,

        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        /// Checksum manifest; defaults to `./scenarios.checksum`.
        #[arg(long, value_name = "FILE")]
        shasum_file: Option<PathBuf>,

        /// Keep the downloaded and decrypted archives.
        #[arg(long, visible_alias = "nc")]
        no_cleanup: bool,

        /// Skip the SHA-256 check of the unpacked files.
        #[arg(long, visible_alias = "ns")]
        no_shasum: bool,

        /// Redo every step even if its output exists.
        #[arg(short = 'o', long)]
        overwrite: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ViewerConfig::from_json_file(path)?,
        None => ViewerConfig::default(),
    };

    match cli.command {
        Command::Info { data } => {
            println!("{}", data.load()?);
        }

        Command::Slice {
            data,
            snapshot,
            tx,
            rx,
            window,
        } => {
            if let Some(window) = window {
                config.window_len = window;
            }
            print_slice(&data.load()?, snapshot, one_based_pair(tx, rx)?, config.window_len)?;
        }

        Command::Frame {
            data,
            window,
            antennas,
            start,
            json,
        } => {
            window.apply(&mut config);
            let dataset = data.load()?;
            let engine = DelayDopplerEngine::new(config.transform);
            let scale = dataset.has_trajectory().then(|| dataset.position_scale());
            let mut frame = engine
                .frame(&dataset, antennas.pair()?, &config.window_at(start), scale.as_ref())
                .context("failed to compute the delay-Doppler map")?;

            if json {
                frame.clamp_floor(config.display.floor_db);
                let stdout = io::stdout();
                serde_json::to_writer(stdout.lock(), &frame)?;
                println!();
            } else {
                print_frame(&frame, &config.transform.measurement);
            }
        }

        Command::Sweep {
            data,
            window,
            antennas,
            hop,
        } => {
            window.apply(&mut config);
            let dataset = data.load()?;
            let engine = DelayDopplerEngine::new(config.transform);
            let hop = hop.unwrap_or(config.window_len);
            let frames = engine
                .sweep(&dataset, antennas.pair()?, &config.window_at(0), hop)
                .context("sweep failed")?;

            println!(
                "{:>8} {:>6} {:>6} {:>8} {:>12} {:>12}",
                "start", "row", "col", "peak dB", "delay/us", "doppler/Hz"
            );
            for frame in &frames {
                let (row, col, db) = frame.peak().unwrap_or((0, 0, f32::NEG_INFINITY));
                println!(
                    "{:>8} {:>6} {:>6} {:>8.2} {:>12.4} {:>12.2}",
                    frame.window.start_index,
                    row,
                    col,
                    db,
                    frame.marker.delay_us(),
                    frame.marker.doppler_hz,
                );
            }
        }

        #[cfg(feature = "gui")]
        Command::View { data, window } => {
            window.apply(&mut config);
            let dataset = data.load()?;
            ddmap_core::gui::run(dataset, config).map_err(|e| anyhow::anyhow!("viewer failed: {}", e))?;
        }

        Command::Fetch {
            scenarios,
            output_dir,
            shasum_file,
            no_cleanup,
            no_shasum,
            overwrite,
        } => {
            let shasum_file = shasum_file.unwrap_or_else(|| PathBuf::from(CHECKSUM_FILE));
            if !shasum_file.exists() {
                bail!(
                    "no checksum file at {}; use --shasum-file to point at `{}`",
                    shasum_file.display(),
                    CHECKSUM_FILE
                );
            }
            let manifest = ChecksumManifest::from_file(&shasum_file)?;
            let scenarios = if scenarios.is_empty() {
                manifest.scenarios()
            } else {
                scenarios
            };
            if no_shasum {
                warn!("SHA-256 verification disabled");
            }

            let options = AcquireOptions {
                overwrite,
                verify: !no_shasum,
                cleanup: !no_cleanup,
                ..AcquireOptions::default()
            };
            let acquirer = Acquirer::new(manifest, output_dir, options);
            let password = read_password()?;
            for scenario in &scenarios {
                let path = acquirer
                    .acquire(scenario, &password)
                    .with_context(|| format!("failed to acquire scenario {}", scenario))?;
                info!("{} ready at {}", scenario, path.display());
            }
            info!("All done.");
        }
    }

    Ok(())
}

fn one_based_pair(tx: usize, rx: usize) -> Result<AntennaPair> {
    if tx == 0 || rx == 0 {
        bail!("antenna ports are numbered from 1 (got Tx {}, Rx {})", tx, rx);
    }
    Ok(AntennaPair::new(tx - 1, rx - 1))
}

fn print_slice(dataset: &ChannelDataset, snapshot: usize, antennas: AntennaPair, window_len: usize) -> Result<()> {
    if snapshot == 0 {
        bail!("snapshots are numbered from 1");
    }
    let start = (snapshot - 1) * window_len;
    let sample = dataset.sample_window(antennas, start, window_len, false)?;

    println!(
        "snapshot {} (samples {}..{}), Tx {} / Rx {}: H as (subcarrier, sample)",
        snapshot,
        start,
        start + window_len,
        antennas.tx + 1,
        antennas.rx + 1,
    );
    for subcarrier in sample.channel.columns() {
        let line: Vec<String> = subcarrier.iter().map(format_complex).collect();
        println!("{}", line.join(" "));
    }
    Ok(())
}

fn print_frame(frame: &DelayDopplerFrame, measurement: &MeasurementParams) {
    let (rows, cols) = frame.shape();
    let w = &frame.window;
    println!(
        "window   start={} length={} clutter={} upsample={}",
        w.start_index, w.length, w.filter_clutter, w.upsample_factor
    );
    println!("shape    {} Doppler x {} delay bins", rows, cols);
    match frame.peak() {
        Some((row, col, db)) => {
            let doppler = (row as f64 - frame.zero_doppler_row() as f64) / rows as f64
                * measurement.doppler_span_hz();
            println!("peak     row={} col={} {:.2} dB ({:.2} Hz)", row, col, db, doppler);
        }
        None => println!("peak     none (empty map)"),
    }
    println!(
        "marker   delay={:.4} us doppler={:.2} Hz at row={:.2} col={:.2}",
        frame.marker.delay_us(),
        frame.marker.doppler_hz,
        frame.marker_px.row,
        frame.marker_px.col,
    );
    if let Some([x, y]) = frame.target_position {
        println!("target   x={:.3} y={:.3} (normalised)", x, y);
    }
}

fn format_complex(h: &Complex32) -> String {
    format!("{:.4}{:+.4}j", h.re, h.im)
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    eprint!("Please enter the password to decrypt the files: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read the password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_values_keep_both_parts() {
        assert_eq!(format_complex(&Complex32::new(0.5, -0.25)), "0.5000-0.2500j");
        assert_eq!(format_complex(&Complex32::new(-1.0, 2.0)), "-1.0000+2.0000j");
    }

    #[test]
    fn antenna_numbers_start_at_one() {
        let pair = one_based_pair(2, 1).unwrap();
        assert_eq!((pair.tx, pair.rx), (1, 0));
        assert!(one_based_pair(0, 1).is_err());
    }
}
