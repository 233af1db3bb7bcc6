//! avpipe command line
//!
//! Runs one transcode, probe or mux against files on disk. Outputs are
//! written under `output.root` from the configuration file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use avpipe::{Avpipe, AvpipeConfig, OutputFormat, TxParams};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "avpipe", version, about = "Audio/video transcoding pipeline")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "avpipe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcode an input into a packaged output
    Transcode {
        url: String,
        /// Parameter file, `.json` or TOML
        #[arg(short, long)]
        params: PathBuf,
        /// Override the output format from the parameter file
        #[arg(short, long)]
        format: Option<OutputFormat>,
    },
    /// Describe the streams of an input
    Probe {
        url: String,
        #[arg(long)]
        seekable: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Concatenate and interleave the inputs listed in a mux spec
    Mux {
        url: String,
        #[arg(short, long)]
        params: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, config_error) = if cli.config.exists() {
        match AvpipeConfig::from_file(&cli.config) {
            Ok(config) => (config, None),
            Err(e) => (AvpipeConfig::default(), Some(e)),
        }
    } else {
        (AvpipeConfig::default(), None)
    };

    init_logging(&config);
    if let Some(e) = config_error {
        tracing::warn!(
            "Failed to load config file {}: {}. Using defaults.",
            cli.config.display(),
            e
        );
    }
    tracing::info!("avpipe v{} ({})", VERSION, avpipe::version_info());

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(status = e.status(), "{}", e);
            eprintln!("avpipe: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, config: AvpipeConfig) -> avpipe::Result<()> {
    let pipe = Avpipe::new(config)?;
    avpipe::install_log_filter();

    match command {
        Command::Transcode {
            url,
            params,
            format,
        } => {
            let mut params = TxParams::from_file(&params)?;
            if let Some(format) = format {
                params.format = format;
            }
            let handle = pipe.tx_init(&params, &url)?;
            let stats = pipe.tx_run(handle)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&stats).unwrap_or_else(|_| format!("{:?}", stats))
            );
        }
        Command::Probe {
            url,
            seekable,
            json,
        } => {
            let info = pipe.probe(&url, seekable)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&info).unwrap_or_else(|_| format!("{:?}", info))
                );
            } else {
                println!(
                    "{} {:.3}s, {} streams",
                    info.container.format_name,
                    info.container.duration,
                    info.streams.len()
                );
                for s in &info.streams {
                    println!(
                        "  #{} {} {} tb={} {}x{} {}Hz",
                        s.stream_index,
                        s.codec_type,
                        s.codec_name,
                        s.time_base,
                        s.width,
                        s.height,
                        s.sample_rate
                    );
                }
            }
        }
        Command::Mux { url, params } => {
            let params = TxParams::from_file(&params)?;
            let stats = pipe.mux(&params, &url)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&stats).unwrap_or_else(|_| format!("{:?}", stats))
            );
        }
    }
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(config: &AvpipeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("avpipe={},ffmpeg=warn", config.logging.level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
