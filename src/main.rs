//! diskferry - sparse-aware disk image transfer client
//!
//! Subcommands mirror the transfer workflow: upload/download move image
//! content through an imageio endpoint, info/measure/checksum inspect
//! images locally.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use diskferry::checksum::Algorithm;
use diskferry::logger::{Logger, NoopLogger, TextLogger};
use diskferry::progress::{JsonLines, ProgressSink, TextBar};
use diskferry::{default_connections, DownloadOptions, UploadOptions};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sparse-aware disk image transfer client")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// CA bundle for verifying https endpoints
    #[arg(long = "ca-file", global = true)]
    ca_file: Option<PathBuf>,

    /// Write timestamped log lines to file
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,

    /// Progress output style
    #[arg(long, value_enum, default_value = "text", global = true)]
    progress: ProgressStyle,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ProgressStyle {
    Text,
    Json,
    None,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local image to a transfer URL
    Upload {
        image: PathBuf,
        transfer_url: String,

        /// Retry through this proxy URL if the transfer URL is unreachable
        #[arg(long = "proxy-url")]
        proxy_url: Option<String>,

        /// Upload this member of a tar/OVA archive instead of the file itself
        #[arg(long)]
        member: Option<String>,

        /// Include data from the image's backing chain
        #[arg(long = "backing-chain", default_value_t = true, action = clap::ArgAction::Set)]
        backing_chain: bool,

        /// Transfer only allocated extents
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        sparse: bool,

        /// Parallel connections to the endpoint
        #[arg(short = 'n', long, default_value_t = default_connections())]
        connections: u32,
    },

    /// Download an image from a transfer URL into a local file
    Download {
        transfer_url: String,
        output: PathBuf,

        /// Local storage format of the downloaded image
        #[arg(short = 'f', long, default_value = "raw")]
        fmt: String,

        #[arg(long = "proxy-url")]
        proxy_url: Option<String>,

        #[arg(short = 'n', long, default_value_t = default_connections())]
        connections: u32,
    },

    /// Print format and virtual size of an image as JSON
    Info {
        image: PathBuf,

        #[arg(long)]
        member: Option<String>,
    },

    /// Print the space needed to convert an image to another format
    Measure {
        image: PathBuf,

        /// Output format to measure for
        #[arg(short = 'O', long = "output-format", default_value = "raw")]
        output_format: String,

        #[arg(long)]
        member: Option<String>,
    },

    /// Print a block checksum of an image's logical content
    Checksum {
        image: PathBuf,

        #[arg(long)]
        member: Option<String>,

        /// Checksum block size in bytes
        #[arg(long = "block-size", default_value_t = 4 * 1024 * 1024)]
        block_size: usize,

        #[arg(long, default_value = "sha1")]
        algorithm: Algorithm,

        /// Digest size in bytes, for algorithms with a variable digest
        #[arg(long = "digest-size")]
        digest_size: Option<usize>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Choose logger once; NoopLogger keeps the hot path free of I/O.
    let logger: Arc<dyn Logger> = if let Some(ref p) = args.log_file {
        Arc::new(TextLogger::new(p).context("cannot open log file")?)
    } else {
        Arc::new(NoopLogger)
    };

    let sink = |style: ProgressStyle| -> Option<Box<dyn ProgressSink>> {
        match style {
            ProgressStyle::Text => Some(Box::new(TextBar::new())),
            ProgressStyle::Json => Some(Box::new(JsonLines::stdout())),
            ProgressStyle::None => None,
        }
    };

    match args.command {
        Command::Upload {
            image,
            transfer_url,
            proxy_url,
            member,
            backing_chain,
            sparse,
            connections,
        } => {
            diskferry::upload(
                &image,
                &transfer_url,
                args.ca_file.as_deref(),
                UploadOptions {
                    proxy_url,
                    member,
                    backing_chain,
                    sparse,
                    connections,
                    progress: sink(args.progress),
                    logger: Some(logger),
                },
            )?;
        }

        Command::Download {
            transfer_url,
            output,
            fmt,
            proxy_url,
            connections,
        } => {
            diskferry::download(
                &transfer_url,
                &output,
                args.ca_file.as_deref(),
                DownloadOptions {
                    fmt,
                    proxy_url,
                    connections,
                    progress: sink(args.progress),
                    logger: Some(logger),
                },
            )?;
        }

        Command::Info { image, member } => {
            let details = diskferry::info(&image, member.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }

        Command::Measure {
            image,
            output_format,
            member,
        } => {
            let details = diskferry::measure(&image, &output_format, member.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }

        Command::Checksum {
            image,
            member,
            block_size,
            algorithm,
            digest_size,
        } => {
            let digest = diskferry::image_checksum(
                &image,
                member.as_deref(),
                block_size,
                algorithm,
                digest_size,
            )?;
            println!("{digest}");
        }
    }

    Ok(())
}
