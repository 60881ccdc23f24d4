use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::exit::{CliError, CliResult, INTERNAL};
use crate::output::OutputFormat;

pub mod decode;
pub mod play;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Lend the chunks of a file to every client that connects.
    Serve(ServeArgs),
    /// Receive lent buffers, print them, and release them.
    Play(PlayArgs),
    /// Decode a raw wire buffer dump.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Play(args) => play::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// File whose content is lent to clients.
    #[arg(long)]
    pub file: PathBuf,
    /// Bytes per buffer.
    #[arg(long, default_value = "4096")]
    pub chunk_size: usize,
    /// Publish regions of one shared memfd instead of copying each chunk.
    #[arg(long)]
    pub zero_copy: bool,
    /// Content format announced to clients before the first buffer.
    #[arg(long, default_value = "application/octet-stream")]
    pub content_format: String,
    /// Added to every presentation timestamp (nanoseconds).
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub base_time: i64,
    /// Exit after serving N clients.
    #[arg(long)]
    pub clients: Option<usize>,
}

#[derive(Args, Debug)]
pub struct PlayArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Ask the producer for a keyframe before reading.
    #[arg(long)]
    pub refresh: bool,
    /// Exit after receiving N buffers.
    #[arg(long)]
    pub count: Option<usize>,
    /// Maximum time to wait for the next buffer (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// File holding the bytes of one wire buffer.
    pub path: PathBuf,
    /// Number of descriptors assumed to accompany the buffer.
    #[arg(long, default_value = "0")]
    pub fds: usize,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
