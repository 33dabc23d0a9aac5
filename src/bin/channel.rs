//! Channel service binary.
//!
//! Starts a set of buffered channels, mints reader/writer endpoints under
//! the requested sturdy-ref tokens, and serves until every channel has been
//! closed. Endpoint sturdy refs are printed on stdout when requested, and a
//! `StartupInfo` message can be streamed to a peer's wiring channel.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use uuid::Uuid;

use weir::channel::{ChannelService, StartupInfo};
use weir::msg::Msg;
use weir::ports::ConnectionManager;
use weir::restorer::MemRestorer;
use weir::telemetry;

#[derive(Parser, Debug)]
#[command(
    name = "weir-channel",
    version,
    about = "Service offering buffered FBP channels"
)]
struct Args {
    /// Number of channels to start.
    #[arg(
        short = '#',
        long = "no_of_channels",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    no_of_channels: u32,

    /// Buffer capacity per channel.
    #[arg(
        short = 'b',
        long = "buffer_size",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    buffer_size: u64,

    /// Number of reader/writer pairs to create per channel.
    #[arg(
        short = 'c',
        long = "create",
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(1..)
    )]
    create: u8,

    /// Readers per channel (overrides --create for the reader side).
    #[arg(
        short = 'R',
        long = "no_of_readers",
        value_parser = clap::value_parser!(u8).range(1..)
    )]
    no_of_readers: Option<u8>,

    /// Writers per channel (overrides --create for the writer side).
    #[arg(
        short = 'W',
        long = "no_of_writers",
        value_parser = clap::value_parser!(u8).range(1..)
    )]
    no_of_writers: Option<u8>,

    /// Reader sturdy-ref tokens: comma-separated within a channel, channels
    /// separated by '+'. Missing tokens are generated.
    #[arg(short = 'r', long = "reader_srts")]
    reader_srts: Option<String>,

    /// Writer sturdy-ref tokens, same shape as --reader_srts.
    #[arg(short = 'w', long = "writer_srts")]
    writer_srts: Option<String>,

    /// Exit this many seconds after the last channel closed.
    #[arg(
        short = 't',
        long = "exit_timeout",
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    exit_timeout: u64,

    /// Print the sturdy refs of all started endpoints on stdout.
    #[arg(long = "output_sturdy_refs", action = ArgAction::SetTrue)]
    output_sturdy_refs: bool,

    /// Stream a StartupInfo message to this writer sturdy ref.
    #[arg(long = "startup_info_writer_srt")]
    startup_info_writer_srt: Option<String>,

    /// Channel name.
    #[arg(long, default_value = "Channel")]
    name: String,

    /// Channel description.
    #[arg(long, default_value = "Service to offer multiple channels.")]
    description: String,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    telemetry::init(args.verbose);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> weir::Result<()> {
    let readers_per_channel = args.no_of_readers.unwrap_or(args.create) as usize;
    let writers_per_channel = args.no_of_writers.unwrap_or(args.create) as usize;
    let channels = args.no_of_channels as usize;

    let reader_srts = fill_srt_lists(
        parse_srt_lists(args.reader_srts.as_deref()),
        channels,
        readers_per_channel,
    );
    let writer_srts = fill_srt_lists(
        parse_srt_lists(args.writer_srts.as_deref()),
        channels,
        writers_per_channel,
    );

    let restorer = Arc::new(MemRestorer::new(Uuid::new_v4().to_string()));
    let conman = ConnectionManager::new(restorer.clone());
    let service = ChannelService::spawn(restorer, Duration::from_secs(args.exit_timeout));
    tracing::info!(channels, "starting channel service");

    for c in 0..channels {
        let channel = service.create_channel(&args.name, &args.description, args.buffer_size as usize)?;
        let channel_saved = channel.save()?;
        if args.output_sturdy_refs {
            println!("channelSR={}", channel_saved.sturdy_ref);
        }

        let mut reader_srs = Vec::with_capacity(readers_per_channel);
        for token in &reader_srts[c] {
            let reader = channel.reader()?;
            let saved = reader.save_as(Some(token))?;
            if args.output_sturdy_refs {
                println!("\treaderSR={}", saved.sturdy_ref);
            }
            reader_srs.push(saved.sturdy_ref.to_string());
        }

        let mut writer_srs = Vec::with_capacity(writers_per_channel);
        for token in &writer_srts[c] {
            let writer = channel.writer()?;
            let saved = writer.save_as(Some(token))?;
            if args.output_sturdy_refs {
                println!("\twriterSR={}", saved.sturdy_ref);
            }
            writer_srs.push(saved.sturdy_ref.to_string());
        }

        if let Some(srt) = &args.startup_info_writer_srt {
            let info = StartupInfo {
                buffer_size: args.buffer_size as usize,
                channel_sr: channel_saved.sturdy_ref.to_string(),
                reader_srs,
                writer_srs,
            };
            send_startup_info(&conman, srt, &info);
        }
    }

    // SIGINT/SIGTERM close every channel; the loop then sweeps and exits.
    let term = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, term.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, term.clone());
    let closer = service.closer();
    std::thread::spawn(move || loop {
        if term.load(Ordering::Relaxed) {
            tracing::info!("shutdown signal received, closing channels");
            let _ = closer.close_all();
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    });

    service.join();
    tracing::info!("channel service stopped");
    Ok(())
}

fn send_startup_info(conman: &ConnectionManager, srt: &str, info: &StartupInfo) {
    let payload = match serde_json::to_vec(info) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(%err, "cannot serialize startup info");
            return;
        }
    };
    match conman.connect_writer(srt) {
        Ok(writer) => {
            if let Err(err) = writer.write(Msg::value(payload)) {
                tracing::warn!(%err, "failed to stream startup info");
            }
        }
        Err(err) => tracing::warn!(%err, "cannot open startup info channel"),
    }
}

/// `a,b+c` parses to `[[a, b], [c]]`; empty segments are dropped so they get
/// auto-generated tokens later.
fn parse_srt_lists(spec: Option<&str>) -> Vec<Vec<String>> {
    let Some(spec) = spec else {
        return Vec::new();
    };
    spec.split('+')
        .map(|per_channel| {
            per_channel
                .split(',')
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect()
        })
        .collect()
}

/// Pad the parsed lists to `channels` lists of `per_channel` tokens,
/// generating UUIDs for the missing entries.
fn fill_srt_lists(
    mut lists: Vec<Vec<String>>,
    channels: usize,
    per_channel: usize,
) -> Vec<Vec<String>> {
    lists.resize_with(channels, Vec::new);
    for list in &mut lists {
        while list.len() < per_channel {
            list.push(Uuid::new_v4().to_string());
        }
    }
    lists
}
