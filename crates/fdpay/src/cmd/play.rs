use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fdpay_lend::{connect, ControlDispatcher, FdRegistry, ReceivedBuffer, Role};
use fdpay_wire::{EnvelopeConfig, FrameError, RefreshKind};

use crate::cmd::{install_ctrlc_handler, PlayArgs};
use crate::exit::{frame_error, lend_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{content_preview, print_received, OutputFormat, ReceivedOutput, RegionOutput};

pub fn run(args: PlayArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = EnvelopeConfig {
        read_timeout: Some(timeout),
        write_timeout: Some(timeout),
        ..EnvelopeConfig::default()
    };
    let connection = connect(&args.path, config).map_err(|err| lend_error("connect failed", err))?;
    let (_, mut reader, sink) = connection.into_split();
    // Received buffers release through this dispatcher's upstream sink.
    let dispatcher = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
        .with_upstream(sink);

    if args.refresh {
        dispatcher
            .request_refresh(0, RefreshKind::Keyframe)
            .map_err(|err| lend_error("refresh request failed", err))?;
    }

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut played = 0usize;
    let mut index = 0usize;
    while running.load(Ordering::SeqCst) {
        let message = match reader.read_message() {
            Ok(message) => message,
            Err(FrameError::ConnectionClosed) => break,
            Err(err) => return Err(frame_error("receive failed", err)),
        };
        let received = dispatcher.receive(message);
        print_received(&describe(index, &received), format);
        index += 1;

        if received.regions().is_empty() {
            continue;
        }
        // Dropping the buffer sends its release packets upstream.
        drop(received);
        played = played.saturating_add(1);
        if args.count.is_some_and(|count| played >= count) {
            break;
        }
    }

    Ok(SUCCESS)
}

fn describe(index: usize, received: &ReceivedBuffer) -> ReceivedOutput {
    let regions = received
        .regions()
        .iter()
        .map(|region| RegionOutput {
            lend_id: region.lend_id(),
            offset: region.offset(),
            size: region.size(),
            preview: match region.read() {
                Ok(content) => content_preview(&content),
                Err(err) => format!("<unreadable: {err}>"),
            },
        })
        .collect();
    ReceivedOutput {
        index,
        sequence: received.header().map(|h| h.sequence),
        timestamp: received.header().map(|h| h.timestamp),
        regions,
        formats: received.formats().to_vec(),
        error: received.malformed().map(ToString::to_string),
    }
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
