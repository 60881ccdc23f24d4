use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use fdpay_lend::{
    BufferMeta, ClientConnection, ClientListener, ConnectionSink, ControlDispatcher, FdMemory,
    FdRegistry, MediaBuffer, PayloadProducer, PipelineEvents, ProducerConfig, Role,
    TmpfileAllocator,
};
use fdpay_transport::FdStream;
use fdpay_wire::{FrameError, MessageReader};
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, ServeArgs};
use crate::exit::{io_error, lend_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_client_summary, ClientSummary, OutputFormat};

/// Presentation interval between consecutive chunks (30 per second).
const CHUNK_DURATION_NS: i64 = 1_000_000_000 / 30;

/// How often the accept loop rechecks the Ctrl-C flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

struct LogEvents;

impl PipelineEvents for LogEvents {
    fn request_keyframe(&self, timestamp: i64, all_headers: bool) {
        info!(timestamp, all_headers, "keyframe requested");
    }

    fn format_changed(&self, format: &str) {
        info!(format, "client announced format");
    }
}

struct Session {
    producer: PayloadProducer,
    control: ControlDispatcher,
    buffers: Vec<MediaBuffer>,
    content_format: String,
    format: OutputFormat,
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    if args.chunk_size == 0 {
        return Err(CliError::new(USAGE, "--chunk-size must be greater than zero"));
    }
    let content = std::fs::read(&args.file).map_err(|err| io_error("read input failed", err))?;
    let buffers = chunk_buffers(&content, args.chunk_size, args.zero_copy)
        .map_err(|err| io_error("allocate shared memory failed", err))?;

    let registry = Arc::new(FdRegistry::new());
    let session = Arc::new(Session {
        producer: PayloadProducer::new(Arc::clone(&registry)).with_config(ProducerConfig {
            base_time: args.base_time,
            ..ProducerConfig::default()
        }),
        control: ControlDispatcher::new(Arc::clone(&registry), Role::RawSource)
            .with_events(Arc::new(LogEvents)),
        buffers,
        content_format: args.content_format.clone(),
        format,
    });

    let listener =
        ClientListener::bind(&args.path).map_err(|err| lend_error("bind failed", err))?;
    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut workers = Vec::new();
    while running.load(Ordering::SeqCst) {
        let Some(client) = listener
            .accept_timeout(ACCEPT_POLL)
            .map_err(|err| lend_error("accept failed", err))?
        else {
            continue;
        };
        let session = Arc::clone(&session);
        workers.push(thread::spawn(move || serve_client(&session, client)));

        if args.clients.is_some_and(|limit| workers.len() >= limit) {
            break;
        }
    }

    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "client session failed"),
            Err(_) => warn!("client session panicked"),
        }
    }
    Ok(SUCCESS)
}

/// Split `content` into buffers of at most `chunk_size` bytes.
///
/// With `zero_copy` every chunk is a pooled region of one shared file;
/// otherwise each chunk is heap memory the producer copies per send.
fn chunk_buffers(
    content: &[u8],
    chunk_size: usize,
    zero_copy: bool,
) -> std::io::Result<Vec<MediaBuffer>> {
    let pool = if zero_copy {
        let file = TmpfileAllocator::new().create_file(content.len() as u64)?;
        let pool = Arc::new(file);
        FdMemory::pooled(Arc::clone(&pool), 0, content.len() as u64).write_at(0, content)?;
        Some(pool)
    } else {
        None
    };

    let mut buffers = Vec::new();
    for (index, chunk) in content.chunks(chunk_size).enumerate() {
        let meta = BufferMeta {
            pts: Some(index as i64 * CHUNK_DURATION_NS),
            dts: None,
            duration: Some(CHUNK_DURATION_NS),
            offset: Some(index as u64),
            offset_end: Some(index as u64 + 1),
        };
        let buffer = match &pool {
            Some(pool) => MediaBuffer::with_memory(
                FdMemory::pooled(
                    Arc::clone(pool),
                    (index * chunk_size) as u64,
                    chunk.len() as u64,
                ),
                meta,
            ),
            None => MediaBuffer::with_memory(Bytes::copy_from_slice(chunk), meta),
        };
        buffers.push(buffer);
    }
    Ok(buffers)
}

#[derive(Debug, Default)]
struct ControlTotals {
    released: usize,
    unknown_releases: usize,
    keyframe_requests: usize,
}

/// Lend every buffer to one client while its control messages are applied
/// on a second thread, so releases never back up behind the sends.
fn serve_client(session: &Arc<Session>, client: ClientConnection) -> CliResult<()> {
    let (id, reader, sink) = client.into_split();
    let control = {
        let session = Arc::clone(session);
        let id = id.clone();
        thread::Builder::new()
            .name(format!("{id}-control"))
            .spawn(move || apply_control(&session, &id, reader))
            .map_err(|err| io_error("spawn control reader failed", err))?
    };

    let mut summary = ClientSummary {
        client: id.clone(),
        ..ClientSummary::default()
    };
    let result = lend_buffers(session, &id, &sink, &mut summary);
    // End of stream tells the client to finish; after a failure also wake
    // the control reader.
    let how = if result.is_ok() {
        Shutdown::Write
    } else {
        Shutdown::Both
    };
    if let Err(err) = sink.shutdown(how) {
        warn!(client = %id, error = %err, "socket shutdown failed");
    }

    match control.join() {
        Ok(totals) => {
            summary.released = totals.released;
            summary.unknown_releases = totals.unknown_releases;
            summary.keyframe_requests = totals.keyframe_requests;
        }
        Err(_) => warn!(client = %id, "control reader panicked"),
    }

    // Lends the client never returned die with its connection.
    summary.dropped_on_disconnect = session.producer.registry().remove_client(&id);
    info!(client = %id, dropped = summary.dropped_on_disconnect, "client disconnected");
    print_client_summary(&summary, session.format);
    result
}

fn lend_buffers(
    session: &Session,
    id: &str,
    sink: &ConnectionSink,
    summary: &mut ClientSummary,
) -> CliResult<()> {
    let announce = session
        .producer
        .format_change(&session.content_format)
        .map_err(|err| lend_error("format change failed", err))?;
    sink.send(&announce)
        .map_err(|err| lend_error("send failed", err))?;

    for buffer in &session.buffers {
        let outgoing = session
            .producer
            .payload(buffer.clone())
            .map_err(|err| lend_error("payload failed", err))?;
        // Recorded before sending: the client may release before the send
        // call even returns.
        session.producer.buffer_sent(id, &outgoing);
        if let Err(err) = sink.send(outgoing.wire()) {
            session.producer.registry().remove(id, outgoing.lend_id());
            return Err(lend_error("send failed", err));
        }
        summary.buffers_sent += 1;
    }
    Ok(())
}

fn apply_control(session: &Session, id: &str, mut reader: MessageReader<FdStream>) -> ControlTotals {
    let mut totals = ControlTotals::default();
    loop {
        let message = match reader.read_message() {
            Ok(message) => message,
            Err(FrameError::ConnectionClosed) => return totals,
            Err(err) => {
                warn!(client = id, error = %err, "control read failed");
                return totals;
            }
        };
        let report = session.control.handle_control(id, &message);
        totals.released += report.released + report.decremented;
        totals.unknown_releases += report.unknown;
        totals.keyframe_requests += report.keyframe_requests;
    }
}
