#![cfg(unix)]

use std::net::Shutdown;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use fdpay_lend::{
    connect, BufferMeta, ClientConnection, ClientListener, ControlDispatcher, FdMemory, FdRegistry,
    LendError, MediaBuffer, PayloadProducer, PipelineEvents, Role, TmpfileAllocator, UPSTREAM_ID,
};
use fdpay_transport::FdStream;
use fdpay_wire::{EnvelopeConfig, FrameError, RefreshKind};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/fdpay-it-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn pair(client_id: &str) -> (ClientConnection, ClientConnection) {
    let config = EnvelopeConfig {
        read_timeout: Some(Duration::from_secs(5)),
        ..EnvelopeConfig::default()
    };
    let (producer_end, consumer_end) = FdStream::pair().expect("socket pair should open");
    (
        ClientConnection::from_stream(client_id, producer_end, config.clone())
            .expect("producer end should wrap"),
        ClientConnection::from_stream(UPSTREAM_ID, consumer_end, config)
            .expect("consumer end should wrap"),
    )
}

#[derive(Default)]
struct Keyframes(Mutex<Vec<(i64, bool)>>);

impl PipelineEvents for Keyframes {
    fn request_keyframe(&self, timestamp: i64, all_headers: bool) {
        self.0.lock().unwrap().push((timestamp, all_headers));
    }

    fn format_changed(&self, _format: &str) {}
}

#[test]
fn consumer_drop_returns_lends_to_producer() {
    let registry = Arc::new(FdRegistry::new());
    let producer = PayloadProducer::new(Arc::clone(&registry));
    let producer_control = ControlDispatcher::new(Arc::clone(&registry), Role::RawSource);
    let (mut to_client, mut to_producer) = pair("client-1");

    let pool = Arc::new(
        TmpfileAllocator::new()
            .create_file(8)
            .expect("pool should allocate"),
    );
    let pooled = FdMemory::pooled(Arc::clone(&pool), 0, 8);
    pooled.write_at(0, b"zerocopy").unwrap();

    let buffers = vec![
        MediaBuffer::with_memory(
            pooled,
            BufferMeta {
                pts: Some(10),
                offset: Some(0),
                ..BufferMeta::default()
            },
        ),
        MediaBuffer::with_memory(
            Bytes::from_static(b"copied"),
            BufferMeta {
                pts: Some(20),
                offset: Some(1),
                ..BufferMeta::default()
            },
        ),
    ];
    for buffer in buffers {
        let outgoing = producer.payload(buffer).expect("payload should build");
        to_client.send(outgoing.wire()).expect("send should succeed");
        producer.buffer_sent(to_client.id(), &outgoing);
    }
    assert_eq!(registry.len(), 2);
    assert_eq!(Arc::strong_count(&pool), 3);

    let consumer = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
        .with_upstream(to_producer.sink().clone());
    let first = consumer.receive(to_producer.recv().expect("first buffer"));
    let second = consumer.receive(to_producer.recv().expect("second buffer"));
    assert_eq!(first.header().map(|h| h.sequence), Some(0));
    assert_eq!(second.header().map(|h| h.timestamp), Some(20));
    assert_eq!(first.read_region(0).unwrap(), b"zerocopy");
    assert_eq!(second.read_region(0).unwrap(), b"copied");

    drop(first);
    let message = to_client.recv().expect("release should arrive");
    let report = producer_control.handle_control(to_client.id(), &message);
    assert_eq!(report.released, 1);
    assert_eq!(Arc::strong_count(&pool), 1);

    drop(second);
    let message = to_client.recv().expect("release should arrive");
    let report = producer_control.handle_control(to_client.id(), &message);
    assert_eq!(report.released, 1);
    assert!(registry.is_empty());
}

#[test]
fn refresh_request_reaches_raw_source() {
    let registry = Arc::new(FdRegistry::new());
    let keyframes = Arc::new(Keyframes::default());
    let producer_control =
        ControlDispatcher::new(registry, Role::RawSource).with_events(keyframes.clone());
    let (mut to_client, to_producer) = pair("client-7");

    let consumer = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
        .with_upstream(to_producer.sink().clone());
    consumer
        .request_refresh(1234, RefreshKind::Keyframe)
        .expect("refresh should send");

    let message = to_client.recv().expect("refresh should arrive");
    let report = producer_control.handle_control(to_client.id(), &message);
    assert_eq!(report.keyframe_requests, 1);
    assert_eq!(*keyframes.0.lock().unwrap(), vec![(1234, true)]);
}

#[test]
fn relay_returns_upstream_lend_after_downstream_release() {
    // producer -> relay -> viewer
    let producer_registry = Arc::new(FdRegistry::new());
    let producer = PayloadProducer::new(Arc::clone(&producer_registry));
    let producer_control = ControlDispatcher::new(Arc::clone(&producer_registry), Role::RawSource);
    let (mut producer_to_relay, mut relay_from_producer) = pair("relay");

    let relay = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::Relay)
        .with_upstream(relay_from_producer.sink().clone());
    let (mut relay_to_viewer, mut viewer_from_relay) = pair("viewer");

    let outgoing = producer
        .payload(MediaBuffer::with_memory(
            Bytes::from_static(b"relayed"),
            BufferMeta::default(),
        ))
        .unwrap();
    producer_to_relay.send(outgoing.wire()).unwrap();
    producer.buffer_sent(producer_to_relay.id(), &outgoing);
    drop(outgoing);

    let received = relay.receive(relay_from_producer.recv().unwrap());
    relay_to_viewer.send(&received.to_wire().unwrap()).unwrap();
    relay.relay_sent(relay_to_viewer.id(), &received);
    drop(received);
    assert_eq!(producer_registry.len(), 1);

    let viewer = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
        .with_upstream(viewer_from_relay.sink().clone());
    let shown = viewer.receive(viewer_from_relay.recv().unwrap());
    assert_eq!(shown.read_region(0).unwrap(), b"relayed");
    drop(shown);

    let message = relay_to_viewer.recv().unwrap();
    let report = relay.handle_control(relay_to_viewer.id(), &message);
    assert_eq!(report.released, 1);

    let message = producer_to_relay.recv().unwrap();
    let report = producer_control.handle_control(producer_to_relay.id(), &message);
    assert_eq!(report.released, 1);
    assert!(producer_registry.is_empty());
}

#[test]
fn disconnect_cleanup_drops_client_lends() {
    let dir = unique_temp_dir("disconnect");
    let sock_path = dir.join("producer.sock");
    let listener = ClientListener::bind(&sock_path).expect("listener should bind");
    let registry = Arc::new(FdRegistry::new());

    let server_registry = Arc::clone(&registry);
    let server = thread::spawn(move || {
        let producer = PayloadProducer::new(Arc::clone(&server_registry));
        let control = ControlDispatcher::new(Arc::clone(&server_registry), Role::RawSource);
        let mut client = listener.accept().expect("accept should succeed");
        for chunk in [b"one".as_slice(), b"two".as_slice()] {
            let outgoing = producer
                .payload(MediaBuffer::with_memory(
                    Bytes::copy_from_slice(chunk),
                    BufferMeta::default(),
                ))
                .unwrap();
            client.send(outgoing.wire()).unwrap();
            producer.buffer_sent(client.id(), &outgoing);
        }
        let held = server_registry.len();
        while let Ok(message) = client.recv() {
            control.handle_control(client.id(), &message);
        }
        let dropped = server_registry.remove_client(client.id());
        (held, dropped)
    });

    let mut upstream = connect(&sock_path, EnvelopeConfig::default()).expect("should connect");
    let consumer = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
        .with_upstream(upstream.sink().clone());
    let first = consumer.receive(upstream.recv().unwrap());
    assert_eq!(first.read_region(0).unwrap(), b"one");
    first.release_now();
    // The second buffer is never handed to the dispatcher, so it is never
    // released before the consumer disconnects.
    let unreleased = upstream.recv().unwrap();
    assert_eq!(unreleased.fds().len(), 1);
    drop(first);
    drop(consumer);
    drop(upstream);

    let (held, dropped) = server.join().expect("server thread should finish");
    assert_eq!(held, 2);
    assert_eq!(dropped, 1);
    assert!(registry.is_empty());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn lending_keeps_flowing_while_releases_stream_back() {
    // Far more messages each way than a socket buffer holds.
    const BUFFERS: usize = 5000;

    let registry = Arc::new(FdRegistry::new());
    let producer = PayloadProducer::new(Arc::clone(&registry));
    let producer_control = Arc::new(ControlDispatcher::new(Arc::clone(&registry), Role::RawSource));
    let (to_client, mut to_producer) = pair("client-1");
    let (client_id, mut producer_reader, producer_sink) = to_client.into_split();

    let control_thread = {
        let producer_control = Arc::clone(&producer_control);
        let client_id = client_id.clone();
        thread::spawn(move || {
            let mut released = 0;
            while let Ok(message) = producer_reader.read_message() {
                released += producer_control.handle_control(&client_id, &message).released;
            }
            released
        })
    };

    let pool = Arc::new(
        TmpfileAllocator::new()
            .create_file(BUFFERS as u64)
            .expect("pool should allocate"),
    );
    let lender = thread::spawn(move || {
        for index in 0..BUFFERS {
            let memory = FdMemory::pooled(Arc::clone(&pool), index as u64, 1);
            let outgoing = producer
                .payload(MediaBuffer::with_memory(memory, BufferMeta::default()))
                .expect("payload should build");
            producer.buffer_sent(&client_id, &outgoing);
            producer_sink
                .send(outgoing.wire())
                .expect("send should not stall behind releases");
        }
        producer_sink
            .shutdown(Shutdown::Write)
            .expect("write shutdown should succeed");
    });

    let consumer = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
        .with_upstream(to_producer.sink().clone());
    let mut received = 0;
    loop {
        match to_producer.recv() {
            Ok(message) => {
                drop(consumer.receive(message));
                received += 1;
            }
            Err(LendError::Frame(FrameError::ConnectionClosed)) => break,
            Err(err) => panic!("receive failed: {err}"),
        }
    }
    // Closing the consumer end stops the producer's control reader.
    drop(consumer);
    drop(to_producer);

    lender.join().expect("lender should finish");
    let released = control_thread.join().expect("control reader should finish");
    assert_eq!(received, BUFFERS);
    assert_eq!(released, BUFFERS);
    assert!(registry.is_empty());
}
