//! Applies inbound control packets and tracks buffers received from upstream.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::{Arc, Mutex, PoisonError};

use fdpay_wire::{
    FdPayload, Header, LendId, Packet, RefreshKind, RefreshRequest, ReleaseFdPayload, WireBuffer,
    WireBufferBuilder, WireError,
};
use tracing::{debug, trace, warn};

use crate::error::{LendError, Result};
use crate::memory::read_region;
use crate::registry::{FdRegistry, Removal};

/// What this endpoint does with the content it sends downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Produces content itself; refresh requests become keyframe requests.
    RawSource,
    /// Re-sends wire content received from upstream; refresh requests are
    /// forwarded there unchanged.
    Relay,
}

/// Delivers control messages to the upstream producer.
pub trait ControlSink: Send + Sync {
    fn send_control(&self, message: &WireBuffer) -> Result<()>;
}

/// Notifications surfaced to the surrounding pipeline.
pub trait PipelineEvents: Send + Sync {
    /// A client asked for a full unit at `timestamp`.
    fn request_keyframe(&self, timestamp: i64, all_headers: bool);

    /// The peer announced a new content format.
    fn format_changed(&self, format: &str);
}

/// Summary of one inbound control message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlReport {
    /// Releases that dropped the last reference.
    pub released: usize,
    /// Releases that left references behind.
    pub decremented: usize,
    /// Releases naming a lend the registry does not know.
    pub unknown: usize,
    /// Refresh requests turned into keyframe requests.
    pub keyframe_requests: usize,
    /// Refresh requests forwarded upstream.
    pub forwarded: usize,
    pub formats: Vec<String>,
    /// Packets with no meaning on the control path.
    pub ignored: usize,
    pub malformed: Option<WireError>,
}

/// Routes decoded packets to the registry, the pipeline, or upstream.
pub struct ControlDispatcher {
    registry: Arc<FdRegistry>,
    role: Role,
    upstream: Option<Arc<dyn ControlSink>>,
    events: Option<Arc<dyn PipelineEvents>>,
}

impl ControlDispatcher {
    pub fn new(registry: Arc<FdRegistry>, role: Role) -> Self {
        Self {
            registry,
            role,
            upstream: None,
            events: None,
        }
    }

    /// Attach the connection control packets go back upstream on.
    pub fn with_upstream(mut self, upstream: Arc<dyn ControlSink>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Attach the pipeline notification target.
    pub fn with_events(mut self, events: Arc<dyn PipelineEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &Arc<FdRegistry> {
        &self.registry
    }

    /// Apply a control message that arrived from `client`.
    pub fn handle_control(&self, client: &str, message: &WireBuffer) -> ControlReport {
        let mut report = ControlReport::default();
        let mut forward = Vec::new();

        for packet in message.packets() {
            let packet = match packet {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(client, error = %err, "malformed control buffer");
                    report.malformed = Some(err);
                    break;
                }
            };
            match packet {
                Packet::ReleaseFdPayload(ReleaseFdPayload { lend_id }) => {
                    match self.registry.remove(client, lend_id) {
                        Removal::Released => report.released += 1,
                        Removal::Decremented(_) => report.decremented += 1,
                        Removal::Unknown => report.unknown += 1,
                    }
                }
                Packet::RefreshRequest(request) => match self.role {
                    Role::RawSource => {
                        let all_headers = request.kind.is_keyframe();
                        debug!(client, timestamp = request.timestamp, all_headers, "keyframe requested");
                        if let Some(events) = &self.events {
                            events.request_keyframe(request.timestamp, all_headers);
                        }
                        report.keyframe_requests += 1;
                    }
                    Role::Relay => forward.push(Packet::RefreshRequest(request)),
                },
                Packet::FormatChange(change) => {
                    if let Some(events) = &self.events {
                        events.format_changed(&change.format);
                    }
                    report.formats.push(change.format);
                }
                Packet::Header(_) | Packet::FdPayload(_) => report.ignored += 1,
            }
        }

        if !forward.is_empty() {
            report.forwarded = forward.len();
            if let Err(err) = self.send_upstream(&forward) {
                warn!(client, error = %err, "failed to forward refresh requests");
            }
        }
        report
    }

    /// Take ownership of a wire buffer received from upstream.
    ///
    /// The returned buffer releases its lends upstream once, when its last
    /// clone is dropped or [`ReceivedBuffer::release_now`] is called.
    pub fn receive(&self, message: WireBuffer) -> ReceivedBuffer {
        let decoded = message.decode();
        let (_, fds) = message.into_parts();
        let files: Vec<Arc<File>> = fds.into_iter().map(|fd| Arc::new(File::from(fd))).collect();

        let mut header = None;
        let mut regions = Vec::new();
        let mut formats = Vec::new();
        for packet in decoded.packets {
            match packet {
                Packet::Header(h) => header = Some(h),
                Packet::FdPayload(payload) => {
                    // The decoder only yields payloads whose slot exists.
                    if let Some(file) = files.get(payload.fd_slot as usize) {
                        regions.push(ReceivedRegion {
                            lend_id: payload.lend_id,
                            file: Arc::clone(file),
                            offset: payload.offset,
                            size: payload.size,
                        });
                    }
                }
                Packet::FormatChange(change) => {
                    if let Some(events) = &self.events {
                        events.format_changed(&change.format);
                    }
                    formats.push(change.format);
                }
                other => trace!(packet = other.packet_type().name(), "ignored on data path"),
            }
        }
        if let Some(err) = &decoded.error {
            warn!(error = %err, regions = regions.len(), "malformed buffer from upstream");
        }

        let lend_ids = regions.iter().map(|region| region.lend_id).collect();
        ReceivedBuffer {
            header,
            regions,
            formats,
            malformed: decoded.error,
            guard: Arc::new(ReleaseGuard {
                pending: Mutex::new(Some(lend_ids)),
                upstream: self.upstream.clone(),
            }),
        }
    }

    /// Record that `client` received a re-sent copy of `buffer`.
    ///
    /// The upstream release waits until `client` releases every lend of it.
    /// Returns the number of lends registered.
    pub fn relay_sent(&self, client: &str, buffer: &ReceivedBuffer) -> usize {
        for region in &buffer.regions {
            let guard = Arc::clone(&buffer.guard);
            self.registry.add(client, region.lend_id, guard, drop);
        }
        buffer.regions.len()
    }

    /// Ask upstream for a fresh full unit.
    pub fn request_refresh(&self, timestamp: i64, kind: RefreshKind) -> Result<()> {
        self.send_upstream(&[Packet::RefreshRequest(RefreshRequest { timestamp, kind })])
    }

    fn send_upstream(&self, packets: &[Packet]) -> Result<()> {
        let upstream = self.upstream.as_ref().ok_or(LendError::NoUpstream)?;
        let message = WireBuffer::encode(None, packets, Vec::new())?;
        upstream.send_control(&message)
    }
}

impl std::fmt::Debug for ControlDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlDispatcher")
            .field("role", &self.role)
            .field("upstream", &self.upstream.is_some())
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// A lent region of a received descriptor.
#[derive(Clone)]
pub struct ReceivedRegion {
    lend_id: LendId,
    file: Arc<File>,
    offset: u64,
    size: u64,
}

impl ReceivedRegion {
    pub fn lend_id(&self) -> LendId {
        self.lend_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the region's content.
    pub fn read(&self) -> Result<Vec<u8>> {
        read_region(&self.file, self.offset, self.size).map_err(LendError::Region)
    }
}

impl AsFd for ReceivedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl std::fmt::Debug for ReceivedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedRegion")
            .field("lend_id", &self.lend_id)
            .field("fd", &self.file.as_fd())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

struct ReleaseGuard {
    pending: Mutex<Option<Vec<LendId>>>,
    upstream: Option<Arc<dyn ControlSink>>,
}

impl ReleaseGuard {
    /// Send the pending releases, at most once over the guard's life.
    fn fire(&self) -> usize {
        let Some(lend_ids) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return 0;
        };
        if lend_ids.is_empty() {
            return 0;
        }
        let Some(upstream) = &self.upstream else {
            warn!(count = lend_ids.len(), "no upstream to release lends to");
            return 0;
        };

        let packets: Vec<Packet> = lend_ids
            .iter()
            .map(|&lend_id| Packet::ReleaseFdPayload(ReleaseFdPayload { lend_id }))
            .collect();
        let sent = WireBuffer::encode(None, &packets, Vec::new())
            .map_err(LendError::from)
            .and_then(|message| upstream.send_control(&message));
        match sent {
            Ok(()) => {
                trace!(?lend_ids, "released lends upstream");
                lend_ids.len()
            }
            Err(err) => {
                warn!(?lend_ids, error = %err, "failed to release lends upstream");
                0
            }
        }
    }

    fn is_released(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

/// A buffer received from upstream whose lends are returned when it goes away.
#[derive(Clone)]
pub struct ReceivedBuffer {
    header: Option<Header>,
    regions: Vec<ReceivedRegion>,
    formats: Vec<String>,
    malformed: Option<WireError>,
    guard: Arc<ReleaseGuard>,
}

impl ReceivedBuffer {
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn regions(&self) -> &[ReceivedRegion] {
        &self.regions
    }

    pub fn formats(&self) -> &[String] {
        &self.formats
    }

    /// The buffer-level decode error, if decoding stopped early.
    pub fn malformed(&self) -> Option<&WireError> {
        self.malformed.as_ref()
    }

    pub fn lend_ids(&self) -> Vec<LendId> {
        self.regions.iter().map(ReceivedRegion::lend_id).collect()
    }

    /// Read the content of region `index`.
    pub fn read_region(&self, index: usize) -> Result<Vec<u8>> {
        let region = self.regions.get(index).ok_or_else(|| {
            LendError::Region(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no region {index}"),
            ))
        })?;
        region.read()
    }

    /// Release the lends upstream now instead of on drop.
    ///
    /// Returns the number of lends released; zero if already done.
    pub fn release_now(&self) -> usize {
        self.guard.fire()
    }

    pub fn is_released(&self) -> bool {
        self.guard.is_released()
    }

    /// Re-encode the buffer for sending downstream, duplicating descriptors.
    pub fn to_wire(&self) -> Result<WireBuffer> {
        let mut builder = WireBufferBuilder::new();
        if let Some(header) = &self.header {
            builder.add_header(header)?;
        }
        for region in &self.regions {
            let fd = region
                .file
                .as_fd()
                .try_clone_to_owned()
                .map_err(LendError::DescriptorTransfer)?;
            let fd_slot = builder.add_fd(fd);
            builder.add_packet(&Packet::FdPayload(FdPayload {
                fd_slot,
                lend_id: region.lend_id,
                offset: region.offset,
                size: region.size,
            }))?;
        }
        Ok(builder.finish()?)
    }
}

impl std::fmt::Debug for ReceivedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedBuffer")
            .field("header", &self.header)
            .field("regions", &self.regions)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::OwnedFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use fdpay_wire::FormatChange;

    use super::*;
    use crate::memory::{FdAllocator, TmpfileAllocator};

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Vec<Packet>>>,
    }

    impl RecordingSink {
        fn messages(&self) -> Vec<Vec<Packet>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ControlSink for RecordingSink {
        fn send_control(&self, message: &WireBuffer) -> Result<()> {
            let decoded = message.decode();
            assert!(decoded.is_complete());
            self.sent.lock().unwrap().push(decoded.packets);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        keyframes: Mutex<Vec<(i64, bool)>>,
        formats: Mutex<Vec<String>>,
    }

    impl PipelineEvents for RecordingEvents {
        fn request_keyframe(&self, timestamp: i64, all_headers: bool) {
            self.keyframes.lock().unwrap().push((timestamp, all_headers));
        }

        fn format_changed(&self, format: &str) {
            self.formats.lock().unwrap().push(format.to_string());
        }
    }

    fn control(packets: &[Packet]) -> WireBuffer {
        WireBuffer::encode(None, packets, Vec::new()).unwrap()
    }

    fn release(lend_id: LendId) -> Packet {
        Packet::ReleaseFdPayload(ReleaseFdPayload { lend_id })
    }

    fn refresh(timestamp: i64, kind: RefreshKind) -> Packet {
        Packet::RefreshRequest(RefreshRequest { timestamp, kind })
    }

    /// A lent buffer of two regions over one descriptor-backed file.
    fn lent_buffer(content: &[u8]) -> WireBuffer {
        let memory = TmpfileAllocator::new()
            .allocate(content.len() as u64)
            .unwrap();
        memory.write_at(0, content).unwrap();
        let fd: OwnedFd = memory.as_fd().try_clone_to_owned().unwrap();
        let half = content.len() as u64 / 2;
        WireBuffer::encode(
            Some(&Header {
                sequence: 9,
                timestamp: 100,
                ..Header::default()
            }),
            &[
                Packet::FdPayload(FdPayload {
                    fd_slot: 0,
                    lend_id: 11,
                    offset: 0,
                    size: half,
                }),
                Packet::FdPayload(FdPayload {
                    fd_slot: 0,
                    lend_id: 12,
                    offset: half,
                    size: content.len() as u64 - half,
                }),
            ],
            vec![fd],
        )
        .unwrap()
    }

    #[test]
    fn release_packets_decrement_registry() {
        let registry = Arc::new(FdRegistry::new());
        let released = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let released = Arc::clone(&released);
            registry.add("client-1", 5, (), move |()| {
                released.fetch_add(1, Ordering::SeqCst);
            });
        }
        registry.add("client-2", 5, (), |()| {});

        let dispatcher = ControlDispatcher::new(Arc::clone(&registry), Role::RawSource);
        let report =
            dispatcher.handle_control("client-1", &control(&[release(5), release(5), release(5)]));

        assert_eq!(report.decremented, 1);
        assert_eq!(report.released, 1);
        assert_eq!(report.unknown, 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(registry.refcount("client-2", 5), Some(1));
    }

    #[test]
    fn raw_source_turns_refresh_into_keyframe_request() {
        let events = Arc::new(RecordingEvents::default());
        let upstream = Arc::new(RecordingSink::default());
        let dispatcher = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
            .with_events(events.clone())
            .with_upstream(upstream.clone());

        let report = dispatcher.handle_control(
            "client-1",
            &control(&[refresh(10, RefreshKind::Keyframe), refresh(20, RefreshKind::Other(9))]),
        );

        assert_eq!(report.keyframe_requests, 2);
        assert_eq!(report.forwarded, 0);
        assert_eq!(*events.keyframes.lock().unwrap(), vec![(10, true), (20, false)]);
        assert!(upstream.messages().is_empty());
    }

    #[test]
    fn relay_forwards_refresh_unchanged_in_one_message() {
        let upstream = Arc::new(RecordingSink::default());
        let dispatcher = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::Relay)
            .with_upstream(upstream.clone());

        let packets = [refresh(10, RefreshKind::Keyframe), refresh(20, RefreshKind::Other(9))];
        let report = dispatcher.handle_control("client-1", &control(&packets));

        assert_eq!(report.forwarded, 2);
        assert_eq!(upstream.messages(), vec![packets.to_vec()]);
    }

    #[test]
    fn format_change_is_surfaced() {
        let events = Arc::new(RecordingEvents::default());
        let dispatcher = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
            .with_events(events.clone());
        let report = dispatcher.handle_control(
            "client-1",
            &control(&[Packet::FormatChange(FormatChange {
                format: "audio/x-raw".into(),
            })]),
        );
        assert_eq!(report.formats, vec!["audio/x-raw".to_string()]);
        assert_eq!(*events.formats.lock().unwrap(), vec!["audio/x-raw".to_string()]);
    }

    #[test]
    fn malformed_control_keeps_earlier_packets() {
        let registry = Arc::new(FdRegistry::new());
        registry.add("client-1", 1, (), |()| {});
        let mut bytes = control(&[release(1)]).data().to_vec();
        bytes.extend_from_slice(&[4, 4, 0]);

        let dispatcher = ControlDispatcher::new(Arc::clone(&registry), Role::RawSource);
        let report = dispatcher.handle_control("client-1", &WireBuffer::new(bytes, Vec::new()));

        assert_eq!(report.released, 1);
        assert!(matches!(report.malformed, Some(WireError::MalformedBuffer { .. })));
    }

    #[test]
    fn received_regions_are_readable() {
        let dispatcher = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource);
        let received = dispatcher.receive(lent_buffer(b"abcdef"));

        assert_eq!(received.header().map(|h| h.sequence), Some(9));
        assert_eq!(received.lend_ids(), vec![11, 12]);
        assert_eq!(received.read_region(0).unwrap(), b"abc");
        assert_eq!(received.read_region(1).unwrap(), b"def");
        assert!(received.read_region(2).is_err());
        assert!(received.malformed().is_none());
    }

    #[test]
    fn drop_releases_upstream_once() {
        let upstream = Arc::new(RecordingSink::default());
        let dispatcher = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
            .with_upstream(upstream.clone());

        let received = dispatcher.receive(lent_buffer(b"abcd"));
        let clone = received.clone();
        drop(received);
        assert!(upstream.messages().is_empty());
        drop(clone);

        assert_eq!(upstream.messages(), vec![vec![release(11), release(12)]]);
    }

    #[test]
    fn release_now_then_drop_sends_once() {
        let upstream = Arc::new(RecordingSink::default());
        let dispatcher = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
            .with_upstream(upstream.clone());

        let received = dispatcher.receive(lent_buffer(b"abcd"));
        assert_eq!(received.release_now(), 2);
        assert!(received.is_released());
        assert_eq!(received.release_now(), 0);
        drop(received);
        assert_eq!(upstream.messages().len(), 1);
    }

    #[test]
    fn concurrent_finalization_sends_once() {
        let upstream = Arc::new(RecordingSink::default());
        let dispatcher = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource)
            .with_upstream(upstream.clone());
        let received = dispatcher.receive(lent_buffer(b"abcd"));

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let copy = received.clone();
                thread::spawn(move || {
                    if i % 2 == 0 {
                        copy.release_now();
                    }
                })
            })
            .collect();
        drop(received);
        for worker in workers {
            worker.join().expect("worker should finish");
        }
        assert_eq!(upstream.messages().len(), 1);
    }

    #[test]
    fn relay_releases_upstream_after_downstream_clients() {
        let registry = Arc::new(FdRegistry::new());
        let upstream = Arc::new(RecordingSink::default());
        let dispatcher = ControlDispatcher::new(Arc::clone(&registry), Role::Relay)
            .with_upstream(upstream.clone());

        let received = dispatcher.receive(lent_buffer(b"abcd"));
        let resent = received.to_wire().unwrap();
        assert_eq!(resent.decode().packets.len(), 3);
        assert_eq!(resent.fds().len(), 2);

        assert_eq!(dispatcher.relay_sent("down-1", &received), 2);
        assert_eq!(dispatcher.relay_sent("down-2", &received), 2);
        drop(received);
        assert!(upstream.messages().is_empty());

        dispatcher.handle_control("down-1", &control(&[release(11), release(12)]));
        assert!(upstream.messages().is_empty());
        dispatcher.handle_control("down-2", &control(&[release(11)]));
        assert!(upstream.messages().is_empty());
        registry.remove_client("down-2");

        assert_eq!(upstream.messages(), vec![vec![release(11), release(12)]]);
    }

    #[test]
    fn request_refresh_needs_upstream() {
        let dispatcher = ControlDispatcher::new(Arc::new(FdRegistry::new()), Role::RawSource);
        assert!(matches!(
            dispatcher.request_refresh(0, RefreshKind::Keyframe),
            Err(LendError::NoUpstream)
        ));

        let upstream = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher.with_upstream(upstream.clone());
        dispatcher.request_refresh(5, RefreshKind::Keyframe).unwrap();
        assert_eq!(
            upstream.messages(),
            vec![vec![refresh(5, RefreshKind::Keyframe)]]
        );
    }
}
