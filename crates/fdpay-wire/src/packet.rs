//! Packet types carried inside a [`WireBuffer`](crate::WireBuffer).

/// Identifier naming one lent descriptor-backed resource.
pub type LendId = u32;

/// On-wire type tags. Values not listed here are skipped by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Header = 2,
    FdPayload = 3,
    ReleaseFdPayload = 4,
    FormatChange = 5,
    RefreshRequest = 7,
}

impl PacketType {
    /// Map a wire tag to a known packet type.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            2 => Some(Self::Header),
            3 => Some(Self::FdPayload),
            4 => Some(Self::ReleaseFdPayload),
            5 => Some(Self::FormatChange),
            7 => Some(Self::RefreshRequest),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::FdPayload => "fd-payload",
            Self::ReleaseFdPayload => "release-fd-payload",
            Self::FormatChange => "format-change",
            Self::RefreshRequest => "refresh-request",
        }
    }
}

/// Buffer-level timing context; only valid as the first packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub flags: u32,
    pub sequence: u64,
    pub timestamp: i64,
    pub dts_offset: i64,
}

/// A region of the descriptor in side-channel slot `fd_slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdPayload {
    pub fd_slot: u32,
    pub lend_id: LendId,
    pub offset: u64,
    pub size: u64,
}

/// Drop one reference on a previously lent resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseFdPayload {
    pub lend_id: LendId,
}

/// Announces a renegotiated content format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatChange {
    pub format: String,
}

/// What a refresh request asks the producer for.
///
/// Kinds compare by wire code, so `Other(1)` equals `Keyframe`. Use
/// [`RefreshKind::is_keyframe`] rather than matching on the variant.
#[derive(Debug, Clone, Copy)]
pub enum RefreshKind {
    /// Resend a full, non-differential unit including all headers.
    Keyframe,
    /// Any other request code, preserved verbatim for pass-through.
    Other(u32),
}

impl RefreshKind {
    const KEYFRAME_CODE: u32 = 1;

    pub fn from_code(code: u32) -> Self {
        if code == Self::KEYFRAME_CODE {
            Self::Keyframe
        } else {
            Self::Other(code)
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Keyframe => Self::KEYFRAME_CODE,
            Self::Other(code) => code,
        }
    }

    pub fn is_keyframe(self) -> bool {
        self.code() == Self::KEYFRAME_CODE
    }
}

impl PartialEq for RefreshKind {
    fn eq(&self, other: &Self) -> bool {
        self.code() == other.code()
    }
}

impl Eq for RefreshKind {}

/// Asks the producer to resend a full unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRequest {
    pub timestamp: i64,
    pub kind: RefreshKind,
}

/// One decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Header(Header),
    FdPayload(FdPayload),
    ReleaseFdPayload(ReleaseFdPayload),
    FormatChange(FormatChange),
    RefreshRequest(RefreshRequest),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Header(_) => PacketType::Header,
            Self::FdPayload(_) => PacketType::FdPayload,
            Self::ReleaseFdPayload(_) => PacketType::ReleaseFdPayload,
            Self::FormatChange(_) => PacketType::FormatChange,
            Self::RefreshRequest(_) => PacketType::RefreshRequest,
        }
    }
}

impl From<Header> for Packet {
    fn from(value: Header) -> Self {
        Self::Header(value)
    }
}

impl From<FdPayload> for Packet {
    fn from(value: FdPayload) -> Self {
        Self::FdPayload(value)
    }
}

impl From<ReleaseFdPayload> for Packet {
    fn from(value: ReleaseFdPayload) -> Self {
        Self::ReleaseFdPayload(value)
    }
}

impl From<FormatChange> for Packet {
    fn from(value: FormatChange) -> Self {
        Self::FormatChange(value)
    }
}

impl From<RefreshRequest> for Packet {
    fn from(value: RefreshRequest) -> Self {
        Self::RefreshRequest(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_map_back_to_types() {
        for ty in [
            PacketType::Header,
            PacketType::FdPayload,
            PacketType::ReleaseFdPayload,
            PacketType::FormatChange,
            PacketType::RefreshRequest,
        ] {
            assert_eq!(PacketType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(PacketType::from_tag(0), None);
        assert_eq!(PacketType::from_tag(6), None);
    }

    #[test]
    fn refresh_kind_keeps_unknown_codes() {
        assert_eq!(RefreshKind::from_code(1), RefreshKind::Keyframe);
        assert_eq!(RefreshKind::from_code(9), RefreshKind::Other(9));
        assert_eq!(RefreshKind::Other(9).code(), 9);
    }

    #[test]
    fn keyframe_code_spelled_as_other_is_a_keyframe() {
        let spelled = RefreshKind::Other(1);
        assert!(spelled.is_keyframe());
        assert_eq!(spelled, RefreshKind::Keyframe);
        assert_eq!(RefreshKind::from_code(spelled.code()), spelled);
        assert_ne!(RefreshKind::Other(2), RefreshKind::Keyframe);
    }
}
