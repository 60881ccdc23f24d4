use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use fdpay_wire::{Packet, RefreshKind};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PacketOutput {
    Header {
        flags: u32,
        sequence: u64,
        timestamp: i64,
        dts_offset: i64,
    },
    FdPayload {
        fd_slot: u32,
        lend_id: u32,
        offset: u64,
        size: u64,
    },
    ReleaseFdPayload {
        lend_id: u32,
    },
    FormatChange {
        format: String,
    },
    RefreshRequest {
        timestamp: i64,
        kind: String,
    },
}

impl PacketOutput {
    fn name(&self) -> &'static str {
        match self {
            PacketOutput::Header { .. } => "header",
            PacketOutput::FdPayload { .. } => "fd-payload",
            PacketOutput::ReleaseFdPayload { .. } => "release-fd-payload",
            PacketOutput::FormatChange { .. } => "format-change",
            PacketOutput::RefreshRequest { .. } => "refresh-request",
        }
    }

    fn detail(&self) -> String {
        match self {
            PacketOutput::Header {
                flags,
                sequence,
                timestamp,
                dts_offset,
            } => format!("seq={sequence} ts={timestamp} dts_offset={dts_offset} flags={flags:#x}"),
            PacketOutput::FdPayload {
                fd_slot,
                lend_id,
                offset,
                size,
            } => format!("slot={fd_slot} lend={lend_id} offset={offset} size={size}"),
            PacketOutput::ReleaseFdPayload { lend_id } => format!("lend={lend_id}"),
            PacketOutput::FormatChange { format } => format.clone(),
            PacketOutput::RefreshRequest { timestamp, kind } => format!("ts={timestamp} kind={kind}"),
        }
    }
}

impl From<&Packet> for PacketOutput {
    fn from(packet: &Packet) -> Self {
        match packet {
            Packet::Header(h) => PacketOutput::Header {
                flags: h.flags,
                sequence: h.sequence,
                timestamp: h.timestamp,
                dts_offset: h.dts_offset,
            },
            Packet::FdPayload(p) => PacketOutput::FdPayload {
                fd_slot: p.fd_slot,
                lend_id: p.lend_id,
                offset: p.offset,
                size: p.size,
            },
            Packet::ReleaseFdPayload(r) => PacketOutput::ReleaseFdPayload { lend_id: r.lend_id },
            Packet::FormatChange(f) => PacketOutput::FormatChange {
                format: f.format.clone(),
            },
            Packet::RefreshRequest(r) => PacketOutput::RefreshRequest {
                timestamp: r.timestamp,
                kind: if r.kind.is_keyframe() {
                    "keyframe".to_string()
                } else {
                    format!("other({})", r.kind.code())
                },
            },
        }
    }
}

#[derive(Serialize, Debug)]
pub struct DecodeOutput {
    pub source: String,
    pub size: usize,
    pub fds: usize,
    pub packets: Vec<PacketOutput>,
    pub error: Option<String>,
}

pub fn print_decode(out: &DecodeOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = packet_table();
            for (index, packet) in out.packets.iter().enumerate() {
                table.add_row(vec![index.to_string(), packet.name().to_string(), packet.detail()]);
            }
            println!("{table}");
            if let Some(error) = &out.error {
                println!("error: {error}");
            }
        }
        OutputFormat::Pretty => {
            println!("{} ({} bytes, {} fds)", out.source, out.size, out.fds);
            for packet in &out.packets {
                println!("  {} {}", packet.name(), packet.detail());
            }
            if let Some(error) = &out.error {
                println!("  error: {error}");
            }
        }
    }
}

#[derive(Serialize, Debug)]
pub struct RegionOutput {
    pub lend_id: u32,
    pub offset: u64,
    pub size: u64,
    pub preview: String,
}

#[derive(Serialize, Debug)]
pub struct ReceivedOutput {
    pub index: usize,
    pub sequence: Option<u64>,
    pub timestamp: Option<i64>,
    pub regions: Vec<RegionOutput>,
    pub formats: Vec<String>,
    pub error: Option<String>,
}

pub fn print_received(out: &ReceivedOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "SEQUENCE", "TIMESTAMP", "LEND", "SIZE", "CONTENT"]);
            for region in &out.regions {
                table.add_row(vec![
                    out.index.to_string(),
                    optional(out.sequence),
                    optional(out.timestamp),
                    region.lend_id.to_string(),
                    region.size.to_string(),
                    region.preview.clone(),
                ]);
            }
            println!("{table}");
            for format in &out.formats {
                println!("format: {format}");
            }
        }
        OutputFormat::Pretty => {
            println!(
                "buffer #{} seq={} ts={}",
                out.index,
                optional(out.sequence),
                optional(out.timestamp)
            );
            for region in &out.regions {
                println!(
                    "  lend={} offset={} size={} content={}",
                    region.lend_id, region.offset, region.size, region.preview
                );
            }
            for format in &out.formats {
                println!("  format: {format}");
            }
        }
    }
    if let Some(error) = &out.error {
        tracing::warn!(error = %error, "buffer decoded partially");
    }
}

#[derive(Serialize, Debug, Default)]
pub struct ClientSummary {
    pub client: String,
    pub buffers_sent: usize,
    pub released: usize,
    pub unknown_releases: usize,
    pub keyframe_requests: usize,
    pub dropped_on_disconnect: usize,
}

pub fn print_client_summary(out: &ClientSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CLIENT", "SENT", "RELEASED", "UNKNOWN", "KEYFRAMES", "DROPPED"])
                .add_row(vec![
                    out.client.clone(),
                    out.buffers_sent.to_string(),
                    out.released.to_string(),
                    out.unknown_releases.to_string(),
                    out.keyframe_requests.to_string(),
                    out.dropped_on_disconnect.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "client={} sent={} released={} unknown={} keyframes={} dropped={}",
                out.client,
                out.buffers_sent,
                out.released,
                out.unknown_releases,
                out.keyframe_requests,
                out.dropped_on_disconnect
            );
        }
    }
}

pub fn content_preview(content: &[u8]) -> String {
    const LIMIT: usize = 32;
    let shown = &content[..content.len().min(LIMIT)];
    let text = match std::str::from_utf8(shown) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => return format!("<binary {} bytes>", content.len()),
    };
    if content.len() > LIMIT {
        format!("{text}…")
    } else {
        text
    }
}

fn packet_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#", "TYPE", "DETAIL"]);
    table
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}
