use crate::cmd::DecodeArgs;
use crate::exit::{io_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_decode, DecodeOutput, OutputFormat, PacketOutput};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    if args.fds > fdpay_transport::MAX_FDS_PER_MESSAGE {
        return Err(CliError::new(
            USAGE,
            format!(
                "--fds must be at most {}",
                fdpay_transport::MAX_FDS_PER_MESSAGE
            ),
        ));
    }
    let data = std::fs::read(&args.path).map_err(|err| io_error("read failed", err))?;
    let out = decode_bytes(&args.path.display().to_string(), &data, args.fds);
    print_decode(&out, format);

    if out.error.is_some() {
        Ok(DATA_INVALID)
    } else {
        Ok(SUCCESS)
    }
}

fn decode_bytes(source: &str, data: &[u8], fds: usize) -> DecodeOutput {
    let decoded = fdpay_wire::decode(data, fds);
    if let Some(err) = &decoded.error {
        tracing::warn!(error = %err, packets = decoded.packets.len(), "partial decode");
    }
    DecodeOutput {
        source: source.to_string(),
        size: data.len(),
        fds,
        packets: decoded.packets.iter().map(PacketOutput::from).collect(),
        error: decoded.error.map(|err| err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use fdpay_wire::{FdPayload, Header, Packet, WireBufferBuilder};

    use super::*;

    fn scenario_bytes() -> Vec<u8> {
        let mut builder = WireBufferBuilder::new();
        builder
            .add_header(&Header {
                sequence: 5,
                timestamp: 1000,
                ..Header::default()
            })
            .unwrap();
        builder
            .add_packet(&Packet::FdPayload(FdPayload {
                fd_slot: 0,
                lend_id: 42,
                offset: 0,
                size: 4096,
            }))
            .unwrap();
        builder.finish().unwrap().data().to_vec()
    }

    #[test]
    fn decodes_with_assumed_descriptors() {
        let out = decode_bytes("mem", &scenario_bytes(), 1);
        assert_eq!(out.packets.len(), 2);
        assert!(out.error.is_none());
    }

    #[test]
    fn missing_descriptors_report_partial_decode() {
        let out = decode_bytes("mem", &scenario_bytes(), 0);
        assert_eq!(out.packets.len(), 1);
        assert!(out
            .error
            .as_deref()
            .is_some_and(|err| err.contains("descriptor slot 0")));
    }
}
