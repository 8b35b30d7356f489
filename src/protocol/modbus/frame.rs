/// Where an RTU request ends
///
/// RTU has no length field, so a slave reading the line has to know each
/// function's layout. `rmodbus` only sizes response frames; requests are
/// sized here, including 0x17 and codes nobody serves.
use rmodbus::ModbusProto;

use super::adu;

/// Result of inspecting the head of an RTU request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    /// Total frame length including CRC.
    Complete(usize),
    /// At least this many bytes are needed before the length is known.
    NeedHeader(usize),
    /// Unknown layout; the frame ends at the first byte where the CRC checks.
    UntilCrc,
}

/// Works out the RTU request length from the bytes read so far.
pub fn rtu_request_len(head: &[u8]) -> FrameLen {
    if head.len() < 2 {
        return FrameLen::NeedHeader(2);
    }
    let counted = |count_at: usize| {
        head.get(count_at)
            .map(|count| FrameLen::Complete(count_at + 1 + usize::from(*count) + 2))
            .unwrap_or(FrameLen::NeedHeader(count_at + 1))
    };
    match head[1] {
        0x01..=0x06 => FrameLen::Complete(8),
        0x0F | 0x10 => counted(6),
        0x17 => counted(10),
        _ => FrameLen::UntilCrc,
    }
}

/// True once `frame` is at least a minimal RTU frame with a valid CRC.
pub fn rtu_crc_matches(frame: &[u8]) -> bool {
    frame.len() >= 4 && adu::split(ModbusProto::Rtu, frame).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_lengths() {
        assert_eq!(rtu_request_len(&[1]), FrameLen::NeedHeader(2));
        assert_eq!(rtu_request_len(&[1, 3]), FrameLen::Complete(8));
        assert_eq!(rtu_request_len(&[1, 0x10, 0, 0, 0, 2]), FrameLen::NeedHeader(7));
        assert_eq!(rtu_request_len(&[1, 0x10, 0, 0, 0, 2, 4]), FrameLen::Complete(13));
        assert_eq!(rtu_request_len(&[1, 0x17, 0, 0, 0, 1, 0, 0, 0, 1, 2]), FrameLen::Complete(15));
        assert_eq!(rtu_request_len(&[1, 0x2B]), FrameLen::UntilCrc);
    }

    #[test]
    fn test_unknown_function_ends_at_crc() {
        let frame = adu::wrap(ModbusProto::Rtu, 0, 1, &[0x2B, 0x0E, 0x01, 0x00]);
        assert!(!rtu_crc_matches(&frame[..frame.len() - 1]));
        assert!(rtu_crc_matches(&frame));
    }
}
