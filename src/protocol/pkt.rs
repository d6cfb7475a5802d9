//! pkt-line framing for the Git wire protocols: 4-hex length prefix,
//! flush (`0000`) and delim (`0001`) markers, and side-band multiplexing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{errors::GitError, protocol::types::SideBand};

/// Maximum total frame length including the 4-byte length field.
pub const MAX_PKT_LEN: usize = 65_520;
/// Maximum payload of a single data frame.
pub const MAX_PKT_PAYLOAD: usize = MAX_PKT_LEN - 4;
/// Maximum payload of a side-band frame (one byte goes to the channel).
pub const MAX_SIDE_BAND_PAYLOAD: usize = MAX_PKT_PAYLOAD - 1;

pub const FLUSH_PKT: &[u8; 4] = b"0000";
pub const DELIM_PKT: &[u8; 4] = b"0001";

/// One decoded frame. A data frame with an empty payload is distinct from a
/// flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PktFrame {
    Data(Bytes),
    Flush,
    Delim,
}

/// Read one frame from the front of `bytes`, consuming it.
///
/// Returns `None` when the buffer is exhausted. Malformed length fields,
/// lengths 2 and 3, oversized frames, and short reads are errors; the
/// transfer engine never guesses at framing.
pub fn read_pkt_line(bytes: &mut Bytes) -> Result<Option<PktFrame>, GitError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    if bytes.len() < 4 {
        return Err(GitError::MalformedPktLine(format!(
            "{} bytes left, need a 4-byte length",
            bytes.len()
        )));
    }

    let len_field = bytes.copy_to_bytes(4);
    let len_str = core::str::from_utf8(&len_field)
        .map_err(|_| GitError::MalformedPktLine("length field is not UTF-8".to_string()))?;
    let pkt_length = usize::from_str_radix(len_str, 16)
        .map_err(|_| GitError::MalformedPktLine(format!("length field `{len_str}`")))?;

    match pkt_length {
        0 => return Ok(Some(PktFrame::Flush)),
        1 => return Ok(Some(PktFrame::Delim)),
        2 | 3 => {
            return Err(GitError::MalformedPktLine(format!(
                "length {pkt_length} is reserved"
            )));
        }
        _ => {}
    }
    if pkt_length > MAX_PKT_LEN {
        return Err(GitError::MalformedPktLine(format!(
            "length {pkt_length} exceeds {MAX_PKT_LEN}"
        )));
    }

    let data_length = pkt_length - 4;
    if bytes.len() < data_length {
        return Err(GitError::MalformedPktLine(format!(
            "frame declares {data_length} payload bytes, {} remain",
            bytes.len()
        )));
    }
    Ok(Some(PktFrame::Data(bytes.copy_to_bytes(data_length))))
}

/// Decode every frame in a buffer (used by tests and the transport client).
pub fn read_all_pkt_lines(bytes: &mut Bytes) -> Result<Vec<PktFrame>, GitError> {
    let mut frames = Vec::new();
    while let Some(frame) = read_pkt_line(bytes)? {
        frames.push(frame);
    }
    Ok(frames)
}

/// Append one data frame.
pub fn write_pkt_line(out: &mut BytesMut, payload: &[u8]) {
    debug_assert!(payload.len() <= MAX_PKT_PAYLOAD);
    out.put(format!("{:04x}", payload.len() + 4).as_bytes());
    out.put(payload);
}

/// Append one data frame from a string.
pub fn write_pkt_str(out: &mut BytesMut, payload: &str) {
    write_pkt_line(out, payload.as_bytes());
}

pub fn write_flush(out: &mut BytesMut) {
    out.put(&FLUSH_PKT[..]);
}

pub fn write_delim(out: &mut BytesMut) {
    out.put(&DELIM_PKT[..]);
}

/// Append `data` wrapped in side-band frames on `channel`, splitting at the
/// maximum frame size. The channel byte lives inside the payload and the
/// length field covers it.
pub fn write_side_band(out: &mut BytesMut, channel: SideBand, data: &[u8]) {
    if data.is_empty() {
        let mut frame = BytesMut::with_capacity(1);
        frame.put_u8(channel.value());
        write_pkt_line(out, &frame);
        return;
    }
    for chunk in data.chunks(MAX_SIDE_BAND_PAYLOAD) {
        let mut frame = BytesMut::with_capacity(chunk.len() + 1);
        frame.put_u8(channel.value());
        frame.put(chunk);
        write_pkt_line(out, &frame);
    }
}

/// Split a side-band data frame into channel and payload. A channel-3 frame
/// is surfaced as a fatal error carrying the remote message.
pub fn demux_side_band(frame: Bytes) -> Result<(SideBand, Bytes), GitError> {
    if frame.is_empty() {
        return Err(GitError::MalformedPktLine(
            "empty side-band frame".to_string(),
        ));
    }
    let channel = SideBand::from_value(frame[0])?;
    let payload = frame.slice(1..);
    if channel == SideBand::Error {
        return Err(GitError::Fatal(format!(
            "remote error: {}",
            String::from_utf8_lossy(&payload).trim_end()
        )));
    }
    Ok((channel, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encode/decode round-trip for data, flush, and delim frames.
    #[test]
    fn round_trip_frames() {
        let mut out = BytesMut::new();
        write_pkt_str(&mut out, "want abcd\n");
        write_flush(&mut out);
        write_pkt_line(&mut out, b"");
        write_delim(&mut out);

        let mut buf = out.freeze();
        assert_eq!(
            read_pkt_line(&mut buf).unwrap().unwrap(),
            PktFrame::Data(Bytes::from_static(b"want abcd\n"))
        );
        assert_eq!(read_pkt_line(&mut buf).unwrap().unwrap(), PktFrame::Flush);
        // empty-payload data frame is distinct from flush
        assert_eq!(
            read_pkt_line(&mut buf).unwrap().unwrap(),
            PktFrame::Data(Bytes::new())
        );
        assert_eq!(read_pkt_line(&mut buf).unwrap().unwrap(), PktFrame::Delim);
        assert!(read_pkt_line(&mut buf).unwrap().is_none());
    }

    /// The four-byte prefix encodes the total length including itself.
    #[test]
    fn length_field_covers_prefix() {
        let mut out = BytesMut::new();
        write_pkt_str(&mut out, "hi\n");
        assert_eq!(&out[..], b"0007hi\n");
    }

    /// Reserved lengths 2 and 3 are malformed.
    #[test]
    fn reserved_lengths_rejected() {
        for raw in [&b"0002"[..], &b"0003"[..]] {
            let mut buf = Bytes::copy_from_slice(raw);
            assert!(read_pkt_line(&mut buf).is_err());
        }
    }

    /// A frame longer than the remaining input is a short read.
    #[test]
    fn short_read_rejected() {
        let mut buf = Bytes::from_static(b"000bhel");
        assert!(read_pkt_line(&mut buf).is_err());
    }

    /// Non-hex length fields are malformed.
    #[test]
    fn bad_hex_rejected() {
        let mut buf = Bytes::from_static(b"zzzzdata");
        assert!(read_pkt_line(&mut buf).is_err());
    }

    /// Side-band wrapping splits large payloads and prepends the channel.
    #[test]
    fn side_band_chunking() {
        let data = vec![0x42u8; MAX_SIDE_BAND_PAYLOAD + 10];
        let mut out = BytesMut::new();
        write_side_band(&mut out, SideBand::PackData, &data);

        let mut buf = out.freeze();
        let frames = read_all_pkt_lines(&mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        let mut total = 0;
        for frame in frames {
            let PktFrame::Data(payload) = frame else {
                panic!("expected data frame")
            };
            let (channel, body) = demux_side_band(payload).unwrap();
            assert_eq!(channel, SideBand::PackData);
            total += body.len();
        }
        assert_eq!(total, data.len());
    }

    /// Channel 3 surfaces the remote message as a fatal error.
    #[test]
    fn error_channel_is_fatal() {
        let mut frame = BytesMut::new();
        frame.put_u8(3);
        frame.put(&b"out of quota\n"[..]);
        let err = demux_side_band(frame.freeze()).unwrap_err();
        assert!(err.to_string().contains("out of quota"));
    }
}
