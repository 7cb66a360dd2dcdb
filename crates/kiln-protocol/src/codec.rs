use crate::{BinaryFile, Letter, ProtocolError};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const BINARY_MARKER: u16 = 1;

const FILE_NAME_LEN: usize = 32;
const TID_LEN: usize = 64;
const PARENT_LEN: usize = 64;
const MENU_LEN: usize = 30;

/// marker(2) + payload length(4) + fixed fields.
pub const BINARY_HEADER_LEN: usize = 2 + 4 + FILE_NAME_LEN + TID_LEN + PARENT_LEN + MENU_LEN;

pub const MAX_BINARY_PAYLOAD: usize = 16 * 1024 * 1024;

/// Splits a byte stream into complete letter frames.
///
/// Frames are yielded raw so a letter that fails to parse costs only
/// itself; the stream stays aligned on the next prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct LetterCodec;

impl LetterCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for LetterCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let prefix = u16::from_be_bytes([src[0], src[1]]);
        let frame_len = if prefix == BINARY_MARKER {
            if src.len() < 6 {
                return Ok(None);
            }
            let payload_len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
            if payload_len > MAX_BINARY_PAYLOAD {
                return Err(ProtocolError::TooLarge(payload_len));
            }
            BINARY_HEADER_LEN + payload_len
        } else {
            2 + prefix as usize
        };

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(frame_len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::Disconnected { pending: src.len() }),
        }
    }
}

impl Encoder<Letter> for LetterCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Letter, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = item.to_bytes_with_length()?;
        dst.reserve(encoded.len());
        dst.put_slice(&encoded);
        Ok(())
    }
}

pub(crate) fn encode_binary(letter: &BinaryFile) -> Result<Bytes, ProtocolError> {
    let payload_len = u32::try_from(letter.payload.len())
        .map_err(|_| ProtocolError::TooLarge(letter.payload.len()))?;
    if letter.payload.len() > MAX_BINARY_PAYLOAD {
        return Err(ProtocolError::TooLarge(letter.payload.len()));
    }

    let mut out = BytesMut::with_capacity(BINARY_HEADER_LEN + letter.payload.len());
    out.put_u16(BINARY_MARKER);
    out.put_u32(payload_len);
    put_padded(&mut out, "fileName", &letter.file_name, FILE_NAME_LEN)?;
    put_padded(&mut out, "tid", &letter.tid, TID_LEN)?;
    put_padded(&mut out, "parent", &letter.parent, PARENT_LEN)?;
    put_padded(&mut out, "menu", &letter.menu, MENU_LEN)?;
    out.put_slice(&letter.payload);
    Ok(out.freeze())
}

pub(crate) fn decode_binary(frame: &[u8]) -> Result<BinaryFile, ProtocolError> {
    if frame.len() < BINARY_HEADER_LEN {
        return Err(ProtocolError::Malformed(format!(
            "binary frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }

    let payload_len = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
    if frame.len() != BINARY_HEADER_LEN + payload_len {
        return Err(ProtocolError::Malformed(format!(
            "binary frame declares {payload_len} payload bytes but carries {}",
            frame.len() - BINARY_HEADER_LEN
        )));
    }

    let mut offset = 6;
    let mut field = |len: usize, name: &'static str| {
        let raw = &frame[offset..offset + len];
        offset += len;
        read_padded(raw, name)
    };
    let file_name = field(FILE_NAME_LEN, "fileName")?;
    let tid = field(TID_LEN, "tid")?;
    let parent = field(PARENT_LEN, "parent")?;
    let menu = field(MENU_LEN, "menu")?;

    Ok(BinaryFile {
        tid,
        parent,
        file_name,
        menu,
        payload: Bytes::copy_from_slice(&frame[BINARY_HEADER_LEN..]),
    })
}

fn put_padded(
    out: &mut BytesMut,
    field: &'static str,
    value: &str,
    width: usize,
) -> Result<(), ProtocolError> {
    if value.len() > width {
        return Err(ProtocolError::FieldTooLong { field, max: width });
    }
    out.put_bytes(b' ', width - value.len());
    out.put_slice(value.as_bytes());
    Ok(())
}

fn read_padded(raw: &[u8], field: &'static str) -> Result<String, ProtocolError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| ProtocolError::Malformed(format!("{field} is not utf-8: {e}")))?;
    Ok(text.trim_matches(' ').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cancel, Heartbeat, Response, ResponseState};

    fn encode(letters: Vec<Letter>) -> BytesMut {
        let mut codec = LetterCodec::new();
        let mut buffer = BytesMut::new();
        for letter in letters {
            codec.encode(letter, &mut buffer).expect("encode letter");
        }
        buffer
    }

    fn next_letter(codec: &mut LetterCodec, buffer: &mut BytesMut) -> Letter {
        let frame = codec
            .decode(buffer)
            .expect("decode frame")
            .expect("frame present");
        Letter::parse(&frame).expect("parse frame")
    }

    #[test]
    fn binary_header_is_fixed_width() {
        assert_eq!(BINARY_HEADER_LEN, 196);

        let chunk = BinaryFile::chunk("v1__GL8900", "out.bin", &b"abc"[..]).with_post("v1", "P1");
        let bytes = encode_binary(&chunk).expect("encode chunk");
        assert_eq!(bytes.len(), BINARY_HEADER_LEN + 3);
        assert_eq!(&bytes[..2], &[0, 1]);
        assert_eq!(&bytes[2..6], &3u32.to_be_bytes());
        assert_eq!(
            std::str::from_utf8(&bytes[6..38]).expect("utf8").trim_start(),
            "out.bin"
        );
    }

    #[test]
    fn decodes_mixed_json_and_binary_frames() {
        let chunk = BinaryFile::chunk("t1", "log.txt", &b"payload"[..]);
        let mut buffer = encode(vec![
            Letter::from(Heartbeat::new("w1", 0)),
            Letter::from(chunk.clone()),
            Letter::from(chunk.terminator()),
            Letter::from(Response::new("w1", "t1", None, ResponseState::Finished)),
        ]);
        let mut codec = LetterCodec::new();

        assert!(matches!(
            next_letter(&mut codec, &mut buffer),
            Letter::Heartbeat(_)
        ));
        assert_eq!(
            next_letter(&mut codec, &mut buffer),
            Letter::BinaryFile(chunk.clone())
        );
        match next_letter(&mut codec, &mut buffer) {
            Letter::BinaryFile(last) => {
                assert!(last.is_last());
                assert_eq!(last.tid, "t1");
            }
            other => panic!("unexpected letter: {other:?}"),
        }
        assert!(matches!(
            next_letter(&mut codec, &mut buffer),
            Letter::Response(_)
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn handles_partial_reads() {
        let mut codec = LetterCodec::new();
        let mut full = encode(vec![Letter::from(
            BinaryFile::chunk("t1", "a.bin", vec![7u8; 300]).with_post("s1", "menu"),
        )]);

        for split_at in [1, 5, 100, BINARY_HEADER_LEN + 10] {
            let mut head = full.clone();
            let tail = head.split_off(split_at);
            assert!(codec.decode(&mut head).expect("decode partial").is_none());
            head.extend_from_slice(&tail);
            let frame = codec
                .decode(&mut head)
                .expect("decode completed")
                .expect("frame available");
            assert_eq!(frame.len(), BINARY_HEADER_LEN + 300);
        }

        let frame = codec
            .decode(&mut full)
            .expect("decode whole")
            .expect("frame available");
        match Letter::parse(&frame).expect("parse binary") {
            Letter::BinaryFile(chunk) => {
                assert_eq!(chunk.parent, "s1");
                assert_eq!(chunk.menu, "menu");
                assert_eq!(chunk.payload.len(), 300);
            }
            other => panic!("unexpected letter: {other:?}"),
        }
    }

    #[test]
    fn eof_inside_frame_is_disconnect() {
        let mut codec = LetterCodec::new();
        let mut buffer = encode(vec![Letter::from(Cancel::new("t1", None))]);
        buffer.truncate(buffer.len() - 4);

        let error = codec
            .decode_eof(&mut buffer)
            .expect_err("truncated frame must fail");
        assert!(error.is_disconnect());
        assert!(matches!(error, ProtocolError::Disconnected { .. }));
    }

    #[test]
    fn clean_eof_yields_nothing() {
        let mut codec = LetterCodec::new();
        let mut buffer = BytesMut::new();
        assert!(codec.decode_eof(&mut buffer).expect("clean eof").is_none());
    }

    #[test]
    fn malformed_frame_does_not_desync_stream() {
        let garbage = b"{not json}";
        let mut buffer = BytesMut::new();
        buffer.put_u16(garbage.len() as u16);
        buffer.put_slice(garbage);
        buffer.extend_from_slice(&encode(vec![Letter::from(Cancel::new("t2", None))]));

        let mut codec = LetterCodec::new();
        let bad = codec
            .decode(&mut buffer)
            .expect("decode frame")
            .expect("frame present");
        let error = Letter::parse(&bad).expect_err("garbage must not parse");
        assert!(matches!(error, ProtocolError::Malformed(_)));
        assert!(!error.is_disconnect());

        match next_letter(&mut codec, &mut buffer) {
            Letter::Cancel(cancel) => assert_eq!(cancel.header.tid, "t2"),
            other => panic!("unexpected letter: {other:?}"),
        }
    }

    #[test]
    fn oversized_field_is_rejected() {
        let chunk = BinaryFile::chunk("t".repeat(65), "a", &b"x"[..]);
        let error = encode_binary(&chunk).expect_err("tid too long");
        assert!(matches!(
            error,
            ProtocolError::FieldTooLong {
                field: "tid",
                max: 64
            }
        ));
    }

    #[test]
    fn oversized_binary_declaration_is_rejected() {
        let mut buffer = BytesMut::new();
        buffer.put_u16(BINARY_MARKER);
        buffer.put_u32((MAX_BINARY_PAYLOAD + 1) as u32);

        let mut codec = LetterCodec::new();
        let error = codec.decode(&mut buffer).expect_err("payload too large");
        assert!(matches!(error, ProtocolError::TooLarge(_)));
    }
}
