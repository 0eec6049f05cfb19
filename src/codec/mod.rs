//! Frame codec: self-describing binary payloads for stream messages.
//!
//! Encodes one of three message types into a compact big-endian wire form:
//! row frames (one batch of rows for one stream, kind, and schema
//! generation), stream property snapshots, and close notifications.
//! [`encode`] and [`decode`] are mutual inverses for any valid input; the
//! codec is pure, stateless, and deterministic.
//!
//! A frame is self-describing: it embeds its schema generation and, on the
//! first frame of a generation, the full active definition set. A decoder
//! needs no prior state beyond the generation marker to reconstruct rows.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::model::{
    DataKind, Definition, Level, Row, StreamCloseType, StreamProperties, Value,
};

/// Wire magic, first two bytes of every payload.
pub const MAGIC: u16 = 0x5369;
/// Current wire version.
pub const VERSION: u8 = 1;

const TYPE_FRAME: u8 = 1;
const TYPE_PROPERTIES: u8 = 2;
const TYPE_CLOSED: u8 = 3;

const VALUE_FLOAT: u8 = 0;
const VALUE_TEXT: u8 = 1;
const VALUE_BLOB: u8 = 2;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the frame codec.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// Structurally invalid or truncated payload.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

fn malformed(context: &str) -> CodecError {
    CodecError::MalformedFrame(context.to_string())
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// One decoded stream message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A batch of rows under one schema generation.
    Frame(Frame),
    /// A stream properties snapshot.
    Properties(StreamProperties),
    /// Close notification.
    StreamClosed(StreamCloseType),
}

/// One encoded batch of rows for a single (stream, kind, generation).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Row channel the batch belongs to.
    pub kind: DataKind,
    /// Schema generation the rows were written under.
    pub generation: u32,
    /// Active definition set, embedded on the first frame of a generation
    /// and referenced-only (`None`) afterwards.
    pub definitions: Option<Vec<Definition>>,
    /// The rows, in write order. Zero rows is valid.
    pub rows: Vec<Row>,
}

// ---------------------------------------------------------------------------
// Wire primitives
// ---------------------------------------------------------------------------

/// Encode a string as u16 length prefix + UTF-8 bytes.
pub(crate) fn encode_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Decode a u16-length-prefixed UTF-8 string.
pub(crate) fn decode_str(buf: &mut &[u8]) -> Result<String, CodecError> {
    if buf.remaining() < 2 {
        return Err(malformed("truncated string length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(malformed("string length exceeds remaining bytes"));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| malformed("invalid UTF-8 in string"))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn encode_opt_str(buf: &mut BytesMut, s: &Option<String>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            encode_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn decode_opt_str(buf: &mut &[u8]) -> Result<Option<String>, CodecError> {
    match decode_presence(buf)? {
        true => Ok(Some(decode_str(buf)?)),
        false => Ok(None),
    }
}

fn decode_presence(buf: &mut &[u8]) -> Result<bool, CodecError> {
    if buf.remaining() < 1 {
        return Err(malformed("truncated presence flag"));
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::MalformedFrame(format!(
            "invalid presence flag {other}"
        ))),
    }
}

fn decode_u32(buf: &mut &[u8], context: &str) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::MalformedFrame(format!("truncated {context}")));
    }
    Ok(buf.get_u32())
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a message into its wire form.
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u16(MAGIC);
    buf.put_u8(VERSION);
    match message {
        Message::Frame(frame) => {
            buf.put_u8(TYPE_FRAME);
            encode_frame(&mut buf, frame);
        }
        Message::Properties(props) => {
            buf.put_u8(TYPE_PROPERTIES);
            encode_properties(&mut buf, props);
        }
        Message::StreamClosed(close_type) => {
            buf.put_u8(TYPE_CLOSED);
            buf.put_u8(match close_type {
                StreamCloseType::Normal => 0,
                StreamCloseType::Aborted => 1,
                StreamCloseType::Terminated => 2,
            });
        }
    }
    buf.freeze()
}

fn encode_frame(buf: &mut BytesMut, frame: &Frame) {
    buf.put_u8(match frame.kind {
        DataKind::Parameters => 0,
        DataKind::Events => 1,
    });
    buf.put_u32(frame.generation);
    match &frame.definitions {
        Some(defs) => {
            buf.put_u8(1);
            buf.put_u32(defs.len() as u32);
            for def in defs {
                encode_definition(buf, def);
            }
        }
        None => buf.put_u8(0),
    }
    buf.put_u32(frame.rows.len() as u32);
    for row in &frame.rows {
        encode_row(buf, row);
    }
}

fn encode_definition(buf: &mut BytesMut, def: &Definition) {
    buf.put_u8(match def.kind {
        DataKind::Parameters => 0,
        DataKind::Events => 1,
    });
    encode_str(buf, &def.name);
    encode_opt_str(buf, &def.label);
    encode_opt_str(buf, &def.description);
    encode_opt_str(buf, &def.unit);
    match def.range {
        Some((min, max)) => {
            buf.put_u8(1);
            buf.put_f64(min);
            buf.put_f64(max);
        }
        None => buf.put_u8(0),
    }
    match def.level {
        Some(level) => {
            buf.put_u8(1);
            buf.put_u8(level_to_wire(level));
        }
        None => buf.put_u8(0),
    }
}

fn encode_row(buf: &mut BytesMut, row: &Row) {
    buf.put_i64(row.timestamp);
    buf.put_u32(row.values.len() as u32);
    for (name, value) in &row.values {
        encode_str(buf, name);
        match value {
            Value::Float(v) => {
                buf.put_u8(VALUE_FLOAT);
                buf.put_f64(*v);
            }
            Value::Text(s) => {
                buf.put_u8(VALUE_TEXT);
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                buf.put_u8(VALUE_BLOB);
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }
    buf.put_u32(row.tags.len() as u32);
    for (name, value) in &row.tags {
        encode_str(buf, name);
        encode_str(buf, value);
    }
}

fn encode_properties(buf: &mut BytesMut, props: &StreamProperties) {
    encode_opt_str(buf, &props.name);
    encode_opt_str(buf, &props.location);
    buf.put_u32(props.metadata.len() as u32);
    for (key, value) in &props.metadata {
        encode_str(buf, key);
        encode_str(buf, value);
    }
    buf.put_u32(props.parents.len() as u32);
    for parent in &props.parents {
        encode_str(buf, parent);
    }
    match props.time_of_recording {
        Some(ts) => {
            buf.put_u8(1);
            buf.put_i64(ts);
        }
        None => buf.put_u8(0),
    }
}

fn level_to_wire(level: Level) -> u8 {
    match level {
        Level::Trace => 0,
        Level::Debug => 1,
        Level::Information => 2,
        Level::Warning => 3,
        Level::Error => 4,
        Level::Critical => 5,
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a wire payload into a message.
///
/// Fails with [`CodecError::MalformedFrame`] on truncated or structurally
/// invalid input. A structurally valid frame with zero rows decodes
/// successfully.
pub fn decode(payload: &[u8]) -> Result<Message, CodecError> {
    let buf = &mut &payload[..];
    if buf.remaining() < 4 {
        return Err(malformed("payload shorter than header"));
    }
    let magic = buf.get_u16();
    if magic != MAGIC {
        return Err(CodecError::MalformedFrame(format!(
            "bad magic 0x{magic:04x}"
        )));
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(CodecError::MalformedFrame(format!(
            "unsupported version {version}"
        )));
    }
    let message = match buf.get_u8() {
        TYPE_FRAME => Message::Frame(decode_frame(buf)?),
        TYPE_PROPERTIES => Message::Properties(decode_properties(buf)?),
        TYPE_CLOSED => {
            if buf.remaining() < 1 {
                return Err(malformed("truncated close type"));
            }
            let close_type = match buf.get_u8() {
                0 => StreamCloseType::Normal,
                1 => StreamCloseType::Aborted,
                2 => StreamCloseType::Terminated,
                other => {
                    return Err(CodecError::MalformedFrame(format!(
                        "invalid close type {other}"
                    )))
                }
            };
            Message::StreamClosed(close_type)
        }
        other => {
            return Err(CodecError::MalformedFrame(format!(
                "unknown message type {other}"
            )))
        }
    };
    if buf.has_remaining() {
        return Err(CodecError::MalformedFrame(format!(
            "{} trailing bytes after message",
            buf.remaining()
        )));
    }
    Ok(message)
}

fn decode_kind(buf: &mut &[u8]) -> Result<DataKind, CodecError> {
    if buf.remaining() < 1 {
        return Err(malformed("truncated data kind"));
    }
    match buf.get_u8() {
        0 => Ok(DataKind::Parameters),
        1 => Ok(DataKind::Events),
        other => Err(CodecError::MalformedFrame(format!(
            "invalid data kind {other}"
        ))),
    }
}

fn decode_frame(buf: &mut &[u8]) -> Result<Frame, CodecError> {
    let kind = decode_kind(buf)?;
    let generation = decode_u32(buf, "generation")?;

    let definitions = if decode_presence(buf)? {
        let count = decode_u32(buf, "definition count")?;
        let mut defs = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            defs.push(decode_definition(buf)?);
        }
        Some(defs)
    } else {
        None
    };

    let row_count = decode_u32(buf, "row count")?;
    let mut rows = Vec::with_capacity(row_count.min(65_536) as usize);
    for _ in 0..row_count {
        rows.push(decode_row(buf)?);
    }

    Ok(Frame {
        kind,
        generation,
        definitions,
        rows,
    })
}

fn decode_definition(buf: &mut &[u8]) -> Result<Definition, CodecError> {
    let kind = decode_kind(buf)?;
    let name = decode_str(buf)?;
    let label = decode_opt_str(buf)?;
    let description = decode_opt_str(buf)?;
    let unit = decode_opt_str(buf)?;

    let range = if decode_presence(buf)? {
        if buf.remaining() < 16 {
            return Err(malformed("truncated definition range"));
        }
        Some((buf.get_f64(), buf.get_f64()))
    } else {
        None
    };

    let level = if decode_presence(buf)? {
        if buf.remaining() < 1 {
            return Err(malformed("truncated definition level"));
        }
        Some(match buf.get_u8() {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Information,
            3 => Level::Warning,
            4 => Level::Error,
            5 => Level::Critical,
            other => {
                return Err(CodecError::MalformedFrame(format!(
                    "invalid level {other}"
                )))
            }
        })
    } else {
        None
    };

    Ok(Definition {
        kind,
        name,
        label,
        description,
        unit,
        range,
        level,
    })
}

fn decode_row(buf: &mut &[u8]) -> Result<Row, CodecError> {
    if buf.remaining() < 8 {
        return Err(malformed("truncated row timestamp"));
    }
    let timestamp = buf.get_i64();
    let mut row = Row::at(timestamp);

    let value_count = decode_u32(buf, "value count")?;
    for _ in 0..value_count {
        let name = decode_str(buf)?;
        if buf.remaining() < 1 {
            return Err(malformed("truncated value type"));
        }
        let value = match buf.get_u8() {
            VALUE_FLOAT => {
                if buf.remaining() < 8 {
                    return Err(malformed("truncated float value"));
                }
                Value::Float(buf.get_f64())
            }
            VALUE_TEXT => {
                let len = decode_u32(buf, "text length")? as usize;
                if buf.remaining() < len {
                    return Err(malformed("text length exceeds remaining bytes"));
                }
                let s = std::str::from_utf8(&buf[..len])
                    .map_err(|_| malformed("invalid UTF-8 in text value"))?
                    .to_string();
                buf.advance(len);
                Value::Text(s)
            }
            VALUE_BLOB => {
                let len = decode_u32(buf, "blob length")? as usize;
                if buf.remaining() < len {
                    return Err(malformed("blob length exceeds remaining bytes"));
                }
                let b = buf[..len].to_vec();
                buf.advance(len);
                Value::Blob(b)
            }
            other => {
                return Err(CodecError::MalformedFrame(format!(
                    "invalid value type {other}"
                )))
            }
        };
        row.values.insert(name, value);
    }

    let tag_count = decode_u32(buf, "tag count")?;
    for _ in 0..tag_count {
        let name = decode_str(buf)?;
        let value = decode_str(buf)?;
        row.tags.insert(name, value);
    }

    Ok(row)
}

fn decode_properties(buf: &mut &[u8]) -> Result<StreamProperties, CodecError> {
    let name = decode_opt_str(buf)?;
    let location = decode_opt_str(buf)?;

    let mut props = StreamProperties {
        name,
        location,
        ..StreamProperties::default()
    };

    let metadata_count = decode_u32(buf, "metadata count")?;
    for _ in 0..metadata_count {
        let key = decode_str(buf)?;
        let value = decode_str(buf)?;
        props.metadata.insert(key, value);
    }

    let parent_count = decode_u32(buf, "parent count")?;
    for _ in 0..parent_count {
        props.parents.push(decode_str(buf)?);
    }

    props.time_of_recording = if decode_presence(buf)? {
        if buf.remaining() < 8 {
            return Err(malformed("truncated time of recording"));
        }
        Some(buf.get_i64())
    } else {
        None
    };

    Ok(props)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame {
            kind: DataKind::Parameters,
            generation: 3,
            definitions: Some(vec![
                Definition::parameter("speed")
                    .with_label("Speed")
                    .with_unit("km/h")
                    .with_range(0.0, 400.0),
                Definition::parameter("note").with_description("free text"),
            ]),
            rows: vec![
                Row::at(1_000).value("speed", 212.4).tag("lap", "3"),
                Row::at(2_000)
                    .value("speed", 213.0)
                    .value("note", "pit in")
                    .value("raw", vec![0xde, 0xad]),
            ],
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let message = Message::Frame(sample_frame());
        let decoded = decode(&encode(&message)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_frame_round_trip_without_definitions() {
        let message = Message::Frame(Frame {
            definitions: None,
            ..sample_frame()
        });
        let decoded = decode(&encode(&message)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_empty_frame_is_valid() {
        let message = Message::Frame(Frame {
            kind: DataKind::Events,
            generation: 0,
            definitions: None,
            rows: Vec::new(),
        });
        let decoded = decode(&encode(&message)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_absent_value_survives_round_trip() {
        let with_zero = Row::at(1).value("a", 0.0);
        let without = Row::at(1);
        let encode_one = |row: &Row| {
            encode(&Message::Frame(Frame {
                kind: DataKind::Parameters,
                generation: 1,
                definitions: None,
                rows: vec![row.clone()],
            }))
        };
        assert_ne!(encode_one(&with_zero), encode_one(&without));
    }

    #[test]
    fn test_event_frame_with_levels() {
        let message = Message::Frame(Frame {
            kind: DataKind::Events,
            generation: 1,
            definitions: Some(vec![
                Definition::event("overheat").with_level(Level::Critical),
                Definition::event("lap-complete"),
            ]),
            rows: vec![Row::at(5).value("overheat", "engine 2")],
        });
        let decoded = decode(&encode(&message)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_properties_round_trip() {
        let mut props = StreamProperties {
            name: Some("car 7".to_string()),
            location: Some("/fleet/7".to_string()),
            time_of_recording: Some(1_700_000_000_000_000_000),
            ..StreamProperties::default()
        };
        props.metadata.insert("team".to_string(), "red".to_string());
        props.parents.push("fleet".to_string());

        let message = Message::Properties(props);
        let decoded = decode(&encode(&message)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_empty_properties_round_trip() {
        let message = Message::Properties(StreamProperties::default());
        let decoded = decode(&encode(&message)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_stream_closed_round_trip() {
        for close_type in [
            StreamCloseType::Normal,
            StreamCloseType::Aborted,
            StreamCloseType::Terminated,
        ] {
            let message = Message::StreamClosed(close_type);
            let decoded = decode(&encode(&message)).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_decode_empty_payload() {
        assert!(matches!(decode(&[]), Err(CodecError::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_bad_magic() {
        let result = decode(&[0x00, 0x00, VERSION, TYPE_CLOSED, 0]);
        assert!(matches!(result, Err(CodecError::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_bad_version() {
        let mut payload = encode(&Message::StreamClosed(StreamCloseType::Normal)).to_vec();
        payload[2] = 99;
        assert!(matches!(
            decode(&payload),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_unknown_message_type() {
        let payload = [0x53, 0x69, VERSION, 42];
        assert!(matches!(
            decode(&payload),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_truncated_frame() {
        let payload = encode(&Message::Frame(sample_frame()));
        // Every proper prefix must fail, never panic.
        for len in 0..payload.len() {
            assert!(decode(&payload[..len]).is_err(), "prefix {len} decoded");
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut payload = encode(&Message::StreamClosed(StreamCloseType::Normal)).to_vec();
        payload.push(0);
        assert!(matches!(
            decode(&payload),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        // Frame with a value name of declared length 2 but invalid UTF-8.
        let mut buf = BytesMut::new();
        buf.put_u16(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(TYPE_FRAME);
        buf.put_u8(0); // kind
        buf.put_u32(1); // generation
        buf.put_u8(0); // no definitions
        buf.put_u32(1); // one row
        buf.put_i64(0); // timestamp
        buf.put_u32(1); // one value
        buf.put_u16(2); // name length
        buf.put_slice(&[0xff, 0xfe]); // invalid UTF-8
        assert!(matches!(
            decode(&buf),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_float_bits_preserved() {
        for v in [0.0, -0.0, f64::MIN_POSITIVE, 1.0 / 3.0, f64::MAX] {
            let message = Message::Frame(Frame {
                kind: DataKind::Parameters,
                generation: 1,
                definitions: None,
                rows: vec![Row::at(0).value("v", v)],
            });
            let decoded = decode(&encode(&message)).unwrap();
            let Message::Frame(frame) = decoded else {
                panic!("expected frame");
            };
            let Some(Value::Float(out)) = frame.rows[0].values.get("v") else {
                panic!("expected float");
            };
            assert_eq!(out.to_bits(), v.to_bits());
        }
    }
}
