//! Framed binary codec for driver-engine communication.
//!
//! Implements the framing over tokio-util's codec traits so both sides can
//! drive the protocol through `FramedRead`/`FramedWrite`. All integers are
//! big-endian; strings are `u32 length || bytes`; `Data` is the tagged
//! recursive encoding of `protocol.rs`.
//!
//! Decoding is incremental: a partial frame yields `Ok(None)` and leaves the
//! buffer untouched, a malformed frame is an `InvalidData` io error (fatal
//! to the stream). The one recoverable malformation is an oversized string
//! as the whole body of an `Eval`/`Store` command: the decoder discards the
//! declared byte count without buffering it and yields a `Rejected` event so
//! the engine can answer on the reply channel and keep the session alive.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{
    CMD_APPLY, CMD_EVAL, CMD_REMOVE, CMD_STORE, Command, CommandFrame, DATA_INT, DATA_LIST,
    DATA_OBJECT, DATA_STRING, Data, ObjectId, REPLY_FAILURE, REPLY_SUCCESS, Reply, ReplyFrame,
};

/// Decoder outcome for the command stream.
///
/// `Rejected` stands in for a command whose string body exceeded the
/// engine-side length limit; the bytes were already discarded and the engine
/// must answer `seq` with a failure reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    Command(CommandFrame),
    Rejected { seq: u64, reason: String },
}

// ============================================================================
// Incremental byte reader
// ============================================================================

/// Why a decode attempt stopped early.
enum Wire {
    /// The buffer does not yet hold a whole frame.
    Incomplete,
    /// The frame can never be valid; the stream is unusable.
    Invalid(String),
    /// A top-level command string exceeded the configured limit. `header`
    /// is the number of bytes consumed up to and including the length
    /// prefix; `declared` bytes of payload follow and must be discarded.
    Oversized { seq: u64, declared: u64, header: usize },
}

/// Cursor over the undecoded prefix of the receive buffer. Nothing is
/// consumed from the real buffer until a whole frame has been read.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Wire> {
        if self.buf.len() - self.pos < n {
            return Err(Wire::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, Wire> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, Wire> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, Wire> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    fn i64(&mut self) -> Result<i64, Wire> {
        Ok(self.u64()? as i64)
    }

    /// Length-prefixed string. `max` guards nested occurrences where an
    /// oversized length cannot be recovered from.
    fn string(&mut self, max: usize) -> Result<String, Wire> {
        let len = self.u32()? as usize;
        if len > max {
            return Err(Wire::Invalid(format!(
                "string length {len} exceeds limit {max}"
            )));
        }
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

fn decode_data(r: &mut Reader<'_>, max_string: usize) -> Result<Data, Wire> {
    match r.u8()? {
        DATA_INT => Ok(Data::Int(r.i64()?)),
        DATA_STRING => Ok(Data::String(r.string(max_string)?)),
        DATA_LIST => {
            let len = r.u64()?;
            // Claimed lengths are untrusted; never preallocate from them.
            let mut items = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                items.push(decode_data(r, max_string)?);
            }
            Ok(Data::List(items))
        }
        DATA_OBJECT => Ok(Data::Object(ObjectId::from_raw(r.u64()?))),
        other => Err(Wire::Invalid(format!("unknown data tag {other:#04x}"))),
    }
}

fn encode_data(data: &Data, dst: &mut BytesMut) -> io::Result<()> {
    match data {
        Data::Int(value) => {
            dst.put_u8(DATA_INT);
            dst.put_i64(*value);
        }
        Data::String(text) => {
            dst.put_u8(DATA_STRING);
            put_string(text, dst)?;
        }
        Data::List(items) => {
            dst.put_u8(DATA_LIST);
            dst.put_u64(items.len() as u64);
            for item in items {
                encode_data(item, dst)?;
            }
        }
        Data::Object(id) => {
            dst.put_u8(DATA_OBJECT);
            dst.put_u64(id.as_u64());
        }
    }
    Ok(())
}

fn put_string(text: &str, dst: &mut BytesMut) -> io::Result<()> {
    let len = u32::try_from(text.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string exceeds u32 length"))?;
    dst.put_u32(len);
    dst.put_slice(text.as_bytes());
    Ok(())
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

// ============================================================================
// Command codec (driver encodes, engine decodes)
// ============================================================================

/// Bytes of an oversized string still to be discarded before the command
/// stream resynchronizes at the next frame.
struct Skip {
    seq: u64,
    remaining: u64,
    declared: u64,
}

pub struct CommandCodec {
    max_string_len: usize,
    skip: Option<Skip>,
}

impl CommandCodec {
    pub fn new() -> Self {
        Self::with_max_string_len(u32::MAX as usize)
    }

    /// Engine-side constructor: strings longer than `max_string_len` bytes
    /// are rejected recoverably instead of being buffered.
    pub fn with_max_string_len(max_string_len: usize) -> Self {
        Self {
            max_string_len,
            skip: None,
        }
    }

    fn decode_frame(&self, r: &mut Reader<'_>) -> Result<CommandFrame, Wire> {
        let seq = r.u64()?;
        let tag = r.u8()?;
        let command = match tag {
            CMD_EVAL | CMD_STORE => {
                let len = r.u32()? as u64;
                if len as usize > self.max_string_len {
                    return Err(Wire::Oversized {
                        seq,
                        declared: len,
                        header: r.consumed(),
                    });
                }
                let text = String::from_utf8_lossy(r.take(len as usize)?).into_owned();
                if tag == CMD_EVAL {
                    Command::Eval { code: text }
                } else {
                    Command::Store { expr: text }
                }
            }
            CMD_APPLY => {
                let function = ObjectId::from_raw(r.u64()?);
                let arg = decode_data(r, self.max_string_len)?;
                Command::Apply { function, arg }
            }
            CMD_REMOVE => {
                let ids = decode_data(r, self.max_string_len)?;
                Command::Remove { ids }
            }
            other => return Err(Wire::Invalid(format!("unknown command tag {other:#04x}"))),
        };
        Ok(CommandFrame { seq, command })
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for CommandCodec {
    type Item = CommandEvent;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(skip) = &mut self.skip {
                let take = skip.remaining.min(src.len() as u64) as usize;
                src.advance(take);
                skip.remaining -= take as u64;
                if skip.remaining > 0 {
                    return Ok(None);
                }
                let Skip { seq, declared, .. } = match self.skip.take() {
                    Some(skip) => skip,
                    None => unreachable!("skip state checked above"),
                };
                return Ok(Some(CommandEvent::Rejected {
                    seq,
                    reason: format!("string of {declared} bytes exceeds engine limit"),
                }));
            }

            let mut reader = Reader::new(&src[..]);
            return match self.decode_frame(&mut reader) {
                Ok(frame) => {
                    let consumed = reader.consumed();
                    src.advance(consumed);
                    Ok(Some(CommandEvent::Command(frame)))
                }
                Err(Wire::Incomplete) => Ok(None),
                Err(Wire::Invalid(message)) => Err(invalid(message)),
                Err(Wire::Oversized {
                    seq,
                    declared,
                    header,
                }) => {
                    src.advance(header);
                    self.skip = Some(Skip {
                        seq,
                        remaining: declared,
                        declared,
                    });
                    continue;
                }
            };
        }
    }
}

impl Encoder<CommandFrame> for CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: CommandFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u64(frame.seq);
        match &frame.command {
            Command::Eval { code } => {
                dst.put_u8(CMD_EVAL);
                put_string(code, dst)?;
            }
            Command::Store { expr } => {
                dst.put_u8(CMD_STORE);
                put_string(expr, dst)?;
            }
            Command::Apply { function, arg } => {
                dst.put_u8(CMD_APPLY);
                dst.put_u64(function.as_u64());
                encode_data(arg, dst)?;
            }
            Command::Remove { ids } => {
                dst.put_u8(CMD_REMOVE);
                encode_data(ids, dst)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Reply codec (engine encodes, driver decodes)
// ============================================================================

pub struct ReplyCodec;

impl ReplyCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReplyCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_reply(r: &mut Reader<'_>) -> Result<ReplyFrame, Wire> {
    let seq = r.u64()?;
    let reply = match r.u8()? {
        REPLY_SUCCESS => Reply::Success(decode_data(r, u32::MAX as usize)?),
        REPLY_FAILURE => Reply::Failure(r.string(u32::MAX as usize)?),
        other => return Err(Wire::Invalid(format!("unknown reply tag {other:#04x}"))),
    };
    Ok(ReplyFrame { seq, reply })
}

impl Decoder for ReplyCodec {
    type Item = ReplyFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut reader = Reader::new(&src[..]);
        match decode_reply(&mut reader) {
            Ok(frame) => {
                let consumed = reader.consumed();
                src.advance(consumed);
                Ok(Some(frame))
            }
            Err(Wire::Incomplete) => Ok(None),
            Err(Wire::Invalid(message)) => Err(invalid(message)),
            Err(Wire::Oversized { declared, .. }) => Err(invalid(format!(
                "string length {declared} exceeds limit"
            ))),
        }
    }
}

impl Encoder<ReplyFrame> for ReplyCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: ReplyFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u64(frame.seq);
        match &frame.reply {
            Reply::Success(data) => {
                dst.put_u8(REPLY_SUCCESS);
                encode_data(data, dst)?;
            }
            Reply::Failure(message) => {
                dst.put_u8(REPLY_FAILURE);
                put_string(message, dst)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_command(frame: CommandFrame) -> BytesMut {
        let mut codec = CommandCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn eval_frame_byte_layout() {
        let buf = encode_command(CommandFrame {
            seq: 1,
            command: Command::Eval {
                code: "hi".to_string(),
            },
        });
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 0, 0, 0, 0, 1, // seq, big-endian
                0x01, // eval tag
                0, 0, 0, 2, // string length, big-endian u32
                b'h', b'i',
            ]
        );
    }

    #[test]
    fn apply_frame_byte_layout() {
        let buf = encode_command(CommandFrame {
            seq: 2,
            command: Command::Apply {
                function: ObjectId::from_raw(5),
                arg: Data::Int(-1),
            },
        });
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 0, 0, 0, 0, 2, // seq
                0x07, // apply tag
                0, 0, 0, 0, 0, 0, 0, 5, // function id
                0x01, // data: int tag
                0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // -1 as i64
            ]
        );
    }

    #[test]
    fn command_roundtrip() {
        let frame = CommandFrame {
            seq: 42,
            command: Command::Remove {
                ids: Data::List(vec![Data::Int(1), Data::Int(7)]),
            },
        };
        let mut buf = encode_command(frame.clone());
        let mut codec = CommandCodec::new();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, CommandEvent::Command(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn nested_data_roundtrip() {
        let arg = Data::List(vec![
            Data::Int(3),
            Data::String("αβ".to_string()),
            Data::List(vec![Data::Object(ObjectId::from_raw(9))]),
        ]);
        let frame = CommandFrame {
            seq: 0,
            command: Command::Apply {
                function: ObjectId::from_raw(1),
                arg,
            },
        };
        let mut buf = encode_command(frame.clone());
        let mut codec = CommandCodec::new();
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            CommandEvent::Command(frame)
        );
    }

    #[test]
    fn partial_frame_yields_none() {
        let full = encode_command(CommandFrame {
            seq: 3,
            command: Command::Store {
                expr: "E_Int 1".to_string(),
            },
        });
        let mut codec = CommandCodec::new();
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(codec.decode(&mut partial).unwrap().is_none(), "cut {cut}");
        }
    }

    #[test]
    fn unknown_command_tag_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u64(0);
        buf.put_u8(0x7f);
        let mut codec = CommandCodec::new();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_data_tag_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u64(0);
        buf.put_u8(CMD_REMOVE);
        buf.put_u8(0x09); // bogus data tag
        let mut codec = CommandCodec::new();
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_string_is_skipped_and_rejected() {
        let mut codec = CommandCodec::with_max_string_len(4);
        let mut buf = BytesMut::new();
        buf.put_u64(11);
        buf.put_u8(CMD_STORE);
        buf.put_u32(10);
        buf.put_slice(b"abc"); // first chunk of the oversized payload

        // Header consumed, payload partially discarded: still waiting.
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        // Rest of the payload arrives, followed by a well-formed frame.
        buf.put_slice(b"defghij");
        let next = encode_command(CommandFrame {
            seq: 12,
            command: Command::Eval {
                code: "ok".to_string(),
            },
        });
        buf.put_slice(&next);

        match codec.decode(&mut buf).unwrap().unwrap() {
            CommandEvent::Rejected { seq, reason } => {
                assert_eq!(seq, 11);
                assert!(reason.contains("10 bytes"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        match codec.decode(&mut buf).unwrap().unwrap() {
            CommandEvent::Command(frame) => assert_eq!(frame.seq, 12),
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[test]
    fn reply_roundtrip_success() {
        let frame = ReplyFrame {
            seq: 8,
            reply: Reply::Success(Data::Object(ObjectId::from_raw(3))),
        };
        let mut codec = ReplyCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn reply_roundtrip_failure() {
        let frame = ReplyFrame {
            seq: 9,
            reply: Reply::Failure("no object 4".to_string()),
        };
        let mut codec = ReplyCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn unknown_reply_tag_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u64(0);
        buf.put_u8(0x03);
        let mut codec = ReplyCodec::new();
        assert!(codec.decode(&mut buf).is_err());
    }
}
