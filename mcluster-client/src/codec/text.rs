//! # Text Protocol Encoding and Parsing
//!
//! Purpose: Encode memcached ASCII commands and parse replies line by line,
//! reading value payloads by their declared length.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Each call decodes exactly one reply unit.
//! 2. **Buffer Reuse**: The caller supplies the line buffer.
//! 3. **Binary-Safe**: Value bodies are read with `read_exact`, so embedded
//!    `\r\n` is fine.
//! 4. **Fail Fast**: Bad framing returns a protocol error immediately.

use std::io::{self, BufRead, Read};

use bytes::{BufMut, BytesMut};

use mcluster_common::{Item, McError, McResult, StoreMode};

use super::{check_length, is_temporary_message, Frame, Request};

/// Longest reply line accepted (keys are at most 250 bytes).
const MAX_LINE: u64 = 4096;

/// Encodes a text command into `out`.
pub fn encode(request: &Request<'_>, out: &mut BytesMut) {
    match *request {
        Request::Get { keys, cas } => {
            out.put_slice(if cas { &b"gets"[..] } else { &b"get"[..] });
            for key in keys {
                out.put_u8(b' ');
                out.put_slice(key);
            }
            out.put_slice(b"\r\n");
        }
        Request::Store {
            mode,
            key,
            value,
            flags,
            ttl,
        } => {
            out.put_slice(mode.verb().as_bytes());
            out.put_u8(b' ');
            out.put_slice(key);
            out.put_u8(b' ');
            put_decimal(out, flags as u64);
            out.put_u8(b' ');
            put_decimal(out, ttl.to_wire() as u64);
            out.put_u8(b' ');
            put_decimal(out, value.len() as u64);
            if let StoreMode::Cas(token) = mode {
                out.put_u8(b' ');
                put_decimal(out, token);
            }
            out.put_slice(b"\r\n");
            out.put_slice(value);
            out.put_slice(b"\r\n");
        }
        Request::Delete { key } => {
            out.put_slice(b"delete ");
            out.put_slice(key);
            out.put_slice(b"\r\n");
        }
        Request::Touch { key, ttl } => {
            out.put_slice(b"touch ");
            out.put_slice(key);
            out.put_u8(b' ');
            put_decimal(out, ttl.to_wire() as u64);
            out.put_slice(b"\r\n");
        }
        Request::Arith { key, delta, incr } => {
            out.put_slice(if incr { b"incr " } else { b"decr " });
            out.put_slice(key);
            out.put_u8(b' ');
            put_decimal(out, delta);
            out.put_slice(b"\r\n");
        }
        Request::Flush { delay } => {
            out.put_slice(b"flush_all");
            if delay.as_secs() > 0 {
                out.put_u8(b' ');
                put_decimal(out, delay.to_wire() as u64);
            }
            out.put_slice(b"\r\n");
        }
        Request::Version => out.put_slice(b"version\r\n"),
        Request::Stats => out.put_slice(b"stats\r\n"),
    }
}

/// Reads one reply unit from the buffered reader.
pub fn read_frame<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    limit: Option<usize>,
) -> McResult<Frame> {
    read_line(reader, line_buf)?;
    let line = line_buf.as_slice();

    if let Some(rest) = line.strip_prefix(b"VALUE ") {
        let header = parse_value_header(rest)?;
        check_length(header.bytes, limit)?;

        let mut value = vec![0u8; header.bytes];
        reader.read_exact(&mut value)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(McError::protocol("value not terminated by CRLF"));
        }

        return Ok(Frame::Value(Item {
            key: header.key,
            value,
            flags: header.flags,
            cas: header.cas,
        }));
    }

    let frame = match line {
        b"END" => Frame::End,
        b"STORED" => Frame::Stored,
        b"NOT_STORED" => Frame::NotStored,
        b"EXISTS" => Frame::Exists,
        b"NOT_FOUND" => Frame::NotFound,
        b"DELETED" => Frame::Deleted,
        b"TOUCHED" => Frame::Touched,
        b"OK" => Frame::Ok,
        b"ERROR" => Frame::ServerError {
            message: "ERROR".to_string(),
            temporary: false,
        },
        _ => parse_other(line)?,
    };
    Ok(frame)
}

struct ValueHeader {
    key: Vec<u8>,
    flags: u32,
    bytes: usize,
    cas: u64,
}

fn parse_value_header(rest: &[u8]) -> McResult<ValueHeader> {
    let mut fields = rest.split(|&b| b == b' ').filter(|f| !f.is_empty());
    let key = fields
        .next()
        .ok_or_else(|| McError::protocol("VALUE line without key"))?;
    let flags = fields
        .next()
        .ok_or_else(|| McError::protocol("VALUE line without flags"))?;
    let bytes = fields
        .next()
        .ok_or_else(|| McError::protocol("VALUE line without length"))?;
    let cas = fields.next();
    if fields.next().is_some() {
        return Err(McError::protocol("VALUE line has trailing fields"));
    }

    let flags = parse_u64(flags)?;
    if flags > u32::MAX as u64 {
        return Err(McError::protocol("flags out of range"));
    }
    let bytes = parse_u64(bytes)?;
    let bytes = usize::try_from(bytes).map_err(|_| McError::protocol("length out of range"))?;

    Ok(ValueHeader {
        key: key.to_vec(),
        flags: flags as u32,
        bytes,
        cas: cas.map(parse_u64).transpose()?.unwrap_or(0),
    })
}

fn parse_other(line: &[u8]) -> McResult<Frame> {
    if let Some(rest) = line.strip_prefix(b"STAT ") {
        let text = String::from_utf8_lossy(rest);
        let (name, value) = text.split_once(' ').unwrap_or((text.as_ref(), ""));
        return Ok(Frame::Stat {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix(b"VERSION ") {
        return Ok(Frame::Version(String::from_utf8_lossy(rest).into_owned()));
    }
    if let Some(rest) = line.strip_prefix(b"SERVER_ERROR") {
        let message = String::from_utf8_lossy(rest).trim().to_string();
        return Ok(Frame::ServerError {
            temporary: is_temporary_message(&message),
            message,
        });
    }
    if let Some(rest) = line.strip_prefix(b"CLIENT_ERROR") {
        return Ok(Frame::ServerError {
            message: String::from_utf8_lossy(rest).trim().to_string(),
            temporary: false,
        });
    }
    if !line.is_empty() && line.iter().all(u8::is_ascii_digit) {
        return Ok(Frame::Number(parse_u64(line)?));
    }
    Err(McError::protocol(format!(
        "unexpected reply {:?}",
        String::from_utf8_lossy(line)
    )))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> McResult<()> {
    buf.clear();
    let bytes = reader.by_ref().take(MAX_LINE).read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed connection").into());
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' || buf[buf.len() - 1] != b'\n' {
        return Err(McError::protocol("reply line not terminated by CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_u64(data: &[u8]) -> McResult<u64> {
    if data.is_empty() {
        return Err(McError::protocol("empty number"));
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(McError::protocol("invalid digit in number"));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or_else(|| McError::protocol("number overflows u64"))?;
    }
    Ok(value)
}

fn put_decimal(out: &mut BytesMut, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcluster_common::Ttl;
    use std::io::Cursor;

    fn encoded(request: Request<'_>) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode(&request, &mut out);
        out.to_vec()
    }

    fn frame(data: &[u8], limit: Option<usize>) -> McResult<Frame> {
        let mut reader = Cursor::new(data.to_vec());
        let mut line = Vec::new();
        read_frame(&mut reader, &mut line, limit)
    }

    #[test]
    fn encodes_multi_get() {
        let keys = vec![b"k1".to_vec(), b"k3".to_vec()];
        assert_eq!(encoded(Request::Get { keys: &keys, cas: false }), b"get k1 k3\r\n");
        assert_eq!(encoded(Request::Get { keys: &keys, cas: true }), b"gets k1 k3\r\n");
    }

    #[test]
    fn encodes_store_commands() {
        let request = Request::Store {
            mode: StoreMode::Set,
            key: b"key",
            value: b"hello",
            flags: 7,
            ttl: Ttl::from_secs(60),
        };
        assert_eq!(encoded(request), b"set key 7 60 5\r\nhello\r\n");

        let request = Request::Store {
            mode: StoreMode::Cas(99),
            key: b"key",
            value: b"",
            flags: 0,
            ttl: Ttl::NEVER,
        };
        assert_eq!(encoded(request), b"cas key 0 0 0 99\r\n\r\n");
    }

    #[test]
    fn encodes_touch_arith_and_admin() {
        assert_eq!(
            encoded(Request::Touch { key: b"key", ttl: Ttl::from_secs(300) }),
            b"touch key 300\r\n"
        );
        assert_eq!(
            encoded(Request::Arith { key: b"n", delta: 12, incr: false }),
            b"decr n 12\r\n"
        );
        assert_eq!(encoded(Request::Delete { key: b"gone" }), b"delete gone\r\n");
        assert_eq!(encoded(Request::Flush { delay: Ttl::NEVER }), b"flush_all\r\n");
        assert_eq!(encoded(Request::Flush { delay: Ttl::from_secs(5) }), b"flush_all 5\r\n");
        assert_eq!(encoded(Request::Stats), b"stats\r\n");
    }

    #[test]
    fn parses_value_with_embedded_crlf() {
        let parsed = frame(b"VALUE key 42 7 1234\r\nab\r\ncde\r\n", None).unwrap();
        assert_eq!(
            parsed,
            Frame::Value(Item {
                key: b"key".to_vec(),
                value: b"ab\r\ncde".to_vec(),
                flags: 42,
                cas: 1234,
            })
        );
    }

    #[test]
    fn streams_frames_until_end() {
        let mut reader = Cursor::new(b"VALUE a 0 1\r\nx\r\nVALUE c 1 2\r\nyz\r\nEND\r\n".to_vec());
        let mut line = Vec::new();
        let mut keys = Vec::new();
        loop {
            match read_frame(&mut reader, &mut line, None).unwrap() {
                Frame::Value(item) => keys.push(item.key),
                Frame::End => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn enforces_caller_limit_before_reading_body() {
        let err = frame(b"VALUE key 0 10\r\n0123456789\r\n", Some(9)).unwrap_err();
        assert!(matches!(err, McError::Oversize { declared: 10, limit: 9 }));
        assert!(frame(b"VALUE key 0 10\r\n0123456789\r\n", Some(10)).is_ok());
    }

    #[test]
    fn rejects_malformed_lengths() {
        for data in [
            &b"VALUE key 0 1x\r\nx\r\n"[..],
            b"VALUE key 0 -1\r\n",
            b"VALUE key 0\r\n",
            b"VALUE key 99999999999 1\r\nx\r\n",
            b"VALUE key 0 99999999999999999999999\r\n",
        ] {
            assert!(matches!(frame(data, None), Err(McError::Protocol(_))), "{data:?}");
        }
    }

    #[test]
    fn rejects_short_body_terminator() {
        let err = frame(b"VALUE key 0 2\r\nabXY", None).unwrap_err();
        assert!(matches!(err, McError::Protocol(_)));
    }

    #[test]
    fn eof_is_connection_error() {
        assert!(matches!(frame(b"", None), Err(McError::Connection(_))));
        assert!(matches!(frame(b"VALUE key 0 5\r\nab", None), Err(McError::Connection(_))));
    }

    #[test]
    fn parses_status_replies() {
        assert_eq!(frame(b"STORED\r\n", None).unwrap(), Frame::Stored);
        assert_eq!(frame(b"NOT_STORED\r\n", None).unwrap(), Frame::NotStored);
        assert_eq!(frame(b"TOUCHED\r\n", None).unwrap(), Frame::Touched);
        assert_eq!(frame(b"NOT_FOUND\r\n", None).unwrap(), Frame::NotFound);
        assert_eq!(frame(b"DELETED\r\n", None).unwrap(), Frame::Deleted);
        assert_eq!(frame(b"17\r\n", None).unwrap(), Frame::Number(17));
        assert_eq!(frame(b"VERSION 1.6.21\r\n", None).unwrap(), Frame::Version("1.6.21".into()));
        assert_eq!(
            frame(b"STAT curr_items 12\r\n", None).unwrap(),
            Frame::Stat { name: "curr_items".into(), value: "12".into() }
        );
    }

    #[test]
    fn parses_error_replies() {
        assert_eq!(
            frame(b"SERVER_ERROR out of memory storing object\r\n", None).unwrap(),
            Frame::ServerError {
                message: "out of memory storing object".into(),
                temporary: true
            }
        );
        assert_eq!(
            frame(b"CLIENT_ERROR bad data chunk\r\n", None).unwrap(),
            Frame::ServerError { message: "bad data chunk".into(), temporary: false }
        );
        assert!(matches!(frame(b"ERROR\r\n", None).unwrap(), Frame::ServerError { .. }));
        assert!(matches!(frame(b"WHAT\r\n", None), Err(McError::Protocol(_))));
        assert!(matches!(frame(b"END\n", None), Err(McError::Protocol(_))));
    }
}
