use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::types::RespValue;

/// Largest bulk string a node may send (proto-max-bulk-len default).
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// RESP2 framing for node connections. Replies are decoded in arrival order;
/// the session pairs them with pending requests.
#[derive(Debug, Clone, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let mut pos = 0usize;
        match parse_value(&src[..], &mut pos)? {
            Some(frame) => {
                src.advance(pos);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<()> {
        write_value(&item, dst);
        Ok(())
    }
}

fn parse_value(src: &[u8], pos: &mut usize) -> Result<Option<RespValue>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let start = *pos;
    let prefix = src[*pos];
    *pos += 1;

    match prefix {
        b'+' | b'-' | b':' | b'_' => {
            let line = match read_line(src, pos)? {
                Some(line) => line,
                None => {
                    *pos = start;
                    return Ok(None);
                }
            };
            match prefix {
                b'+' => Ok(Some(RespValue::SimpleString(Bytes::copy_from_slice(line)))),
                b'-' => Ok(Some(RespValue::Error(Bytes::copy_from_slice(line)))),
                b':' => {
                    let value = std::str::from_utf8(line)?
                        .parse::<i64>()
                        .map_err(|err| anyhow!("invalid integer: {err}"))?;
                    Ok(Some(RespValue::Integer(value)))
                }
                _ => Ok(Some(RespValue::NullBulk)),
            }
        }
        b'$' => parse_bulk_string(src, pos, start),
        b'*' => parse_array(src, pos, start),
        _ => Err(anyhow!("unsupported RESP prefix '{}'", prefix as char)),
    }
}

fn parse_bulk_string(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>> {
    let line = match read_line(src, pos)? {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "bulk string")?;
    if len < 0 {
        return Ok(Some(RespValue::NullBulk));
    }
    let len = len as usize;
    if len > MAX_BULK_LEN {
        return Err(anyhow!("bulk string length {len} exceeds {MAX_BULK_LEN}"));
    }
    let end = (*pos)
        .checked_add(len)
        .and_then(|end| end.checked_add(2))
        .ok_or_else(|| anyhow!("bulk string length {len} out of range"))?;
    if end > src.len() {
        *pos = start;
        return Ok(None);
    }
    let data = &src[*pos..end - 2];
    *pos = end;
    Ok(Some(RespValue::BulkString(Bytes::copy_from_slice(data))))
}

fn parse_array(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>> {
    let mut local_pos = *pos;
    let line = match read_line(src, &mut local_pos)? {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "array")?;
    if len < 0 {
        *pos = local_pos;
        return Ok(Some(RespValue::NullArray));
    }
    let mut values = Vec::with_capacity((len as usize).min(1024));
    let mut element_pos = local_pos;
    for _ in 0..len {
        match parse_value(src, &mut element_pos)? {
            Some(value) => values.push(value),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    *pos = element_pos;
    Ok(Some(RespValue::Array(values)))
}

fn parse_length(bytes: &[u8], kind: &str) -> Result<isize> {
    let text = std::str::from_utf8(bytes)?;
    text.parse::<isize>()
        .map_err(|err| anyhow!("invalid {kind} length: {err}"))
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Ok(Some(line));
        }
        idx += 1;
    }
    Ok(None)
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(data) => write_line(b'+', data, dst),
        RespValue::Error(data) => write_line(b'-', data, dst),
        RespValue::Integer(value) => write_line(b':', value.to_string().as_bytes(), dst),
        RespValue::BulkString(data) => {
            write_line(b'$', data.len().to_string().as_bytes(), dst);
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::NullBulk => dst.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(values) => {
            write_line(b'*', values.len().to_string().as_bytes(), dst);
            for value in values {
                write_value(value, dst);
            }
        }
        RespValue::NullArray => dst.extend_from_slice(b"*-1\r\n"),
    }
}

fn write_line(prefix: u8, data: &[u8], dst: &mut BytesMut) {
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}
