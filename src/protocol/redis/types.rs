use bytes::Bytes;

/// A RESP2 frame as exchanged with cluster nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    NullBulk,
    Array(Vec<RespValue>),
    NullArray,
}

impl RespValue {
    pub fn simple<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::SimpleString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn error<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::Error(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn bulk<T: AsRef<[u8]>>(value: T) -> Self {
        RespValue::BulkString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// Build a command frame out of plain arguments.
    pub fn command<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        RespValue::Array(parts.into_iter().map(RespValue::bulk).collect())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    /// Payload of string-like frames.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(data) | RespValue::BulkString(data) => Some(data.as_ref()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            RespValue::SimpleString(data) | RespValue::BulkString(data) => {
                std::str::from_utf8(data).ok()?.parse().ok()
            }
            _ => None,
        }
    }

    /// Error text, if this frame is an error reply.
    pub fn error_message(&self) -> Option<String> {
        match self {
            RespValue::Error(data) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_accessor_parses_string_frames() {
        assert_eq!(RespValue::Integer(7).as_integer(), Some(7));
        assert_eq!(RespValue::bulk("42").as_integer(), Some(42));
        assert_eq!(RespValue::bulk("x").as_integer(), None);
        assert_eq!(RespValue::NullBulk.as_integer(), None);
    }

    #[test]
    fn command_builds_bulk_array() {
        let frame = RespValue::command(["GET", "foo"]);
        assert_eq!(
            frame,
            RespValue::Array(vec![RespValue::bulk("GET"), RespValue::bulk("foo")])
        );
        assert_eq!(RespValue::error("ERR x").error_message().as_deref(), Some("ERR x"));
    }
}
