use std::fmt;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::utils::key_hash_slot;

use super::types::RespValue;

pub const SLOT_COUNT: u16 = 16384;

/// A command submitted to the cluster client.
///
/// The slot hint is derived from the first key when the command is built;
/// callers may override it along with the read-only classification.
#[derive(Clone)]
pub struct Command {
    parts: Vec<Bytes>,
    slot: Option<u16>,
    read_only: bool,
    redirections: usize,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field(
                "parts",
                &self
                    .parts
                    .iter()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect::<Vec<_>>(),
            )
            .field("slot", &self.slot)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Read,
    Write,
    Keyless,
}

impl Command {
    pub fn new(parts: Vec<Bytes>) -> Result<Self> {
        if parts.is_empty() {
            bail!("redis command must contain at least one element");
        }
        let kind = command_kind(&parts[0]);
        let slot = match kind {
            CommandKind::Keyless => None,
            _ => first_key(&parts).map(key_hash_slot),
        };
        Ok(Self {
            parts,
            slot,
            read_only: kind == CommandKind::Read,
            redirections: 0,
        })
    }

    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Self::new(
            args.into_iter()
                .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
                .collect(),
        )
    }

    pub fn with_slot(mut self, slot: Option<u16>) -> Self {
        self.slot = slot.map(|slot| slot % SLOT_COUNT);
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn command_name(&self) -> &[u8] {
        self.parts.first().map(|b| b.as_ref()).unwrap_or(&[])
    }

    pub fn args(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of redirects and retries consumed so far.
    pub fn redirections(&self) -> usize {
        self.redirections
    }

    pub(crate) fn record_redirection(&mut self) -> usize {
        self.redirections += 1;
        self.redirections
    }

    pub fn to_resp(&self) -> RespValue {
        RespValue::Array(
            self.parts
                .iter()
                .cloned()
                .map(RespValue::BulkString)
                .collect(),
        )
    }
}

fn first_key(parts: &[Bytes]) -> Option<&[u8]> {
    let name = uppercase_name(&parts[0]);
    match name.as_slice() {
        b"EVAL" | b"EVALSHA" | b"EVAL_RO" | b"EVALSHA_RO" | b"FCALL" | b"FCALL_RO" => {
            let numkeys = std::str::from_utf8(parts.get(2)?)
                .ok()?
                .parse::<usize>()
                .ok()?;
            if numkeys == 0 {
                return None;
            }
            parts.get(3).map(|b| b.as_ref())
        }
        b"XREAD" | b"XREADGROUP" => {
            let idx = parts
                .iter()
                .position(|part| part.eq_ignore_ascii_case(b"STREAMS"))?;
            parts.get(idx + 1).map(|b| b.as_ref())
        }
        _ => parts.get(1).map(|b| b.as_ref()),
    }
}

fn command_kind(cmd: &[u8]) -> CommandKind {
    if cmd.is_empty() {
        return CommandKind::Keyless;
    }
    let mut upper = [0u8; 32];
    let len = cmd.len().min(upper.len());
    for (i, byte) in cmd.iter().take(len).enumerate() {
        upper[i] = byte.to_ascii_uppercase();
    }
    let name = &upper[..len];
    match name {
        b"GET" | b"MGET" | b"TTL" | b"PTTL" | b"STRLEN" | b"EXISTS" | b"GETRANGE" | b"TYPE"
        | b"HGET" | b"HMGET" | b"HGETALL" | b"HEXISTS" | b"HKEYS" | b"HVALS" | b"HLEN"
        | b"HSTRLEN" | b"HSCAN" | b"SCARD" | b"SMEMBERS" | b"SISMEMBER" | b"SMISMEMBER"
        | b"SRANDMEMBER" | b"SSCAN" | b"SINTER" | b"SUNION" | b"SDIFF" | b"ZRANGE" | b"ZRANK"
        | b"ZSCORE" | b"ZMSCORE" | b"ZCARD" | b"ZREVRANGE" | b"ZCOUNT" | b"ZRANGEBYSCORE"
        | b"ZREVRANGEBYSCORE" | b"ZREVRANK" | b"ZLEXCOUNT" | b"ZRANGEBYLEX" | b"ZSCAN"
        | b"LINDEX" | b"LLEN" | b"LRANGE" | b"LPOS" | b"GETBIT" | b"BITCOUNT" | b"BITPOS"
        | b"PFCOUNT" | b"XRANGE" | b"XREVRANGE" | b"XLEN" | b"XREAD" | b"GEOPOS"
        | b"GEODIST" | b"GEOHASH" | b"GEOSEARCH" | b"DUMP" | b"OBJECT" | b"EVAL_RO"
        | b"EVALSHA_RO" | b"FCALL_RO" => CommandKind::Read,
        b"PING" | b"INFO" | b"CLUSTER" | b"CONFIG" | b"DBSIZE" | b"FLUSHALL" | b"FLUSHDB"
        | b"TIME" | b"ECHO" | b"SCRIPT" | b"FUNCTION" | b"KEYS" | b"SCAN" | b"RANDOMKEY"
        | b"HELLO" | b"AUTH" | b"READONLY" | b"READWRITE" | b"ASKING" | b"CLIENT"
        | b"COMMAND" | b"LASTSAVE" | b"SAVE" | b"BGSAVE" | b"SLOWLOG" | b"MEMORY"
        | b"PUBLISH" | b"SUBSCRIBE" | b"PSUBSCRIBE" | b"UNSUBSCRIBE" | b"PUNSUBSCRIBE"
        | b"QUIT" | b"SELECT" | b"WAIT" | b"ROLE" | b"LATENCY" | b"SWAPDB" => {
            CommandKind::Keyless
        }
        _ => CommandKind::Write,
    }
}

fn uppercase_name(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b.to_ascii_uppercase()).collect()
}
