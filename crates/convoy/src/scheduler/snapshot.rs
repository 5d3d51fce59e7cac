//! Persisted conversation state.
//!
//! A snapshot holds everything needed to recreate a conversation under a new
//! sequence id: the committed token count, the token history, the raw cache rows
//! and, for a conversation saved while sampleable, the logits it would sample from.
//! The sequence id itself is never persisted.
//!
//! ## Format
//!
//! All integers are big-endian.
//!
//! ```text
//! u32  magic          3430400180
//! u32  header_len
//! u64  committed      \
//! u32  history_len     |
//! i32  token * n       |
//! u8   sampleable      } header
//! u32  logits_len      |
//! f32  logit * m      /
//! u64  cache_len
//! u8   cache * cache_len
//! ```

use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SchedulerError};
use crate::sequence::Token;

/// Leading marker of every snapshot.
pub const SNAPSHOT_MAGIC: u32 = 3430400180;

const FIXED_HEADER: usize = 8 + 4 + 1 + 4;

/// In-memory form of a saved conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSnapshot {
    committed: usize,
    history: Vec<Token>,
    logits: Option<Vec<f32>>,
    cache: Vec<u8>,
}

impl ConversationSnapshot {
    /// Build a snapshot. `history` must hold exactly `committed` tokens.
    pub fn new(committed: usize, history: Vec<Token>, cache: Vec<u8>) -> Result<Self> {
        if history.len() != committed {
            return Err(invalid(format!(
                "history holds {} tokens but {} are committed",
                history.len(),
                committed
            )));
        }
        Ok(Self {
            committed,
            history,
            logits: None,
            cache,
        })
    }

    /// Attach the logits of the last committed token. A snapshot with logits loads
    /// as a sampleable conversation.
    pub fn with_logits(mut self, logits: Vec<f32>) -> Self {
        self.logits = Some(logits);
        self
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn history(&self) -> &[Token] {
        &self.history
    }

    pub fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    /// Raw rows as produced by [`KvCache::read_raw`](crate::backend::KvCache::read_raw).
    pub fn cache(&self) -> &[u8] {
        &self.cache
    }

    pub fn encode(&self) -> Bytes {
        let logits = self.logits.as_deref().unwrap_or_default();
        let header_len = FIXED_HEADER + 4 * self.history.len() + 4 * logits.len();
        let mut buf = BytesMut::with_capacity(4 + 4 + header_len + 8 + self.cache.len());

        buf.put_u32(SNAPSHOT_MAGIC);
        buf.put_u32(header_len as u32);
        buf.put_u64(self.committed as u64);
        buf.put_u32(self.history.len() as u32);
        for token in &self.history {
            buf.put_i32(token.0);
        }
        buf.put_u8(u8::from(self.logits.is_some()));
        buf.put_u32(logits.len() as u32);
        for logit in logits {
            buf.put_f32(*logit);
        }
        buf.put_u64(self.cache.len() as u64);
        buf.put_slice(&self.cache);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(invalid("truncated preamble"));
        }
        let magic = buf.get_u32();
        if magic != SNAPSHOT_MAGIC {
            return Err(invalid(format!("bad magic {magic:#010x}")));
        }

        let header_len = buf.get_u32() as usize;
        if header_len < FIXED_HEADER || buf.remaining() < header_len {
            return Err(invalid("truncated header"));
        }
        let (mut header, rest) = buf.split_at(header_len);
        buf = rest;

        let committed = usize::try_from(header.get_u64()).map_err(|_| invalid("committed count out of range"))?;
        let history_len = header.get_u32() as usize;
        if header.remaining() < 4 * history_len + 5 {
            return Err(invalid("header too short for its history"));
        }
        let history = (0..history_len).map(|_| Token(header.get_i32())).collect();

        let sampleable = match header.get_u8() {
            0 => false,
            1 => true,
            other => return Err(invalid(format!("bad sampleable flag {other}"))),
        };
        let logits_len = header.get_u32() as usize;
        if header.remaining() != 4 * logits_len {
            return Err(invalid("header length does not match logits length"));
        }
        if !sampleable && logits_len > 0 {
            return Err(invalid("logits present without sampleable flag"));
        }
        let logits: Vec<f32> = (0..logits_len).map(|_| header.get_f32()).collect();

        if buf.remaining() < 8 {
            return Err(invalid("missing cache length"));
        }
        let cache_len = usize::try_from(buf.get_u64()).map_err(|_| invalid("cache length out of range"))?;
        if buf.remaining() != cache_len {
            return Err(invalid(format!(
                "cache blob is {} bytes, header says {}",
                buf.remaining(),
                cache_len
            )));
        }

        let snapshot = Self::new(committed, history, buf.to_vec())?;
        Ok(if sampleable { snapshot.with_logits(logits) } else { snapshot })
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.encode())?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::decode(&fs::read(path)?)
    }
}

fn invalid(reason: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidSnapshot {
        reason: reason.into(),
    }
}
