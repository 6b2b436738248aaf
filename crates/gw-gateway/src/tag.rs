//! Message tagging - attaches a string map to a message body
//!
//! Envelope layout: `[0x00][compact JSON object][body]`. Untagged messages are
//! carried as-is. The JSON object is self-terminating, so the decoder finds the
//! body by asking the JSON reader where the object ended.
//!
//! Message buffers come from a shared `BufferPool` and go back to it exactly
//! once, when the owning `Message` is released or dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;

/// First byte of every tagged envelope
pub const TAG_MARKER: u8 = 0x00;

/// Tag keys/values; ordered so the serialized block is canonical
pub type TagMap = BTreeMap<String, String>;

const DEFAULT_BUFFER_CAPACITY: usize = 2 << 10;
const DEFAULT_MAX_POOLED: usize = 1024;
const DEFAULT_MAX_RETAINED_CAPACITY: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum TagError {
    #[error("tag block is not a string map: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tag block missing after marker")]
    Missing,

    #[error("invalid tag '{0}'")]
    InvalidTag(String),
}

// ============================================================================
// Buffer Pool
// ============================================================================

/// Free list of message buffers
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    max_retained_capacity: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl BufferPool {
    pub fn new(max_pooled: usize, max_retained_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
            max_retained_capacity,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Process-wide pool shared by all publish paths
    pub fn global() -> Arc<BufferPool> {
        static GLOBAL: OnceLock<Arc<BufferPool>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(BufferPool::default()))
            .clone()
    }

    /// Take an empty buffer with at least `capacity` bytes reserved
    pub fn get(&self, capacity: usize) -> BytesMut {
        let pooled = self.free.lock().pop();
        match pooled {
            Some(mut buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf.reserve(capacity);
                buf
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(capacity.max(DEFAULT_BUFFER_CAPACITY))
            }
        }
    }

    fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > self.max_retained_capacity {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    /// Buffers currently waiting for reuse
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOLED, DEFAULT_MAX_RETAINED_CAPACITY)
    }
}

// ============================================================================
// Message
// ============================================================================

/// A message body backed by a pooled buffer.
///
/// `release` consumes the message, so a released buffer cannot be touched
/// again. Dropping an unreleased message releases it as well.
pub struct Message {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl Message {
    /// Copy `body` into a pooled buffer without tagging it
    pub fn from_body(pool: &Arc<BufferPool>, body: &[u8]) -> Self {
        let mut buf = pool.get(body.len());
        buf.extend_from_slice(body);
        Self { buf: Some(buf), pool: pool.clone() }
    }

    pub fn body(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.body().len()
    }

    pub fn is_empty(&self) -> bool {
        self.body().is_empty()
    }

    pub fn is_tagged(&self) -> bool {
        is_tagged(self.body())
    }

    /// Return the buffer to its pool
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.len())
            .field("tagged", &self.is_tagged())
            .finish()
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Build an envelope carrying `tags` in front of `body`.
///
/// An empty tag map yields the body unchanged, without a marker.
pub fn tag_message(pool: &Arc<BufferPool>, tags: &TagMap, body: &[u8]) -> Message {
    if tags.is_empty() {
        return Message::from_body(pool, body);
    }

    let mut buf = pool.get(1 + tags_size_hint(tags) + body.len());
    buf.put_u8(TAG_MARKER);
    {
        let mut writer = (&mut buf).writer();
        // A string map always serializes
        let _ = serde_json::to_writer(&mut writer, tags);
    }
    buf.extend_from_slice(body);

    Message { buf: Some(buf), pool: pool.clone() }
}

/// True iff the buffer starts with the tag marker
pub fn is_tagged(buf: &[u8]) -> bool {
    buf.first() == Some(&TAG_MARKER)
}

/// Split an envelope into its body and tags.
///
/// Untagged input comes back unchanged with no tags.
pub fn untag_message(envelope: &[u8]) -> Result<(&[u8], TagMap), TagError> {
    if !is_tagged(envelope) {
        return Ok((envelope, TagMap::new()));
    }

    let rest = &envelope[1..];
    let mut stream = serde_json::Deserializer::from_slice(rest).into_iter::<TagMap>();
    match stream.next() {
        Some(Ok(tags)) => {
            let end = stream.byte_offset();
            Ok((&rest[end..], tags))
        }
        Some(Err(e)) => Err(TagError::Json(e)),
        None => Err(TagError::Missing),
    }
}

/// Parse the `k=v;k2=v2` tag header format
pub fn parse_tag_header(raw: &str) -> Result<TagMap, TagError> {
    let mut tags = TagMap::new();
    for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                tags.insert(k.trim().to_string(), v.trim().to_string());
            }
            _ => return Err(TagError::InvalidTag(pair.to_string())),
        }
    }
    Ok(tags)
}

fn tags_size_hint(tags: &TagMap) -> usize {
    // {"k":"v",...}
    2 + tags.iter().map(|(k, v)| k.len() + v.len() + 6).sum::<usize>()
}
