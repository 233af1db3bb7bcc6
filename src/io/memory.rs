//! In-memory backends
//!
//! Outputs accumulate into a growable buffer that is published into a shared
//! [`MemoryStore`] when the muxer closes the file. Inputs serve a byte buffer,
//! typically one fetched from the same store.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use super::{resolve_seek, InputHandler, OutputHandler, StatKind, Whence};
use crate::error::Result;

/// Named byte buffers shared between sessions and the caller
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.entries.insert(name.into(), data.into());
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Bytes> {
        self.entries.remove(name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Sorted names, optionally restricted to a prefix such as `O3/`.
    pub fn names(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serves an immutable byte buffer
pub struct MemoryInput {
    data: Bytes,
    pos: usize,
}

impl MemoryInput {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl InputHandler for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.data[self.pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let size = self.data.len() as i64;
        let target = resolve_seek(self.pos as i64, Some(size), offset, whence)?;
        if whence != Whence::Size {
            self.pos = target as usize;
        }
        Ok(target)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Option<i64> {
        Some(self.data.len() as i64)
    }
}

/// Growable write buffer published to a [`MemoryStore`] on close
pub struct MemoryOutput {
    name: String,
    store: MemoryStore,
    buf: Vec<u8>,
    len: usize,
    pos: usize,
    closed: bool,
}

impl MemoryOutput {
    pub fn new(store: MemoryStore, name: impl Into<String>, initial_capacity: usize) -> Self {
        Self {
            name: name.into(),
            store,
            buf: vec![0; initial_capacity.max(1)],
            len: 0,
            pos: 0,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current backing capacity, which only ever doubles.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn reserve_to(&mut self, end: usize) {
        let mut cap = self.buf.len();
        while cap < end {
            cap *= 2;
        }
        if cap != self.buf.len() {
            tracing::trace!(name = %self.name, from = self.buf.len(), to = cap, "growing output buffer");
            self.buf.resize(cap, 0);
        }
    }
}

impl OutputHandler for MemoryOutput {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let end = self.pos + data.len();
        self.reserve_to(end);
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        self.len = self.len.max(end);
        Ok(data.len())
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let target = resolve_seek(self.pos as i64, Some(self.len as i64), offset, whence)?;
        if whence != Whence::Size {
            self.pos = target as usize;
        }
        Ok(target)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let data = Bytes::copy_from_slice(&self.buf[..self.len]);
        tracing::debug!(name = %self.name, size = self.len, "published memory output");
        self.store.insert(self.name.clone(), data);
        Ok(())
    }

    fn stat(&mut self, kind: StatKind, value: i64) -> Result<()> {
        tracing::trace!(name = %self.name, ?kind, value, "output stat");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_input_reads_to_eof() {
        let mut input = MemoryInput::new(&b"hello world"[..]);
        let mut buf = [0u8; 8];
        assert_eq!(input.read(&mut buf).unwrap(), 8);
        assert_eq!(input.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"rld");
        assert_eq!(input.read(&mut buf).unwrap(), 0);

        input.seek(6, Whence::Start).unwrap();
        assert_eq!(input.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"world");
    }

    #[test]
    fn test_memory_output_doubles_capacity() {
        let store = MemoryStore::new();
        let mut out = MemoryOutput::new(store.clone(), "O1/out.mp4", 4);
        out.write(b"abc").unwrap();
        assert_eq!(out.capacity(), 4);
        out.write(b"defgh").unwrap();
        assert_eq!(out.capacity(), 8);
        out.write(&[b'x'; 9]).unwrap();
        assert_eq!(out.capacity(), 32);
    }

    #[test]
    fn test_memory_output_published_on_close() {
        let store = MemoryStore::new();
        let mut out = MemoryOutput::new(store.clone(), "O2/init-stream0.m4s", 16);
        out.write(b"moovmdat").unwrap();
        out.seek(0, Whence::Start).unwrap();
        out.write(b"MOOV").unwrap();
        assert!(!store.contains("O2/init-stream0.m4s"));

        out.close().unwrap();
        out.close().unwrap();
        assert_eq!(
            store.get("O2/init-stream0.m4s").unwrap(),
            Bytes::from_static(b"MOOVmdat")
        );
        assert_eq!(store.names("O2/"), vec!["O2/init-stream0.m4s".to_string()]);
        assert!(store.names("O3/").is_empty());
    }
}
