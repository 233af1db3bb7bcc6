//! Connection registry
//!
//! Every opened input gets a connection id. Outputs the muxer opens for that
//! input are resolved through the connection, so a host-provided opener sees
//! the same id for the input and all files derived from it. Openers can be
//! installed globally or for a single URL; URL-scoped openers are dropped
//! when the connection for that URL is released.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::{
    output_name, AvType, FileInput, FileOutput, InputBackend, InputOpener, MemoryInput,
    MemoryOutput, MemoryStore, OutputBackend, OutputOpener, OutputTarget, UdpInput,
};
use crate::config::IoConfig;
use crate::error::{AvpipeError, Result};

/// A pair of host openers
#[derive(Clone)]
pub struct Openers {
    pub input: Arc<dyn InputOpener>,
    pub output: Arc<dyn OutputOpener>,
}

enum OutputRoute {
    Builtin,
    Host(Arc<dyn OutputOpener>),
}

struct Connection {
    url: String,
    route: OutputRoute,
    url_scoped: bool,
    outputs: DashMap<i64, AvType>,
}

pub struct HandleRegistry {
    io: IoConfig,
    target: OutputTarget,
    memory: MemoryStore,
    next_fd: AtomicI64,
    global: RwLock<Option<Openers>>,
    per_url: DashMap<String, Openers>,
    connections: DashMap<i64, Connection>,
}

impl HandleRegistry {
    pub fn new(io: IoConfig, target: OutputTarget, memory: MemoryStore) -> Self {
        Self {
            io,
            target,
            memory,
            next_fd: AtomicI64::new(1),
            global: RwLock::new(None),
            per_url: DashMap::new(),
            connections: DashMap::new(),
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn io_config(&self) -> &IoConfig {
        &self.io
    }

    /// Install openers used for every URL without a URL-scoped pair.
    pub fn set_openers(&self, openers: Openers) {
        *self.global.write() = Some(openers);
    }

    /// Install openers for one URL only.
    pub fn set_url_openers(&self, url: impl Into<String>, openers: Openers) {
        self.per_url.insert(url.into(), openers);
    }

    pub fn has_url_openers(&self, url: &str) -> bool {
        self.per_url.contains_key(url)
    }

    fn next_fd(&self) -> i64 {
        self.next_fd.fetch_add(1, Ordering::Relaxed)
    }

    /// Open `url` and register a connection for it.
    pub fn open_input(&self, url: &str) -> Result<(i64, InputBackend)> {
        let fd = self.next_fd();
        let (scoped, host) = self.openers_for(url);

        let opened = match host {
            Some(openers) => openers
                .input
                .open(fd, url)
                .map(|h| (InputBackend::External(h), OutputRoute::Host(openers.output))),
            None => self
                .open_builtin_input(url)
                .map(|b| (b, OutputRoute::Builtin)),
        };
        let (backend, route) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                // no connection will ever release scoped openers for a failed open
                if scoped && self.per_url.remove(url).is_some() {
                    tracing::debug!(url, "url openers dropped after failed open");
                }
                return Err(e);
            }
        };

        tracing::debug!(fd, url, backend = backend.kind(), "input connection opened");
        self.register(fd, url, route, scoped);
        Ok((fd, backend))
    }

    /// Register a connection that only produces outputs (the muxing path).
    pub fn open_connection(&self, url: &str) -> i64 {
        let fd = self.next_fd();
        let (scoped, host) = self.openers_for(url);
        let route = match host {
            Some(openers) => OutputRoute::Host(openers.output),
            None => OutputRoute::Builtin,
        };
        tracing::debug!(fd, url, "output connection opened");
        self.register(fd, url, route, scoped);
        fd
    }

    fn openers_for(&self, url: &str) -> (bool, Option<Openers>) {
        match self.per_url.get(url) {
            Some(o) => (true, Some(o.value().clone())),
            None => (false, self.global.read().clone()),
        }
    }

    fn register(&self, fd: i64, url: &str, route: OutputRoute, url_scoped: bool) {
        self.connections.insert(
            fd,
            Connection {
                url: url.to_string(),
                route,
                url_scoped,
                outputs: DashMap::new(),
            },
        );
    }

    fn open_builtin_input(&self, url: &str) -> Result<InputBackend> {
        if url.starts_with("udp://") {
            Ok(InputBackend::Udp(UdpInput::bind(url, &self.io)?))
        } else if let Some(name) = url.strip_prefix("mem://") {
            let data = self
                .memory
                .get(name)
                .ok_or_else(|| AvpipeError::io("open", format!("no memory entry {}", name)))?;
            Ok(InputBackend::Memory(MemoryInput::new(data)))
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(InputBackend::File(FileInput::open(path)?))
        }
    }

    /// Open an output belonging to connection `handle`.
    pub fn open_output(
        &self,
        handle: i64,
        stream_index: i32,
        seg_index: i32,
        kind: AvType,
    ) -> Result<(i64, OutputBackend)> {
        let conn = self
            .connections
            .get(&handle)
            .ok_or_else(|| AvpipeError::io("open", format!("unknown connection {}", handle)))?;
        let fd = self.next_fd();
        let name = output_name(kind, stream_index, seg_index);

        let backend = match &conn.route {
            OutputRoute::Host(opener) => OutputBackend::External(opener.open(
                handle,
                fd,
                stream_index,
                seg_index,
                kind,
            )?),
            OutputRoute::Builtin => match &self.target {
                OutputTarget::Files { root } => OutputBackend::File(FileOutput::create(
                    root.join(format!("O{}", handle)).join(&name),
                )?),
                OutputTarget::Memory {
                    store,
                    initial_capacity,
                } => OutputBackend::Memory(MemoryOutput::new(
                    store.clone(),
                    format!("O{}/{}", handle, name),
                    *initial_capacity,
                )),
            },
        };

        conn.outputs.insert(fd, kind);
        tracing::debug!(handle, fd, %kind, stream_index, seg_index, name, "output opened");
        Ok((fd, backend))
    }

    /// Forget a closed output.
    pub fn close_output(&self, handle: i64, fd: i64) {
        if let Some(conn) = self.connections.get(&handle) {
            conn.outputs.remove(&fd);
        }
    }

    pub fn open_outputs(&self, handle: i64) -> usize {
        self.connections
            .get(&handle)
            .map(|c| c.outputs.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drop a connection, and its URL-scoped openers if it used them.
    pub fn release(&self, handle: i64) {
        let Some((_, conn)) = self.connections.remove(&handle) else {
            return;
        };
        if !conn.outputs.is_empty() {
            tracing::warn!(
                handle,
                url = %conn.url,
                open = conn.outputs.len(),
                "connection released with outputs still open"
            );
        }
        if conn.url_scoped {
            self.per_url.remove(&conn.url);
        }
        tracing::debug!(handle, url = %conn.url, "connection released");
    }
}

/// Releases an input connection when dropped
pub struct ConnectionGuard {
    registry: Arc<HandleRegistry>,
    id: i64,
}

impl ConnectionGuard {
    pub fn new(registry: Arc<HandleRegistry>, id: i64) -> Self {
        Self { registry, id }
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}
