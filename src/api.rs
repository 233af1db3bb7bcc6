//! Public entry points
//!
//! [`Avpipe`] owns the connection registry, the in-memory store and the
//! session table. Sessions are created with [`Avpipe::tx_init`], run with
//! [`Avpipe::tx_run`] and cancelled from any thread with
//! [`Avpipe::tx_cancel`].

use std::sync::Arc;

use crate::config::AvpipeConfig;
use crate::error::Result;
use crate::io::{HandleRegistry, MemoryStore, Openers, OutputTarget};
use crate::mux::{self, MuxStats};
use crate::params::TxParams;
use crate::probe::{self, ProbeInfo};
use crate::session::{CancelFlags, SessionTable, TxJob, TxSession};
use crate::transcode::{Transcoder, TxStats};

pub struct Avpipe {
    config: AvpipeConfig,
    registry: Arc<HandleRegistry>,
    sessions: SessionTable,
}

impl Avpipe {
    /// Outputs go to files under `config.output.root`.
    pub fn new(config: AvpipeConfig) -> Result<Self> {
        let target = OutputTarget::Files {
            root: config.output.root.clone(),
        };
        Self::with_target(config, target, MemoryStore::new())
    }

    /// Outputs go to `store` under `O<connection>/<name>`; `mem://` inputs
    /// are read from the same store.
    pub fn in_memory(config: AvpipeConfig, store: MemoryStore) -> Result<Self> {
        let target = OutputTarget::Memory {
            store: store.clone(),
            initial_capacity: config.io.output_buffer_size,
        };
        Self::with_target(config, target, store)
    }

    fn with_target(config: AvpipeConfig, target: OutputTarget, store: MemoryStore) -> Result<Self> {
        config.validate()?;
        crate::ffmpeg_utils::init()?;
        let registry = Arc::new(HandleRegistry::new(config.io.clone(), target, store));
        let sessions = SessionTable::new(config.session.capacity);
        Ok(Self {
            config,
            registry,
            sessions,
        })
    }

    pub fn config(&self) -> &AvpipeConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryStore {
        self.registry.memory()
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Host openers for every URL without URL-scoped ones.
    pub fn set_openers(&self, openers: Openers) {
        self.registry.set_openers(openers);
    }

    /// Host openers for `url` only; dropped when its connection is released.
    pub fn set_url_openers(&self, url: impl Into<String>, openers: Openers) {
        self.registry.set_url_openers(url, openers);
    }

    /// Prepare a session and park it in the table.
    pub fn tx_init(&self, params: &TxParams, url: &str) -> Result<i32> {
        // claim the slot before anything is opened or written
        let slot = self.sessions.reserve()?;
        let transcoder = self.build(params, url)?;
        let session = TxSession::new(url, Box::new(transcoder));
        let handle = slot.install(session)?;
        tracing::info!(handle, url, "session initialized");
        Ok(handle)
    }

    /// Run a parked session to completion, then free it whatever the outcome.
    pub fn tx_run(&self, handle: i32) -> Result<TxStats> {
        let result = self.sessions.run(handle);
        match &result {
            Ok(stats) => tracing::info!(handle, packets = stats.pump.packets_read, "session done"),
            Err(e) => tracing::warn!(handle, error = %e, status = e.status(), "session failed"),
        }
        result
    }

    /// Request cancellation; the run returns `Cancelled` at its next packet.
    pub fn tx_cancel(&self, handle: i32) -> Result<()> {
        self.sessions.cancel(handle)
    }

    /// Init, run and tear down in one call without exposing a handle.
    pub fn tx(&self, params: &TxParams, url: &str) -> Result<TxStats> {
        let mut transcoder = self.build(params, url)?;
        transcoder.run(&CancelFlags::default())
    }

    pub fn probe(&self, url: &str, seekable: bool) -> Result<ProbeInfo> {
        probe::probe(&self.registry, url, seekable)
    }

    /// Mux the inputs listed in `params.mux_spec` into `url`.
    pub fn mux(&self, params: &TxParams, url: &str) -> Result<MuxStats> {
        mux::mux(&self.registry, params, url)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn build(&self, params: &TxParams, url: &str) -> Result<Transcoder> {
        Transcoder::build(
            self.registry.clone(),
            params,
            url,
            self.config.pump.reorder_grace_frames,
        )
    }
}
