//! The stream hub: one entry per configured stream, holding the codec cache
//! and the viewer set, and owning the producer supervisor lifecycle.
//!
//! The producer side casts access units; each viewer gets a bounded channel
//! and drops samples for itself when it cannot keep up. Hub locks are held
//! only for viewer-set mutations and codec reads, never across a send.

use crate::common::packet::AccessUnit;
use crate::common::CodecData;
use crate::config::SourceConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ViewerId = Uuid;

pub struct StreamHub {
    streams: DashMap<String, StreamEntry>,
    viewer_queue: usize,
}

struct StreamEntry {
    config: SourceConfig,
    codecs: Mutex<Option<Vec<CodecData>>>,
    viewers: Mutex<HashMap<ViewerId, mpsc::Sender<AccessUnit>>>,
    last_error: Mutex<Option<String>>,
    run: Mutex<RunState>,
}

enum RunState {
    Stopped,
    Running(CancellationToken),
}

/// Snapshot of one stream for the API surface.
pub struct StreamStatus {
    pub name: String,
    pub on_demand: bool,
    pub codec_ready: bool,
    pub viewers: usize,
    pub last_error: Option<String>,
}

impl StreamHub {
    pub fn new(viewer_queue: usize) -> Self {
        Self {
            streams: DashMap::new(),
            viewer_queue,
        }
    }

    pub fn insert_stream(&self, name: &str, config: SourceConfig) {
        self.streams.insert(
            name.to_string(),
            StreamEntry {
                config,
                codecs: Mutex::new(None),
                viewers: Mutex::new(HashMap::new()),
                last_error: Mutex::new(None),
                run: Mutex::new(RunState::Stopped),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    /// Fans one access unit out to every current viewer. Never blocks: the
    /// send happens outside the viewer lock, and a full channel drops the
    /// sample for that viewer only.
    pub fn cast(&self, name: &str, pkt: AccessUnit) {
        let Some(entry) = self.streams.get(name) else {
            return;
        };
        let viewers: Vec<(ViewerId, mpsc::Sender<AccessUnit>)> = entry
            .viewers
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        drop(entry);

        for (id, tx) in viewers {
            match tx.try_send(pkt.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::debug!("stream {name}: viewer {id} lagging, dropping sample");
                }
                // The viewer is being torn down; unsubscribe will follow.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Registers a viewer and returns its channel plus the codecs known so
    /// far. Starts the producer for on-demand streams.
    pub fn subscribe(
        self: &Arc<Self>,
        name: &str,
    ) -> Option<(ViewerId, mpsc::Receiver<AccessUnit>, Option<Vec<CodecData>>)> {
        let on_demand;
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.viewer_queue);
        let codecs;
        {
            let entry = self.streams.get(name)?;
            entry.viewers.lock().insert(id, tx);
            codecs = entry.codecs.lock().clone();
            on_demand = entry.config.on_demand;
        }
        if on_demand {
            self.ensure_running(name);
        }
        Some((id, rx, codecs))
    }

    pub fn unsubscribe(&self, name: &str, id: ViewerId) {
        if let Some(entry) = self.streams.get(name) {
            entry.viewers.lock().remove(&id);
        }
    }

    pub fn has_viewer(&self, name: &str) -> bool {
        self.streams
            .get(name)
            .map(|entry| !entry.viewers.lock().is_empty())
            .unwrap_or(false)
    }

    /// Replaces the codec list unconditionally (in-band parameter sets have
    /// arrived or changed).
    pub fn codec_set(&self, name: &str, codecs: Vec<CodecData>) {
        if let Some(entry) = self.streams.get(name) {
            *entry.codecs.lock() = Some(codecs);
        }
    }

    /// First-write-wins variant used with SDP-declared parameters, which
    /// cheap cameras sometimes misreport.
    pub fn codec_set_if_absent(&self, name: &str, codecs: Vec<CodecData>) {
        if let Some(entry) = self.streams.get(name) {
            let mut cached = entry.codecs.lock();
            if cached.is_none() {
                *cached = Some(codecs);
            }
        }
    }

    pub fn codecs(&self, name: &str) -> Option<Vec<CodecData>> {
        self.streams.get(name)?.codecs.lock().clone()
    }

    pub fn set_last_error(&self, name: &str, error: String) {
        if let Some(entry) = self.streams.get(name) {
            *entry.last_error.lock() = Some(error);
        }
    }

    pub fn status(&self) -> Vec<StreamStatus> {
        self.streams
            .iter()
            .map(|entry| StreamStatus {
                name: entry.key().clone(),
                on_demand: entry.config.on_demand,
                codec_ready: entry.codecs.lock().is_some(),
                viewers: entry.viewers.lock().len(),
                last_error: entry.last_error.lock().clone(),
            })
            .collect()
    }

    /// Starts the producer supervisor for a stream if it is not already
    /// running. Idempotent.
    pub fn ensure_running(self: &Arc<Self>, name: &str) {
        let Some(entry) = self.streams.get(name) else {
            return;
        };
        let mut run = entry.run.lock();
        if matches!(*run, RunState::Running(_)) {
            return;
        }
        let cancel = CancellationToken::new();
        *run = RunState::Running(cancel.clone());

        let hub = Arc::clone(self);
        let name = name.to_string();
        let config = entry.config.clone();
        tokio::spawn(async move {
            crate::sources::rtsp::supervise(hub, name, config, cancel).await;
        });
    }

    /// Called by the supervisor when it exits, so a later subscribe can
    /// start it again.
    pub fn mark_stopped(&self, name: &str) {
        if let Some(entry) = self.streams.get(name) {
            *entry.run.lock() = RunState::Stopped;
        }
    }

    /// Starts every stream that is not on-demand. Called at boot.
    pub fn start_all(self: &Arc<Self>) {
        let names: Vec<String> = self
            .streams
            .iter()
            .filter(|entry| !entry.config.on_demand)
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            self.ensure_running(&name);
        }
    }

    /// Cancels every running producer. Supervisors tear down their RTSP
    /// sessions cooperatively.
    pub fn shutdown(&self) {
        for entry in self.streams.iter() {
            if let RunState::Running(cancel) = &*entry.run.lock() {
                cancel.cancel();
            }
        }
    }
}
