//! Newline-delimited JSON backend.
//!
//! Each session gets its own append-only file at
//! `<root>/<service>/<instance>/<session_id>.ndjson`, one measurement per line.

use super::backend::{DataLoader, DataSaver, MeasurementStream, Storage};
use super::codec::{decode_record, encode_record};
use super::lifecycle::{Lifecycle, LifecycleGuard};
use super::metadata::MetadataStorage;
use crate::core::{HeapwatchError, InstanceDescription, Measurement, Result, SessionDescription};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Session files on the local filesystem.
pub struct FilesystemStorage {
    root: PathBuf,
    sync_write: bool,
    metadata: Arc<dyn MetadataStorage>,
    lifecycle: Lifecycle,
}

impl FilesystemStorage {
    pub fn open(root: PathBuf, sync_write: bool, metadata: Arc<dyn MetadataStorage>) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            sync_write,
            metadata,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the file holding `session`.
    pub fn session_path(&self, session: &SessionDescription) -> PathBuf {
        self.root
            .join(path_component(&session.instance.service_name))
            .join(path_component(&session.instance.instance_name))
            .join(format!("{}.ndjson", session.session_id))
    }

    async fn create_session_file(&self, session: &SessionDescription) -> Result<File> {
        let path = self.session_path(session);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(file)
    }
}

/// Keeps names usable as a single directory level. Session ids are globally
/// unique, so two names collapsing to the same component cannot clash.
fn path_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match cleaned.as_str() {
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn new_data_saver(&self, instance: &InstanceDescription) -> Result<Box<dyn DataSaver>> {
        let guard = self.lifecycle.acquire()?;
        let session = self.metadata.start_session(instance).await?;

        let file = match self.create_session_file(&session).await {
            Ok(file) => file,
            Err(e) => {
                if let Err(stop_err) = self.metadata.stop_session(&session).await {
                    tracing::warn!("Failed to stop orphaned session {}: {}", session, stop_err);
                }
                return Err(HeapwatchError::storage(format!(
                    "cannot create data file for session {session}: {e}"
                )));
            }
        };

        tracing::debug!("Opened {} for session {}", self.session_path(&session).display(), session);
        Ok(Box::new(FilesystemDataSaver {
            session,
            file,
            sync_write: self.sync_write,
            buf: Vec::with_capacity(4096),
            metadata: Arc::clone(&self.metadata),
            _guard: guard,
        }))
    }

    async fn new_data_loader(&self, session: &SessionDescription) -> Result<Box<dyn DataLoader>> {
        let guard = self.lifecycle.acquire()?;
        self.metadata.get_session_metadata(session).await?;

        let path = self.session_path(session);
        match tokio::fs::metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HeapwatchError::not_found(format!("no data for session {session}")));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Box::new(FilesystemDataLoader {
            session: session.clone(),
            path,
            _guard: guard,
        }))
    }

    fn metadata(&self) -> Arc<dyn MetadataStorage> {
        Arc::clone(&self.metadata)
    }

    async fn quit(&self) {
        self.lifecycle.shutdown().await;
        tracing::info!("Filesystem storage at {} shut down", self.root.display());
    }
}

pub struct FilesystemDataSaver {
    session: SessionDescription,
    file: File,
    sync_write: bool,
    buf: Vec<u8>,
    metadata: Arc<dyn MetadataStorage>,
    _guard: LifecycleGuard,
}

#[async_trait]
impl DataSaver for FilesystemDataSaver {
    fn session(&self) -> &SessionDescription {
        &self.session
    }

    async fn save(&mut self, measurement: &Measurement) -> Result<()> {
        self.buf.clear();
        encode_record(measurement, &mut self.buf)?;
        self.file.write_all(&self.buf).await?;
        self.file.flush().await?;
        if self.sync_write {
            self.file.sync_data().await?;
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let FilesystemDataSaver {
            session,
            mut file,
            metadata,
            _guard,
            ..
        } = *self;

        let flushed = file.flush().await;
        let stopped = metadata.stop_session(&session).await;
        drop(file);
        drop(_guard);

        flushed?;
        stopped
    }
}

pub struct FilesystemDataLoader {
    session: SessionDescription,
    path: PathBuf,
    _guard: LifecycleGuard,
}

struct ReadState {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    // Raw bytes of the current line; decoding happens per record.
    line: Vec<u8>,
    ctx: CancellationToken,
    done: bool,
}

enum Step {
    Cancelled,
    Read(std::io::Result<usize>),
}

#[async_trait]
impl DataLoader for FilesystemDataLoader {
    fn session(&self) -> &SessionDescription {
        &self.session
    }

    fn load(&mut self, ctx: CancellationToken) -> MeasurementStream<'_> {
        let state = ReadState {
            path: self.path.clone(),
            reader: None,
            line: Vec::with_capacity(4096),
            ctx,
            done: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                if state.reader.is_none() {
                    match File::open(&state.path).await {
                        Ok(file) => state.reader = Some(BufReader::new(file)),
                        Err(e) => {
                            state.done = true;
                            return Some((Err(e.into()), state));
                        }
                    }
                }

                let step = {
                    let reader = state.reader.as_mut()?;
                    state.line.clear();
                    tokio::select! {
                        biased;
                        _ = state.ctx.cancelled() => Step::Cancelled,
                        read = reader.read_until(b'\n', &mut state.line) => Step::Read(read),
                    }
                };

                match step {
                    Step::Cancelled => {
                        state.done = true;
                        return Some((Err(HeapwatchError::Cancelled), state));
                    }
                    Step::Read(Ok(0)) => return None,
                    Step::Read(Ok(_)) => {
                        if state.line.iter().all(u8::is_ascii_whitespace) {
                            continue;
                        }
                        let record = decode_record(&state.line);
                        return Some((record, state));
                    }
                    Step::Read(Err(e)) => {
                        state.done = true;
                        return Some((Err(e.into()), state));
                    }
                }
            }
        })
        .boxed()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
