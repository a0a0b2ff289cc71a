//! This module is responsible for exfilling measurement rows: the local CSV
//! log, which is the durable record, and the lossy queue feeding the upload
//! transport.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};

use chrono::{DateTime, NaiveDate, Utc};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::{
    monitoring::{bump, Counters},
    record::{header_row, MeasurementRecord, Schema},
    shutdown::ShutdownToken,
    Config, Error, Result,
};

/// The bytes one cycle appended to the log, handed to the transport as is
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadItem {
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Producer side of the upload queue. Never blocks: a full queue drops the item.
#[derive(Clone)]
pub struct UploadQueue {
    sender: Sender<UploadItem>,
    counters: Arc<Counters>,
}

pub fn upload_channel(capacity: usize, counters: Arc<Counters>) -> (UploadQueue, Receiver<UploadItem>) {
    let (sender, receiver) = bounded(capacity);
    (UploadQueue { sender, counters }, receiver)
}

impl UploadQueue {
    /// Returns whether the item was queued
    pub fn offer(&self, item: UploadItem) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => {
                bump(&self.counters.uploads_queued);
                true
            }
            Err(TrySendError::Full(item)) => {
                let dropped = bump(&self.counters.uploads_dropped);
                warn!(timestamp = %item.timestamp, dropped, "Upload queue full, dropping row");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                bump(&self.counters.uploads_dropped);
                debug!("Upload consumer gone, dropping row");
                false
            }
        }
    }
}

/// Day-rotated, append-only CSV log
pub struct LogWriter {
    dir: PathBuf,
    prefix: String,
    header: Vec<u8>,
    current: Option<(NaiveDate, File)>,
    /// The last append to the current file may have stopped mid-row
    torn: bool,
    upload: Option<UploadQueue>,
    counters: Arc<Counters>,
}

impl LogWriter {
    pub fn new(
        dir: impl AsRef<Path>,
        prefix: impl Into<String>,
        schema: &Schema,
        upload: Option<UploadQueue>,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            header: header_row(schema)?,
            current: None,
            torn: false,
            upload,
            counters,
        })
    }

    pub fn from_config(
        config: &Config,
        schema: &Schema,
        upload: Option<UploadQueue>,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        Self::new(&config.log.dir, config.log.prefix.clone(), schema, upload, counters)
    }

    /// `<dir>/<prefix>-<YYYYMMDD>T000000Z.csv`
    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}-{}T000000Z.csv", self.prefix, day.format("%Y%m%d")))
    }

    /// Open the file for `day` if it is not the current one. Returns whether
    /// the file still needs a header.
    fn rotate(&mut self, day: NaiveDate) -> Result<bool> {
        if matches!(&self.current, Some((open, _)) if *open == day) {
            return Ok(false);
        }
        let path = self.path_for(day);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let empty = file.metadata()?.len() == 0;
        info!(path = %path.display(), "Opened measurement log");
        self.current = Some((day, file));
        self.torn = false;
        Ok(empty)
    }

    /// Append `record` to the log of its capture day, then offer the same
    /// bytes for upload
    pub fn write(&mut self, record: &MeasurementRecord) -> Result<()> {
        let needs_header = self.rotate(record.timestamp().date_naive())?;
        let row = record.to_row()?;
        let payload = if needs_header {
            let mut payload = Vec::with_capacity(self.header.len() + row.len());
            payload.extend_from_slice(&self.header);
            payload.extend_from_slice(&row);
            payload
        } else {
            row
        };
        let Some((_, file)) = self.current.as_mut() else {
            return Err(Error::Io(std::io::ErrorKind::NotFound.into()));
        };
        let mut result = Ok(());
        if self.torn {
            // Terminate whatever is left of the failed row
            result = file.write_all(b"\n");
        }
        let result = result
            .and_then(|()| file.write_all(&payload))
            .and_then(|()| file.flush());
        if let Err(e) = result {
            self.torn = true;
            let errors = bump(&self.counters.log_write_errors);
            error!(%e, errors, "Measurement log write failed");
            return Err(e.into());
        }
        self.torn = false;
        bump(&self.counters.records_logged);

        if let Some(queue) = &self.upload {
            queue.offer(UploadItem {
                timestamp: record.timestamp(),
                payload,
            });
        }
        Ok(())
    }
}

/// Whatever actually moves a payload off the device
pub trait Transport: Send {
    fn post(&mut self, item: &UploadItem) -> Result<()>;
}

/// Pipes each payload into a fresh run of an external program; exit status
/// zero counts as delivered
pub struct CommandTransport {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTransport {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .upload
            .program
            .as_ref()
            .map(|program| Self::new(program, config.upload.args.clone()))
    }
}

impl Transport for CommandTransport {
    fn post(&mut self, item: &UploadItem) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Transport(format!("{}: {e}", self.program.display())))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A program that exits without reading is judged by its status below
            if let Err(e) = stdin.write_all(&item.payload) {
                debug!(%e, "Upload program closed stdin early");
            }
        }
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "{} exited with {status}",
                self.program.display()
            )))
        }
    }
}

/// Drain the upload queue into `transport` until shutdown or until every
/// producer is gone. Failed items are not retried.
pub fn run_uploader<T: Transport + ?Sized>(
    receiver: Receiver<UploadItem>,
    transport: &mut T,
    shutdown: &ShutdownToken,
    counters: &Counters,
) {
    info!("Upload consumer started");
    loop {
        select! {
            recv(receiver) -> msg => {
                let Ok(item) = msg else { break };
                match transport.post(&item) {
                    Ok(()) => {
                        bump(&counters.uploads_sent);
                    }
                    Err(e) => {
                        bump(&counters.uploads_failed);
                        warn!(%e, timestamp = %item.timestamp, "Upload failed, dropping row");
                    }
                }
            }
            recv(shutdown.signal()) -> _ => break,
        }
    }
    info!(pending = receiver.len(), "Upload consumer stopped");
}
