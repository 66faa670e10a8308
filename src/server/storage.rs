//! GuidStore durable storage logging module implementation.

use std::fmt;
use std::io::SeekFrom;
use std::path::Path;

use crate::server::ReplicaTag;
use crate::utils::GuidStoreError;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Log action ID type.
pub type LogActionId = u64;

/// Action command to the logger. File cursor will be positioned at EOF after
/// every action.
#[derive(Debug, Serialize, Deserialize)]
pub enum LogAction<Ent> {
    /// Read a log entry out.
    Read { offset: usize },

    /// Append a log entry to EOF.
    Append { entry: Ent, sync: bool },

    /// Truncate the log at given offset, keeping the head part.
    Truncate { offset: usize },

    /// Discard the log before given offset, keeping the tail part (and
    /// optionally a head part).
    Discard { offset: usize, keep: usize },
}

/// Action result returned by the logger.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum LogResult<Ent> {
    /// `Some(entry)` if a whole entry could be decoded at the offset, else
    /// `None`.
    Read {
        entry: Option<Ent>,
        end_offset: usize,
    },

    /// `now_size` is the size of file after this.
    Append { now_size: usize },

    /// `offset_ok` is true if truncate successful, else false.
    Truncate { offset_ok: bool, now_size: usize },

    /// `offset_ok` is true if discard successful, else false.
    Discard { offset_ok: bool, now_size: usize },
}

/// Durable storage logging module.
pub struct StorageHub<Ent> {
    /// My replica tag.
    me: ReplicaTag,

    /// Sender side of the log channel.
    tx_log: mpsc::UnboundedSender<(LogActionId, LogAction<Ent>)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(LogActionId, LogResult<Ent>)>,

    /// Join handle of the logger task.
    _logger_handle: JoinHandle<()>,
}

// StorageHub public API implementation
impl<Ent> StorageHub<Ent>
where
    Ent: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a new durable storage logging hub. Spawns the logger task.
    /// Creates a log channel for submitting logging actions to the logger and
    /// an ack channel for getting results. Prepares the given backing file as
    /// durability backend.
    pub async fn new_and_setup(
        me: ReplicaTag,
        path: &Path,
    ) -> Result<Self, GuidStoreError> {
        let backer = BackerFile::open(me, path).await?;

        let (tx_log, rx_log) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let logger_handle =
            tokio::spawn(Self::logger_task(me, backer, rx_log, tx_ack));

        Ok(StorageHub {
            me,
            tx_log,
            rx_ack,
            _logger_handle: logger_handle,
        })
    }

    /// Submits an action by sending it to the log channel.
    pub fn submit_action(
        &mut self,
        id: LogActionId,
        action: LogAction<Ent>,
    ) -> Result<(), GuidStoreError> {
        self.tx_log
            .send((id, action))
            .map_err(|e| GuidStoreError::msg(e.to_string()))
    }

    /// Waits for the next logging result by receiving from the ack channel.
    pub async fn get_result(
        &mut self,
    ) -> Result<(LogActionId, LogResult<Ent>), GuidStoreError> {
        match self.rx_ack.recv().await {
            Some((id, result)) => Ok((id, result)),
            None => logged_err!(self.me; "ack channel has been closed"),
        }
    }

    /// Submits an action and waits for its result. Results of actions
    /// submitted earlier that arrive in the meantime are returned alongside,
    /// in order, for the caller to handle.
    #[allow(clippy::type_complexity)]
    pub async fn do_sync_action(
        &mut self,
        action: LogAction<Ent>,
    ) -> Result<
        (Vec<(LogActionId, LogResult<Ent>)>, LogResult<Ent>),
        GuidStoreError,
    > {
        self.submit_action(SYNC_ACTION_ID, action)?;

        let mut old_results = vec![];
        loop {
            let (rid, result) = self.get_result().await?;
            if rid == SYNC_ACTION_ID {
                return Ok((old_results, result));
            }
            old_results.push((rid, result));
        }
    }
}

/// Action ID reserved for synchronous actions; never used by callers.
const SYNC_ACTION_ID: LogActionId = LogActionId::MAX;

/// Open backing file with its size tracked.
struct BackerFile {
    me: ReplicaTag,
    file: File,
    size: usize,
}

impl BackerFile {
    /// Opens (creating if missing) the file at `path` with cursor at EOF.
    async fn open(me: ReplicaTag, path: &Path) -> Result<Self, GuidStoreError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_debug!(me; "created backer file '{}'", path.display());
        } else {
            pf_debug!(me; "backer file '{}' already exists", path.display());
        }

        let mut file =
            OpenOptions::new().read(true).write(true).open(path).await?;
        let size = file.metadata().await?.len() as usize;
        file.seek(SeekFrom::End(0)).await?;
        Ok(BackerFile { me, file, size })
    }

    /// Read out entry at given offset. A header or body running past EOF, or
    /// an undecodable body, reads as no entry.
    async fn read_entry<Ent: DeserializeOwned>(
        &mut self,
        offset: usize,
    ) -> Result<(Option<Ent>, usize), GuidStoreError> {
        if offset + 8 > self.size {
            if offset < self.size {
                pf_warn!(
                    self.me;
                    "read header end offset {} out of file bound {}",
                    offset + 8,
                    self.size
                );
            }
            return Ok((None, offset));
        }

        // read entry length header
        self.file.seek(SeekFrom::Start(offset as u64)).await?;
        let entry_len = self.file.read_u64().await? as usize;
        let offset_e = offset + 8 + entry_len;
        if offset_e > self.size {
            pf_warn!(self.me; "read entry invalid length {}", entry_len);
            self.file.seek(SeekFrom::End(0)).await?;
            return Ok((None, offset));
        }

        // read entry content
        let mut entry_buf: Vec<u8> = vec![0; entry_len];
        self.file.read_exact(&mut entry_buf[..]).await?;
        self.file.seek(SeekFrom::End(0)).await?;
        match decode_from_slice(&entry_buf) {
            Ok(entry) => Ok((Some(entry), offset_e)),
            Err(e) => {
                pf_warn!(self.me; "undecodable entry at {}: {}", offset, e);
                Ok((None, offset))
            }
        }
    }

    /// Append given entry to EOF.
    async fn append_entry<Ent: Serialize>(
        &mut self,
        entry: &Ent,
        sync: bool,
    ) -> Result<usize, GuidStoreError> {
        let entry_bytes = encode_to_vec(entry)?;

        // entry length header first, then content
        self.file.write_u64(entry_bytes.len() as u64).await?;
        self.file.write_all(&entry_bytes[..]).await?;
        if sync {
            self.file.sync_data().await?;
        }

        self.size += 8 + entry_bytes.len();
        Ok(self.size)
    }

    /// Truncate the file at given offset, keeping the head part.
    async fn truncate(
        &mut self,
        offset: usize,
    ) -> Result<(bool, usize), GuidStoreError> {
        if offset > self.size {
            pf_warn!(
                self.me;
                "truncate offset {} exceeds file end {}",
                offset,
                self.size
            );
            return Ok((false, self.size));
        }

        self.file.set_len(offset as u64).await?;
        self.file.seek(SeekFrom::End(0)).await?;
        self.file.sync_all().await?;
        self.size = offset;
        Ok((true, self.size))
    }

    /// Discard the file before given offset, keeping the tail part (and
    /// optionally a head part of length `keep`).
    async fn discard(
        &mut self,
        offset: usize,
        keep: usize,
    ) -> Result<(bool, usize), GuidStoreError> {
        if offset > self.size {
            pf_warn!(
                self.me;
                "discard offset {} exceeds file end {}",
                offset,
                self.size
            );
            return Ok((false, self.size));
        }
        if keep > offset {
            pf_warn!(self.me; "discard keeping {} while offset is {}",
                             keep, offset);
            return Ok((false, self.size));
        }

        let tail_size = self.size - offset;
        if tail_size > 0 && keep < offset {
            // `tokio::fs` has no hole punching; move the tail down instead
            let mut tail_buf: Vec<u8> = vec![0; tail_size];
            self.file.seek(SeekFrom::Start(offset as u64)).await?;
            self.file.read_exact(&mut tail_buf[..]).await?;
            self.file.seek(SeekFrom::Start(keep as u64)).await?;
            self.file.write_all(&tail_buf[..]).await?;
        }

        self.file.set_len((keep + tail_size) as u64).await?;
        self.file.seek(SeekFrom::End(0)).await?;
        self.file.sync_all().await?;
        self.size = keep + tail_size;
        Ok((true, self.size))
    }

    /// Carry out the given action.
    async fn do_action<Ent>(
        &mut self,
        action: LogAction<Ent>,
    ) -> Result<LogResult<Ent>, GuidStoreError>
    where
        Ent: Serialize + DeserializeOwned,
    {
        match action {
            LogAction::Read { offset } => {
                let (entry, end_offset) = self.read_entry(offset).await?;
                Ok(LogResult::Read { entry, end_offset })
            }
            LogAction::Append { entry, sync } => {
                let now_size = self.append_entry(&entry, sync).await?;
                Ok(LogResult::Append { now_size })
            }
            LogAction::Truncate { offset } => {
                let (offset_ok, now_size) = self.truncate(offset).await?;
                Ok(LogResult::Truncate {
                    offset_ok,
                    now_size,
                })
            }
            LogAction::Discard { offset, keep } => {
                let (offset_ok, now_size) = self.discard(offset, keep).await?;
                Ok(LogResult::Discard {
                    offset_ok,
                    now_size,
                })
            }
        }
    }
}

// StorageHub logger task implementation
impl<Ent> StorageHub<Ent>
where
    Ent: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Logger task function.
    async fn logger_task(
        me: ReplicaTag,
        mut backer: BackerFile,
        mut rx_log: mpsc::UnboundedReceiver<(LogActionId, LogAction<Ent>)>,
        tx_ack: mpsc::UnboundedSender<(LogActionId, LogResult<Ent>)>,
    ) {
        pf_debug!(me; "logger task spawned");

        while let Some((id, action)) = rx_log.recv().await {
            match backer.do_action(action).await {
                Ok(result) => {
                    if let Err(e) = tx_ack.send((id, result)) {
                        pf_error!(me; "error sending to tx_ack: {}", e);
                    }
                }
                Err(e) => {
                    pf_error!(me; "error during logging: {}", e);
                }
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "logger task exited");
    }
}
