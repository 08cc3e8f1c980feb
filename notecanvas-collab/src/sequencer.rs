//! Server-side authority for one document.
//!
//! ```text
//!  Submission(op, base_version)
//!        │
//!        ▼
//!  transform against log[base_version..]   (everything the client missed)
//!        │
//!        ▼
//!  apply to canonical Document ── reject on bounds violation
//!        │
//!        ▼
//!  append to log  ──► Sequenced { op', version = log.len() }
//! ```
//!
//! The `Sequencer` itself is plain synchronous state. Total order comes
//! from [`SequencerHandle`], which moves the sequencer into a single tokio
//! task and feeds it submissions one at a time.
//!
//! Each log is tagged with a random epoch when it starts. Version numbers
//! only mean something within one epoch: a room that closes and reopens
//! starts a new log, and a client holding a position from the old one gets
//! a full snapshot instead of entries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::ot::{apply, transform, Document, OtError, Operation};

/// An operation as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Client-chosen id; resubmitting the same id is idempotent.
    pub id: Uuid,
    pub client_id: Uuid,
    pub operation: Operation,
    /// Last server version the client had integrated when it produced
    /// `operation`.
    pub base_version: u64,
}

/// A log entry: an accepted operation in its canonical (transformed) form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequenced {
    pub operation: Operation,
    /// Document version right after this operation (1-based log position).
    pub version: u64,
    /// Originating client, if the operation arrived as a [`Submission`].
    pub client_id: Option<Uuid>,
    pub submission_id: Option<Uuid>,
}

/// A point in one particular log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub epoch: Uuid,
    pub version: u64,
}

/// What a (re)joining client needs to reach the current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchUp {
    /// Full document, present when the client had no usable position.
    pub document: Option<Document>,
    pub epoch: Uuid,
    pub version: u64,
    /// Log entries after the client's known version (empty with a full
    /// document).
    pub entries: Vec<Sequenced>,
}

/// Canonical document plus its append-only operation log.
#[derive(Debug)]
pub struct Sequencer {
    epoch: Uuid,
    document: Document,
    log: Vec<Sequenced>,
    /// `lengths[v]` is the document length at version `v`.
    lengths: Vec<usize>,
    /// Submission id → version it was accepted at.
    accepted: HashMap<Uuid, u64>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self::with_document(Document::default())
    }

    /// Start a log at version 0 over existing content.
    pub fn with_document(document: Document) -> Self {
        let len = document.len();
        Self {
            epoch: Uuid::new_v4(),
            document,
            log: Vec::new(),
            lengths: vec![len],
            accepted: HashMap::new(),
        }
    }

    /// Current version: the number of accepted operations.
    pub fn version(&self) -> u64 {
        self.log.len() as u64
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    pub fn position(&self) -> LogPosition {
        LogPosition {
            epoch: self.epoch,
            version: self.version(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn snapshot(&self) -> (Document, u64) {
        (self.document.clone(), self.version())
    }

    /// Accept `op`, produced by a client that had seen `client_version`.
    ///
    /// Returns the operation as appended to the log and the new version.
    /// On error the document and log are untouched.
    pub fn receive_operation(
        &mut self,
        op: Operation,
        client_version: u64,
    ) -> Result<(Operation, u64), OtError> {
        let entry = self.sequence(op, client_version, None)?;
        Ok((entry.operation, entry.version))
    }

    /// Accept a client submission.
    ///
    /// A submission whose id was already accepted returns the original log
    /// entry without applying anything again.
    pub fn submit(&mut self, submission: Submission) -> Result<Sequenced, OtError> {
        if let Some(entry) = self
            .accepted
            .get(&submission.id)
            .and_then(|v| self.log.get((*v as usize).saturating_sub(1)))
        {
            log::debug!(
                "Duplicate submission {} from {}, already at version {}",
                submission.id,
                submission.client_id,
                entry.version
            );
            return Ok(entry.clone());
        }

        let id = submission.id;
        let entry = self.sequence(
            submission.operation,
            submission.base_version,
            Some((submission.client_id, id)),
        )?;
        self.accepted.insert(id, entry.version);
        Ok(entry)
    }

    /// Log entries after `version`.
    pub fn entries_since(&self, version: u64) -> Result<&[Sequenced], OtError> {
        let current = self.version();
        if version > current {
            return Err(OtError::VersionAhead {
                client: version,
                server: current,
            });
        }
        Ok(&self.log[version as usize..])
    }

    /// Accepted operations after `version`, in log order.
    pub fn operations_since(&self, version: u64) -> Result<Vec<Operation>, OtError> {
        Ok(self
            .entries_since(version)?
            .iter()
            .map(|e| e.operation.clone())
            .collect())
    }

    /// Catch-up for a client that last integrated `known`.
    ///
    /// Entries are only sent for a position in this log; anything else
    /// gets the full document.
    pub fn catch_up(&self, known: Option<LogPosition>) -> CatchUp {
        let entries = known
            .filter(|k| k.epoch == self.epoch)
            .and_then(|k| self.entries_since(k.version).ok());
        match entries {
            Some(entries) => CatchUp {
                document: None,
                epoch: self.epoch,
                version: self.version(),
                entries: entries.to_vec(),
            },
            None => CatchUp {
                document: Some(self.document.clone()),
                epoch: self.epoch,
                version: self.version(),
                entries: Vec::new(),
            },
        }
    }

    /// Replace the whole document with `text` as one server-originated
    /// log entry, built against the current version.
    pub fn replace_content(&mut self, text: &str) -> Result<Sequenced, OtError> {
        let server = Uuid::nil();
        let op = Operation::sequence(vec![
            Operation::delete(0, self.document.len(), server, 0),
            Operation::insert(0, text, server, 0),
        ]);
        let version = self.version();
        self.sequence(op, version, None)
    }

    fn sequence(
        &mut self,
        op: Operation,
        client_version: u64,
        origin: Option<(Uuid, Uuid)>,
    ) -> Result<Sequenced, OtError> {
        let server_version = self.version();
        if client_version > server_version {
            return Err(OtError::VersionAhead {
                client: client_version,
                server: server_version,
            });
        }

        // Must be well-formed against the state the client actually saw.
        op.validate(self.lengths[client_version as usize])?;

        let transformed = self.log[client_version as usize..]
            .iter()
            .fold(op, |acc, seen| transform(&acc, &seen.operation));

        let document = apply(&self.document, &transformed)?;
        self.lengths.push(document.len());
        self.document = document;

        let entry = Sequenced {
            operation: transformed,
            version: server_version + 1,
            client_id: origin.map(|(client, _)| client),
            submission_id: origin.map(|(_, id)| id),
        };
        self.log.push(entry.clone());
        Ok(entry)
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

/// Errors from talking to a sequencer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    /// The sequencer refused the operation.
    Rejected(OtError),
    /// The sequencer task is gone.
    Stopped,
}

impl std::fmt::Display for SequencerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequencerError::Rejected(e) => write!(f, "Operation rejected: {e}"),
            SequencerError::Stopped => write!(f, "Sequencer stopped"),
        }
    }
}

impl std::error::Error for SequencerError {}

impl From<OtError> for SequencerError {
    fn from(e: OtError) -> Self {
        SequencerError::Rejected(e)
    }
}

enum Command {
    Submit {
        submission: Submission,
        reply: oneshot::Sender<Result<Sequenced, OtError>>,
    },
    CatchUp {
        known: Option<LogPosition>,
        reply: oneshot::Sender<CatchUp>,
    },
    Replace {
        text: String,
        reply: oneshot::Sender<Result<Sequenced, OtError>>,
    },
    Shutdown {
        reply: oneshot::Sender<(Document, u64)>,
    },
}

/// Cloneable handle to a sequencer running in its own task.
///
/// Commands are queued and processed strictly one at a time, so the log
/// order is the order in which the task dequeues submissions.
#[derive(Clone)]
pub struct SequencerHandle {
    tx: mpsc::Sender<Command>,
    epoch: Uuid,
}

impl SequencerHandle {
    /// Move `sequencer` into a new task.
    ///
    /// `on_sequenced` runs inside the task for every newly appended entry,
    /// before the submitter is answered, so anything it publishes is
    /// published in log order.
    pub fn spawn<F>(sequencer: Sequencer, queue_capacity: usize, on_sequenced: F) -> Self
    where
        F: Fn(&Sequenced) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let epoch = sequencer.epoch();
        tokio::spawn(run(sequencer, rx, on_sequenced));
        Self { tx, epoch }
    }

    /// Epoch of the log this task owns.
    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    pub async fn submit(&self, submission: Submission) -> Result<Sequenced, SequencerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit { submission, reply })
            .await
            .map_err(|_| SequencerError::Stopped)?;
        Ok(rx.await.map_err(|_| SequencerError::Stopped)??)
    }

    pub async fn catch_up(&self, known: Option<LogPosition>) -> Result<CatchUp, SequencerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CatchUp { known, reply })
            .await
            .map_err(|_| SequencerError::Stopped)?;
        rx.await.map_err(|_| SequencerError::Stopped)
    }

    /// See [`Sequencer::replace_content`].
    pub async fn replace_content(&self, text: impl Into<String>) -> Result<Sequenced, SequencerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Replace {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| SequencerError::Stopped)?;
        Ok(rx.await.map_err(|_| SequencerError::Stopped)??)
    }

    /// Stop the task after everything queued ahead of this call, returning
    /// the final document and version.
    pub async fn shutdown(&self) -> Result<(Document, u64), SequencerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| SequencerError::Stopped)?;
        rx.await.map_err(|_| SequencerError::Stopped)
    }
}

async fn run<F>(mut sequencer: Sequencer, mut rx: mpsc::Receiver<Command>, on_sequenced: F)
where
    F: Fn(&Sequenced) + Send + 'static,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Submit { submission, reply } => {
                let before = sequencer.version();
                let result = sequencer.submit(submission);
                match &result {
                    Ok(entry) if entry.version > before => on_sequenced(entry),
                    Ok(_) => {}
                    Err(e) => log::warn!("Rejected operation at version {before}: {e}"),
                }
                let _ = reply.send(result);
            }
            Command::CatchUp { known, reply } => {
                let _ = reply.send(sequencer.catch_up(known));
            }
            Command::Replace { text, reply } => {
                let result = sequencer.replace_content(&text);
                match &result {
                    Ok(entry) => on_sequenced(entry),
                    Err(e) => log::error!("Failed to replace content: {e}"),
                }
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(sequencer.snapshot());
                break;
            }
        }
    }
    log::debug!("Sequencer task exiting at version {}", sequencer.version());
}
