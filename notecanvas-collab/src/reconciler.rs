//! Client-side speculative execution.
//!
//! ```text
//!   local edit ──► apply to local doc ──► pending queue ──► head in flight ──► Sequencer
//!                                            ▲                                  │
//!                         transform both ways│                                  │
//!                                            │                                  ▼
//!   remote op  ──────────────────────────────┴──────────► apply to local doc  ack / remote
//! ```
//!
//! Only the head of the queue is ever in flight. Operations queued behind
//! it are kept transformed against every remote operation that arrives and
//! are released one at a time as acknowledgements come back, so each
//! submission's `base_version` is a version the client has fully
//! integrated.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::ot::{apply, compose, transform, Document, OtError, Operation};
use crate::sequencer::{Sequenced, Submission};

/// Errors raised while integrating local and remote operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Server traffic arrived out of the expected order. The session must
    /// resync from a canonical snapshot.
    ReconciliationDesync { expected: u64, got: u64 },
    /// An acknowledgement for a submission that is not in flight.
    UnknownAcknowledgement { submission_id: Uuid },
    /// An operation did not apply to the local document.
    Operation(OtError),
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::ReconciliationDesync { expected, got } => {
                write!(f, "Reconciliation desync: expected version {expected}, got {got}")
            }
            ReconcileError::UnknownAcknowledgement { submission_id } => {
                write!(f, "Acknowledgement for unknown submission {submission_id}")
            }
            ReconcileError::Operation(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<OtError> for ReconcileError {
    fn from(e: OtError) -> Self {
        ReconcileError::Operation(e)
    }
}

/// A local operation the Sequencer has not acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: Uuid,
    /// Current form: rebased onto every remote operation seen so far.
    pub operation: Operation,
}

/// Outcome of [`ClientReconciler::integrate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Integrated {
    /// Entry at or below the current version; already integrated.
    Duplicate,
    /// Our own in-flight operation was accepted. Carries the next
    /// submission to send, if any.
    Acknowledged(Option<Submission>),
    /// A remote operation, in the form applied to the local document.
    Applied(Operation),
}

pub struct ClientReconciler {
    client_id: Uuid,
    document: Document,
    server_version: u64,
    pending: VecDeque<PendingOperation>,
    /// The submission currently awaiting acknowledgement, exactly as sent.
    in_flight: Option<Submission>,
}

impl ClientReconciler {
    pub fn new(client_id: Uuid, document: Document, server_version: u64) -> Self {
        Self {
            client_id,
            document,
            server_version,
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// The optimistic local view.
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn server_version(&self) -> u64 {
        self.server_version
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingOperation> {
        self.pending.iter()
    }

    pub fn in_flight(&self) -> Option<&Submission> {
        self.in_flight.as_ref()
    }

    /// Apply a local edit immediately and queue it.
    ///
    /// Returns a submission when the queue was idle and this operation goes
    /// straight out. Edits made while something is in flight are merged
    /// into the queue tail where possible and wait their turn.
    pub fn apply_local_operation(
        &mut self,
        op: Operation,
    ) -> Result<Option<Submission>, ReconcileError> {
        let document = apply(&self.document, &op)?;
        self.document = document;

        let tail_is_waiting = self.pending.len() > 1 || self.in_flight.is_none();
        if tail_is_waiting {
            if let Some(tail) = self.pending.back_mut() {
                if let Some(merged) = compose(&tail.operation, &op) {
                    tail.operation = merged;
                    return Ok(None);
                }
            }
        }

        self.pending.push_back(PendingOperation {
            id: Uuid::new_v4(),
            operation: op,
        });
        Ok(self.send_head())
    }

    /// Integrate an operation this client did not originate.
    ///
    /// Every pending operation is rebased past `remote`, and `remote` is
    /// rebased past every pending operation before it touches the local
    /// document. Returns the form of `remote` that was applied.
    pub fn apply_server_operation(
        &mut self,
        remote: Operation,
        new_version: u64,
    ) -> Result<Operation, ReconcileError> {
        let mut remote = remote;
        for pending in self.pending.iter_mut() {
            let rebased = transform(&pending.operation, &remote);
            remote = transform(&remote, &pending.operation);
            pending.operation = rebased;
        }
        self.document = apply(&self.document, &remote)?;
        self.server_version = new_version;
        Ok(remote)
    }

    /// The Sequencer accepted our in-flight operation at `version`.
    ///
    /// Returns the next submission to send, if any.
    pub fn acknowledge_operation(
        &mut self,
        submission_id: Uuid,
        version: u64,
    ) -> Result<Option<Submission>, ReconcileError> {
        match &self.in_flight {
            Some(sent) if sent.id == submission_id => {}
            _ => return Err(ReconcileError::UnknownAcknowledgement { submission_id }),
        }
        let expected = self.server_version + 1;
        if version != expected {
            return Err(ReconcileError::ReconciliationDesync {
                expected,
                got: version,
            });
        }

        self.pending.pop_front();
        self.in_flight = None;
        self.server_version = version;
        Ok(self.send_head())
    }

    /// Integrate one log entry from the Sequencer, whoever authored it.
    pub fn integrate(&mut self, entry: &Sequenced) -> Result<Integrated, ReconcileError> {
        if entry.version <= self.server_version {
            return Ok(Integrated::Duplicate);
        }
        let expected = self.server_version + 1;
        if entry.version != expected {
            return Err(ReconcileError::ReconciliationDesync {
                expected,
                got: entry.version,
            });
        }

        match (entry.client_id, entry.submission_id) {
            (Some(client), Some(id)) if client == self.client_id => {
                let next = self.acknowledge_operation(id, entry.version)?;
                Ok(Integrated::Acknowledged(next))
            }
            _ => {
                let applied = self.apply_server_operation(entry.operation.clone(), entry.version)?;
                Ok(Integrated::Applied(applied))
            }
        }
    }

    /// Drop all speculative state and adopt a canonical snapshot.
    ///
    /// Returns the local operations that were discarded.
    pub fn resync(&mut self, document: Document, version: u64) -> Vec<Operation> {
        log::warn!(
            "Client {} resyncing at version {version}, dropping {} pending operation(s)",
            self.client_id,
            self.pending.len()
        );
        self.document = document;
        self.server_version = version;
        self.in_flight = None;
        self.pending.drain(..).map(|p| p.operation).collect()
    }

    /// The in-flight submission, unchanged, for resending after a
    /// reconnect. The Sequencer ignores it if it was already accepted.
    pub fn resend_head(&self) -> Option<Submission> {
        self.in_flight.clone()
    }

    fn send_head(&mut self) -> Option<Submission> {
        if self.in_flight.is_some() {
            return None;
        }
        let head = self.pending.front()?;
        let submission = Submission {
            id: head.id,
            client_id: self.client_id,
            operation: head.operation.clone(),
            base_version: self.server_version,
        };
        self.in_flight = Some(submission.clone());
        Some(submission)
    }
}
