//! Upload-session state machine.
//!
//! The machine owns buffering, part numbering and lifecycle bookkeeping for a
//! single multipart upload. It performs no I/O: every input returns the
//! [`Effect`]s a driver has to carry out, and remote-call results are fed back
//! through the `on_*` methods. All methods must be called from one writer.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use crate::{BlobError, CompletedPart, SessionId, UploadError, UploadEvent, UploadReceipt, UploadStatus};

/// Work requested by the machine
#[derive(Debug)]
pub(crate) enum Effect {
    /// Issue the create-multipart call
    Initialize,
    /// Upload one part
    UploadPart {
        session_id: SessionId,
        part_number: u32,
        body: Bytes,
    },
    /// Issue the complete call with parts sorted by number
    Complete {
        session_id: SessionId,
        parts: Vec<CompletedPart>,
    },
    /// Release the backend session, then report `cause`
    Abort {
        session_id: SessionId,
        cause: UploadError,
    },
    /// Deliver a notification
    Emit(UploadEvent),
}

pub(crate) struct SessionMachine {
    min_part_size: u64,
    status: UploadStatus,
    session_id: Option<SessionId>,
    /// Initialize was issued and its result is outstanding
    awaiting_ready: bool,
    buffer: Vec<Bytes>,
    buffered_bytes: u64,
    next_part_number: u32,
    completed_parts: BTreeMap<u32, String>,
    pending_parts: usize,
    input_ended: bool,
    finalizing: bool,
    /// Failure recorded while initialize was still outstanding
    deferred_cause: Option<UploadError>,
    reported: bool,
}

impl SessionMachine {
    pub(crate) fn new(min_part_size: u64) -> Self {
        Self {
            min_part_size,
            status: UploadStatus::Active,
            session_id: None,
            awaiting_ready: false,
            buffer: Vec::new(),
            buffered_bytes: 0,
            next_part_number: 1,
            completed_parts: BTreeMap::new(),
            pending_parts: 0,
            input_ended: false,
            finalizing: false,
            deferred_cause: None,
            reported: false,
        }
    }

    pub(crate) fn status(&self) -> UploadStatus {
        self.status
    }

    #[cfg(test)]
    pub(crate) fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn pending_parts(&self) -> usize {
        self.pending_parts
    }

    #[cfg(test)]
    pub(crate) fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    /// `Uploaded` or `Error` has been emitted; nothing else will happen
    pub(crate) fn is_reported(&self) -> bool {
        self.reported
    }

    /// A chunk arrived from the producer
    pub(crate) fn on_write(&mut self, chunk: Bytes) -> Vec<Effect> {
        if self.status.is_terminal() {
            debug!(status = ?self.status, "Ignoring write on finished session");
            return Vec::new();
        }
        if self.input_ended {
            warn!("Ignoring write after end of input");
            return Vec::new();
        }

        self.buffered_bytes += chunk.len() as u64;
        self.buffer.push(chunk);

        let mut effects = Vec::new();
        if let Some(session_id) = self.session_id.clone() {
            if self.buffered_bytes > self.min_part_size {
                effects.push(self.flush_part(session_id));
            }
        }
        self.request_initialize(&mut effects);
        effects
    }

    /// The producer signalled that no more data is coming
    pub(crate) fn on_end(&mut self) -> Vec<Effect> {
        if self.status.is_terminal() || self.input_ended {
            debug!("Ignoring repeated end of input");
            return Vec::new();
        }
        self.input_ended = true;

        let mut effects = Vec::new();
        if let Some(session_id) = self.session_id.clone() {
            // An upload needs at least one part, even if it is empty
            if self.buffered_bytes > 0 || self.next_part_number == 1 {
                effects.push(self.flush_part(session_id));
            }
            self.try_finalize(&mut effects);
        } else {
            self.request_initialize(&mut effects);
        }
        effects
    }

    /// The producer went away without ending the input
    pub(crate) fn on_abandoned(&mut self) -> Vec<Effect> {
        if self.status.is_terminal() || self.input_ended {
            return Vec::new();
        }
        warn!("Upload abandoned before end of input");
        self.fail(UploadError::Abandoned)
    }

    /// Result of the create-multipart call
    pub(crate) fn on_initialized(&mut self, result: Result<SessionId, BlobError>) -> Vec<Effect> {
        self.awaiting_ready = false;

        if let Some(cause) = self.deferred_cause.take() {
            return match result {
                Ok(session_id) => {
                    self.session_id = Some(session_id.clone());
                    vec![Effect::Abort { session_id, cause }]
                }
                Err(_) => vec![self.report_error(cause)],
            };
        }
        if self.status.is_terminal() {
            return Vec::new();
        }

        match result {
            Err(source) => {
                warn!(error = %source, "Multipart upload initialization failed");
                self.fail(UploadError::Initialization { source })
            }
            Ok(session_id) => {
                info!(session_id = %session_id, "Multipart upload initialized");
                self.session_id = Some(session_id.clone());

                // First flush after ready ignores the size threshold
                let mut effects = Vec::new();
                if self.buffered_bytes > 0 || self.input_ended {
                    effects.push(self.flush_part(session_id));
                }
                self.try_finalize(&mut effects);
                effects
            }
        }
    }

    /// Result of one upload-part call
    pub(crate) fn on_part_uploaded(&mut self, part_number: u32, result: Result<String, BlobError>) -> Vec<Effect> {
        if self.status.is_terminal() {
            debug!(part_number, "Ignoring part acknowledgment on finished session");
            return Vec::new();
        }
        self.pending_parts = self.pending_parts.saturating_sub(1);

        match result {
            Err(source) => {
                warn!(part_number, error = %source, "Part upload failed");
                self.fail(UploadError::PartUpload { part_number, source })
            }
            Ok(etag) => {
                debug!(part_number, pending = self.pending_parts, "Part acknowledged");
                self.completed_parts.insert(part_number, etag.clone());

                let mut effects = vec![Effect::Emit(UploadEvent::Part(CompletedPart { part_number, etag }))];
                self.try_finalize(&mut effects);
                effects
            }
        }
    }

    /// Result of the complete call
    pub(crate) fn on_completed(&mut self, result: Result<UploadReceipt, BlobError>) -> Vec<Effect> {
        if self.status.is_terminal() {
            return Vec::new();
        }

        match result {
            Ok(receipt) => {
                info!(parts = receipt.parts, "Multipart upload completed");
                self.status = UploadStatus::Completed;
                self.reported = true;
                vec![Effect::Emit(UploadEvent::Uploaded(receipt))]
            }
            Err(source) => {
                warn!(error = %source, "Multipart upload completion failed");
                self.fail(UploadError::Completion { source })
            }
        }
    }

    /// Result of the compensating abort call
    pub(crate) fn on_aborted(&mut self, cause: UploadError, result: Result<(), BlobError>) -> Vec<Effect> {
        let err = match result {
            Ok(()) => cause,
            Err(abort) => {
                error!(error = %abort, "Failed to abort multipart upload");
                cause.with_abort_failure(abort)
            }
        };
        vec![self.report_error(err)]
    }

    fn request_initialize(&mut self, effects: &mut Vec<Effect>) {
        if self.session_id.is_none() && !self.awaiting_ready {
            self.awaiting_ready = true;
            effects.push(Effect::Initialize);
        }
    }

    /// Carve the whole buffer into the next part.
    /// Numbering and the in-flight count change here, not on acknowledgment.
    fn flush_part(&mut self, session_id: SessionId) -> Effect {
        let body = self.take_buffer();
        let part_number = self.next_part_number;
        self.next_part_number += 1;
        self.pending_parts += 1;

        debug!(part_number, size = body.len(), pending = self.pending_parts, "Flushing part");

        Effect::UploadPart {
            session_id,
            part_number,
            body,
        }
    }

    fn take_buffer(&mut self) -> Bytes {
        let chunks = std::mem::take(&mut self.buffer);
        self.buffered_bytes = 0;

        if chunks.len() == 1 {
            return chunks.into_iter().next().unwrap_or_default();
        }
        let total = chunks.iter().map(Bytes::len).sum();
        let mut combined = BytesMut::with_capacity(total);
        for chunk in chunks {
            combined.extend_from_slice(&chunk);
        }
        combined.freeze()
    }

    fn try_finalize(&mut self, effects: &mut Vec<Effect>) {
        if !self.input_ended || self.pending_parts > 0 || self.finalizing {
            return;
        }
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        self.finalizing = true;

        let parts: Vec<CompletedPart> = self
            .completed_parts
            .iter()
            .map(|(part_number, etag)| CompletedPart {
                part_number: *part_number,
                etag: etag.clone(),
            })
            .collect();

        info!(session_id = %session_id, parts = parts.len(), "Completing multipart upload");
        effects.push(Effect::Complete { session_id, parts });
    }

    /// Route a failure through abort when a backend session exists
    fn fail(&mut self, cause: UploadError) -> Vec<Effect> {
        self.status = UploadStatus::Aborted;
        self.buffer.clear();
        self.buffered_bytes = 0;

        match self.session_id.clone() {
            Some(session_id) => {
                warn!(session_id = %session_id, error = %cause, "Aborting multipart upload");
                vec![Effect::Abort { session_id, cause }]
            }
            None if self.awaiting_ready => {
                self.deferred_cause = Some(cause);
                Vec::new()
            }
            None => vec![self.report_error(cause)],
        }
    }

    fn report_error(&mut self, err: UploadError) -> Effect {
        self.status = UploadStatus::Aborted;
        self.reported = true;
        Effect::Emit(UploadEvent::Error(err))
    }
}
