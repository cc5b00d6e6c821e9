use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::sink::Sink;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, instrument, Instrument};

use crate::client::{AbortUploadRequest, CompleteUploadRequest, CreatedUpload, UploadPartRequest, UploadedPart};
use crate::machine::{Effect, SessionMachine};
use crate::{
    BlobError, BlobResult, Destination, SessionId, StorageClient, UploadConfig, UploadError,
    UploadEvent, UploadEvents, UploadReceipt,
};

/// Producer side of a streaming multipart upload.
///
/// `write` and `end` never block: chunks are handed to a background task that
/// owns the session state and talks to the storage client. Progress and the
/// final result are observed through the [`UploadEvents`] returned alongside.
///
/// Buffering is unbounded while the backend is slow; apply backpressure
/// upstream if that matters. Dropping the handle before calling `end` aborts
/// the upload.
pub struct UploadSession {
    destination: Destination,
    commands: mpsc::UnboundedSender<Command>,
    ready: watch::Receiver<Option<SessionId>>,
}

enum Command {
    Write(Bytes),
    End,
}

impl UploadSession {
    /// Start a session for `destination` on the current Tokio runtime
    pub fn open(
        client: Arc<dyn StorageClient>,
        destination: Destination,
        config: &UploadConfig,
    ) -> BlobResult<(Self, UploadEvents)> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| BlobError::invalid("Upload sessions must be opened inside a Tokio runtime"))?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(None);

        let actor = SessionActor {
            destination: destination.clone(),
            client,
            machine: SessionMachine::new(config.min_part_size),
            commands: commands_rx,
            completions_tx,
            completions: completions_rx,
            events: events_tx,
            ready: ready_tx,
        };
        runtime.spawn(actor.run());

        let session = Self {
            destination,
            commands: commands_tx,
            ready: ready_rx,
        };
        Ok((session, UploadEvents::new(events_rx)))
    }

    /// Buffer a chunk; a no-op once the session has finished or failed
    pub fn write(&self, chunk: impl Into<Bytes>) {
        let _ = self.commands.send(Command::Write(chunk.into()));
    }

    /// Signal that no more data is coming
    pub fn end(&self) {
        let _ = self.commands.send(Command::End);
    }

    /// Target object of this session
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Wait until the backend session exists.
    ///
    /// Returns `None` if the session ended without one.
    pub async fn ready(&self) -> Option<SessionId> {
        let mut ready = self.ready.clone();
        let result = ready.wait_for(Option::is_some).await;
        result.ok().and_then(|id| id.clone())
    }
}

impl Sink<Bytes> for UploadSession {
    type Error = Infallible;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        self.write(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.end();
        Poll::Ready(Ok(()))
    }
}

/// Result of a remote call, delivered back to the actor
enum Completion {
    Initialized(BlobResult<CreatedUpload>),
    PartUploaded {
        part_number: u32,
        result: BlobResult<UploadedPart>,
    },
    Completed(BlobResult<UploadReceipt>),
    Aborted {
        cause: UploadError,
        result: BlobResult<()>,
    },
}

enum Next {
    Command(Option<Command>),
    Completion(Completion),
}

/// Single writer of one session's state
struct SessionActor {
    destination: Destination,
    client: Arc<dyn StorageClient>,
    machine: SessionMachine,
    commands: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    events: mpsc::UnboundedSender<UploadEvent>,
    ready: watch::Sender<Option<SessionId>>,
}

impl SessionActor {
    #[instrument(name = "upload_session", skip(self), fields(bucket = %self.destination.bucket, key = %self.destination.key))]
    async fn run(mut self) {
        let mut commands_open = true;

        while !self.machine.is_reported() {
            let next = tokio::select! {
                command = self.commands.recv(), if commands_open => Next::Command(command),
                Some(completion) = self.completions.recv() => Next::Completion(completion),
            };

            let effects = match next {
                Next::Command(Some(Command::Write(chunk))) => self.machine.on_write(chunk),
                Next::Command(Some(Command::End)) => self.machine.on_end(),
                Next::Command(None) => {
                    commands_open = false;
                    self.machine.on_abandoned()
                }
                Next::Completion(completion) => self.apply(completion),
            };
            self.execute(effects);
        }

        debug!(status = ?self.machine.status(), "Upload session finished");
    }

    fn apply(&mut self, completion: Completion) -> Vec<Effect> {
        match completion {
            Completion::Initialized(result) => {
                let result = result.map(|created| {
                    self.ready.send_replace(Some(created.session_id.clone()));
                    created.session_id
                });
                self.machine.on_initialized(result)
            }
            Completion::PartUploaded { part_number, result } => {
                self.machine.on_part_uploaded(part_number, result.map(|part| part.etag))
            }
            Completion::Completed(result) => self.machine.on_completed(result),
            Completion::Aborted { cause, result } => self.machine.on_aborted(cause, result),
        }
    }

    fn execute(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Initialize => {
                    let destination = self.destination.clone();
                    self.call(
                        move |client| async move { client.create_multipart_upload(&destination).await },
                        Completion::Initialized,
                    );
                }
                Effect::UploadPart { session_id, part_number, body } => {
                    let request = UploadPartRequest {
                        destination: self.destination.clone(),
                        session_id,
                        part_number,
                        body,
                    };
                    self.call(
                        move |client| async move { client.upload_part(request).await },
                        move |result| Completion::PartUploaded { part_number, result },
                    );
                }
                Effect::Complete { session_id, parts } => {
                    let request = CompleteUploadRequest {
                        destination: self.destination.clone(),
                        session_id,
                        parts,
                    };
                    self.call(
                        move |client| async move { client.complete_multipart_upload(request).await },
                        Completion::Completed,
                    );
                }
                Effect::Abort { session_id, cause } => {
                    let request = AbortUploadRequest {
                        destination: self.destination.clone(),
                        session_id,
                    };
                    self.call(
                        move |client| async move { client.abort_multipart_upload(request).await },
                        move |result| Completion::Aborted { cause, result },
                    );
                }
                Effect::Emit(event) => {
                    debug!(event = event.event_name(), "Emitting upload event");
                    // Nobody listening is fine
                    let _ = self.events.send(event);
                }
            }
        }
    }

    /// Run a remote call on its own task and feed the result back.
    ///
    /// A call that panics or is cancelled is delivered as a failed result.
    fn call<T, F, Fut, C>(&self, call: F, complete: C)
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn StorageClient>) -> Fut,
        Fut: Future<Output = BlobResult<T>> + Send + 'static,
        C: FnOnce(BlobResult<T>) -> Completion + Send + 'static,
    {
        let completions = self.completions_tx.clone();
        let join_handle = tokio::spawn(call(self.client.clone()).in_current_span());
        tokio::spawn(
            async move {
                let result = join_handle.await.unwrap_or_else(|e| {
                    error!(error = %e, "Storage call did not finish");
                    Err(BlobError::backend_message(format!("Storage call join error: {}", e)))
                });
                let _ = completions.send(complete(result));
            }
            .in_current_span(),
        );
    }
}
