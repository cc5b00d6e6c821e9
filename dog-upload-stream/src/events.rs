use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;

use crate::{CompletedPart, UploadError, UploadReceipt};

/// Notification emitted by an upload session
#[derive(Debug)]
pub enum UploadEvent {
    /// A part was acknowledged. Emitted in acknowledgment order, which may
    /// differ from part-number order.
    Part(CompletedPart),

    /// The object was assembled. Emitted at most once.
    Uploaded(UploadReceipt),

    /// The session failed. Emitted at most once, never together with `Uploaded`.
    Error(UploadError),
}

impl UploadEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Part(_) => "part",
            Self::Uploaded(_) => "uploaded",
            Self::Error(_) => "error",
        }
    }

    /// Whether this event ends the session
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Part(_))
    }
}

/// Receiving side of a session's notifications.
///
/// The stream ends after the terminal `Uploaded` or `Error` event.
pub struct UploadEvents {
    receiver: mpsc::UnboundedReceiver<UploadEvent>,
}

impl UploadEvents {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<UploadEvent>) -> Self {
        Self { receiver }
    }

    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<UploadEvent> {
        self.receiver.recv().await
    }

    /// Skip part notifications and wait for the session's final result
    pub async fn outcome(mut self) -> Result<UploadReceipt, UploadError> {
        while let Some(event) = self.receiver.recv().await {
            match event {
                UploadEvent::Part(_) => continue,
                UploadEvent::Uploaded(receipt) => return Ok(receipt),
                UploadEvent::Error(err) => return Err(err),
            }
        }
        Err(UploadError::Abandoned)
    }
}

impl Stream for UploadEvents {
    type Item = UploadEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
