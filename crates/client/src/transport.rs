use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

use murmur_protocol::ChatRequest;

use crate::error::ClientResult;

/// How the transport reported the end of one response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Body finished without a transport-level fault.
    Success,
    /// Server answered with a non-success HTTP status.
    HttpStatus(u16),
    /// Connection-level failure while sending or reading.
    NetworkError(String),
}

/// One notification from the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw body bytes, delivered in arrival order.
    Body(Vec<u8>),
    /// Terminal notification; nothing follows it.
    Closed(StreamEnd),
}

pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receiving side of one chat exchange's byte stream.
///
/// Dropping the stream cancels the exchange, so a released connection is the
/// worst case on every exit path.
pub struct TransportEventStream {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl TransportEventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<TransportEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for TransportEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub struct TransportHandle {
    pub stream: TransportEventStream,
    pub worker: TransportWorker,
}

/// Byte-stream transport collaborator for chat exchanges.
///
/// Implementations own request construction, authentication, and connection
/// handling; the session consumes only byte chunks and the terminal
/// notification.
pub trait ChatTransport: Send + Sync {
    fn send_chat(&self, request: ChatRequest) -> ClientResult<TransportHandle>;
}

/// Builds the channel trio a transport worker needs: the event sender it
/// feeds, the stream handed to the session, and the cancel signal it must
/// honor.
pub fn make_transport_stream() -> (
    mpsc::UnboundedSender<TransportEvent>,
    TransportEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        TransportEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_events_in_order() {
        let (event_tx, mut stream, _cancel_rx) = make_transport_stream();
        event_tx
            .send(TransportEvent::Body(b"chunk".to_vec()))
            .unwrap();
        event_tx
            .send(TransportEvent::Closed(StreamEnd::Success))
            .unwrap();

        assert_eq!(
            stream.recv().await,
            Some(TransportEvent::Body(b"chunk".to_vec()))
        );
        assert_eq!(
            stream.recv().await,
            Some(TransportEvent::Closed(StreamEnd::Success))
        );
    }

    #[tokio::test]
    async fn dropping_the_stream_signals_cancel() {
        let (_event_tx, stream, cancel_rx) = make_transport_stream();
        drop(stream);
        assert!(cancel_rx.await.is_ok());
    }

    #[tokio::test]
    async fn explicit_cancel_fires_once() {
        let (_event_tx, mut stream, cancel_rx) = make_transport_stream();
        assert!(stream.cancel());
        assert!(!stream.cancel());
        assert!(cancel_rx.await.is_ok());
    }
}
