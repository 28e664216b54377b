use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use murmur_protocol::{
    ChatFragment, ChatRequest, LineFrameDecoder, Message, MessageAccumulator, MessageId,
};

use crate::error::{ClientResult, SessionBusySnafu};
use crate::transport::{ChatTransport, StreamEnd, TransportEvent, TransportHandle};

/// Why an exchange ended without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Connection-level fault, or the stream closed before a terminal
    /// fragment arrived.
    Network(String),
    /// Server answered with a non-success HTTP status.
    ServerStatus(u16),
    /// The caller cancelled the exchange.
    Cancelled,
}

/// UI-facing event for one exchange.
///
/// `Partial` repeats for every accepted fragment; exactly one `Complete` or
/// `Failed` follows, and nothing after that. A failure never invalidates
/// partials already delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Partial(Message),
    Complete(Message),
    Failed(FailureReason),
}

/// Exchange lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    /// Request dispatched, awaiting the first response byte.
    Sending,
    Streaming,
    Completed,
    Failed(FailureReason),
}

impl SessionPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }

    /// Applies one transition deterministically.
    ///
    /// A new exchange may start from any settled state. Terminal transitions
    /// require an active exchange.
    pub fn apply(&self, transition: SessionTransition) -> TransitionResult {
        match transition {
            SessionTransition::Start => {
                if self.is_active() {
                    Err(TransitionRejection::AlreadyInProgress)
                } else {
                    Ok(Self::Sending)
                }
            }
            SessionTransition::FirstByte => match self {
                Self::Sending => Ok(Self::Streaming),
                _ => Err(TransitionRejection::NotSending),
            },
            SessionTransition::Finish => match self {
                Self::Streaming => Ok(Self::Completed),
                _ => Err(TransitionRejection::NotActive),
            },
            SessionTransition::Fail(reason) => {
                if self.is_active() {
                    Ok(Self::Failed(reason))
                } else {
                    Err(TransitionRejection::NotActive)
                }
            }
            SessionTransition::Cancel => {
                if self.is_active() {
                    Ok(Self::Failed(FailureReason::Cancelled))
                } else {
                    Err(TransitionRejection::NotActive)
                }
            }
        }
    }
}

/// State transition input for the exchange lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    Start,
    FirstByte,
    Finish,
    Fail(FailureReason),
    Cancel,
}

/// Rejection reason for illegal lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    AlreadyInProgress,
    NotSending,
    NotActive,
}

pub type TransitionResult = Result<SessionPhase, TransitionRejection>;

pub type SessionWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receiving side of one exchange's event sequence.
///
/// Dropping the stream cancels the exchange.
pub struct SessionEventStream {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl SessionEventStream {
    fn new(events: mpsc::UnboundedReceiver<SessionEvent>, cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for SessionEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub struct SessionHandle {
    /// Placeholder snapshot for the turn, available before any fragment.
    pub pending: Message,
    pub events: SessionEventStream,
    pub worker: SessionWorker,
}

/// Owns one request/response exchange at a time against a chat transport.
///
/// Each exchange gets its own decoder and accumulator; nothing is shared
/// across exchanges or sessions, so the pipeline needs no locking. All
/// transport callbacks for an exchange are serialized by its single worker
/// future.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    in_flight: Arc<AtomicBool>,
    next_message_id: AtomicU64,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            in_flight: Arc::new(AtomicBool::new(false)),
            next_message_id: AtomicU64::new(1),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Starts one exchange.
    ///
    /// Rejects synchronously while another exchange is in flight, leaving the
    /// active exchange untouched. The caller spawns the returned worker and
    /// drains events until the terminal one.
    pub fn start(&self, request: ChatRequest) -> ClientResult<SessionHandle> {
        ensure!(
            self.in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            SessionBusySnafu {
                stage: "session-start",
            }
        );

        let message_id = MessageId::new(self.next_message_id.fetch_add(1, Ordering::Relaxed));
        let accumulator = MessageAccumulator::new(message_id);
        let pending = accumulator.message().clone();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let events = SessionEventStream::new(event_rx, cancel_tx);

        let guard = InFlightGuard {
            flag: self.in_flight.clone(),
        };
        let worker: SessionWorker = Box::pin(run_exchange(
            self.transport.clone(),
            request,
            accumulator,
            event_tx,
            cancel_rx,
            guard,
        ));

        Ok(SessionHandle {
            pending,
            events,
            worker,
        })
    }
}

/// Clears the in-flight flag on every worker exit path, including drops.
struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

enum ExchangeOutcome {
    Completed(Message),
    Failed(FailureReason),
}

fn advance(phase: &SessionPhase, transition: SessionTransition) -> SessionPhase {
    match phase.apply(transition) {
        Ok(next) => next,
        Err(rejection) => {
            tracing::error!(?phase, ?rejection, "illegal session transition");
            phase.clone()
        }
    }
}

async fn run_exchange(
    transport: Arc<dyn ChatTransport>,
    request: ChatRequest,
    mut accumulator: MessageAccumulator,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
    guard: InFlightGuard,
) {
    let _guard = guard;
    let mut phase = advance(&SessionPhase::Idle, SessionTransition::Start);

    let handle = match transport.send_chat(request) {
        Ok(handle) => handle,
        Err(error) => {
            tracing::error!(error = %error, "transport rejected the chat request");
            phase = advance(
                &phase,
                SessionTransition::Fail(FailureReason::Network(error.to_string())),
            );
            tracing::debug!(?phase, "exchange reached a terminal state");
            let _ = event_tx.send(SessionEvent::Failed(FailureReason::Network(
                error.to_string(),
            )));
            return;
        }
    };

    let TransportHandle {
        mut stream,
        worker: mut transport_worker,
    } = handle;
    let mut worker_done = false;
    let mut decoder = LineFrameDecoder::new();

    let outcome = 'drive: loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!("exchange cancelled by the caller");
                stream.cancel();
                break 'drive ExchangeOutcome::Failed(FailureReason::Cancelled);
            }
            _ = &mut transport_worker, if !worker_done => {
                worker_done = true;
            }
            received = stream.recv() => {
                let Some(event) = received else {
                    // The transport contract promises a Closed notification;
                    // an unannounced end is a connection fault.
                    break 'drive ExchangeOutcome::Failed(FailureReason::Network(
                        "transport stream ended without a terminal notification".to_string(),
                    ));
                };

                match event {
                    TransportEvent::Body(bytes) => {
                        if phase == SessionPhase::Sending {
                            phase = advance(&phase, SessionTransition::FirstByte);
                        }

                        for frame in decoder.feed(&bytes) {
                            let fragment = match ChatFragment::parse(&frame) {
                                Ok(fragment) => fragment,
                                Err(error) => {
                                    tracing::warn!(
                                        error = %error,
                                        raw = error.raw_frame(),
                                        "skipping undecodable frame"
                                    );
                                    continue;
                                }
                            };

                            let snapshot = accumulator.apply(&fragment).clone();
                            if accumulator.is_complete() {
                                break 'drive ExchangeOutcome::Completed(snapshot);
                            }
                            let _ = event_tx.send(SessionEvent::Partial(snapshot));
                        }
                    }
                    TransportEvent::Closed(end) => {
                        decoder.flush();
                        break 'drive ExchangeOutcome::Failed(match end {
                            StreamEnd::Success => FailureReason::Network(
                                "stream closed before a terminal fragment".to_string(),
                            ),
                            StreamEnd::HttpStatus(status) => FailureReason::ServerStatus(status),
                            StreamEnd::NetworkError(cause) => FailureReason::Network(cause),
                        });
                    }
                }
            }
        }
    };

    let (event, transition) = match outcome {
        ExchangeOutcome::Completed(message) => {
            (SessionEvent::Complete(message), SessionTransition::Finish)
        }
        ExchangeOutcome::Failed(FailureReason::Cancelled) => (
            SessionEvent::Failed(FailureReason::Cancelled),
            SessionTransition::Cancel,
        ),
        ExchangeOutcome::Failed(reason) => (
            SessionEvent::Failed(reason.clone()),
            SessionTransition::Fail(reason),
        ),
    };

    phase = advance(&phase, transition);
    tracing::debug!(?phase, "exchange reached a terminal state");
    let _ = event_tx.send(event);
    // Dropping the transport stream and worker here releases the connection.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::make_transport_stream;
    use murmur_protocol::{FinishReason, Role};

    /// Transport that replays a fixed script of events.
    ///
    /// With `hold_open` it parks after the script until cancelled, standing in
    /// for a connection that never closes.
    struct ScriptedTransport {
        script: Vec<TransportEvent>,
        hold_open: bool,
    }

    impl ScriptedTransport {
        fn new(script: Vec<TransportEvent>) -> Self {
            Self {
                script,
                hold_open: false,
            }
        }

        fn holding_open(script: Vec<TransportEvent>) -> Self {
            Self {
                script,
                hold_open: true,
            }
        }
    }

    impl ChatTransport for ScriptedTransport {
        fn send_chat(&self, _request: ChatRequest) -> ClientResult<TransportHandle> {
            let (event_tx, stream, cancel_rx) = make_transport_stream();
            let script = self.script.clone();
            let hold_open = self.hold_open;
            let worker: crate::transport::TransportWorker = Box::pin(async move {
                for event in script {
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
                if hold_open {
                    let _ = cancel_rx.await;
                }
            });

            Ok(TransportHandle { stream, worker })
        }
    }

    fn body(text: &str) -> TransportEvent {
        TransportEvent::Body(text.as_bytes().to_vec())
    }

    fn closed(end: StreamEnd) -> TransportEvent {
        TransportEvent::Closed(end)
    }

    async fn drain(session: &ChatSession, request: ChatRequest) -> Vec<SessionEvent> {
        let SessionHandle {
            mut events, worker, ..
        } = session.start(request).unwrap();
        let join = tokio::spawn(worker);

        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            let terminal = !matches!(event, SessionEvent::Partial(_));
            collected.push(event);
            if terminal {
                break;
            }
        }

        join.await.unwrap();
        collected
    }

    #[tokio::test]
    async fn streams_partials_then_completes() {
        let transport = ScriptedTransport::new(vec![
            body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":0,\"role\":\"assistant\",\"content\":\"Hel\"}\n"),
            body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":1,\"content\":\"lo\"}\n"),
            body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":2,\"content\":\"\",\"finish_reason\":\"stop\"}\n"),
            closed(StreamEnd::Success),
        ]);
        let session = ChatSession::new(Arc::new(transport));

        let events = drain(&session, ChatRequest::new("hi")).await;

        assert_eq!(events.len(), 3);
        let SessionEvent::Partial(first) = &events[0] else {
            panic!("expected partial, got {:?}", events[0]);
        };
        assert_eq!(first.text, "Hel");
        assert_eq!(first.role, Role::Assistant);
        let SessionEvent::Partial(second) = &events[1] else {
            panic!("expected partial, got {:?}", events[1]);
        };
        assert_eq!(second.text, "Hello");
        let SessionEvent::Complete(message) = &events[2] else {
            panic!("expected complete, got {:?}", events[2]);
        };
        assert_eq!(message.text, "Hello");
        assert!(message.is_complete);
        assert_eq!(message.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn frames_split_across_chunks_reassemble() {
        let transport = ScriptedTransport::new(vec![
            body("{\"id\":\"m1\",\"model\":\"m\",\"crea"),
            body("ted\":1,\"index\":0,\"content\":\"Hello\"}\n{\"id\":\"m1\",\"model\":\"m\","),
            body("\"created\":1,\"index\":1,\"finish_reason\":\"stop\"}\n"),
            closed(StreamEnd::Success),
        ]);
        let session = ChatSession::new(Arc::new(transport));

        let events = drain(&session, ChatRequest::new("hi")).await;

        let SessionEvent::Complete(message) = events.last().unwrap() else {
            panic!("expected complete, got {:?}", events.last());
        };
        assert_eq!(message.text, "Hello");
    }

    #[tokio::test]
    async fn undecodable_frames_are_skipped_without_corrupting_the_message() {
        let transport = ScriptedTransport::new(vec![
            body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":0,\"content\":\"Hel\"}\n"),
            body("this is not json\n"),
            body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":1,\"content\":\"lo\"}\n"),
            body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":2,\"finish_reason\":\"stop\"}\n"),
            closed(StreamEnd::Success),
        ]);
        let session = ChatSession::new(Arc::new(transport));

        let events = drain(&session, ChatRequest::new("hi")).await;

        let SessionEvent::Complete(message) = events.last().unwrap() else {
            panic!("expected complete, got {:?}", events.last());
        };
        assert_eq!(message.text, "Hello");
        assert!(message.is_complete);
    }

    #[tokio::test]
    async fn connection_drop_without_terminal_fragment_fails_but_keeps_partials() {
        let transport = ScriptedTransport::new(vec![
            body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":0,\"content\":\"partial\"}\n"),
            closed(StreamEnd::Success),
        ]);
        let session = ChatSession::new(Arc::new(transport));

        let events = drain(&session, ChatRequest::new("hi")).await;

        assert_eq!(events.len(), 2);
        let SessionEvent::Partial(last_partial) = &events[0] else {
            panic!("expected partial, got {:?}", events[0]);
        };
        assert_eq!(last_partial.text, "partial");
        assert!(matches!(
            &events[1],
            SessionEvent::Failed(FailureReason::Network(_))
        ));
    }

    #[tokio::test]
    async fn non_success_status_fails_with_server_status() {
        let transport = ScriptedTransport::new(vec![closed(StreamEnd::HttpStatus(503))]);
        let session = ChatSession::new(Arc::new(transport));

        let events = drain(&session, ChatRequest::new("hi")).await;

        assert_eq!(
            events,
            vec![SessionEvent::Failed(FailureReason::ServerStatus(503))]
        );
    }

    #[tokio::test]
    async fn unterminated_tail_is_not_a_fragment() {
        let transport = ScriptedTransport::new(vec![
            body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":0,\"content\":\"seen\"}\n"),
            body("{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":1,\"content\":\"lost\"}"),
            closed(StreamEnd::Success),
        ]);
        let session = ChatSession::new(Arc::new(transport));

        let events = drain(&session, ChatRequest::new("hi")).await;

        let SessionEvent::Partial(partial) = &events[0] else {
            panic!("expected partial, got {:?}", events[0]);
        };
        assert_eq!(partial.text, "seen");
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Failed(FailureReason::Network(_)))
        ));
    }

    #[tokio::test]
    async fn cancel_fails_the_exchange_and_releases_the_transport() {
        let transport = ScriptedTransport::holding_open(vec![body(
            "{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":0,\"content\":\"par\"}\n",
        )]);
        let session = ChatSession::new(Arc::new(transport));

        let SessionHandle {
            mut events, worker, ..
        } = session.start(ChatRequest::new("hi")).unwrap();
        let join = tokio::spawn(worker);

        let first = events.recv().await.unwrap();
        assert!(matches!(first, SessionEvent::Partial(_)));

        events.cancel();
        let terminal = events.recv().await.unwrap();
        assert_eq!(terminal, SessionEvent::Failed(FailureReason::Cancelled));

        join.await.unwrap();
        assert!(!session.is_in_flight());
    }

    #[tokio::test]
    async fn double_start_is_rejected_and_leaves_the_first_exchange_alone() {
        let transport = ScriptedTransport::holding_open(vec![body(
            "{\"id\":\"m1\",\"model\":\"m\",\"created\":1,\"index\":0,\"content\":\"live\"}\n",
        )]);
        let session = ChatSession::new(Arc::new(transport));

        let SessionHandle {
            mut events, worker, ..
        } = session.start(ChatRequest::new("first")).unwrap();
        let join = tokio::spawn(worker);

        let first = events.recv().await.unwrap();

        let rejected = session.start(ChatRequest::new("second"));
        assert!(matches!(
            rejected,
            Err(crate::error::ClientError::SessionBusy { .. })
        ));

        // The first exchange keeps running and can still be cancelled cleanly.
        assert!(matches!(first, SessionEvent::Partial(_)));
        events.cancel();
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Failed(FailureReason::Cancelled)
        );
        join.await.unwrap();

        // Once settled, the session accepts a new exchange.
        assert!(session.start(ChatRequest::new("third")).is_ok());
    }

    #[tokio::test]
    async fn pending_message_is_empty_before_any_fragment() {
        let transport = ScriptedTransport::new(vec![closed(StreamEnd::Success)]);
        let session = ChatSession::new(Arc::new(transport));

        let handle = session.start(ChatRequest::new("hi")).unwrap();
        assert_eq!(handle.pending.text, "");
        assert!(!handle.pending.is_complete);
        assert_eq!(handle.pending.role, Role::Assistant);
    }

    #[test]
    fn phase_machine_accepts_the_happy_path() {
        let phase = SessionPhase::Idle;
        let phase = phase.apply(SessionTransition::Start).unwrap();
        assert_eq!(phase, SessionPhase::Sending);
        let phase = phase.apply(SessionTransition::FirstByte).unwrap();
        assert_eq!(phase, SessionPhase::Streaming);
        let phase = phase.apply(SessionTransition::Finish).unwrap();
        assert_eq!(phase, SessionPhase::Completed);
    }

    #[test]
    fn phase_machine_rejects_start_while_active() {
        assert_eq!(
            SessionPhase::Sending.apply(SessionTransition::Start),
            Err(TransitionRejection::AlreadyInProgress)
        );
        assert_eq!(
            SessionPhase::Streaming.apply(SessionTransition::Start),
            Err(TransitionRejection::AlreadyInProgress)
        );
    }

    #[test]
    fn phase_machine_allows_failure_from_sending_and_streaming() {
        let reason = FailureReason::ServerStatus(500);
        assert_eq!(
            SessionPhase::Sending.apply(SessionTransition::Fail(reason.clone())),
            Ok(SessionPhase::Failed(reason.clone()))
        );
        assert_eq!(
            SessionPhase::Streaming.apply(SessionTransition::Cancel),
            Ok(SessionPhase::Failed(FailureReason::Cancelled))
        );
        assert_eq!(
            SessionPhase::Completed.apply(SessionTransition::Fail(reason)),
            Err(TransitionRejection::NotActive)
        );
    }

    #[test]
    fn phase_machine_allows_restart_after_settling() {
        assert_eq!(
            SessionPhase::Completed.apply(SessionTransition::Start),
            Ok(SessionPhase::Sending)
        );
        assert_eq!(
            SessionPhase::Failed(FailureReason::Cancelled).apply(SessionTransition::Start),
            Ok(SessionPhase::Sending)
        );
    }
}
