pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod transport;

pub use config::{
    ClientSettings, DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT, ServerConfig, SettingsError,
    SettingsStore,
};
pub use error::{ClientError, ClientResult};
pub use http::HttpTransport;
pub use session::{
    ChatSession, FailureReason, SessionEvent, SessionEventStream, SessionHandle, SessionPhase,
    SessionTransition, SessionWorker, TransitionRejection, TransitionResult,
};
pub use transport::{
    ChatTransport, StreamEnd, TransportEvent, TransportEventStream, TransportHandle,
    TransportWorker, make_transport_stream,
};
