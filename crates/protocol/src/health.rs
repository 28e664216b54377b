use serde::Deserialize;

/// Readiness payload returned by the inference server's health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerHealth {
    pub status: String,
    pub model_loaded: bool,
    pub version: String,
}

impl ServerHealth {
    /// The server answers before its model finishes loading; only a loaded
    /// model can serve chat requests.
    pub fn is_ready(&self) -> bool {
        self.model_loaded
    }
}
