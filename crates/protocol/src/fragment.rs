use serde::{Deserialize, Deserializer};
use snafu::{ResultExt, Snafu};

use crate::frame::Frame;

/// Reason the server attached to a response fragment.
///
/// Only `stop` and `error` end a turn; the remaining values are informational
/// and leave the stream open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Error,
    Length,
    FunctionCall,
    Other,
}

impl FinishReason {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stop | Self::Error)
    }

    /// Values the server never documented map to `Other` instead of failing
    /// the whole fragment.
    fn from_wire(raw: &str) -> Self {
        match raw {
            "stop" => Self::Stop,
            "error" => Self::Error,
            "length" => Self::Length,
            "function_call" => Self::FunctionCall,
            _ => Self::Other,
        }
    }
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&raw))
    }
}

/// One parsed line of the chat response stream.
///
/// Optional fields stay absent when the wire omits them; an explicit empty
/// `content` is distinct from no content at all. Unknown extra fields are
/// ignored so newer servers keep working against this client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatFragment {
    /// Message identifier, stable across every fragment of one turn.
    pub id: String,
    pub model: String,
    /// Server-assigned unix timestamp. Ordering is by arrival, never by this.
    pub created: i64,
    /// Position hint; not required to be contiguous and never validated.
    pub index: u32,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

impl ChatFragment {
    /// Decodes one frame into a fragment.
    ///
    /// A failure carries the raw frame text and the underlying cause so the
    /// caller can log and skip it without losing the rest of the stream.
    pub fn parse(frame: &Frame) -> DecodeResult<Self> {
        serde_json::from_str(frame.as_str()).context(FragmentJsonSnafu {
            stage: "parse-fragment",
            raw: frame.as_str().to_string(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some_and(FinishReason::is_terminal)
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    #[snafu(display("frame is not a valid chat fragment: {source}"))]
    FragmentJson {
        stage: &'static str,
        raw: String,
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Raw text of the frame that failed to decode.
    pub fn raw_frame(&self) -> &str {
        match self {
            Self::FragmentJson { raw, .. } => raw,
        }
    }
}
