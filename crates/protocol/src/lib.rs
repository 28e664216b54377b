pub mod accumulator;
pub mod fragment;
pub mod frame;
pub mod health;
pub mod request;

pub use accumulator::{Message, MessageAccumulator, MessageId, Role};
pub use fragment::{ChatFragment, DecodeError, DecodeResult, FinishReason};
pub use frame::{Frame, LineFrameDecoder};
pub use health::ServerHealth;
pub use request::{
    ChatRequest, DEFAULT_MIN_P, DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P, ImageAttachment,
};
