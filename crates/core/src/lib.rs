pub mod error;
pub mod format;
pub mod preferences;
pub mod registry;
pub mod session;

pub use error::{FormatError, FormatResult, SessionError, SessionResult};
pub use format::{
    CompiledPrompt, FormatState, SEPARATOR, SLOT_MARKER, ValidatedSpec, compile, preset_kind,
};
pub use preferences::{Preferences, PromptHistory};
pub use registry::{FetchApplied, FetchTicket, ModelSelection};
pub use session::{
    ChatSession, GENERIC_FAILURE_NOTICE, Message, MessageKey, Phase, SessionOptions,
    SessionServices, SessionSnapshot,
};
