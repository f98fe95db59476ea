pub mod message;
pub mod snapshot;
pub mod store;

pub use message::{
    GenerationId, LocalMessageId, Message, MessageKey, MessageMeta, Phase, PhaseRejection,
    PhaseTransition,
};
pub use snapshot::SessionSnapshot;
pub use store::{ChatSession, GENERIC_FAILURE_NOTICE, SessionOptions, SessionServices};
