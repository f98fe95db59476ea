pub mod backend;
pub mod capabilities;
pub mod client;
pub mod error;
pub mod model;
pub mod output_format;
pub mod protocol;
pub mod stream;

pub use backend::{Backend, ConnectionParams};
pub use capabilities::CapabilityMap;
pub use client::{ApiClient, ByteStream, GenerationRequest, LlmService, fetch_catalog};
pub use error::{ApiError, ApiResult, ParseKindError};
pub use model::{Model, ModelCatalog, ModelCatalogSource};
pub use output_format::OutputFormat;
pub use protocol::{StreamEnvelope, StreamUpdate};
pub use stream::{StreamOutcome, consume_event_stream};
