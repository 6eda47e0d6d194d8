//! Dristhi assistant conversation engine
//!
//! The embedded engine behind the dashboard's conversational assistant.
//! It reconstructs multi-session chat history from the flat append-only
//! interaction log, consumes streamed completions incrementally with
//! cooperative cancellation, and executes schema-validated tools, recording
//! every outcome back into the log.
//!
//! The engine is a library component: it consumes the platform's REST
//! interfaces (interaction log, streaming completion endpoint, tool
//! registry) and exposes a typed async API plus an observable view to its
//! host. It has no server or CLI surface of its own.

pub mod config;
pub mod engine;
pub mod error;
pub mod log;
pub mod session;
pub mod stream;
pub mod tools;

pub use config::EngineConfig;
pub use engine::{ActiveSession, ChatEngine, ChatState, EngineHandle, EngineView};
pub use error::{ApiError, ApiErrorKind, EngineError, FieldError, Notice, NoticeKind};
pub use log::{HttpInteractionStore, Interaction, InteractionKind, InteractionStore, NewInteraction};
pub use session::{reconstruct, Session, SessionIndex};
pub use stream::{CompletionClient, CompletionRequest, HttpCompletionClient, StreamOutcome};
pub use tools::{HttpToolBackend, ParamSpec, ToolBackend, ToolCatalog, ToolDescriptor, ToolOutcome};
