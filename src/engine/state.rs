//! Controller state types

use crate::error::Notice;
use crate::log::Interaction;
use crate::session::Session;

/// Conversation state. `Idle` is both the initial state and the terminal
/// state of every turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatState {
    /// Ready for input, nothing in flight
    #[default]
    Idle,

    /// User message accepted, persisting it and opening the stream
    Submitting,

    /// A generation stream is being drained
    Streaming,

    /// Tool invocation accepted, loading the registry and validating
    ToolPending,

    /// Tool execution request in flight
    ToolExecuting,
}

impl ChatState {
    /// Submission and tool invocation are only legal from `Idle`; busy
    /// states reject them instead of queueing.
    pub fn is_busy(self) -> bool {
        !matches!(self, ChatState::Idle)
    }
}

/// Which session the host is looking at.
///
/// `MostRecent` is a sentinel, not a fixed index: it keeps following the
/// newest session as the log grows, which is what makes a freshly created
/// session become visible as soon as it has content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveSession {
    #[default]
    MostRecent,
    Pinned(usize),
}

impl ActiveSession {
    /// Resolve to a concrete index, clamped into the current session list.
    pub fn resolve(self, session_count: usize) -> Option<usize> {
        if session_count == 0 {
            return None;
        }
        match self {
            ActiveSession::MostRecent => Some(session_count - 1),
            ActiveSession::Pinned(index) => Some(index.min(session_count - 1)),
        }
    }
}

/// Snapshot of everything a host needs to render the assistant panel.
#[derive(Debug, Clone, Default)]
pub struct EngineView {
    pub sessions: Vec<Session>,
    pub active_session: Option<usize>,
    pub active_session_messages: Vec<Interaction>,
    pub is_streaming: bool,
    /// Accumulated text of the in-flight generation; grows monotonically
    /// and resets to empty once the turn is finalized.
    pub partial_text: String,
    pub notice: Option<Notice>,
    pub state: ChatState,
}
