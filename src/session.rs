//! Session reconstruction over the flat interaction log
//!
//! Sessions are never stored. They are derived views over the interaction
//! sequence: a contiguous run of records between two boundary markers,
//! presented as one conversation thread. Deriving them from the log on
//! demand means they can never drift out of sync with it.

use chrono::{DateTime, Utc};

use crate::log::{Interaction, InteractionKind};

pub const DEFAULT_TITLE: &str = "New chat";

/// How much of the first user message seeds a derived title.
const TITLE_FALLBACK_CHARS: usize = 40;

/// A derived conversation thread: the records in `start..end`.
///
/// Boundary markers belong to no session, so consecutive sessions may be
/// separated by one (or, after deletions, several) marker records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub start: usize,
    /// Exclusive end index.
    pub end: usize,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Title and timestamp carried by the boundary that opened a session.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Seed {
    title: Option<String>,
    created_at: DateTime<Utc>,
}

impl Seed {
    fn from_boundary(record: &Interaction) -> Self {
        Self {
            title: record.session_title().map(str::to_owned),
            created_at: record.created_at,
        }
    }
}

/// Derive the ordered session list from the interaction sequence.
///
/// Total and side-effect-free: any log, including one with malformed
/// metadata or stray boundary markers, yields a well-formed session list.
/// Zero-length sessions are never emitted, so back-to-back boundaries and a
/// trailing boundary with nothing after it produce no session.
pub fn reconstruct(log: &[Interaction]) -> Vec<Session> {
    let mut sessions = Vec::new();
    let mut start = 0usize;
    let mut seed: Option<Seed> = None;

    for (idx, record) in log.iter().enumerate() {
        if record.is_session_boundary() {
            if idx > start {
                sessions.push(build_session(log, start, idx, seed.as_ref()));
            }
            seed = Some(Seed::from_boundary(record));
            start = idx + 1;
        }
    }

    if log.len() > start {
        sessions.push(build_session(log, start, log.len(), seed.as_ref()));
    }

    sessions
}

fn build_session(log: &[Interaction], start: usize, end: usize, seed: Option<&Seed>) -> Session {
    let title = seed
        .and_then(|s| s.title.clone())
        .unwrap_or_else(|| fallback_title(&log[start..end]));
    let created_at = seed.map_or(log[start].created_at, |s| s.created_at);
    Session {
        start,
        end,
        title,
        created_at,
    }
}

/// First 40 characters of the session's first user message, else the
/// default title.
fn fallback_title(records: &[Interaction]) -> String {
    records
        .iter()
        .find(|r| r.kind == InteractionKind::UserMessage)
        .map(|r| r.content.chars().take(TITLE_FALLBACK_CHARS).collect::<String>())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

/// Incrementally maintained session list.
///
/// Appends are the common case and only touch the tail: the trailing
/// session is extended, or a new one is opened at a boundary. Deletions and
/// resyncs go through [`SessionIndex::rebuild`], which rescans the log.
#[derive(Debug, Default)]
pub struct SessionIndex {
    sessions: Vec<Session>,
    /// Boundary seed for a session that has been opened but has no records
    /// yet (the log currently ends with a boundary marker).
    pending_seed: Option<Seed>,
    /// Whether the trailing session's title was pinned by boundary metadata
    /// (derived titles are recomputed as records arrive).
    trailing_title_pinned: bool,
    /// How many log records have been digested.
    len: usize,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Discard the derived state and rescan the whole log.
    pub fn rebuild(&mut self, log: &[Interaction]) {
        self.sessions.clear();
        self.pending_seed = None;
        self.trailing_title_pinned = false;
        self.len = 0;
        self.sync(log);
    }

    /// Digest records appended since the last call. Falls back to a full
    /// rebuild if the log shrank underneath us.
    pub fn sync(&mut self, log: &[Interaction]) {
        if log.len() < self.len {
            self.rebuild(log);
            return;
        }

        for idx in self.len..log.len() {
            let record = &log[idx];
            if record.is_session_boundary() {
                self.pending_seed = Some(Seed::from_boundary(record));
                continue;
            }

            if let Some(seed) = self.pending_seed.take() {
                self.trailing_title_pinned = seed.title.is_some();
                self.sessions
                    .push(build_session(log, idx, idx + 1, Some(&seed)));
            } else {
                match self.sessions.last_mut() {
                    Some(last) if last.end == idx => last.end = idx + 1,
                    _ => {
                        self.trailing_title_pinned = false;
                        self.sessions.push(build_session(log, idx, idx + 1, None));
                    }
                }
            }
        }
        self.len = log.len();

        // A derived title can change as records arrive (the first user
        // message may not be the first record of the session).
        if !self.trailing_title_pinned {
            if let Some(last) = self.sessions.last_mut() {
                if last.end == log.len() {
                    last.title = fallback_title(&log[last.range()]);
                }
            }
        }
    }
}

#[cfg(test)]
mod proptests;
