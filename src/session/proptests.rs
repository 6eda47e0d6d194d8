//! Property-based tests for session reconstruction

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use super::{reconstruct, SessionIndex};
use crate::log::{Interaction, InteractionKind};

#[derive(Debug, Clone)]
enum RowSpec {
    User(String),
    Assistant,
    Boundary(Option<String>),
}

fn row_spec() -> impl Strategy<Value = RowSpec> {
    prop_oneof![
        3 => "[a-z ]{0,60}".prop_map(RowSpec::User),
        3 => Just(RowSpec::Assistant),
        1 => proptest::option::of("[A-Za-z ]{1,20}").prop_map(RowSpec::Boundary),
    ]
}

fn materialize(specs: &[RowSpec]) -> Vec<Interaction> {
    specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let id = i64::try_from(i).unwrap() + 1;
            let created_at = Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap();
            match spec {
                RowSpec::User(content) => Interaction {
                    id,
                    kind: InteractionKind::UserMessage,
                    content: content.clone(),
                    metadata: None,
                    is_read: false,
                    created_at,
                },
                RowSpec::Assistant => Interaction {
                    id,
                    kind: InteractionKind::AssistantMessage,
                    content: "reply".to_string(),
                    metadata: None,
                    is_read: false,
                    created_at,
                },
                RowSpec::Boundary(title) => Interaction {
                    id,
                    kind: InteractionKind::System,
                    content: String::new(),
                    metadata: Some(match title {
                        Some(t) => serde_json::json!({ "new_session": true, "title": t }),
                        None => serde_json::json!({ "new_session": true }),
                    }),
                    is_read: false,
                    created_at,
                },
            }
        })
        .collect()
}

proptest! {
    /// Session ranges cover every non-boundary record exactly once, in
    /// order, and never include a boundary record.
    #[test]
    fn sessions_partition_the_log(specs in proptest::collection::vec(row_spec(), 0..40)) {
        let log = materialize(&specs);
        let sessions = reconstruct(&log);

        let mut covered = vec![false; log.len()];
        let mut previous_end = 0usize;
        for session in &sessions {
            prop_assert!(session.start < session.end);
            prop_assert!(session.end <= log.len());
            prop_assert!(session.start >= previous_end, "sessions out of order or overlapping");
            previous_end = session.end;
            for idx in session.range() {
                prop_assert!(!log[idx].is_session_boundary());
                covered[idx] = true;
            }
        }
        for (idx, record) in log.iter().enumerate() {
            prop_assert_eq!(
                covered[idx],
                !record.is_session_boundary(),
                "record {} coverage mismatch",
                idx
            );
        }
    }

    /// Without boundary markers the whole log is one session.
    #[test]
    fn boundary_free_log_is_one_session(
        specs in proptest::collection::vec(
            prop_oneof![
                "[a-z ]{0,60}".prop_map(RowSpec::User),
                Just(RowSpec::Assistant),
            ],
            1..30,
        )
    ) {
        let log = materialize(&specs);
        let sessions = reconstruct(&log);
        prop_assert_eq!(sessions.len(), 1);
        prop_assert_eq!(sessions[0].range(), 0..log.len());
    }

    /// Inserting one boundary splits exactly one session in two and leaves
    /// every other session untouched.
    #[test]
    fn inserting_a_boundary_splits_one_session(
        specs in proptest::collection::vec(row_spec(), 1..30),
        position in 0usize..30,
    ) {
        let log = materialize(&specs);
        let position = position.min(log.len());
        let before = reconstruct(&log);

        let mut specs_after = specs.clone();
        specs_after.insert(position, RowSpec::Boundary(None));
        let log_after = materialize(&specs_after);
        let after = reconstruct(&log_after);

        // Sessions strictly before the insertion point are unchanged.
        let untouched_before = before.iter().filter(|s| s.end <= position).count();
        let untouched_after = after.iter().filter(|s| s.end <= position).count();
        prop_assert_eq!(untouched_before, untouched_after);

        // The marker splits at most one session in two; empty halves are
        // dropped, so the count grows by at most one.
        let delta = after.len() as i64 - before.len() as i64;
        prop_assert!((0..=1).contains(&delta), "session count changed by {}", delta);
    }

    /// Incremental appends through the index agree with a full scan at
    /// every prefix.
    #[test]
    fn incremental_index_matches_full_scan(specs in proptest::collection::vec(row_spec(), 0..40)) {
        let log = materialize(&specs);
        let mut index = SessionIndex::new();
        for n in 0..=log.len() {
            index.sync(&log[..n]);
            let expected = reconstruct(&log[..n]);
            prop_assert_eq!(index.sessions(), expected.as_slice());
        }
    }
}
