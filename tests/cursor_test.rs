mod helpers;

use continuum::cursor::{CursorState, StartKind};
use continuum::events::StreamKey;
use continuum::ContinuumError;
use helpers::{append_n, stream, TestEngine};

#[test]
fn one_cursor_per_stream() {
    let t = TestEngine::new();
    let key = stream();

    let first = t.engine.cursors.start_or_resume(&key).unwrap();
    assert_eq!(first.kind, StartKind::Created);
    assert_eq!(first.cursor.state, CursorState::Active);
    assert_eq!(first.cursor.current_event_id, None);

    let again = t.engine.cursors.start_or_resume(&key).unwrap();
    assert_eq!(again.kind, StartKind::AlreadyActive);
    assert_eq!(again.cursor.id, first.cursor.id);

    let other = t
        .engine
        .cursors
        .start_or_resume(&StreamKey::new("alice", "continuum", "feature/x"))
        .unwrap();
    assert_eq!(other.kind, StartKind::Created);
    assert_ne!(other.cursor.id, first.cursor.id);
}

#[test]
fn new_cursor_starts_at_existing_head() {
    let t = TestEngine::new();
    let key = stream();
    let ids = append_n(&t.engine, &key, 3);

    let start = t.engine.cursors.start_or_resume(&key).unwrap();
    assert_eq!(start.cursor.current_event_id.as_deref(), Some(ids[2].as_str()));
}

#[test]
fn paused_cursor_resumes_at_its_pin() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    let ids = append_n(&t.engine, &key, 4);

    let paused = t.engine.cursors.pause(&cursor.id).unwrap();
    assert_eq!(paused.state, CursorState::Paused);
    assert_eq!(paused.current_event_id.as_deref(), Some(ids[3].as_str()));

    // Work continues elsewhere on the same stream.
    let later = append_n(&t.engine, &key, 2);

    let status = t.engine.cursors.status(&cursor.id).unwrap();
    assert_eq!(status.position.as_deref(), Some(ids[3].as_str()));
    assert_eq!(status.head.as_deref(), Some(later[1].as_str()));
    assert_eq!(status.events_since_pause, 2);

    let resumed = t.engine.cursors.start_or_resume(&key).unwrap();
    assert_eq!(resumed.kind, StartKind::Resumed);
    assert_eq!(resumed.cursor.id, cursor.id);
    assert_eq!(resumed.cursor.state, CursorState::Active);
}

#[test]
fn cursors_survive_restart() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    let ids = append_n(&t.engine, &key, 2);
    t.engine.cursors.pause(&cursor.id).unwrap();

    let t = t.restart();
    let loaded = t.engine.cursors.get(&cursor.id).unwrap();
    assert_eq!(loaded.state, CursorState::Paused);
    assert_eq!(loaded.current_event_id.as_deref(), Some(ids[1].as_str()));

    let resumed = t.engine.cursors.start_or_resume(&key).unwrap();
    assert_eq!(resumed.kind, StartKind::Resumed);
    assert_eq!(resumed.cursor.id, cursor.id);
}

#[test]
fn cursor_pointing_outside_its_stream_is_replaced() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    let ids = append_n(&t.engine, &key, 2);
    t.engine.cursors.pause(&cursor.id).unwrap();

    {
        let conn = rusqlite::Connection::open(t.dir.path().join("state.db")).unwrap();
        conn.execute(
            "UPDATE cursors SET current_event_id = 'gone' WHERE id = ?1",
            [&cursor.id],
        )
        .unwrap();
    }

    assert!(matches!(
        t.engine.cursors.get(&cursor.id),
        Err(ContinuumError::CursorCorrupted { .. })
    ));

    let start = t.engine.cursors.start_or_resume(&key).unwrap();
    assert_eq!(start.kind, StartKind::Replaced);
    assert_ne!(start.cursor.id, cursor.id);
    assert_eq!(start.cursor.current_event_id.as_deref(), Some(ids[1].as_str()));
    assert!(matches!(
        t.engine.cursors.get(&cursor.id),
        Err(ContinuumError::CursorNotFound(_))
    ));
}

#[test]
fn unknown_cursor_is_not_found() {
    let t = TestEngine::new();
    assert!(matches!(
        t.engine.cursors.pause("missing"),
        Err(ContinuumError::CursorNotFound(_))
    ));
    assert!(matches!(
        t.engine.cursors.status("missing"),
        Err(ContinuumError::CursorNotFound(_))
    ));
}

#[test]
fn list_returns_only_that_users_cursors() {
    let t = TestEngine::new();
    t.engine.cursors.start_or_resume(&stream()).unwrap();
    t.engine
        .cursors
        .start_or_resume(&StreamKey::new("alice", "other", "main"))
        .unwrap();
    t.engine
        .cursors
        .start_or_resume(&StreamKey::new("bob", "continuum", "main"))
        .unwrap();

    let alice = t.engine.cursors.list("alice").unwrap();
    assert_eq!(alice.len(), 2);
    assert!(alice.iter().all(|c| c.user_id == "alice"));
    assert!(t.engine.cursors.list("nobody").unwrap().is_empty());
}
