mod helpers;

use continuum::context::{LoadOptions, NodeOrigin};
use continuum::events::{EventCategory, NewEvent};
use continuum::graph::{Creator, GraphStore, RelationType, Relationship};
use continuum::ContinuumError;
use helpers::{append_n, seed_note, stream, TestEngine};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn edge(rel_type: RelationType, source: &str, target: &str, confidence: f64) -> Relationship {
    Relationship::new(rel_type, source, target, "", Creator::Human, confidence)
}

#[tokio::test]
async fn loads_the_most_recent_events_up_to_the_limit() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    let ids = append_n(&t.engine, &key, 60);

    let options = LoadOptions {
        event_limit: Some(50),
        ..Default::default()
    };
    let bundle = t
        .engine
        .context
        .load(&cursor.id, options, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!bundle.degraded);
    assert_eq!(bundle.events.len(), 50);
    assert_eq!(bundle.events[0].id, ids[59]);
    assert_eq!(bundle.events[49].id, ids[10]);
    assert!(bundle.events.iter().all(|e| !ids[..10].contains(&e.id)));
}

#[tokio::test]
async fn paused_cursor_loads_from_its_pin() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    let before = append_n(&t.engine, &key, 3);
    t.engine.cursors.pause(&cursor.id).unwrap();
    append_n(&t.engine, &key, 2);

    let bundle = t
        .engine
        .context
        .load(&cursor.id, LoadOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(bundle.position.as_deref(), Some(before[2].as_str()));
    let got: Vec<_> = bundle.events.iter().map(|e| e.id.clone()).collect();
    assert_eq!(got, vec![before[2].clone(), before[1].clone(), before[0].clone()]);
}

#[tokio::test]
async fn referenced_nodes_expand_through_relationships() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;

    let decision = seed_note(&t.graph, "Use JSONL logs", "one file per stream").await;
    let component = seed_note(&t.graph, "Event store", "src/events").await;
    let dependency = seed_note(&t.graph, "Sync queue", "state.db").await;
    let similar = seed_note(&t.graph, "Append-only storage", "logs never rewrite").await;

    for rel in [
        edge(RelationType::typed("implements").unwrap(), &component.id, &decision.id, 1.0),
        edge(RelationType::typed("depends_on").unwrap(), &component.id, &dependency.id, 1.0),
        edge(RelationType::SimilarTo, &decision.id, &similar.id, 0.9),
    ] {
        t.graph.upsert_relationship(&rel).await.unwrap();
    }

    t.engine
        .events
        .append(
            NewEvent::new(key.clone(), EventCategory::Decision, "chose JSONL")
                .with_node_refs(vec![decision.id.clone()]),
        )
        .unwrap();

    let load = |depth| {
        let options = LoadOptions {
            depth: Some(depth),
            ..Default::default()
        };
        let engine = &t.engine;
        let cursor_id = cursor.id.clone();
        async move {
            engine
                .context
                .load(&cursor_id, options, &CancellationToken::new())
                .await
                .unwrap()
        }
    };

    let shallow = load(1).await;
    let origin_of = |bundle: &continuum::context::ContextBundle, id: &str| {
        bundle
            .nodes
            .iter()
            .find(|n| n.node.id == id)
            .map(|n| (n.origin, n.depth))
    };
    assert_eq!(origin_of(&shallow, &decision.id), Some((NodeOrigin::Referenced, 0)));
    assert_eq!(origin_of(&shallow, &component.id), Some((NodeOrigin::Typed, 1)));
    assert_eq!(origin_of(&shallow, &similar.id), Some((NodeOrigin::Similar, 1)));
    assert_eq!(origin_of(&shallow, &dependency.id), None);

    let deep = load(2).await;
    assert_eq!(origin_of(&deep, &dependency.id), Some((NodeOrigin::Typed, 2)));

    let flat = load(0).await;
    assert_eq!(flat.nodes.len(), 1);
}

#[tokio::test]
async fn typed_neighbours_of_similar_nodes_stay_similar() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;

    let seed = seed_note(&t.graph, "Retry policy", "exponential backoff").await;
    let lookalike = seed_note(&t.graph, "Backoff tuning", "jittered delays").await;
    let implementer = seed_note(&t.graph, "Sync worker", "src/sync").await;
    for rel in [
        edge(RelationType::SimilarTo, &seed.id, &lookalike.id, 0.9),
        edge(RelationType::typed("implements").unwrap(), &implementer.id, &lookalike.id, 1.0),
    ] {
        t.graph.upsert_relationship(&rel).await.unwrap();
    }
    t.engine
        .events
        .append(
            NewEvent::new(key.clone(), EventCategory::Decision, "retry with backoff")
                .with_node_refs(vec![seed.id.clone()]),
        )
        .unwrap();

    let options = LoadOptions {
        depth: Some(2),
        ..Default::default()
    };
    let bundle = t
        .engine
        .context
        .load(&cursor.id, options, &CancellationToken::new())
        .await
        .unwrap();

    let reached = bundle
        .nodes
        .iter()
        .find(|n| n.node.id == implementer.id)
        .map(|n| (n.origin, n.depth, n.via.clone()));
    assert_eq!(
        reached,
        Some((NodeOrigin::Similar, 2, Some("IMPLEMENTS".to_string())))
    );
}

#[tokio::test]
async fn unreachable_graph_degrades_to_local_events() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    let node = seed_note(&t.graph, "Cursor model", "one cursor per stream").await;
    append_n(&t.engine, &key, 3);
    t.engine
        .events
        .append(
            NewEvent::new(key.clone(), EventCategory::Insight, "cursors replace sessions")
                .with_node_refs(vec![node.id.clone()]),
        )
        .unwrap();

    t.graph.set_available(false);
    let bundle = t
        .engine
        .context
        .load(&cursor.id, LoadOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(bundle.degraded);
    assert!(bundle.degraded_reason.is_some());
    assert_eq!(bundle.events.len(), 4);
    assert!(bundle.nodes.is_empty());
}

#[tokio::test]
async fn unreachable_graph_degrades_even_without_node_refs() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    append_n(&t.engine, &key, 3);

    t.graph.set_available(false);
    let bundle = t
        .engine
        .context
        .load(&cursor.id, LoadOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(bundle.degraded);
    assert!(bundle.degraded_reason.is_some());
    assert_eq!(bundle.events.len(), 3);
    assert!(bundle.nodes.is_empty());

    t.graph.set_available(true);
    let bundle = t
        .engine
        .context
        .load(&cursor.id, LoadOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!bundle.degraded);
}

#[tokio::test]
async fn slow_graph_without_node_refs_still_times_out() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    append_n(&t.engine, &key, 2);

    t.graph.set_latency(Duration::from_secs(2));
    let options = LoadOptions {
        timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let bundle = t
        .engine
        .context
        .load(&cursor.id, options, &CancellationToken::new())
        .await
        .unwrap();

    assert!(bundle.degraded);
    assert_eq!(bundle.events.len(), 2);
}

#[tokio::test]
async fn slow_graph_is_cut_off_at_the_timeout() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    let node = seed_note(&t.graph, "Timeouts", "bounded loads").await;
    t.engine
        .events
        .append(
            NewEvent::new(key.clone(), EventCategory::Fix, "bound the load")
                .with_node_refs(vec![node.id.clone()]),
        )
        .unwrap();

    t.graph.set_latency(Duration::from_secs(2));
    let options = LoadOptions {
        timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let started = Instant::now();
    let bundle = t
        .engine
        .context
        .load(&cursor.id, options, &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(bundle.degraded);
    assert_eq!(bundle.events.len(), 1);
}

#[tokio::test]
async fn budget_drops_similar_nodes_then_oldest_events() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;

    // Each node and each event below costs 9 tokens.
    let referenced = seed_note(&t.graph, "A", "aaaa").await;
    let similar = seed_note(&t.graph, "C", "cccc").await;
    t.graph
        .upsert_relationship(&edge(RelationType::SimilarTo, &referenced.id, &similar.id, 0.9))
        .await
        .unwrap();

    t.engine
        .events
        .append(
            NewEvent::new(key.clone(), EventCategory::Fix, "event r")
                .with_node_refs(vec![referenced.id.clone()]),
        )
        .unwrap();
    let ids = append_n(&t.engine, &key, 4);

    let options = LoadOptions {
        size_budget: Some(36),
        ..Default::default()
    };
    let bundle = t
        .engine
        .context
        .load(&cursor.id, options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(bundle.nodes.len(), 1);
    assert_eq!(bundle.nodes[0].node.id, referenced.id);
    let got: Vec<_> = bundle.events.iter().map(|e| e.id.clone()).collect();
    assert_eq!(got, vec![ids[3].clone(), ids[2].clone(), ids[1].clone()]);
    assert_eq!(bundle.dropped, 3);
    assert_eq!(bundle.token_estimate, 36);
}

#[tokio::test]
async fn active_work_nodes_are_included() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    let working = seed_note(&t.graph, "Loader", "bundle assembly").await;
    append_n(&t.engine, &key, 1);

    let options = LoadOptions {
        active_work: vec![working.id.clone()],
        ..Default::default()
    };
    let bundle = t
        .engine
        .context
        .load(&cursor.id, options, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(bundle.nodes.len(), 1);
    assert_eq!(bundle.nodes[0].origin, NodeOrigin::ActiveWork);
}

#[tokio::test]
async fn cancelled_load_returns_cancelled() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    append_n(&t.engine, &key, 2);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = t
        .engine
        .context
        .load(&cursor.id, LoadOptions::default(), &cancel)
        .await;
    assert!(matches!(result, Err(ContinuumError::Cancelled)));
}

#[tokio::test]
async fn cancellation_interrupts_a_slow_expansion() {
    let t = TestEngine::new();
    let key = stream();
    let cursor = t.engine.cursors.start_or_resume(&key).unwrap().cursor;
    let node = seed_note(&t.graph, "Slow", "graph").await;
    t.engine
        .events
        .append(
            NewEvent::new(key.clone(), EventCategory::Fix, "slow path")
                .with_node_refs(vec![node.id.clone()]),
        )
        .unwrap();
    t.graph.set_latency(Duration::from_secs(5));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = t
        .engine
        .context
        .load(&cursor.id, LoadOptions::default(), &cancel)
        .await;
    assert!(matches!(result, Err(ContinuumError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn unknown_cursor_fails() {
    let t = TestEngine::new();
    let result = t
        .engine
        .context
        .load("missing", LoadOptions::default(), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(ContinuumError::CursorNotFound(_))));
}
