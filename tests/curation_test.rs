mod helpers;

use continuum::curator::{CreateOutcome, TypedRelationship};
use continuum::events::{EventCategory, NewEvent};
use continuum::graph::{Creator, GraphStore, RelationType, Relationship};
use helpers::{seed_note, stream, FixedScorer, TestEngine};
use std::time::Duration;

async fn similarity_targets(t: &TestEngine, source: &str) -> Vec<(String, String)> {
    let mut edges: Vec<(String, String)> = t
        .graph
        .outgoing(source, Some(&RelationType::SimilarTo))
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.target_id, r.context))
        .collect();
    edges.sort();
    edges
}

#[tokio::test]
async fn only_neighbours_above_threshold_get_edges() {
    let scorer = FixedScorer::new().with("query", "x", 0.95).with("query", "y", 0.60);
    let t = TestEngine::with_scorer(scorer);
    let q = seed_note(&t.graph, "query", "retry sync with backoff").await;
    let x = seed_note(&t.graph, "x", "exponential backoff for replication").await;
    seed_note(&t.graph, "y", "cursor pause semantics").await;

    let created = t.engine.curator.curate(&q.id).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].target_id, x.id);
    assert_eq!(created[0].creator, Creator::Automated);

    assert_eq!(
        similarity_targets(&t, &q.id).await,
        vec![(x.id.clone(), "near_duplicate".to_string())]
    );
}

#[tokio::test]
async fn weak_neighbourhood_gets_no_edges() {
    // Both clear the 0.75 threshold but average 0.77, under the 0.80 floor.
    let scorer = FixedScorer::new().with("query", "a", 0.78).with("query", "b", 0.76);
    let t = TestEngine::with_scorer(scorer);
    let q = seed_note(&t.graph, "query", "some content").await;
    seed_note(&t.graph, "a", "other content").await;
    seed_note(&t.graph, "b", "more content").await;

    assert!(t.engine.curator.suggest(&q.id).await.unwrap().is_empty());
    assert!(t.engine.curator.curate(&q.id).await.unwrap().is_empty());
    assert!(similarity_targets(&t, &q.id).await.is_empty());
}

#[tokio::test]
async fn edges_are_banded_by_score() {
    let scorer = FixedScorer::new()
        .with("query", "dup", 0.97)
        .with("query", "close", 0.88)
        .with("query", "near", 0.80);
    let t = TestEngine::with_scorer(scorer);
    let q = seed_note(&t.graph, "query", "q").await;
    let dup = seed_note(&t.graph, "dup", "d").await;
    let close = seed_note(&t.graph, "close", "c").await;
    let near = seed_note(&t.graph, "near", "n").await;

    let suggestions = t.engine.curator.suggest(&q.id).await.unwrap();
    let bands: Vec<(&str, &str)> = suggestions
        .iter()
        .map(|r| (r.target_id.as_str(), r.context.as_str()))
        .collect();
    assert_eq!(
        bands,
        vec![
            (dup.id.as_str(), "near_duplicate"),
            (close.id.as_str(), "highly_related"),
            (near.id.as_str(), "related"),
        ]
    );

    // Suggesting writes nothing.
    assert!(similarity_targets(&t, &q.id).await.is_empty());
}

#[tokio::test]
async fn curation_keeps_only_the_top_k_edges() {
    let scorer = FixedScorer::new()
        .with("query", "a", 0.96)
        .with("query", "b", 0.90)
        .with("query", "c", 0.86);
    let t = TestEngine::configured(scorer, |c| c.curation.top_k = 2);
    let q = seed_note(&t.graph, "query", "q").await;
    let a = seed_note(&t.graph, "a", "a").await;
    let b = seed_note(&t.graph, "b", "b").await;
    let stale = seed_note(&t.graph, "stale", "s").await;

    let old = Relationship::new(
        RelationType::SimilarTo,
        &q.id,
        &stale.id,
        "related",
        Creator::Automated,
        0.78,
    );
    t.graph.upsert_relationship(&old).await.unwrap();

    t.engine.curator.curate(&q.id).await.unwrap();
    let targets: Vec<String> = similarity_targets(&t, &q.id)
        .await
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    let mut expected = vec![a.id.clone(), b.id.clone()];
    expected.sort();
    assert_eq!(targets, expected);
}

#[tokio::test]
async fn concurrent_curation_of_one_node_is_idempotent() {
    let scorer = FixedScorer::new().with("query", "x", 0.95).with("query", "z", 0.90);
    let t = TestEngine::with_scorer(scorer);
    let q = seed_note(&t.graph, "query", "q").await;
    seed_note(&t.graph, "x", "x").await;
    seed_note(&t.graph, "z", "z").await;

    let curator = t.engine.curator.clone();
    let runs = (0..8).map(|_| {
        let curator = curator.clone();
        let id = q.id.clone();
        tokio::spawn(async move { curator.curate(&id).await.unwrap().len() })
    });
    let mut created = 0;
    for run in runs.collect::<Vec<_>>() {
        created += run.await.unwrap();
    }

    assert_eq!(created, 2);
    assert_eq!(similarity_targets(&t, &q.id).await.len(), 2);
}

#[tokio::test]
async fn typed_relationships_are_created_once() {
    let t = TestEngine::new();
    let decision = seed_note(&t.graph, "Use JSONL", "one log per stream").await;
    let component = seed_note(&t.graph, "Event store", "src/events").await;

    let request = TypedRelationship {
        rel_type: "implements".into(),
        source_id: component.id.clone(),
        target_id: decision.id.clone(),
        context: "store follows the decision".into(),
        creator: Creator::Ai,
        confidence: Some(0.9),
    };
    assert!(matches!(
        t.engine.curator.create(request.clone()).await.unwrap(),
        CreateOutcome::Created { .. }
    ));
    assert!(matches!(
        t.engine.curator.create(request).await.unwrap(),
        CreateOutcome::AlreadyExists
    ));

    let rels = t
        .graph
        .relationships_for(&[decision.id.clone()])
        .await
        .unwrap();
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].rel_type.as_str(), "IMPLEMENTS");
    assert_eq!(rels[0].confidence, 0.9);
}

#[tokio::test]
async fn replicated_references_are_curated_in_the_background() {
    let scorer = FixedScorer::new().with("query", "x", 0.95);
    let t = TestEngine::with_scorer(scorer);
    t.engine.start_workers();
    let q = seed_note(&t.graph, "query", "q").await;
    let x = seed_note(&t.graph, "x", "x").await;

    t.engine
        .events
        .append(
            NewEvent::new(stream(), EventCategory::Insight, "q and x overlap")
                .with_node_refs(vec![q.id.clone()]),
        )
        .unwrap();
    t.engine.sync.flush().await.unwrap();

    let mut edges = Vec::new();
    for _ in 0..100 {
        edges = similarity_targets(&t, &q.id).await;
        if !edges.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].0, x.id);

    t.engine.shutdown().await;
}
