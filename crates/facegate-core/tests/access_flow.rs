//! End-to-end: capture, match miss, approval, commit, match hit.

use facegate_core::extractor::{extract_batch, EmbeddingExtractor, ExtractError};
use facegate_core::{
    spawn_notifier, CaptureEvent, CaptureStateMachine, Decision, Embedding, EmbeddingStore, Frame,
    LogNotifier, MatchEngine, MatchResult, NoMatchReason, RegistrationWorkflow, RequestState,
    RequestStatus,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DIM: usize = 512;

/// Deterministic pseudo-random vector; distinct seeds are near-orthogonal.
fn face_vector(seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    (0..DIM)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((state >> 8) % 2001) as f32 / 1000.0 - 1.0
        })
        .collect()
}

/// Maps a frame's first byte to a fixed face vector.
struct SeedExtractor;

impl EmbeddingExtractor for SeedExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError> {
        match frame.data.first() {
            Some(&seed) if seed != 0 => Ok(Embedding::new(face_vector(seed as u32))),
            _ => Err(ExtractError::NoFaceDetected),
        }
    }
}

fn frame(seed: u8) -> Frame {
    Frame {
        data: vec![seed; 4],
        width: 2,
        height: 2,
    }
}

fn open(dir: &std::path::Path) -> (Arc<EmbeddingStore>, RegistrationWorkflow) {
    let (store, _) = EmbeddingStore::open(dir).unwrap();
    let store = Arc::new(store);
    let notifier = spawn_notifier(LogNotifier, 8).unwrap();
    let wf = RegistrationWorkflow::new(Arc::clone(&store), notifier);
    (store, wf)
}

#[test]
fn registered_identity_matches_with_full_confidence() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, wf) = open(tmp.path());
    let v = face_vector(42);

    let id = wf.request("Bob", None).unwrap();
    wf.decide(id, Decision::Approve).unwrap();
    let batch = vec![Embedding::new(v.clone()); 3];
    assert_eq!(wf.commit(id, &batch).unwrap(), 3);

    let result = MatchEngine::default()
        .match_probe(&Embedding::new(v), &store.snapshot())
        .unwrap();
    match result {
        MatchResult::Match { identity, score } => {
            assert_eq!(identity, "Bob");
            assert!((score - 1.0).abs() < 1e-6);
        }
        other => panic!("expected Bob, got {other:?}"),
    }
}

#[test]
fn captured_frame_flows_through_registration() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, wf) = open(tmp.path());
    let engine = MatchEngine::default();
    let mut extractor = SeedExtractor;

    // Face holds still for the countdown.
    let t0 = Instant::now();
    let mut session = CaptureStateMachine::default();
    let mut captured = None;
    for step in 0..=6u64 {
        if session.on_frame(true, frame(9), t0 + Duration::from_millis(step * 500)) == CaptureEvent::Captured {
            captured = session.take();
        }
    }
    let captured = captured.expect("capture after countdown");

    let probe = extractor.extract(&captured).unwrap();
    let miss = engine.match_probe(&probe, &store.snapshot()).unwrap();
    assert_eq!(
        miss,
        MatchResult::NoMatch {
            reason: NoMatchReason::EmptyDatabase,
            best_score: None
        }
    );

    // Unknown face asks for access; approver says yes.
    let id = wf.request("Mallory", Some("preview://9".into())).unwrap();
    assert_eq!(wf.status(id), RequestStatus::Known(RequestState::Pending));
    let (postback_id, decision) =
        Decision::from_postback(&format!("action=approve&request_id={id}")).unwrap();
    wf.decide(postback_id, decision).unwrap();

    let embeddings = extract_batch(&mut extractor, &[frame(9), frame(0), frame(9)]);
    assert_eq!(wf.commit(id, &embeddings).unwrap(), 2);
    assert_eq!(wf.status(id), RequestStatus::NotFound);

    let hit = engine.match_probe(&probe, &store.snapshot()).unwrap();
    assert_eq!(hit.identity(), Some("Mallory"));

    // A different face stays unknown.
    let stranger = extractor.extract(&frame(200)).unwrap();
    let result = engine.match_probe(&stranger, &store.snapshot()).unwrap();
    assert!(matches!(
        result,
        MatchResult::NoMatch {
            reason: NoMatchReason::BelowThreshold,
            best_score: Some(_)
        }
    ));

    // Survives a reload from disk.
    store.reload().unwrap();
    let hit = engine.match_probe(&probe, &store.snapshot()).unwrap();
    assert_eq!(hit.identity(), Some("Mallory"));
}

#[test]
fn rejected_request_never_reaches_store() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, wf) = open(tmp.path());

    let id = wf.request("Eve", None).unwrap();
    wf.decide(id, Decision::Reject).unwrap();
    assert!(wf.commit(id, &[Embedding::new(face_vector(1))]).is_err());

    store.reload().unwrap();
    assert!(store.snapshot().is_empty());
}

#[test]
fn concurrent_readers_see_whole_snapshots() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _wf) = open(tmp.path());
    let engine = MatchEngine::default();
    let v = face_vector(5);

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let probe = Embedding::new(v.clone());
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let snap = store.snapshot();
                    // every identity in a snapshot carries its whole batch
                    for (_, embs) in snap.iter() {
                        assert_eq!(embs.len() % 2, 0);
                    }
                    engine.match_probe(&probe, &snap).unwrap();
                }
            })
        })
        .collect();

    for i in 0..10 {
        let batch = vec![Embedding::new(face_vector(100 + i)); 2];
        store.add(&format!("user{i}"), &batch).unwrap();
        if i % 3 == 0 {
            store.reload().unwrap();
        }
    }

    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(store.snapshot().len(), 10);
}
