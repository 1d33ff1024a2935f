//! Deferred merge engine against the recording VCS fake.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{ClearingResolver, FailingResolver, FakeVcs};
use patchwright::parallel::{
    ConflictStage, DeferredMergeEngine, ManualResolver, MergeOptions, QueuedBranch,
    MISSING_BRANCH_ERROR,
};

fn queued(vcs: &FakeVcs, branches: &[&str]) -> Vec<QueuedBranch> {
    branches
        .iter()
        .map(|b| {
            vcs.add_branch(b);
            QueuedBranch::new(*b, format!("owner-{}", b), format!("Merge {}", b))
        })
        .collect()
}

fn engine(vcs: &Arc<FakeVcs>) -> DeferredMergeEngine {
    DeferredMergeEngine::new(vcs.clone(), MergeOptions::default())
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_branches_merge_strictly_in_input_order() {
    let vcs = Arc::new(FakeVcs::new());
    let branches = queued(&vcs, &["b1", "b2", "b3"]);

    let summary = engine(&vcs)
        .merge_sequentially(&branches, "main", &ManualResolver)
        .await;

    assert_eq!(summary.merged_count(), 3);
    assert!(!vcs.overlapped());
    let order: Vec<&str> = summary.results.iter().map(|r| r.branch.as_str()).collect();
    assert_eq!(order, vec!["b1", "b2", "b3"]);

    for (prev, next) in [("b1", "b2"), ("b2", "b3")] {
        let merged = vcs.position(&format!("merge {} into main", prev)).unwrap();
        let rebased = vcs.position(&format!("rebase {} onto main", next)).unwrap();
        assert!(merged < rebased, "{:?}", vcs.calls());
    }
}

#[tokio::test]
async fn test_empty_queue_touches_nothing() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.set_dirty(true);

    let summary = engine(&vcs).merge_sequentially(&[], "main", &ManualResolver).await;

    assert!(summary.results.is_empty());
    assert!(vcs.calls().is_empty());
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn test_resolved_rebase_conflict_merges_and_deletes_branch() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.conflict_on_rebase("b1", &["a.ts"]);
    let resolver = ClearingResolver::new(vcs.clone());
    let branches = queued(&vcs, &["b1"]);

    let summary = engine(&vcs).merge_sequentially(&branches, "main", &resolver).await;

    let result = &summary.results[0];
    assert!(result.success, "{:?}", result);
    assert!(!vcs.has_branch("b1"));

    let requests = resolver.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].files, vec!["a.ts"]);
    assert_eq!(requests[0].stage, ConflictStage::Rebase);

    let continued = vcs.position("continue_rebase").unwrap();
    let merged = vcs.position("merge b1 into main").unwrap();
    assert!(continued < merged);
}

#[tokio::test]
async fn test_persistent_conflicts_leave_branch_for_manual_merge() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.conflict_on_rebase("b1", &["a.ts"]);
    vcs.conflict_on_merge("b1", &["a.ts"]);
    let resolver = FailingResolver::new();
    let branches = queued(&vcs, &["b1"]);

    let summary = engine(&vcs).merge_sequentially(&branches, "main", &resolver).await;

    let result = &summary.results[0];
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("after 3 attempts"));
    assert!(vcs.has_branch("b1"));
    assert_eq!(vcs.count("rebase b1"), 3);
    assert_eq!(vcs.count("delete_branch"), 0);
    // One rebase resolution and one direct-merge resolution per attempt.
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 6);

    let instructions = summary.manual_instructions();
    assert_eq!(instructions.len(), 1);
    assert!(instructions[0].starts_with("git checkout main && git merge b1"));
}

#[tokio::test]
async fn test_direct_merge_fallback_after_failed_resolution() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.conflict_on_rebase("b1", &["lib.rs"]);
    let resolver = FailingResolver::new();
    let branches = queued(&vcs, &["b1"]);

    let summary = engine(&vcs).merge_sequentially(&branches, "main", &resolver).await;

    assert!(summary.results[0].success);
    let aborted = vcs.position("abort_rebase").unwrap();
    let merged = vcs.position("merge b1 into main").unwrap();
    assert!(aborted < merged);
    assert_eq!(vcs.count("rebase b1"), 1);
}

#[tokio::test]
async fn test_merge_failure_after_clean_rebase_is_retried() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.conflict_on_merge("b1", &["Cargo.lock"]);
    let branches = queued(&vcs, &["b1"]);

    let summary = engine(&vcs)
        .merge_sequentially(&branches, "main", &ManualResolver)
        .await;

    assert!(!summary.results[0].success);
    assert_eq!(vcs.count("rebase b1"), 3);
    assert_eq!(vcs.count("abort_merge"), 3);
    assert_eq!(vcs.count("abort_rebase"), 0);
}

// ============================================================================
// Working tree state
// ============================================================================

#[tokio::test]
async fn test_missing_branch_is_reported_without_retry() {
    let vcs = Arc::new(FakeVcs::new());
    let mut branches = queued(&vcs, &["b1", "b3"]);
    branches.insert(1, QueuedBranch::new("b2", "owner-b2", "Merge b2"));

    let summary = engine(&vcs)
        .merge_sequentially(&branches, "main", &ManualResolver)
        .await;

    assert_eq!(summary.results[1].error.as_deref(), Some(MISSING_BRANCH_ERROR));
    assert_eq!(vcs.count("rebase b2"), 0);
    assert!(summary.results[0].success);
    assert!(summary.results[2].success);
}

#[tokio::test]
async fn test_local_changes_are_stashed_and_restored() {
    let vcs = Arc::new(FakeVcs::new());
    vcs.set_dirty(true);
    let branches = queued(&vcs, &["b1", "b2"]);

    let summary = engine(&vcs)
        .merge_sequentially(&branches, "main", &ManualResolver)
        .await;

    assert!(summary.stashed);
    assert!(summary.stash_error.is_none());
    let calls = vcs.calls();
    assert_eq!(calls.first().map(String::as_str), Some("stash"));
    assert_eq!(calls.last().map(String::as_str), Some("pop_stash"));
    assert!(!vcs.is_stashed());
}
