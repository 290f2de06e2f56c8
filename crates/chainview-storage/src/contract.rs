//! Behaviour every backend must show, run by each backend's tests.

use serde_json::json;

use chainview_core::store::{HeightGatedStore, StoredRow, WriteOutcome};
use chainview_core::types::Height;

pub(crate) fn row(kind: &str, key: &str, scope: &str, height: Height, text: &str) -> StoredRow {
    StoredRow {
        kind: kind.to_string(),
        key: key.to_string(),
        scope: scope.to_string(),
        height,
        deleted: false,
        payload: json!({ "text": text }),
    }
}

fn text(row: &StoredRow) -> &str {
    row.payload["text"].as_str().unwrap_or_default()
}

/// Idempotence, monotonicity and stale-write rejection on post `(1, 42)`.
pub(crate) async fn height_gate<S: HeightGatedStore>(store: &S) {
    let at_100 = row("post", "1/42", "subspace/1", 100, "edited at 100");
    let at_90 = row("post", "1/42", "subspace/1", 90, "created at 90");

    assert_eq!(store.upsert(&at_100).await.unwrap(), WriteOutcome::Applied);
    // same write again is a no-op with the same result
    assert_eq!(store.upsert(&at_100).await.unwrap(), WriteOutcome::Applied);
    // the older write arrives late
    assert_eq!(store.upsert(&at_90).await.unwrap(), WriteOutcome::Stale);

    let stored = store.get("post", "1/42").await.unwrap().unwrap();
    assert_eq!(stored.height, 100);
    assert_eq!(text(&stored), "edited at 100");
    assert_eq!(store.list_kind("post").await.unwrap().len(), 1);

    let at_120 = row("post", "1/42", "subspace/1", 120, "edited at 120");
    assert!(store.upsert(&at_120).await.unwrap().is_applied());
    assert_eq!(store.get("post", "1/42").await.unwrap().unwrap().height, 120);
}

/// Deletes are gated and leave a tombstone an older create cannot revive.
pub(crate) async fn tombstones<S: HeightGatedStore>(store: &S) {
    store
        .upsert(&row("profile", "desmos1alice", "global", 50, "alice"))
        .await
        .unwrap();

    // an older delete loses
    assert_eq!(
        store.delete("profile", "desmos1alice", "global", 40).await.unwrap(),
        WriteOutcome::Stale
    );
    assert!(store.get("profile", "desmos1alice").await.unwrap().is_some());

    assert_eq!(
        store.delete("profile", "desmos1alice", "global", 60).await.unwrap(),
        WriteOutcome::Applied
    );
    assert!(store.get("profile", "desmos1alice").await.unwrap().is_none());
    assert!(store.list_scope("profile", "global").await.unwrap().is_empty());
    assert_eq!(store.deleted_at("profile", "desmos1alice").await.unwrap(), Some(60));

    // replayed create from before the delete
    assert_eq!(
        store
            .upsert(&row("profile", "desmos1alice", "global", 55, "alice"))
            .await
            .unwrap(),
        WriteOutcome::Stale
    );
    assert!(store.get("profile", "desmos1alice").await.unwrap().is_none());

    // a newer create revives it
    store
        .upsert(&row("profile", "desmos1alice", "global", 70, "alice again"))
        .await
        .unwrap();
    let revived = store.get("profile", "desmos1alice").await.unwrap().unwrap();
    assert_eq!(text(&revived), "alice again");
    assert_eq!(store.deleted_at("profile", "desmos1alice").await.unwrap(), None);
    assert_eq!(store.deleted_at("profile", "desmos1nobody").await.unwrap(), None);

    // deleting an unknown key records a tombstone
    assert!(store
        .delete("profile", "desmos1bob", "global", 80)
        .await
        .unwrap()
        .is_applied());
    assert_eq!(
        store
            .upsert(&row("profile", "desmos1bob", "global", 79, "bob"))
            .await
            .unwrap(),
        WriteOutcome::Stale
    );
}

/// `delete_all_reactions(50)` followed by reinserting 3 reactions.
pub(crate) async fn scope_replace<S: HeightGatedStore>(store: &S) {
    let post_50 = "subspace/1/post/50";
    let post_51 = "subspace/1/post/51";
    for id in 1..=5 {
        store
            .upsert(&row("reaction", &format!("1/50/{id}"), post_50, 30, "👍"))
            .await
            .unwrap();
    }
    store.delete("reaction", "1/50/5", post_50, 31).await.unwrap();
    store
        .upsert(&row("reaction", "1/51/1", post_51, 30, "🔥"))
        .await
        .unwrap();

    // tombstone of reaction 5 is removed too
    assert_eq!(store.delete_scope("reaction", post_50, 40).await.unwrap(), 5);
    assert!(store.list_scope("reaction", post_50).await.unwrap().is_empty());

    for id in [2, 6, 7] {
        store
            .upsert(&row("reaction", &format!("1/50/{id}"), post_50, 40, "❤"))
            .await
            .unwrap();
    }
    let keys: Vec<String> = store
        .list_scope("reaction", post_50)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.key)
        .collect();
    assert_eq!(keys, vec!["1/50/2", "1/50/6", "1/50/7"]);

    // other scopes untouched
    assert_eq!(store.list_scope("reaction", post_51).await.unwrap().len(), 1);
    assert_eq!(store.list_kind("reaction").await.unwrap().len(), 4);
}
