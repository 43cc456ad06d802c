//! End-to-end scenarios over the full hub: sharing, inheritance,
//! revisions, delete cascades, app-scope isolation, and pagination.

use collab_store::bus::{urls, QueueSink};
use collab_store::types::{KIND_HTTP_PROJECT, KIND_WORKSPACE};
use collab_store::{
    json, AccessOp, AccessOperation, Alt, EventSink, FileMeta, JsonValue, ListOptions,
    PermissionType, Role, StoreConfig, StoreHub, User,
};
use std::sync::Arc;

async fn hub() -> StoreHub {
    StoreHub::start(StoreConfig {
        cursor_key: Some([42u8; 32]),
        ..StoreConfig::in_memory()
    })
    .await
    .unwrap()
}

async fn seed_users(hub: &StoreHub) -> (User, User) {
    let u1 = User::new("u1", "User One");
    let u2 = User::new("u2", "User Two");
    hub.user_add(&u1).await.unwrap();
    hub.user_add(&u2).await.unwrap();
    (u1, u2)
}

fn add_reader(id: &str) -> AccessOperation {
    AccessOperation {
        op: AccessOp::Add,
        kind: PermissionType::User,
        id: Some(id.to_string()),
        value: Some(Role::Reader),
        expiration_time: None,
    }
}

fn patch_envelope(id: &str, patch: JsonValue) -> JsonValue {
    json!({
        "app": "scenario-tests",
        "appVersion": "1.0.0",
        "id": id,
        "patch": patch,
    })
}

#[tokio::test]
async fn scenario_create_and_share_workspace() {
    let hub = hub().await;
    let (u1, u2) = seed_users(&hub).await;

    hub.file_create(FileMeta::new("s1", KIND_WORKSPACE, "s1"), Some(&u1), None)
        .await
        .unwrap();
    let read = hub.file_read("s1", Some(&u1)).await.unwrap();
    assert_eq!(read.owner, u1.key);

    // A channel authenticated as u2, anywhere, receives the grant.
    let (sink, mut rx) = QueueSink::pair();
    hub.bus()
        .register(sink, "/client", Some(u2.key.clone()), None);

    hub.file_patch_access("s1", &[add_reader(&u2.key)], Some(&u1))
        .await
        .unwrap();

    let page = hub
        .files_list(Some(&u2), None, &ListOptions::default())
        .await
        .unwrap();
    assert!(page.items.iter().any(|f| f.key == "s1"));

    let role = hub
        .check_access(Role::Reader, "s1", Some(&u2))
        .await
        .unwrap();
    assert_eq!(role, Role::Reader);

    let event: JsonValue = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
    assert_eq!(event["operation"], "access-granted");
    assert_eq!(event["kind"], "Workspace");
    assert_eq!(event["id"], "s1");
}

#[tokio::test]
async fn scenario_inherited_access() {
    let hub = hub().await;
    let (u1, u2) = seed_users(&hub).await;

    hub.file_create(FileMeta::new("s1", KIND_WORKSPACE, "s1"), Some(&u1), None)
        .await
        .unwrap();
    hub.file_patch_access("s1", &[add_reader(&u2.key)], Some(&u1))
        .await
        .unwrap();

    hub.file_create(
        FileMeta::new("s2", KIND_WORKSPACE, "s2"),
        Some(&u1),
        Some("s1"),
    )
    .await
    .unwrap();
    hub.file_create(
        FileMeta::new("p1", KIND_HTTP_PROJECT, "p1"),
        Some(&u1),
        Some("s2"),
    )
    .await
    .unwrap();

    // No explicit permission exists on p1, yet u2 reads it through s1.
    let p1 = hub.file_read("p1", Some(&u2)).await.unwrap();
    assert_eq!(p1.parents, vec!["s1".to_string(), "s2".to_string()]);

    // But u2 cannot write it.
    let info = patch_envelope("pp-x", json!([{ "op": "replace", "path": "/info/name", "value": "nope" }]));
    assert!(hub.file_patch("p1", &info, Some(&u2)).await.is_err());
}

#[tokio::test]
async fn scenario_patch_and_revision() {
    let hub = hub().await;
    let (u1, _) = seed_users(&hub).await;

    hub.file_create(FileMeta::new("p1", KIND_HTTP_PROJECT, "p1"), Some(&u1), None)
        .await
        .unwrap();
    hub.file_media_set(
        "p1",
        json!({ "info": { "name": "p1" } }),
        "application/json",
        Some(&u1),
        true,
    )
    .await
    .unwrap();

    let (sink, mut rx) = QueueSink::pair();
    hub.bus().register(sink, urls::file_media("p1"), None, None);

    let info = patch_envelope(
        "pp-1",
        json!([{ "op": "replace", "path": "/info/name", "value": "New" }]),
    );
    let revision = hub.file_media_patch("p1", &info, Some(&u1)).await.unwrap();

    let media = hub.file_media_read("p1", Some(&u1)).await.unwrap();
    assert_eq!(media.value["info"]["name"], "New");

    // One revision whose revert restores the original name.
    let page = hub
        .file_revisions_list("p1", Alt::Media, Some(&u1), &ListOptions::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    let (rolled_back, _) = collab_store::patch::apply(&media.value, &revision.revert).unwrap();
    assert_eq!(rolled_back["info"]["name"], "p1");

    // Two events: the revision creation, then the media patch.
    let first: JsonValue = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
    assert_eq!(first["operation"], "created");
    assert_eq!(first["kind"], "Revision");
    let second: JsonValue = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
    assert_eq!(second["operation"], "patch");
    assert_eq!(second["kind"], "HttpProject");
    assert_eq!(second["id"], "p1");
}

#[tokio::test]
async fn scenario_delete_cascades() {
    let hub = hub().await;
    let (u1, u2) = seed_users(&hub).await;

    hub.file_create(FileMeta::new("s1", KIND_WORKSPACE, "s1"), Some(&u1), None)
        .await
        .unwrap();
    hub.file_patch_access("s1", &[add_reader(&u2.key)], Some(&u1))
        .await
        .unwrap();
    hub.file_create(
        FileMeta::new("s2", KIND_WORKSPACE, "s2"),
        Some(&u1),
        Some("s1"),
    )
    .await
    .unwrap();
    hub.file_create(
        FileMeta::new("p1", KIND_HTTP_PROJECT, "p1"),
        Some(&u1),
        Some("s2"),
    )
    .await
    .unwrap();

    let (s2_sink, _rx1) = QueueSink::pair();
    let s2_handle = Arc::clone(&s2_sink);
    hub.bus().register(s2_sink, "/files/s2", None, None);
    let (p1_sink, _rx2) = QueueSink::pair();
    let p1_handle = Arc::clone(&p1_sink);
    hub.bus().register(p1_sink, "/files/p1", None, None);

    hub.file_delete("s2", Some(&u1)).await.unwrap();

    assert!(hub.file_read("s2", Some(&u1)).await.is_err());
    assert!(hub.file_read("p1", Some(&u1)).await.is_err());
    assert!(hub.bin().is_deleted(KIND_WORKSPACE, "s2").await);
    assert!(hub.bin().is_deleted(KIND_HTTP_PROJECT, "p1").await);

    // Channels bound to the deleted items were force-closed.
    assert!(!s2_handle.is_open());
    assert!(!p1_handle.is_open());

    // The grantee's listings no longer surface the deleted subtree.
    let page = hub
        .files_list(
            Some(&u2),
            None,
            &ListOptions {
                parent: Some("s1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn scenario_app_scope_isolation() {
    let hub = hub().await;
    let (u1, _) = seed_users(&hub).await;

    let project_a = hub
        .app_project_create(
            "A",
            Some(&u1),
            json!({ "key": "kA", "info": { "name": "Alpha backend" } }),
        )
        .await
        .unwrap();
    hub.app_project_create(
        "B",
        Some(&u1),
        json!({ "key": "kB", "info": { "name": "Bravo backend" } }),
    )
    .await
    .unwrap();

    let page = hub
        .app_projects_list("A", Some(&u1), &ListOptions::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].data["key"], "kA");

    // A name from scope B finds nothing in scope A.
    let hits = hub
        .app_projects_query("A", Some(&u1), "Bravo", 10)
        .await
        .unwrap();
    assert!(hits.is_empty());

    let batch = hub
        .app_project_read_batch("A", Some(&u1), &["kA".to_string(), "kB".to_string()], false)
        .await
        .unwrap();
    assert_eq!(
        batch[0].as_ref().unwrap().data["key"],
        project_a.data["key"]
    );
    assert!(batch[1].is_none());
}

#[tokio::test]
async fn scenario_pagination_stability() {
    let hub = hub().await;
    let (u1, _) = seed_users(&hub).await;

    for i in 0..40 {
        hub.file_create(
            FileMeta::new(&format!("space-{i:02}"), KIND_WORKSPACE, "s"),
            Some(&u1),
            None,
        )
        .await
        .unwrap();
    }

    let page1 = hub
        .files_list(Some(&u1), None, &ListOptions::limit(35))
        .await
        .unwrap();
    assert_eq!(page1.items.len(), 35);

    let page2 = hub
        .files_list(Some(&u1), None, &ListOptions::cursor(page1.cursor))
        .await
        .unwrap();
    assert_eq!(page2.items.len(), 5);

    let page3 = hub
        .files_list(Some(&u1), None, &ListOptions::cursor(page2.cursor.clone()))
        .await
        .unwrap();
    assert!(page3.items.is_empty());
    // At exhaustion the cursor is stable.
    assert_eq!(page3.cursor, page2.cursor);

    // Pages partition the listing: no overlaps, nothing missed.
    let mut seen: Vec<String> = page1
        .items
        .iter()
        .chain(page2.items.iter())
        .map(|f| f.key.clone())
        .collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 40);
}

#[tokio::test]
async fn access_patch_idempotency() {
    let hub = hub().await;
    let (u1, u2) = seed_users(&hub).await;
    hub.file_create(FileMeta::new("s1", KIND_WORKSPACE, "s1"), Some(&u1), None)
        .await
        .unwrap();

    hub.file_patch_access("s1", &[add_reader(&u2.key)], Some(&u1))
        .await
        .unwrap();
    let meta = hub
        .file_patch_access("s1", &[add_reader(&u2.key)], Some(&u1))
        .await
        .unwrap();
    assert_eq!(meta.permissions.len(), 1);

    let remove = AccessOperation {
        op: AccessOp::Remove,
        kind: PermissionType::User,
        id: Some(u2.key.clone()),
        value: None,
        expiration_time: None,
    };
    hub.file_patch_access("s1", &[remove.clone()], Some(&u1))
        .await
        .unwrap();
    // Removing again is a no-op.
    let meta = hub
        .file_patch_access("s1", &[remove], Some(&u1))
        .await
        .unwrap();
    assert!(meta.permissions.is_empty());
    assert!(hub.file_read("s1", Some(&u2)).await.is_err());
}

#[tokio::test]
async fn legacy_spaces_route_family() {
    let hub = hub().await;
    let (u1, _) = seed_users(&hub).await;

    hub.space_create(FileMeta::new("legacy-1", KIND_WORKSPACE, "Legacy"), Some(&u1), None)
        .await
        .unwrap();
    hub.space_project_create(
        "legacy-1",
        "proj-1",
        "Legacy project",
        json!({ "info": { "name": "Legacy project" } }),
        Some(&u1),
    )
    .await
    .unwrap();

    // Renaming through a content patch propagates into the index.
    let info = patch_envelope(
        "pp-l1",
        json!([{ "op": "replace", "path": "/info/name", "value": "Renamed" }]),
    );
    hub.space_project_patch("legacy-1", "proj-1", &info, Some(&u1))
        .await
        .unwrap();
    let meta = hub
        .space_project_read("legacy-1", "proj-1", Some(&u1))
        .await
        .unwrap();
    assert_eq!(meta.info.name, "Renamed");

    // The legacy family never leaks into the file family.
    assert!(hub.file_read("legacy-1", Some(&u1)).await.is_err());

    // Deleting the space cascades over its nested projects.
    hub.space_delete("legacy-1", Some(&u1)).await.unwrap();
    assert!(hub.space_read("legacy-1", Some(&u1)).await.is_err());
    assert!(hub
        .space_project_read("legacy-1", "proj-1", Some(&u1))
        .await
        .is_err());
    assert!(hub.bin().is_deleted(KIND_HTTP_PROJECT, "proj-1").await);
}
