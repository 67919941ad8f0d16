//! Integration tests for the reconcile path: compare, delete, update, add and
//! child cascade against an in-memory provider.

mod common;

use std::collections::HashSet;

use serde_json::json;

use cloudsync::driver::{Capability, DriverError};
use cloudsync::model::{DeletionState, Provider, ProviderKind, RemoteResource, ResourceKind, Status};
use cloudsync::store::StoreOp;
use cloudsync::{EngineConfig, Event, IssueKind, ReconcileOptions, ResourceStore, Scope, StoreError};

use common::{
    DOMAIN, HarnessOptions, PROVIDER, REGION, REGION_EXT, ctx, drain, harness, harness_with, read_only_harness,
};

#[tokio::test]
async fn test_add_only_generates_distinct_names() {
    let h = harness();
    h.upstream(
        ResourceKind::AccessGroup,
        vec![
            RemoteResource::new("ag-1", "grp"),
            RemoteResource::new("ag-2", "grp"),
        ],
    );

    let result = h.reconcile(ResourceKind::AccessGroup).await;
    assert_eq!((result.add, result.update, result.delete), (2, 0, 0));
    assert!(!result.is_error());

    let rows = h.rows(ResourceKind::AccessGroup).await;
    assert_eq!(h.external_ids(ResourceKind::AccessGroup).await, vec!["ag-1", "ag-2"]);
    let names: HashSet<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains("grp"));
    assert!(names.iter().any(|n| n.starts_with("grp-") && n.len() == "grp-".len() + 6));
    assert!(rows.iter().all(|r| r.status == Status::Available));
    assert!(rows.iter().all(|r| r.owner.domain_id == DOMAIN));
}

#[tokio::test]
async fn test_delete_only_cascades_children() {
    let h = harness();
    let ag1 = h.seed(h.mirror(ResourceKind::AccessGroup, "a", "ag-1")).await;
    h.seed(h.mirror(ResourceKind::AccessGroup, "b", "ag-2")).await;
    h.seed(
        h.mirror(ResourceKind::AccessGroupRule, "r", "r-a")
            .with_parent(&ag1.id),
    )
    .await;

    let mut events = h.subscribe();
    let result = h.reconcile(ResourceKind::AccessGroup).await;
    assert_eq!(result.delete, 2);
    assert_eq!(result.delete_errors, 0);
    assert!(h.rows(ResourceKind::AccessGroup).await.is_empty());
    assert!(h.store.is_empty().await);

    let deleted: Vec<Event> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, Event::SyncDelete { .. }))
        .collect();
    assert_eq!(deleted.len(), 3);
}

#[tokio::test]
async fn test_mixed_with_delete_prevention() {
    let h = harness();
    let kept = h
        .seed(
            h.mirror(ResourceKind::AccessGroup, "a", "ag-1")
                .with_disable_delete(true),
        )
        .await;
    h.seed(h.mirror(ResourceKind::AccessGroup, "b", "ag-2")).await;
    h.upstream(ResourceKind::AccessGroup, vec![RemoteResource::new("ag-3", "c")]);

    let result = h.reconcile(ResourceKind::AccessGroup).await;
    assert_eq!(result.add, 1);
    assert_eq!(result.delete, 1);
    assert_eq!(result.delete_errors, 1);
    assert!(result.has_issue(IssueKind::Validation));

    let kept = h.store.get(&kept.id).await.unwrap();
    assert_eq!(kept.status, Status::Unknown);
    assert!(kept.status_reason.is_some());
    assert_eq!(h.external_ids(ResourceKind::AccessGroup).await, vec!["ag-1", "ag-3"]);
}

#[tokio::test]
async fn test_default_resource_is_never_deleted() {
    let h = harness();
    let row = h
        .seed(
            h.mirror(ResourceKind::SecurityGroup, "default", "sg-1")
                .with_attr("is_default", true),
        )
        .await;

    let result = h.reconcile(ResourceKind::SecurityGroup).await;
    assert_eq!(result.delete, 0);
    assert_eq!(result.delete_errors, 1);
    assert_eq!(h.store.get(&row.id).await.unwrap().status, Status::Unknown);
}

#[tokio::test]
async fn test_update_mirrors_status_once() {
    let h = harness();
    let row = h.seed(h.mirror(ResourceKind::WafInstance, "w", "w-1")).await;
    let sold_out: Status = "soldout".parse().unwrap();
    h.upstream(
        ResourceKind::WafInstance,
        vec![RemoteResource::new("w-1", "w").with_status(sold_out)],
    );

    let mut events = h.subscribe();
    let result = h.reconcile(ResourceKind::WafInstance).await;
    assert_eq!(result.update, 1);
    assert_eq!(result.changed, 1);
    assert_eq!(h.store.get(&row.id).await.unwrap().status, Status::SoldOut);

    let updates: Vec<Event> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, Event::SyncUpdate { id, .. } if *id == row.id))
        .collect();
    assert_eq!(updates.len(), 1);
}

#[tokio::test]
async fn test_nested_cascade() {
    let h = harness();
    let ag1 = h.seed(h.mirror(ResourceKind::AccessGroup, "a", "ag-1")).await;
    h.seed(
        h.mirror(ResourceKind::AccessGroupRule, "r-a", "r-a")
            .with_parent(&ag1.id),
    )
    .await;
    h.upstream(ResourceKind::AccessGroup, vec![RemoteResource::new("ag-1", "a")]);
    h.cloud.set_children(
        ResourceKind::AccessGroupRule,
        "ag-1",
        vec![
            RemoteResource::new("r-b", "r-b"),
            RemoteResource::new("r-c", "r-c"),
        ],
    );

    let result = h.reconcile(ResourceKind::AccessGroup).await;
    assert_eq!(result.update, 1);
    assert_eq!((result.add, result.delete), (0, 0));

    let rules: Vec<_> = result.child(ResourceKind::AccessGroupRule).collect();
    assert_eq!(rules.len(), 1);
    assert_eq!((rules[0].add, rules[0].delete), (2, 1));

    assert_eq!(
        h.children(&ag1.id, ResourceKind::AccessGroupRule).await,
        vec!["r-b", "r-c"]
    );
    let rule = &h.store.list_children(&ag1.id, None).await.unwrap()[0];
    assert_eq!(rule.managed.provider_id.as_deref(), Some(PROVIDER));
    assert_eq!(rule.region.region_id.as_deref(), Some(REGION));
}

#[tokio::test]
async fn test_deleting_parent_removes_only_its_children() {
    let h = harness();
    let gone = h.seed(h.mirror(ResourceKind::AccessGroup, "a", "ag-1")).await;
    let kept = h.seed(h.mirror(ResourceKind::AccessGroup, "b", "ag-2")).await;
    for (parent, rule) in [(&gone, "r-1"), (&gone, "r-2"), (&kept, "r-3")] {
        h.seed(
            h.mirror(ResourceKind::AccessGroupRule, rule, rule)
                .with_parent(&parent.id),
        )
        .await;
    }
    h.upstream(ResourceKind::AccessGroup, vec![RemoteResource::new("ag-2", "b")]);
    h.cloud.set_children(
        ResourceKind::AccessGroupRule,
        "ag-2",
        vec![RemoteResource::new("r-3", "r-3")],
    );

    let result = h.reconcile(ResourceKind::AccessGroup).await;
    assert_eq!(result.delete, 1);
    assert!(h.children(&gone.id, ResourceKind::AccessGroupRule).await.is_empty());
    assert_eq!(
        h.children(&kept.id, ResourceKind::AccessGroupRule).await,
        vec!["r-3"]
    );
    assert!(matches!(
        h.store.get(&gone.id).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_read_only_provider_mirrors_tags_without_mutation() {
    let h = read_only_harness();
    let row = h
        .seed(
            h.mirror(ResourceKind::SslCertificate, "c", "c-1")
                .with_tag("a", "1"),
        )
        .await;
    h.upstream(
        ResourceKind::SslCertificate,
        vec![
            RemoteResource::new("c-1", "c")
                .with_tag("a", "1")
                .with_tag("b", "2"),
        ],
    );

    let result = h.reconcile(ResourceKind::SslCertificate).await;
    assert_eq!(result.changed, 1);
    let row = h.store.get(&row.id).await.unwrap();
    assert_eq!(row.tags.len(), 2);
    assert_eq!(row.tags.get("b").map(String::as_str), Some("2"));
    assert_eq!(h.cloud.mutation_calls(), 0);
}

#[tokio::test]
async fn test_read_only_provider_keeps_user_tags_local() {
    let h = read_only_harness();
    let row = h
        .seed(
            h.mirror(ResourceKind::Disk, "d", "d-1")
                .with_tag("user:owner", "alice"),
        )
        .await;
    h.upstream(ResourceKind::Disk, vec![RemoteResource::new("d-1", "d")]);

    let opts = ReconcileOptions {
        user_initiated: true,
        ..Default::default()
    };
    h.reconcile_with(ResourceKind::Disk, &opts).await;
    h.engine.tasks().wait_idle().await;

    assert_eq!(h.cloud.mutation_calls(), 0);
    assert!(h.engine.tasks().open_tasks().is_empty());
    let row = h.store.get(&row.id).await.unwrap();
    assert!(row.tags.contains_key("user:owner"));
}

#[tokio::test]
async fn test_user_tags_are_pushed_upstream() {
    let h = harness();
    let row = h
        .seed(
            h.mirror(ResourceKind::Disk, "d", "d-1")
                .with_tag("user:owner", "alice"),
        )
        .await;
    h.upstream(
        ResourceKind::Disk,
        vec![RemoteResource::new("d-1", "d").with_tag("env", "prod")],
    );

    h.reconcile(ResourceKind::Disk).await;
    h.engine.tasks().wait_idle().await;

    assert_eq!(h.cloud.calls(Capability::UpdateTags), 1);
    let remote = &h.cloud.list(ResourceKind::Disk, &h.upstream_key())[0];
    assert_eq!(remote.tags.get("user:owner").map(String::as_str), Some("alice"));
    assert_eq!(remote.tags.get("env").map(String::as_str), Some("prod"));
    assert_eq!(h.store.get(&row.id).await.unwrap().status, Status::Available);

    // Nothing left to push on the next pass.
    h.reconcile(ResourceKind::Disk).await;
    h.engine.tasks().wait_idle().await;
    assert_eq!(h.cloud.calls(Capability::UpdateTags), 1);
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let h = harness();
    h.seed(h.mirror(ResourceKind::Disk, "stale", "d-0")).await;
    h.upstream(
        ResourceKind::Disk,
        vec![
            RemoteResource::new("d-1", "data")
                .with_zone("z1")
                .with_attr("size_gb", 20),
            RemoteResource::new("d-2", "data").with_tag("env", "prod"),
            RemoteResource::new("d-3", "").with_status(Status::Creating),
        ],
    );

    let first = h.reconcile(ResourceKind::Disk).await;
    assert_eq!((first.add, first.delete), (3, 1));

    let second = h.reconcile(ResourceKind::Disk).await;
    assert_eq!(second.add, 0);
    assert_eq!(second.delete, 0);
    assert_eq!(second.changed, 0);
    assert_eq!(second.update, 3);
    assert_eq!(second.total_changes(), 0);
}

#[tokio::test]
async fn test_reconcile_converges_to_upstream_ids() {
    let h = harness();
    for (name, ext) in [("a", "x-1"), ("b", "x-2"), ("c", "x-3")] {
        h.seed(h.mirror(ResourceKind::SnapshotPolicy, name, ext)).await;
    }
    let prevented = h
        .seed(
            h.mirror(ResourceKind::SnapshotPolicy, "p", "x-9")
                .with_disable_delete(true),
        )
        .await;
    h.upstream(
        ResourceKind::SnapshotPolicy,
        ["x-2", "x-4", "x-5"]
            .iter()
            .map(|id| RemoteResource::new(*id, *id))
            .collect(),
    );

    h.reconcile(ResourceKind::SnapshotPolicy).await;

    let ids: Vec<String> = h
        .rows(ResourceKind::SnapshotPolicy)
        .await
        .into_iter()
        .filter(|r| r.id != prevented.id)
        .filter_map(|r| r.managed.external_id)
        .collect();
    assert_eq!(ids, vec!["x-2", "x-4", "x-5"]);
    assert_eq!(
        h.store.get(&prevented.id).await.unwrap().status,
        Status::Unknown
    );
}

#[tokio::test]
async fn test_names_unique_within_domain() {
    let h = harness();
    h.upstream(
        ResourceKind::Guest,
        (0..8)
            .map(|i| RemoteResource::new(format!("vm-{}", i), "web"))
            .collect(),
    );

    let result = h.reconcile(ResourceKind::Guest).await;
    assert_eq!(result.add, 8);
    let names: HashSet<String> = h
        .rows(ResourceKind::Guest)
        .await
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names.len(), 8);
}

#[tokio::test]
async fn test_transient_error_leaves_state_untouched() {
    let h = harness();
    let row = h.seed(h.mirror(ResourceKind::Disk, "d", "d-1")).await;
    h.cloud
        .inject_failure(ResourceKind::Disk, DriverError::Transient("throttled".into()));
    let writes = h.store.writes();

    let result = h.reconcile(ResourceKind::Disk).await;
    assert!(result.aborted);
    assert!(result.has_issue(IssueKind::Transient));
    assert_eq!(result.delete, 0);
    assert_eq!(h.store.writes(), writes);
    assert_eq!(h.store.get(&row.id).await.unwrap().version, row.version);

    h.cloud.clear_failure(ResourceKind::Disk);
    let result = h.reconcile(ResourceKind::Disk).await;
    assert_eq!(result.delete, 1);
}

#[tokio::test]
async fn test_xor_skips_field_updates() {
    let h = harness();
    let row = h.seed(h.mirror(ResourceKind::WafInstance, "w", "w-1")).await;
    h.upstream(
        ResourceKind::WafInstance,
        vec![
            RemoteResource::new("w-1", "w").with_status(Status::SoldOut),
            RemoteResource::new("w-2", "w2"),
        ],
    );

    let opts = ReconcileOptions {
        xor: true,
        ..Default::default()
    };
    let result = h.reconcile_with(ResourceKind::WafInstance, &opts).await;
    assert_eq!((result.add, result.update, result.changed), (1, 0, 0));
    assert_eq!(h.store.get(&row.id).await.unwrap().status, Status::Available);
}

#[tokio::test]
async fn test_matched_upstream_clears_delete_failed() {
    let h = harness();
    let failed = h
        .seed(
            h.mirror(ResourceKind::Disk, "d", "d-1")
                .with_status(Status::DeleteFailed),
        )
        .await;
    let never_created = h
        .seed(
            h.mirror(ResourceKind::Disk, "e", "d-2")
                .with_status(Status::CreateFailed),
        )
        .await;
    h.upstream(
        ResourceKind::Disk,
        vec![RemoteResource::new("d-1", "d"), RemoteResource::new("d-2", "e")],
    );

    h.reconcile(ResourceKind::Disk).await;
    let row = h.store.get(&failed.id).await.unwrap();
    assert_eq!(row.status, Status::Available);
    assert!(row.status_reason.is_none());
    assert_eq!(
        h.store.get(&never_created.id).await.unwrap().status,
        Status::CreateFailed
    );
}

#[tokio::test]
async fn test_referenced_row_is_kept_on_every_pass() {
    let h = harness();
    let mut group = h.mirror(ResourceKind::SecurityGroup, "sg", "sg-1");
    group.ref_count = 2;
    let group = h.seed(group).await;

    for _ in 0..2 {
        let result = h.reconcile(ResourceKind::SecurityGroup).await;
        assert_eq!((result.delete, result.delete_errors), (0, 1));
        assert!(result.has_issue(IssueKind::Validation));
        let row = h.store.get(&group.id).await.unwrap();
        assert_eq!(row.status, Status::Unknown);
        assert!(row.status_reason.unwrap().contains("referenced by 2"));
    }
}

#[tokio::test]
async fn test_group_used_by_guest_is_kept_until_guest_is_gone() {
    let h = harness();
    let group = h
        .seed(h.mirror(ResourceKind::SecurityGroup, "sg", "sg-1"))
        .await;
    let guest = h
        .mirror(ResourceKind::Guest, "web", "vm-1")
        .with_attr("security_group_ids", json!(["sg-1"]));
    let guest = h.seed(guest).await;
    h.upstream(
        ResourceKind::Guest,
        vec![RemoteResource::new("vm-1", "web").with_attr("security_group_ids", json!(["sg-1"]))],
    );

    let result = h.reconcile(ResourceKind::SecurityGroup).await;
    assert_eq!((result.delete, result.delete_errors), (0, 1));
    let row = h.store.get(&group.id).await.unwrap();
    assert_eq!(row.status, Status::Unknown);
    assert!(row.status_reason.unwrap().contains(&guest.id));

    h.upstream(ResourceKind::Guest, Vec::new());
    assert_eq!(h.reconcile(ResourceKind::Guest).await.delete, 1);

    let result = h.reconcile(ResourceKind::SecurityGroup).await;
    assert_eq!((result.delete, result.delete_errors), (1, 0));
    assert!(matches!(h.store.get(&group.id).await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_failed_delete_restores_row() {
    let h = harness();
    let group = h.seed(h.mirror(ResourceKind::AccessGroup, "a", "ag-1")).await;
    h.seed(
        h.mirror(ResourceKind::AccessGroupRule, "r", "r-1")
            .with_parent(&group.id),
    )
    .await;
    h.store.fail_once(
        StoreOp::ListChildren,
        0,
        StoreError::Internal("disk full".into()),
    );

    let result = h.reconcile(ResourceKind::AccessGroup).await;
    assert_eq!((result.delete, result.delete_errors), (0, 1));
    assert!(result.has_issue(IssueKind::Store));
    let row = h.store.get(&group.id).await.unwrap();
    assert_eq!(row.deletion, DeletionState::Active);
    assert_eq!(h.children(&group.id, ResourceKind::AccessGroupRule).await, vec!["r-1"]);

    let result = h.reconcile(ResourceKind::AccessGroup).await;
    assert_eq!((result.delete, result.delete_errors), (1, 0));
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_failed_tombstone_restores_row() {
    let h = harness();
    let row = h.seed(h.mirror(ResourceKind::Disk, "d", "d-1")).await;
    // The pending-delete write goes through; the tombstone write fails.
    h.store.fail_once(
        StoreOp::Update,
        1,
        StoreError::Internal("disk full".into()),
    );

    let result = h.reconcile(ResourceKind::Disk).await;
    assert_eq!(result.delete_errors, 1);
    let restored = h.store.get(&row.id).await.unwrap();
    assert_eq!(restored.deletion, DeletionState::Active);
    assert_eq!(h.rows(ResourceKind::Disk).await.len(), 1);

    assert_eq!(h.reconcile(ResourceKind::Disk).await.delete, 1);
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_permanent_listing_error_aborts_without_writes() {
    let h = harness();
    let row = h.seed(h.mirror(ResourceKind::Disk, "d", "d-1")).await;
    h.cloud.inject_failure(
        ResourceKind::Disk,
        DriverError::Permanent("access denied".into()),
    );
    let writes = h.store.writes();

    let result = h.reconcile(ResourceKind::Disk).await;
    assert!(result.aborted);
    assert!(result.has_issue(IssueKind::Permanent));
    assert_eq!((result.add, result.update, result.delete), (0, 0, 0));
    assert_eq!(h.store.writes(), writes);
    assert_eq!(h.store.get(&row.id).await.unwrap().version, row.version);
}

#[tokio::test]
async fn test_unreachable_region_aborts_before_listing() {
    let h = harness();
    h.seed(h.mirror(ResourceKind::Disk, "d", "d-1")).await;
    h.cloud.inject_region_failure(
        REGION_EXT,
        DriverError::Transient("region offline".into()),
    );

    let result = h.reconcile(ResourceKind::Disk).await;
    assert!(result.aborted);
    assert!(result.has_issue(IssueKind::Transient));
    assert_eq!(result.delete, 0);
    assert_eq!(h.cloud.calls(Capability::GetRegionHandle), 1);
    assert_eq!(h.cloud.calls(Capability::ListUpstream), 0);
    assert_eq!(h.rows(ResourceKind::Disk).await.len(), 1);

    h.cloud.clear_region_failure(REGION_EXT);
    assert_eq!(h.reconcile(ResourceKind::Disk).await.delete, 1);
}

#[tokio::test]
async fn test_pending_delete_row_is_recreated() {
    let h = harness();
    let mut pending = h.mirror(ResourceKind::AccessGroup, "a", "ag-1");
    pending.deletion = DeletionState::PendingDelete;
    let pending = h.seed(pending).await;
    h.upstream(ResourceKind::AccessGroup, vec![RemoteResource::new("ag-1", "a")]);

    let result = h.reconcile(ResourceKind::AccessGroup).await;
    assert_eq!(result.add, 1);
    let rows = h.rows(ResourceKind::AccessGroup).await;
    assert_eq!(rows.len(), 1);
    assert_ne!(rows[0].id, pending.id);
    assert_eq!(rows[0].managed.external_id.as_deref(), Some("ag-1"));
}

#[tokio::test]
async fn test_tombstoned_row_is_swept() {
    let h = harness();
    let mut dead = h.mirror(ResourceKind::Disk, "d", "d-1");
    dead.deletion = DeletionState::Tombstoned;
    let dead = h.seed(dead).await;

    let result = h.reconcile(ResourceKind::Disk).await;
    assert_eq!(result.delete, 0);
    assert!(matches!(
        h.store.get(&dead.id).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_rename_follows_upstream_only_when_enabled() {
    let h = harness();
    let row = h.seed(h.mirror(ResourceKind::Disk, "old", "d-1")).await;
    h.upstream(ResourceKind::Disk, vec![RemoteResource::new("d-1", "new")]);
    h.reconcile(ResourceKind::Disk).await;
    assert_eq!(h.store.get(&row.id).await.unwrap().name, "old");

    let config = EngineConfig {
        enable_sync_name: true,
        ..Default::default()
    };
    let h = harness_with(HarnessOptions {
        config: Some(config),
        ..Default::default()
    });
    let row = h.seed(h.mirror(ResourceKind::Disk, "old", "d-1")).await;
    let taken = h.seed(h.mirror(ResourceKind::Disk, "busy", "d-2")).await;
    h.upstream(
        ResourceKind::Disk,
        vec![
            RemoteResource::new("d-1", "new"),
            RemoteResource::new("d-2", "new"),
        ],
    );
    h.reconcile(ResourceKind::Disk).await;
    assert_eq!(h.store.get(&row.id).await.unwrap().name, "new");
    // The name is now taken; the second rename is skipped.
    assert_eq!(h.store.get(&taken.id).await.unwrap().name, "busy");
}

#[tokio::test]
async fn test_user_initiated_delete_goes_through_task() {
    let h = harness();
    let row = h.seed(h.mirror(ResourceKind::WafInstance, "w", "w-1")).await;

    let opts = ReconcileOptions {
        user_initiated: true,
        ..Default::default()
    };
    let result = h.reconcile_with(ResourceKind::WafInstance, &opts).await;
    assert_eq!(result.delete, 1);
    h.engine.tasks().wait_idle().await;

    assert_eq!(h.cloud.calls(Capability::Delete), 1);
    assert!(matches!(
        h.store.get(&row.id).await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_on_premise_scope_never_lists_upstream() {
    let h = harness();
    let local = h
        .seed(cloudsync::model::Resource::new(ResourceKind::Disk, "local").with_domain(DOMAIN))
        .await;
    let scope = Scope::provider(Provider::on_premise(DOMAIN));

    let result = h
        .engine
        .reconcile(&ctx(), ResourceKind::Disk, &scope, &ReconcileOptions::default())
        .await;
    assert!(!result.aborted);
    assert_eq!((result.add, result.delete), (0, 0));
    assert!(h.store.get(&local.id).await.is_ok());
    assert_eq!(h.cloud.calls(Capability::ListUpstream), 0);
}

#[tokio::test]
async fn test_project_mapping_on_create() {
    let h = harness();
    let mut provider = Provider::new(PROVIDER, ProviderKind::Aws, DOMAIN);
    provider
        .external_projects
        .insert("ext-1".to_string(), "proj-1".to_string());
    let scope = Scope::region(provider, h.region.clone());
    h.upstream(
        ResourceKind::Disk,
        vec![
            RemoteResource::new("d-1", "a").with_project("ext-1"),
            RemoteResource::new("d-2", "b"),
        ],
    );

    h.engine
        .reconcile(&ctx(), ResourceKind::Disk, &scope, &ReconcileOptions::default())
        .await;
    let rows = h.rows(ResourceKind::Disk).await;
    assert_eq!(rows[0].owner.project_id.as_deref(), Some("proj-1"));
    assert_eq!(rows[1].owner.project_id, None);
}

#[tokio::test]
async fn test_duplicate_remote_ids_are_reported() {
    let h = harness();
    h.upstream(ResourceKind::Disk, vec![RemoteResource::new("d-1", "a")]);
    h.cloud
        .put(ResourceKind::Disk, &h.upstream_key(), RemoteResource::new("", "nameless"));

    let result = h.reconcile(ResourceKind::Disk).await;
    assert_eq!(result.add, 1);
    assert!(result.has_issue(IssueKind::Invariant));
}
