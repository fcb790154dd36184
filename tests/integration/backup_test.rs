// tests/integration/backup_test.rs

//! End-to-end backup pipeline tests against the fake agent.

use super::test_helpers::*;
use chrono::Utc;
use ringmaster::core::backup::model::{
    self, is_snapshot_tag, new_snapshot_tag, progress_key, remote_manifest_file,
};
use ringmaster::core::backup::{Run, Stage};
use ringmaster::core::ids;
use ringmaster::core::runner::RunStatus;
use ringmaster::core::store::DocumentStore;
use ringmaster::core::ManagerError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const HOSTS: &[&str] = &["192.168.100.11", "192.168.100.12", "192.168.100.13"];

fn three_node_agent() -> Arc<FakeAgent> {
    FakeAgent::new(
        &[("dc1", HOSTS)],
        &[("store", &["orders", "order_items"]), ("audit", &["events"])],
        2,
    )
}

fn props() -> serde_json::Value {
    json!({"location": ["s3:bucket"], "retention": 2})
}

#[tokio::test]
async fn test_backup_happy_path() {
    let env = TestEnv::new(three_node_agent());
    let svc = env.backup_service(fast_backup_config());
    let (cluster, task, run) = (Uuid::new_v4(), Uuid::new_v4(), ids::new_run_id());

    let target = svc.get_target(cluster, &props()).await.unwrap();
    assert_eq!(target.units.len(), 2);
    assert_eq!(target.retention, 2);

    let ctx = CancellationToken::new();
    svc.backup(&ctx, cluster, task, run, target).await.unwrap();

    let r = svc.get_run(cluster, task, run).await.unwrap();
    assert_eq!(r.status, RunStatus::Done);
    assert_eq!(r.stage, Stage::Done);
    assert!(is_snapshot_tag(&r.snapshot_tag));

    // One manifest per host at the canonical path.
    let paths = env.agent.remote_paths();
    for host in HOSTS {
        let manifest = format!(
            "s3:bucket/{}",
            remote_manifest_file(cluster, task, &r.snapshot_tag, "dc1", &host_id(host))
        );
        assert!(paths.contains(&manifest), "missing {manifest}");
    }
    assert_eq!(
        paths.iter().filter(|p| p.ends_with(".manifest.gz")).count(),
        HOSTS.len()
    );

    // The schema dump is uploaded once.
    assert_eq!(
        paths
            .iter()
            .filter(|p| p.starts_with("s3:bucket/backup/schema/"))
            .count(),
        1
    );

    // 3 hosts x 3 tables x 2 files of sstable data.
    assert_eq!(
        paths
            .iter()
            .filter(|p| p.starts_with("s3:bucket/backup/sst/"))
            .count(),
        18
    );

    // Per-table accounting: everything either uploaded or deduplicated.
    let p = svc.get_progress(cluster, task, run).await.unwrap();
    assert_eq!(p.snapshot_tag, r.snapshot_tag);
    assert_eq!(p.hosts.len(), HOSTS.len());
    assert!(p.totals.size > 0);
    for h in &p.hosts {
        for ks in &h.keyspaces {
            for t in &ks.tables {
                assert!(t.totals.size > 0);
                assert_eq!(
                    t.totals.uploaded + t.totals.skipped,
                    t.totals.size,
                    "host {} table {}",
                    h.host,
                    t.table
                );
                assert_eq!(t.totals.failed, 0);
            }
        }
    }

    // Purge reclaimed the node-local snapshots but deleted no remote data.
    let snapshots = env.agent.state.lock().snapshots.clone();
    for host in HOSTS {
        assert!(
            !snapshots
                .get(*host)
                .map(|tags| tags.contains(&r.snapshot_tag))
                .unwrap_or(false),
            "local snapshot should be deleted on {host}"
        );
    }
}

#[tokio::test]
async fn test_backup_applies_and_clears_rate_limit() {
    let env = TestEnv::new(three_node_agent());
    let svc = env.backup_service(fast_backup_config());
    let (cluster, task, run) = (Uuid::new_v4(), Uuid::new_v4(), ids::new_run_id());

    let target = svc
        .get_target(
            cluster,
            &json!({"location": ["s3:bucket"], "retention": 1, "rate_limit": ["50"]}),
        )
        .await
        .unwrap();
    let ctx = CancellationToken::new();
    svc.backup(&ctx, cluster, task, run, target).await.unwrap();

    let bandwidth = env.agent.state.lock().bandwidth.clone();
    for host in HOSTS {
        assert_eq!(bandwidth[*host], vec![50, 0], "host {host}");
    }
}

#[tokio::test]
async fn test_backup_retention_keeps_newest_manifests() {
    let env = TestEnv::new(three_node_agent());
    let svc = env.backup_service(fast_backup_config());
    let (cluster, task) = (Uuid::new_v4(), Uuid::new_v4());
    let ctx = CancellationToken::new();

    let mut tags = Vec::new();
    for generation in 1..=3u32 {
        env.agent.set_generation(generation);
        let target = svc.get_target(cluster, &props()).await.unwrap();
        let run = ids::new_run_id();
        svc.backup(&ctx, cluster, task, run, target).await.unwrap();
        tags.push(svc.get_run(cluster, task, run).await.unwrap().snapshot_tag);

        // Snapshot tags have second resolution; space the runs out.
        tokio::time::sleep(Duration::from_millis(1100)).await;
    }
    assert!(tags[0] < tags[1] && tags[1] < tags[2]);

    let paths = env.agent.remote_paths();
    let manifests: Vec<&String> = paths
        .iter()
        .filter(|p| p.ends_with(".manifest.gz"))
        .collect();

    // min(retention, backups) manifests survive per host, the newest tags.
    assert_eq!(manifests.len(), 2 * HOSTS.len());
    assert!(manifests.iter().all(|p| !p.contains(&tags[0])));
    for tag in &tags[1..] {
        assert_eq!(manifests.iter().filter(|p| p.contains(tag)).count(), HOSTS.len());
    }

    // Data referenced only by the purged oldest manifest is gone; data of the
    // surviving manifests is intact.
    assert!(!paths.iter().any(|p| p.contains("-1-big-")));
    assert!(paths.iter().any(|p| p.contains("-2-big-")));
    assert!(paths.iter().any(|p| p.contains("-3-big-")));
}

#[tokio::test]
async fn test_backup_attach_issues_no_new_copy_for_adopted_job() {
    let env = TestEnv::new(three_node_agent());
    let svc = env.backup_service(fast_backup_config());
    let (cluster, task) = (Uuid::new_v4(), Uuid::new_v4());

    let target = svc.get_target(cluster, &props()).await.unwrap();

    // Fabricate an interrupted previous run: snapshots taken, one table's
    // upload job finished on the agent, progress row pointing at the job.
    let prev_run_id = ids::new_run_id();
    let tag = new_snapshot_tag();
    let attach_host = HOSTS[0];
    let orders_dir = format!("orders-{:032x}", 1);

    {
        let mut state = env.agent.state.lock();
        for host in HOSTS {
            state
                .snapshots
                .entry(host.to_string())
                .or_default()
                .insert(tag.clone());
        }
        state.jobs.insert(
            7777,
            FakeJob {
                transfers: vec![
                    transfer("orders-1-big-Data.db", 100),
                    transfer("orders-1-big-Index.db", 10),
                ],
                finished: true,
                success: true,
                error: String::new(),
            },
        );
    }

    let prev_run = Run {
        cluster_id: cluster,
        task_id: task,
        id: prev_run_id,
        prev_id: None,
        snapshot_tag: tag.clone(),
        target: target.clone(),
        stage: Stage::Upload,
        status: RunStatus::Stopped,
        cause: String::new(),
        started_at: Utc::now(),
        done_at: None,
    };
    env.store
        .put(
            model::RUN_TABLE,
            &prev_run.key(),
            serde_json::to_value(&prev_run).unwrap(),
        )
        .await
        .unwrap();

    let prev_progress = model::RunProgress {
        cluster_id: cluster,
        task_id: task,
        run_id: prev_run_id,
        agent_job_id: 7777,
        host: attach_host.to_string(),
        unit: 0,
        table_name: "orders".to_string(),
        files: vec![
            "orders-1-big-Data.db".to_string(),
            "orders-1-big-Index.db".to_string(),
        ],
        size: 110,
        ..Default::default()
    };
    env.store
        .put(
            model::PROGRESS_TABLE,
            &progress_key(cluster, task, prev_run_id, attach_host, 0, "orders"),
            serde_json::to_value(&prev_progress).unwrap(),
        )
        .await
        .unwrap();

    // Resume: the adopted job must not be re-issued.
    let run = ids::new_run_id();
    let ctx = CancellationToken::new();
    svc.backup(&ctx, cluster, task, run, target).await.unwrap();

    let r = svc.get_run(cluster, task, run).await.unwrap();
    assert_eq!(r.status, RunStatus::Done);
    assert_eq!(r.prev_id, Some(prev_run_id));
    assert_eq!(r.snapshot_tag, tag);

    let copies = env.agent.copy_dir_calls();
    assert!(
        copies
            .iter()
            .all(|c| !(c.host == attach_host && c.src.contains(&format!("/{orders_dir}/")))),
        "adopted job was re-issued: {copies:?}"
    );
    // Every other (host, table) pair still gets its copy.
    assert_eq!(copies.len(), HOSTS.len() * 3 - 1);

    // The adopted job's transfer report feeds the new run's accounting.
    let p = svc.get_progress(cluster, task, run).await.unwrap();
    let host_p = p.hosts.iter().find(|h| h.host == attach_host).unwrap();
    let orders = host_p
        .keyspaces
        .iter()
        .flat_map(|ks| ks.tables.iter())
        .find(|t| t.table == "orders")
        .unwrap();
    assert_eq!(orders.totals.uploaded, 110);
}

fn transfer(name: &str, size: i64) -> ringmaster::core::client::FileTransfer {
    ringmaster::core::client::FileTransfer {
        name: name.to_string(),
        size,
        bytes: size,
        checked: false,
        error: String::new(),
        started_at: Utc::now().to_rfc3339(),
        completed_at: Utc::now().to_rfc3339(),
    }
}

#[tokio::test]
async fn test_backup_manifest_failure_rolls_back_uploaded_manifests() {
    let env = TestEnv::new(three_node_agent());
    env.agent
        .state
        .lock()
        .fail_put_substrings
        .push(format!("node/{}", host_id("192.168.100.12")));

    let svc = env.backup_service(fast_backup_config());
    let (cluster, task, run) = (Uuid::new_v4(), Uuid::new_v4(), ids::new_run_id());

    let target = svc.get_target(cluster, &props()).await.unwrap();
    let ctx = CancellationToken::new();
    let res = svc.backup(&ctx, cluster, task, run, target).await;
    assert!(res.is_err());

    let r = svc.get_run(cluster, task, run).await.unwrap();
    assert_eq!(r.status, RunStatus::Error);

    // No half-written manifest set survives.
    assert!(
        !env.agent
            .remote_paths()
            .iter()
            .any(|p| p.ends_with(".manifest.gz")),
        "manifests left behind: {:?}",
        env.agent.remote_paths()
    );
}

#[tokio::test]
async fn test_backup_refuses_host_low_on_disk() {
    let env = TestEnv::new(three_node_agent());
    env.agent
        .state
        .lock()
        .disk_free_percent
        .insert("192.168.100.13".to_string(), 5);

    let svc = env.backup_service(fast_backup_config());
    let (cluster, task, run) = (Uuid::new_v4(), Uuid::new_v4(), ids::new_run_id());

    let target = svc.get_target(cluster, &props()).await.unwrap();
    let ctx = CancellationToken::new();
    let res = svc.backup(&ctx, cluster, task, run, target).await;
    assert!(res.is_err());

    let r = svc.get_run(cluster, task, run).await.unwrap();
    assert_eq!(r.status, RunStatus::Error);
    assert!(
        r.cause.contains("not enough disk space"),
        "cause: {}",
        r.cause
    );
}

#[tokio::test]
async fn test_backup_target_validation() {
    let agent = FakeAgent::new(
        &[("dc1", &["192.168.100.11"]), ("dc2", &["192.168.100.21"])],
        &[("store", &["orders"])],
        1,
    );
    let env = TestEnv::new(agent);
    let svc = env.backup_service(fast_backup_config());
    let cluster = Uuid::new_v4();

    // Location is mandatory.
    let res = svc.get_target(cluster, &json!({})).await;
    assert!(matches!(res, Err(ManagerError::Validation(_))));

    // Unknown datacenter in a location.
    let res = svc
        .get_target(cluster, &json!({"location": ["dc9:s3:bucket"]}))
        .await;
    assert!(matches!(res, Err(ManagerError::Validation(_))));

    // Unknown datacenter in a rate limit.
    let res = svc
        .get_target(
            cluster,
            &json!({"location": ["s3:bucket"], "rate_limit": ["dc9:100"]}),
        )
        .await;
    assert!(matches!(res, Err(ManagerError::Validation(_))));

    // Every selected datacenter needs a location.
    let res = svc
        .get_target(cluster, &json!({"location": ["dc1:s3:bucket"]}))
        .await;
    match res {
        Err(ManagerError::Validation(msg)) => {
            assert!(msg.contains("missing location"), "{msg}")
        }
        other => panic!("expected Validation, got {other:?}"),
    }

    // Retention of zero makes no sense.
    let res = svc
        .get_target(cluster, &json!({"location": ["s3:bucket"], "retention": 0}))
        .await;
    assert!(matches!(res, Err(ManagerError::Validation(_))));

    // A dc-scoped location for every dc works without a default.
    let target = svc
        .get_target(
            cluster,
            &json!({"location": ["dc1:s3:bucket-a", "dc2:s3:bucket-b"]}),
        )
        .await
        .unwrap();
    assert_eq!(target.location.len(), 2);
}
