// tests/integration/cluster_test.rs

//! Cluster registry tests: CRUD, validation, secret rollback, change
//! notification, and the cached client provider.

use super::test_helpers::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use ringmaster::core::client::provider::closest_dc;
use ringmaster::core::client::{CachedProvider, ClientProvider};
use ringmaster::core::cluster::model::SECRET_AUTH_TOKEN;
use ringmaster::core::cluster::{Change, ChangeListener, ChangeType, Cluster, Service};
use ringmaster::core::store::{MemorySecretStore, MemoryStore, SecretStore};
use ringmaster::core::ManagerError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Wiring {
    service: Arc<Service>,
    secrets: Arc<MemorySecretStore>,
    provider: Arc<CachedProvider>,
}

fn wire(agent: Arc<FakeAgent>) -> Wiring {
    let store = MemoryStore::new();
    let secrets = MemorySecretStore::new();
    let factory = Arc::new(FakeFactory { agent });
    let provider = Arc::new(CachedProvider::new(
        store.clone(),
        secrets.clone(),
        factory.clone(),
    ));
    let service = Arc::new(Service::new(store, secrets.clone(), provider.clone(), factory));
    Wiring {
        service,
        secrets,
        provider,
    }
}

fn two_dc_agent() -> Arc<FakeAgent> {
    FakeAgent::new(
        &[
            ("dc1", &["192.168.100.11", "192.168.100.12"]),
            ("dc2", &["192.168.100.21", "192.168.100.22"]),
        ],
        &[("store", &["orders"])],
        2,
    )
}

fn new_cluster() -> Cluster {
    Cluster {
        name: "prod".to_string(),
        host: "192.168.100.11".to_string(),
        auth_token: Some("token".to_string()),
        ..Default::default()
    }
}

struct Recorder {
    events: Mutex<Vec<(Uuid, ChangeType)>>,
}

#[async_trait]
impl ChangeListener for Recorder {
    async fn on_change(&self, change: &Change) -> Result<(), ManagerError> {
        self.events.lock().push((change.id, change.change_type));
        Ok(())
    }
}

#[tokio::test]
async fn test_put_get_list_delete_cluster() {
    let w = wire(two_dc_agent());

    let mut c = new_cluster();
    w.service.put_cluster(&mut c).await.unwrap();
    assert!(!c.id.is_nil());

    let loaded = w.service.get_cluster(c.id).await.unwrap();
    assert_eq!(loaded.name, "prod");
    assert_eq!(loaded.host, "192.168.100.11");

    let by_name = w.service.get_cluster_by_name("prod").await.unwrap();
    assert_eq!(by_name.id, c.id);

    let token = w.secrets.get(c.id, SECRET_AUTH_TOKEN).await.unwrap();
    assert_eq!(token.as_deref(), Some(b"token".as_slice()));

    assert_eq!(w.service.list_clusters(None).await.unwrap().len(), 1);

    w.service.delete_cluster(c.id).await.unwrap();
    assert!(matches!(
        w.service.get_cluster(c.id).await,
        Err(ManagerError::NotFound)
    ));
    assert!(w
        .secrets
        .get(c.id, SECRET_AUTH_TOKEN)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_put_rejects_conflicting_name() {
    let w = wire(two_dc_agent());

    let mut first = new_cluster();
    w.service.put_cluster(&mut first).await.unwrap();

    let mut second = new_cluster();
    second.host = "192.168.100.21".to_string();
    let err = w.service.put_cluster(&mut second).await.unwrap_err();
    assert!(err.to_string().contains("already taken"), "{err}");
}

#[tokio::test]
async fn test_put_rolls_back_secrets_on_connectivity_failure() {
    let agent = two_dc_agent();
    agent
        .state
        .lock()
        .fail_ping_hosts
        .insert("192.168.100.22".to_string());
    let w = wire(agent);

    let mut c = new_cluster();
    let err = w.service.put_cluster(&mut c).await.unwrap_err();
    assert!(
        err.to_string().contains("host connectivity check failed"),
        "{err}"
    );

    // The token written by this put is gone again.
    assert!(w
        .secrets
        .get(c.id, SECRET_AUTH_TOKEN)
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        w.service.get_cluster(c.id).await,
        Err(ManagerError::NotFound)
    ));
}

#[tokio::test]
async fn test_change_notification_broadcast() {
    let w = wire(two_dc_agent());
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
    });
    w.service.add_listener(recorder.clone());

    let mut c = new_cluster();
    w.service.put_cluster(&mut c).await.unwrap();
    c.name = "prod-renamed".to_string();
    w.service.put_cluster(&mut c).await.unwrap();
    w.service.delete_cluster(c.id).await.unwrap();

    let events = recorder.events.lock().clone();
    assert_eq!(
        events,
        vec![
            (c.id, ChangeType::Create),
            (c.id, ChangeType::Update),
            (c.id, ChangeType::Delete),
        ]
    );
}

#[tokio::test]
async fn test_provider_builds_and_refreshes_known_hosts() {
    let w = wire(two_dc_agent());

    let mut c = new_cluster();
    w.service.put_cluster(&mut c).await.unwrap();

    w.provider.client(c.id).await.unwrap();

    // Discovery refreshed the known-hosts cache with the full topology.
    let loaded = w.service.get_cluster(c.id).await.unwrap();
    assert_eq!(
        loaded.known_hosts,
        vec![
            "192.168.100.11".to_string(),
            "192.168.100.12".to_string(),
            "192.168.100.21".to_string(),
            "192.168.100.22".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_provider_unknown_cluster() {
    let w = wire(two_dc_agent());
    assert!(matches!(
        w.provider.client(Uuid::new_v4()).await,
        Err(ManagerError::NotFound)
    ));
}

#[tokio::test]
async fn test_closest_dc_prefers_lowest_median_rtt() {
    let agent = two_dc_agent();
    {
        let mut state = agent.state.lock();
        for h in ["192.168.100.11", "192.168.100.12"] {
            state
                .ping_latency
                .insert(h.to_string(), Duration::from_millis(50));
        }
        for h in ["192.168.100.21", "192.168.100.22"] {
            state
                .ping_latency
                .insert(h.to_string(), Duration::from_millis(1));
        }
    }

    let dcs = agent.dcs.clone();
    let closest = closest_dc(agent.as_ref(), &dcs).await.unwrap();
    assert_eq!(closest, "dc2");
}

#[tokio::test]
async fn test_closest_dc_skips_unreachable_dc() {
    let agent = two_dc_agent();
    {
        let mut state = agent.state.lock();
        for h in ["192.168.100.21", "192.168.100.22"] {
            state.fail_ping_hosts.insert(h.to_string());
        }
        for h in ["192.168.100.11", "192.168.100.12"] {
            state
                .ping_latency
                .insert(h.to_string(), Duration::from_millis(50));
        }
    }

    let dcs = agent.dcs.clone();
    let closest = closest_dc(agent.as_ref(), &dcs).await.unwrap();
    assert_eq!(closest, "dc1");
}
