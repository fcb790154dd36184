// src/core/client/http.rs

//! `NodeApi` implementation over the node agents' HTTP API.

use super::config::ClientConfig;
use super::model::*;
use super::pool::HostPool;
use super::provider::TlsIdentity;
use super::NodeApi;
use crate::core::errors::ManagerError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub struct HttpClient {
    config: ClientConfig,
    http: reqwest::Client,
    pool: HostPool,
}

impl HttpClient {
    pub fn new(
        hosts: Vec<String>,
        auth_token: Option<&str>,
        identity: Option<&TlsIdentity>,
        config: ClientConfig,
    ) -> Result<Self, ManagerError> {
        if hosts.is_empty() {
            return Err(ManagerError::Validation("missing hosts".into()));
        }

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = auth_token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ManagerError::Validation(format!("invalid auth token: {e}")))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.request_timeout);
        if let Some(id) = identity {
            let mut pem = id.cert_pem.clone();
            pem.extend_from_slice(&id.key_pem);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }

        let pool = HostPool::new(hosts, config.pool_decay_duration);
        Ok(Self {
            http: builder.build()?,
            config,
            pool,
        })
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!(
            "{}://{}:{}{}",
            self.config.scheme.as_str(),
            host,
            self.config.port,
            path
        )
    }

    fn request(&self, method: Method, host: &str, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(host, path))
            .timeout(self.config.request_timeout)
    }

    /// Sends a host-scoped request, retrying transient failures until the
    /// end-to-end timeout elapses.
    async fn send(&self, host: &str, rb: RequestBuilder) -> Result<reqwest::Response, ManagerError> {
        let deadline = Instant::now() + self.config.timeout;
        let mut backoff = Duration::from_millis(500);
        loop {
            let start = Instant::now();
            let res = async {
                let resp = rb
                    .try_clone()
                    .ok_or_else(|| ManagerError::Internal("unclonable request".into()))?
                    .send()
                    .await?;
                check_status(resp).await
            }
            .await;

            match res {
                Ok(resp) => {
                    self.pool.record(host, start.elapsed(), true);
                    return Ok(resp);
                }
                Err(e) if e.is_transient() && Instant::now() + backoff < deadline => {
                    self.pool.record(host, start.elapsed(), false);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
                Err(e) => {
                    self.pool.record(host, start.elapsed(), false);
                    return Err(e);
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, host: &str, path: &str) -> Result<T, ManagerError> {
        let resp = self.send(host, self.request(Method::GET, host, path)).await?;
        Ok(resp.json().await?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        host: &str,
        path: &str,
        body: &B,
    ) -> Result<T, ManagerError> {
        let rb = self.request(Method::POST, host, path).json(body);
        let resp = self.send(host, rb).await?;
        Ok(resp.json().await?)
    }

    async fn post_empty<B: Serialize>(
        &self,
        host: &str,
        path: &str,
        body: &B,
    ) -> Result<(), ManagerError> {
        let rb = self.request(Method::POST, host, path).json(body);
        self.send(host, rb).await?;
        Ok(())
    }
}

/// Maps an agent response status to the error taxonomy. A 409 carries a
/// conflicting node-side operation, e.g. "active repair on hosts".
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ManagerError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(ManagerError::NotFound),
        StatusCode::CONFLICT => Err(ManagerError::RemoteBusy(body)),
        s if s.is_server_error() => Err(ManagerError::Transient(format!("agent {s}: {body}"))),
        s => Err(ManagerError::HttpClient(format!("agent {s}: {body}"))),
    }
}

#[derive(Serialize)]
struct SnapshotRequest<'a> {
    tag: &'a str,
    keyspace: &'a str,
    tables: &'a [String],
}

#[derive(Serialize)]
struct RepairRequest<'a> {
    keyspace: &'a str,
    ranges: Vec<String>,
    dcs: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    hosts: Option<&'a [String]>,
}

#[derive(Deserialize)]
struct CommandResponse {
    id: i64,
}

#[derive(Deserialize)]
struct RepairStatusResponse {
    status: CommandStatus,
}

#[derive(Serialize)]
struct ListDirRequest<'a> {
    path: &'a str,
    #[serde(flatten)]
    opts: ListDirOpts,
}

#[derive(Serialize)]
struct CopyDirRequest<'a> {
    dst: &'a str,
    src: &'a str,
}

#[derive(Deserialize)]
struct JobResponse {
    job_id: i64,
}

#[derive(Serialize)]
struct BandwidthRequest {
    rate: u32,
}

#[async_trait]
impl NodeApi for HttpClient {
    async fn datacenters(&self) -> Result<Datacenters, ManagerError> {
        let host = self.pool.pick();
        self.get_json(&host, "/v1/cluster/datacenters").await
    }

    async fn keyspaces(&self) -> Result<Vec<String>, ManagerError> {
        let host = self.pool.pick();
        self.get_json(&host, "/v1/cluster/keyspaces").await
    }

    async fn tables(&self, keyspace: &str) -> Result<Vec<String>, ManagerError> {
        let host = self.pool.pick();
        self.get_json(&host, &format!("/v1/cluster/keyspaces/{keyspace}/tables"))
            .await
    }

    async fn describe_ring(&self, keyspace: &str) -> Result<Ring, ManagerError> {
        let host = self.pool.pick();
        self.get_json(&host, &format!("/v1/cluster/keyspaces/{keyspace}/ring"))
            .await
    }

    async fn ping(&self, host: &str, timeout: Duration) -> Result<Duration, ManagerError> {
        let start = Instant::now();
        let rb = self
            .http
            .request(Method::GET, self.url(host, "/v1/ping"))
            .timeout(timeout);
        let resp = rb.send().await?;
        check_status(resp).await?;
        Ok(start.elapsed())
    }

    async fn node_info(&self, host: &str) -> Result<NodeInfo, ManagerError> {
        self.get_json(host, "/v1/node/info").await
    }

    async fn take_snapshot(
        &self,
        host: &str,
        tag: &str,
        keyspace: &str,
        tables: &[String],
    ) -> Result<(), ManagerError> {
        self.post_empty(
            host,
            "/v1/node/snapshots",
            &SnapshotRequest {
                tag,
                keyspace,
                tables,
            },
        )
        .await
    }

    async fn snapshots(&self, host: &str) -> Result<Vec<String>, ManagerError> {
        self.get_json(host, "/v1/node/snapshots").await
    }

    async fn delete_snapshot(&self, host: &str, tag: &str) -> Result<(), ManagerError> {
        let rb = self.request(Method::DELETE, host, &format!("/v1/node/snapshots/{tag}"));
        self.send(host, rb).await?;
        Ok(())
    }

    async fn repair(
        &self,
        host: &str,
        keyspace: &str,
        ranges: &[(i64, i64)],
        dcs: &[String],
        hosts: Option<&[String]>,
    ) -> Result<i64, ManagerError> {
        let body = RepairRequest {
            keyspace,
            ranges: ranges
                .iter()
                .map(|(s, e)| format!("{s}:{e}"))
                .collect(),
            dcs,
            hosts,
        };
        let resp: CommandResponse = self.post_json(host, "/v1/node/repair", &body).await?;
        Ok(resp.id)
    }

    async fn repair_status(
        &self,
        host: &str,
        command_id: i64,
    ) -> Result<CommandStatus, ManagerError> {
        let resp: RepairStatusResponse = self
            .get_json(host, &format!("/v1/node/repair/{command_id}"))
            .await?;
        Ok(resp.status)
    }

    async fn kill_all_repairs(&self, host: &str) -> Result<(), ManagerError> {
        self.post_empty(host, "/v1/node/repair_kill", &()).await
    }

    async fn list_dir(
        &self,
        host: &str,
        path: &str,
        opts: ListDirOpts,
    ) -> Result<Vec<ListDirItem>, ManagerError> {
        self.post_json(host, "/v1/fs/list", &ListDirRequest { path, opts })
            .await
    }

    async fn cat(&self, host: &str, remote_path: &str) -> Result<Vec<u8>, ManagerError> {
        let rb = self
            .request(Method::GET, host, "/v1/fs/cat")
            .query(&[("path", remote_path)]);
        let resp = self.send(host, rb).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn put(&self, host: &str, remote_path: &str, body: Bytes) -> Result<(), ManagerError> {
        let rb = self
            .request(Method::PUT, host, "/v1/fs/put")
            .query(&[("path", remote_path)])
            .body(body);
        self.send(host, rb).await?;
        Ok(())
    }

    async fn copy_dir(&self, host: &str, dst: &str, src: &str) -> Result<i64, ManagerError> {
        let resp: JobResponse = self
            .post_json(host, "/v1/fs/copy_dir", &CopyDirRequest { dst, src })
            .await?;
        Ok(resp.job_id)
    }

    async fn job_status(
        &self,
        host: &str,
        job_id: i64,
        wait: Duration,
    ) -> Result<JobStatus, ManagerError> {
        let rb = self
            .request(Method::GET, host, &format!("/v1/fs/job/{job_id}"))
            .query(&[("wait", wait.as_secs())])
            // Long polling holds the request open past the usual deadline.
            .timeout(self.config.request_timeout + wait);
        let resp = self.send(host, rb).await?;
        Ok(resp.json().await?)
    }

    async fn job_stop(&self, host: &str, job_id: i64) -> Result<(), ManagerError> {
        self.post_empty(host, &format!("/v1/fs/job/{job_id}/stop"), &())
            .await
    }

    async fn transferred(
        &self,
        host: &str,
        group: &str,
    ) -> Result<Vec<FileTransfer>, ManagerError> {
        let rb = self
            .request(Method::GET, host, "/v1/fs/transferred")
            .query(&[("group", group)]);
        let resp = self.send(host, rb).await?;
        Ok(resp.json().await?)
    }

    async fn stats(&self, host: &str, group: &str) -> Result<TransferStats, ManagerError> {
        let rb = self
            .request(Method::GET, host, "/v1/fs/stats")
            .query(&[("group", group)]);
        let resp = self.send(host, rb).await?;
        Ok(resp.json().await?)
    }

    async fn stats_reset(&self, host: &str, group: &str) -> Result<(), ManagerError> {
        let rb = self
            .request(Method::POST, host, "/v1/fs/stats_reset")
            .query(&[("group", group)]);
        self.send(host, rb).await?;
        Ok(())
    }

    async fn delete_remote_file(
        &self,
        host: &str,
        remote_path: &str,
    ) -> Result<(), ManagerError> {
        let rb = self
            .request(Method::DELETE, host, "/v1/fs/file")
            .query(&[("path", remote_path)]);
        self.send(host, rb).await?;
        Ok(())
    }

    async fn disk_usage(&self, host: &str, path: &str) -> Result<DiskUsage, ManagerError> {
        let rb = self
            .request(Method::GET, host, "/v1/fs/disk_usage")
            .query(&[("path", path)]);
        let resp = self.send(host, rb).await?;
        Ok(resp.json().await?)
    }

    async fn set_bandwidth_limit(&self, host: &str, limit: u32) -> Result<(), ManagerError> {
        self.post_empty(host, "/v1/fs/bandwidth", &BandwidthRequest { rate: limit })
            .await
    }
}
