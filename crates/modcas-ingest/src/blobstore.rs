//! Content-addressable blob store clients
//!
//! "Store these bytes, give me their content id." Pinned content is kept
//! forever by the store; unpinned content may be garbage collected because it
//! can be rebuilt from pinned parts.

use async_trait::async_trait;
use bytes::Bytes;
use modcas_common::checksum::content_id;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::error::BlobStoreError;

pub type Result<T> = std::result::Result<T, BlobStoreError>;

/// Default blob store API endpoint.
pub const DEFAULT_API_URL: &str = "http://ipfs.datastore.svc.cluster.local:5001";

/// Adds bytes to a content-addressable store
#[async_trait]
pub trait ContentAddresser: Send + Sync {
    /// Store `data` and return its content id, pinning it if requested.
    async fn add(&self, data: Bytes, pin: bool) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: Option<String>,
}

/// Client for an IPFS-compatible HTTP API
#[derive(Clone)]
pub struct IpfsClient {
    client: reqwest::Client,
    api_url: String,
}

impl IpfsClient {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.api_url, command)
    }

    /// Check that the API answers; used to fail fast at startup.
    pub async fn ping(&self) -> Result<()> {
        let response = self.client.post(self.endpoint("version")).send().await?;
        check_status(response).await.map(|_| ())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BlobStoreError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ContentAddresser for IpfsClient {
    async fn add(&self, data: Bytes, pin: bool) -> Result<String> {
        let len = data.len();
        let form = Form::new().part("file", Part::stream_with_length(data, len as u64).file_name("blob"));

        let response = self
            .client
            .post(self.endpoint("add"))
            .query(&[
                ("pin", if pin { "true" } else { "false" }),
                ("cid-version", "1"),
                ("quiet", "true"),
            ])
            .multipart(form)
            .send()
            .await?;

        let added: AddResponse = check_status(response).await?.json().await?;
        let cid = added.hash.ok_or(BlobStoreError::MissingHash)?;
        debug!(cid = %cid, bytes = len, pin, "added blob");
        Ok(cid)
    }
}

/// In-process store keyed by SHA-256 content id
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    adds: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredBlob {
    len: usize,
    pinned: bool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, cid: &str) -> bool {
        self.lock().contains_key(cid)
    }

    /// Whether `cid` was ever added with `pin = true`.
    pub fn is_pinned(&self, cid: &str) -> bool {
        self.lock().get(cid).map(|b| b.pinned).unwrap_or(false)
    }

    /// Distinct blobs held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total `add` calls, duplicates included.
    pub fn add_calls(&self) -> u64 {
        self.adds.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredBlob>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ContentAddresser for MemoryBlobStore {
    async fn add(&self, data: Bytes, pin: bool) -> Result<String> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        let cid = content_id(&data);

        let mut blobs = self.lock();
        let entry = blobs.entry(cid.clone()).or_insert(StoredBlob {
            len: data.len(),
            pinned: false,
        });
        entry.pinned |= pin;

        Ok(cid)
    }
}
