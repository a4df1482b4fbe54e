// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use reqwest::StatusCode;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::storage::{Address, Error, Getter, CHUNK_PREFIX};

// Caps on in-flight requests towards the gateway node. Higher get limits
// overload the node's request queue.
const GET_LIMIT: usize = 55;
const PUT_LIMIT: usize = 20;

/// Chunk getter backed by a gateway node's HTTP API.
///
/// `GET {endpoint}/chunk/{hex}` resolves a chunk by content address,
/// `GET {endpoint}/chunk/{hex}/{index}` resolves the `index`-th leaf of the
/// tree rooted at the address.
#[derive(Clone)]
pub struct HttpGetter {
    client: reqwest::Client,
    endpoint: String,
    permits: Arc<Semaphore>,
}

impl HttpGetter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            permits: Arc::new(Semaphore::new(GET_LIMIT)),
        }
    }

    async fn fetch(&self, uri: String, what: &str) -> Result<Bytes, Error> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        debug!("fetching {uri}");
        let response = self
            .client
            .get(&uri)
            .send()
            .await
            .map_err(|e| Error::Other(anyhow!("request to {uri} failed: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::ChunkNotFound(what.to_string()));
        }
        if !response.status().is_success() {
            return Err(Error::Other(anyhow!(
                "gateway returned {} for {uri}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Other(anyhow!("reading body of {uri} failed: {e}")))?;
        if body.len() < CHUNK_PREFIX {
            return Err(Error::ChunkNotFound(what.to_string()));
        }
        Ok(body)
    }
}

#[async_trait]
impl Getter for HttpGetter {
    async fn get_chunk(&self, addr: &Address) -> Result<Bytes, Error> {
        let hexaddr = hex::encode(addr);
        self.fetch(format!("{}/chunk/{hexaddr}", self.endpoint), &hexaddr)
            .await
    }

    async fn get_leaf(&self, root: &Address, leaf_index: u64) -> Result<Bytes, Error> {
        let hexaddr = hex::encode(root);
        self.fetch(
            format!("{}/chunk/{hexaddr}/{leaf_index}", self.endpoint),
            &hexaddr,
        )
        .await
    }
}

/// Uploader towards a gateway node.
#[derive(Clone)]
pub struct HttpPutter {
    client: reqwest::Client,
    endpoint: String,
    permits: Arc<Semaphore>,
}

impl HttpPutter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            permits: Arc::new(Semaphore::new(PUT_LIMIT)),
        }
    }

    /// Uploads a single raw chunk.
    pub async fn upload_chunk(&self, data: Bytes) -> Result<(), Error> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        let uri = format!("{}/chunk", self.endpoint);
        let response = self
            .client
            .post(&uri)
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Other(anyhow!("upload to {uri} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Other(anyhow!(
                "gateway returned {} for {uri}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Uploads a whole file; the gateway answers with the hex root address.
    pub async fn upload_file(&self, data: Bytes) -> Result<Address, Error> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        let uri = format!("{}/file", self.endpoint);
        let response = self
            .client
            .post(&uri)
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Other(anyhow!("upload to {uri} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Other(anyhow!(
                "gateway returned {} for {uri}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::Other(anyhow!("reading body of {uri} failed: {e}")))?;
        crate::storage::parse_address(body.trim())
    }
}
