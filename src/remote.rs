//! Remote gateway client.
//!
//! The gateway is a plain HTTP byte-range surface: JSON metadata under
//! `?t=json`, ranged content GETs, child PUT/DELETE and `?t=mkdir` POST
//! under `{base}/uri/...`. The [`RemoteIo`] trait is the seam the cache
//! core is written against; [`Gateway`] is the production implementation.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::*;

use crate::error::Error;
use crate::info::NodeInfo;

/// Streaming upload payload with a known length.
pub struct UploadBody {
    pub len: u64,
    pub stream: futures::stream::BoxStream<'static, std::io::Result<Bytes>>,
}

/// A resumable byte-range content reader. An empty chunk signals EOF.
#[async_trait::async_trait]
pub trait ContentStream: Send + Sync {
    async fn read_chunk(&mut self) -> Result<Bytes, Error>;
}

/// Operations the cache core needs from the remote store.
///
/// `iscap` selects whether `path` is a capability (used as-is) or a
/// rootcap-relative path.
#[async_trait::async_trait]
pub trait RemoteIo: Send + Sync {
    async fn get_info(&self, path: &str, iscap: bool) -> Result<NodeInfo, Error>;
    async fn get_content(
        &self,
        cap: &str,
        offset: u64,
    ) -> Result<Box<dyn ContentStream>, Error>;
    async fn put_file(&self, path: &str, body: UploadBody, iscap: bool) -> Result<String, Error>;
    async fn delete(&self, path: &str, iscap: bool) -> Result<(), Error>;
    async fn mkdir(&self, path: &str, iscap: bool) -> Result<String, Error>;
    /// Apply backpressure on writers while PUT capacity is saturated.
    async fn wait_until_write_allowed(&self);
}

/// Percent-encode a path, keeping `/` separators.
fn quote(path: &str) -> String {
    const SAFE: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_.-~/:";
    let mut out = String::with_capacity(path.len());
    for &b in path.as_bytes() {
        if SAFE.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

pub struct Gateway {
    client: reqwest::Client,
    /// `{node_url}/uri`
    base_url: String,
    rootcap: String,
    timeout: Duration,
    get_conns: Arc<Semaphore>,
    put_conns: Arc<Semaphore>,
}

impl Gateway {
    pub fn new(
        node_url: &str,
        rootcap: &str,
        timeout: Duration,
        max_connections: usize,
    ) -> Result<Self, Error> {
        let put = max_connections.saturating_div(2).max(1);
        let get = max_connections.saturating_sub(put).max(1);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        Ok(Self {
            client,
            base_url: format!("{}/uri", node_url.trim_end_matches('/')),
            rootcap: rootcap.trim().to_owned(),
            timeout,
            get_conns: Arc::new(Semaphore::new(get)),
            put_conns: Arc::new(Semaphore::new(put)),
        })
    }

    fn url(&self, path: &str, iscap: bool) -> String {
        let path = quote(path.trim_start_matches('/'));
        if iscap {
            format!("{}/{}", self.base_url, path)
        } else {
            format!("{}/{}/{}", self.base_url, self.rootcap, path)
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
        match resp.status() {
            s if s == reqwest::StatusCode::NOT_FOUND => Err(Error::NotFound),
            s if !s.is_success() => Err(Error::RemoteIo(format!("status {}", s))),
            _ => Ok(resp),
        }
    }
}

#[async_trait::async_trait]
impl RemoteIo for Gateway {
    async fn get_info(&self, path: &str, iscap: bool) -> Result<NodeInfo, Error> {
        let _permit = self.get_conns.acquire().await;
        let resp = self
            .client
            .get(self.url(path, iscap))
            .query(&[("t", "json")])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| Error::RemoteIo(e.to_string()))
    }

    async fn get_content(
        &self,
        cap: &str,
        offset: u64,
    ) -> Result<Box<dyn ContentStream>, Error> {
        let permit = self
            .get_conns
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        debug!(cap, offset, "Opening remote content stream");
        // The stream may live long: no overall request timeout, the
        // per-chunk timeout in read_chunk stands in for a recv timeout.
        let resp = self
            .client
            .get(self.url(cap, true))
            .header(reqwest::header::RANGE, format!("bytes={}-", offset))
            .send()
            .await
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        let resp = Self::check(resp).await?;
        Ok(Box::new(HttpContentStream {
            resp,
            timeout: self.timeout,
            _permit: permit,
        }))
    }

    async fn put_file(&self, path: &str, body: UploadBody, iscap: bool) -> Result<String, Error> {
        let _permit = self.put_conns.acquire().await;
        debug!(path, len = body.len, "Uploading file");
        // PUT requests run without a timeout: uploads may be long, and a
        // filled send buffer makes elapsed time a poor proxy for progress.
        let resp = self
            .client
            .put(self.url(path, iscap))
            .header(reqwest::header::CONTENT_LENGTH, body.len)
            .body(reqwest::Body::wrap_stream(body.stream))
            .send()
            .await
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        let text = Self::check(resp)
            .await?
            .text()
            .await
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        Ok(text.trim().to_owned())
    }

    async fn delete(&self, path: &str, iscap: bool) -> Result<(), Error> {
        let _permit = self.get_conns.acquire().await;
        let resp = self
            .client
            .delete(self.url(path, iscap))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn mkdir(&self, path: &str, iscap: bool) -> Result<String, Error> {
        let _permit = self.get_conns.acquire().await;
        let resp = self
            .client
            .post(self.url(path, iscap))
            .query(&[("t", "mkdir")])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        let text = Self::check(resp)
            .await?
            .text()
            .await
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        Ok(text.trim().to_owned())
    }

    async fn wait_until_write_allowed(&self) {
        // Acquire-then-release: block until PUT capacity frees up
        drop(self.put_conns.acquire().await);
    }
}

struct HttpContentStream {
    resp: reqwest::Response,
    timeout: Duration,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[async_trait::async_trait]
impl ContentStream for HttpContentStream {
    async fn read_chunk(&mut self) -> Result<Bytes, Error> {
        match tokio::time::timeout(self.timeout, self.resp.chunk()).await {
            Ok(Ok(Some(chunk))) => Ok(chunk),
            Ok(Ok(None)) => Ok(Bytes::new()),
            Ok(Err(e)) => Err(Error::RemoteIo(e.to_string())),
            Err(_) => Err(Error::RemoteIo("content read timed out".into())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(quote("URI:DIR2:abc/some file"), "URI:DIR2:abc/some%20file");
        assert_eq!(quote("a/b~c"), "a/b~c");
        assert_eq!(quote("snow\u{2603}"), "snow%E2%98%83");
    }
}
