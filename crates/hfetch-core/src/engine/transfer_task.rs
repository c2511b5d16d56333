//! Transfer task - drives one fetch from submission to its terminal event
//!
//! Validates the request, consults the persistent store, streams the body
//! from the network (resuming where a stored partial copy left off) and
//! queues progress/success/error events on the handle.

use crate::engine::{FetchStore, RateLimiter};
use crate::error::FetchError;
use crate::event::TransferEvent;
use crate::handle::Fetch;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use hfetch_types::{FetchAttributes, FetchFlags, StorageMode};
use reqwest::{header, Client, Method, Response, StatusCode};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Chunk size used when replaying a stored file to a streaming transfer
const STORE_CHUNK_SIZE: usize = 64 * 1024;

/// How often the stored byte count of a persisting transfer is saved
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);

/// Engine-wide knobs a transfer needs
#[derive(Debug, Clone)]
pub(crate) struct TransferSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub progress_interval: Duration,
}

/// Everything a transfer needs, copied out of the request descriptor
pub(crate) struct TransferRequest {
    pub url: String,
    pub method: String,
    pub flags: FetchFlags,
    pub destination_path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub credentials: Option<(String, String)>,
}

/// What a successful transfer hands to the success callback
struct Completion {
    body: Option<Bytes>,
    num_bytes: u64,
    total_bytes: Option<u64>,
    status: u16,
    status_text: String,
}

/// Blob a persisting transfer appends to
struct StoreSink {
    store: FetchStore,
    path: String,
    file: File,
}

impl StoreSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    async fn checkpoint(&mut self, stored: u64, total: Option<u64>) -> Result<(), FetchError> {
        self.file.flush().await?;
        self.store.update_progress(&self.path, stored, total).await
    }

    /// Drop what was stored and start the blob over
    async fn reset(&mut self) -> Result<(), FetchError> {
        self.file.set_len(0).await?;
        self.file.seek(std::io::SeekFrom::Start(0)).await?;
        self.store.update_progress(&self.path, 0, None).await
    }

    async fn finish(mut self, size: u64) -> Result<(), FetchError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        self.store.mark_complete(&self.path, size).await
    }
}

pub(crate) struct TransferTask {
    fetch: Fetch,
    request: TransferRequest,
    client: Client,
    store: Option<FetchStore>,
    rate_limiter: RateLimiter,
    settings: TransferSettings,
    cancel: CancellationToken,
    /// Body bytes known so far, including a resumed prefix
    received: u64,
    total: Option<u64>,
    status: u16,
}

impl TransferTask {
    pub(crate) fn new(
        fetch: Fetch,
        request: TransferRequest,
        client: Client,
        store: Option<FetchStore>,
        rate_limiter: RateLimiter,
        settings: TransferSettings,
    ) -> Self {
        let cancel = fetch.cancellation();
        Self {
            fetch,
            request,
            client,
            store,
            rate_limiter,
            settings,
            cancel,
            received: 0,
            total: None,
            status: 0,
        }
    }

    /// Run to completion and queue the terminal event
    pub(crate) async fn run(mut self) {
        let id = self.fetch.id();
        info!(
            "Fetch {}: {} {} ({})",
            id, self.request.method, self.request.url, self.request.flags
        );

        match self.execute().await {
            Ok(done) => {
                info!("Fetch {} succeeded ({} bytes)", id, done.num_bytes);
                self.fetch.push_event(TransferEvent::Success {
                    data: done.body,
                    num_bytes: done.num_bytes,
                    total_bytes: done.total_bytes,
                    status: done.status,
                    status_text: done.status_text,
                });
            }
            Err(FetchError::Aborted) => {
                debug!("Fetch {} aborted", id);
                self.fetch
                    .push_event(TransferEvent::failure(FetchError::Aborted, self.received, self.total));
            }
            Err(e) => {
                error!("Fetch {} failed: {}", id, e);
                let mut event = TransferEvent::failure(e, self.received, self.total);
                if let TransferEvent::Error { status, .. } = &mut event {
                    if *status == 0 {
                        *status = self.status;
                    }
                }
                self.fetch.push_event(event);
            }
        }
    }

    async fn execute(&mut self) -> Result<Completion, FetchError> {
        // Closed before a worker picked it up: touch neither store nor network
        if self.cancel.is_cancelled() {
            return Err(FetchError::Aborted);
        }

        let attributes = FetchAttributes::try_from(self.request.flags)
            .map_err(|conflict| FetchError::ConflictingAttributes(conflict.0))?;

        let url = Url::parse(&self.request.url)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", self.request.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(format!(
                "{}: unsupported scheme",
                self.request.url
            )));
        }

        let method = Method::from_bytes(self.request.method.as_bytes())
            .map_err(|_| FetchError::InvalidMethod(self.request.method.clone()))?;

        let mode = attributes.storage_mode;
        let target = self.store_target(&attributes)?;
        let mut resume = false;

        if let Some((store, path)) = &target {
            if mode == StorageMode::Replace {
                if store.remove(path).await? {
                    info!("Replacing stored copy of {}", path);
                }
            } else {
                if let Some(entry) = store.lookup(path).await? {
                    if entry.complete {
                        return self.serve_from_store(store, path, &attributes).await;
                    }
                    resume = mode == StorageMode::Append
                        && attributes.persist_file
                        && entry.is_partial()
                        && entry.url == self.request.url;
                }
                if mode == StorageMode::NoDownload {
                    return Err(FetchError::NotPersisted(path.clone()));
                }
            }
        }

        let sink = match target {
            Some((store, path)) if attributes.persist_file => {
                let (entry, file) = store.begin(&path, &self.request.url, resume).await?;
                if entry.stored_bytes > 0 {
                    info!("Resuming {} from byte {}", path, entry.stored_bytes);
                }
                self.received = entry.stored_bytes;
                self.total = entry.total_bytes;
                Some(StoreSink { store, path, file })
            }
            _ => None,
        };

        self.download(url, method, &attributes, sink).await
    }

    /// Store and key a transfer uses, if any
    fn store_target(
        &self,
        attributes: &FetchAttributes,
    ) -> Result<Option<(FetchStore, String)>, FetchError> {
        let needs_store =
            attributes.persist_file || attributes.storage_mode == StorageMode::NoDownload;

        if self.request.destination_path.is_empty() {
            if attributes.storage_mode == StorageMode::NoDownload {
                return Err(FetchError::NotPersisted(self.request.url.clone()));
            }
            if attributes.persist_file {
                debug!("No destination path, fetch {} will not be stored", self.fetch.id());
            }
            return Ok(None);
        }

        match &self.store {
            Some(store) => Ok(Some((store.clone(), self.request.destination_path.clone()))),
            None if needs_store => Err(FetchError::StoreUnavailable),
            None => Ok(None),
        }
    }

    async fn serve_from_store(
        &mut self,
        store: &FetchStore,
        path: &str,
        attributes: &FetchAttributes,
    ) -> Result<Completion, FetchError> {
        let bytes = store.read_blob(path).await?;
        let size = bytes.len() as u64;
        info!("Serving {} from persistent store ({} bytes)", path, size);

        self.status = StatusCode::OK.as_u16();
        self.total = Some(size);

        if attributes.stream_data {
            let mut offset = 0usize;
            while offset < bytes.len() {
                if self.cancel.is_cancelled() {
                    return Err(FetchError::Aborted);
                }
                let end = (offset + STORE_CHUNK_SIZE).min(bytes.len());
                self.received = end as u64;
                self.fetch.push_event(TransferEvent::Progress {
                    data: Some(bytes.slice(offset..end)),
                    num_bytes: (end - offset) as u64,
                    data_offset: offset as u64,
                    total_bytes: self.total,
                    status: self.status,
                });
                offset = end;
            }
        } else {
            self.received = size;
            self.fetch.push_event(TransferEvent::Progress {
                data: None,
                num_bytes: size,
                data_offset: 0,
                total_bytes: self.total,
                status: self.status,
            });
        }

        Ok(Completion {
            body: attributes.load_to_memory.then_some(bytes),
            num_bytes: size,
            total_bytes: Some(size),
            status: self.status,
            status_text: "OK".to_string(),
        })
    }

    async fn download(
        &mut self,
        url: Url,
        method: Method,
        attributes: &FetchAttributes,
        mut sink: Option<StoreSink>,
    ) -> Result<Completion, FetchError> {
        let response = match self.send_with_retries(&url, &method, self.received).await {
            Err(FetchError::HttpStatus { status: 416, .. }) if self.received > 0 => {
                warn!("Stored range of {} rejected, starting over", url);
                self.restart(&mut sink).await?;
                self.send_with_retries(&url, &method, 0).await?
            }
            other => other?,
        };

        if self.received > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            warn!("Server ignored range request for {}, starting over", url);
            self.restart(&mut sink).await?;
        }

        self.status = response.status().as_u16();
        let status_text = response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string();
        if let Some(total) = total_from_headers(&response, self.received) {
            self.total = Some(total);
        }

        // Resumed transfers still hand out the whole body
        let mut body = None;
        if attributes.load_to_memory {
            let mut buffer = BytesMut::with_capacity(self.total.unwrap_or(0).min(64 << 20) as usize);
            if let Some(sink) = &sink {
                if self.received > 0 {
                    buffer.extend_from_slice(&sink.store.read_blob(&sink.path).await?);
                }
            }
            body = Some(buffer);
        }

        let result = self
            .stream_body(response, attributes, &mut sink, &mut body)
            .await;

        if let Err(e) = result {
            if let Some(sink) = sink.as_mut() {
                if let Err(save_err) = sink.checkpoint(self.received, self.total).await {
                    warn!("Failed to save partial progress of {}: {}", sink.path, save_err);
                }
            }
            return Err(e);
        }

        if let Some(sink) = sink {
            sink.finish(self.received).await?;
        }

        Ok(Completion {
            body: body.map(BytesMut::freeze),
            num_bytes: self.received,
            total_bytes: Some(self.received),
            status: self.status,
            status_text,
        })
    }

    async fn restart(&mut self, sink: &mut Option<StoreSink>) -> Result<(), FetchError> {
        if let Some(sink) = sink.as_mut() {
            sink.reset().await?;
        }
        self.received = 0;
        self.total = None;
        Ok(())
    }

    async fn stream_body(
        &mut self,
        response: Response,
        attributes: &FetchAttributes,
        sink: &mut Option<StoreSink>,
        body: &mut Option<BytesMut>,
    ) -> Result<(), FetchError> {
        let mut last_progress = Instant::now();
        let mut last_checkpoint = Instant::now();
        let mut reported = self.received;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Aborted),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(network_error)?;

            let len = chunk.len() as u64;
            self.rate_limiter.acquire(len).await;

            if let Some(sink) = sink.as_mut() {
                sink.write(&chunk).await?;
            }
            if let Some(body) = body.as_mut() {
                body.extend_from_slice(&chunk);
            }

            let offset = self.received;
            self.received += len;

            if attributes.stream_data {
                self.fetch.push_event(TransferEvent::Progress {
                    data: Some(chunk),
                    num_bytes: len,
                    data_offset: offset,
                    total_bytes: self.total,
                    status: self.status,
                });
                reported = self.received;
            } else if last_progress.elapsed() >= self.settings.progress_interval {
                self.report_progress();
                reported = self.received;
                last_progress = Instant::now();
            }

            if let Some(sink) = sink.as_mut() {
                if last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL {
                    sink.checkpoint(self.received, self.total).await?;
                    last_checkpoint = Instant::now();
                }
            }
        }

        // Informational transfers always see their final byte count
        if !attributes.stream_data && reported != self.received {
            self.report_progress();
        }

        Ok(())
    }

    fn report_progress(&self) {
        self.fetch.push_event(TransferEvent::Progress {
            data: None,
            num_bytes: self.received,
            data_offset: 0,
            total_bytes: self.total,
            status: self.status,
        });
    }

    async fn send_with_retries(
        &self,
        url: &Url,
        method: &Method,
        offset: u64,
    ) -> Result<Response, FetchError> {
        let mut attempt = 0;

        loop {
            let request = self.build_request(url, method, offset);
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Aborted),
                result = request.send() => result,
            };

            let error = match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    FetchError::HttpStatus {
                        status: status.as_u16(),
                        message: status.canonical_reason().unwrap_or("Unknown").to_string(),
                    }
                }
                Err(e) => network_error(e),
            };

            if attempt >= self.settings.max_retries || !error.is_retryable() {
                return Err(error);
            }
            attempt += 1;
            warn!(
                "Fetch {} attempt {} failed: {}, retrying in {:?}",
                self.fetch.id(),
                attempt,
                error,
                self.settings.retry_delay
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Aborted),
                _ = tokio::time::sleep(self.settings.retry_delay) => {}
            }
        }
    }

    fn build_request(&self, url: &Url, method: &Method, offset: u64) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method.clone(), url.clone());

        for (name, value) in &self.request.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &self.request.body {
            request = request.body(body.clone());
        }
        if let Some((user, password)) = &self.request.credentials {
            request = request.basic_auth(user, Some(password));
        }
        if let Some(timeout) = self.request.timeout {
            request = request.timeout(timeout);
        }
        if offset > 0 {
            debug!("Fetch {} requesting range bytes={}-", self.fetch.id(), offset);
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }

        request
    }
}

fn network_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e)
    }
}

/// Total body size from `Content-Range` ("bytes 0-99/1234") or
/// `Content-Length` plus the resume offset
fn total_from_headers(response: &Response, offset: u64) -> Option<u64> {
    if response.status() == StatusCode::PARTIAL_CONTENT {
        let total = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .filter(|total| *total != "*")
            .and_then(|total| total.parse::<u64>().ok());
        if total.is_some() {
            return total;
        }
    }

    response.content_length().map(|len| {
        if response.status() == StatusCode::PARTIAL_CONTENT {
            len + offset
        } else {
            len
        }
    })
}
