//! Events produced by a transfer and queued on its handle

use crate::error::FetchError;
use bytes::Bytes;
use std::sync::Arc;

/// One step of a transfer, in the order the engine produced it
#[derive(Debug, Clone)]
pub(crate) enum TransferEvent {
    Progress {
        /// Chunk bytes, only for streaming transfers
        data: Option<Bytes>,
        num_bytes: u64,
        data_offset: u64,
        total_bytes: Option<u64>,
        status: u16,
    },
    Success {
        /// Full body, only when it was loaded to memory
        data: Option<Bytes>,
        num_bytes: u64,
        total_bytes: Option<u64>,
        status: u16,
        status_text: String,
    },
    Error {
        error: Arc<FetchError>,
        num_bytes: u64,
        total_bytes: Option<u64>,
        status: u16,
        status_text: String,
    },
}

impl TransferEvent {
    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(self, TransferEvent::Progress { .. })
    }

    /// Error event carrying whatever status is known
    pub(crate) fn failure(error: FetchError, num_bytes: u64, total_bytes: Option<u64>) -> Self {
        let status = error.http_status().unwrap_or(0);
        let status_text = match &error {
            FetchError::HttpStatus { message, .. } => message.clone(),
            other => other.to_string(),
        };
        TransferEvent::Error {
            error: Arc::new(error),
            num_bytes,
            total_bytes,
            status,
            status_text,
        }
    }
}
