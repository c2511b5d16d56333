//! Request descriptor - what to fetch and who to tell about it

use crate::handle::Fetch;
use bytes::Bytes;
use hfetch_types::{
    BoundedStringError, DestinationPath, FetchFlags, RequestMethod, StorageMode,
};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked by the engine with the handle it concerns
pub type FetchCallback = Arc<dyn Fn(&Fetch) + Send + Sync>;

/// Caller-owned value carried from the descriptor to the handle untouched
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Parameters of a new fetch.
///
/// Build one with [`FetchAttr::new`], fill in what you need and pass it to
/// [`crate::FetchEngine::fetch`]. The engine copies what it needs at
/// submission, so the descriptor can be reused or changed afterwards.
#[derive(Clone, Default)]
pub struct FetchAttr {
    /// "GET", "POST", ... (empty means GET)
    pub request_method: RequestMethod,
    pub user_data: Option<UserData>,
    pub onsuccess: Option<FetchCallback>,
    pub onerror: Option<FetchCallback>,
    pub onprogress: Option<FetchCallback>,
    /// Key in the persistent store. Empty means the body is not stored.
    pub destination_path: DestinationPath,
    pub attributes: FetchFlags,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Option<Bytes>,
    /// Per-request timeout, overriding the engine default
    pub timeout: Option<Duration>,
    /// HTTP basic auth user name and password
    pub credentials: Option<(String, String)>,
}

impl FetchAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every field to its default.
    ///
    /// Safe to call any number of times; strings and vectors keep their
    /// buffers, so this never allocates.
    pub fn init(&mut self) {
        self.request_method.clear();
        self.user_data = None;
        self.onsuccess = None;
        self.onerror = None;
        self.onprogress = None;
        self.destination_path.clear();
        self.attributes = FetchFlags::empty();
        self.request_headers.clear();
        self.request_body = None;
        self.timeout = None;
        self.credentials = None;
    }

    pub fn set_method(&mut self, method: &str) -> Result<&mut Self, BoundedStringError> {
        self.request_method = RequestMethod::new(method)?;
        Ok(self)
    }

    pub fn set_destination_path(&mut self, path: &str) -> Result<&mut Self, BoundedStringError> {
        self.destination_path = DestinationPath::new(path)?;
        Ok(self)
    }

    /// Select the storage mode, clearing the other exclusive flags
    pub fn set_storage_mode(&mut self, mode: StorageMode) -> &mut Self {
        self.attributes
            .remove(FetchFlags::APPEND | FetchFlags::REPLACE | FetchFlags::NO_DOWNLOAD);
        match mode {
            StorageMode::Default => {}
            StorageMode::Append => self.attributes.insert(FetchFlags::APPEND),
            StorageMode::Replace => self.attributes.insert(FetchFlags::REPLACE),
            StorageMode::NoDownload => self.attributes.insert(FetchFlags::NO_DOWNLOAD),
        }
        self
    }

    pub fn with_flags(&mut self, flags: FetchFlags) -> &mut Self {
        self.attributes.insert(flags);
        self
    }

    pub fn with_user_data<T: Any + Send + Sync>(&mut self, data: T) -> &mut Self {
        self.user_data = Some(Arc::new(data));
        self
    }

    pub fn with_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.request_body = Some(body.into());
        self
    }

    pub fn on_success<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Fetch) + Send + Sync + 'static,
    {
        self.onsuccess = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Fetch) + Send + Sync + 'static,
    {
        self.onerror = Some(Arc::new(callback));
        self
    }

    pub fn on_progress<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Fetch) + Send + Sync + 'static,
    {
        self.onprogress = Some(Arc::new(callback));
        self
    }

    /// Method to send, defaulting to GET
    pub(crate) fn method_or_default(&self) -> &str {
        if self.request_method.is_empty() {
            "GET"
        } else {
            self.request_method.as_str()
        }
    }
}

impl fmt::Debug for FetchAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchAttr")
            .field("request_method", &self.request_method)
            .field("destination_path", &self.destination_path)
            .field("attributes", &self.attributes)
            .field("has_user_data", &self.user_data.is_some())
            .field("onsuccess", &self.onsuccess.is_some())
            .field("onerror", &self.onerror.is_some())
            .field("onprogress", &self.onprogress.is_some())
            .field("request_headers", &self.request_headers)
            .field("request_body_len", &self.request_body.as_ref().map(|b| b.len()))
            .field("timeout", &self.timeout)
            .finish()
    }
}
