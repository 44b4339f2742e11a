//! Remote operations on a single record: fetch, save and destroy.
//!
//! Each operation resolves the record's URL and adapter before anything
//! else, so configuration errors surface without a `request` event. A
//! request emits `request`, then `sync` or `error`.

use crate::{
    config::Validator,
    error::Result,
    events::Observable,
    record::{RecordEvent, SetOptions},
    sync::{FetchParams, SyncAdapter, SyncMethod, SyncRequest, SyncTarget},
    Attributes, Error, Record,
};
use serde_json::Value;
use std::sync::Arc;

/// Options for [`Record::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// Apply attributes only after the server accepts them
    pub wait: bool,
    /// Send only the given attributes with a `patch` request
    pub patch: bool,
    pub silent: bool,
    pub validate: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            wait: false,
            patch: false,
            silent: false,
            validate: true,
        }
    }
}

impl SaveOptions {
    pub fn wait() -> Self {
        Self {
            wait: true,
            ..Self::default()
        }
    }

    pub fn patch() -> Self {
        Self {
            patch: true,
            ..Self::default()
        }
    }
}

/// Options for [`Record::destroy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Emit `destroy` only after the server confirms
    pub wait: bool,
}

impl Record {
    fn remote(&self) -> Result<(String, Arc<dyn SyncAdapter>)> {
        let url = self.url()?;
        let adapter = self.adapter().ok_or(Error::MissingAdapter)?;
        Ok((url, adapter))
    }

    async fn request(
        &self,
        method: SyncMethod,
        url: String,
        adapter: Arc<dyn SyncAdapter>,
        payload: Option<Value>,
    ) -> Result<Value> {
        self.trigger(&RecordEvent::Request {
            record: self.clone(),
            method,
        });
        tracing::debug!(client_id = %self.client_id(), %method, %url, "record request");

        let request = SyncRequest {
            method,
            url,
            target: SyncTarget::Record(self.clone()),
            payload,
            params: FetchParams::default(),
        };
        let outcome = match self.store_requests() {
            Some(requests) => requests.track(adapter.sync(request)).await,
            None => adapter.sync(request).await,
        };
        match outcome {
            Ok(response) => Ok(response),
            Err(error) => {
                tracing::warn!(client_id = %self.client_id(), %method, %error, "record request failed");
                self.trigger(&RecordEvent::Error {
                    record: self.clone(),
                    method,
                    error: error.clone(),
                });
                if error.is_aborted() {
                    Err(Error::Aborted)
                } else {
                    Err(Error::Sync(error))
                }
            }
        }
    }

    fn finish(&self, method: SyncMethod, response: &Value, silent: bool) -> Result<()> {
        if let Value::Object(server) = self.config().parse(response.clone()) {
            if !server.is_empty() {
                let options = SetOptions {
                    silent,
                    ..SetOptions::default()
                };
                if !self.set_attributes(server, options) {
                    return Err(Error::Validation(
                        self.validation_error().unwrap_or(Value::Null),
                    ));
                }
            }
        }
        self.mark_clean();
        self.trigger(&RecordEvent::Sync {
            record: self.clone(),
            method,
            response: response.clone(),
        });
        Ok(())
    }

    /// Reload attributes from the server.
    pub async fn fetch(&self) -> Result<Value> {
        let (url, adapter) = self.remote()?;
        let response = self.request(SyncMethod::Read, url, adapter, None).await?;
        self.finish(SyncMethod::Read, &response, false)?;
        Ok(response)
    }

    /// Persist the record, optionally setting `attributes` first.
    ///
    /// New records are created, `patch` sends only `attributes`, anything
    /// else sends the full attribute set. On success the server's response
    /// is merged in and the record is considered clean.
    pub async fn save(&self, attributes: Attributes, options: SaveOptions) -> Result<Value> {
        let (url, adapter) = self.remote()?;

        let mut full = self.attributes();
        full.extend(attributes.clone());
        if options.validate {
            if let Some(validator) = &self.config().validator {
                if let Err(error) = validator.validate(&full) {
                    self.trigger(&RecordEvent::Invalid {
                        record: self.clone(),
                        error: error.clone(),
                    });
                    return Err(Error::Validation(error));
                }
            }
        }

        if !options.wait && !attributes.is_empty() {
            let set = SetOptions {
                silent: options.silent,
                validate: false,
                ..SetOptions::default()
            };
            self.set_attributes(attributes.clone(), set);
        }

        let method = if self.is_new() {
            SyncMethod::Create
        } else if options.patch {
            SyncMethod::Patch
        } else {
            SyncMethod::Update
        };
        let payload = if method == SyncMethod::Patch {
            Value::Object(attributes.clone())
        } else {
            Value::Object(full)
        };

        let response = self.request(method, url, adapter, Some(payload)).await?;
        if options.wait && !attributes.is_empty() {
            let set = SetOptions {
                silent: options.silent,
                validate: false,
                ..SetOptions::default()
            };
            self.set_attributes(attributes, set);
        }
        self.finish(method, &response, options.silent)?;
        Ok(response)
    }

    /// Delete the record on the server and announce `destroy`, which makes
    /// the owning store drop it. A new record is only destroyed locally and
    /// resolves to `None`.
    pub async fn destroy(&self, options: DestroyOptions) -> Result<Option<Value>> {
        let announce = || {
            self.trigger(&RecordEvent::Destroy {
                record: self.clone(),
            })
        };
        if self.is_new() {
            announce();
            return Ok(None);
        }

        let (url, adapter) = self.remote()?;
        if !options.wait {
            announce();
        }
        let response = self.request(SyncMethod::Delete, url, adapter, None).await?;
        if options.wait {
            announce();
        }
        self.trigger(&RecordEvent::Sync {
            record: self.clone(),
            method: SyncMethod::Delete,
            response: response.clone(),
        });
        Ok(Some(response))
    }
}
