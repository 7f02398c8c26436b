//! Test doubles shared by unit tests

use crate::domain::types::{HistoryEntry, Submission, ZoneDefinition};
use crate::io::remote_api::{ApiError, RemoteLocationApi};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type SubmitHook = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Remote API with scripted outcomes
///
/// Each `submit_position` pops the next scripted result, falling back to the
/// default once the script runs out. Every attempt is recorded, failed or not.
pub(crate) struct ScriptedApi {
    script: Mutex<VecDeque<bool>>,
    default_ok: AtomicBool,
    submitted: Mutex<Vec<Submission>>,
    zone: Mutex<Result<Option<ZoneDefinition>, u16>>,
    history: Mutex<Vec<HistoryEntry>>,
    safe_exit_calls: Mutex<Vec<bool>>,
    on_submit: Mutex<Option<SubmitHook>>,
}

impl ScriptedApi {
    fn with_default(ok: bool) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_ok: AtomicBool::new(ok),
            submitted: Mutex::new(Vec::new()),
            zone: Mutex::new(Ok(None)),
            history: Mutex::new(Vec::new()),
            safe_exit_calls: Mutex::new(Vec::new()),
            on_submit: Mutex::new(None),
        }
    }

    pub(crate) fn succeeding() -> Self {
        Self::with_default(true)
    }

    pub(crate) fn failing() -> Self {
        Self::with_default(false)
    }

    /// Queue outcomes for the next submissions, in order
    pub(crate) fn push_results(&self, results: &[bool]) {
        self.script.lock().extend(results.iter().copied());
    }

    pub(crate) fn set_default_ok(&self, ok: bool) {
        self.default_ok.store(ok, Ordering::Relaxed);
    }

    pub(crate) fn submitted(&self) -> Vec<Submission> {
        self.submitted.lock().clone()
    }

    pub(crate) fn set_zone(&self, zone: Option<ZoneDefinition>) {
        *self.zone.lock() = Ok(zone);
    }

    /// Make `fetch_zone` fail with the given HTTP status
    pub(crate) fn set_zone_unreachable(&self, status: u16) {
        *self.zone.lock() = Err(status);
    }

    pub(crate) fn set_history(&self, entries: Vec<HistoryEntry>) {
        *self.history.lock() = entries;
    }

    pub(crate) fn safe_exit_calls(&self) -> Vec<bool> {
        self.safe_exit_calls.lock().clone()
    }

    /// Run `hook` inside every `submit_position`, before it resolves
    pub(crate) fn on_submit<F>(&self, hook: F)
    where
        F: Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        *self.on_submit.lock() = Some(Arc::new(hook));
    }
}

#[async_trait]
impl RemoteLocationApi for ScriptedApi {
    async fn submit_position(&self, submission: &Submission) -> Result<(), ApiError> {
        self.submitted.lock().push(*submission);

        let hook = self.on_submit.lock().clone();
        if let Some(hook) = hook {
            hook().await;
        }

        let ok = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_ok.load(Ordering::Relaxed));
        if ok {
            Ok(())
        } else {
            Err(ApiError::Status(503))
        }
    }

    async fn fetch_zone(&self) -> Result<Option<ZoneDefinition>, ApiError> {
        self.zone.lock().clone().map_err(ApiError::Status)
    }

    async fn fetch_history(&self) -> Result<Vec<HistoryEntry>, ApiError> {
        Ok(self.history.lock().clone())
    }

    async fn set_safe_exit(&self, active: bool) -> Result<bool, ApiError> {
        self.safe_exit_calls.lock().push(active);
        Ok(active)
    }
}

/// Zone centred on the reference scenario point, 200 m radius
pub(crate) fn zone_definition(safe_exit_active: bool) -> ZoneDefinition {
    ZoneDefinition {
        latitude: -33.4569,
        longitude: -70.6483,
        radius_meters: 200.0,
        address: None,
        safe_exit_active,
    }
}
