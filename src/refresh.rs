//! Stale-while-revalidate refresh pipeline.
//!
//! [`RefreshCoordinator`] fetches the latest payload from upstream, writes it to the cache and
//! notifies subscribers about the change. Concurrent refreshes of the same upstream URL are
//! collapsed into a single in-flight fetch: one upstream call, one cache write, one event.
use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use derive_more::{Display, From};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};

use crate::{
    cache_store::{CacheEntry, CacheStore},
    config::ProxyContext,
    definitions::Payload,
    publisher::{ChangePublisher, DiffEvent, EventKind},
    upstream::{Upstream, UpstreamRequest},
    Result,
};

/// Identifies one in-flight fetch: the resolved upstream URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From)]
pub struct RefreshKey(String);

/// Result of a refresh that produced a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    /// Newly fetched payload, already written to the cache.
    pub payload: Arc<Payload>,
    /// Cache entry that was replaced.
    pub old_entry: Option<Arc<CacheEntry>>,
}

type InFlightFetch = Shared<BoxFuture<'static, Option<RefreshOutcome>>>;

type Registry = Arc<Mutex<HashMap<RefreshKey, InFlight>>>;

/// Registry entry: the shared fetch plus whether any participant asked for a change event.
struct InFlight {
    fetch: InFlightFetch,
    notify: Arc<AtomicBool>,
}

/// Removes the registry entry when dropped, so the entry is cleared on every settlement of the
/// refresh task, panics included.
struct Deregister {
    registry: Registry,
    key: RefreshKey,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        // A poisoned lock still holds a usable map; clear the entry regardless.
        let mut in_flight = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.remove(&self.key);
    }
}

/// Coordinates refreshes of cached payloads.
///
/// Each coordinator owns its in-flight registry, so independent coordinators never share
/// fetches.
pub struct RefreshCoordinator {
    cache: Option<Arc<dyn CacheStore>>,
    upstream: Arc<dyn Upstream>,
    publisher: Option<Arc<dyn ChangePublisher>>,
    in_flight: Registry,
}

impl RefreshCoordinator {
    /// Create a coordinator without cache and publisher. Refreshing is a no-op until a cache is
    /// configured with [`RefreshCoordinator::with_cache`].
    pub fn new(upstream: Arc<dyn Upstream>) -> RefreshCoordinator {
        RefreshCoordinator {
            cache: None,
            upstream,
            publisher: None,
            in_flight: Arc::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> RefreshCoordinator {
        self.cache = Some(cache);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ChangePublisher>) -> RefreshCoordinator {
        self.publisher = Some(publisher);
        self
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .expect("thread holding in-flight lock should not panic")
            .len()
    }

    /// Refresh the cached payload for `api_key`.
    ///
    /// Returns `Ok(None)` when no cache is configured or when upstream produced no payload
    /// (the failure is logged and the cache is left untouched). Returns `Err` only for
    /// configuration errors.
    ///
    /// If a refresh for the same upstream URL is already in flight, this call waits for it and
    /// shares its outcome instead of issuing another request. A single event is published if any
    /// of the participating calls has the event stream enabled in its `ctx`.
    ///
    /// The fetch runs on a spawned task, so this must be called within a tokio runtime.
    pub async fn refresh(
        &self,
        api_key: &str,
        ctx: &ProxyContext,
        ss_eval: bool,
    ) -> Result<Option<RefreshOutcome>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };

        let request = UpstreamRequest::resolve(ctx, api_key, ss_eval)?;
        let key = RefreshKey::from(request.url.to_string());

        let pipeline = Pipeline {
            api_key: api_key.to_owned(),
            request,
            ss_eval,
            cache: cache.clone(),
            upstream: self.upstream.clone(),
            publisher: self.publisher.clone(),
            notify: Arc::new(AtomicBool::new(ctx.enable_event_stream)),
        };

        Ok(self
            .join_or_start(key, pipeline, ctx.enable_event_stream)
            .await)
    }

    /// Atomically look up the in-flight fetch for `key` or register a new one running
    /// `pipeline`. A joining call with `notify` set requests an event from the running fetch.
    fn join_or_start(&self, key: RefreshKey, pipeline: Pipeline, notify: bool) -> InFlightFetch {
        let mut in_flight = self
            .in_flight
            .lock()
            .expect("thread holding in-flight lock should not panic");

        if let Some(existing) = in_flight.get(&key) {
            log::debug!(target: "feature_proxy", api_key = pipeline.api_key.as_str(); "joining in-flight refresh");
            existing.notify.fetch_or(notify, Ordering::SeqCst);
            return existing.fetch.clone();
        }

        // The task deregisters itself once settled (or unwound), so the entry is cleared even if
        // every waiter is dropped. It can't do so before the insert below as we're holding the
        // lock.
        let deregister = Deregister {
            registry: self.in_flight.clone(),
            key: key.clone(),
        };
        let notify = pipeline.notify.clone();
        let handle = tokio::spawn(async move {
            let _deregister = deregister;
            pipeline.run().await
        });

        let fetch = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::error!(target: "feature_proxy", "refresh task failed: {:?}", err);
                    None
                }
            }
        }
        .boxed()
        .shared();

        in_flight.insert(
            key,
            InFlight {
                fetch: fetch.clone(),
                notify,
            },
        );
        fetch
    }
}

/// Everything a single refresh needs, owned so it can run detached from the callers.
struct Pipeline {
    api_key: String,
    request: UpstreamRequest,
    ss_eval: bool,
    cache: Arc<dyn CacheStore>,
    upstream: Arc<dyn Upstream>,
    publisher: Option<Arc<dyn ChangePublisher>>,
    /// Set by any participant with the event stream enabled. Read after the cache write.
    notify: Arc<AtomicBool>,
}

impl Pipeline {
    async fn run(self) -> Option<RefreshOutcome> {
        let api_key = self.api_key.as_str();

        let payload = match self.upstream.fetch(&self.request).await {
            Ok(payload) => Arc::new(payload),
            Err(err) => {
                log::error!(target: "feature_proxy", api_key; "refresh stale cache error: {:?}", err);
                return None;
            }
        };

        log::debug!(target: "feature_proxy", api_key; "cache STALE, refreshing cache");

        let old_entry = match self.cache.get(api_key).await {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!(target: "feature_proxy", api_key; "unable to read previous cache entry: {:?}", err);
                None
            }
        };

        if let Err(err) = self.cache.set(api_key, payload.clone()).await {
            log::error!(target: "feature_proxy", api_key; "unable to write cache entry: {:?}", err);
            return None;
        }

        let publisher = self
            .publisher
            .as_ref()
            .filter(|_| self.notify.load(Ordering::SeqCst));
        if let Some(publisher) = publisher {
            let event = DiffEvent {
                api_key: self.api_key.clone(),
                event: EventKind::Features,
                payload: payload.clone(),
                old_payload: old_entry.as_ref().map(|entry| entry.payload.clone()),
                ss_eval_enabled: self.ss_eval,
            };
            // The cache is already updated, a misbehaving publisher must not undo the refresh.
            if panic::catch_unwind(AssertUnwindSafe(|| publisher.publish(event))).is_err() {
                log::error!(target: "feature_proxy", api_key; "change publisher panicked");
            }
        }

        Some(RefreshOutcome { payload, old_entry })
    }
}
