use std::sync::Arc;

use crate::{
    cache_store::{CacheEntry, CacheStore},
    config::{EvaluationOptions, ProxyContext, UpstreamConfig},
    definitions::{Attributes, Payload},
    eval::GrowthBookEngine,
    publisher::ChangePublisher,
    reducer::{reduce, ReducedDefinitionSet},
    refresh::{RefreshCoordinator, RefreshOutcome},
    upstream::{HttpUpstream, Upstream},
    Result,
};

/// Caller-facing entry point of the proxy.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use feature_proxy::{Client, MemoryCacheStore, UpstreamConfig};
/// let client = Client::from_config(UpstreamConfig::new())
///     .unwrap()
///     .with_cache(Arc::new(MemoryCacheStore::new()));
/// ```
pub struct Client {
    cache: Option<Arc<dyn CacheStore>>,
    refresh: RefreshCoordinator,
}

impl Client {
    /// Create a client fetching from `upstream`, without cache or publisher.
    pub fn new(upstream: Arc<dyn Upstream>) -> Client {
        Client {
            cache: None,
            refresh: RefreshCoordinator::new(upstream),
        }
    }

    /// Create a client fetching over HTTP.
    pub fn from_config(config: UpstreamConfig) -> Result<Client> {
        Ok(Client::new(Arc::new(HttpUpstream::new(config)?)))
    }

    /// Use `cache` for storing payloads. Without a cache, refreshing is disabled.
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Client {
        self.cache = Some(cache.clone());
        self.refresh = self.refresh.with_cache(cache);
        self
    }

    /// Notify `publisher` about payload changes (for contexts with event stream enabled).
    pub fn with_publisher(mut self, publisher: Arc<dyn ChangePublisher>) -> Client {
        self.refresh = self.refresh.with_publisher(publisher);
        self
    }

    /// Currently cached entry for `api_key`, possibly stale.
    pub async fn cached(&self, api_key: &str) -> Result<Option<Arc<CacheEntry>>> {
        match &self.cache {
            Some(cache) => cache.get(api_key).await,
            None => Ok(None),
        }
    }

    /// Fetch the latest payload for `api_key` from upstream and store it in the cache.
    ///
    /// See [`RefreshCoordinator::refresh`] for the exact semantics.
    pub async fn fetch_or_refresh(
        &self,
        api_key: &str,
        ctx: &ProxyContext,
        ss_eval: bool,
    ) -> Result<Option<RefreshOutcome>> {
        self.refresh.refresh(api_key, ctx, ss_eval).await
    }

    /// Reduce `payload` to what a visitor with `attributes` is entitled to see.
    pub fn evaluate(
        &self,
        payload: &Payload,
        attributes: &Attributes,
        ctx: Option<&ProxyContext>,
    ) -> ReducedDefinitionSet {
        let options = ctx.map(EvaluationOptions::from).unwrap_or_default();
        self.evaluate_with_options(payload, attributes, &options)
    }

    /// Same as [`Client::evaluate`] with full control over evaluation options.
    pub fn evaluate_with_options(
        &self,
        payload: &Payload,
        attributes: &Attributes,
        options: &EvaluationOptions,
    ) -> ReducedDefinitionSet {
        let reduced = reduce::<GrowthBookEngine>(payload, attributes, options);

        log::trace!(target: "feature_proxy",
                    attributes:serde,
                    features:serde = reduced.features.keys().collect::<Vec<_>>();
                    "evaluated payload");

        reduced
    }
}
