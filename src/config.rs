use std::{collections::HashMap, time::Duration};

/// Per-call context for [`Client::fetch_or_refresh`](crate::Client::fetch_or_refresh) and
/// [`Client::evaluate`](crate::Client::evaluate).
///
/// ```
/// # use feature_proxy::ProxyContext;
/// let ctx = ProxyContext::new()
///     .with_api_host("https://cdn.example.com")
///     .with_secret_api_key("secret_abc")
///     .with_event_stream(true);
/// ```
// Not implementing `Copy` as we carry owned strings.
#[derive(Debug, Clone, Default)]
pub struct ProxyContext {
    /// Upstream host (scheme + authority, optionally a path prefix), e.g.
    /// `https://api.growthbook.io`.
    pub api_host: Option<String>,
    /// Secret credential sent as a bearer token when server-side evaluation is requested.
    pub secret_api_key: Option<String>,
    /// Emit change events to the configured publisher after every successful refresh.
    pub enable_event_stream: bool,
    /// Ask the evaluation engine for verbose diagnostics. Never changes evaluation results.
    pub verbose_debugging: bool,
}

impl ProxyContext {
    /// Create an empty context.
    pub fn new() -> ProxyContext {
        ProxyContext::default()
    }

    /// Set upstream host.
    pub fn with_api_host(mut self, api_host: impl Into<String>) -> ProxyContext {
        self.api_host = Some(api_host.into());
        self
    }

    /// Set secret API key used for the server-side evaluation endpoint.
    pub fn with_secret_api_key(mut self, secret_api_key: impl Into<String>) -> ProxyContext {
        self.secret_api_key = Some(secret_api_key.into());
        self
    }

    /// Enable or disable change notifications.
    pub fn with_event_stream(mut self, enabled: bool) -> ProxyContext {
        self.enable_event_stream = enabled;
        self
    }

    /// Enable or disable verbose evaluation diagnostics.
    pub fn with_verbose_debugging(mut self, enabled: bool) -> ProxyContext {
        self.verbose_debugging = enabled;
        self
    }
}

/// Configuration for [`HttpUpstream`](crate::upstream::HttpUpstream).
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Value of the `User-Agent` header.
    ///
    /// Defaults to [`UpstreamConfig::DEFAULT_USER_AGENT`].
    pub user_agent: String,
    /// Request timeout. A timed out request settles as a failure, so waiters are never left
    /// suspended forever.
    ///
    /// Defaults to [`UpstreamConfig::DEFAULT_TIMEOUT`].
    pub timeout: Duration,
}

impl UpstreamConfig {
    /// Default value for [`UpstreamConfig::user_agent`].
    pub const DEFAULT_USER_AGENT: &'static str = "GrowthBook Proxy";
    /// Default value for [`UpstreamConfig::timeout`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a new `UpstreamConfig` using default configuration.
    pub fn new() -> UpstreamConfig {
        UpstreamConfig::default()
    }

    /// Update `User-Agent` header value.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> UpstreamConfig {
        self.user_agent = user_agent.into();
        self
    }

    /// Update request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> UpstreamConfig {
        self.timeout = timeout;
        self
    }
}

impl Default for UpstreamConfig {
    fn default() -> UpstreamConfig {
        UpstreamConfig {
            user_agent: UpstreamConfig::DEFAULT_USER_AGENT.to_owned(),
            timeout: UpstreamConfig::DEFAULT_TIMEOUT,
        }
    }
}

/// Options for a single evaluation/reduction call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationOptions {
    /// Passed to the evaluation engine as a diagnostics hint.
    pub verbose_debugging: bool,
    /// Experiment key to variation index overrides.
    pub forced_variations: HashMap<String, usize>,
    /// Current page URL of the visitor, used for URL-pattern targeting.
    pub url: Option<String>,
}

impl EvaluationOptions {
    /// Create default options.
    pub fn new() -> EvaluationOptions {
        EvaluationOptions::default()
    }

    /// Force `experiment_key` to `variation` for this evaluation.
    pub fn with_forced_variation(
        mut self,
        experiment_key: impl Into<String>,
        variation: usize,
    ) -> EvaluationOptions {
        self.forced_variations
            .insert(experiment_key.into(), variation);
        self
    }

    /// Set visitor URL.
    pub fn with_url(mut self, url: impl Into<String>) -> EvaluationOptions {
        self.url = Some(url.into());
        self
    }

    /// Toggle verbose diagnostics.
    pub fn with_verbose_debugging(mut self, enabled: bool) -> EvaluationOptions {
        self.verbose_debugging = enabled;
        self
    }
}

impl From<&ProxyContext> for EvaluationOptions {
    fn from(ctx: &ProxyContext) -> EvaluationOptions {
        EvaluationOptions {
            verbose_debugging: ctx.verbose_debugging,
            ..EvaluationOptions::default()
        }
    }
}
