//! An HTTP client that fetches feature definitions from the upstream API.
use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde_json::Value;
use url::Url;

use crate::{config::ProxyContext, config::UpstreamConfig, definitions::Payload, Error, Result};

const FEATURES_ENDPOINT: &[&str] = &["api", "features"];
const EVAL_FEATURES_ENDPOINT: &[&str] = &["api", "eval", "features"];

/// A fully resolved upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub url: Url,
    /// Bearer token. Only set for the server-side evaluation endpoint.
    pub bearer: Option<String>,
}

impl UpstreamRequest {
    /// Resolve the request for `api_key`, validating that `ctx` carries everything the selected
    /// endpoint needs.
    pub fn resolve(ctx: &ProxyContext, api_key: &str, ss_eval: bool) -> Result<UpstreamRequest> {
        let host = ctx.api_host.as_deref().ok_or(Error::MissingApiHost)?;

        let bearer = if ss_eval {
            Some(
                ctx.secret_api_key
                    .clone()
                    .ok_or(Error::MissingSecretApiKey)?,
            )
        } else {
            None
        };

        Ok(UpstreamRequest {
            url: features_url(host, api_key, ss_eval)?,
            bearer,
        })
    }
}

/// Upstream features URL for `api_key`. The key always ends up percent-encoded as a single
/// path segment.
///
/// ```
/// # use feature_proxy::upstream::features_url;
/// let url = features_url("https://cdn.example.com", "sdk-abc", false).unwrap();
/// assert_eq!(url.as_str(), "https://cdn.example.com/api/features/sdk-abc");
/// let url = features_url("https://cdn.example.com/", "sdk-abc", true).unwrap();
/// assert_eq!(url.as_str(), "https://cdn.example.com/api/eval/features/sdk-abc");
/// ```
pub fn features_url(host: &str, api_key: &str, ss_eval: bool) -> Result<Url> {
    let endpoint = if ss_eval {
        EVAL_FEATURES_ENDPOINT
    } else {
        FEATURES_ENDPOINT
    };
    let mut url = Url::parse(host).map_err(Error::InvalidApiHost)?;
    url.path_segments_mut()
        .map_err(|()| Error::InvalidApiHost(url::ParseError::SetHostOnCannotBeABaseUrl))?
        .pop_if_empty()
        .extend(endpoint)
        .push(api_key);
    Ok(url)
}

/// Source of feature payloads.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch the payload. The returned future must eventually settle.
    async fn fetch(&self, request: &UpstreamRequest) -> Result<Payload>;
}

/// [`Upstream`] talking to the feature API over HTTP.
pub struct HttpUpstream {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<HttpUpstream> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(HttpUpstream { client, config })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: &UpstreamRequest) -> Result<Payload> {
        log::debug!(target: "feature_proxy", url = request.url.path(); "fetching features");

        let mut builder = self
            .client
            .get(request.url.clone())
            .header(header::USER_AGENT, &self.config.user_agent);
        if let Some(bearer) = &request.bearer {
            builder = builder.bearer_auth(bearer);
        }

        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                log::warn!(target: "feature_proxy", "upstream rejected credentials. Check secret api key");
            }
            return Err(Error::UpstreamStatus(status));
        }

        let body = response.bytes().await?;
        let payload = match serde_json::from_slice::<Value>(&body)? {
            Value::Object(payload) => payload,
            _ => return Err(Error::EmptyResponse),
        };

        log::debug!(target: "feature_proxy", url = request.url.path(); "successfully fetched features");

        Ok(payload)
    }
}
