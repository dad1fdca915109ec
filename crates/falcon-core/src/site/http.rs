//! Configuration-driven client for JSON booru-style APIs.

use super::parser::{scalar_at, FieldMapParser, ResponseParser};
use super::types::{
    AuthContext, AuthGrant, AuthScheme, Capability, Credentials, SearchPage, SearchQuery,
    SearchResult, Site, TagSuggestion,
};
use super::SiteClient;
use crate::config::{SessionSettings, SiteConfig};
use crate::error::{FalconError, Result};
use crate::network::{retry_async, HttpClient, RetryConfig};
use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// [`SiteClient`] for a site described by a [`SiteConfig`].
pub struct HttpSiteClient {
    site: Site,
    config: SiteConfig,
    http: Arc<HttpClient>,
    parser: Arc<dyn ResponseParser>,
    retry: RetryConfig,
    default_ttl: Duration,
    remember_ttl: Duration,
}

impl HttpSiteClient {
    pub fn new(config: SiteConfig, http: Arc<HttpClient>) -> Self {
        let parser = Arc::new(FieldMapParser::new(config.fields.clone()));
        let session = SessionSettings::default();
        Self {
            site: Site::from(&config),
            config,
            http,
            parser,
            retry: RetryConfig::default(),
            default_ttl: Duration::from_secs(session.default_ttl_hours * 3600),
            remember_ttl: Duration::from_secs(session.remember_ttl_days * 86_400),
        }
    }

    /// Replace the response parser.
    pub fn with_parser(mut self, parser: Arc<dyn ResponseParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Retry policy for transient failures.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Grant lifetimes for plain and "remember me" logins.
    pub fn with_session_settings(mut self, settings: &SessionSettings) -> Self {
        self.default_ttl = Duration::from_secs(settings.default_ttl_hours * 3600);
        self.remember_ttl = Duration::from_secs(settings.remember_ttl_days * 86_400);
        self
    }

    fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.site.base_url, path.trim_start_matches('/'))
        }
    }

    fn apply_auth(&self, request: RequestBuilder, username: &str, token: &str) -> RequestBuilder {
        match self.config.auth_scheme {
            AuthScheme::None => request,
            AuthScheme::Basic => request.basic_auth(username, Some(token)),
            AuthScheme::Bearer => request.bearer_auth(token),
            AuthScheme::Query => request.query(&[("login", username), ("api_key", token)]),
        }
    }

    fn with_context(&self, request: RequestBuilder, auth: Option<&AuthContext>) -> RequestBuilder {
        match auth {
            Some(ctx) => self.apply_auth(request, &ctx.username, &ctx.token),
            None => request,
        }
    }

    /// GET `url` and decode JSON, retrying transient failures.
    ///
    /// `build` is called once per attempt since a request cannot be replayed.
    async fn get_json<F>(&self, url: &str, build: F) -> Result<Value>
    where
        F: Fn() -> RequestBuilder,
    {
        let this = self;
        let build = &build;
        let (result, stats) = retry_async(
            &self.retry,
            move || async move {
                let response = this.http.send(build(), url).await?;
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| this.decode_error(e, url))
            },
            is_transient,
        )
        .await;

        if stats.attempts > 1 {
            debug!("{}: {} took {} attempts", self.site.id, url, stats.attempts);
        }
        result.map_err(|e| self.classify(e))
    }

    fn decode_error(&self, err: reqwest::Error, url: &str) -> FalconError {
        if err.is_decode() {
            FalconError::Parse {
                site: self.site.id.clone(),
                message: format!("invalid JSON from {}: {}", url, err),
            }
        } else {
            self.http.map_send_error(err, url)
        }
    }

    /// Map auth-related HTTP statuses to `Auth`.
    fn classify(&self, err: FalconError) -> FalconError {
        match err {
            FalconError::Http { status: 401 | 403, .. } => FalconError::Auth {
                site: self.site.id.clone(),
                message: "credentials rejected".to_string(),
            },
            other => other,
        }
    }

    /// Total matches for `query` when the site has a count endpoint. A
    /// failing count never fails the search it accompanies.
    async fn total_for(&self, query: &SearchQuery, auth: Option<&AuthContext>) -> Option<u64> {
        self.config.endpoints.count.as_ref()?;
        match self.count(&query.tags, auth).await {
            Ok(total) => total,
            Err(e) => {
                debug!("{}: count for [{}] unavailable: {}", self.site.id, query.tag_string(), e);
                None
            }
        }
    }

    fn grant_ttl(&self, credentials: &Credentials) -> Duration {
        if credentials.remember {
            self.remember_ttl
        } else {
            self.default_ttl
        }
    }

    fn grant_from_token_response(&self, body: &Value, fallback_ttl: Duration) -> Result<AuthGrant> {
        let fields = &self.config.fields;
        let token = scalar_at(body, &fields.access_token).ok_or_else(|| FalconError::Auth {
            site: self.site.id.clone(),
            message: "token response has no access token".to_string(),
        })?;
        let refresh_token = fields.refresh_token.as_deref().and_then(|p| scalar_at(body, p));
        let expires_in = fields
            .expires_in
            .as_deref()
            .and_then(|p| scalar_at(body, p))
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(fallback_ttl);

        Ok(AuthGrant {
            token,
            refresh_token,
            expires_in: Some(expires_in),
        })
    }
}

/// Transport failures worth another attempt. Rate limiting is surfaced to
/// the caller with its retry-after hint instead.
fn is_transient(err: &FalconError) -> bool {
    err.is_retryable() && !matches!(err, FalconError::RateLimited { .. })
}

#[async_trait]
impl SiteClient for HttpSiteClient {
    fn site(&self) -> &Site {
        &self.site
    }

    async fn search(&self, query: &SearchQuery, auth: Option<&AuthContext>) -> Result<SearchPage> {
        self.site.require(Capability::Search)?;
        if query.page > 1 {
            self.site.require(Capability::Paginate)?;
        }

        let endpoints = &self.config.endpoints;
        let url = self.endpoint(&endpoints.search);
        let tags = query.tag_string();
        let page = query.page.to_string();
        let limit = self.config.page_size.to_string();

        let fetch_page = self.get_json(&url, || {
            let request = self.http.inner().get(&url).query(&[
                (endpoints.tags_param.as_str(), tags.as_str()),
                (endpoints.page_param.as_str(), page.as_str()),
                (endpoints.limit_param.as_str(), limit.as_str()),
            ]);
            self.with_context(request, auth)
        });
        let (body, total) = tokio::join!(fetch_page, self.total_for(query, auth));

        let items = self.parser.parse_search(&self.site, &body?)?;
        // A known total decides; otherwise a full page implies another.
        let has_more = self.site.supports(Capability::Paginate)
            && match total {
                Some(total) => u64::from(query.page) * u64::from(self.config.page_size) < total,
                None => items.len() as u32 >= self.config.page_size,
            };
        debug!("{}: page {} returned {} items", self.site.id, query.page, items.len());

        Ok(SearchPage {
            site_id: self.site.id.clone(),
            page: query.page,
            items,
            has_more,
            total,
        })
    }

    async fn fetch_detail(&self, item_id: &str, auth: Option<&AuthContext>) -> Result<SearchResult> {
        self.site.require(Capability::FetchDetail)?;
        let template = self.config.endpoints.detail.as_deref().ok_or_else(|| FalconError::Config {
            message: format!("{} has no detail endpoint", self.site.id),
        })?;
        let url = self.endpoint(&template.replace("{id}", &urlencoding::encode(item_id)));

        let body = self
            .get_json(&url, || self.with_context(self.http.inner().get(&url), auth))
            .await?;
        self.parser.parse_detail(&self.site, &body)
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthGrant> {
        self.site.require(Capability::Authenticate)?;
        let ttl = self.grant_ttl(credentials);

        let Some(verify) = self.config.endpoints.verify.as_deref() else {
            // Key-based sites without a verify endpoint accept the key as-is.
            return Ok(AuthGrant {
                token: credentials.secret.clone(),
                refresh_token: None,
                expires_in: Some(ttl),
            });
        };
        let url = self.endpoint(verify);

        if self.config.auth_scheme == AuthScheme::Bearer {
            let form = [
                ("grant_type", "password"),
                ("username", credentials.username.as_str()),
                ("password", credentials.secret.as_str()),
            ];
            let body = self
                .get_json(&url, || self.http.inner().post(&url).form(&form))
                .await?;
            return self.grant_from_token_response(&body, ttl);
        }

        self.get_json(&url, || {
            self.apply_auth(self.http.inner().get(&url), &credentials.username, &credentials.secret)
        })
        .await?;

        debug!("{}: credentials verified", self.site.id);
        Ok(AuthGrant {
            token: credentials.secret.clone(),
            refresh_token: None,
            expires_in: Some(ttl),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthGrant> {
        self.site.require(Capability::Refresh)?;
        let path = self.config.endpoints.refresh.as_deref().ok_or_else(|| FalconError::Config {
            message: format!("{} has no refresh endpoint", self.site.id),
        })?;
        let url = self.endpoint(path);
        let form = [("grant_type", "refresh_token"), ("refresh_token", refresh_token)];

        let body = self
            .get_json(&url, || self.http.inner().post(&url).form(&form))
            .await?;
        self.grant_from_token_response(&body, self.default_ttl)
    }

    async fn count(&self, tags: &[String], auth: Option<&AuthContext>) -> Result<Option<u64>> {
        let Some(path) = self.config.endpoints.count.as_deref() else {
            return Ok(None);
        };
        let url = self.endpoint(path);
        let tags = tags.join(" ");
        let tags_param = self.config.endpoints.tags_param.as_str();

        let body = self
            .get_json(&url, || {
                let request = self.http.inner().get(&url).query(&[(tags_param, tags.as_str())]);
                self.with_context(request, auth)
            })
            .await?;
        self.parser.parse_count(&self.site, &body)
    }

    async fn search_tags(
        &self,
        prefix: &str,
        limit: u32,
        auth: Option<&AuthContext>,
    ) -> Result<Vec<TagSuggestion>> {
        self.site.require(Capability::SearchTags)?;
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        let endpoints = &self.config.endpoints;
        let path = endpoints.tag_search.as_deref().ok_or_else(|| FalconError::Config {
            message: format!("{} has no tag search endpoint", self.site.id),
        })?;
        let url = self.endpoint(path);
        let pattern = format!("{}*", prefix);
        let limit = limit.clamp(1, 1000).to_string();

        let body = self
            .get_json(&url, || {
                let request = self
                    .http
                    .inner()
                    .get(&url)
                    .query(&[
                        (endpoints.tag_name_param.as_str(), pattern.as_str()),
                        (endpoints.limit_param.as_str(), limit.as_str()),
                    ])
                    .query(&endpoints.tag_params);
                self.with_context(request, auth)
            })
            .await?;
        self.parser.parse_tags(&self.site, &body)
    }
}
