//! Site integrations.
//!
//! Every external site is a [`SiteClient`]: a capability-tagged client that
//! implements only the operations its [`Site`] declares. The
//! [`SiteRegistry`] dispatches by site id and checks capabilities before
//! calling in, so adding a site means registering another client.

mod http;
mod parser;
mod registry;
mod types;

pub use http::HttpSiteClient;
pub use parser::{FieldMap, FieldMapParser, ResponseParser};
pub use registry::{SiteOutcome, SiteRegistry};
pub use types::{
    AuthContext, AuthGrant, AuthScheme, Capability, Credentials, ItemRef, SearchPage, SearchQuery,
    SearchResult, Site, TagSuggestion,
};

use crate::error::{FalconError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Client for one external site.
///
/// Only `site` and `search` are mandatory. The remaining operations default
/// to `UnsupportedCapability`, matching a site whose capability set omits
/// them.
#[async_trait]
pub trait SiteClient: Send + Sync {
    fn site(&self) -> &Site;

    /// Run one page of a tag search.
    async fn search(&self, query: &SearchQuery, auth: Option<&AuthContext>) -> Result<SearchPage>;

    async fn fetch_detail(&self, _item_id: &str, _auth: Option<&AuthContext>) -> Result<SearchResult> {
        Err(unsupported(self.site(), Capability::FetchDetail))
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<AuthGrant> {
        Err(unsupported(self.site(), Capability::Authenticate))
    }

    /// Exchange a refresh token for a new grant.
    async fn refresh(&self, _refresh_token: &str) -> Result<AuthGrant> {
        Err(unsupported(self.site(), Capability::Refresh))
    }

    /// Total match count for `tags`, or `None` when the site cannot tell.
    async fn count(&self, _tags: &[String], _auth: Option<&AuthContext>) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Up to `limit` known tags starting with `prefix`.
    async fn search_tags(
        &self,
        _prefix: &str,
        _limit: u32,
        _auth: Option<&AuthContext>,
    ) -> Result<Vec<TagSuggestion>> {
        Err(unsupported(self.site(), Capability::SearchTags))
    }
}

/// Shared handle to a site client.
pub type DynSiteClient = Arc<dyn SiteClient>;

fn unsupported(site: &Site, capability: Capability) -> FalconError {
    FalconError::UnsupportedCapability {
        site: site.id.clone(),
        capability: capability.to_string(),
    }
}
