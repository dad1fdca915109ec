//! Response parsing for JSON site APIs.
//!
//! A [`ResponseParser`] turns a decoded response body into
//! [`SearchResult`]s. The stock [`FieldMapParser`] is driven entirely by a
//! [`FieldMap`] of JSON pointers from configuration; sites with unusual
//! shapes plug in their own parser instead.

use super::types::{SearchResult, Site, TagSuggestion};
use crate::error::{FalconError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// JSON pointers locating each field in a site response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    /// Pointer to the result array; empty means the body itself.
    pub list: String,
    pub id: String,
    pub thumbnail: String,
    pub full: String,
    pub title: Option<String>,
    pub tags: Option<String>,
    /// Pointer to the total count in a count response.
    pub count: Option<String>,
    /// Pointers to access and refresh tokens in an auth response.
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<String>,
    /// Additional metadata keys and where to find them.
    pub extra: BTreeMap<String, String>,
    /// Pointer to the array of a tag search response; empty means the body.
    pub tag_list: String,
    pub tag_name: String,
    pub tag_count: String,
    pub tag_kind: Option<String>,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            list: String::new(),
            id: "/id".to_string(),
            thumbnail: "/preview_url".to_string(),
            full: "/file_url".to_string(),
            title: None,
            tags: None,
            count: None,
            access_token: "/access_token".to_string(),
            refresh_token: Some("/refresh_token".to_string()),
            expires_in: Some("/expires_in".to_string()),
            extra: BTreeMap::new(),
            tag_list: String::new(),
            tag_name: "/name".to_string(),
            tag_count: "/count".to_string(),
            tag_kind: Some("/type".to_string()),
        }
    }
}

/// Turns decoded site responses into normalized results.
pub trait ResponseParser: Send + Sync {
    /// Parse a search response. Items that lack required fields are dropped.
    fn parse_search(&self, site: &Site, body: &Value) -> Result<Vec<SearchResult>>;

    /// Parse a detail response for a single item.
    fn parse_detail(&self, site: &Site, body: &Value) -> Result<SearchResult>;

    /// Parse a count response; `Ok(None)` when the count is absent.
    fn parse_count(&self, _site: &Site, _body: &Value) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Parse a tag search response. Entries without a name are dropped.
    fn parse_tags(&self, site: &Site, _body: &Value) -> Result<Vec<TagSuggestion>> {
        Err(FalconError::Parse {
            site: site.id.clone(),
            message: "this parser does not read tag responses".to_string(),
        })
    }
}

/// [`ResponseParser`] driven by a [`FieldMap`].
#[derive(Debug, Clone, Default)]
pub struct FieldMapParser {
    fields: FieldMap,
}

impl FieldMapParser {
    pub fn new(fields: FieldMap) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    fn parse_item(&self, site: &Site, item: &Value) -> Option<SearchResult> {
        let item_id = scalar_at(item, &self.fields.id)?;
        let full = scalar_at(item, &self.fields.full).filter(|s| !s.is_empty())?;
        let thumbnail = scalar_at(item, &self.fields.thumbnail)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| full.clone());

        let mut metadata = BTreeMap::new();
        if let Some(title) = self.fields.title.as_deref().and_then(|p| scalar_at(item, p)) {
            metadata.insert("title".to_string(), title);
        }
        if let Some(tags) = self.fields.tags.as_deref().and_then(|p| tags_at(item, p)) {
            metadata.insert("tags".to_string(), tags);
        }
        for (key, pointer) in &self.fields.extra {
            if let Some(value) = scalar_at(item, pointer) {
                metadata.insert(key.clone(), value);
            }
        }

        Some(SearchResult {
            item_id,
            site_id: site.id.clone(),
            thumbnail_ref: resolve_url(&site.base_url, &thumbnail),
            full_ref: resolve_url(&site.base_url, &full),
            metadata,
        })
    }
}

impl ResponseParser for FieldMapParser {
    fn parse_search(&self, site: &Site, body: &Value) -> Result<Vec<SearchResult>> {
        let list = pointer(body, &self.fields.list)
            .and_then(Value::as_array)
            .ok_or_else(|| FalconError::Parse {
                site: site.id.clone(),
                message: format!("expected an array at '{}'", self.fields.list),
            })?;

        let mut results = Vec::with_capacity(list.len());
        for item in list {
            match self.parse_item(site, item) {
                Some(result) => results.push(result),
                None => debug!("{}: dropping item without id or file url", site.id),
            }
        }
        Ok(results)
    }

    fn parse_detail(&self, site: &Site, body: &Value) -> Result<SearchResult> {
        // Some APIs answer detail lookups with a one-element search result.
        let item = match body {
            Value::Array(items) => items.first(),
            other => Some(other),
        };

        item.and_then(|item| self.parse_item(site, item))
            .ok_or_else(|| FalconError::Parse {
                site: site.id.clone(),
                message: "detail response has no usable item".to_string(),
            })
    }

    fn parse_count(&self, site: &Site, body: &Value) -> Result<Option<u64>> {
        let Some(path) = self.fields.count.as_deref() else {
            return Ok(None);
        };
        match pointer(body, path) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_u64()),
            Some(Value::String(s)) => s.parse().map(Some).map_err(|_| FalconError::Parse {
                site: site.id.clone(),
                message: format!("count at '{}' is not a number", path),
            }),
            Some(_) => Err(FalconError::Parse {
                site: site.id.clone(),
                message: format!("count at '{}' is not a number", path),
            }),
        }
    }

    fn parse_tags(&self, site: &Site, body: &Value) -> Result<Vec<TagSuggestion>> {
        let list = pointer(body, &self.fields.tag_list)
            .and_then(Value::as_array)
            .ok_or_else(|| FalconError::Parse {
                site: site.id.clone(),
                message: format!("expected a tag array at '{}'", self.fields.tag_list),
            })?;

        Ok(list
            .iter()
            .filter_map(|tag| {
                let name = scalar_at(tag, &self.fields.tag_name).filter(|n| !n.is_empty())?;
                let post_count = scalar_at(tag, &self.fields.tag_count)
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                let kind = self.fields.tag_kind.as_deref().and_then(|p| scalar_at(tag, p));
                Some(TagSuggestion { name, post_count, kind })
            })
            .collect())
    }
}

fn pointer<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        Some(value)
    } else {
        value.pointer(path)
    }
}

/// Read a scalar as a string. Numbers and booleans are stringified.
pub(crate) fn scalar_at(value: &Value, path: &str) -> Option<String> {
    match pointer(value, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Tags may be a space-separated string or an array of strings.
fn tags_at(value: &Value, path: &str) -> Option<String> {
    match pointer(value, path)? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn resolve_url(base: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reference.to_string();
    }
    url::Url::parse(base)
        .and_then(|b| b.join(reference))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| reference.to_string())
}
