//! Page fetcher for JSON list endpoints
//!
//! Covers the three common styles: a `next` link in the body, an opaque
//! continuation token sent back as a query parameter, and `offset`/`limit`
//! query parameters. Fields are located with JSON pointers (RFC 6901).

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::http::{ApiHttpClient, ApiRequest};
use super::pagination::{CursorPosition, Page, PageCursor, PageFetcher};
use crate::AttemptReport;

/// How a list endpoint hands out the next page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationStyle {
    /// The body carries the next page URL, absolute or relative
    Link {
        /// Pointer to the next link, e.g. `/next_page`
        next_pointer: String,
    },
    /// The body carries a token to pass back as a query parameter
    Token {
        /// Pointer to the token, e.g. `/meta/next_page_token`
        token_pointer: String,
        /// Query parameter the token is sent in
        param: String,
    },
    /// Offset and limit query parameters
    Offset {
        /// Offset parameter name
        offset_param: String,
        /// Limit parameter name
        limit_param: String,
        /// Items per page
        limit: u64,
    },
}

impl PaginationStyle {
    /// `offset`/`limit` parameters with `limit` items per page
    pub fn offset(limit: u64) -> Self {
        PaginationStyle::Offset {
            offset_param: "offset".to_string(),
            limit_param: "limit".to_string(),
            limit,
        }
    }

    /// Page size implied by the style, if any
    pub fn page_size(&self) -> Option<usize> {
        match self {
            PaginationStyle::Offset { limit, .. } => Some(*limit as usize),
            _ => None,
        }
    }
}

/// [`PageFetcher`] over a JSON list endpoint
pub struct JsonPageFetcher {
    client: Arc<ApiHttpClient>,
    request: ApiRequest,
    style: PaginationStyle,
    items_pointer: String,
    done_pointer: Option<String>,
}

impl JsonPageFetcher {
    /// Fetch pages of `request` in the given style; items are the top-level array.
    pub fn new(client: Arc<ApiHttpClient>, request: ApiRequest, style: PaginationStyle) -> Self {
        Self {
            client,
            request,
            style,
            items_pointer: String::new(),
            done_pointer: None,
        }
    }

    /// Pointer to the item array, e.g. `/results`
    pub fn with_items_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.items_pointer = pointer.into();
        self
    }

    /// Pointer to a boolean that is `true` on the last page, e.g. `/done`
    pub fn with_done_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.done_pointer = Some(pointer.into());
        self
    }

    /// Pagination style
    pub fn style(&self) -> &PaginationStyle {
        &self.style
    }

    fn request_for(&self, cursor: &PageCursor) -> ApiRequest {
        let mut request = self.request.clone();
        match (&self.style, &cursor.position) {
            (PaginationStyle::Link { .. }, CursorPosition::Link(url)) => {
                request.path = url.clone();
                request.query.clear();
            }
            (PaginationStyle::Token { param, .. }, CursorPosition::Token(token)) => {
                request.query.push((param.clone(), token.clone()));
            }
            (
                PaginationStyle::Offset {
                    offset_param,
                    limit_param,
                    limit,
                },
                position,
            ) => {
                let offset = match position {
                    CursorPosition::Offset(offset) => *offset,
                    _ => 0,
                };
                request.query.push((offset_param.clone(), offset.to_string()));
                request.query.push((limit_param.clone(), limit.to_string()));
            }
            _ => {}
        }
        request
    }

    fn next_position(&self, body: &Value, cursor: &PageCursor, count: usize) -> Option<CursorPosition> {
        match &self.style {
            PaginationStyle::Link { next_pointer } => non_empty_str(body, next_pointer)
                .map(|link| CursorPosition::Link(self.client.resolve_link(link))),
            PaginationStyle::Token { token_pointer, .. } => {
                non_empty_str(body, token_pointer).map(|t| CursorPosition::Token(t.to_string()))
            }
            PaginationStyle::Offset { .. } => {
                let offset = match cursor.position {
                    CursorPosition::Offset(offset) => offset,
                    _ => 0,
                };
                Some(CursorPosition::Offset(offset + count as u64))
            }
        }
    }
}

fn non_empty_str<'a>(body: &'a Value, pointer: &str) -> Option<&'a str> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl PageFetcher<Value> for JsonPageFetcher {
    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page<Value>, AttemptReport> {
        let request = self.request_for(cursor);
        let mut body = self.client.get_json(&request).await?;

        let exhausted = self
            .done_pointer
            .as_deref()
            .and_then(|p| body.pointer(p))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let items = match body.pointer_mut(&self.items_pointer).map(Value::take) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) => Vec::new(),
            Some(_) | None => {
                return Err(AttemptReport::Invalid(format!(
                    "response has no item array at {:?}",
                    self.items_pointer
                )))
            }
        };
        let next = self.next_position(&body, cursor, items.len());

        Ok(Page {
            items,
            next,
            exhausted,
        })
    }
}
