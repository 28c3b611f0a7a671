//! Remote API access
//!
//! - [`http`] - One-exchange HTTP adapter and the [`HttpOperation`] work unit
//! - [`pagination`] - Cursor, page and the lazy [`Paginator`]
//! - [`json_pages`] - Link, token and offset pagination over JSON bodies

pub mod http;
pub mod json_pages;
pub mod pagination;

pub use http::{parse_retry_after, ApiHttpClient, ApiRequest, HttpOperation};
pub use json_pages::{JsonPageFetcher, PaginationStyle};
pub use pagination::{CursorPosition, Page, PageCursor, PageFetcher, Paginator};
