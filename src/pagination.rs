use serde::{Deserialize, Serialize};
use ts_rs::TS;
use url::Url;
use utoipa::ToSchema;

use crate::query::QuerySpec;

// Used to parse path-only request URIs (`/api/v1/users?page=2`), which is what
// axum hands to handlers. The base never leaks into the generated links.
const RELATIVE_BASE: &str = "http://relative.invalid";

/// PaginationMeta
///
/// Page boundaries and navigation links for a list response.
/// `next`/`prev` are `null` on the last/first page respectively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct PaginationMeta {
    pub current_page: u64,
    pub total_items: u64,
    pub total_pages: u64,
    pub item_per_page: u64,
    /// 1-based index of the first row on this page (0 when the page is empty).
    pub from_row: u64,
    /// 1-based index of the last row on this page (0 when the page is empty).
    pub to_row: u64,
    #[serde(rename = "self")]
    pub self_url: String,
    pub next: Option<String>,
    pub prev: Option<String>,
}

impl PaginationMeta {
    /// build
    ///
    /// Computes the metadata for `spec` given the filtered total. Neither the
    /// spec nor the request URL is modified; links are fresh strings with only
    /// the `page` query parameter replaced.
    pub fn build(spec: &QuerySpec, request_url: &str, total_items: u64) -> Self {
        let current_page = spec.page.max(1);
        let item_per_page = spec.limit.max(1);
        let total_pages = total_items.div_ceil(item_per_page);

        let (from_row, to_row) = if total_items == 0 {
            (0, 0)
        } else {
            let from = (current_page - 1)
                .saturating_mul(item_per_page)
                .saturating_add(1);
            let to = current_page.saturating_mul(item_per_page).min(total_items);
            if from > total_items { (0, 0) } else { (from, to) }
        };

        let next = (current_page < total_pages).then(|| with_page(request_url, current_page + 1));
        let prev = (current_page > 1).then(|| with_page(request_url, current_page - 1));

        Self {
            current_page,
            total_items,
            total_pages,
            item_per_page,
            from_row,
            to_row,
            self_url: request_url.to_string(),
            next,
            prev,
        }
    }
}

/// Returns `url` with its `page` query parameter set to `page`, keeping every
/// other parameter in its original position. Works for absolute URLs and for
/// path-and-query strings.
pub fn with_page(url: &str, page: u64) -> String {
    let (mut parsed, relative) = match Url::parse(url) {
        Ok(parsed) => (parsed, false),
        Err(_) => match Url::parse(RELATIVE_BASE).and_then(|base| base.join(url)) {
            Ok(parsed) => (parsed, true),
            // Not a URL at all; fall back to a bare query string.
            Err(_) => return format!("?page={}", page),
        },
    };

    let mut replaced = false;
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(key, value)| {
            if key == "page" {
                replaced = true;
                (key.into_owned(), page.to_string())
            } else {
                (key.into_owned(), value.into_owned())
            }
        })
        .collect();

    {
        let mut query = parsed.query_pairs_mut();
        query.clear();
        for (key, value) in &pairs {
            query.append_pair(key, value);
        }
        if !replaced {
            query.append_pair("page", &page.to_string());
        }
    }

    if relative {
        match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        }
    } else {
        parsed.to_string()
    }
}
