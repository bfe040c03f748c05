//! Offset and keyset pagination over an ordered, filtered result set.
//!
//! Every list endpoint funnels through here so page boundaries are
//! identical no matter which storage backend produced the rows. Keyset
//! cursors are opaque base64url tokens over `(created_at_us, id)` — the
//! shared sort key — which is what keeps a cursor minted under one
//! backend valid under the other.

use axum::http::header::LINK;
use axum::http::{HeaderMap, HeaderValue};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::errors::ApiError;

pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub pagination: Option<String>,
    pub cursor: Option<String>,
}

impl PageParams {
    pub fn keyset(&self) -> bool {
        self.cursor.is_some() || self.pagination.as_deref() == Some("keyset")
    }

    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE)
    }

    pub fn cursor(&self) -> Result<Option<Cursor>, ApiError> {
        match &self.cursor {
            Some(raw) => Ok(Some(Cursor::decode(raw)?)),
            None => Ok(None),
        }
    }
}

/// Position of the last row served: microsecond timestamp plus id as the
/// tiebreaker, matching the `created_at DESC, id DESC` collection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at_us: i64,
    pub id: u64,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("cursor serializes");
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Cursor, ApiError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.as_bytes())
            .map_err(|_| ApiError::BadRequest("invalid cursor".into()))?;
        serde_json::from_slice(&bytes).map_err(|_| ApiError::BadRequest("invalid cursor".into()))
    }
}

/// Rows that can be keyset-paginated. Keys must be unique per row and
/// collections must be sorted descending by this key before paging.
pub trait KeysetRow {
    fn keyset_key(&self) -> (i64, u64);
}

/// Returns one page and, when more rows remain, the cursor of the last
/// row served.
pub fn keyset_page<T: KeysetRow + Clone>(
    rows_desc: &[T],
    cursor: Option<&Cursor>,
    per_page: u32,
) -> (Vec<T>, Option<Cursor>) {
    let start = match cursor {
        Some(c) => {
            let cursor_key = (c.created_at_us, c.id);
            rows_desc
                .iter()
                .position(|r| r.keyset_key() < cursor_key)
                .unwrap_or(rows_desc.len())
        }
        None => 0,
    };

    let end = (start + per_page as usize).min(rows_desc.len());
    let page: Vec<T> = rows_desc[start..end].to_vec();

    let next = if end < rows_desc.len() {
        page.last().map(|r| {
            let (created_at_us, id) = r.keyset_key();
            Cursor { created_at_us, id }
        })
    } else {
        None
    };

    (page, next)
}

/// `Link: <...cursor=...>; rel="next"`. The last page carries no Link
/// header at all, which is how clients detect the end.
pub fn keyset_link(
    base_url: &str,
    query: &[(String, String)],
    cursor: &Cursor,
    per_page: u32,
) -> HeaderValue {
    let mut url = format!(
        "{}?cursor={}&per_page={}",
        base_url,
        urlencoding::encode(&cursor.encode()),
        per_page
    );
    for (k, v) in query {
        url.push_str(&format!("&{}={}", k, urlencoding::encode(v)));
    }
    HeaderValue::from_str(&format!("<{}>; rel=\"next\"", url))
        .unwrap_or_else(|_| HeaderValue::from_static(""))
}

#[derive(Debug, Clone, Copy)]
pub struct OffsetPage {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

impl OffsetPage {
    pub fn total_pages(&self) -> u32 {
        if self.total == 0 {
            1
        } else {
            ((self.total + self.per_page as u64 - 1) / self.per_page as u64) as u32
        }
    }

    pub fn next_page(&self) -> Option<u32> {
        if self.page < self.total_pages() {
            Some(self.page + 1)
        } else {
            None
        }
    }

    pub fn prev_page(&self) -> Option<u32> {
        if self.page > 1 && self.page <= self.total_pages() {
            Some(self.page - 1)
        } else {
            None
        }
    }
}

pub fn offset_page<T: Clone>(rows: &[T], params: &PageParams) -> (Vec<T>, OffsetPage) {
    let page = params.page();
    let per_page = params.per_page();
    let info = OffsetPage {
        page,
        per_page,
        total: rows.len() as u64,
    };
    let start = ((page - 1) as usize).saturating_mul(per_page as usize);
    let end = (start + per_page as usize).min(rows.len());
    let slice = if start >= rows.len() {
        Vec::new()
    } else {
        rows[start..end].to_vec()
    };
    (slice, info)
}

/// The `X-Total`/`X-Page` family plus an RFC 5988 `Link` header.
pub fn offset_headers(
    headers: &mut HeaderMap,
    base_url: &str,
    query: &[(String, String)],
    info: &OffsetPage,
) {
    let set = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(name, v);
        }
    };

    set(headers, "x-total", info.total.to_string());
    set(headers, "x-total-pages", info.total_pages().to_string());
    set(headers, "x-per-page", info.per_page.to_string());
    set(headers, "x-page", info.page.to_string());
    set(
        headers,
        "x-next-page",
        info.next_page().map(|p| p.to_string()).unwrap_or_default(),
    );
    set(
        headers,
        "x-prev-page",
        info.prev_page().map(|p| p.to_string()).unwrap_or_default(),
    );

    let page_url = |page: u32| {
        let mut url = format!("{}?page={}&per_page={}", base_url, page, info.per_page);
        for (k, v) in query {
            url.push_str(&format!("&{}={}", k, urlencoding::encode(v)));
        }
        url
    };

    let mut links = Vec::new();
    if let Some(next) = info.next_page() {
        links.push(format!("<{}>; rel=\"next\"", page_url(next)));
    }
    if let Some(prev) = info.prev_page() {
        links.push(format!("<{}>; rel=\"prev\"", page_url(prev)));
    }
    links.push(format!("<{}>; rel=\"first\"", page_url(1)));
    links.push(format!("<{}>; rel=\"last\"", page_url(info.total_pages())));

    if let Ok(v) = HeaderValue::from_str(&links.join(", ")) {
        headers.insert(LINK, v);
    }
}
