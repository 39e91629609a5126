//! Header translation between HTTP/1.1 and HTTP/2.
//!
//! Everything here is a pure function over ordered header lists so the rules can be
//! checked without sockets. HTTP/2 header lists carry their pseudo-headers (`:method`,
//! `:scheme`, `:authority`, `:path`, `:status`) inline, first, as they appear on the wire.

use http::{HeaderMap, HeaderName, HeaderValue};
use indexmap::IndexMap;

use crate::error::TranslationError;

/// Ordered `(name, value)` pairs. Names keep whatever case the peer sent.
pub type HeaderList = Vec<(String, String)>;

/// Connection-specific fields that must never cross into HTTP/2.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// An HTTP/1.1 request line plus header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H1RequestHead {
    pub method: String,
    /// Origin-form path, absolute-form URI, or `host:port` for CONNECT.
    pub target: String,
    pub headers: HeaderList,
}

/// An HTTP/1.1 status line plus header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H1ResponseHead {
    pub status: u16,
    pub headers: HeaderList,
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Separator used when folding repeated fields into one line.
pub fn join_separator(name: &str) -> &'static str {
    if name.eq_ignore_ascii_case("cookie") {
        "; "
    } else {
        ", "
    }
}

/// Fields whose values cannot be comma-joined and must stay as separate lines.
fn never_merged(name: &str) -> bool {
    name.eq_ignore_ascii_case("set-cookie")
}

/// Folds same-name fields (compared case-insensitively) into one lower-cased entry,
/// keeping the position of each name's first occurrence.
pub fn merge_repeated(headers: &[(String, String)]) -> HeaderList {
    let mut merged: IndexMap<String, Vec<&str>> = IndexMap::new();
    let mut unmerged: Vec<(usize, String, String)> = Vec::new();

    for (name, value) in headers {
        let key = name.to_ascii_lowercase();
        if never_merged(&key) {
            unmerged.push((merged.len() + unmerged.len(), key, value.clone()));
            continue;
        }
        merged.entry(key).or_default().push(value.as_str());
    }

    let mut out: HeaderList = merged
        .into_iter()
        .map(|(name, values)| {
            let joined = values.join(join_separator(&name));
            (name, joined)
        })
        .collect();
    for (position, name, value) in unmerged {
        out.insert(position.min(out.len()), (name, value));
    }
    out
}

fn split_pseudo(
    headers: &[(String, String)],
) -> Result<(IndexMap<String, String>, Vec<(String, String)>), TranslationError> {
    let mut pseudo = IndexMap::new();
    let mut regular = Vec::new();
    for (name, value) in headers {
        if let Some(stripped) = name.strip_prefix(':') {
            let key = format!(":{}", stripped.to_ascii_lowercase());
            if pseudo.insert(key.clone(), value.clone()).is_some() {
                return Err(TranslationError::InvalidHeader(format!(
                    "duplicate pseudo header {}",
                    key
                )));
            }
        } else {
            regular.push((name.clone(), value.clone()));
        }
    }
    Ok((pseudo, regular))
}

fn named_in_connection(headers: &[(String, String)]) -> Vec<String> {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Lower-cases names and drops every field that only describes the HTTP/1.1 leg.
fn strip_for_h2(headers: &[(String, String)]) -> HeaderList {
    let listed = named_in_connection(headers);
    let kept: HeaderList = headers
        .iter()
        .filter(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            if is_hop_by_hop(&lower) || listed.contains(&lower) {
                return false;
            }
            match lower.as_str() {
                "host" | "http2-settings" => false,
                "te" => value.trim().eq_ignore_ascii_case("trailers"),
                _ => true,
            }
        })
        .cloned()
        .collect();
    merge_repeated(&kept)
}

/// HTTP/2 request → HTTP/1.1 request head.
pub fn h2_request_to_h1(headers: &[(String, String)]) -> Result<H1RequestHead, TranslationError> {
    let (pseudo, regular) = split_pseudo(headers)?;
    let method = pseudo
        .get(":method")
        .cloned()
        .ok_or(TranslationError::MissingPseudoHeader(":method"))?;

    let authority = pseudo
        .get(":authority")
        .filter(|a| !a.is_empty())
        .cloned()
        .or_else(|| {
            regular
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("host"))
                .map(|(_, value)| value.clone())
        })
        .ok_or(TranslationError::MissingAuthority)?;

    let target = if method.eq_ignore_ascii_case("CONNECT") {
        authority.clone()
    } else {
        pseudo
            .get(":path")
            .cloned()
            .ok_or(TranslationError::MissingPseudoHeader(":path"))?
    };

    let body_headers: HeaderList = regular
        .into_iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("host")
                && !name.eq_ignore_ascii_case("connection")
                && !name.eq_ignore_ascii_case("keep-alive")
        })
        .collect();

    let mut out = vec![("host".to_string(), authority)];
    out.extend(merge_repeated(&body_headers));
    out.push(("connection".to_string(), "keep-alive".to_string()));

    Ok(H1RequestHead {
        method,
        target,
        headers: out,
    })
}

/// HTTP/2 response → HTTP/1.1 response head.
pub fn h2_response_to_h1(headers: &[(String, String)]) -> Result<H1ResponseHead, TranslationError> {
    let (pseudo, regular) = split_pseudo(headers)?;
    let status = pseudo
        .get(":status")
        .ok_or(TranslationError::MissingPseudoHeader(":status"))?;
    let status = parse_status(status)?;
    Ok(H1ResponseHead {
        status,
        headers: merge_repeated(&regular),
    })
}

/// HTTP/1.1 request head → HTTP/2 header list, pseudo-headers first.
pub fn h1_request_to_h2(head: &H1RequestHead, scheme: &str) -> Result<HeaderList, TranslationError> {
    let is_connect = head.method.eq_ignore_ascii_case("CONNECT");
    let absolute = if is_connect {
        None
    } else {
        head.target.parse::<http::Uri>().ok().filter(|uri| uri.authority().is_some())
    };

    let host_header = head
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.clone());

    let authority = if is_connect {
        Some(head.target.clone())
    } else {
        absolute
            .as_ref()
            .and_then(|uri| uri.authority().map(|a| a.to_string()))
            .or(host_header)
    }
    .filter(|a| !a.is_empty())
    .ok_or(TranslationError::MissingAuthority)?;

    let mut out = vec![(":method".to_string(), head.method.clone())];
    if !is_connect {
        let scheme = absolute
            .as_ref()
            .and_then(|uri| uri.scheme_str())
            .unwrap_or(scheme);
        out.push((":scheme".to_string(), scheme.to_string()));
    }
    out.push((":authority".to_string(), authority));
    if !is_connect {
        let path = match &absolute {
            Some(uri) => uri
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            None => head.target.clone(),
        };
        out.push((":path".to_string(), path));
    }
    out.extend(strip_for_h2(&head.headers));
    Ok(out)
}

/// HTTP/1.1 response head → HTTP/2 header list with `:status` first.
pub fn h1_response_to_h2(head: &H1ResponseHead) -> HeaderList {
    let mut out = vec![(":status".to_string(), head.status.to_string())];
    out.extend(strip_for_h2(&head.headers));
    out
}

pub fn parse_status(value: &str) -> Result<u16, TranslationError> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|code| (100..1000).contains(code))
        .ok_or_else(|| TranslationError::InvalidStatus(value.to_string()))
}

/// Snapshot of a `HeaderMap` in iteration order.
pub fn header_list(map: &HeaderMap) -> HeaderList {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Builds a `HeaderMap` from a list, skipping pseudo-headers.
pub fn to_header_map(headers: &[(String, String)]) -> Result<HeaderMap, TranslationError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter().filter(|(name, _)| !name.starts_with(':')) {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TranslationError::InvalidHeader(name.clone()))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| TranslationError::InvalidHeader(format!("{}: {}", name, value)))?;
        map.append(header_name, header_value);
    }
    Ok(map)
}

pub fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
