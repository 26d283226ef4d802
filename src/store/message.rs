//! Minimal message parsing for the storage layer.
//!
//! Computes the per-message index fields (sizes, offsets, line count,
//! sent date) and renders the parsed-header cache blob. The blob carries
//! exactly ten fields, in this order: envelope summary, body summary,
//! section map, the cached-header block, then the raw From, To, Cc, Bcc,
//! Subject and References values.

use super::cache_file::append_field;
use super::index_file::MAILBOX_CACHE_MINOR_VERSION;
use crate::store::BIT32_MAX;

/// Longest header name considered for caching.
pub const MAX_CACHED_HEADER_SIZE: usize = 32;

struct CachedHeader {
    name: &'static str,
    /// Cache layout version the header first appeared in.
    min_cache_version: u32,
}

/// Names of the headers we keep in the cache file.
///
/// Changes to this list require bumping the cache version number. Header
/// names longer than [MAX_CACHED_HEADER_SIZE] are never cached
/// regardless.
const CACHE_HEADERS: &[CachedHeader] = &[
    // things we have always cached
    CachedHeader { name: "priority", min_cache_version: 0 },
    CachedHeader { name: "references", min_cache_version: 0 },
    CachedHeader { name: "resent-from", min_cache_version: 0 },
    CachedHeader { name: "newsgroups", min_cache_version: 0 },
    CachedHeader { name: "followup-to", min_cache_version: 0 },
    // x headers that we may want to cache anyway
    CachedHeader { name: "x-mailer", min_cache_version: 1 },
    CachedHeader { name: "x-trace", min_cache_version: 1 },
    // some clients want these
    CachedHeader { name: "x-ref", min_cache_version: 2 },
    CachedHeader { name: "x-priority", min_cache_version: 2 },
    CachedHeader { name: "x-msmail-priority", min_cache_version: 2 },
    CachedHeader { name: "x-msoesrec", min_cache_version: 2 },
    // things to never cache
    CachedHeader { name: "bcc", min_cache_version: BIT32_MAX },
    CachedHeader { name: "cc", min_cache_version: BIT32_MAX },
    CachedHeader { name: "date", min_cache_version: BIT32_MAX },
    CachedHeader { name: "delivery-date", min_cache_version: BIT32_MAX },
    CachedHeader { name: "envelope-to", min_cache_version: BIT32_MAX },
    CachedHeader { name: "from", min_cache_version: BIT32_MAX },
    CachedHeader { name: "in-reply-to", min_cache_version: BIT32_MAX },
    CachedHeader { name: "mime-version", min_cache_version: BIT32_MAX },
    CachedHeader { name: "reply-to", min_cache_version: BIT32_MAX },
    CachedHeader { name: "received", min_cache_version: BIT32_MAX },
    CachedHeader { name: "return-path", min_cache_version: BIT32_MAX },
    CachedHeader { name: "sender", min_cache_version: BIT32_MAX },
    CachedHeader { name: "subject", min_cache_version: BIT32_MAX },
    CachedHeader { name: "to", min_cache_version: BIT32_MAX },
];

fn cached_header_lookup(lowered: &str) -> u32 {
    for entry in CACHE_HEADERS {
        if entry.name == lowered {
            return entry.min_cache_version;
        }
    }
    // don't cache arbitrary X- headers unless listed above
    if lowered.starts_with("x-") {
        return BIT32_MAX;
    }
    // everything else is cached since version 1
    1
}

/// Minimum cache version in which `name` is cached, or [BIT32_MAX] when
/// it never is.
pub fn cached_header_version(name: &str) -> u32 {
    if name.len() >= MAX_CACHED_HEADER_SIZE {
        return BIT32_MAX;
    }
    cached_header_lookup(&name.to_ascii_lowercase())
}

/// Like [cached_header_version], but for a header as it appears in the
/// message text (`Name:` terminated rather than a bare name).
pub fn cached_header_inline(text: &str) -> u32 {
    match text.find(':') {
        Some(colon) if colon < MAX_CACHED_HEADER_SIZE => {
            let name = &text[..colon];
            if name.contains('\r') || name.contains('\n') {
                BIT32_MAX
            } else {
                cached_header_lookup(&name.to_ascii_lowercase())
            }
        }
        _ => BIT32_MAX,
    }
}

/// Index fields and cache blob computed from a raw message.
pub struct ParsedMessage {
    pub size: u32,
    pub header_size: u32,
    pub content_offset: u32,
    pub content_lines: u32,
    /// Parsed sent date, 0 when the Date header is missing or unparsable.
    pub sentdate: u32,
    pub cache_blob: Vec<u8>,
}

struct HeaderLine<'m> {
    lowered_name: String,
    value: String,
    raw: &'m [u8],
}

/// Offset of the first body byte (one past the blank separator line).
/// Messages without a separator are all header.
fn body_offset(data: &[u8]) -> usize {
    let mut pos = 0;
    while pos < data.len() {
        match data[pos..].iter().position(|&b| b == b'\n') {
            Some(nl) => {
                let line_start = pos;
                let line_end = pos + nl;
                let line = &data[line_start..line_end];
                if line.is_empty() || line == &b"\r"[..] {
                    return line_end + 1;
                }
                pos = line_end + 1;
            }
            None => break,
        }
    }
    data.len()
}

fn split_headers(header: &[u8]) -> Vec<HeaderLine> {
    let mut lines = Vec::new();
    let mut pos = 0;
    while pos < header.len() {
        // logical line: physical line plus any continuation lines
        let mut end = pos;
        loop {
            match header[end..].iter().position(|&b| b == b'\n') {
                Some(nl) => {
                    end += nl + 1;
                    match header.get(end).copied() {
                        Some(b' ') | Some(b'\t') => continue,
                        _ => break,
                    }
                }
                None => {
                    end = header.len();
                    break;
                }
            }
        }
        let raw = &header[pos..end];
        pos = end;

        let text = String::from_utf8_lossy(raw);
        if let Some(colon) = text.find(':') {
            let name = text[..colon].trim();
            if name.is_empty() || name.contains(' ') {
                continue;
            }
            let value = text[colon + 1..]
                .replace("\r\n", " ")
                .replace('\n', " ")
                .trim()
                .to_string();
            lines.push(HeaderLine {
                lowered_name: name.to_ascii_lowercase(),
                value,
                raw,
            });
        }
    }
    lines
}

/// Best-effort RFC 822 date parse; returns seconds since the epoch.
///
/// Handles the obsolete named and military zones and trailing comments;
/// dates outside the on-disk timestamp range parse as missing.
pub fn parse_rfc822_date(value: &str) -> Option<u32> {
    let parsed = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let secs = parsed.timestamp();
    if secs < 0 || secs > i64::from(u32::MAX) {
        return None;
    }
    Some(secs as u32)
}

fn header_value<'h>(headers: &'h [HeaderLine], name: &str) -> &'h str {
    headers
        .iter()
        .find(|line| line.lowered_name == name)
        .map(|line| line.value.as_str())
        .unwrap_or("")
}

fn envelope_field(headers: &[HeaderLine]) -> String {
    let quoted = |value: &str| -> String {
        if value.is_empty() {
            "NIL".to_string()
        } else {
            format!("\"{}\"", value.replace('"', "'"))
        }
    };
    format!(
        "({} {} {})",
        quoted(header_value(headers, "date")),
        quoted(header_value(headers, "from")),
        quoted(header_value(headers, "subject")),
    )
}

/// Parse `data` and derive everything the index and cache store about it.
pub fn parse_message(data: &[u8]) -> ParsedMessage {
    let header_size = body_offset(data);
    let body = &data[header_size..];
    let content_lines = body.iter().filter(|&&b| b == b'\n').count() as u32;

    let headers = split_headers(&data[..header_size]);
    let sentdate = parse_rfc822_date(header_value(&headers, "date")).unwrap_or(0);

    let mut cached_block = Vec::new();
    for line in &headers {
        if cached_header_inline(&String::from_utf8_lossy(line.raw)) <= MAILBOX_CACHE_MINOR_VERSION {
            cached_block.extend_from_slice(line.raw);
        }
    }

    let mut blob = Vec::new();
    append_field(&mut blob, envelope_field(&headers).as_bytes());
    append_field(
        &mut blob,
        format!("TEXT {} {}", body.len(), content_lines).as_bytes(),
    );
    append_field(
        &mut blob,
        format!("{} {}", header_size, body.len()).as_bytes(),
    );
    append_field(&mut blob, &cached_block);
    append_field(&mut blob, header_value(&headers, "from").as_bytes());
    append_field(&mut blob, header_value(&headers, "to").as_bytes());
    append_field(&mut blob, header_value(&headers, "cc").as_bytes());
    append_field(&mut blob, header_value(&headers, "bcc").as_bytes());
    append_field(&mut blob, header_value(&headers, "subject").as_bytes());
    append_field(&mut blob, header_value(&headers, "references").as_bytes());

    ParsedMessage {
        size: data.len() as u32,
        header_size: header_size as u32,
        content_offset: header_size as u32,
        content_lines,
        sentdate,
        cache_blob: blob,
    }
}
