//! Raw item → canonical item mapping.
//!
//! Pure: no I/O, no logging. A link that fails to parse as an absolute URL is
//! reported back to the caller as a warning alongside the finished item.

use percent_encoding::percent_decode_str;
use url::Url;

use crate::feed::parser::RawItem;
use crate::storage::CanonicalItem;

/// A normalized item plus any recoverable problem found along the way
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub item: CanonicalItem,
    /// Set when the link could not be parsed; the slug then comes from the raw link text
    pub link_error: Option<url::ParseError>,
}

/// Map a raw item of feed `feed_id` to its canonical form.
///
/// Field rules:
/// - content: `content:encoded` if non-empty, else description
/// - subject: trimmed `subject`, else trimmed `dc:subject`
/// - creator: `creator` if non-empty, else `dc:creator`
/// - description, content, creator: HTML-escaped
/// - image_url: enclosure URL only for `image/*` MIME types
/// - slug: link path without its leading `/`
/// - title, link, publish date, category, hour, related: trimmed
pub fn normalize_item(feed_id: i64, raw: &RawItem) -> Normalized {
    let content = if raw.content.is_empty() {
        &raw.description
    } else {
        &raw.content
    };

    let subject = match raw.subject.trim() {
        "" => raw.dc_subject.trim(),
        subject => subject,
    };

    let creator = if raw.creator.is_empty() {
        &raw.dc_creator
    } else {
        &raw.creator
    };

    let link = raw.link.trim();
    let (slug, link_error) = slug_from_link(link);

    let item = CanonicalItem {
        external_id: raw.id,
        feed_id,
        title: raw.title.trim().to_string(),
        description: htmlescape::encode_minimal(&raw.description),
        link: link.to_string(),
        publish_date: raw.pub_date.trim().to_string(),
        content: htmlescape::encode_minimal(content),
        creator: htmlescape::encode_minimal(creator),
        image_url: image_url(raw),
        category: raw.category.trim().to_string(),
        subject: subject.to_string(),
        hour: raw.hour.trim().to_string(),
        related: raw.related.trim().to_string(),
        slug,
        display_order: raw.order,
        active: true,
    };

    Normalized { item, link_error }
}

fn image_url(raw: &RawItem) -> String {
    match &raw.enclosure {
        Some(enclosure) if primary_mime_type(&enclosure.mime_type) == "image" => {
            enclosure.url.clone()
        }
        _ => String::new(),
    }
}

/// Text before the first `/` of a MIME type (`image/png` → `image`)
fn primary_mime_type(mime_type: &str) -> &str {
    mime_type.split('/').next().unwrap_or_default()
}

/// Derive the slug from a trimmed link.
///
/// Parsed links use their percent-decoded path. Unparseable ones (relative
/// links, garbage) fall back to the raw text up to the first `?` or `#`,
/// decoded the same way.
fn slug_from_link(link: &str) -> (String, Option<url::ParseError>) {
    match Url::parse(link) {
        Ok(url) => (decoded_slug(url.path()), None),
        Err(e) => {
            let raw_path = link.split(['?', '#']).next().unwrap_or_default();
            (decoded_slug(raw_path), Some(e))
        }
    }
}

/// Percent-decode a path and drop its leading `/`.
/// Invalid UTF-8 sequences become U+FFFD.
fn decoded_slug(path: &str) -> String {
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    decoded.strip_prefix('/').unwrap_or(&decoded).to_string()
}
