use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// The only RSS version accepted by the pipeline
pub const RSS_VERSION: &str = "2.0";

/// Errors produced while decoding a fetched document.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The bytes are not well-formed XML
    #[error("XML parse error: {0}")]
    Xml(String),
    /// Character data could not be decoded with the declared encoding
    #[error("Encoding error: {0}")]
    Encoding(String),
    /// The document is empty or its root element is not `<rss>`
    #[error("Not an RSS document (root element: {0})")]
    NotRss(String),
    /// The `<rss version>` attribute is missing or not "2.0"
    #[error("Not a valid RSS 2.0 feed (version: {0:?})")]
    UnsupportedVersion(String),
    /// A numeric item field holds something other than an integer
    #[error("Invalid integer in <{field}>: {value:?}")]
    InvalidInteger { field: &'static str, value: String },
}

/// Media attached to an item
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enclosure {
    pub url: String,
    pub mime_type: String,
}

/// One `<item>` as found in the document, before normalization.
///
/// Text fields hold the element's character data verbatim (entities
/// unescaped, CDATA unwrapped, whitespace untouched). Absent elements
/// leave the field empty (or zero for the numeric ones).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawItem {
    // Required
    pub title: String,
    pub link: String,
    pub description: String,
    // Optional
    /// `<content:encoded>`
    pub content: String,
    pub pub_date: String,
    pub comments: String,
    pub guid: String,
    pub subject: String,
    /// `<dc:subject>`
    pub dc_subject: String,
    pub creator: String,
    /// `<dc:creator>`
    pub dc_creator: String,
    pub enclosure: Option<Enclosure>,
    pub category: String,
    /// `<hora>`
    pub hour: String,
    /// `<relacionadas>`
    pub related: String,
    /// `<order>`
    pub order: i64,
    /// `<id>`, the source's own identifier
    pub id: i64,
}

/// A decoded RSS 2.0 document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDocument {
    pub version: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: String,
    pub items: Vec<RawItem>,
}

/// Where the parser currently stands relative to `<rss><channel>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Character data belongs to nothing we keep
    Ignored,
    /// Inside a direct child of `<channel>`
    ChannelField,
    /// Inside a direct child of `<item>`
    ItemField,
}

/// Decode an RSS 2.0 document.
///
/// The character encoding comes from the byte order mark or the XML
/// declaration (`<?xml ... encoding="ISO-8859-1"?>`), defaulting to UTF-8.
/// After decoding, every item with non-empty `content:encoded` has its
/// description replaced by that content.
///
/// # Errors
///
/// Returns [`FormatError`] if the XML is malformed, the root is not `<rss>`,
/// the version is not exactly "2.0", or `<id>`/`<order>` is not an integer.
///
/// # Security
///
/// `quick-xml` (0.37) never expands `<!ENTITY>` declarations; unknown
/// entities are reported as [`FormatError::Xml`].
pub fn parse_document(bytes: &[u8]) -> Result<RawDocument, FormatError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();

    // Qualified names of the currently open elements, root first
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut root_seen = false;
    let mut doc = RawDocument::default();
    let mut item: Option<RawItem> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if stack.is_empty() {
                    doc.version = read_root(&e, &reader)?;
                    root_seen = true;
                } else if is_item_start(&stack, e.name().as_ref()) {
                    item = Some(RawItem::default());
                } else if let Some(current) = item.as_mut() {
                    if stack.len() == 3 && e.name().as_ref() == b"enclosure" {
                        current.enclosure = Some(read_enclosure(&e, &reader)?);
                    }
                }
                stack.push(e.name().as_ref().to_vec());
                if scope(&stack) != Scope::Ignored {
                    text.clear();
                }
            }
            Ok(Event::Empty(e)) => {
                if stack.is_empty() {
                    doc.version = read_root(&e, &reader)?;
                    root_seen = true;
                } else if is_item_start(&stack, e.name().as_ref()) {
                    doc.items.push(RawItem::default());
                } else if let Some(current) = item.as_mut() {
                    if stack.len() == 3 && e.name().as_ref() == b"enclosure" {
                        current.enclosure = Some(read_enclosure(&e, &reader)?);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if scope(&stack) != Scope::Ignored {
                    let unescaped = e.unescape().map_err(|e| FormatError::Xml(e.to_string()))?;
                    text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(e)) => {
                if scope(&stack) != Scope::Ignored {
                    let decoded = reader
                        .decoder()
                        .decode(&e.into_inner())
                        .map_err(|e| FormatError::Encoding(e.to_string()))?
                        .into_owned();
                    text.push_str(&decoded);
                }
            }
            Ok(Event::End(_)) => {
                let closing_scope = scope(&stack);
                let Some(name) = stack.pop() else {
                    continue;
                };
                match closing_scope {
                    Scope::ChannelField => {
                        assign_channel_field(&mut doc, &name, std::mem::take(&mut text));
                    }
                    Scope::ItemField => {
                        if let Some(current) = item.as_mut() {
                            assign_item_field(current, &name, std::mem::take(&mut text))?;
                        }
                    }
                    Scope::Ignored => {
                        if stack.len() == 2 && name == b"item" {
                            if let Some(done) = item.take() {
                                doc.items.push(done);
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FormatError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !root_seen {
        return Err(FormatError::NotRss(String::new()));
    }
    if doc.version != RSS_VERSION {
        return Err(FormatError::UnsupportedVersion(doc.version));
    }

    // The richer representation wins
    for item in doc.items.iter_mut() {
        if !item.content.is_empty() {
            item.description = item.content.clone();
        }
    }

    Ok(doc)
}

fn scope(stack: &[Vec<u8>]) -> Scope {
    match stack {
        [root, channel, field] if root == b"rss" && channel == b"channel" && field != b"item" => {
            Scope::ChannelField
        }
        [root, channel, item, _] if root == b"rss" && channel == b"channel" && item == b"item" => {
            Scope::ItemField
        }
        _ => Scope::Ignored,
    }
}

fn is_item_start(stack: &[Vec<u8>], name: &[u8]) -> bool {
    name == b"item" && matches!(stack, [root, channel] if root == b"rss" && channel == b"channel")
}

/// Validate the root element and return its `version` attribute
fn read_root(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<String, FormatError> {
    if e.name().as_ref() != b"rss" {
        return Err(FormatError::NotRss(
            String::from_utf8_lossy(e.name().as_ref()).into_owned(),
        ));
    }
    Ok(read_attribute(e, reader, b"version")?.unwrap_or_default())
}

fn read_enclosure(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Enclosure, FormatError> {
    Ok(Enclosure {
        url: read_attribute(e, reader, b"url")?.unwrap_or_default(),
        mime_type: read_attribute(e, reader, b"type")?.unwrap_or_default(),
    })
}

fn read_attribute(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
    key: &[u8],
) -> Result<Option<String>, FormatError> {
    for attr_result in e.attributes() {
        let attr = attr_result.map_err(|e| FormatError::Xml(e.to_string()))?;
        if attr.key.as_ref() == key {
            let value = attr
                .decode_and_unescape_value(reader.decoder())
                .map_err(|e| FormatError::Xml(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Split `prefix:local` into its parts
fn split_qname(qname: &[u8]) -> (Option<&[u8]>, &[u8]) {
    match qname.iter().position(|&b| b == b':') {
        Some(i) => (Some(&qname[..i]), &qname[i + 1..]),
        None => (None, qname),
    }
}

fn assign_channel_field(doc: &mut RawDocument, qname: &[u8], value: String) {
    match qname {
        b"title" => doc.title = value,
        b"link" => doc.link = value,
        b"description" => doc.description = value,
        b"pubDate" => doc.pub_date = value,
        _ => {}
    }
}

fn assign_item_field(item: &mut RawItem, qname: &[u8], value: String) -> Result<(), FormatError> {
    match split_qname(qname) {
        (None, b"title") => item.title = value,
        (None, b"link") => item.link = value,
        (None, b"description") => item.description = value,
        (_, b"encoded") => item.content = value,
        (None, b"pubDate") => item.pub_date = value,
        (None, b"comments") => item.comments = value,
        (None, b"guid") => item.guid = value,
        (None, b"subject") => item.subject = value,
        (Some(b"dc"), b"subject") => item.dc_subject = value,
        (None, b"creator") => item.creator = value,
        (Some(b"dc"), b"creator") => item.dc_creator = value,
        (None, b"category") => item.category = value,
        (None, b"hora") => item.hour = value,
        (None, b"relacionadas") => item.related = value,
        (None, b"order") => item.order = parse_integer("order", &value)?,
        (None, b"id") => item.id = parse_integer("id", &value)?,
        _ => {}
    }
    Ok(())
}

/// Empty (or blank) text is zero; anything else must be a base-10 integer
fn parse_integer(field: &'static str, value: &str) -> Result<i64, FormatError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse().map_err(|_| FormatError::InvalidInteger {
        field,
        value: value.to_string(),
    })
}
