//! RSS 2.0 encoding and decoding of a title's feed file.
//!
//! Output is a pure function of the channel description and the entries, so
//! rendering the same entries twice yields identical bytes. `lastBuildDate`
//! is taken from the newest entry rather than the clock for that reason.
//!
//! Free text (titles, links, item descriptions) is written as CDATA; the
//! description carries one `<img>` per media item in document order, which
//! is also where the media list is read back from.

use crate::error::StoreError;
use crate::models::{FeedEntry, MediaItem};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use quick_xml::escape::{escape, resolve_predefined_entity, unescape};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use scraper::{Html, Selector};

static IMG_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("img[src]").expect("valid selector"));

/// Channel-level metadata for one title's feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub title: String,
    pub link: String,
    pub description: String,
}

fn text_element(w: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), StoreError> {
    w.write_event(Event::Start(BytesStart::new(name)))?;
    w.write_event(Event::Text(BytesText::new(text)))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn cdata_element(w: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), StoreError> {
    w.write_event(Event::Start(BytesStart::new(name)))?;
    w.write_event(Event::CData(BytesCData::new(text)))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// The item description: one `<img>` per media item, in order.
pub fn describe_media(alt: &str, media: &[MediaItem]) -> String {
    let alt = escape(alt);
    media
        .iter()
        .map(|m| format!(r#"<p><img src="{}" alt="{}"/></p>"#, escape(m.url.as_str()), alt))
        .collect()
}

/// Render a complete RSS 2.0 document. Entries are written in the given order.
pub fn render(channel: &Channel, entries: &[FeedEntry]) -> Result<Vec<u8>, StoreError> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    w.write_event(Event::Start(BytesStart::new("rss").with_attributes([("version", "2.0")])))?;
    w.write_event(Event::Start(BytesStart::new("channel")))?;

    cdata_element(&mut w, "title", &channel.title)?;
    cdata_element(&mut w, "link", &channel.link)?;
    cdata_element(&mut w, "description", &channel.description)?;
    if let Some(newest) = entries.iter().map(|e| e.published).max() {
        text_element(&mut w, "lastBuildDate", &newest.to_rfc2822())?;
    }

    for entry in entries {
        w.write_event(Event::Start(BytesStart::new("item")))?;
        cdata_element(&mut w, "title", &entry.title)?;
        cdata_element(&mut w, "link", &entry.link)?;
        cdata_element(&mut w, "description", &describe_media(&entry.title, &entry.media))?;
        w.write_event(Event::Start(
            BytesStart::new("guid").with_attributes([("isPermaLink", "false")]),
        ))?;
        w.write_event(Event::Text(BytesText::new(&entry.identifier)))?;
        w.write_event(Event::End(BytesEnd::new("guid")))?;
        text_element(&mut w, "pubDate", &entry.published.to_rfc2822())?;
        for category in &entry.categories {
            text_element(&mut w, "category", category)?;
        }
        w.write_event(Event::End(BytesEnd::new("item")))?;
    }

    w.write_event(Event::End(BytesEnd::new("channel")))?;
    w.write_event(Event::End(BytesEnd::new("rss")))?;
    let mut bytes = w.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

#[derive(Default)]
struct PartialItem {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    guid: Option<String>,
    pub_date: Option<String>,
    categories: Vec<String>,
}

impl PartialItem {
    fn finish(self, slug: &str) -> Result<FeedEntry, StoreError> {
        let identifier = self
            .guid
            .ok_or_else(|| StoreError::Xml("item without guid".to_string()))?;
        let raw_date = self
            .pub_date
            .ok_or_else(|| StoreError::Xml(format!("item {identifier} without pubDate")))?;
        let published = DateTime::parse_from_rfc2822(&raw_date)
            .map_err(|e| StoreError::Xml(format!("item {identifier}: bad pubDate {raw_date:?}: {e}")))?
            .with_timezone(&Utc);
        let media = self
            .description
            .as_deref()
            .map(media_from_description)
            .unwrap_or_default();
        Ok(FeedEntry {
            slug: slug.to_string(),
            title: self.title.unwrap_or_default(),
            date: published.date_naive(),
            link: self.link.unwrap_or_default(),
            media,
            identifier,
            published,
            categories: self.categories,
        })
    }
}

fn media_from_description(html: &str) -> Vec<MediaItem> {
    let fragment = Html::parse_fragment(html);
    fragment
        .select(&IMG_SELECTOR)
        .filter_map(|img| img.value().attr("src"))
        .enumerate()
        .map(|(order, url)| MediaItem {
            url: url.to_string(),
            order,
        })
        .collect()
}

/// Parse a feed document written by [`render`] back into entries.
///
/// # Errors
///
/// Returns [`StoreError::Xml`] when the document is not well-formed, has no
/// `<rss>` root, or contains an item without a `guid` or a valid `pubDate`.
pub fn parse(xml: &str, slug: &str) -> Result<Vec<FeedEntry>, StoreError> {
    // Text is not trimmed per event: the text around an entity reference
    // arrives in separate events. Whole values are trimmed instead.
    let mut reader = Reader::from_str(xml);

    let mut entries = Vec::new();
    let mut item: Option<PartialItem> = None;
    let mut text = String::new();
    let mut opened_rss = false;
    let mut closed_rss = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                match e.name().as_ref() {
                    b"rss" => opened_rss = true,
                    b"item" => item = Some(PartialItem::default()),
                    _ => {}
                }
                text.clear();
            }
            Event::Text(t) => {
                let raw = String::from_utf8_lossy(&t);
                let value = unescape(&raw).map_err(|e| StoreError::Xml(e.to_string()))?;
                text.push_str(&value);
            }
            Event::GeneralRef(r) => {
                let name = r.decode().map_err(|e| StoreError::Xml(e.to_string()))?;
                if let Some(ch) = r.resolve_char_ref().map_err(|e| StoreError::Xml(e.to_string()))? {
                    text.push(ch);
                } else if let Some(resolved) = resolve_predefined_entity(&name) {
                    text.push_str(resolved);
                } else {
                    return Err(StoreError::Xml(format!("unknown entity &{name};")));
                }
            }
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            Event::End(e) => {
                let value = std::mem::take(&mut text).trim().to_string();
                let name = e.name();
                match name.as_ref() {
                    b"rss" => closed_rss = true,
                    b"item" => {
                        if let Some(done) = item.take() {
                            entries.push(done.finish(slug)?);
                        }
                    }
                    field => {
                        if let Some(it) = item.as_mut() {
                            match field {
                                b"title" => it.title = Some(value),
                                b"link" => it.link = Some(value),
                                b"description" => it.description = Some(value),
                                b"guid" => it.guid = Some(value),
                                b"pubDate" => it.pub_date = Some(value),
                                b"category" => it.categories.push(value),
                                _ => {}
                            }
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !opened_rss || !closed_rss || item.is_some() {
        return Err(StoreError::Xml("truncated or non-RSS document".to_string()));
    }
    Ok(entries)
}
