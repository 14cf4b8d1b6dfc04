//! Markup fragment parsing for backend state snapshots.
//!
//! The backend serializes its session tree as a tag-per-node,
//! attribute-per-property markup document. A full-state snapshot is one
//! fragment containing the whole tree; an `addedChild` update carries a
//! fragment with exactly one node. Tag and attribute names are normalized
//! to lowercase so the parser is insensitive to the backend's casing.
//!
//! The grammar is deliberately small (elements, quoted attributes,
//! self-closing tags, comments, prolog); the backend never emits text
//! nodes, CDATA or namespaces.

use crate::error::SyncError;

/// One parsed markup element: a node tag, its attributes and child elements.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    /// Lowercased tag name (e.g. "clip", "hardware_device").
    pub tag: String,
    /// Attributes in document order, names lowercased, values unescaped.
    pub attrs: Vec<(String, String)>,
    /// Child elements in document order.
    pub children: Vec<Element>,
}

impl Element {
    /// Look up an attribute value by (lowercase) name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// The mandatory `uuid` attribute, or a malformed-fragment error.
    pub fn uuid(&self) -> Result<&str, SyncError> {
        self.attr("uuid")
            .ok_or_else(|| SyncError::MalformedFragment(format!("<{}> has no uuid", self.tag)))
    }

    /// Find the first descendant (or self) with the given tag name.
    pub fn find(&self, tag: &str) -> Option<&Element> {
        if self.tag == tag {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(tag))
    }
}

/// Parse a fragment and return its root element.
///
/// Leading prolog (`<?xml ...?>`) and comments are skipped. Trailing
/// content after the root element is rejected.
pub fn parse(input: &str) -> Result<Element, SyncError> {
    let mut p = Parser::new(input);
    p.skip_misc();
    let root = p.element()?;
    p.skip_misc();
    if !p.at_end() {
        return Err(SyncError::MalformedFragment(
            "trailing content after root element".into(),
        ));
    }
    Ok(root)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.bytes[self.pos..].starts_with(s.as_bytes())
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    /// Skip whitespace, comments and the XML prolog.
    fn skip_misc(&mut self) {
        loop {
            self.skip_whitespace();
            if self.starts_with("<!--") {
                match find_sub(&self.bytes[self.pos..], b"-->") {
                    Some(off) => self.pos += off + 3,
                    None => {
                        self.pos = self.bytes.len();
                        return;
                    }
                }
            } else if self.starts_with("<?") {
                match find_sub(&self.bytes[self.pos..], b"?>") {
                    Some(off) => self.pos += off + 2,
                    None => {
                        self.pos = self.bytes.len();
                        return;
                    }
                }
            } else {
                return;
            }
        }
    }

    fn error(&self, msg: &str) -> SyncError {
        SyncError::MalformedFragment(format!("{} at byte {}", msg, self.pos))
    }

    fn expect(&mut self, b: u8) -> Result<(), SyncError> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", b as char)))
        }
    }

    fn name(&mut self) -> Result<String, SyncError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'.' || c == b':' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected a name"));
        }
        let raw = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.error("name is not valid UTF-8"))?;
        Ok(raw.to_ascii_lowercase())
    }

    fn element(&mut self) -> Result<Element, SyncError> {
        self.expect(b'<')?;
        let tag = self.name()?;
        let mut attrs = Vec::new();

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'/') => {
                    self.pos += 1;
                    self.expect(b'>')?;
                    return Ok(Element {
                        tag,
                        attrs,
                        children: Vec::new(),
                    });
                }
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let key = self.name()?;
                    self.skip_whitespace();
                    self.expect(b'=')?;
                    self.skip_whitespace();
                    let value = self.quoted_value()?;
                    attrs.push((key, value));
                }
                None => return Err(self.error("unterminated start tag")),
            }
        }

        let mut children = Vec::new();
        loop {
            self.skip_misc();
            if self.starts_with("</") {
                self.pos += 2;
                let close = self.name()?;
                if close != tag {
                    return Err(self.error(&format!("mismatched </{}> for <{}>", close, tag)));
                }
                self.skip_whitespace();
                self.expect(b'>')?;
                return Ok(Element {
                    tag,
                    attrs,
                    children,
                });
            }
            if self.peek() == Some(b'<') {
                children.push(self.element()?);
            } else if self.at_end() {
                return Err(self.error(&format!("unterminated <{}>", tag)));
            } else {
                // The backend never emits text nodes; tolerate and skip.
                self.pos += 1;
            }
        }
    }

    fn quoted_value(&mut self) -> Result<String, SyncError> {
        let quote = match self.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return Err(self.error("expected a quoted attribute value")),
        };
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == quote {
                let raw = std::str::from_utf8(&self.bytes[start..self.pos])
                    .map_err(|_| self.error("attribute value is not valid UTF-8"))?;
                self.pos += 1;
                return Ok(unescape(raw));
            }
            self.pos += 1;
        }
        Err(self.error("unterminated attribute value"))
    }
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Decode the entity references the backend emits in attribute values.
fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let end = match rest.find(';') {
            Some(e) => e,
            None => break,
        };
        match &rest[..=end] {
            "&quot;" => out.push('"'),
            "&apos;" => out.push('\''),
            "&amp;" => out.push('&'),
            "&lt;" => out.push('<'),
            "&gt;" => out.push('>'),
            ent => {
                // Numeric references (&#60; / &#x3C;), anything else verbatim.
                let parsed = ent
                    .strip_prefix("&#x")
                    .or_else(|| ent.strip_prefix("&#X"))
                    .and_then(|h| u32::from_str_radix(&h[..h.len() - 1], 16).ok())
                    .or_else(|| {
                        ent.strip_prefix("&#")
                            .and_then(|d| d[..d.len() - 1].parse::<u32>().ok())
                    })
                    .and_then(char::from_u32);
                match parsed {
                    Some(c) => out.push(c),
                    None => out.push_str(ent),
                }
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_self_closing() {
        let el = parse(r#"<sequence_event uuid="abc" midinote="64"/>"#).unwrap();
        assert_eq!(el.tag, "sequence_event");
        assert_eq!(el.attr("uuid"), Some("abc"));
        assert_eq!(el.attr("midinote"), Some("64"));
        assert!(el.children.is_empty());
    }

    #[test]
    fn test_parse_nested() {
        let el = parse(
            r#"<track uuid="t1" name="Bass">
                 <clip uuid="c1" playing="1"/>
                 <clip uuid="c2" playing="0"/>
               </track>"#,
        )
        .unwrap();
        assert_eq!(el.tag, "track");
        assert_eq!(el.children.len(), 2);
        assert_eq!(el.children[1].attr("uuid"), Some("c2"));
    }

    #[test]
    fn test_tag_and_attr_names_lowercased() {
        let el = parse(r#"<TRACK UUID="t1" Name="Lead"/>"#).unwrap();
        assert_eq!(el.tag, "track");
        assert_eq!(el.attr("uuid"), Some("t1"));
        assert_eq!(el.attr("name"), Some("Lead"));
    }

    #[test]
    fn test_unescape_entities() {
        let el = parse(r#"<track uuid="t" name="Drums &amp; Perc &quot;A&quot; &#60;x&#62;"/>"#)
            .unwrap();
        assert_eq!(el.attr("name"), Some(r#"Drums & Perc "A" <x>"#));
    }

    #[test]
    fn test_skips_prolog_and_comments() {
        let el = parse("<?xml version=\"1.0\"?><!-- snapshot --><state uuid=\"s\"/>").unwrap();
        assert_eq!(el.tag, "state");
    }

    #[test]
    fn test_find_descendant() {
        let el = parse(r#"<state uuid="s"><session uuid="x"><track uuid="t"/></session></state>"#)
            .unwrap();
        assert_eq!(el.find("track").unwrap().attr("uuid"), Some("t"));
        assert!(el.find("clip").is_none());
    }

    #[test]
    fn test_mismatched_close_tag_is_error() {
        assert!(parse(r#"<track uuid="t"></clip>"#).is_err());
    }

    #[test]
    fn test_trailing_content_is_error() {
        assert!(parse(r#"<track uuid="t"/><track uuid="u"/>"#).is_err());
    }

    #[test]
    fn test_missing_uuid_reported() {
        let el = parse(r#"<clip playing="1"/>"#).unwrap();
        assert!(el.uuid().is_err());
    }
}
