//! Tag scanning primitives shared by the detector and the parser
//!
//! These work on byte offsets into UTF-8 text. Every offset returned points at an ASCII
//! delimiter, so slicing with it is always on a character boundary.

use std::borrow::Cow;
use tracing::trace;

pub const CDATA_OPEN: &str = "<![CDATA[";
pub const CDATA_CLOSE: &str = "]]>";
const COMMENT_OPEN: &str = "<!--";
const COMMENT_CLOSE: &str = "-->";

/// Result of reading an opening tag at a `<`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagScan<'a> {
    /// The `<` does not start an opening tag
    NotATag,
    /// The text ends before the tag does
    Incomplete {
        /// Name read so far
        name: &'a str,
        /// Whether the name was terminated, so only attributes or `>` are missing
        name_complete: bool,
    },
    Open {
        name: &'a str,
        /// Offset just past the closing `>`
        end: usize,
        self_closing: bool,
    },
}

/// Result of reading a closing tag at a `</`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseScan<'a> {
    /// The `</` is followed by something other than a name and `>`
    NotATag,
    /// The text ends before the tag does
    Incomplete,
    Close {
        name: &'a str,
        /// Offset just past the `>`
        end: usize,
    },
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.' | b':')
}

/// Read the opening tag starting at `at`, which must point at a `<`
pub fn read_open_tag(text: &str, at: usize) -> TagScan<'_> {
    let bytes = text.as_bytes();
    debug_assert_eq!(bytes.get(at), Some(&b'<'));

    let name_start = at + 1;
    match bytes.get(name_start) {
        None => {
            return TagScan::Incomplete {
                name: "",
                name_complete: false,
            }
        }
        Some(&c) if !is_name_start(c) => return TagScan::NotATag,
        Some(_) => {}
    }

    let mut pos = name_start;
    while pos < bytes.len() && is_name_char(bytes[pos]) {
        pos += 1;
    }
    let name = &text[name_start..pos];

    match bytes.get(pos) {
        None => {
            return TagScan::Incomplete {
                name,
                name_complete: false,
            }
        }
        Some(b'>') => {
            return TagScan::Open {
                name,
                end: pos + 1,
                self_closing: false,
            }
        }
        Some(&c) if c == b'/' || c.is_ascii_whitespace() => {}
        Some(_) => return TagScan::NotATag,
    }

    // Attributes: find the closing `>` outside quoted values
    let mut quote: Option<u8> = None;
    while pos < bytes.len() {
        let c = bytes[pos];
        match quote {
            Some(q) if c == q => quote = None,
            // Markup never appears in an attribute value, and a tag does not span lines
            Some(_) if c == b'<' || c == b'\n' => return TagScan::NotATag,
            Some(_) => {}
            None if c == b'"' || c == b'\'' => quote = Some(c),
            None if c == b'<' => return TagScan::NotATag,
            None if c == b'>' => {
                return TagScan::Open {
                    name,
                    end: pos + 1,
                    self_closing: bytes[pos - 1] == b'/',
                }
            }
            None => {}
        }
        pos += 1;
    }

    TagScan::Incomplete {
        name,
        name_complete: true,
    }
}

/// Read the closing tag starting at `at`, which must point at `</`
pub fn read_close_tag(text: &str, at: usize) -> CloseScan<'_> {
    let bytes = text.as_bytes();
    debug_assert!(text[at..].starts_with("</"));

    let name_start = at + 2;
    match bytes.get(name_start) {
        None => return CloseScan::Incomplete,
        Some(&c) if !is_name_start(c) => return CloseScan::NotATag,
        Some(_) => {}
    }

    let mut pos = name_start;
    while pos < bytes.len() && is_name_char(bytes[pos]) {
        pos += 1;
    }
    let name = &text[name_start..pos];
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }

    match bytes.get(pos) {
        None => CloseScan::Incomplete,
        Some(b'>') => CloseScan::Close { name, end: pos + 1 },
        Some(_) => CloseScan::NotATag,
    }
}

/// Find the closing tag balancing an element named `root` whose content starts at `from`.
///
/// Nested elements with exactly the same name are counted; tag-like text inside CDATA sections
/// and comments is ignored. Returns `(content_end, close_end)`, or `None` if the closing tag has
/// not arrived yet.
pub fn find_closing(text: &str, from: usize, root: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut depth = 1usize;
    let mut pos = from;

    while let Some(offset) = text[pos..].find('<') {
        let at = pos + offset;
        let rest = &text[at..];

        if rest.starts_with(CDATA_OPEN) {
            let close = rest.find(CDATA_CLOSE)?;
            pos = at + close + CDATA_CLOSE.len();
            continue;
        }
        if rest.starts_with(COMMENT_OPEN) {
            let close = rest[COMMENT_OPEN.len()..].find(COMMENT_CLOSE)?;
            pos = at + COMMENT_OPEN.len() + close + COMMENT_CLOSE.len();
            continue;
        }

        if bytes.get(at + 1) == Some(&b'/') {
            match read_close_tag(text, at) {
                CloseScan::Close { name, end } => {
                    if name == root {
                        depth -= 1;
                        if depth == 0 {
                            trace!("Closing tag for {} found at {}", root, at);
                            return Some((at, end));
                        }
                    }
                    pos = end;
                }
                CloseScan::Incomplete => return None,
                CloseScan::NotATag => pos = at + 1,
            }
            continue;
        }

        match read_open_tag(text, at) {
            TagScan::Open {
                name,
                end,
                self_closing,
            } => {
                if name == root && !self_closing {
                    depth += 1;
                }
                pos = end;
            }
            // A nested tag that has not finished yet can only delay the match
            TagScan::Incomplete { .. } => return None,
            TagScan::NotATag => pos = at + 1,
        }
    }

    None
}

/// Tag name without its namespace prefix
pub fn local_name(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}

/// Remove CDATA delimiters, keeping their content unchanged
pub fn strip_cdata(text: &str) -> Cow<'_, str> {
    if !text.contains(CDATA_OPEN) {
        return Cow::Borrowed(text);
    }

    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(CDATA_OPEN) {
        result.push_str(&rest[..start]);
        let inner = &rest[start + CDATA_OPEN.len()..];
        match inner.find(CDATA_CLOSE) {
            Some(end) => {
                result.push_str(&inner[..end]);
                rest = &inner[end + CDATA_CLOSE.len()..];
            }
            None => {
                result.push_str(inner);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    Cow::Owned(result)
}

/// Decode HTML character references. Unknown or unterminated references are kept as written.
pub fn html_unescape(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }

    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        result.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];

        let entity_len = after
            .bytes()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == b'#')
            .count();
        let decoded = if after.as_bytes().get(entity_len) == Some(&b';') {
            decode_entity(&after[..entity_len])
        } else {
            None
        };

        match decoded {
            Some(c) => {
                result.push(c);
                rest = &after[entity_len + 1..];
            }
            None => {
                result.push('&');
                rest = after;
            }
        }
    }
    result.push_str(rest);
    Cow::Owned(result)
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{00A0}'),
        _ => {
            let number = entity.strip_prefix('#')?;
            let code_point = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse::<u32>().ok()?,
            };
            char::from_u32(code_point)
        }
    }
}
