//! Strict tokenizer for one line of game markup.
//!
//! A line is tokenized completely before any state is touched, so a
//! malformed line never leaves the snapshot half-updated. Entities in text
//! and attribute values are decoded here.

use thiserror::Error;

/// A single markup token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `<name a="b">` or `<name/>`.
    Start {
        /// Tag name.
        name: String,
        /// Attributes in source order, values entity-decoded.
        attrs: Vec<(String, String)>,
        /// True for `<name/>`.
        self_closing: bool,
    },
    /// `</name>`.
    End {
        /// Tag name.
        name: String,
    },
    /// Decoded text between tags.
    Text(String),
}

impl Token {
    /// Attribute value on a start token.
    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&str> {
        match self {
            Token::Start { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

/// Why a line failed to tokenize.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A `<` with no closing `>` before end of line.
    #[error("unterminated tag at byte {0}")]
    UnterminatedTag(usize),
    /// `<` followed by something that is not a tag name.
    #[error("missing tag name at byte {0}")]
    MissingName(usize),
    /// Attribute syntax broken (missing `=`, unquoted value, stray quote).
    #[error("malformed attribute at byte {0}")]
    BadAttribute(usize),
    /// A bare `&` that does not start a known entity.
    #[error("unescaped ampersand at byte {0}")]
    BareAmpersand(usize),
    /// A literal `<` inside an attribute value.
    #[error("'<' inside attribute value at byte {0}")]
    AngleInAttribute(usize),
}

/// Tokenize a full line.
pub fn tokenize(line: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = line.as_bytes();
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'<' => {
                if !text.is_empty() {
                    tokens.push(Token::Text(std::mem::take(&mut text)));
                }
                if line[i..].starts_with("<!--") {
                    let end = line[i..]
                        .find("-->")
                        .ok_or(ParseError::UnterminatedTag(i))?;
                    i += end + 3;
                    continue;
                }
                let (token, next) = read_tag(line, i)?;
                if let Some(token) = token {
                    tokens.push(token);
                }
                i = next;
            }
            b'&' => {
                let (decoded, len) = decode_entity(&line[i..]).ok_or(ParseError::BareAmpersand(i))?;
                text.push(decoded);
                i += len;
            }
            _ => {
                let next = next_special(bytes, i);
                text.push_str(&line[i..next]);
                i = next;
            }
        }
    }
    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }
    Ok(tokens)
}

fn next_special(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|&b| b == b'<' || b == b'&')
        .map_or(bytes.len(), |p| from + p)
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':')
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn read_name(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && is_name_char(bytes[i]) {
        i += 1;
    }
    i
}

/// Read one tag starting at `open` (which points at `<`).
///
/// Processing instructions (`<?...?>`) yield no token.
fn read_tag(line: &str, open: usize) -> Result<(Option<Token>, usize), ParseError> {
    let bytes = line.as_bytes();
    let mut i = open + 1;
    if i >= bytes.len() {
        return Err(ParseError::UnterminatedTag(open));
    }

    if bytes[i] == b'?' {
        let end = line[i..].find('>').ok_or(ParseError::UnterminatedTag(open))?;
        return Ok((None, i + end + 1));
    }

    if bytes[i] == b'/' {
        i += 1;
        if i >= bytes.len() || !is_name_start(bytes[i]) {
            return Err(ParseError::MissingName(open));
        }
        let name_end = read_name(bytes, i);
        let name = line[i..name_end].to_string();
        let j = skip_ws(bytes, name_end);
        if j >= bytes.len() {
            return Err(ParseError::UnterminatedTag(open));
        }
        if bytes[j] != b'>' {
            return Err(ParseError::BadAttribute(j));
        }
        return Ok((Some(Token::End { name }), j + 1));
    }

    if !is_name_start(bytes[i]) {
        return Err(ParseError::MissingName(open));
    }
    let name_end = read_name(bytes, i);
    let name = line[i..name_end].to_string();
    let mut attrs = Vec::new();
    i = name_end;

    loop {
        let ws_start = i;
        i = skip_ws(bytes, i);
        if i >= bytes.len() {
            return Err(ParseError::UnterminatedTag(open));
        }
        match bytes[i] {
            b'>' => {
                let token = Token::Start {
                    name,
                    attrs,
                    self_closing: false,
                };
                return Ok((Some(token), i + 1));
            }
            b'/' => {
                if bytes.get(i + 1) == Some(&b'>') {
                    let token = Token::Start {
                        name,
                        attrs,
                        self_closing: true,
                    };
                    return Ok((Some(token), i + 2));
                }
                return Err(ParseError::BadAttribute(i));
            }
            b if is_name_start(b) => {
                // Attributes must be separated from what precedes them.
                if i == ws_start {
                    return Err(ParseError::BadAttribute(i));
                }
                let key_end = read_name(bytes, i);
                let key = line[i..key_end].to_string();
                let mut j = skip_ws(bytes, key_end);
                if j >= bytes.len() {
                    return Err(ParseError::UnterminatedTag(open));
                }
                if bytes[j] != b'=' {
                    // Valueless attribute, e.g. `<d cmd>`.
                    attrs.push((key, String::new()));
                    i = key_end;
                    continue;
                }
                j = skip_ws(bytes, j + 1);
                let (value, after) = read_value(line, j, open)?;
                attrs.push((key, value));
                i = after;
            }
            _ => return Err(ParseError::BadAttribute(i)),
        }
    }
}

/// Read a quoted attribute value starting at the opening quote.
fn read_value(line: &str, start: usize, open: usize) -> Result<(String, usize), ParseError> {
    let bytes = line.as_bytes();
    let quote = match bytes.get(start) {
        Some(&q @ (b'"' | b'\'')) => q,
        Some(_) => return Err(ParseError::BadAttribute(start)),
        None => return Err(ParseError::UnterminatedTag(open)),
    };
    let mut value = String::new();
    let mut i = start + 1;
    loop {
        let Some(&b) = bytes.get(i) else {
            return Err(ParseError::UnterminatedTag(open));
        };
        if b == quote {
            i += 1;
            break;
        }
        match b {
            b'<' => return Err(ParseError::AngleInAttribute(i)),
            b'&' => {
                let (decoded, len) =
                    decode_entity(&line[i..]).ok_or(ParseError::BareAmpersand(i))?;
                value.push(decoded);
                i += len;
            }
            _ => {
                let run_end = bytes[i..]
                    .iter()
                    .position(|&c| c == quote || c == b'<' || c == b'&')
                    .map_or(bytes.len(), |p| i + p);
                value.push_str(&line[i..run_end]);
                i = run_end;
            }
        }
    }
    // A closing quote must be followed by whitespace or the end of the tag;
    // anything else means a quote nested inside the value.
    match bytes.get(i) {
        Some(b) if b.is_ascii_whitespace() || *b == b'>' || *b == b'/' => Ok((value, i)),
        Some(_) => Err(ParseError::BadAttribute(i)),
        None => Err(ParseError::UnterminatedTag(open)),
    }
}

/// Decode the entity at the start of `s` (which begins with `&`).
///
/// Returns the character and the number of bytes consumed.
pub(crate) fn decode_entity(s: &str) -> Option<(char, usize)> {
    let end = s[1..].find(';').map(|p| p + 1)?;
    if end > 10 {
        return None;
    }
    let body = &s[1..end];
    let ch = match body {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        _ => {
            let num = body.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)?
        }
    };
    Some((ch, end + 1))
}

/// Strip all tags from a line and decode entities, leniently.
///
/// Used for display text and as the fallback when a line cannot be parsed.
#[must_use]
pub fn strip_markup(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_tag = false;
    let mut quote: Option<char> = None;
    let mut rest = line;
    while let Some(c) = rest.chars().next() {
        let mut advance = c.len_utf8();
        if in_tag {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"' | '\'') => quote = Some(c),
                (None, '>') => in_tag = false,
                _ => {}
            }
        } else if c == '<' {
            in_tag = true;
        } else if c == '&' {
            match decode_entity(rest) {
                Some((ch, len)) => {
                    out.push(ch);
                    advance = len;
                }
                None => out.push('&'),
            }
        } else {
            out.push(c);
        }
        rest = &rest[advance..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(name: &str, attrs: &[(&str, &str)], self_closing: bool) -> Token {
        Token::Start {
            name: name.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            self_closing,
        }
    }

    #[test]
    fn test_text_and_tags() {
        let tokens = tokenize(r#"<pushBold/>A kobold<popBold/> arrives &amp; <a exist="12" noun="kobold">waves</a>."#).unwrap();
        assert_eq!(
            tokens,
            vec![
                start("pushBold", &[], true),
                Token::Text("A kobold".into()),
                start("popBold", &[], true),
                Token::Text(" arrives & ".into()),
                start("a", &[("exist", "12"), ("noun", "kobold")], false),
                Token::Text("waves".into()),
                Token::End { name: "a".into() },
                Token::Text(".".into()),
            ]
        );
    }

    #[test]
    fn test_single_quotes_and_entities_in_values() {
        let tokens = tokenize("<progressBar id='mana' text='mana &lt;30&gt;'/>").unwrap();
        assert_eq!(tokens[0].attr("text"), Some("mana <30>"));
        assert_eq!(tokens[0].attr("id"), Some("mana"));
    }

    #[test]
    fn test_valueless_attribute() {
        let tokens = tokenize("<d cmd>look</d>").unwrap();
        assert_eq!(tokens[0].attr("cmd"), Some(""));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(tokenize("<prompt time=\"1\""), Err(ParseError::UnterminatedTag(_))));
        assert!(matches!(tokenize("salt & pepper"), Err(ParseError::BareAmpersand(5))));
        assert!(matches!(
            tokenize(r#"<a text="say "hi" now">x</a>"#),
            Err(ParseError::BadAttribute(_))
        ));
        assert!(matches!(
            tokenize(r#"<a text="1 < 2">x</a>"#),
            Err(ParseError::AngleInAttribute(_))
        ));
        assert!(matches!(tokenize("< oops"), Err(ParseError::MissingName(_))));
    }

    #[test]
    fn test_comments_and_declarations_are_skipped() {
        let tokens = tokenize("<?xml version='1.0'?><!-- hi -->text").unwrap();
        assert_eq!(tokens, vec![Token::Text("text".into())]);
    }

    #[test]
    fn test_numeric_entities() {
        assert_eq!(decode_entity("&#65;rest"), Some(('A', 5)));
        assert_eq!(decode_entity("&#x42;"), Some(('B', 6)));
        assert_eq!(decode_entity("& x;"), None);
        assert_eq!(decode_entity("&bogus;"), None);
    }

    #[test]
    fn test_strip_markup() {
        assert_eq!(
            strip_markup(r#"<style id="roomName"/>[Town Square]<style id=""/> &lt;b&gt; & co"#),
            "[Town Square] <b> & co"
        );
        assert_eq!(strip_markup(r#"<a text="x>y">link</a>"#), "link");
    }
}
