//! Escaping passes applied to a line that failed to tokenize.
//!
//! Repairs are cumulative: attempt `n` applies the first `n` passes in order.
//! Each pass is a no-op on well-formed input.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// `&` that does not begin a named or numeric entity.
static BARE_AMPERSAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:[A-Za-z]+;|#[0-9]+;|#[xX][0-9A-Fa-f]+;)?").expect("valid regex")
});

/// Apply the first `attempt` repair passes to `line`.
#[must_use]
pub fn repair(line: &str, attempt: usize) -> String {
    let mut out = line.to_string();
    if attempt >= 1 {
        out = escape_bare_ampersands(&out).into_owned();
    }
    if attempt >= 2 {
        out = escape_attribute_values(&out, true, false);
    }
    if attempt >= 3 {
        out = escape_attribute_values(&out, true, true);
    }
    out
}

/// Replace every `&` that is not already an entity with `&amp;`.
#[must_use]
pub fn escape_bare_ampersands(line: &str) -> Cow<'_, str> {
    BARE_AMPERSAND.replace_all(line, |caps: &regex::Captures<'_>| {
        let m = &caps[0];
        if m.len() == 1 {
            "&amp;".to_string()
        } else {
            m.to_string()
        }
    })
}

/// Walk tags and rewrite attribute values.
///
/// With `quotes`, a quote character inside a value that is not followed by
/// the end of the value (whitespace plus another attribute, or the end of
/// the tag) is escaped. With `angles`, `<` and `>` inside values are escaped.
fn escape_attribute_values(line: &str, quotes: bool, angles: bool) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Text,
        Tag,
        Value(char),
    }

    let mut out = String::with_capacity(line.len() + 16);
    let mut mode = Mode::Text;
    let mut prev_eq = false;

    for (idx, c) in line.char_indices() {
        match mode {
            Mode::Text => {
                if c == '<' {
                    mode = Mode::Tag;
                }
                out.push(c);
            }
            Mode::Tag => {
                match c {
                    '>' => mode = Mode::Text,
                    '"' | '\'' if prev_eq => mode = Mode::Value(c),
                    _ => {}
                }
                if !c.is_whitespace() {
                    prev_eq = c == '=';
                }
                out.push(c);
            }
            Mode::Value(q) => {
                if c == q {
                    if !quotes || closes_value(&line[idx + 1..]) {
                        mode = Mode::Tag;
                        prev_eq = false;
                        out.push(c);
                    } else {
                        out.push_str(if q == '"' { "&quot;" } else { "&apos;" });
                    }
                } else if angles && c == '<' {
                    out.push_str("&lt;");
                } else if angles && c == '>' {
                    out.push_str("&gt;");
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}

/// Does `rest` (the text after a quote) look like the end of a value?
fn closes_value(rest: &str) -> bool {
    let trimmed = rest.trim_start();
    if trimmed.starts_with('>') || trimmed.starts_with("/>") || trimmed.is_empty() {
        return true;
    }
    if trimmed.len() == rest.len() {
        // No whitespace separating the next attribute.
        return false;
    }
    let name_len = trimmed
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':'))
        .count();
    name_len > 0 && trimmed[name_len..].trim_start().starts_with('=')
}
