//! Whitespace escaping for card tokens
//!
//! Cards are single lines of space-delimited tokens. Filenames, comments,
//! tag values and similar free text therefore escape whitespace and
//! control characters so a token never splits. The escape alphabet:
//!
//! | escape | byte |
//! |--------|------|
//! | `\\`   | backslash |
//! | `\s`   | space |
//! | `\t`   | tab |
//! | `\n`   | newline |
//! | `\r`   | carriage return |
//! | `\f`   | form feed |
//! | `\v`   | vertical tab |
//! | `\0`   | NUL |

use crate::error::Error;

/// Escape a value into a single wire token.
pub fn escape_token(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{000c}' => out.push_str("\\f"),
            '\u{000b}' => out.push_str("\\v"),
            '\0' => out.push_str("\\0"),
            _ => out.push(ch),
        }
    }
    out
}

/// Reverse [`escape_token`]. Unknown escapes and raw whitespace are errors.
pub fn unescape_token(token: &str) -> Result<String, Error> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('\\') => out.push('\\'),
                Some('s') => out.push(' '),
                Some('t') => out.push('\t'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('f') => out.push('\u{000c}'),
                Some('v') => out.push('\u{000b}'),
                Some('0') => out.push('\0'),
                Some(other) => {
                    return Err(Error::BadEncoding(format!("unknown escape \\{}", other)))
                }
                None => return Err(Error::BadEncoding("dangling backslash".into())),
            },
            c if c.is_ascii_whitespace() => {
                return Err(Error::BadEncoding(format!(
                    "raw whitespace {:?} inside token",
                    c
                )))
            }
            c if (c as u32) < 0x20 => {
                return Err(Error::BadEncoding(format!(
                    "raw control character {:#04x} inside token",
                    c as u32
                )))
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_roundtrip() {
        for value in [
            "plain",
            "two words",
            "tab\there",
            "line\nbreak",
            "back\\slash",
            "mixed \t\n\\ all",
            "",
        ] {
            let token = escape_token(value);
            assert!(!token.contains(' '), "token must not split: {:?}", token);
            assert_eq!(unescape_token(&token).unwrap(), value);
        }
    }

    #[test]
    fn test_unescape_rejects_raw_whitespace() {
        assert!(unescape_token("a b").is_err());
        assert!(unescape_token("a\tb").is_err());
    }

    #[test]
    fn test_unescape_rejects_unknown_escape() {
        assert!(unescape_token("a\\qb").is_err());
        assert!(unescape_token("trailing\\").is_err());
    }
}
