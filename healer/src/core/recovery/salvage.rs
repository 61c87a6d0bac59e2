//! Tolerant extraction of a single string field from malformed JSON text.
//!
//! Model output is length-bounded and is often cut off in the middle of the
//! largest field. Salvage locates `"<field>": "` and captures everything up to
//! the next unescaped quote, or to the end of input when the closing quote was
//! never written, then reverses JSON escape sequences.

use regex::Regex;

/// Extract the string value of `field`. Returns `None` if the field's opening
/// token is missing or the value is blank after trimming.
pub fn salvage_string_field(text: &str, field: &str) -> Option<String> {
    let pattern = format!(r#""{}"\s*:\s*""#, regex::escape(field));
    let opening = Regex::new(&pattern).ok()?.find(text)?;
    let body = &text[opening.end()..];

    let mut escaped = false;
    let mut end = body.len();
    for (idx, ch) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => {
                end = idx;
                break;
            }
            _ => {}
        }
    }

    let value = unescape(&body[..end]);
    if value.trim().is_empty() {
        return None;
    }
    Some(value)
}

/// Reverse JSON string escapes. A dangling backslash or a cut-off `\u` escape
/// at the end of input is dropped.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let Some(next) = chars.next() else {
            break;
        };
        match next {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            '/' => out.push('/'),
            'u' => {
                let Some(high) = read_hex4(&mut chars) else {
                    break;
                };
                if (0xD800..0xDC00).contains(&high) {
                    // Surrogate pair: expect `\uDC00..\uDFFF` next.
                    let mut lookahead = chars.clone();
                    if lookahead.next() == Some('\\')
                        && lookahead.next() == Some('u')
                        && let Some(low) = read_hex4(&mut lookahead)
                        && (0xDC00..0xE000).contains(&low)
                    {
                        chars = lookahead;
                        let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                        out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                    } else {
                        out.push('\u{FFFD}');
                    }
                } else {
                    out.push(char::from_u32(high).unwrap_or('\u{FFFD}'));
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn read_hex4<I: Iterator<Item = char>>(chars: &mut I) -> Option<u32> {
    let mut value = 0u32;
    for _ in 0..4 {
        let digit = chars.next()?.to_digit(16)?;
        value = value * 16 + digit;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_truncated_code_field() {
        let raw = r#"{"code": "def f(x):\n    return x * 2\n", "explanation": "dou"#;
        let code = salvage_string_field(raw, "code").expect("salvage");
        assert_eq!(code, "def f(x):\n    return x * 2\n");
    }

    #[test]
    fn captures_to_end_of_input_when_unterminated() {
        let raw = r#"{"code": "def f(s):\n    return s.replace(\"a\", \"b\")\n    # more"#;
        let code = salvage_string_field(raw, "code").expect("salvage");
        assert_eq!(
            code,
            "def f(s):\n    return s.replace(\"a\", \"b\")\n    # more"
        );
    }

    #[test]
    fn drops_dangling_escape_at_cut_point() {
        let raw = "{\"code\": \"x = 1\\";
        assert_eq!(salvage_string_field(raw, "code").as_deref(), Some("x = 1"));
    }

    #[test]
    fn blank_or_missing_field_is_not_salvaged() {
        assert!(salvage_string_field(r#"{"code": "   "#, "code").is_none());
        assert!(salvage_string_field(r#"{"explanation": "x"}"#, "code").is_none());
    }

    #[test]
    fn does_not_match_field_name_suffixes() {
        let raw = r#"{"source_code": "nope", "code": "yes"}"#;
        assert_eq!(salvage_string_field(raw, "code").as_deref(), Some("yes"));
    }

    #[test]
    fn unescape_handles_unicode_and_pairs() {
        assert_eq!(unescape(r"caf\u00e9"), "café");
        assert_eq!(unescape(r"\ud83d\ude00"), "😀");
        assert_eq!(unescape(r"tab\tslash\/"), "tab\tslash/");
        assert_eq!(unescape(r"cut \u00"), "cut ");
    }
}
