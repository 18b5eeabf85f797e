//! Recursive-descent parser for `@` reference expressions
//!
//! Deliberately hand-rolled rather than regex-based: the grammar is small and
//! a regex would need lookaround to handle the dotted-path/array-index split
//! and the `output.` alias-stripping rule cleanly.

use super::ast::Reference;

/// Characters that may appear inside a reference token once past the leading `@`.
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Parse a string that is expected to be *entirely* one reference (no
/// surrounding text). Returns `None` if `s` does not start with `@` or the
/// body is empty.
pub fn parse_reference(s: &str) -> Option<Reference> {
    let body = s.strip_prefix('@')?;
    if body.is_empty() {
        return None;
    }
    Some(parse_body(body))
}

fn parse_body(body: &str) -> Reference {
    let mut segments = body.split('.').map(str::to_string);
    let head = segments.next().unwrap_or_default();
    let rest: Vec<String> = segments.collect();

    match head.as_str() {
        "input" => Reference::Input(rest),
        "output" => Reference::Output(rest),
        "item" => Reference::Item(rest),
        "index" => Reference::Index,
        _ => {
            let mut path = rest;
            if path.first().map(String::as_str) == Some("output") {
                path.remove(0);
            }
            Reference::Step(head, path)
        }
    }
}

/// A `@...` token found inside a larger string, with its byte span.
pub struct TokenMatch {
    pub start: usize,
    pub end: usize,
    pub reference: Reference,
}

/// Scan `s` for embedded `@...` tokens (used when a template string contains
/// references interpolated among other text, e.g. `"hello @input.name!"`).
pub fn scan_tokens(s: &str) -> Vec<TokenMatch> {
    let mut matches = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'@' {
            let start = i;
            let mut j = i + 1;
            while j < bytes.len() && is_token_char(s[j..].chars().next().unwrap()) {
                j += s[j..].chars().next().unwrap().len_utf8();
            }
            if j > start + 1 {
                // trim a trailing '.' — "@input." with nothing after is not a valid token
                let mut end = j;
                while end > start + 1 && bytes[end - 1] == b'.' {
                    end -= 1;
                }
                let body = &s[start + 1..end];
                if !body.is_empty() {
                    matches.push(TokenMatch {
                        start,
                        end,
                        reference: parse_body(body),
                    });
                }
            }
            i = j.max(i + 1);
        } else {
            i += s[i..].chars().next().unwrap().len_utf8();
        }
    }
    matches
}

/// True if the whole string is exactly one reference literal (starts with
/// `@` and nothing precedes it — the templater substitutes the native value
/// in this case instead of stringifying).
pub fn is_whole_reference(s: &str) -> bool {
    s.starts_with('@') && scan_tokens(s).len() == 1 && scan_tokens(s)[0].start == 0 && scan_tokens(s)[0].end == s.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_path() {
        assert_eq!(
            parse_reference("@input.user.name"),
            Some(Reference::Input(vec!["user".into(), "name".into()]))
        );
    }

    #[test]
    fn parses_bare_item_and_index() {
        assert_eq!(parse_reference("@item"), Some(Reference::Item(vec![])));
        assert_eq!(parse_reference("@index"), Some(Reference::Index));
    }

    #[test]
    fn strips_output_alias() {
        assert_eq!(
            parse_reference("@step1.output.foo"),
            Some(Reference::Step("step1".into(), vec!["foo".into()]))
        );
        assert_eq!(
            parse_reference("@step1.foo"),
            Some(Reference::Step("step1".into(), vec!["foo".into()]))
        );
    }

    #[test]
    fn whole_reference_detection() {
        assert!(is_whole_reference("@input.x"));
        assert!(!is_whole_reference("value is @input.x here"));
    }

    #[test]
    fn scans_embedded_tokens() {
        let matches = scan_tokens("hello @input.name, step @A.value.");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].reference, Reference::Input(vec!["name".into()]));
        assert_eq!(
            matches[1].reference,
            Reference::Step("A".into(), vec!["value".into()])
        );
    }
}
