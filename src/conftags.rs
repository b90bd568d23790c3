//! Parser for the `key:"value"` tag syntax carried in table and column
//! comments.
//!
//! The syntax is a concatenation of optionally space-separated `key:"v1,v2"`
//! pairs. Keys are non-empty runs of printable characters other than space,
//! quote and colon. Values are double-quoted, backslash-escaped, and split
//! on commas. Three or more spaces, or a `#`, cut the rest of the comment
//! off as free text:
//!
//! ```text
//! index:"users,all" join:"rel"   human readable notes go here
//! ```
//!
//! Duplicate keys are legal and preserved in order (`inline` repeats).

use std::fmt;

use thiserror::Error;

/// Malformed tag input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("syntax error")]
pub struct SyntaxError;

/// One parsed `key:"v1,v2"` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub values: Vec<String>,
}

impl Tag {
    /// First value, the conventional "main" argument of a tag.
    pub fn first(&self) -> &str {
        self.values.first().map(String::as_str).unwrap_or("")
    }

    /// Values after the first: options and renames.
    pub fn options(&self) -> &[String] {
        self.values.get(1..).unwrap_or(&[])
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:\"", self.name)?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            for c in v.chars() {
                match c {
                    '"' => f.write_str("\\\"")?,
                    '\\' => f.write_str("\\\\")?,
                    c => write!(f, "{}", c)?,
                }
            }
        }
        f.write_str("\"")
    }
}

/// Returns the first tag with the given name, if any.
pub fn get<'a>(tags: &'a [Tag], name: &str) -> Option<&'a Tag> {
    tags.iter().find(|t| t.name == name)
}

/// Returns all tags with the given name, preserving order.
pub fn filter<'a>(tags: &'a [Tag], name: &'a str) -> impl Iterator<Item = &'a Tag> {
    tags.iter().filter(move |t| t.name == name)
}

/// Renders tags back to source form, space separated.
pub fn render(tags: &[Tag]) -> String {
    tags.iter()
        .map(Tag::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses a comment string into tags.
///
/// Empty input is fine and yields no tags. Unclosed quotes and keys without
/// a quoted value are a [`SyntaxError`].
pub fn parse(src: &str) -> Result<Vec<Tag>, SyntaxError> {
    let mut tags = Vec::new();
    let mut src = src.as_bytes();

    loop {
        // Skip leading space; a wide gap or '#' starts the free-text comment.
        let mut i = 0;
        while i < src.len() && src[i] == b' ' {
            i += 1;
        }
        src = &src[i..];
        if src.is_empty() {
            return Ok(tags);
        }
        if i >= 3 || src[0] == b'#' {
            return Ok(tags);
        }

        // Key: printable run up to the ':'.
        let mut i = 0;
        while i < src.len()
            && src[i] > b' '
            && src[i] != b':'
            && src[i] != b'"'
            && src[i] != 0x7f
        {
            i += 1;
        }
        if i == 0 || i + 1 >= src.len() || src[i] != b':' || src[i + 1] != b'"' {
            return Err(SyntaxError);
        }
        let name = std::str::from_utf8(&src[..i])
            .map_err(|_| SyntaxError)?
            .to_string();
        src = &src[i + 1..];

        // Quoted value, backslash escapes included.
        let mut i = 1;
        while i < src.len() && src[i] != b'"' {
            if src[i] == b'\\' {
                i += 1;
            }
            i += 1;
        }
        if i >= src.len() {
            return Err(SyntaxError);
        }
        let quoted = std::str::from_utf8(&src[..i + 1]).map_err(|_| SyntaxError)?;
        src = &src[i + 1..];

        let value = unquote(quoted)?;
        tags.push(Tag {
            name,
            values: value.split(',').map(str::to_string).collect(),
        });
    }
}

/// Unquotes a double-quoted string with the escapes the tag syntax allows.
fn unquote(s: &str) -> Result<String, SyntaxError> {
    let inner = s
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or(SyntaxError)?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            if c == '"' {
                return Err(SyntaxError);
            }
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            _ => return Err(SyntaxError),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str, values: &[&str]) -> Tag {
        Tag {
            name: name.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_single() {
        let tags = parse(r#"index:"users,all""#).unwrap();
        assert_eq!(tags, vec![tag("index", &["users", "all"])]);
    }

    #[test]
    fn test_parse_multiple_and_duplicates() {
        let tags = parse(r#"index:"users" inline:"a,pk" inline:"b,parent""#).unwrap();
        assert_eq!(
            tags,
            vec![
                tag("index", &["users"]),
                tag("inline", &["a", "pk"]),
                tag("inline", &["b", "parent"]),
            ]
        );
        assert_eq!(filter(&tags, "inline").count(), 2);
        assert_eq!(get(&tags, "index").unwrap().first(), "users");
        assert!(get(&tags, "join").is_none());
    }

    #[test]
    fn test_parse_empty_and_blank() {
        assert_eq!(parse("").unwrap(), vec![]);
        assert_eq!(parse("   ").unwrap(), vec![]);
    }

    #[test]
    fn test_comment_cutoff() {
        // 3+ spaces end the tag section
        let tags = parse(r#"index:"t"    this is a human comment: "quotes""#).unwrap();
        assert_eq!(tags, vec![tag("index", &["t"])]);

        // '#' does too
        let tags = parse(r#"index:"t" # not:"a-tag""#).unwrap();
        assert_eq!(tags, vec![tag("index", &["t"])]);

        // A pure free-text comment parses as no tags when it starts with '#'
        assert_eq!(parse("# regular comment").unwrap(), vec![]);
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(parse(r#"index:"unclosed"#), Err(SyntaxError));
        assert_eq!(parse(r#"index:unquoted"#), Err(SyntaxError));
        assert_eq!(parse(r#":"no-name""#), Err(SyntaxError));
        assert_eq!(parse(r#"index"#), Err(SyntaxError));
    }

    #[test]
    fn test_escaped_values() {
        let tags = parse(r#"index:"a\"b,c\\d""#).unwrap();
        assert_eq!(tags, vec![tag("index", &["a\"b", "c\\d"])]);
    }

    #[test]
    fn test_render_parse_roundtrip() {
        let original = vec![
            tag("index", &["users", "all"]),
            tag("inline", &["items", "items_field"]),
            tag("join", &["rel"]),
            tag("index", &["we\"ird", "esc\\ape"]),
        ];
        let parsed = parse(&render(&original)).unwrap();
        assert_eq!(parsed, original);
    }
}
