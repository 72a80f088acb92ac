//! `@path` and `@path:start-end` file references in user text.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use sx_core::Error;

use crate::workspace::resolve_within;

/// Files above this size are summarized instead of inlined.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 400_000;

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\s)@([\w\-/\.]+)(?::(\d+)-(\d+))?").expect("mention regex is valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub path: String,
    /// 1-based inclusive line range.
    pub range: Option<(usize, usize)>,
}

/// Mentions in order of first appearance, without duplicates.
pub fn parse_mentions(text: &str) -> Vec<Mention> {
    let mut mentions: Vec<Mention> = Vec::new();
    for caps in mention_regex().captures_iter(text) {
        let path = caps[1].trim_end_matches('.').to_string();
        if path.is_empty() {
            continue;
        }
        let range = match (caps.get(2), caps.get(3)) {
            (Some(a), Some(b)) => match (a.as_str().parse(), b.as_str().parse()) {
                (Ok(a), Ok(b)) => Some((a, b)),
                _ => None,
            },
            _ => None,
        };
        let mention = Mention { path, range };
        if !mentions.contains(&mention) {
            mentions.push(mention);
        }
    }
    mentions
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MentionContent {
    Inline {
        path: String,
        range: Option<(usize, usize)>,
        content: String,
    },
    NotFound(String),
    Escaped(String),
    TooLarge { path: String, bytes: u64 },
}

impl fmt::Display for MentionContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MentionContent::Inline { path, range, content } => {
                let label = match range {
                    Some((a, b)) => format!("{}:{}-{}", path, a, b),
                    None => path.clone(),
                };
                write!(f, "<<FILE:{}>>\n{}", label, content)?;
                if !content.is_empty() && !content.ends_with('\n') {
                    writeln!(f)?;
                }
                write!(f, "<<END:{}>>", label)
            }
            MentionContent::NotFound(path) => write!(f, "[FILE-NOT-FOUND] {}", path),
            MentionContent::Escaped(path) => write!(f, "[PATH-ESCAPE] {}", path),
            MentionContent::TooLarge { path, bytes } => {
                write!(f, "[large file, {} bytes] {}", bytes, path)
            }
        }
    }
}

/// Load one mention from under `root`.
pub fn resolve_mention(root: &Path, mention: &Mention, max_bytes: u64) -> MentionContent {
    let path = match resolve_within(root, &mention.path) {
        Ok(p) => p,
        Err(Error::PathEscape(_)) => return MentionContent::Escaped(mention.path.clone()),
        Err(_) => return MentionContent::NotFound(mention.path.clone()),
    };
    let meta = match std::fs::metadata(&path) {
        Ok(m) if m.is_file() => m,
        _ => return MentionContent::NotFound(mention.path.clone()),
    };
    if meta.len() > max_bytes {
        return MentionContent::TooLarge {
            path: mention.path.clone(),
            bytes: meta.len(),
        };
    }
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(_) => return MentionContent::NotFound(mention.path.clone()),
    };
    let text = String::from_utf8_lossy(&bytes);
    let content = match mention.range {
        Some((start, end)) => slice_lines(&text, start, end),
        None => text.into_owned(),
    };
    MentionContent::Inline {
        path: mention.path.clone(),
        range: mention.range,
        content,
    }
}

/// Parse and resolve every mention in `text`.
pub fn expand_mentions(root: &Path, text: &str, max_bytes: u64) -> Vec<MentionContent> {
    parse_mentions(text)
        .iter()
        .map(|m| resolve_mention(root, m, max_bytes))
        .collect()
}

/// Lines `start..=end`, 1-based, clamped to the file.
fn slice_lines(text: &str, start: usize, end: usize) -> String {
    let start = start.max(1);
    if end < start {
        return String::new();
    }
    text.lines()
        .skip(start - 1)
        .take(end - start + 1)
        .map(|l| format!("{}\n", l))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_ranged() {
        let mentions = parse_mentions("look at @src/main.rs and @lib/util.py:3-7 please");
        assert_eq!(
            mentions,
            vec![
                Mention { path: "src/main.rs".into(), range: None },
                Mention { path: "lib/util.py".into(), range: Some((3, 7)) },
            ]
        );
    }

    #[test]
    fn test_parse_ignores_emails_and_dedups() {
        let mentions = parse_mentions("mail me@example.com about @a.txt, then @a.txt again.");
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].path, "a.txt");
    }

    #[test]
    fn test_parse_at_start_of_text() {
        let mentions = parse_mentions("@README.md");
        assert_eq!(mentions[0].path, "README.md");
    }

    #[test]
    fn test_resolve_inline_and_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "one\ntwo\nthree\nfour\n").unwrap();

        let full = expand_mentions(dir.path(), "@f.txt", DEFAULT_MAX_FILE_BYTES);
        assert_eq!(full[0].to_string(), "<<FILE:f.txt>>\none\ntwo\nthree\nfour\n<<END:f.txt>>");

        let ranged = expand_mentions(dir.path(), "@f.txt:2-3", DEFAULT_MAX_FILE_BYTES);
        assert_eq!(ranged[0].to_string(), "<<FILE:f.txt:2-3>>\ntwo\nthree\n<<END:f.txt:2-3>>");

        let past_end = expand_mentions(dir.path(), "@f.txt:4-99", DEFAULT_MAX_FILE_BYTES);
        assert!(matches!(&past_end[0], MentionContent::Inline { content, .. } if content == "four\n"));
    }

    #[test]
    fn test_resolve_missing_escape_and_large() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![b'x'; 64]).unwrap();

        let results = expand_mentions(dir.path(), "@nope.txt @../../etc/passwd @big.bin", 16);
        assert_eq!(results[0], MentionContent::NotFound("nope.txt".into()));
        assert_eq!(results[1], MentionContent::Escaped("../../etc/passwd".into()));
        assert_eq!(results[1].to_string(), "[PATH-ESCAPE] ../../etc/passwd");
        assert_eq!(
            results[2],
            MentionContent::TooLarge { path: "big.bin".into(), bytes: 64 }
        );
    }
}
