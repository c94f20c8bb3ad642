// crates/sqlkit-fs/src/paths.rs
//! Path canonicalization.
//!
//! Every path stored in `fs.files` is the output of [`normalize_path`]; reads
//! normalize their input the same way, so lookups compare canonical form to
//! canonical form. Both functions are idempotent:
//! `normalize_path(normalize_path(p)) == normalize_path(p)`.

use anyhow::{anyhow, Result};

/// Maximum path length in characters, measured after normalization.
pub const MAX_PATH_LEN: usize = 4096;

/// Characters rejected anywhere in a path.
const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Canonicalize a file path.
///
/// Rules:
/// - non-empty input
/// - no NUL; no control characters other than TAB, LF, CR
/// - none of `< > : " | ? *`
/// - `\` is accepted and converted to `/`
/// - a leading `/` is added if absent
/// - runs of `/` collapse to one
/// - a trailing `/` is stripped unless the whole path is `/`
/// - at most [`MAX_PATH_LEN`] characters after normalization
pub fn normalize_path(input: &str) -> Result<String> {
    normalize(input, false)
}

/// Canonicalize a directory prefix.
///
/// Identical to [`normalize_path`] except a trailing `/` is preserved, so
/// `"/src/"` (everything under the directory) stays distinct from `"/src"`
/// (the entry itself and any path extending it).
pub fn normalize_prefix(input: &str) -> Result<String> {
    normalize(input, true)
}

fn normalize(input: &str, keep_trailing_slash: bool) -> Result<String> {
    if input.is_empty() {
        return Err(anyhow!("invalid path: empty"));
    }

    for ch in input.chars() {
        if ch == '\0' {
            return Err(anyhow!("invalid path: NUL byte"));
        }
        if ch.is_control() && !matches!(ch, '\t' | '\n' | '\r') {
            return Err(anyhow!("invalid path: control character U+{:04X}", ch as u32));
        }
        if ILLEGAL_CHARS.contains(&ch) {
            return Err(anyhow!("invalid path: character '{ch}' not allowed"));
        }
    }

    let slashed = input.replace('\\', "/");
    let had_trailing = slashed.ends_with('/');

    let mut out = String::with_capacity(slashed.len() + 1);
    out.push('/');
    let mut prev_was_slash = true;
    for ch in slashed.chars() {
        if ch == '/' {
            if !prev_was_slash {
                out.push('/');
            }
            prev_was_slash = true;
        } else {
            out.push(ch);
            prev_was_slash = false;
        }
    }

    if out.len() > 1 && out.ends_with('/') && !(keep_trailing_slash && had_trailing) {
        out.pop();
    }

    if out.chars().count() > MAX_PATH_LEN {
        return Err(anyhow!(
            "path too long: {} characters after normalization (max {MAX_PATH_LEN})",
            out.chars().count()
        ));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepends_slash_and_collapses_runs() {
        assert_eq!(normalize_path("src/main.rs").unwrap(), "/src/main.rs");
        assert_eq!(normalize_path("//src///main.rs").unwrap(), "/src/main.rs");
        assert_eq!(normalize_path("/a//b///c").unwrap(), "/a/b/c");
    }

    #[test]
    fn backslashes_become_slashes() {
        assert_eq!(normalize_path(r"src\win\file.txt").unwrap(), "/src/win/file.txt");
        assert_eq!(normalize_path(r"\\server\share").unwrap(), "/server/share");
    }

    #[test]
    fn trailing_slash_stripped_except_root() {
        assert_eq!(normalize_path("/src/").unwrap(), "/src");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("///").unwrap(), "/");
    }

    #[test]
    fn prefix_keeps_trailing_slash() {
        assert_eq!(normalize_prefix("/src/").unwrap(), "/src/");
        assert_eq!(normalize_prefix("src//").unwrap(), "/src/");
        assert_eq!(normalize_prefix("/src").unwrap(), "/src");
        assert_eq!(normalize_prefix("/").unwrap(), "/");
    }

    #[test]
    fn idempotent() {
        for input in ["src/a.txt", "/x//y/", r"a\b", "/"] {
            let once = normalize_path(input).unwrap();
            assert_eq!(normalize_path(&once).unwrap(), once);
        }
        let once = normalize_prefix("src/").unwrap();
        assert_eq!(normalize_prefix(&once).unwrap(), once);
    }

    #[test]
    fn rejects_empty_and_nul() {
        assert!(normalize_path("").is_err());
        assert!(normalize_path("a\0b").is_err());
    }

    #[test]
    fn rejects_illegal_characters() {
        for p in ["a<b", "a>b", "a:b", "a\"b", "a|b", "a?b", "a*b"] {
            assert!(normalize_path(p).is_err(), "expected rejection: {p}");
        }
    }

    #[test]
    fn control_chars_rejected_except_tab_lf_cr() {
        assert!(normalize_path("a\x01b").is_err());
        assert!(normalize_path("a\x7fb").is_err());
        assert!(normalize_path("a\tb").is_ok());
        assert!(normalize_path("a\nb").is_ok());
        assert!(normalize_path("a\rb").is_ok());
    }

    #[test]
    fn enforces_max_length_post_normalization() {
        let long = "a".repeat(MAX_PATH_LEN - 1);
        assert!(normalize_path(&long).is_ok());

        let too_long = "a".repeat(MAX_PATH_LEN + 1);
        let err = normalize_path(&too_long).unwrap_err();
        assert!(err.to_string().contains("path too long"));

        // Collapsing can bring an over-long input under the limit.
        let collapsible = "/".repeat(MAX_PATH_LEN * 2);
        assert_eq!(normalize_path(&collapsible).unwrap(), "/");
    }
}
