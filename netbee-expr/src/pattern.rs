use regex::bytes::{Regex, RegexBuilder};

use crate::ExprError;

/// Compile budget: keeps pathological patterns from blowing up the loader
/// and bounds the compiled automaton the engine runs per packet.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// A regular expression compiled once at load time and owned by the node
/// that declared it. Matching operates on raw packet bytes.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    case_sensitive: bool,
}

impl Pattern {
    pub fn compile(source: &str, case_sensitive: bool) -> Result<Self, ExprError> {
        // A literal NUL can only enter a pattern through the '\0' escape;
        // '\x00' is reserved as invalid so malformed patterns surface at
        // load time instead of never matching.
        if source.contains("\\x00") || source.contains('\0') {
            return Err(ExprError::RegexInvalidNul);
        }

        let regex = RegexBuilder::new(source)
            .case_insensitive(!case_sensitive)
            .unicode(false)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()?;

        Ok(Pattern {
            source: source.to_string(),
            regex,
            case_sensitive,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// First match in `haystack`, as a (start, end) byte range.
    pub fn find(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        self.regex.find(haystack).map(|m| (m.start(), m.end()))
    }

    pub fn is_match(&self, haystack: &[u8]) -> bool {
        self.regex.is_match(haystack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_escape_is_rejected() {
        assert!(matches!(
            Pattern::compile("a\\x00b", true),
            Err(ExprError::RegexInvalidNul)
        ));
        assert!(Pattern::compile("a\\0b", true).is_ok());
    }

    #[test]
    fn case_insensitive_matching() {
        let p = Pattern::compile("host", false).unwrap();
        assert!(p.is_match(b"HOST: x"));

        let p = Pattern::compile("host", true).unwrap();
        assert!(!p.is_match(b"HOST: x"));
    }

    #[test]
    fn finds_byte_ranges() {
        let p = Pattern::compile("\\r\\n", true).unwrap();
        assert_eq!(p.find(b"ab\r\ncd"), Some((2, 4)));
    }
}
