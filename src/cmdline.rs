//! Launch command-line templating.
//!
//! The emulated machine's launch command is treated as an opaque string with
//! regex-addressable sub-regions: there is no structural parsing. Nodes
//! register the fragment that must exist before their device can be found
//! (see [`crate::graph::EdgeOptions::before_cmd_line`]); backend selection is
//! injected by rewriting that fragment in place.

use regex::Regex;

/// Performs regular-expression search and replace on `haystack`, in place.
///
/// Every match of `pattern` is replaced by `replacement`. The replacement may
/// reference capture groups of the pattern with `${n}` syntax. A buffer with
/// no match is left untouched.
///
/// Patterns are build-time constants, not untrusted input, so a pattern that
/// fails to compile panics with the offending pattern rather than returning
/// an error.
pub fn regex_replace(haystack: &mut String, pattern: &str, replacement: &str) {
    let regex = Regex::new(pattern)
        .unwrap_or_else(|err| panic!("malformed command-line pattern {pattern:?}: {err}"));
    if let std::borrow::Cow::Owned(rewritten) = regex.replace_all(haystack, replacement) {
        *haystack = rewritten;
    }
}

#[cfg(test)]
mod tests {
    use super::regex_replace;

    #[test]
    fn replaces_every_match() {
        let mut cmd = String::from("-device a -device b");
        regex_replace(&mut cmd, "-device", "-dev");
        assert_eq!(cmd, "-dev a -dev b");
    }

    #[test]
    fn replacement_may_reference_capture_groups() {
        let mut cmd = String::from("-fsdev local,id=fsdev0");
        regex_replace(&mut cmd, r"(-fsdev \w[^ ]*)", "${1},readonly=on");
        assert_eq!(cmd, "-fsdev local,id=fsdev0,readonly=on");
    }

    #[test]
    fn no_match_leaves_buffer_untouched() {
        let mut cmd = String::from("-machine q35");
        regex_replace(&mut cmd, "-fsdev synth,", "-fsdev local,");
        assert_eq!(cmd, "-machine q35");
    }

    #[test]
    #[should_panic(expected = "malformed command-line pattern")]
    fn malformed_pattern_aborts() {
        let mut cmd = String::from("-machine q35");
        regex_replace(&mut cmd, "(-fsdev", "-fsdev");
    }
}
