//! Error signature normalization.
//!
//! Two failures share a signature when they differ only in volatile details
//! (ids, numbers, paths, quoted values), so repeated failures of the same kind
//! can be counted across runs.

use std::sync::LazyLock;

use regex::Regex;

pub const MAX_SIGNATURE_LEN: usize = 200;

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap()
});
static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-f]+\b|\b[0-9a-f]{12,}\b").unwrap());
static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*"|'[^']*'|`[^`]*`"#).unwrap());
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[a-z]:)?(?:\.{0,2}/)?(?:[\w.-]+/)+[\w.-]+").unwrap());
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Normalize an error message into a comparable signature.
///
/// Replacement order matters: UUIDs and hex runs go before numbers so their
/// digits are not split into separate placeholders.
pub fn error_signature(message: &str) -> String {
    let lowered = message.to_lowercase();
    let text = UUID_RE.replace_all(&lowered, "<uuid>");
    let text = HEX_RE.replace_all(&text, "<hex>");
    let text = QUOTED_RE.replace_all(&text, "<str>");
    let text = PATH_RE.replace_all(&text, "<path>");
    let text = NUMBER_RE.replace_all(&text, "<n>");
    let text = SPACE_RE.replace_all(text.trim(), " ");
    text.chars().take(MAX_SIGNATURE_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_volatile_details() {
        let a = error_signature("Timeout after 30s reading /tmp/run-1/out.log");
        let b = error_signature("timeout after 45s reading /var/data/out.log");
        assert_eq!(a, b);
        assert_eq!(a, "timeout after <n>s reading <path>");
    }

    #[test]
    fn replaces_ids_and_quoted_values() {
        let sig = error_signature(
            "Run 3f2b8c1a-9d4e-4f5a-8b6c-7d8e9f0a1b2c failed: key 'alpha' missing",
        );
        assert_eq!(sig, "run <uuid> failed: key <str> missing");
    }

    #[test]
    fn collapses_whitespace_and_truncates() {
        assert_eq!(error_signature("  boom \n\t  again "), "boom again");
        let long = "word ".repeat(100);
        assert_eq!(error_signature(&long).chars().count(), MAX_SIGNATURE_LEN);
    }

    #[test]
    fn different_failures_stay_distinct() {
        assert_ne!(
            error_signature("compile error in module"),
            error_signature("test assertion failed")
        );
    }
}
