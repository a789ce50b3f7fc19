//! Object naming convention.
//!
//! Chunks of a document are stored as `{classification}/{filename}_part{N}.txt`
//! with `N` starting at 1. There is no separate manifest object: documents are
//! recovered by listing and stripping the part suffix.

use crate::config::DeleteMatch;

/// Classification reported for objects stored without a `/` in their name.
pub const UNCLASSIFIED: &str = "unknown";

const PART_MARKER: &str = "_part";
const PART_EXTENSION: &str = ".txt";

/// Name of the object holding part `part` (1-based) of a document.
pub fn chunk_object_name(classification: &str, filename: &str, part: usize) -> String {
    format!(
        "{}/{}{}{}{}",
        classification, filename, PART_MARKER, part, PART_EXTENSION
    )
}

/// Prefix shared by every chunk object of a document.
pub fn chunk_prefix(classification: &str, filename: &str) -> String {
    format!("{}/{}{}", classification, filename, PART_MARKER)
}

/// Name of the temporary object holding an original upload during layout analysis.
pub fn staging_object_name(classification: &str, filename: &str) -> String {
    format!("{}/{}", classification, filename)
}

/// Splits an object name into `(classification, name-after-classification)`.
pub fn split_object_name(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((classification, rest)) => (classification, rest),
        None => (UNCLASSIFIED, name),
    }
}

/// Parses a `{base}_part{N}.txt` name into `(base, N)`.
pub fn parse_part_name(doc_name: &str) -> Option<(&str, usize)> {
    let stem = doc_name.strip_suffix(PART_EXTENSION)?;
    let idx = stem.rfind(PART_MARKER)?;
    let digits = &stem[idx + PART_MARKER.len()..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let part = digits.parse::<usize>().ok()?;
    Some((&stem[..idx], part))
}

/// Base document name of a stored name; names without a part suffix are their own base.
pub fn base_document_name(doc_name: &str) -> &str {
    parse_part_name(doc_name)
        .map(|(base, _)| base)
        .unwrap_or(doc_name)
}

/// Whether the object named `doc_name` (after its classification) is removed
/// by a delete request for `requested`.
pub fn matches_for_deletion(doc_name: &str, requested: &str, mode: DeleteMatch) -> bool {
    match mode {
        DeleteMatch::Exact => base_document_name(doc_name) == requested,
        DeleteMatch::Prefix => doc_name.starts_with(requested),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_names_follow_convention() {
        assert_eq!(
            chunk_object_name("Legal", "foo.pdf", 1),
            "Legal/foo.pdf_part1.txt"
        );
        assert_eq!(chunk_prefix("HR", "a b.docx"), "HR/a b.docx_part");
    }

    #[test]
    fn split_without_slash_is_unclassified() {
        assert_eq!(split_object_name("Legal/foo.pdf_part1.txt"), ("Legal", "foo.pdf_part1.txt"));
        assert_eq!(split_object_name("orphan.txt"), ("unknown", "orphan.txt"));
        assert_eq!(split_object_name("a/b/c.txt"), ("a", "b/c.txt"));
    }

    #[test]
    fn part_suffix_is_stripped() {
        assert_eq!(parse_part_name("foo.pdf_part12.txt"), Some(("foo.pdf", 12)));
        assert_eq!(base_document_name("foo.pdf_part2.txt"), "foo.pdf");
        assert_eq!(base_document_name("my_partner.docx_part1.txt"), "my_partner.docx");
    }

    #[test]
    fn names_without_valid_suffix_are_their_own_base() {
        assert_eq!(base_document_name("foo.pdf"), "foo.pdf");
        assert_eq!(base_document_name("foo_part.txt"), "foo_part.txt");
        assert_eq!(base_document_name("foo_partx.txt"), "foo_partx.txt");
        assert_eq!(base_document_name("foo_part1.csv"), "foo_part1.csv");
    }

    #[test]
    fn exact_deletion_does_not_touch_longer_names() {
        assert!(matches_for_deletion("foo_part1.txt", "foo", DeleteMatch::Exact));
        assert!(!matches_for_deletion("foobar_part1.txt", "foo", DeleteMatch::Exact));
    }

    #[test]
    fn prefix_deletion_keeps_historical_breadth() {
        assert!(matches_for_deletion("foobar_part1.txt", "foo", DeleteMatch::Prefix));
        assert!(matches_for_deletion("Report2.pdf_part1.txt", "Report", DeleteMatch::Prefix));
        assert!(!matches_for_deletion("bar_part1.txt", "foo", DeleteMatch::Prefix));
    }
}
