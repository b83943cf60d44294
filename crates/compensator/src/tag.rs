use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TAG_ID: AtomicU64 = AtomicU64::new(1);

/// Marker for a reserved position in the compensation stack.
///
/// Compensations registered at a tag roll back together, at the point where
/// the tag was created, instead of on top of everything registered since.
///
/// Tags compare by identity: two tags with the same label are still
/// different tags. Cloning a tag yields a handle to the same identity.
#[derive(Clone)]
pub struct Tag {
    id: u64,
    label: Arc<str>,
}

impl Tag {
    /// Create a tag with the given label, or a generated one when the label
    /// is missing or blank. Supplied labels are trimmed.
    pub(crate) fn new(label: Option<&str>) -> Self {
        let id = NEXT_TAG_ID.fetch_add(1, Ordering::Relaxed);
        let label = match label.map(str::trim) {
            Some(trimmed) if !trimmed.is_empty() => trimmed.to_string(),
            _ => generate_label(id),
        };
        Self {
            id,
            label: label.into(),
        }
    }

    /// The tag's label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

fn generate_label(id: u64) -> String {
    match petname::petname(2, "-") {
        Some(name) => format!("{name}-{id}"),
        None => format!("tag-{id}"),
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supplied_label_is_trimmed() {
        let tag = Tag::new(Some("  manifests \n"));
        assert_eq!(tag.label(), "manifests");
    }

    #[test]
    fn blank_label_generates_one() {
        let missing = Tag::new(None);
        let blank = Tag::new(Some("   "));

        assert!(!missing.label().is_empty());
        assert!(!blank.label().trim().is_empty());
        assert_ne!(missing.label(), blank.label());
    }

    #[test]
    fn tags_with_same_label_are_distinct() {
        let first = Tag::new(Some("same"));
        let second = Tag::new(Some("same"));

        assert_eq!(first.label(), second.label());
        assert_ne!(first, second);
    }

    #[test]
    fn clone_keeps_identity() {
        let tag = Tag::new(Some("original"));
        let handle = tag.clone();
        assert_eq!(tag, handle);
    }

    #[test]
    fn display_shows_label() {
        let tag = Tag::new(Some("commit"));
        assert_eq!(tag.to_string(), "commit");
    }
}
