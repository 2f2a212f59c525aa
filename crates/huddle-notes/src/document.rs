//! Note document state.

use serde::{Deserialize, Serialize};

use huddle_core::error::{Error, Result};
use huddle_core::events::NoteOperation;

/// Shared note text and its version.
///
/// The version counts applied operations; it starts at 0 for a fresh
/// document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteDocument {
    /// Current text.
    pub content: String,
    /// Number of operations applied so far.
    pub version: u64,
}

impl NoteDocument {
    /// Creates a version-0 document.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            version: 0,
        }
    }

    /// Returns the length in Unicode scalar values.
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// Applies `operation` and bumps the version.
    ///
    /// The document is unchanged when an error is returned.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the operation is malformed or
    /// addresses characters outside the document.
    pub fn apply(&mut self, operation: &NoteOperation) -> Result<()> {
        operation.validate()?;
        let len = self.char_len();

        match operation {
            NoteOperation::Insert { position, text } => {
                let at = self.byte_offset(*position).ok_or_else(|| {
                    Error::validation(format!(
                        "insert position {position} is past the end of the note ({len} chars)"
                    ))
                })?;
                self.content.insert_str(at, text);
            }
            NoteOperation::Delete { position, length } => {
                let end = position
                    .checked_add(*length)
                    .filter(|end| *end <= len)
                    .ok_or_else(|| {
                        Error::validation(format!(
                            "delete of {length} chars at {position} exceeds the note ({len} chars)"
                        ))
                    })?;
                let start = self.byte_offset(*position).unwrap_or(self.content.len());
                let stop = self.byte_offset(end).unwrap_or(self.content.len());
                self.content.replace_range(start..stop, "");
            }
            NoteOperation::Retain { length } => {
                if *length > len {
                    return Err(Error::validation(format!(
                        "retain of {length} chars exceeds the note ({len} chars)"
                    )));
                }
            }
        }

        self.version += 1;
        Ok(())
    }

    fn byte_offset(&self, position: usize) -> Option<usize> {
        self.content
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(self.content.len()))
            .nth(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_delete_count_chars() {
        let mut doc = NoteDocument::new("héllo");
        doc.apply(&NoteOperation::Insert {
            position: 2,
            text: "ü".into(),
        })
        .expect("insert");
        assert_eq!(doc.content, "héüllo");

        doc.apply(&NoteOperation::Delete {
            position: 1,
            length: 2,
        })
        .expect("delete");
        assert_eq!(doc.content, "hllo");
        assert_eq!(doc.version, 2);
    }

    #[test]
    fn insert_at_end_appends() {
        let mut doc = NoteDocument::new("ab");
        doc.apply(&NoteOperation::Insert {
            position: 2,
            text: "c".into(),
        })
        .expect("append");
        assert_eq!(doc.content, "abc");
    }

    #[test]
    fn retain_only_bumps_version() {
        let mut doc = NoteDocument::new("abc");
        doc.apply(&NoteOperation::Retain { length: 3 }).expect("retain");
        assert_eq!(doc.content, "abc");
        assert_eq!(doc.version, 1);
    }

    #[test]
    fn out_of_bounds_leaves_document_untouched() {
        let mut doc = NoteDocument::new("abc");
        assert!(
            doc.apply(&NoteOperation::Insert {
                position: 4,
                text: "x".into()
            })
            .is_err()
        );
        assert!(
            doc.apply(&NoteOperation::Delete {
                position: 2,
                length: 2
            })
            .is_err()
        );
        assert!(
            doc.apply(&NoteOperation::Delete {
                position: usize::MAX,
                length: 2
            })
            .is_err()
        );
        assert!(doc.apply(&NoteOperation::Retain { length: 9 }).is_err());
        assert_eq!(doc, NoteDocument::new("abc"));
    }
}
