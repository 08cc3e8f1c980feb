//! Linear document and the `apply` half of the algebra.

use serde::{Deserialize, Serialize};

use super::operation::{byte_offset, char_len, OtError, Operation};

/// An ordered sequence of chars.
///
/// Each replica owns its own `Document`; copies are reconciled through
/// operations, never shared by reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Document {
    text: String,
    /// Cached char count.
    len: usize,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let len = char_len(&text);
        Self { text, len }
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    /// The `length` chars starting at `position`, or `None` if the range
    /// runs past the end.
    pub fn slice(&self, position: usize, length: usize) -> Option<&str> {
        let end = position.checked_add(length)?;
        if end > self.len {
            return None;
        }
        let start = byte_offset(&self.text, position);
        let stop = byte_offset(&self.text, end);
        Some(&self.text[start..stop])
    }

    /// Apply `op`, returning the new document. See [`apply`].
    pub fn apply(&self, op: &Operation) -> Result<Document, OtError> {
        apply(self, op)
    }
}

impl From<String> for Document {
    fn from(text: String) -> Self {
        Document::new(text)
    }
}

impl From<&str> for Document {
    fn from(text: &str) -> Self {
        Document::new(text)
    }
}

impl From<Document> for String {
    fn from(doc: Document) -> Self {
        doc.text
    }
}

impl std::fmt::Display for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Apply `op` to `doc`.
///
/// Pure: `doc` is left untouched. Out-of-range positions or lengths are
/// rejected with [`OtError::InvalidOperation`] instead of being clamped.
pub fn apply(doc: &Document, op: &Operation) -> Result<Document, OtError> {
    match op {
        Operation::Retain { .. } => Ok(doc.clone()),

        Operation::Insert { position, content, .. } => {
            let new_len = op.validate(doc.len)?;
            let at = byte_offset(&doc.text, *position);
            let mut text = String::with_capacity(doc.text.len() + content.len());
            text.push_str(&doc.text[..at]);
            text.push_str(content);
            text.push_str(&doc.text[at..]);
            Ok(Document { text, len: new_len })
        }

        Operation::Delete { position, length, .. } => {
            let new_len = op.validate(doc.len)?;
            let start = byte_offset(&doc.text, *position);
            let stop = byte_offset(&doc.text, position + length);
            let mut text = String::with_capacity(doc.text.len() - (stop - start));
            text.push_str(&doc.text[..start]);
            text.push_str(&doc.text[stop..]);
            Ok(Document { text, len: new_len })
        }

        Operation::Sequence(parts) => {
            // Validate the whole sequence up front so a failure leaves no
            // half-applied intermediate behind.
            op.validate(doc.len)?;
            parts.iter().try_fold(doc.clone(), |acc, part| apply(&acc, part))
        }
    }
}
