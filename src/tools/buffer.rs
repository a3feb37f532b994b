use super::types::BufferOverflow;

/// Append-only text accumulator with a hard size cap.
///
/// An append that would exceed the cap is refused and leaves the content untouched. The caller
/// decides what to do with the held text; nothing is ever truncated here.
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    content: String,
    limit: usize,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            content: String::new(),
            limit,
        }
    }

    pub fn append(&mut self, text: &str) -> Result<(), BufferOverflow> {
        let attempted = self.content.len() + text.len();
        if attempted > self.limit {
            return Err(BufferOverflow {
                limit: self.limit,
                attempted,
            });
        }
        self.content.push_str(text);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.content.clear();
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    /// Replace the content, typically with the unconsumed remainder after an extraction
    pub fn set_content(&mut self, text: &str) -> Result<(), BufferOverflow> {
        if text.len() > self.limit {
            return Err(BufferOverflow {
                limit: self.limit,
                attempted: text.len(),
            });
        }
        self.content.clear();
        self.content.push_str(text);
        Ok(())
    }

    /// Move the content out, leaving the buffer empty
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.content)
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
