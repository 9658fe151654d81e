use std::fmt;

/// A fixed capacity text buffer for assembling log lines.
/// Writes beyond the capacity are silently truncated at a character
/// boundary; formatting into it never fails and never grows it past
/// `capacity` bytes.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    buf: String,
    capacity: usize,
    truncated: bool,
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: String::with_capacity(capacity),
            capacity,
            truncated: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Removes a single trailing `c`, if present
    pub fn trim_trailing(&mut self, c: char) {
        if self.buf.ends_with(c) {
            self.buf.pop();
        }
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

impl fmt::Write for LogBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = self.capacity.saturating_sub(self.buf.len());
        if s.len() <= remaining {
            self.buf.push_str(s);
            return Ok(());
        }

        let mut end = remaining;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.push_str(&s[..end]);
        self.truncated = true;
        Ok(())
    }
}
