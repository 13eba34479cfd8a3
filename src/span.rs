//! Source locations attached to tokens and errors.

use std::fmt;

/// A region of source code, with the line/column of its start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// 1-based source line of the start.
    pub line: usize,
    /// 1-based column of the start.
    pub column: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, column: usize) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn column(&self) -> usize {
        self.column
    }

    /// A span covering both `self` and `other`.
    pub fn merge(self, other: Span) -> Span {
        let (line, column) = if other.line < self.line {
            (other.line, other.column)
        } else {
            (self.line, self.column)
        };
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            line,
            column,
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Self::new(0, 0, 1, 1)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_default() {
        assert_eq!(Span::new(4, 9, 2, 5).to_string(), "2:5");
        assert_eq!(Span::default().to_string(), "1:1");
    }

    #[test]
    fn test_merge_keeps_earliest_position() {
        let first = Span::new(10, 14, 2, 3);
        let second = Span::new(20, 26, 4, 1);
        let merged = first.merge(second);
        assert_eq!(merged.start, 10);
        assert_eq!(merged.end, 26);
        assert_eq!(merged.line(), 2);
        assert_eq!(merged.column(), 3);
    }
}
