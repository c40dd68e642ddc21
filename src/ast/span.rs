use std::fmt;

/// Source location range attached to AST nodes and emitted instructions.
///
/// Both endpoints carry line, column, and byte offset so that error
/// messages can point back to the exact piece of source that caused a
/// problem without re-scanning the template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start_line: u32,
    pub start_col: u32,
    pub start_offset: u32,
    pub end_line: u32,
    pub end_col: u32,
    pub end_offset: u32,
}

impl Span {
    /// Merge two spans into one covering both ranges
    pub fn merge(self, other: Span) -> Span {
        let (start_line, start_col, start_offset) = if self.start_offset <= other.start_offset {
            (self.start_line, self.start_col, self.start_offset)
        } else {
            (other.start_line, other.start_col, other.start_offset)
        };
        let (end_line, end_col, end_offset) = if self.end_offset >= other.end_offset {
            (self.end_line, self.end_col, self.end_offset)
        } else {
            (other.end_line, other.end_col, other.end_offset)
        };
        Span {
            start_line,
            start_col,
            start_offset,
            end_line,
            end_col,
            end_offset,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.start_line, self.start_col, self.end_line, self.end_col
        )
    }
}

/// Wraps any AST node with its source location.
#[derive(Debug, Clone)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(sl: u32, sc: u32, so: u32, el: u32, ec: u32, eo: u32) -> Span {
        Span {
            start_line: sl,
            start_col: sc,
            start_offset: so,
            end_line: el,
            end_col: ec,
            end_offset: eo,
        }
    }

    #[test]
    fn test_merge_covers_both() {
        let a = span(1, 5, 4, 1, 8, 7);
        let b = span(2, 1, 10, 2, 4, 13);
        let merged = a.merge(b);
        assert_eq!(merged.start_offset, 4);
        assert_eq!(merged.end_offset, 13);
        assert_eq!(merged.end_line, 2);
    }
}
