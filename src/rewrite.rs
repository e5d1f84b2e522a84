//! Span-based source rewriting.
//!
//! The transformer never mutates the syntax tree. It records replacement
//! text for source spans, children before parents, and reads back the
//! already-rewritten text of a child span when building its parent's
//! replacement.

use oxc_span::Span;

#[derive(Debug, Clone, PartialEq)]
struct Edit {
    start: u32,
    end: u32,
    text: String,
}

#[derive(Debug)]
pub struct SourceEdits<'s> {
    source: &'s str,
    /// Sorted by start, never overlapping.
    edits: Vec<Edit>,
}

impl<'s> SourceEdits<'s> {
    pub fn new(source: &'s str) -> Self {
        Self {
            source,
            edits: Vec::new(),
        }
    }

    pub fn source(&self) -> &'s str {
        self.source
    }

    /// Replaces `span`, discarding earlier edits nested inside it.
    pub fn replace(&mut self, span: Span, text: impl Into<String>) {
        self.edits
            .retain(|e| !(e.start >= span.start && e.end <= span.end));
        let at = self
            .edits
            .iter()
            .position(|e| e.start >= span.end)
            .unwrap_or(self.edits.len());
        self.edits.insert(
            at,
            Edit {
                start: span.start,
                end: span.end,
                text: text.into(),
            },
        );
    }

    pub fn is_replaced(&self, span: Span) -> bool {
        self.edits
            .iter()
            .any(|e| e.start == span.start && e.end == span.end)
    }

    /// Current text of `span` with every nested edit applied.
    pub fn render(&self, span: Span) -> String {
        let (start, end) = (span.start as usize, span.end as usize);
        let mut out = String::with_capacity(end.saturating_sub(start));
        let mut cursor = start;
        for edit in self
            .edits
            .iter()
            .filter(|e| e.start >= span.start && e.end <= span.end)
        {
            out.push_str(&self.source[cursor..edit.start as usize]);
            out.push_str(&edit.text);
            cursor = edit.end as usize;
        }
        out.push_str(&self.source[cursor..end]);
        out
    }

    pub fn finish(&self) -> String {
        self.render(Span::new(0, self.source.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_replacement_wins_outer() {
        let src = "a.b.c";
        let mut edits = SourceEdits::new(src);
        edits.replace(Span::new(0, 3), "get(a,'b')");
        assert_eq!(edits.render(Span::new(0, 5)), "get(a,'b').c");
        let inner = edits.render(Span::new(0, 3));
        edits.replace(Span::new(0, 5), format!("get({},'c')", inner));
        assert_eq!(edits.finish(), "get(get(a,'b'),'c')");
    }

    #[test]
    fn test_sibling_edits_keep_order() {
        let src = "f(x, y);";
        let mut edits = SourceEdits::new(src);
        edits.replace(Span::new(5, 6), "Y");
        edits.replace(Span::new(2, 3), "X");
        assert_eq!(edits.finish(), "f(X, Y);");
        assert!(edits.is_replaced(Span::new(2, 3)));
    }

    #[test]
    fn test_erase() {
        let src = "'use hyperloop';\nvar a = 1;";
        let mut edits = SourceEdits::new(src);
        edits.replace(Span::new(0, 16), "");
        assert_eq!(edits.finish(), "\nvar a = 1;");
    }
}
