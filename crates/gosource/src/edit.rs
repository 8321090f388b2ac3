// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::ops::Range;

use thiserror::Error;

/// Apply byte-range edit operations to a source file
#[derive(Debug, Default)]
pub struct Patch {
    edits: Vec<Edit>,
}

#[derive(Debug)]
struct Edit {
    range: Range<usize>,
    text: String,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Replace `range` of the original source with `text`
    pub fn replace(&mut self, range: Range<usize>, text: impl ToString) {
        self.edits.push(Edit {
            range,
            text: text.to_string(),
        });
    }

    /// Insert `text` at byte offset `at`
    pub fn insert(&mut self, at: usize, text: impl ToString) {
        self.replace(at..at, text);
    }

    /// Remove `range` from the original source
    pub fn delete(&mut self, range: Range<usize>) {
        self.replace(range, "");
    }

    /// Splice all edits into `source`. Ranges always address the original
    /// source, never the output of a previous edit.
    pub fn apply(&self, source: &str) -> Result<String, Error> {
        let mut edits = self.edits.iter().collect::<Vec<_>>();
        edits.sort_by_key(|e| (e.range.start, e.range.end));

        let mut output = String::with_capacity(source.len());
        let mut cursor = 0;

        for edit in edits {
            if edit.range.start < cursor {
                return Err(Error::Overlap {
                    start: edit.range.start,
                    end: edit.range.end,
                });
            }
            if edit.range.end > source.len() {
                return Err(Error::OutOfBounds {
                    end: edit.range.end,
                    len: source.len(),
                });
            }
            output.push_str(&source[cursor..edit.range.start]);
            output.push_str(&edit.text);
            cursor = edit.range.end;
        }

        output.push_str(&source[cursor..]);

        Ok(output)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("overlapping edits at byte range {start}..{end}")]
    Overlap { start: usize, end: usize },
    #[error("edit range ends at {end}, source is {len} bytes")]
    OutOfBounds { end: usize, len: usize },
}
