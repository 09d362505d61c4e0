//! Managed-region file model
//!
//! A generated file is `{preamble, region, suffix}`. The region sits
//! between [`START_MARKER`] and [`END_MARKER`], each alone on its line, and
//! belongs to the compiler. Everything else belongs to the operator and is
//! written back byte for byte.

use thiserror::Error;

pub const START_MARKER: &str = "# === MANAGED BY infrac ===";
pub const END_MARKER: &str = "# === END MANAGED ===";

const SCAFFOLD_PREAMBLE: &str = "---\n\
# The managed region below is regenerated by infrac on every compile.\n\
# Edit the descriptor instead of this region.\n";

const SCAFFOLD_SUFFIX: &str = "\n\
# Operator variables below this line are preserved across compiles.\n";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("no '{}' marker found", START_MARKER)]
    MissingStart,

    #[error("no '{}' marker found", END_MARKER)]
    MissingEnd,

    #[error("{count} '{}' markers found, expected exactly one", START_MARKER)]
    DuplicateStart { count: usize },

    #[error("{count} '{}' markers found, expected exactly one", END_MARKER)]
    DuplicateEnd { count: usize },

    #[error("end marker on line {end} precedes start marker on line {start}")]
    EndBeforeStart { start: usize, end: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedFile {
    pub preamble: String,
    pub region: String,
    pub suffix: String,
    /// Whatever followed each marker on its line, newline included
    start_tail: String,
    end_tail: String,
}

impl ManagedFile {
    /// New file: the region wrapped in explanatory scaffolding
    pub fn scaffold(region: impl Into<String>) -> Self {
        Self {
            preamble: SCAFFOLD_PREAMBLE.to_string(),
            region: region.into(),
            suffix: SCAFFOLD_SUFFIX.to_string(),
            start_tail: "\n".to_string(),
            end_tail: "\n".to_string(),
        }
    }

    pub fn parse(content: &str) -> Result<Self, RegionError> {
        let lines: Vec<&str> = content.split_inclusive('\n').collect();
        let is = |line: &str, marker: &str| line.trim_end() == marker;

        let starts: Vec<usize> = (0..lines.len()).filter(|&i| is(lines[i], START_MARKER)).collect();
        let ends: Vec<usize> = (0..lines.len()).filter(|&i| is(lines[i], END_MARKER)).collect();

        let start = match starts.as_slice() {
            [] => return Err(RegionError::MissingStart),
            [only] => *only,
            many => return Err(RegionError::DuplicateStart { count: many.len() }),
        };
        let end = match ends.as_slice() {
            [] => return Err(RegionError::MissingEnd),
            [only] => *only,
            many => return Err(RegionError::DuplicateEnd { count: many.len() }),
        };
        if end < start {
            return Err(RegionError::EndBeforeStart {
                start: start + 1,
                end: end + 1,
            });
        }

        Ok(Self {
            preamble: lines[..start].concat(),
            region: lines[start + 1..end].concat(),
            suffix: lines[end + 1..].concat(),
            start_tail: lines[start][START_MARKER.len()..].to_string(),
            end_tail: lines[end][END_MARKER.len()..].to_string(),
        })
    }

    /// Same operator content around a new region
    pub fn with_region(self, region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..self
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(
            self.preamble.len() + self.region.len() + self.suffix.len() + 64,
        );
        out.push_str(&self.preamble);
        if !self.preamble.is_empty() && !self.preamble.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(START_MARKER);
        out.push_str(&self.start_tail);
        out.push_str(&self.region);
        if !self.region.is_empty() && !self.region.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(END_MARKER);
        out.push_str(&self.end_tail);
        out.push_str(&self.suffix);
        out
    }
}

/// Whether `content` carries a start marker line, i.e. was generated
pub fn is_managed(content: &str) -> bool {
    content.lines().any(|line| line.trim_end() == START_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn wrap(preamble: &str, region: &str, suffix: &str) -> String {
        format!("{}{}\n{}{}\n{}", preamble, START_MARKER, region, END_MARKER, suffix)
    }

    #[test]
    fn test_parse_render_is_byte_identical() -> Result<(), RegionError> {
        let content = wrap("---\n# mine\n", "a: 1\nb: 2\n", "\ncustom: true\n# trailing");
        let file = ManagedFile::parse(&content)?;

        assert_eq!(file.preamble, "---\n# mine\n");
        assert_eq!(file.region, "a: 1\nb: 2\n");
        assert_eq!(file.suffix, "\ncustom: true\n# trailing");
        assert_eq!(file.render(), content);
        Ok(())
    }

    #[test]
    fn test_marker_line_endings_are_kept() -> Result<(), RegionError> {
        let unterminated = format!("{}\na: 1\n{}", START_MARKER, END_MARKER);
        assert_eq!(ManagedFile::parse(&unterminated)?.render(), unterminated);

        let crlf = format!("{} \r\na: 1\n{}\r\nkeep: 1\n", START_MARKER, END_MARKER);
        let file = ManagedFile::parse(&crlf)?;
        assert_eq!(file.render(), crlf);
        assert_eq!(
            file.with_region("a: 2\n").render(),
            crlf.replace("a: 1", "a: 2")
        );
        Ok(())
    }

    #[test]
    fn test_region_replacement_keeps_operator_content() -> Result<(), RegionError> {
        let content = wrap("", "old: 1\n", "extra: keep\n");
        let updated = ManagedFile::parse(&content)?.with_region("new: 2\n").render();
        assert_eq!(updated, wrap("", "new: 2\n", "extra: keep\n"));
        Ok(())
    }

    #[test]
    fn test_scaffold_round_trips() -> Result<(), RegionError> {
        let file = ManagedFile::scaffold("x: 1\n");
        assert_eq!(ManagedFile::parse(&file.render())?, file);
        Ok(())
    }

    #[test]
    fn test_marker_errors() {
        assert_eq!(
            ManagedFile::parse("plain: yaml\n"),
            Err(RegionError::MissingStart)
        );
        assert_eq!(
            ManagedFile::parse(&format!("{}\nx: 1\n", START_MARKER)),
            Err(RegionError::MissingEnd)
        );

        let twice = format!("{}{}", wrap("", "a: 1\n", ""), wrap("", "b: 1\n", ""));
        assert_eq!(
            ManagedFile::parse(&twice),
            Err(RegionError::DuplicateStart { count: 2 })
        );

        let inverted = format!("{}\n{}\n", END_MARKER, START_MARKER);
        assert_eq!(
            ManagedFile::parse(&inverted),
            Err(RegionError::EndBeforeStart { start: 2, end: 1 })
        );
    }

    #[test]
    fn test_marker_inside_text_is_not_a_marker() -> Result<(), RegionError> {
        let content = wrap("", "a: 1\n", &format!("note: \"{}\"\n", START_MARKER));
        let file = ManagedFile::parse(&content)?;
        assert!(file.suffix.contains(START_MARKER));
        Ok(())
    }
}
