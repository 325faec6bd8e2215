//! Worker output parsing.
//!
//! Accumulates raw chunks into lines and classifies them. A line beginning
//! `TASK_COMPLETE:` carries a JSON-encoded result; completion fires exactly
//! once per parser lifetime until `reset`. Lines beginning `ERROR` are
//! failures; anything else is plain output.

use serde_json::Value;

/// The completion marker prefix workers emit.
pub const COMPLETION_MARKER: &str = "TASK_COMPLETE:";

/// Prefix classifying a line as a worker failure.
const ERROR_MARKER: &str = "ERROR";

/// A classified line of worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// Structured completion result
    Completion(Value),
    /// A failure line
    Error(String),
    /// A recognized marker that could not be decoded; logged and ignored
    Diagnostic(String),
    /// Ordinary output
    Output(String),
}

/// Incremental line parser over a worker's output stream.
#[derive(Debug, Default)]
pub struct OutputParser {
    buffer: String,
    completion_fired: bool,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the classified complete lines it produced.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ParsedLine> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            lines.push(self.classify(line));
        }
        lines
    }

    /// Whether a completion marker has been consumed since the last reset.
    pub fn completion_fired(&self) -> bool {
        self.completion_fired
    }

    /// Prepare for the next task: clears the fired flag, keeps the buffer.
    pub fn reset(&mut self) {
        self.completion_fired = false;
    }

    fn classify(&mut self, line: &str) -> ParsedLine {
        if let Some(rest) = line.strip_prefix(COMPLETION_MARKER) {
            if self.completion_fired {
                return ParsedLine::Diagnostic(line.to_string());
            }
            return match serde_json::from_str::<Value>(rest.trim()) {
                Ok(value) => {
                    self.completion_fired = true;
                    ParsedLine::Completion(value)
                }
                Err(err) => {
                    tracing::warn!(line, %err, "unparseable completion marker ignored");
                    ParsedLine::Diagnostic(line.to_string())
                }
            };
        }
        if line.starts_with(ERROR_MARKER) {
            return ParsedLine::Error(line.to_string());
        }
        ParsedLine::Output(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_marker_parsed() {
        let mut parser = OutputParser::new();
        let lines = parser.feed(b"TASK_COMPLETE: {\"ok\":true}\n");
        assert_eq!(
            lines,
            vec![ParsedLine::Completion(serde_json::json!({"ok": true}))]
        );
        assert!(parser.completion_fired());
    }

    #[test]
    fn test_completion_fires_once() {
        let mut parser = OutputParser::new();
        let lines = parser.feed(b"TASK_COMPLETE: 1\nTASK_COMPLETE: 2\n");
        assert_eq!(lines[0], ParsedLine::Completion(serde_json::json!(1)));
        assert!(matches!(lines[1], ParsedLine::Diagnostic(_)));
    }

    #[test]
    fn test_completion_after_reset() {
        let mut parser = OutputParser::new();
        parser.feed(b"TASK_COMPLETE: 1\n");
        parser.reset();
        let lines = parser.feed(b"TASK_COMPLETE: 2\n");
        assert_eq!(lines[0], ParsedLine::Completion(serde_json::json!(2)));
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut parser = OutputParser::new();
        assert!(parser.feed(b"TASK_COMP").is_empty());
        assert!(parser.feed(b"LETE: {\"n\":").is_empty());
        let lines = parser.feed(b"42}\n");
        assert_eq!(
            lines,
            vec![ParsedLine::Completion(serde_json::json!({"n": 42}))]
        );
    }

    #[test]
    fn test_trailing_output_after_marker() {
        let mut parser = OutputParser::new();
        let lines = parser.feed(b"TASK_COMPLETE: \"done\"\nsome trailing noise\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            ParsedLine::Completion(serde_json::json!("done"))
        );
        assert_eq!(lines[1], ParsedLine::Output("some trailing noise".into()));
    }

    #[test]
    fn test_error_lines() {
        let mut parser = OutputParser::new();
        let lines = parser.feed(b"ERROR: could not compile\n");
        assert_eq!(
            lines,
            vec![ParsedLine::Error("ERROR: could not compile".into())]
        );
    }

    #[test]
    fn test_malformed_marker_ignored() {
        let mut parser = OutputParser::new();
        let lines = parser.feed(b"TASK_COMPLETE: {not json\n");
        assert!(matches!(lines[0], ParsedLine::Diagnostic(_)));
        assert!(!parser.completion_fired());
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut parser = OutputParser::new();
        let lines = parser.feed(b"\n\r\nhello\n");
        assert_eq!(lines, vec![ParsedLine::Output("hello".into())]);
    }
}
