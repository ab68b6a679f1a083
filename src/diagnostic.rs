// Copyright 2024 Cornell University
// released under MIT License

use std::io::Write;

use clap::ColorChoice;
use codespan_reporting::diagnostic::{
    Diagnostic as CodespanDiagnostic, Label as CodespanLabel, LabelStyle, Severity,
};
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term;
use codespan_reporting::term::termcolor::{Buffer, Color, ColorSpec, WriteColor};
use pest::iterators::Pair;
use pest::RuleType;
use rustc_hash::FxHashSet;

use crate::ir::{BlockId, Diagram};

/// Severity of diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Error,
    Warning,
}

/// A label representing a part of the source code
#[derive(Debug, Clone, PartialEq, Eq)]
struct Label {
    message: Option<String>,
    range: (usize, usize),
}

impl Label {
    fn to_codespan_label(&self, fileid: usize) -> CodespanLabel<usize> {
        CodespanLabel::new(LabelStyle::Primary, fileid, self.range.0..self.range.1)
            .with_message(self.message.clone().unwrap_or_default())
    }
}

/// Diagnostic of a particular part of source code
struct Diagnostic {
    message: String,
    level: Level,
    location: Option<(usize, Label)>,
}

impl Diagnostic {
    pub fn emit(&self, buffer: &mut Buffer, files: &SimpleFiles<String, String>) {
        if let Some((fileid, label)) = &self.location {
            let severity = match self.level {
                Level::Error => Severity::Error,
                Level::Warning => Severity::Warning,
            };

            let diagnostic = CodespanDiagnostic::new(severity)
                .with_message(&self.message)
                .with_labels(vec![label.to_codespan_label(*fileid)]);

            let config = term::Config::default();
            term::emit(buffer, &config, files, &diagnostic).expect("Failed to write diagnostic");
        } else {
            let (color, title) = match self.level {
                Level::Error => (Color::Red, "error"),
                Level::Warning => (Color::Yellow, "warning"),
            };

            buffer
                .set_color(ColorSpec::new().set_bold(true).set_fg(Some(color)))
                .expect("Failed to set color");
            write!(buffer, "{title}").expect("Failed to write title");
            buffer
                .set_color(&ColorSpec::new())
                .expect("Failed to reset color");
            writeln!(buffer, ": {}", self.message).expect("Failed to write message");
        }
    }
}

/// Collects and prints user-facing problems of one run.
pub struct DiagnosticHandler {
    files: SimpleFiles<String, String>,
    /// avoids reporting the same problem on the same block twice
    reported: FxHashSet<(Option<BlockId>, String)>,
    error_string: String,
    errors: usize,
    warnings: usize,
    /// `color_choice` indicates whether to emit error messages w/ ANSI colors
    color_choice: ColorChoice,
    /// print diagnostics to stderr as they are emitted
    echo: bool,
}

impl Default for DiagnosticHandler {
    /// Default `DiagnosticHandler` does not emit colored error messages
    fn default() -> Self {
        Self::new(ColorChoice::Never)
    }
}

impl DiagnosticHandler {
    pub fn new(color_choice: ColorChoice) -> Self {
        Self {
            files: SimpleFiles::new(),
            reported: FxHashSet::default(),
            error_string: String::new(),
            errors: 0,
            warnings: 0,
            color_choice,
            echo: true,
        }
    }

    /// Only accumulate into [`DiagnosticHandler::error_string`] without printing.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Creates a buffer for error diagnostics
    /// (different buffers are created based on whether we want colors or not)
    fn create_buffer(&self) -> Buffer {
        if self.color_choice == ColorChoice::Never {
            Buffer::no_color()
        } else {
            Buffer::ansi()
        }
    }

    pub fn add_file(&mut self, name: String, content: String) -> usize {
        self.files.add(name, content)
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    fn record(&mut self, diagnostic: Diagnostic) {
        match diagnostic.level {
            Level::Error => self.errors += 1,
            Level::Warning => self.warnings += 1,
        }
        let mut buffer = self.create_buffer();
        diagnostic.emit(&mut buffer, &self.files);
        let msg = String::from_utf8_lossy(buffer.as_slice());
        self.error_string.push_str(&msg);
        if self.echo {
            eprint!("{msg}");
        }
    }

    /// Reports a problem with a block, pointing at its declaration if the loader recorded one.
    pub fn emit_diagnostic_block(
        &mut self,
        diagram: &Diagram,
        block: BlockId,
        message: &str,
        level: Level,
    ) {
        // the same block can be reached through several scopes
        if !self.reported.insert((Some(block), message.to_string())) {
            return;
        }
        let location = diagram.location(block).map(|(start, end, fileid)| {
            (
                fileid,
                Label {
                    message: Some(format!("in `{}`", diagram.full_name(block))),
                    range: (start, end),
                },
            )
        });
        let message = match location {
            Some(_) => message.to_string(),
            None => format!("{}: {message}", diagram.full_name(block)),
        };
        self.record(Diagnostic {
            message,
            level,
            location,
        });
    }

    /// Note: we make this function parametric over any type `R`
    /// that implements Pest's `RuleType` trait
    /// so that we can call this function from different parsers
    pub fn emit_diagnostic_parsing<R: RuleType>(
        &mut self,
        message: &str,
        fileid: usize,
        pair: &Pair<'_, R>,
        level: Level,
    ) {
        let span = pair.as_span();
        self.emit_diagnostic_lexing(message, fileid, span.start(), span.end(), level);
    }

    pub fn emit_diagnostic_lexing(
        &mut self,
        message: &str,
        fileid: usize,
        start: usize,
        end: usize,
        level: Level,
    ) {
        self.record(Diagnostic {
            message: message.to_string(),
            level,
            location: Some((
                fileid,
                Label {
                    message: Some(message.to_string()),
                    range: (start, end),
                },
            )),
        });
    }

    pub fn emit_general_message(&mut self, message: &str, level: Level) {
        if !self.reported.insert((None, message.to_string())) {
            return;
        }
        self.record(Diagnostic {
            message: message.to_string(),
            level,
            location: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use insta::Settings;
    use std::path::Path;
    use strip_ansi_escapes::strip_str;

    use super::*;
    use crate::ir::tests::build_delay_chain;

    #[test]
    fn general_messages_are_reported_once() {
        let mut handler = DiagnosticHandler::default().quiet();
        handler.emit_general_message("algebraic loop", Level::Error);
        handler.emit_general_message("algebraic loop", Level::Error);
        handler.emit_general_message("unused input", Level::Warning);
        assert_eq!(handler.error_count(), 1);
        assert_eq!(handler.warning_count(), 1);
        assert_eq!(handler.error_string().matches("algebraic loop").count(), 1);
    }

    #[test]
    fn test_emit_diagnostic() {
        let mut d = build_delay_chain();
        let z = d.block_by_name("z").unwrap();
        let c = d.block_by_name("c").unwrap();

        let mut handler = DiagnosticHandler::new(ColorChoice::Always).quiet();
        let file_id = handler.add_file(
            "delay.mdl.txt".to_string(),
            "block Constant c { Value = \"5\"; }\nblock UnitDelay z { }\n".to_string(),
        );
        d.set_location(z, 34, 55, file_id);

        handler.emit_diagnostic_block(&d, z, "Random Warning", Level::Warning);
        handler.emit_diagnostic_block(&d, c, "Random Error", Level::Error);
        handler.emit_diagnostic_block(&d, c, "Random Error", Level::Error);
        assert_eq!(handler.error_count(), 1);
        assert_eq!(handler.warning_count(), 1);
        assert!(handler.has_errors());

        let content = strip_str(handler.error_string());

        let mut settings = Settings::clone_current();
        settings.set_snapshot_path(Path::new("../tests/snapshots"));
        settings.bind(|| {
            insta::assert_snapshot!(content);
        });
    }
}
