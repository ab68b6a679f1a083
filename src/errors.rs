// Copyright 2024 Cornell University
// released under MIT License

use thiserror::Error;

use crate::diagnostic::{DiagnosticHandler, Level};
use crate::ir::{BlockId, Diagram, PortId};

/// Everything that can go wrong while turning a diagram into a hybrid program.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthError {
    /// Blocks that stay cyclic even after releasing state-holding blocks
    #[error("algebraic loop through {} blocks", blocks.len())]
    ResidualCycle { blocks: Vec<BlockId> },
    #[error("no transformer registered for block type `{type_name}`")]
    UnsupportedBlock { block: BlockId, type_name: String },
    #[error("parameter `{param}` = `{value}`: {reason}")]
    BadParameter {
        block: BlockId,
        param: String,
        value: String,
        reason: String,
    },
    #[error("missing parameter `{param}`")]
    MissingParameter { block: BlockId, param: String },
    #[error("{port} is defined twice")]
    MacroConflict { port: PortId },
    #[error("macro resolution did not settle after {passes} passes")]
    MacroDivergence { passes: usize },
    #[error("{port} depends on itself")]
    AlgebraicLoop { port: PortId },
    #[error("{port} could not be resolved in {context}")]
    UnresolvedReference { port: PortId, context: String },
    /// A variant of an otherwise supported block that is skipped
    #[error("{feature} is not supported")]
    UnsupportedFeature { block: BlockId, feature: String },
    #[error("input {index} is not connected")]
    UnconnectedInput { block: BlockId, index: usize },
    #[error("{0}")]
    Parse(String),
}

pub type SynthResult<T> = std::result::Result<T, SynthError>;

impl SynthError {
    /// Fatal errors make the synthesized model unsound; the others only drop one feature.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SynthError::UnsupportedFeature { .. } | SynthError::UnconnectedInput { .. }
        )
    }

    pub fn level(&self) -> Level {
        if self.is_fatal() {
            Level::Error
        } else {
            Level::Warning
        }
    }

    pub fn bad_parameter(
        block: BlockId,
        param: &str,
        value: &str,
        reason: impl Into<String>,
    ) -> Self {
        SynthError::BadParameter {
            block,
            param: param.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(block: BlockId, feature: impl Into<String>) -> Self {
        SynthError::UnsupportedFeature {
            block,
            feature: feature.into(),
        }
    }
}

/// Describes a port by its owner, e.g. "output 2 of `ctrl/sum`".
pub fn describe_port(diagram: &Diagram, port: PortId) -> String {
    let p = &diagram[port];
    let dir = match p.dir() {
        crate::ir::Dir::In => "input",
        crate::ir::Dir::Out => "output",
    };
    format!(
        "{dir} {} of `{}`",
        p.index() + 1,
        diagram.full_name(p.owner())
    )
}

pub struct DiagnosticEmitter;

impl DiagnosticEmitter {
    /// Reports `error` against the block it concerns, falling back to a general message.
    pub fn emit_synth_error(handler: &mut DiagnosticHandler, diagram: &Diagram, error: &SynthError) {
        let level = error.level();
        match error {
            SynthError::ResidualCycle { blocks } => {
                let names: Vec<String> = blocks
                    .iter()
                    .map(|b| format!("`{}`", diagram.full_name(*b)))
                    .collect();
                handler.emit_general_message(
                    &format!(
                        "algebraic loop: {} form a cycle without a delay or integrator",
                        names.join(", ")
                    ),
                    level,
                );
                for b in blocks {
                    handler.emit_diagnostic_block(diagram, *b, "part of an algebraic loop", level);
                }
            }
            SynthError::UnsupportedBlock { block, .. }
            | SynthError::BadParameter { block, .. }
            | SynthError::MissingParameter { block, .. }
            | SynthError::UnsupportedFeature { block, .. }
            | SynthError::UnconnectedInput { block, .. } => {
                handler.emit_diagnostic_block(diagram, *block, &format!("{error}"), level);
            }
            SynthError::MacroConflict { port } => {
                let msg = format!("{} is defined twice", describe_port(diagram, *port));
                handler.emit_diagnostic_block(diagram, diagram[port].owner(), &msg, level);
            }
            SynthError::AlgebraicLoop { port } => {
                let msg = format!("{} depends on itself", describe_port(diagram, *port));
                handler.emit_diagnostic_block(diagram, diagram[port].owner(), &msg, level);
            }
            SynthError::UnresolvedReference { port, context } => {
                let msg = format!(
                    "{} could not be resolved in {context}",
                    describe_port(diagram, *port)
                );
                handler.emit_diagnostic_block(diagram, diagram[port].owner(), &msg, level);
            }
            SynthError::MacroDivergence { .. } | SynthError::Parse(_) => {
                handler.emit_general_message(&format!("{error}"), level);
            }
        }
    }
}
