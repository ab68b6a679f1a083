// Copyright 2024 Cornell University
// released under MIT License

use rustc_hash::FxHashSet;

use crate::ir::{BlockId, Diagram, PortId};
use crate::term::{Formula, Number, RelOp, Term};

/// Run-wide settings. Threaded explicitly into every transformer through [`Environment`].
#[derive(Debug, Clone, PartialEq)]
pub struct SynthConfig {
    /// Make both sides of every threshold comparison non-strict, so the two
    /// branches overlap on the boundary instead of partitioning it.
    pub overlapping_bounds: bool,
    /// Widen threshold comparisons by this margin.
    pub epsilon: Option<Number>,
    /// Upper bound on macro resolution passes before giving up.
    pub max_resolution_passes: usize,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            overlapping_bounds: false,
            epsilon: None,
            max_resolution_passes: 64,
        }
    }
}

/// Per-run collaborator handed to every transformer: looks up feeders, hands
/// out stable names, and owns the boundary policy.
pub struct Environment<'d> {
    diagram: &'d Diagram,
    config: &'d SynthConfig,
    used_names: FxHashSet<String>,
}

impl<'d> Environment<'d> {
    pub fn new(diagram: &'d Diagram, config: &'d SynthConfig) -> Self {
        Self {
            diagram,
            config,
            used_names: FxHashSet::default(),
        }
    }

    pub fn diagram(&self) -> &'d Diagram {
        self.diagram
    }

    pub fn config(&self) -> &'d SynthConfig {
        self.config
    }

    /// Output port currently feeding input `index` of `block`.
    pub fn feeding_port(&self, block: BlockId, index: usize) -> Option<PortId> {
        self.diagram.feeder(block, index)
    }

    /// Stable identifier of a port, e.g. `ctrl_sum_out1`.
    pub fn port_identifier(&self, port: PortId) -> String {
        let p = &self.diagram[port];
        format!(
            "{}_{}{}",
            sanitize(&self.diagram.full_name(p.owner())),
            p.dir(),
            p.index() + 1
        )
    }

    /// Marks `name` as taken without renaming it.
    pub fn reserve(&mut self, name: &str) -> bool {
        self.used_names.insert(name.to_string())
    }

    /// Returns a sanitized version of `base` that was not handed out before.
    /// Later requests for the same base get a `_2`, `_3`, ... suffix.
    pub fn fresh_name(&mut self, base: &str) -> String {
        let base = sanitize(base);
        if self.used_names.insert(base.clone()) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}_{n}");
            if self.used_names.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Name for a piece of state owned by `block`, e.g. `ctrl_delay_tap2`.
    pub fn block_name(&mut self, block: BlockId, suffix: &str) -> String {
        let base = self.diagram.full_name(block);
        if suffix.is_empty() {
            self.fresh_name(&base)
        } else {
            self.fresh_name(&format!("{base}_{suffix}"))
        }
    }

    /// Maps the textual operators found in block parameters onto [`RelOp`].
    pub fn canonical_relop(op: &str) -> Option<RelOp> {
        match op.trim() {
            "==" | "=" => Some(RelOp::Eq),
            "~=" | "!=" | "<>" => Some(RelOp::Ne),
            "<" => Some(RelOp::Lt),
            "<=" => Some(RelOp::Le),
            ">" => Some(RelOp::Gt),
            ">=" => Some(RelOp::Ge),
            _ => None,
        }
    }

    /// Splits `lhs op rhs` into a guard and its complement under the active
    /// boundary policy.
    ///
    /// The two guards are always jointly exhaustive. They are mutually
    /// exclusive unless `overlapping_bounds` is set, in which case both sides
    /// include the boundary (widened by `epsilon` if present).
    pub fn split(&self, lhs: Term, op: RelOp, rhs: Term) -> (Formula, Formula) {
        let overlap = self.config.overlapping_bounds;
        match self.config.epsilon {
            None => {
                let positive = Formula::Rel(lhs.clone(), op, rhs.clone());
                if overlap && op != RelOp::Eq && op != RelOp::Ne {
                    (
                        Formula::Rel(lhs.clone(), non_strict(op), rhs.clone()),
                        Formula::Rel(lhs, non_strict(op.negate()), rhs),
                    )
                } else {
                    let negative = positive.negate();
                    (positive, negative)
                }
            }
            Some(eps) => {
                let e = Term::Num(eps);
                let below = rhs.clone().minus(e.clone());
                let above = rhs.clone().plus(e);
                let positive = match op {
                    RelOp::Ge | RelOp::Gt => Formula::Rel(lhs.clone(), op, below.clone()),
                    RelOp::Le | RelOp::Lt => Formula::Rel(lhs.clone(), op, above.clone()),
                    RelOp::Eq => {
                        Formula::and([lhs.clone().ge(below.clone()), lhs.clone().le(above.clone())])
                    }
                    RelOp::Ne => {
                        Formula::or([lhs.clone().lt(below.clone()), lhs.clone().gt(above.clone())])
                    }
                };
                let negative = if overlap {
                    match op {
                        RelOp::Ge | RelOp::Gt => lhs.le(above),
                        RelOp::Le | RelOp::Lt => lhs.ge(below),
                        RelOp::Eq | RelOp::Ne => positive.negate(),
                    }
                } else {
                    positive.negate()
                };
                (positive, negative)
            }
        }
    }
}

fn non_strict(op: RelOp) -> RelOp {
    match op {
        RelOp::Lt => RelOp::Le,
        RelOp::Gt => RelOp::Ge,
        other => other,
    }
}

/// Turns a block path into something usable as a variable name.
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
