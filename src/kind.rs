// Copyright 2024 Cornell University
// released under MIT License

//! Block kinds known to the synthesizer and static data about them.

use crate::ir::Params;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockKind {
    Constant,
    Inport,
    UniformRandomNumber,
    Ground,
    Clock,
    Sum,
    Product,
    Gain,
    Bias,
    Abs,
    UnaryMinus,
    MinMax,
    Sign,
    Logic,
    RelationalOperator,
    Switch,
    Relay,
    Saturation,
    UnitDelay,
    Delay,
    DiscreteIntegrator,
    Integrator,
    Mux,
    Demux,
    SubSystem,
    Outport,
    Terminator,
    Scope,
    Display,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Sources,
    Math,
    Logic,
    Discontinuities,
    Discrete,
    Continuous,
    Routing,
    Sinks,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Sources => "Sources",
            Category::Math => "Math Operations",
            Category::Logic => "Logic and Bit Operations",
            Category::Discontinuities => "Discontinuities",
            Category::Discrete => "Discrete",
            Category::Continuous => "Continuous",
            Category::Routing => "Signal Routing",
            Category::Sinks => "Sinks",
        }
    }
}

impl BlockKind {
    pub const ALL: [BlockKind; 29] = [
        BlockKind::Constant,
        BlockKind::Inport,
        BlockKind::UniformRandomNumber,
        BlockKind::Ground,
        BlockKind::Clock,
        BlockKind::Sum,
        BlockKind::Product,
        BlockKind::Gain,
        BlockKind::Bias,
        BlockKind::Abs,
        BlockKind::UnaryMinus,
        BlockKind::MinMax,
        BlockKind::Sign,
        BlockKind::Logic,
        BlockKind::RelationalOperator,
        BlockKind::Switch,
        BlockKind::Relay,
        BlockKind::Saturation,
        BlockKind::UnitDelay,
        BlockKind::Delay,
        BlockKind::DiscreteIntegrator,
        BlockKind::Integrator,
        BlockKind::Mux,
        BlockKind::Demux,
        BlockKind::SubSystem,
        BlockKind::Outport,
        BlockKind::Terminator,
        BlockKind::Scope,
        BlockKind::Display,
    ];

    /// Type tag as it appears in model files. Some kinds accept an alias.
    pub fn from_type_name(name: &str) -> Option<BlockKind> {
        let kind = match name {
            "Signum" => BlockKind::Sign,
            "Saturate" => BlockKind::Saturation,
            "DiscreteTimeIntegrator" => BlockKind::DiscreteIntegrator,
            other => return Self::ALL.iter().copied().find(|k| k.type_name() == other),
        };
        Some(kind)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            BlockKind::Constant => "Constant",
            BlockKind::Inport => "Inport",
            BlockKind::UniformRandomNumber => "UniformRandomNumber",
            BlockKind::Ground => "Ground",
            BlockKind::Clock => "Clock",
            BlockKind::Sum => "Sum",
            BlockKind::Product => "Product",
            BlockKind::Gain => "Gain",
            BlockKind::Bias => "Bias",
            BlockKind::Abs => "Abs",
            BlockKind::UnaryMinus => "UnaryMinus",
            BlockKind::MinMax => "MinMax",
            BlockKind::Sign => "Sign",
            BlockKind::Logic => "Logic",
            BlockKind::RelationalOperator => "RelationalOperator",
            BlockKind::Switch => "Switch",
            BlockKind::Relay => "Relay",
            BlockKind::Saturation => "Saturation",
            BlockKind::UnitDelay => "UnitDelay",
            BlockKind::Delay => "Delay",
            BlockKind::DiscreteIntegrator => "DiscreteIntegrator",
            BlockKind::Integrator => "Integrator",
            BlockKind::Mux => "Mux",
            BlockKind::Demux => "Demux",
            BlockKind::SubSystem => "SubSystem",
            BlockKind::Outport => "Outport",
            BlockKind::Terminator => "Terminator",
            BlockKind::Scope => "Scope",
            BlockKind::Display => "Display",
        }
    }

    /// human readable name
    pub fn label(&self) -> &'static str {
        match self {
            BlockKind::Constant => "Constant",
            BlockKind::Inport => "In",
            BlockKind::UniformRandomNumber => "Uniform Random Number",
            BlockKind::Ground => "Ground",
            BlockKind::Clock => "Clock",
            BlockKind::Sum => "Sum",
            BlockKind::Product => "Product",
            BlockKind::Gain => "Gain",
            BlockKind::Bias => "Bias",
            BlockKind::Abs => "Abs",
            BlockKind::UnaryMinus => "Unary Minus",
            BlockKind::MinMax => "MinMax",
            BlockKind::Sign => "Sign",
            BlockKind::Logic => "Logical Operator",
            BlockKind::RelationalOperator => "Relational Operator",
            BlockKind::Switch => "Switch",
            BlockKind::Relay => "Relay",
            BlockKind::Saturation => "Saturation",
            BlockKind::UnitDelay => "Unit Delay",
            BlockKind::Delay => "Delay",
            BlockKind::DiscreteIntegrator => "Discrete-Time Integrator",
            BlockKind::Integrator => "Integrator",
            BlockKind::Mux => "Mux",
            BlockKind::Demux => "Demux",
            BlockKind::SubSystem => "Subsystem",
            BlockKind::Outport => "Out",
            BlockKind::Terminator => "Terminator",
            BlockKind::Scope => "Scope",
            BlockKind::Display => "Display",
        }
    }

    /// short glyph drawn on the block
    pub fn icon(&self) -> &'static str {
        match self {
            BlockKind::Constant => "c",
            BlockKind::Inport => "1",
            BlockKind::UniformRandomNumber => "rand",
            BlockKind::Ground => "⏚",
            BlockKind::Clock => "t",
            BlockKind::Sum => "Σ",
            BlockKind::Product => "Π",
            BlockKind::Gain => "K",
            BlockKind::Bias => "u+b",
            BlockKind::Abs => "|u|",
            BlockKind::UnaryMinus => "-u",
            BlockKind::MinMax => "min",
            BlockKind::Sign => "sgn",
            BlockKind::Logic => "AND",
            BlockKind::RelationalOperator => "<=",
            BlockKind::Switch => "⇄",
            BlockKind::Relay => "⊓",
            BlockKind::Saturation => "⟋",
            BlockKind::UnitDelay => "1/z",
            BlockKind::Delay => "z⁻ᵈ",
            BlockKind::DiscreteIntegrator => "T/(z-1)",
            BlockKind::Integrator => "1/s",
            BlockKind::Mux => "▮",
            BlockKind::Demux => "▮",
            BlockKind::SubSystem => "▢",
            BlockKind::Outport => "1",
            BlockKind::Terminator => "⊣",
            BlockKind::Scope => "⎍",
            BlockKind::Display => "#",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            BlockKind::Constant
            | BlockKind::Inport
            | BlockKind::UniformRandomNumber
            | BlockKind::Ground
            | BlockKind::Clock => Category::Sources,
            BlockKind::Sum
            | BlockKind::Product
            | BlockKind::Gain
            | BlockKind::Bias
            | BlockKind::Abs
            | BlockKind::UnaryMinus
            | BlockKind::MinMax
            | BlockKind::Sign => Category::Math,
            BlockKind::Logic | BlockKind::RelationalOperator => Category::Logic,
            BlockKind::Switch | BlockKind::Relay | BlockKind::Saturation => {
                Category::Discontinuities
            }
            BlockKind::UnitDelay | BlockKind::Delay | BlockKind::DiscreteIntegrator => {
                Category::Discrete
            }
            BlockKind::Integrator => Category::Continuous,
            BlockKind::Mux | BlockKind::Demux | BlockKind::SubSystem => Category::Routing,
            BlockKind::Outport | BlockKind::Terminator | BlockKind::Scope | BlockKind::Display => {
                Category::Sinks
            }
        }
    }

    /// Kinds whose output is a state variable rather than an expression of
    /// their input; these may be ordered before their producer.
    pub fn is_state_holding(&self) -> bool {
        matches!(
            self,
            BlockKind::UnitDelay
                | BlockKind::Delay
                | BlockKind::Integrator
                | BlockKind::DiscreteIntegrator
        )
    }

    /// Number of `(inputs, outputs)` a block of this kind has with `params`.
    /// `None` for subsystems, whose ports are declared explicitly.
    pub fn default_ports(&self, params: &Params) -> Option<(usize, usize)> {
        let count = |key: &str, default: usize| {
            params
                .get(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(default)
        };
        Some(match self {
            BlockKind::Constant
            | BlockKind::Inport
            | BlockKind::UniformRandomNumber
            | BlockKind::Ground
            | BlockKind::Clock => (0, 1),
            BlockKind::Sum => (operator_count(params.get("Inputs"), "+-"), 1),
            BlockKind::Product => (operator_count(params.get("Inputs"), "*/"), 1),
            BlockKind::MinMax => (count("Inputs", 1), 1),
            BlockKind::Logic => match params.get("Operator").map(str::trim) {
                Some("NOT") => (1, 1),
                _ => (count("Inputs", 2), 1),
            },
            BlockKind::RelationalOperator => (2, 1),
            BlockKind::Switch => (3, 1),
            BlockKind::Integrator => match params.get("ExternalReset").map(str::trim) {
                None | Some("none") => (1, 1),
                Some(_) => (2, 1),
            },
            BlockKind::Mux => (count("Inputs", 2), 1),
            BlockKind::Demux => (1, count("Outputs", 2)),
            BlockKind::SubSystem => return None,
            BlockKind::Outport | BlockKind::Terminator | BlockKind::Scope | BlockKind::Display => {
                (1, 0)
            }
            _ => (1, 1),
        })
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Expands an `Inputs` parameter into one operator per port.
///
/// The parameter is either a port count (all ports use the first operator in
/// `ops`) or a string of operator characters, where `|` is a spacer and
/// carries no port.
pub fn operator_list(signs: Option<&str>, ops: &str) -> Result<Vec<char>, String> {
    let first = ops.chars().next().unwrap_or('+');
    let signs = match signs.map(str::trim) {
        None | Some("") => return Ok(vec![first; 2]),
        Some(s) => s,
    };
    if let Ok(n) = signs.parse::<usize>() {
        if n == 0 {
            return Err("a block needs at least one input".to_string());
        }
        return Ok(vec![first; n]);
    }
    let mut out = Vec::new();
    for c in signs.chars() {
        if c == '|' {
            continue;
        }
        if !ops.contains(c) {
            return Err(format!("unexpected operator `{c}` in `{signs}`"));
        }
        out.push(c);
    }
    if out.is_empty() {
        return Err(format!("no inputs in `{signs}`"));
    }
    Ok(out)
}

fn operator_count(signs: Option<&str>, ops: &str) -> usize {
    operator_list(signs, ops).map(|l| l.len()).unwrap_or(2)
}
