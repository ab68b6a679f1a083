// Copyright 2024 Cornell University
// released under MIT License

//! Hybrid programs and the fragments blocks contribute to them.

use std::cmp::Ordering;

use rustc_hash::FxHashMap;

use crate::ir::BlockId;
use crate::term::{Formula, Number, PortRef, Term};

/// System of differential equations `x1' = t1, ..., xn' = tn & domain`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Ode {
    pub equations: Vec<(String, Term)>,
    pub domain: Formula,
}

impl Ode {
    pub fn new(equations: Vec<(String, Term)>, domain: Formula) -> Self {
        Self { equations, domain }
    }

    pub fn map_terms(&self, f: &impl Fn(&Term) -> Term) -> Ode {
        Ode {
            equations: self
                .equations
                .iter()
                .map(|(x, t)| (x.clone(), f(t)))
                .collect(),
            domain: self.domain.map_terms(f),
        }
    }

    pub fn ports(&self) -> Vec<PortRef> {
        let mut out = Vec::new();
        for (_, t) in &self.equations {
            t.collect_ports(&mut out);
        }
        for p in self.domain.ports() {
            if !out.contains(&p) {
                out.push(p);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum HybridProgram {
    Assign(String, Term),
    /// nondeterministic assignment `x := *`
    AssignAny(String),
    Test(Formula),
    Evolve(Ode),
    Seq(Vec<HybridProgram>),
    Choice(Vec<HybridProgram>),
    Loop(Box<HybridProgram>),
}

impl HybridProgram {
    pub fn skip() -> HybridProgram {
        HybridProgram::Test(Formula::True)
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, HybridProgram::Test(Formula::True))
            || matches!(self, HybridProgram::Seq(parts) if parts.is_empty())
    }

    pub fn assign(var: impl Into<String>, value: Term) -> HybridProgram {
        HybridProgram::Assign(var.into(), value)
    }

    pub fn test(cond: Formula) -> HybridProgram {
        HybridProgram::Test(cond)
    }

    /// Sequential composition that flattens nested sequences and drops `?true`.
    pub fn seq(parts: impl IntoIterator<Item = HybridProgram>) -> HybridProgram {
        let mut out = Vec::new();
        for p in parts {
            match p {
                HybridProgram::Seq(inner) => out.extend(inner),
                p if p.is_skip() => {}
                p => out.push(p),
            }
        }
        match out.len() {
            0 => HybridProgram::skip(),
            1 => out.pop().unwrap_or_else(HybridProgram::skip),
            _ => HybridProgram::Seq(out),
        }
    }

    /// Nondeterministic choice that flattens nested choices.
    pub fn choice(parts: impl IntoIterator<Item = HybridProgram>) -> HybridProgram {
        let mut out = Vec::new();
        for p in parts {
            match p {
                HybridProgram::Choice(inner) => out.extend(inner),
                p => out.push(p),
            }
        }
        match out.len() {
            0 => HybridProgram::test(Formula::False),
            1 => out.pop().unwrap_or_else(HybridProgram::skip),
            _ => HybridProgram::Choice(out),
        }
    }

    pub fn repeat(body: HybridProgram) -> HybridProgram {
        HybridProgram::Loop(Box::new(body))
    }

    pub fn map_terms(&self, f: &impl Fn(&Term) -> Term) -> HybridProgram {
        match self {
            HybridProgram::Assign(x, t) => HybridProgram::Assign(x.clone(), f(t)),
            HybridProgram::AssignAny(x) => HybridProgram::AssignAny(x.clone()),
            HybridProgram::Test(c) => HybridProgram::Test(c.map_terms(f)),
            HybridProgram::Evolve(ode) => HybridProgram::Evolve(ode.map_terms(f)),
            HybridProgram::Seq(parts) => {
                HybridProgram::Seq(parts.iter().map(|p| p.map_terms(f)).collect())
            }
            HybridProgram::Choice(parts) => {
                HybridProgram::Choice(parts.iter().map(|p| p.map_terms(f)).collect())
            }
            HybridProgram::Loop(body) => HybridProgram::Loop(Box::new(body.map_terms(f))),
        }
    }

    /// Replaces symbols according to `map`. Written variables are renamed when
    /// they map onto another symbol and kept otherwise.
    pub fn rename(&self, map: &FxHashMap<String, Term>) -> HybridProgram {
        let var = |x: &String| match map.get(x) {
            Some(Term::Sym(name)) => name.clone(),
            _ => x.clone(),
        };
        let term = |t: &Term| t.rename(&|s| map.get(s).cloned());
        match self {
            HybridProgram::Assign(x, t) => HybridProgram::Assign(var(x), term(t)),
            HybridProgram::AssignAny(x) => HybridProgram::AssignAny(var(x)),
            HybridProgram::Test(c) => HybridProgram::Test(c.map_terms(&term)),
            HybridProgram::Evolve(ode) => HybridProgram::Evolve(Ode::new(
                ode.equations.iter().map(|(x, t)| (var(x), term(t))).collect(),
                ode.domain.map_terms(&term),
            )),
            HybridProgram::Seq(parts) => {
                HybridProgram::Seq(parts.iter().map(|p| p.rename(map)).collect())
            }
            HybridProgram::Choice(parts) => {
                HybridProgram::Choice(parts.iter().map(|p| p.rename(map)).collect())
            }
            HybridProgram::Loop(body) => HybridProgram::Loop(Box::new(body.rename(map))),
        }
    }

    pub fn ports(&self) -> Vec<PortRef> {
        let mut out = Vec::new();
        self.collect_ports(&mut out);
        out
    }

    fn collect_ports(&self, out: &mut Vec<PortRef>) {
        let push_all = |ps: Vec<PortRef>, out: &mut Vec<PortRef>| {
            for p in ps {
                if !out.contains(&p) {
                    out.push(p);
                }
            }
        };
        match self {
            HybridProgram::Assign(_, t) => t.collect_ports(out),
            HybridProgram::AssignAny(_) => {}
            HybridProgram::Test(c) => push_all(c.ports(), out),
            HybridProgram::Evolve(ode) => push_all(ode.ports(), out),
            HybridProgram::Seq(parts) | HybridProgram::Choice(parts) => {
                for p in parts {
                    p.collect_ports(out);
                }
            }
            HybridProgram::Loop(body) => body.collect_ports(out),
        }
    }

    /// variables written by assignments or evolutions, in order of first occurrence
    pub fn bound_variables(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        self.collect_bound(&mut out);
        out
    }

    fn collect_bound(&self, out: &mut Vec<String>) {
        let push = |x: &String, out: &mut Vec<String>| {
            if !out.contains(x) {
                out.push(x.clone());
            }
        };
        match self {
            HybridProgram::Assign(x, _) | HybridProgram::AssignAny(x) => push(x, out),
            HybridProgram::Test(_) => {}
            HybridProgram::Evolve(ode) => {
                for (x, _) in &ode.equations {
                    push(x, out);
                }
            }
            HybridProgram::Seq(parts) | HybridProgram::Choice(parts) => {
                for p in parts {
                    p.collect_bound(out);
                }
            }
            HybridProgram::Loop(body) => body.collect_bound(out),
        }
    }

    /// symbols read anywhere in the program
    pub fn symbols(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut Vec<String>) {
        let push_all = |ss: Vec<String>, out: &mut Vec<String>| {
            for s in ss {
                if !out.contains(&s) {
                    out.push(s);
                }
            }
        };
        match self {
            HybridProgram::Assign(_, t) => t.collect_symbols(out),
            HybridProgram::AssignAny(_) => {}
            HybridProgram::Test(c) => push_all(c.symbols(), out),
            HybridProgram::Evolve(ode) => {
                for (_, t) in &ode.equations {
                    t.collect_symbols(out);
                }
                push_all(ode.domain.symbols(), out);
            }
            HybridProgram::Seq(parts) | HybridProgram::Choice(parts) => {
                for p in parts {
                    p.collect_symbols(out);
                }
            }
            HybridProgram::Loop(body) => body.collect_symbols(out),
        }
    }
}

/// Rate at which a block executes.
///
/// Follows the usual diagram convention: `-1` inherits the rate of the
/// surrounding step, `0` is continuous, a positive value is a period.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum SampleTime {
    Inherited,
    Continuous,
    Discrete(Number),
}

impl SampleTime {
    /// `None` for negative values other than `-1`
    pub fn from_number(n: Number) -> Option<SampleTime> {
        let v = n.value();
        if v == -1.0 {
            Some(SampleTime::Inherited)
        } else if v == 0.0 {
            Some(SampleTime::Continuous)
        } else if v > 0.0 && v.is_finite() {
            Some(SampleTime::Discrete(n))
        } else {
            None
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SampleTime::Inherited => 0,
            SampleTime::Continuous => 1,
            SampleTime::Discrete(_) => 2,
        }
    }
}

impl PartialOrd for SampleTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SampleTime {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SampleTime::Discrete(a), SampleTime::Discrete(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl std::fmt::Display for SampleTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleTime::Inherited => write!(f, "inherited"),
            SampleTime::Continuous => write!(f, "continuous"),
            SampleTime::Discrete(n) => write!(f, "every {n}"),
        }
    }
}

/// All discrete statements that fire together at one sample time.
///
/// `statements` run first and in order. `commits` hold the state updates of
/// one block each; they all read the values from before the step, so they are
/// ordered against each other only once macros are substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscreteBehavior {
    pub sample_time: SampleTime,
    pub statements: Vec<HybridProgram>,
    pub commits: Vec<Vec<HybridProgram>>,
}

impl DiscreteBehavior {
    pub fn new(sample_time: SampleTime) -> Self {
        Self {
            sample_time,
            statements: Vec::new(),
            commits: Vec::new(),
        }
    }

    pub fn append(&mut self, stmt: HybridProgram) {
        self.statements.push(stmt);
    }

    /// Adds the state update of one block.
    pub fn commit(&mut self, group: impl IntoIterator<Item = HybridProgram>) {
        self.commits.push(group.into_iter().collect());
    }

    /// Puts `stmt` in front of everything registered so far.
    pub fn prepend(&mut self, stmt: HybridProgram) {
        self.statements.insert(0, stmt);
    }

    pub fn program(&self) -> HybridProgram {
        HybridProgram::seq(
            self.statements
                .iter()
                .chain(self.commits.iter().flatten())
                .cloned(),
        )
    }
}

/// One dynamical regime of a block: an ODE active while its domain holds.
/// Containers of the same `group` are mutually exclusive alternatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuousEvolution {
    pub group: BlockId,
    pub ode: Ode,
}

/// Behavior of a service subsystem: what it assumes about its inputs and a
/// hybrid program over its named inputs, outputs and ghost variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub ghosts: Vec<String>,
    pub assumption: Formula,
    pub program: HybridProgram,
}
