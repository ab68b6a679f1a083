// Copyright 2024 Cornell University
// released under MIT License

//! Immutable term and formula trees.
//!
//! Terms are real-valued expressions over numbers, named symbols (model variables
//! and constants) and port placeholders. Port placeholders are what the macro
//! engine eliminates; a finished model mentions no ports.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use crate::ir::PortId;

/// A real literal with total equality so that terms can be compared and hashed structurally.
#[derive(Debug, Clone, Copy)]
pub struct Number(f64);

impl Number {
    pub const ZERO: Number = Number(0.0);
    pub const ONE: Number = Number(1.0);

    pub fn new(value: f64) -> Self {
        // -0.0 and 0.0 are the same literal
        if value == 0.0 {
            Number(0.0)
        } else {
            Number(value)
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_finite(self) -> bool {
        self.0.is_finite()
    }

    pub fn is_integer(self) -> bool {
        self.0.is_finite() && self.0.fract() == 0.0
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Number {}

impl Hash for Number {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Number::new(value)
    }
}

impl From<i32> for Number {
    fn from(value: i32) -> Self {
        Number::new(value as f64)
    }
}

impl std::fmt::Display for Number {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_integer() && self.0.abs() < 1e15 {
            write!(f, "{}", self.0 as i64)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Reference to an output port, or to one element of a vector-valued output port.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortRef {
    pub port: PortId,
    pub element: Option<u32>,
}

impl PortRef {
    pub fn whole(port: PortId) -> Self {
        Self {
            port,
            element: None,
        }
    }

    pub fn element(port: PortId, element: u32) -> Self {
        Self {
            port,
            element: Some(element),
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Func {
    Min,
    Max,
    Abs,
}

impl Func {
    pub fn name(self) -> &'static str {
        match self {
            Func::Min => "min",
            Func::Max => "max",
            Func::Abs => "abs",
        }
    }

    pub fn from_name(name: &str) -> Option<Func> {
        match name {
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            "abs" => Some(Func::Abs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Term {
    Num(Number),
    Sym(String),
    Port(PortRef),
    Neg(Box<Term>),
    Add(Vec<Term>),
    Sub(Box<Term>, Box<Term>),
    Mul(Vec<Term>),
    Div(Box<Term>, Box<Term>),
    Pow(Box<Term>, Box<Term>),
    Call(Func, Vec<Term>),
}

impl Term {
    pub fn num(value: impl Into<Number>) -> Term {
        Term::Num(value.into())
    }

    pub fn zero() -> Term {
        Term::Num(Number::ZERO)
    }

    pub fn one() -> Term {
        Term::Num(Number::ONE)
    }

    pub fn sym(name: impl Into<String>) -> Term {
        Term::Sym(name.into())
    }

    pub fn port(port: PortId) -> Term {
        Term::Port(PortRef::whole(port))
    }

    pub fn port_element(port: PortId, element: u32) -> Term {
        Term::Port(PortRef::element(port, element))
    }

    pub fn neg(self) -> Term {
        Term::Neg(Box::new(self))
    }

    pub fn plus(self, rhs: Term) -> Term {
        Term::Add(vec![self, rhs])
    }

    pub fn minus(self, rhs: Term) -> Term {
        Term::Sub(Box::new(self), Box::new(rhs))
    }

    pub fn times(self, rhs: Term) -> Term {
        Term::Mul(vec![self, rhs])
    }

    pub fn over(self, rhs: Term) -> Term {
        Term::Div(Box::new(self), Box::new(rhs))
    }

    pub fn pow(self, rhs: Term) -> Term {
        Term::Pow(Box::new(self), Box::new(rhs))
    }

    pub fn call(func: Func, args: Vec<Term>) -> Term {
        Term::Call(func, args)
    }

    pub fn rel(self, op: RelOp, rhs: Term) -> Formula {
        Formula::Rel(self, op, rhs)
    }

    pub fn eq(self, rhs: Term) -> Formula {
        self.rel(RelOp::Eq, rhs)
    }

    pub fn ne(self, rhs: Term) -> Formula {
        self.rel(RelOp::Ne, rhs)
    }

    pub fn lt(self, rhs: Term) -> Formula {
        self.rel(RelOp::Lt, rhs)
    }

    pub fn le(self, rhs: Term) -> Formula {
        self.rel(RelOp::Le, rhs)
    }

    pub fn gt(self, rhs: Term) -> Formula {
        self.rel(RelOp::Gt, rhs)
    }

    pub fn ge(self, rhs: Term) -> Formula {
        self.rel(RelOp::Ge, rhs)
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Term::Num(n) => Some(*n),
            Term::Neg(inner) => inner.as_number().map(|n| Number::new(-n.value())),
            _ => None,
        }
    }

    /// Rebuilds the term bottom-up, replacing every node for which `f` returns `Some`.
    /// Replacements are not visited again.
    pub fn replace(&self, f: &impl Fn(&Term) -> Option<Term>) -> Term {
        if let Some(t) = f(self) {
            return t;
        }
        match self {
            Term::Num(_) | Term::Sym(_) | Term::Port(_) => self.clone(),
            Term::Neg(inner) => Term::Neg(Box::new(inner.replace(f))),
            Term::Add(args) => Term::Add(args.iter().map(|a| a.replace(f)).collect()),
            Term::Mul(args) => Term::Mul(args.iter().map(|a| a.replace(f)).collect()),
            Term::Sub(a, b) => Term::Sub(Box::new(a.replace(f)), Box::new(b.replace(f))),
            Term::Div(a, b) => Term::Div(Box::new(a.replace(f)), Box::new(b.replace(f))),
            Term::Pow(a, b) => Term::Pow(Box::new(a.replace(f)), Box::new(b.replace(f))),
            Term::Call(func, args) => {
                Term::Call(*func, args.iter().map(|a| a.replace(f)).collect())
            }
        }
    }

    /// Renames symbols according to `rename`; unknown symbols are kept.
    pub fn rename(&self, rename: &impl Fn(&str) -> Option<Term>) -> Term {
        self.replace(&|t| match t {
            Term::Sym(name) => rename(name),
            _ => None,
        })
    }

    pub fn visit(&self, f: &mut impl FnMut(&Term)) {
        f(self);
        match self {
            Term::Num(_) | Term::Sym(_) | Term::Port(_) => {}
            Term::Neg(inner) => inner.visit(f),
            Term::Add(args) | Term::Mul(args) | Term::Call(_, args) => {
                for a in args {
                    a.visit(f);
                }
            }
            Term::Sub(a, b) | Term::Div(a, b) | Term::Pow(a, b) => {
                a.visit(f);
                b.visit(f);
            }
        }
    }

    /// all port references, in order of first occurrence
    pub fn ports(&self) -> Vec<PortRef> {
        let mut out = Vec::new();
        self.collect_ports(&mut out);
        out
    }

    pub(crate) fn collect_ports(&self, out: &mut Vec<PortRef>) {
        self.visit(&mut |t| {
            if let Term::Port(r) = t {
                if !out.contains(r) {
                    out.push(*r);
                }
            }
        });
    }

    /// all symbol names, in order of first occurrence
    pub fn symbols(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_symbols(&mut out);
        out
    }

    pub(crate) fn collect_symbols(&self, out: &mut Vec<String>) {
        self.visit(&mut |t| {
            if let Term::Sym(s) = t {
                if !out.contains(s) {
                    out.push(s.clone());
                }
            }
        });
    }

    pub fn contains(&self, needle: &Term) -> bool {
        let mut found = false;
        self.visit(&mut |t| found |= t == needle);
        found
    }

    /// Numeric value under a symbol assignment; `None` if a symbol or port is unknown.
    pub fn eval(&self, lookup: &impl Fn(&str) -> Option<f64>) -> Option<f64> {
        Some(match self {
            Term::Num(n) => n.value(),
            Term::Sym(s) => lookup(s)?,
            Term::Port(_) => return None,
            Term::Neg(inner) => -inner.eval(lookup)?,
            Term::Add(args) => {
                let mut acc = 0.0;
                for a in args {
                    acc += a.eval(lookup)?;
                }
                acc
            }
            Term::Mul(args) => {
                let mut acc = 1.0;
                for a in args {
                    acc *= a.eval(lookup)?;
                }
                acc
            }
            Term::Sub(a, b) => a.eval(lookup)? - b.eval(lookup)?,
            Term::Div(a, b) => a.eval(lookup)? / b.eval(lookup)?,
            Term::Pow(a, b) => a.eval(lookup)?.powf(b.eval(lookup)?),
            Term::Call(func, args) => {
                let values: Option<Vec<f64>> = args.iter().map(|a| a.eval(lookup)).collect();
                let values = values?;
                match func {
                    Func::Min => values.into_iter().reduce(f64::min)?,
                    Func::Max => values.into_iter().reduce(f64::max)?,
                    Func::Abs => values.first()?.abs(),
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelOp {
    /// the operator of the exact logical negation
    pub fn negate(self) -> RelOp {
        match self {
            RelOp::Eq => RelOp::Ne,
            RelOp::Ne => RelOp::Eq,
            RelOp::Lt => RelOp::Ge,
            RelOp::Le => RelOp::Gt,
            RelOp::Gt => RelOp::Le,
            RelOp::Ge => RelOp::Lt,
        }
    }

    /// the operator obtained by swapping both sides
    pub fn flip(self) -> RelOp {
        match self {
            RelOp::Eq | RelOp::Ne => self,
            RelOp::Lt => RelOp::Gt,
            RelOp::Le => RelOp::Ge,
            RelOp::Gt => RelOp::Lt,
            RelOp::Ge => RelOp::Le,
        }
    }

    pub fn is_strict(self) -> bool {
        matches!(self, RelOp::Lt | RelOp::Gt)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            RelOp::Eq => "=",
            RelOp::Ne => "!=",
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
        }
    }

    /// Orderings of the two sides the relation admits, as a `<`, `=`, `>` bit set.
    fn outcomes(self) -> u8 {
        const LT: u8 = 1;
        const EQ: u8 = 2;
        const GT: u8 = 4;
        match self {
            RelOp::Eq => EQ,
            RelOp::Ne => LT | GT,
            RelOp::Lt => LT,
            RelOp::Le => LT | EQ,
            RelOp::Gt => GT,
            RelOp::Ge => GT | EQ,
        }
    }

    pub fn holds(self, a: f64, b: f64) -> bool {
        match self {
            RelOp::Eq => a == b,
            RelOp::Ne => a != b,
            RelOp::Lt => a < b,
            RelOp::Le => a <= b,
            RelOp::Gt => a > b,
            RelOp::Ge => a >= b,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Formula {
    True,
    False,
    Rel(Term, RelOp, Term),
    And(Vec<Formula>),
    Or(Vec<Formula>),
    Not(Box<Formula>),
    Implies(Box<Formula>, Box<Formula>),
    Forall(String, Box<Formula>),
    Exists(String, Box<Formula>),
}

impl Formula {
    /// Conjunction that drops `true` operands, flattens nested conjunctions and
    /// collapses to `false` as soon as one operand is `false`.
    pub fn and(parts: impl IntoIterator<Item = Formula>) -> Formula {
        let mut out: Vec<Formula> = Vec::new();
        for p in parts {
            match p {
                Formula::True => {}
                Formula::False => return Formula::False,
                Formula::And(inner) => {
                    for i in inner {
                        if !out.contains(&i) {
                            out.push(i);
                        }
                    }
                }
                other => {
                    if !out.contains(&other) {
                        out.push(other);
                    }
                }
            }
        }
        match out.len() {
            0 => Formula::True,
            1 => out.pop().unwrap_or(Formula::True),
            _ => Formula::And(out),
        }
    }

    /// Disjunction, dual to [`Formula::and`].
    pub fn or(parts: impl IntoIterator<Item = Formula>) -> Formula {
        let mut out: Vec<Formula> = Vec::new();
        for p in parts {
            match p {
                Formula::False => {}
                Formula::True => return Formula::True,
                Formula::Or(inner) => {
                    for i in inner {
                        if !out.contains(&i) {
                            out.push(i);
                        }
                    }
                }
                other => {
                    if !out.contains(&other) {
                        out.push(other);
                    }
                }
            }
        }
        match out.len() {
            0 => Formula::False,
            1 => out.pop().unwrap_or(Formula::False),
            _ => Formula::Or(out),
        }
    }

    pub fn implies(self, rhs: Formula) -> Formula {
        Formula::Implies(Box::new(self), Box::new(rhs))
    }

    pub fn forall(var: impl Into<String>, body: Formula) -> Formula {
        Formula::Forall(var.into(), Box::new(body))
    }

    pub fn exists(var: impl Into<String>, body: Formula) -> Formula {
        Formula::Exists(var.into(), Box::new(body))
    }

    /// Exact logical negation with the negation pushed down to the relations,
    /// so `x >= t` becomes `x < t` rather than `!(x >= t)`.
    pub fn negate(&self) -> Formula {
        match self {
            Formula::True => Formula::False,
            Formula::False => Formula::True,
            Formula::Rel(a, op, b) => Formula::Rel(a.clone(), op.negate(), b.clone()),
            Formula::And(parts) => Formula::or(parts.iter().map(Formula::negate)),
            Formula::Or(parts) => Formula::and(parts.iter().map(Formula::negate)),
            Formula::Not(inner) => (**inner).clone(),
            Formula::Implies(a, b) => Formula::and([(**a).clone(), b.negate()]),
            Formula::Forall(v, body) => Formula::exists(v.clone(), body.negate()),
            Formula::Exists(v, body) => Formula::forall(v.clone(), body.negate()),
        }
    }

    /// True if the formula is syntactically unsatisfiable: `false`, a
    /// conjunction holding both an operand and its negation, or a conjunction
    /// comparing the same two terms with incompatible operators.
    pub fn is_trivially_false(&self) -> bool {
        match self {
            Formula::False => true,
            Formula::And(parts) => {
                parts.iter().any(Formula::is_trivially_false)
                    || parts.iter().enumerate().any(|(i, p)| {
                        parts[i + 1..]
                            .iter()
                            .any(|q| *q == p.negate() || incompatible(p, q))
                    })
            }
            _ => false,
        }
    }

    /// Rewrites every term appearing in a relation.
    pub fn map_terms(&self, f: &impl Fn(&Term) -> Term) -> Formula {
        match self {
            Formula::True | Formula::False => self.clone(),
            Formula::Rel(a, op, b) => Formula::Rel(f(a), *op, f(b)),
            Formula::And(parts) => Formula::And(parts.iter().map(|p| p.map_terms(f)).collect()),
            Formula::Or(parts) => Formula::Or(parts.iter().map(|p| p.map_terms(f)).collect()),
            Formula::Not(inner) => Formula::Not(Box::new(inner.map_terms(f))),
            Formula::Implies(a, b) => {
                Formula::Implies(Box::new(a.map_terms(f)), Box::new(b.map_terms(f)))
            }
            Formula::Forall(v, body) => Formula::Forall(v.clone(), Box::new(body.map_terms(f))),
            Formula::Exists(v, body) => Formula::Exists(v.clone(), Box::new(body.map_terms(f))),
        }
    }

    pub fn visit_terms(&self, f: &mut impl FnMut(&Term)) {
        match self {
            Formula::True | Formula::False => {}
            Formula::Rel(a, _, b) => {
                f(a);
                f(b);
            }
            Formula::And(parts) | Formula::Or(parts) => {
                for p in parts {
                    p.visit_terms(f);
                }
            }
            Formula::Not(inner) | Formula::Forall(_, inner) | Formula::Exists(_, inner) => {
                inner.visit_terms(f)
            }
            Formula::Implies(a, b) => {
                a.visit_terms(f);
                b.visit_terms(f);
            }
        }
    }

    pub fn ports(&self) -> Vec<PortRef> {
        let mut out = Vec::new();
        self.visit_terms(&mut |t| t.collect_ports(&mut out));
        out
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.visit_terms(&mut |t| t.collect_symbols(&mut out));
        out
    }

    /// Truth value under a symbol assignment. Quantifiers are not evaluated.
    pub fn holds(&self, lookup: &impl Fn(&str) -> Option<f64>) -> Option<bool> {
        Some(match self {
            Formula::True => true,
            Formula::False => false,
            Formula::Rel(a, op, b) => op.holds(a.eval(lookup)?, b.eval(lookup)?),
            Formula::And(parts) => {
                let mut all = true;
                for p in parts {
                    all &= p.holds(lookup)?;
                }
                all
            }
            Formula::Or(parts) => {
                let mut any = false;
                for p in parts {
                    any |= p.holds(lookup)?;
                }
                any
            }
            Formula::Not(inner) => !inner.holds(lookup)?,
            Formula::Implies(a, b) => !a.holds(lookup)? || b.holds(lookup)?,
            Formula::Forall(..) | Formula::Exists(..) => return None,
        })
    }
}

fn incompatible(a: &Formula, b: &Formula) -> bool {
    match (a, b) {
        (Formula::Rel(l1, op1, r1), Formula::Rel(l2, op2, r2)) => {
            if l1 == l2 && r1 == r2 {
                op1.outcomes() & op2.outcomes() == 0
            } else if l1 == r2 && r1 == l2 {
                op1.outcomes() & op2.flip().outcomes() == 0
            } else {
                false
            }
        }
        _ => false,
    }
}
