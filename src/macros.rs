// Copyright 2024 Cornell University
// released under MIT License

//! Rewrite rules that replace port placeholders with closed-form expressions.

use cranelift_entity::{entity_impl, PrimaryMap};
use log::{debug, info};
use rustc_hash::FxHashMap;

use crate::errors::{SynthError, SynthResult};
use crate::hp::{HybridProgram, Ode};
use crate::ir::PortId;
use crate::term::{Formula, Func, Number, PortRef, Term};

#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MacroId(u32);
entity_impl!(MacroId, "macro");

/// Replacement registered for one output port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MacroBody {
    Simple(Term),
    /// Mutually exclusive, jointly exhaustive `(guard, value)` branches.
    Conditional(Vec<(Formula, Term)>),
    /// One body per element of a vector signal.
    Vector(Vec<MacroBody>),
    /// Elementwise `template` over `source`; becomes `Simple` or `Vector`
    /// once the shape of `source` is known.
    SizePropagation { source: PortId, template: Term },
    /// Reserved port that a later registration refines.
    Placeholder,
}

impl MacroBody {
    fn from_alternatives(mut alts: Vec<(Formula, Term)>) -> MacroBody {
        if alts.len() == 1 && alts[0].0 == Formula::True {
            if let Some((_, t)) = alts.pop() {
                return MacroBody::Simple(t);
            }
        }
        MacroBody::Conditional(alts)
    }

    /// all port references inside the body
    pub fn ports(&self) -> Vec<PortRef> {
        let mut out = Vec::new();
        self.collect_ports(&mut out);
        out
    }

    fn collect_ports(&self, out: &mut Vec<PortRef>) {
        match self {
            MacroBody::Simple(t) => t.collect_ports(out),
            MacroBody::Conditional(branches) => {
                for (g, t) in branches {
                    for p in g.ports() {
                        if !out.contains(&p) {
                            out.push(p);
                        }
                    }
                    t.collect_ports(out);
                }
            }
            MacroBody::Vector(elements) => {
                for e in elements {
                    e.collect_ports(out);
                }
            }
            MacroBody::SizePropagation { template, .. } => template.collect_ports(out),
            MacroBody::Placeholder => {}
        }
    }

    fn map_terms(&self, f: &impl Fn(&Term) -> Term) -> MacroBody {
        match self {
            MacroBody::Simple(t) => MacroBody::Simple(f(t)),
            MacroBody::Conditional(branches) => MacroBody::Conditional(
                branches
                    .iter()
                    .map(|(g, t)| (g.map_terms(f), f(t)))
                    .collect(),
            ),
            MacroBody::Vector(elements) => {
                MacroBody::Vector(elements.iter().map(|e| e.map_terms(f)).collect())
            }
            MacroBody::SizePropagation { source, template } => MacroBody::SizePropagation {
                source: *source,
                template: f(template),
            },
            MacroBody::Placeholder => MacroBody::Placeholder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macro {
    pub port: PortId,
    pub body: MacroBody,
}

impl Macro {
    /// the term this macro replaces
    pub fn target(&self) -> Term {
        Term::port(self.port)
    }
}

/// Signal dimension as far as it is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Vector(usize),
    Unknown,
}

/// Term rewriter that may be installed to clean up macro bodies before resolution.
pub trait Simplifier {
    fn simplify(&self, term: &Term) -> Term;
}

/// Folds arithmetic on literals and drops neutral elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantFolding;

impl Simplifier for ConstantFolding {
    fn simplify(&self, term: &Term) -> Term {
        fold(term)
    }
}

fn fold(term: &Term) -> Term {
    let num = |v: f64| Term::Num(Number::new(v));
    match term {
        Term::Num(_) | Term::Sym(_) | Term::Port(_) => term.clone(),
        Term::Neg(inner) => match fold(inner) {
            Term::Num(n) => num(-n.value()),
            Term::Neg(x) => *x,
            other => other.neg(),
        },
        Term::Add(args) => {
            let mut acc = 0.0;
            let mut rest = Vec::new();
            for a in args {
                match fold(a) {
                    Term::Num(n) => acc += n.value(),
                    other => rest.push(other),
                }
            }
            if acc != 0.0 || rest.is_empty() {
                rest.push(num(acc));
            }
            if rest.len() == 1 {
                rest.pop().unwrap_or_else(Term::zero)
            } else {
                Term::Add(rest)
            }
        }
        Term::Mul(args) => {
            let mut acc = 1.0;
            let mut rest = Vec::new();
            for a in args {
                match fold(a) {
                    Term::Num(n) => acc *= n.value(),
                    other => rest.push(other),
                }
            }
            if acc == 0.0 {
                return Term::zero();
            }
            if acc != 1.0 || rest.is_empty() {
                rest.insert(0, num(acc));
            }
            if rest.len() == 1 {
                rest.pop().unwrap_or_else(Term::one)
            } else {
                Term::Mul(rest)
            }
        }
        Term::Sub(a, b) => match (fold(a), fold(b)) {
            (Term::Num(x), Term::Num(y)) => num(x.value() - y.value()),
            (a, Term::Num(y)) if y == Number::ZERO => a,
            (Term::Num(x), b) if x == Number::ZERO => b.neg(),
            (a, b) => a.minus(b),
        },
        Term::Div(a, b) => match (fold(a), fold(b)) {
            (Term::Num(x), Term::Num(y)) if y != Number::ZERO => num(x.value() / y.value()),
            (a, Term::Num(y)) if y == Number::ONE => a,
            (a, b) => a.over(b),
        },
        Term::Pow(a, b) => match (fold(a), fold(b)) {
            (Term::Num(x), Term::Num(y)) => num(x.value().powf(y.value())),
            (a, Term::Num(y)) if y == Number::ONE => a,
            (a, b) => a.pow(b),
        },
        Term::Call(func, args) => {
            let args: Vec<Term> = args.iter().map(fold).collect();
            let values: Option<Vec<f64>> = args
                .iter()
                .map(|a| a.as_number().map(Number::value))
                .collect();
            match (func, values) {
                (Func::Min, Some(vs)) if !vs.is_empty() => {
                    num(vs.into_iter().fold(f64::INFINITY, f64::min))
                }
                (Func::Max, Some(vs)) if !vs.is_empty() => {
                    num(vs.into_iter().fold(f64::NEG_INFINITY, f64::max))
                }
                (Func::Abs, Some(vs)) if vs.len() == 1 => num(vs[0].abs()),
                _ => Term::Call(*func, args),
            }
        }
    }
}

/// Selects element `k` of every whole-port reference in `term`.
pub(crate) fn project(term: &Term, k: u32) -> Term {
    term.replace(&|t| match t {
        Term::Port(PortRef {
            port,
            element: None,
        }) => Some(Term::port_element(*port, k)),
        _ => None,
    })
}

fn substitute(term: &Term, subst: &FxHashMap<PortRef, Term>) -> Term {
    if subst.is_empty() {
        return term.clone();
    }
    term.replace(&|t| match t {
        Term::Port(r) => subst.get(r).cloned(),
        _ => None,
    })
}

type Combination = (Formula, FxHashMap<PortRef, Term>);

/// Holds every registered macro and resolves them against each other.
pub struct MacroEngine {
    macros: PrimaryMap<MacroId, Macro>,
    by_port: FxHashMap<PortId, MacroId>,
    simplifier: Option<Box<dyn Simplifier>>,
    /// initial conditions still mentioning ports
    init: Vec<Formula>,
    max_passes: usize,
    resolved: bool,
}

impl MacroEngine {
    pub fn new(max_passes: usize) -> Self {
        Self {
            macros: PrimaryMap::new(),
            by_port: FxHashMap::default(),
            simplifier: None,
            init: Vec::new(),
            max_passes,
            resolved: false,
        }
    }

    pub fn set_simplifier(&mut self, simplifier: Box<dyn Simplifier>) {
        self.simplifier = Some(simplifier);
    }

    /// Registers the replacement of `port`. A placeholder may be refined once;
    /// any other second registration is a conflict.
    pub fn register(&mut self, port: PortId, body: MacroBody) -> SynthResult<MacroId> {
        if let Some(&id) = self.by_port.get(&port) {
            if self.macros[id].body == MacroBody::Placeholder {
                debug!("refining placeholder of {port}");
                self.macros[id].body = body;
                self.resolved = false;
                return Ok(id);
            }
            if body == MacroBody::Placeholder {
                return Ok(id);
            }
            return Err(SynthError::MacroConflict { port });
        }
        let id = self.macros.push(Macro { port, body });
        self.by_port.insert(port, id);
        self.resolved = false;
        Ok(id)
    }

    pub fn get(&self, port: PortId) -> Option<&Macro> {
        self.by_port.get(&port).map(|id| &self.macros[*id])
    }

    pub fn macros(&self) -> impl Iterator<Item = &Macro> {
        self.macros.values()
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    /// ports that were reserved but never defined
    pub fn placeholders(&self) -> Vec<PortId> {
        self.macros
            .values()
            .filter(|m| m.body == MacroBody::Placeholder)
            .map(|m| m.port)
            .collect()
    }

    /// Queues an initial condition. It is rewritten by [`MacroEngine::resolve_all`].
    pub fn push_init(&mut self, f: Formula) {
        if f != Formula::True {
            self.init.push(f);
        }
    }

    pub fn init(&self) -> &[Formula] {
        &self.init
    }

    pub fn shape_of(&self, port: PortId) -> Shape {
        self.shape_inner(port, &mut Vec::new())
    }

    pub fn term_shape(&self, term: &Term) -> Shape {
        self.term_shape_inner(term, &mut Vec::new())
    }

    fn shape_inner(&self, port: PortId, visiting: &mut Vec<PortId>) -> Shape {
        if visiting.contains(&port) {
            return Shape::Unknown;
        }
        let Some(m) = self.get(port) else {
            return Shape::Unknown;
        };
        visiting.push(port);
        let shape = match &m.body {
            MacroBody::Simple(t) => self.term_shape_inner(t, visiting),
            MacroBody::Conditional(branches) => match branches.first() {
                Some((_, t)) => self.term_shape_inner(t, visiting),
                None => Shape::Unknown,
            },
            MacroBody::Vector(elements) => Shape::Vector(elements.len()),
            MacroBody::SizePropagation { source, .. } => self.shape_inner(*source, visiting),
            MacroBody::Placeholder => Shape::Unknown,
        };
        visiting.pop();
        shape
    }

    fn term_shape_inner(&self, term: &Term, visiting: &mut Vec<PortId>) -> Shape {
        let mut shape = Shape::Scalar;
        for r in term.ports() {
            if r.element.is_some() {
                continue;
            }
            match self.shape_inner(r.port, visiting) {
                Shape::Vector(n) => return Shape::Vector(n),
                Shape::Unknown => shape = Shape::Unknown,
                Shape::Scalar => {}
            }
        }
        shape
    }

    /// One-step alternatives for a single reference, `None` if it stays as is.
    fn lookup(&self, r: &PortRef) -> Option<Vec<(Formula, Term)>> {
        let m = self.get(r.port)?;
        Self::body_alternatives(&m.body, r.element)
    }

    fn body_alternatives(body: &MacroBody, element: Option<u32>) -> Option<Vec<(Formula, Term)>> {
        match (body, element) {
            (MacroBody::Simple(t), None) => Some(vec![(Formula::True, t.clone())]),
            (MacroBody::Simple(t), Some(k)) => Some(vec![(Formula::True, project(t, k))]),
            (MacroBody::Conditional(branches), None) => Some(branches.clone()),
            (MacroBody::Conditional(branches), Some(k)) => Some(
                branches
                    .iter()
                    .map(|(g, t)| (g.map_terms(&|x| project(x, k)), project(t, k)))
                    .collect(),
            ),
            (MacroBody::Vector(elements), Some(k)) => elements
                .get(k as usize)
                .and_then(|e| Self::body_alternatives(e, None)),
            (MacroBody::Vector(_), None) => None,
            (MacroBody::SizePropagation { .. }, _) | (MacroBody::Placeholder, _) => None,
        }
    }

    /// Cartesian product of the alternatives of every reference in `refs`,
    /// dropping combinations whose guards contradict each other.
    fn combinations(&self, refs: &[PortRef]) -> Vec<Combination> {
        let mut combos: Vec<Combination> = vec![(Formula::True, FxHashMap::default())];
        for r in refs {
            let Some(alts) = self.lookup(r) else {
                continue;
            };
            let mut next = Vec::with_capacity(combos.len() * alts.len());
            for (guard, subst) in &combos {
                for (g, t) in &alts {
                    let guard = Formula::and([guard.clone(), g.clone()]);
                    if guard.is_trivially_false() {
                        continue;
                    }
                    let mut subst = subst.clone();
                    subst.insert(*r, t.clone());
                    next.push((guard, subst));
                }
            }
            combos = next;
        }
        combos
    }

    /// Substitutes every reference in `term` once.
    fn expand_term(&self, term: &Term) -> Vec<(Formula, Term)> {
        self.combinations(&term.ports())
            .into_iter()
            .map(|(g, s)| (g, substitute(term, &s)))
            .collect()
    }

    /// Substitutes every reference in `f` once, lifting conditional
    /// replacements into a disjunction over their branches.
    fn expand_formula(&self, f: &Formula) -> Formula {
        match f {
            Formula::True | Formula::False => f.clone(),
            Formula::Rel(a, op, b) => {
                let mut refs = a.ports();
                for p in b.ports() {
                    if !refs.contains(&p) {
                        refs.push(p);
                    }
                }
                let mut combos = self.combinations(&refs);
                if combos.len() == 1 && combos[0].0 == Formula::True {
                    let (_, s) = combos.remove(0);
                    return Formula::Rel(substitute(a, &s), *op, substitute(b, &s));
                }
                Formula::or(combos.into_iter().map(|(g, s)| {
                    Formula::and([g, Formula::Rel(substitute(a, &s), *op, substitute(b, &s))])
                }))
            }
            Formula::And(parts) => Formula::and(parts.iter().map(|p| self.expand_formula(p))),
            Formula::Or(parts) => Formula::or(parts.iter().map(|p| self.expand_formula(p))),
            Formula::Not(inner) => Formula::Not(Box::new(self.expand_formula(inner))),
            Formula::Implies(a, b) => self.expand_formula(a).implies(self.expand_formula(b)),
            Formula::Forall(v, body) => Formula::forall(v.clone(), self.expand_formula(body)),
            Formula::Exists(v, body) => Formula::exists(v.clone(), self.expand_formula(body)),
        }
    }

    fn expand_branches(&self, branches: &[(Formula, Term)]) -> Vec<(Formula, Term)> {
        let mut out = Vec::new();
        for (g, t) in branches {
            let g = self.expand_formula(g);
            for (h, t) in self.expand_term(t) {
                let guard = Formula::and([g.clone(), h]);
                if !guard.is_trivially_false() {
                    out.push((guard, t));
                }
            }
        }
        out
    }

    fn expand_body(&self, body: &MacroBody) -> MacroBody {
        match body {
            MacroBody::Simple(t) => MacroBody::from_alternatives(self.expand_term(t)),
            MacroBody::Conditional(branches) => {
                MacroBody::from_alternatives(self.expand_branches(branches))
            }
            MacroBody::Vector(elements) => {
                MacroBody::Vector(elements.iter().map(|e| self.expand_body(e)).collect())
            }
            MacroBody::SizePropagation { source, template } => match self.shape_of(*source) {
                Shape::Unknown => body.clone(),
                Shape::Scalar => MacroBody::Simple(template.clone()),
                Shape::Vector(n) => MacroBody::Vector(
                    (0..n as u32)
                        .map(|k| MacroBody::Simple(project(template, k)))
                        .collect(),
                ),
            },
            MacroBody::Placeholder => MacroBody::Placeholder,
        }
    }

    /// Rewrites every macro body and every queued initial condition until no
    /// body changes any more. Calling it again without new registrations does nothing.
    pub fn resolve_all(&mut self) -> SynthResult<()> {
        if self.resolved {
            return Ok(());
        }
        if let Some(simplifier) = &self.simplifier {
            for m in self.macros.values_mut() {
                m.body = m.body.map_terms(&|t| simplifier.simplify(t));
            }
        }

        let ids: Vec<MacroId> = self.macros.keys().collect();
        let mut passes = 0;
        loop {
            let mut changed = false;
            for id in &ids {
                let body = self.expand_body(&self.macros[*id].body);
                let port = self.macros[*id].port;
                if body.ports().iter().any(|r| r.port == port) {
                    return Err(SynthError::AlgebraicLoop { port });
                }
                if body != self.macros[*id].body {
                    self.macros[*id].body = body;
                    changed = true;
                }
            }
            let init: Vec<Formula> = self.init.iter().map(|f| self.expand_formula(f)).collect();
            if init != self.init {
                self.init = init;
                changed = true;
            }
            passes += 1;
            if !changed {
                break;
            }
            if passes >= self.max_passes {
                return Err(SynthError::MacroDivergence { passes });
            }
        }
        info!("resolved {} macros in {passes} passes", self.macros.len());
        self.resolved = true;
        Ok(())
    }

    /// All guarded values `term` can take after substitution.
    pub fn apply_to_term(&self, term: &Term) -> Vec<(Formula, Term)> {
        let mut alts = vec![(Formula::True, term.clone())];
        for _ in 0..self.max_passes {
            let next = self.expand_branches(&alts);
            if next == alts {
                break;
            }
            alts = next;
        }
        alts
    }

    pub fn apply_to_formula(&self, f: &Formula) -> Formula {
        let mut f = f.clone();
        for _ in 0..self.max_passes {
            let next = self.expand_formula(&f);
            if next == f {
                break;
            }
            f = next;
        }
        f
    }

    /// Substitutes into an ODE. A conditional right-hand side yields one ODE
    /// per branch, with the branch guard added to the evolution domain.
    pub fn apply_to_ode(&self, ode: &Ode) -> Vec<Ode> {
        let domain = self.apply_to_formula(&ode.domain);
        let mut alts: Vec<(Formula, Vec<(String, Term)>)> =
            vec![(Formula::True, ode.equations.clone())];
        for _ in 0..self.max_passes {
            let mut next = Vec::new();
            for (g, eqs) in &alts {
                let mut refs = Vec::new();
                for (_, t) in eqs {
                    t.collect_ports(&mut refs);
                }
                for (h, s) in self.combinations(&refs) {
                    let guard = self.apply_to_formula(&Formula::and([g.clone(), h]));
                    if guard.is_trivially_false() {
                        continue;
                    }
                    let eqs = eqs.iter().map(|(x, t)| (x.clone(), substitute(t, &s))).collect();
                    next.push((guard, eqs));
                }
            }
            if next == alts {
                break;
            }
            alts = next;
        }
        alts.into_iter()
            .map(|(g, equations)| Ode::new(equations, Formula::and([domain.clone(), g])))
            .collect()
    }

    /// Substitutes into a program. Assignments of conditional values become
    /// a choice of guarded assignments, conditional ODEs a choice of guarded evolutions.
    pub fn apply_to_program(&self, program: &HybridProgram) -> HybridProgram {
        match program {
            HybridProgram::Assign(x, t) => {
                let alts = self.apply_to_term(t);
                if alts.len() == 1 && alts[0].0 == Formula::True {
                    return HybridProgram::Assign(x.clone(), alts[0].1.clone());
                }
                HybridProgram::choice(alts.into_iter().map(|(g, t)| {
                    HybridProgram::seq([HybridProgram::test(g), HybridProgram::Assign(x.clone(), t)])
                }))
            }
            HybridProgram::AssignAny(_) => program.clone(),
            HybridProgram::Test(f) => HybridProgram::Test(self.apply_to_formula(f)),
            HybridProgram::Evolve(ode) => {
                let mut odes = self.apply_to_ode(ode);
                if odes.len() == 1 {
                    return HybridProgram::Evolve(odes.remove(0));
                }
                HybridProgram::choice(odes.into_iter().map(|o| {
                    HybridProgram::seq([HybridProgram::test(o.domain.clone()), HybridProgram::Evolve(o)])
                }))
            }
            HybridProgram::Seq(parts) => {
                HybridProgram::seq(parts.iter().map(|p| self.apply_to_program(p)))
            }
            HybridProgram::Choice(parts) => {
                HybridProgram::choice(parts.iter().map(|p| self.apply_to_program(p)))
            }
            HybridProgram::Loop(body) => HybridProgram::repeat(self.apply_to_program(body)),
        }
    }
}
