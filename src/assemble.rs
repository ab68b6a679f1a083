// Copyright 2024 Cornell University
// released under MIT License

//! Merges the fragments contributed by all blocks into one hybrid model.

use std::collections::BTreeMap;

use log::{debug, info};
use rustc_hash::FxHashMap;

use crate::errors::SynthError;
use crate::hp::{ContinuousEvolution, DiscreteBehavior, HybridProgram, Ode, SampleTime};
use crate::ir::{BlockId, PortId};
use crate::macros::{Macro, MacroEngine};
use crate::order::kahn;
use crate::term::{Formula, Term};

/// A named real-valued symbol that changes over time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    /// block that introduced the variable
    pub origin: Option<BlockId>,
}

/// A named real-valued symbol that is fixed but unconstrained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constant {
    pub name: String,
    pub origin: Option<BlockId>,
}

/// Everything the transformers contributed so far, before macro substitution.
#[derive(Debug, Clone, Default)]
pub struct ModelParts {
    pub variables: Vec<Variable>,
    pub constants: Vec<Constant>,
    pub discrete: BTreeMap<SampleTime, DiscreteBehavior>,
    pub continuous: Vec<ContinuousEvolution>,
}

impl ModelParts {
    pub fn add_variable(&mut self, name: impl Into<String>, origin: Option<BlockId>) {
        let name = name.into();
        if !self.variables.iter().any(|v| v.name == name) {
            self.variables.push(Variable { name, origin });
        }
    }

    /// Adds a constant unless a variable or constant of that name already exists.
    pub fn add_constant(&mut self, name: impl Into<String>, origin: Option<BlockId>) {
        let name = name.into();
        if !self.has_symbol(&name) {
            self.constants.push(Constant { name, origin });
        }
    }

    /// Declares a variable named after `base` that no symbol uses yet.
    pub fn fresh_variable(&mut self, base: &str, origin: Option<BlockId>) -> String {
        let mut name = base.to_string();
        let mut n = 2;
        while self.has_symbol(&name) {
            name = format!("{base}_{n}");
            n += 1;
        }
        self.add_variable(name.clone(), origin);
        name
    }

    pub fn has_symbol(&self, name: &str) -> bool {
        self.variables.iter().any(|v| v.name == name)
            || self.constants.iter().any(|c| c.name == name)
    }

    /// The discrete step running at `sample_time`, created on first use.
    pub fn step(&mut self, sample_time: SampleTime) -> &mut DiscreteBehavior {
        self.discrete
            .entry(sample_time)
            .or_insert_with(|| DiscreteBehavior::new(sample_time))
    }

    pub fn add_evolution(&mut self, group: BlockId, ode: Ode) {
        self.continuous.push(ContinuousEvolution { group, ode });
    }
}

/// The synthesized model.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridModel {
    pub name: String,
    pub variables: Vec<Variable>,
    pub constants: Vec<Constant>,
    pub init: Formula,
    /// one step per sample time, ordered by sample time
    pub discrete: Vec<DiscreteBehavior>,
    pub evolution: HybridProgram,
    pub macros: Vec<Macro>,
}

impl HybridModel {
    /// `{ discrete_1; ...; discrete_n; evolution }*`
    pub fn program(&self) -> HybridProgram {
        let mut body: Vec<HybridProgram> = self.discrete.iter().map(|d| d.program()).collect();
        body.push(self.evolution.clone());
        HybridProgram::repeat(HybridProgram::seq(body))
    }
}

/// Combines the containers of every block into one evolution.
///
/// Containers of the same group are alternatives; different groups evolve
/// together, so their alternatives are multiplied out. Every combination
/// becomes one branch that first tests its own domain.
fn combine_evolutions(containers: &[ContinuousEvolution], engine: &MacroEngine) -> HybridProgram {
    let mut groups: Vec<(BlockId, Vec<Ode>)> = Vec::new();
    for c in containers {
        let odes = engine.apply_to_ode(&c.ode);
        match groups.iter_mut().find(|(g, _)| *g == c.group) {
            Some((_, alts)) => alts.extend(odes),
            None => groups.push((c.group, odes)),
        }
    }
    if groups.is_empty() {
        return HybridProgram::skip();
    }

    let mut combos = vec![Ode::new(Vec::new(), Formula::True)];
    for (_, alts) in &groups {
        let mut next = Vec::with_capacity(combos.len() * alts.len());
        for base in &combos {
            for alt in alts {
                let domain = Formula::and([base.domain.clone(), alt.domain.clone()]);
                if domain.is_trivially_false() {
                    continue;
                }
                let mut equations = base.equations.clone();
                equations.extend(alt.equations.iter().cloned());
                next.push(Ode::new(equations, domain));
            }
        }
        combos = next;
    }
    info!(
        "{} continuous groups combine into {} evolutions",
        groups.len(),
        combos.len()
    );

    if combos.len() == 1 {
        return HybridProgram::Evolve(combos.remove(0));
    }
    HybridProgram::choice(combos.into_iter().map(|ode| {
        HybridProgram::seq([
            HybridProgram::test(ode.domain.clone()),
            HybridProgram::Evolve(ode),
        ])
    }))
}

/// Sequences the state updates of one step so that each reads the values from
/// before the step.
///
/// An update runs before every update that overwrites a symbol it reads. When
/// updates read each other in a cycle, the variables they write are copied
/// into `<name>_pre` first and the others read the copies.
fn order_commits(commits: &[Vec<HybridProgram>], parts: &mut ModelParts) -> Vec<HybridProgram> {
    let groups: Vec<HybridProgram> = commits
        .iter()
        .map(|c| HybridProgram::seq(c.iter().cloned()))
        .collect();
    let reads: Vec<Vec<String>> = groups.iter().map(|g| g.symbols()).collect();
    let writes: Vec<Vec<String>> = groups.iter().map(|g| g.bound_variables()).collect();
    let n = groups.len();
    let edges: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|j| *j != i && reads[i].iter().any(|v| writes[*j].contains(v)))
                .collect()
        })
        .collect();

    let (ordered, residual) = kahn(&edges, &vec![false; n]);
    let mut out: Vec<HybridProgram> = ordered
        .iter()
        .flat_map(|i| commits[*i].iter().cloned())
        .collect();
    if residual.is_empty() {
        return out;
    }
    debug!(
        "{} state updates read each other, copying their variables",
        residual.len()
    );

    let mut copies: FxHashMap<String, Term> = FxHashMap::default();
    for j in &residual {
        for v in &writes[*j] {
            let read_elsewhere = residual.iter().any(|k| k != j && reads[*k].contains(v));
            if !read_elsewhere || copies.contains_key(v) {
                continue;
            }
            let origin = parts
                .variables
                .iter()
                .find(|x| &x.name == v)
                .and_then(|x| x.origin);
            let pre = parts.fresh_variable(&format!("{v}_pre"), origin);
            out.push(HybridProgram::assign(pre.clone(), Term::sym(v.clone())));
            copies.insert(v.clone(), Term::sym(pre));
        }
    }
    for k in &residual {
        let map: FxHashMap<String, Term> = copies
            .iter()
            .filter(|(v, _)| !writes[*k].contains(*v))
            .map(|(v, t)| (v.clone(), t.clone()))
            .collect();
        out.extend(commits[*k].iter().map(|stmt| stmt.rename(&map)));
    }
    out
}

fn report_ports(
    ports: impl IntoIterator<Item = PortId>,
    context: &str,
    errors: &mut Vec<SynthError>,
) {
    for port in ports {
        let err = SynthError::UnresolvedReference {
            port,
            context: context.to_string(),
        };
        if !errors.contains(&err) {
            errors.push(err);
        }
    }
}

/// Substitutes all macros into the collected fragments and builds the model.
/// Port references that survive substitution are returned as errors.
pub fn assemble(
    name: &str,
    mut parts: ModelParts,
    engine: &MacroEngine,
) -> (HybridModel, Vec<SynthError>) {
    let mut errors = Vec::new();

    let init = engine.apply_to_formula(&Formula::and(engine.init().iter().cloned()));
    report_ports(
        init.ports().into_iter().map(|r| r.port),
        "the initial condition",
        &mut errors,
    );

    let mut discrete = Vec::new();
    let behaviors = std::mem::take(&mut parts.discrete);
    for (sample_time, behavior) in &behaviors {
        let mut step = DiscreteBehavior::new(*sample_time);
        for stmt in &behavior.statements {
            step.append(engine.apply_to_program(stmt));
        }
        let commits: Vec<Vec<HybridProgram>> = behavior
            .commits
            .iter()
            .map(|c| c.iter().map(|stmt| engine.apply_to_program(stmt)).collect())
            .collect();
        for stmt in order_commits(&commits, &mut parts) {
            step.append(stmt);
        }
        report_ports(
            step.program().ports().into_iter().map(|r| r.port),
            &format!("the discrete step ({sample_time})"),
            &mut errors,
        );
        discrete.push(step);
    }

    let evolution = combine_evolutions(&parts.continuous, engine);
    report_ports(
        evolution.ports().into_iter().map(|r| r.port),
        "the continuous evolution",
        &mut errors,
    );

    let macros: Vec<Macro> = engine.macros().cloned().collect();
    for m in &macros {
        report_ports(
            m.body.ports().into_iter().map(|r| r.port),
            "a macro body",
            &mut errors,
        );
    }

    let model = HybridModel {
        name: name.to_string(),
        variables: parts.variables,
        constants: parts.constants,
        init,
        discrete,
        evolution,
        macros,
    };
    (model, errors)
}
