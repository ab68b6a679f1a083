// Copyright 2024 Cornell University
// released under MIT License

//! Per-kind synthesis strategies and the context they run in.

mod continuous;
mod discontinuities;
mod discrete;
mod logic;
mod math;
mod routing;
mod service;
mod sources;

use log::debug;
use rustc_hash::FxHashMap;

use crate::assemble::ModelParts;
use crate::config::Environment;
use crate::diagnostic::DiagnosticHandler;
use crate::errors::{DiagnosticEmitter, SynthError, SynthResult};
use crate::hp::{Contract, DiscreteBehavior, HybridProgram, SampleTime};
use crate::ir::{Block, BlockId, Diagram, PortId};
use crate::kind::BlockKind;
use crate::macros::{project, MacroBody, MacroEngine, Shape};
use crate::parser::{parse_number, parse_param, ParamValue};
use crate::term::{Number, Term};

pub use service::contract_for;

/// Synthesis strategy for one kind of block.
///
/// A strategy reads its block and the terms feeding its inputs and only ever
/// adds to the model: macros for its own outputs, new symbols, discrete
/// statements, continuous evolutions and initial conditions.
pub trait BlockTransformer {
    fn transform(&self, ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()>;
}

impl<F> BlockTransformer for F
where
    F: Fn(&mut TransformCtx<'_, '_>, BlockId) -> SynthResult<()>,
{
    fn transform(&self, ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
        self(ctx, block)
    }
}

/// Maps block type names to strategies.
#[derive(Default)]
pub struct Registry {
    strategies: FxHashMap<String, Box<dyn BlockTransformer>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a strategy for every [`BlockKind`].
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        for kind in BlockKind::ALL {
            r.register(kind.type_name(), strategy_for(kind));
        }
        r
    }

    /// Registers `strategy` for `type_name`, replacing an earlier one.
    pub fn register(&mut self, type_name: &str, strategy: Box<dyn BlockTransformer>) {
        self.strategies.insert(type_name.to_string(), strategy);
    }

    /// Looks up the strategy for a block type, accepting alias type names.
    pub fn get(&self, type_name: &str) -> Option<&dyn BlockTransformer> {
        if let Some(s) = self.strategies.get(type_name) {
            return Some(s.as_ref());
        }
        let kind = BlockKind::from_type_name(type_name)?;
        self.strategies.get(kind.type_name()).map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

fn strategy_for(kind: BlockKind) -> Box<dyn BlockTransformer> {
    match kind {
        BlockKind::Constant => Box::new(sources::constant),
        BlockKind::Inport => Box::new(sources::inport),
        BlockKind::UniformRandomNumber => Box::new(sources::uniform_random),
        BlockKind::Ground => Box::new(sources::ground),
        BlockKind::Clock => Box::new(sources::clock),
        BlockKind::Sum => Box::new(math::sum),
        BlockKind::Product => Box::new(math::product),
        BlockKind::Gain => Box::new(math::gain),
        BlockKind::Bias => Box::new(math::bias),
        BlockKind::Abs => Box::new(math::abs),
        BlockKind::UnaryMinus => Box::new(math::unary_minus),
        BlockKind::MinMax => Box::new(math::min_max),
        BlockKind::Sign => Box::new(math::sign),
        BlockKind::Logic => Box::new(logic::logic),
        BlockKind::RelationalOperator => Box::new(logic::relational),
        BlockKind::Switch => Box::new(discontinuities::switch),
        BlockKind::Relay => Box::new(discontinuities::relay),
        BlockKind::Saturation => Box::new(discontinuities::saturation),
        BlockKind::UnitDelay => Box::new(discrete::unit_delay),
        BlockKind::Delay => Box::new(discrete::delay),
        BlockKind::DiscreteIntegrator => Box::new(discrete::discrete_integrator),
        BlockKind::Integrator => Box::new(continuous::integrator),
        BlockKind::Mux => Box::new(routing::mux),
        BlockKind::Demux => Box::new(routing::demux),
        BlockKind::SubSystem => Box::new(routing::subsystem),
        BlockKind::Outport
        | BlockKind::Terminator
        | BlockKind::Scope
        | BlockKind::Display => Box::new(routing::sink),
    }
}

/// Everything a strategy may read or add to.
pub struct TransformCtx<'a, 'd> {
    pub env: &'a mut Environment<'d>,
    pub engine: &'a mut MacroEngine,
    pub model: &'a mut ModelParts,
    pub contracts: &'a [Contract],
    pub handler: &'a mut DiagnosticHandler,
}

impl<'a, 'd> TransformCtx<'a, 'd> {
    pub fn diagram(&self) -> &'d Diagram {
        self.env.diagram()
    }

    pub fn block(&self, block: BlockId) -> &'d Block {
        &self.env.diagram()[block]
    }

    pub fn param(&self, block: BlockId, key: &str) -> Option<&'d str> {
        self.block(block).params.get(key).map(str::trim)
    }

    /// Reports a problem that does not stop the run.
    pub fn warn(&mut self, err: SynthError) {
        DiagnosticEmitter::emit_synth_error(self.handler, self.env.diagram(), &err);
    }

    /// Term currently feeding input `index`. An unconnected input reads as `0`.
    pub fn input(&mut self, block: BlockId, index: usize) -> Term {
        match self.env.feeding_port(block, index) {
            Some(port) => Term::port(port),
            None => {
                self.warn(SynthError::UnconnectedInput {
                    block,
                    index: index + 1,
                });
                Term::zero()
            }
        }
    }

    /// Terms feeding every input of `block`, in port order.
    pub fn inputs(&mut self, block: BlockId) -> Vec<Term> {
        (0..self.block(block).inputs().len())
            .map(|i| self.input(block, i))
            .collect()
    }

    pub fn output(&self, block: BlockId, index: usize) -> Option<PortId> {
        self.block(block).outputs().get(index).copied()
    }

    pub fn shape(&self, term: &Term) -> Shape {
        self.engine.term_shape(term)
    }

    /// Registers the macro of output `index`.
    pub fn define(&mut self, block: BlockId, index: usize, body: MacroBody) -> SynthResult<()> {
        match self.output(block, index) {
            Some(port) => {
                debug!("{} := {:?}", self.env.port_identifier(port), body);
                self.engine.register(port, body).map(|_| ())
            }
            None => {
                self.warn(SynthError::unsupported(
                    block,
                    format!("writing undeclared output {}", index + 1),
                ));
                Ok(())
            }
        }
    }

    /// Body applying `f` to every element of `input`. Before the shape of the
    /// input is known this is left to resolution.
    pub fn elementwise(&self, input: &Term, f: impl Fn(Term) -> Term) -> MacroBody {
        match (self.shape(input), input) {
            (Shape::Unknown, Term::Port(r)) if r.element.is_none() => MacroBody::SizePropagation {
                source: r.port,
                template: f(input.clone()),
            },
            _ => MacroBody::Simple(f(input.clone())),
        }
    }

    /// Parses parameter `key`, falling back to `default`. Symbols in the value
    /// become model constants.
    pub fn param_value(
        &mut self,
        block: BlockId,
        key: &str,
        default: Option<&str>,
    ) -> SynthResult<ParamValue> {
        let text = match (self.param(block, key), default) {
            (Some(v), _) => v,
            (None, Some(d)) => d,
            (None, None) => {
                return Err(SynthError::MissingParameter {
                    block,
                    param: key.to_string(),
                })
            }
        };
        let value =
            parse_param(text).map_err(|e| SynthError::bad_parameter(block, key, text, e))?;
        for t in value.elements() {
            for s in t.symbols() {
                self.add_constant(block, &s);
            }
        }
        Ok(value)
    }

    /// A scalar parameter.
    pub fn param_term(&mut self, block: BlockId, key: &str, default: Option<&str>) -> SynthResult<Term> {
        match self.param_value(block, key, default)? {
            ParamValue::Scalar(t) => Ok(t),
            ParamValue::Vector(_) => Err(SynthError::bad_parameter(
                block,
                key,
                self.param(block, key).unwrap_or_default(),
                "expected a scalar",
            )),
        }
    }

    /// A parameter that has to be a literal number.
    pub fn param_number(&self, block: BlockId, key: &str, default: &str) -> SynthResult<Number> {
        let text = self.param(block, key).unwrap_or(default);
        parse_number(text).map_err(|e| SynthError::bad_parameter(block, key, text, e))
    }

    pub fn sample_time(&self, block: BlockId) -> SynthResult<SampleTime> {
        let n = self.param_number(block, "SampleTime", "-1")?;
        SampleTime::from_number(n).ok_or_else(|| {
            SynthError::bad_parameter(
                block,
                "SampleTime",
                &n.to_string(),
                "expected -1, 0 or a positive period",
            )
        })
    }

    /// Introduces a variable owned by `block`.
    pub fn fresh_variable(&mut self, block: BlockId, suffix: &str) -> String {
        let name = self.env.block_name(block, suffix);
        self.model.add_variable(name.clone(), Some(block));
        name
    }

    /// Introduces a constant owned by `block`.
    pub fn fresh_constant(&mut self, block: BlockId, suffix: &str) -> String {
        let name = self.env.block_name(block, suffix);
        self.model.add_constant(name.clone(), Some(block));
        name
    }

    /// Declares a symbol read from a parameter as a model constant.
    pub fn add_constant(&mut self, block: BlockId, name: &str) {
        if !self.model.has_symbol(name) {
            self.env.reserve(name);
            self.model.add_constant(name, Some(block));
        }
    }

    pub fn add_init(&mut self, f: crate::term::Formula) {
        self.engine.push_init(f);
    }

    pub fn step(&mut self, sample_time: SampleTime) -> &mut DiscreteBehavior {
        self.model.step(sample_time)
    }

    /// Registers the state update of a block. It reads every variable as it
    /// was before the step, whatever other blocks update in the same step.
    pub fn commit(
        &mut self,
        sample_time: SampleTime,
        group: impl IntoIterator<Item = HybridProgram>,
    ) {
        self.model.step(sample_time).commit(group);
    }

    /// Skips an unsupported feature of `block`: every output becomes a fresh
    /// variable that is re-chosen arbitrarily in every step.
    pub fn degrade(&mut self, block: BlockId, feature: impl Into<String>) -> SynthResult<()> {
        self.warn(SynthError::unsupported(block, feature));
        for index in 0..self.block(block).outputs().len() {
            let v = self.fresh_variable(block, &format!("out{}", index + 1));
            self.define(block, index, MacroBody::Simple(Term::sym(v.clone())))?;
            self.step(SampleTime::Inherited)
                .append(HybridProgram::AssignAny(v));
        }
        Ok(())
    }
}

/// Element `k` of a possibly vector-valued term.
pub(crate) fn element(term: &Term, k: u32) -> Term {
    project(term, k)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::assemble::{assemble, HybridModel};
    use crate::config::SynthConfig;
    use crate::parser::parse_str;

    /// Output of a test run: the model and everything that was reported.
    pub struct Run {
        pub diagram: Diagram,
        pub model: HybridModel,
        pub engine: MacroEngine,
        pub diagnostics: String,
    }

    impl Run {
        pub fn port(&self, block: &str, index: usize) -> PortId {
            let b = self.diagram.block_by_name(block).unwrap();
            self.diagram[b].outputs()[index]
        }

        /// the resolved body of output `index` of `block`
        pub fn body(&self, block: &str, index: usize) -> MacroBody {
            self.engine.get(self.port(block, index)).unwrap().body.clone()
        }
    }

    /// Declaration order, inner blocks of flattened subsystems first.
    fn dispatch(
        registry: &Registry,
        ctx: &mut TransformCtx<'_, '_>,
        scope: Option<BlockId>,
    ) -> SynthResult<()> {
        let diagram = ctx.diagram();
        for &b in diagram.scope(scope) {
            if !diagram[b].children().is_empty() && contract_for(diagram, b, ctx.contracts).is_none() {
                dispatch(registry, ctx, Some(b))?;
            }
            let strategy = registry.get(diagram[b].type_name()).unwrap();
            strategy.transform(ctx, b)?;
        }
        Ok(())
    }

    pub fn run_blocks(src: &str, config: &SynthConfig) -> Run {
        try_run_blocks(src, config).unwrap()
    }

    /// Transforms every block of `src` in declaration order with the default
    /// registry and resolves the macros, without the ordering pass.
    pub fn try_run_blocks(src: &str, config: &SynthConfig) -> SynthResult<Run> {
        let mut handler = DiagnosticHandler::default().quiet();
        let loaded = parse_str("test.mdl.txt", src, &mut handler).unwrap();
        let diagram = loaded.diagram;
        let registry = Registry::with_defaults();
        let mut engine = MacroEngine::new(config.max_resolution_passes);
        let mut parts = ModelParts::default();
        {
            let mut env = Environment::new(&diagram, config);
            let mut ctx = TransformCtx {
                env: &mut env,
                engine: &mut engine,
                model: &mut parts,
                contracts: &loaded.contracts,
                handler: &mut handler,
            };
            dispatch(&registry, &mut ctx, None)?;
        }
        engine.resolve_all()?;
        let (model, _) = assemble(&diagram.name, parts, &engine);
        Ok(Run {
            diagram,
            model,
            engine,
            diagnostics: handler.error_string().to_string(),
        })
    }

    #[test]
    fn registry_knows_every_kind() {
        let r = Registry::with_defaults();
        assert_eq!(r.len(), BlockKind::ALL.len());
        assert!(r.get("Saturate").is_some());
        assert!(r.get("Chart").is_none());
    }

    fn always_42(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
        ctx.define(block, 0, MacroBody::Simple(Term::num(42)))
    }

    #[test]
    fn registered_strategies_override_defaults() {
        let mut r = Registry::with_defaults();
        r.register("Gain", Box::new(always_42));
        let src = "model m\nblock Constant c { Value = \"1\"; }\nblock Gain g { }\nline c.1 -> g.1\n";
        let mut handler = DiagnosticHandler::default().quiet();
        let loaded = parse_str("m.mdl.txt", src, &mut handler).unwrap();
        let config = SynthConfig::default();
        let mut env = Environment::new(&loaded.diagram, &config);
        let mut engine = MacroEngine::new(8);
        let mut parts = ModelParts::default();
        let mut ctx = TransformCtx {
            env: &mut env,
            engine: &mut engine,
            model: &mut parts,
            contracts: &[],
            handler: &mut handler,
        };
        let g = loaded.diagram.block_by_name("g").unwrap();
        r.get("Gain").unwrap().transform(&mut ctx, g).unwrap();
        let out = loaded.diagram[g].outputs()[0];
        assert_eq!(engine.get(out).unwrap().body, MacroBody::Simple(Term::num(42)));
    }

    #[test]
    fn parameter_errors() {
        let src = "model m\nblock Delay d { DelayLength = \"two\"; }\nblock Gain g { Gain = \"[1 2\"; }\n";
        let mut handler = DiagnosticHandler::default().quiet();
        let loaded = parse_str("m.mdl.txt", src, &mut handler).unwrap();
        let config = SynthConfig::default();
        let mut env = Environment::new(&loaded.diagram, &config);
        let mut engine = MacroEngine::new(8);
        let mut parts = ModelParts::default();
        let mut ctx = TransformCtx {
            env: &mut env,
            engine: &mut engine,
            model: &mut parts,
            contracts: &[],
            handler: &mut handler,
        };
        let d = loaded.diagram.block_by_name("d").unwrap();
        let g = loaded.diagram.block_by_name("g").unwrap();
        assert!(matches!(
            ctx.param_number(d, "DelayLength", "1"),
            Err(SynthError::BadParameter { .. })
        ));
        assert!(matches!(
            ctx.param_value(g, "Gain", None),
            Err(SynthError::BadParameter { .. })
        ));
        assert!(matches!(
            ctx.param_value(g, "Bias", None),
            Err(SynthError::MissingParameter { .. })
        ));
        assert_eq!(ctx.sample_time(g).unwrap(), SampleTime::Inherited);
        // an identifier becomes a model constant
        assert_eq!(ctx.param_term(d, "Gain", Some("k")).unwrap(), Term::sym("k"));
        assert!(parts.has_symbol("k"));
    }

    #[test]
    fn unconnected_inputs_read_zero() {
        let run = run_blocks(
            "model m\nblock Gain g { Gain = \"3\"; }\n",
            &SynthConfig::default(),
        );
        assert_eq!(
            run.body("g", 0),
            MacroBody::Simple(Term::num(3).times(Term::zero()))
        );
        assert!(run.diagnostics.starts_with("warning: input 1 is not connected"));
    }
}
