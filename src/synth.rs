// Copyright 2024 Cornell University
// released under MIT License

//! Turns a diagram into a hybrid model: orders every scope, runs the block
//! strategies, resolves the macros and assembles the result.

use log::{debug, info};

use crate::assemble::{assemble, HybridModel, ModelParts};
use crate::blocks::{contract_for, Registry, TransformCtx};
use crate::config::{Environment, SynthConfig};
use crate::diagnostic::DiagnosticHandler;
use crate::errors::{DiagnosticEmitter, SynthError};
use crate::hp::Contract;
use crate::ir::{BlockId, Diagram};
use crate::kind::BlockKind;
use crate::macros::{MacroBody, MacroEngine, Simplifier};
use crate::order::order_blocks;

/// Outcome of a run. A model is only sound if no fatal error was reported.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub model: HybridModel,
    pub sound: bool,
}

/// Whether `block` may run before whatever feeds it: state-holding blocks,
/// contract subsystems, and flattened subsystems with state somewhere inside.
fn breaks_cycles(diagram: &Diagram, contracts: &[Contract], block: BlockId) -> bool {
    let b = &diagram[block];
    match BlockKind::from_type_name(b.type_name()) {
        Some(kind) if kind.is_state_holding() => true,
        Some(BlockKind::SubSystem) => {
            contract_for(diagram, block, contracts).is_some()
                || b
                    .children()
                    .iter()
                    .any(|c| breaks_cycles(diagram, contracts, *c))
        }
        _ => false,
    }
}

/// State of one run over the diagram.
struct Pass<'r> {
    registry: &'r Registry,
    sound: bool,
}

impl Pass<'_> {
    fn report(&mut self, ctx: &mut TransformCtx<'_, '_>, err: SynthError) {
        if err.is_fatal() {
            self.sound = false;
        }
        ctx.warn(err);
    }

    fn scope(&mut self, ctx: &mut TransformCtx<'_, '_>, scope: Option<BlockId>) {
        let diagram = ctx.diagram();
        let contracts = ctx.contracts;
        let order = order_blocks(
            diagram.scope(scope),
            |b| diagram.successors(b),
            |b| breaks_cycles(diagram, contracts, b),
        );
        if !order.is_complete() {
            self.report(
                ctx,
                SynthError::ResidualCycle {
                    blocks: order.residual.clone(),
                },
            );
        }
        for b in order.ordered.iter().chain(&order.residual) {
            self.block(ctx, *b);
        }
    }

    fn block(&mut self, ctx: &mut TransformCtx<'_, '_>, block: BlockId) {
        let diagram = ctx.diagram();
        let b = &diagram[block];
        if !b.children().is_empty() && contract_for(diagram, block, ctx.contracts).is_none() {
            self.scope(ctx, Some(block));
        }
        debug!("transforming {} ({})", diagram.full_name(block), b.type_name());
        let registry = self.registry;
        match registry.get(b.type_name()) {
            Some(strategy) => {
                if let Err(err) = strategy.transform(ctx, block) {
                    self.report(ctx, err);
                }
            }
            None => self.report(
                ctx,
                SynthError::UnsupportedBlock {
                    block,
                    type_name: b.type_name().to_string(),
                },
            ),
        }
    }
}

/// Runs the strategies of a [`Registry`] over diagrams.
pub struct Synthesizer {
    config: SynthConfig,
    registry: Registry,
    simplifier: Option<Box<dyn Simplifier>>,
}

impl Synthesizer {
    pub fn new(config: SynthConfig) -> Self {
        Self {
            config,
            registry: Registry::with_defaults(),
            simplifier: None,
        }
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Installs a simplifier that cleans up every macro body before resolution.
    pub fn with_simplifier(mut self, simplifier: Box<dyn Simplifier>) -> Self {
        self.simplifier = Some(simplifier);
        self
    }

    pub fn run(
        self,
        diagram: &Diagram,
        contracts: &[Contract],
        handler: &mut DiagnosticHandler,
    ) -> Synthesis {
        info!(
            "synthesizing `{}` ({} blocks, {} contracts)",
            diagram.name,
            diagram.block_ids().len(),
            contracts.len()
        );
        let mut engine = MacroEngine::new(self.config.max_resolution_passes);
        if let Some(simplifier) = self.simplifier {
            engine.set_simplifier(simplifier);
        }
        let mut pass = Pass {
            registry: &self.registry,
            sound: true,
        };
        // outputs of contract subsystems are reserved up front
        for block in diagram.block_ids() {
            if contract_for(diagram, block, contracts).is_some() {
                for port in diagram[block].outputs() {
                    if let Err(err) = engine.register(*port, MacroBody::Placeholder) {
                        pass.sound = false;
                        DiagnosticEmitter::emit_synth_error(handler, diagram, &err);
                    }
                }
            }
        }

        let mut parts = ModelParts::default();
        {
            let mut env = Environment::new(diagram, &self.config);
            let mut ctx = TransformCtx {
                env: &mut env,
                engine: &mut engine,
                model: &mut parts,
                contracts,
                handler: &mut *handler,
            };
            pass.scope(&mut ctx, None);
        }
        let mut sound = pass.sound;
        let mut fatal = |handler: &mut DiagnosticHandler, err: SynthError| {
            sound = false;
            DiagnosticEmitter::emit_synth_error(handler, diagram, &err);
        };

        if let Err(err) = engine.resolve_all() {
            fatal(handler, err);
        }
        for port in engine.placeholders() {
            let owner = diagram[port].owner();
            let name = contract_for(diagram, owner, contracts)
                .map(|c| c.name.as_str())
                .unwrap_or_default();
            fatal(
                handler,
                SynthError::UnresolvedReference {
                    port,
                    context: format!("contract `{name}`"),
                },
            );
        }
        let (model, errors) = assemble(&diagram.name, parts, &engine);
        for err in errors {
            fatal(handler, err);
        }
        info!(
            "{} variables, {} constants, {} discrete steps",
            model.variables.len(),
            model.constants.len(),
            model.discrete.len()
        );
        Synthesis { model, sound }
    }
}

/// Synthesizes `diagram` with the default strategies.
pub fn synthesize(
    diagram: &Diagram,
    contracts: &[Contract],
    config: &SynthConfig,
    handler: &mut DiagnosticHandler,
) -> Synthesis {
    Synthesizer::new(config.clone()).run(diagram, contracts, handler)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use insta::Settings;
    use strip_ansi_escapes::strip_str;

    use super::*;
    use crate::hp::HybridProgram;
    use crate::macros::ConstantFolding;
    use crate::parser::{parse_file, parse_str};
    use crate::serialize::serialize_to_string;
    use crate::term::{Formula, Term};

    fn snap(name: &str, content: String) {
        let mut settings = Settings::clone_current();
        settings.set_snapshot_path(Path::new("../tests/snapshots"));
        settings.bind(|| {
            insta::assert_snapshot!(name, content);
        });
    }

    /// synthesizes a fixture, returning the rendered model and the diagnostics
    fn synth_file(path: &str) -> (bool, String, DiagnosticHandler) {
        let mut handler = DiagnosticHandler::default().quiet();
        let loaded = parse_file(path, &mut handler).unwrap();
        let result = synthesize(
            &loaded.diagram,
            &loaded.contracts,
            &SynthConfig::default(),
            &mut handler,
        );
        let rendered = serialize_to_string(&loaded.diagram, &result.model, true).unwrap();
        (result.sound, rendered, handler)
    }

    #[test]
    fn counter() {
        let (sound, content, handler) = synth_file("tests/counter.mdl.txt");
        assert!(sound, "{}", handler.error_string());
        snap("counter", content);
    }

    #[test]
    fn thermostat() {
        let (sound, content, handler) = synth_file("tests/thermostat.mdl.txt");
        assert!(sound, "{}", handler.error_string());
        snap("thermostat", content);
    }

    #[test]
    fn algebraic_loop() {
        let (sound, _, handler) = synth_file("tests/algebraic_loop.mdl.txt");
        assert!(!sound);
        assert_eq!(handler.error_count(), 6);
        let content = strip_str(handler.error_string());
        snap("algebraic_loop", content);
    }

    fn synth(src: &str, config: &SynthConfig) -> (Synthesis, String) {
        let mut handler = DiagnosticHandler::default().quiet();
        let loaded = parse_str("test.mdl.txt", src, &mut handler).unwrap();
        let result = synthesize(&loaded.diagram, &loaded.contracts, config, &mut handler);
        (result, handler.error_string().to_string())
    }

    #[test]
    fn loop_without_state_is_fatal() {
        let (result, diagnostics) = synth(
            "model m\nblock Gain a { }\nblock Gain b { }\nline a.1 -> b.1\nline b.1 -> a.1\n",
            &SynthConfig::default(),
        );
        assert!(!result.sound);
        assert!(diagnostics.contains("algebraic loop: `a`, `b` form a cycle"));
    }

    #[test]
    fn delay_breaks_the_loop() {
        // y(n+1) = y(n) + 1, declared consumer first
        let (result, diagnostics) = synth(
            "model m\nblock Sum s { }\nblock UnitDelay z { SampleTime = \"1\"; }\nblock Constant one { }\nline s.1 -> z.1\nline z.1 -> s.1\nline one.1 -> s.2\n",
            &SynthConfig::default(),
        );
        assert!(result.sound, "{diagnostics}");
        let model = &result.model;
        assert_eq!(
            model.discrete[0].statements,
            vec![HybridProgram::assign(
                "z_state",
                Term::sym("z_state").plus(Term::one())
            )]
        );
        assert_eq!(model.init, Term::sym("z_state").eq(Term::zero()));
    }

    #[test]
    fn stateful_subsystems_break_loops() {
        let (result, diagnostics) = synth(
            r#"model m
subsystem hold (in 1, out 1) {
    block Inport i { }
    block UnitDelay z { }
    block Outport o { }
    line i.1 -> z.1
    line z.1 -> o.1
}
block Gain g { Gain = "0.5"; }
line hold.1 -> g.1
line g.1 -> hold.1
"#,
            &SynthConfig::default(),
        );
        assert!(result.sound, "{diagnostics}");
        assert_eq!(
            result.model.discrete[0].statements,
            vec![HybridProgram::assign(
                "hold_z_state",
                Term::num(0.5).times(Term::sym("hold_z_state"))
            )]
        );
    }

    #[test]
    fn unknown_blocks_do_not_stop_the_run() {
        let (result, diagnostics) = synth(
            "model m\nblock Chart c (in 0, out 1) { }\nblock Integrator x { }\nline c.1 -> x.1\n",
            &SynthConfig::default(),
        );
        assert!(!result.sound);
        assert!(diagnostics.contains("no transformer registered for block type `Chart`"));
        // the integrator still contributes, reading a port nobody defines
        assert_eq!(result.model.variables[0].name, "x_state");
        assert!(diagnostics.contains("could not be resolved in the continuous evolution"));
    }

    fn seven(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> crate::errors::SynthResult<()> {
        ctx.define(block, 0, MacroBody::Simple(Term::num(7)))
    }

    #[test]
    fn registered_strategies_cover_new_types() {
        let src = "model m\nblock Chart c (in 0, out 1) { }\nblock Integrator x { }\nline c.1 -> x.1\n";
        let mut handler = DiagnosticHandler::default().quiet();
        let loaded = parse_str("test.mdl.txt", src, &mut handler).unwrap();
        let mut synthesizer = Synthesizer::new(SynthConfig::default());
        synthesizer.registry_mut().register("Chart", Box::new(seven));
        let result = synthesizer.run(&loaded.diagram, &loaded.contracts, &mut handler);
        assert!(result.sound, "{}", handler.error_string());
        assert_eq!(
            result.model.evolution,
            HybridProgram::Evolve(crate::hp::Ode::new(
                vec![("x_state".to_string(), Term::num(7))],
                Formula::True
            ))
        );
    }

    #[test]
    fn degraded_features_keep_the_model_sound() {
        let (result, diagnostics) = synth(
            "model m\nblock Constant c { }\nblock Product p { Multiplication = \"Matrix(*)\"; }\nline c.1 -> p.1\nline c.1 -> p.2\n",
            &SynthConfig::default(),
        );
        assert!(result.sound);
        assert!(diagnostics.starts_with("warning"));
    }

    #[test]
    fn broken_contract_leaves_its_outputs_unresolved() {
        let (result, diagnostics) = synth(
            r#"model m
subsystem svc (in 0, out 1) { }
block Gain g { }
line svc.1 -> g.1
contract svc (in a; out y) {
    program y := a;
}
"#,
            &SynthConfig::default(),
        );
        assert!(!result.sound);
        assert!(diagnostics.contains("declares 1 inputs but the subsystem has 0"));
        assert!(diagnostics.contains("could not be resolved in contract `svc`"));
    }

    #[test]
    fn contract_outputs_are_reserved_quietly() {
        let src = r#"model m
block Inport u { }
subsystem a (in 1, out 1) [Library = "Pass"] { }
subsystem b (in 1, out 1) [Library = "Pass"] { }
block Gain g { }
line u.1 -> a.1
line a.1 -> b.1
line b.1 -> g.1
contract Pass (in x; out y) {
    program y := x;
}
"#;
        let mut handler = DiagnosticHandler::default().quiet();
        let loaded = parse_str("test.mdl.txt", src, &mut handler).unwrap();
        let result = synthesize(&loaded.diagram, &loaded.contracts, &SynthConfig::default(), &mut handler);
        assert!(result.sound, "{}", handler.error_string());
        assert_eq!(handler.error_count(), 0);
        // b reads the value a had before the step
        let written = result.model.discrete[0].program().bound_variables();
        let position = |x: &str| written.iter().position(|w| w == x).unwrap();
        assert!(position("b_y") < position("a_y"));
    }

    #[test]
    fn simplifier_runs_before_resolution() {
        let src = "model m\nblock Inport u { }\nblock Gain g { Gain = \"2*3\"; }\nblock Integrator x { }\nline u.1 -> g.1\nline g.1 -> x.1\n";
        let mut handler = DiagnosticHandler::default().quiet();
        let loaded = parse_str("test.mdl.txt", src, &mut handler).unwrap();
        let result = Synthesizer::new(SynthConfig::default())
            .with_simplifier(Box::new(ConstantFolding))
            .run(&loaded.diagram, &loaded.contracts, &mut handler);
        let HybridProgram::Evolve(ode) = &result.model.evolution else {
            panic!("expected an evolution");
        };
        assert_eq!(
            ode.equations[0].1,
            Term::Mul(vec![Term::num(6), Term::sym("u")])
        );
        assert_eq!(ode.domain, Formula::True);
    }

    #[test]
    fn runs_are_deterministic() {
        let src = "model m\nblock Inport u { }\nblock Sign s { }\nblock Relay r { }\nblock Integrator x { }\nline u.1 -> s.1, r.1\nline s.1 -> x.1\n";
        let (a, _) = synth(src, &SynthConfig::default());
        let (b, _) = synth(src, &SynthConfig::default());
        assert_eq!(a.model, b.model);
    }
}
