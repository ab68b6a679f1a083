// Copyright 2024 Cornell University
// released under MIT License

use super::{routing, TransformCtx};
use crate::errors::SynthResult;
use crate::hp::{HybridProgram, Ode, SampleTime};
use crate::ir::BlockId;
use crate::macros::MacroBody;
use crate::parser::ParamValue;
use crate::term::{Formula, Term};

pub fn constant(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let body = match ctx.param_value(block, "Value", Some("1"))? {
        ParamValue::Scalar(t) => MacroBody::Simple(t),
        ParamValue::Vector(ts) => MacroBody::Vector(ts.into_iter().map(MacroBody::Simple).collect()),
    };
    ctx.define(block, 0, body)
}

pub fn ground(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    ctx.define(block, 0, MacroBody::Simple(Term::zero()))
}

/// Simulation time: a variable starting at `0` with `t' = 1`.
pub fn clock(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let t = ctx.fresh_variable(block, "t");
    ctx.add_init(Term::sym(t.clone()).eq(Term::zero()));
    ctx.model.add_evolution(
        block,
        Ode::new(vec![(t.clone(), Term::one())], Formula::True),
    );
    ctx.define(block, 0, MacroBody::Simple(Term::sym(t)))
}

/// Lower or upper bound of an input: the parameter if one is given, otherwise
/// a fresh constant.
fn bound(
    ctx: &mut TransformCtx<'_, '_>,
    block: BlockId,
    key: &str,
    suffix: &str,
) -> SynthResult<Term> {
    match ctx.param(block, key) {
        Some(v) if !v.is_empty() && v != "[]" => ctx.param_term(block, key, None),
        _ => Ok(Term::sym(ctx.fresh_constant(block, suffix))),
    }
}

/// An unconstrained signal that takes a new value within `[lower, upper]` at
/// the start of every step it runs in.
fn resampled(
    ctx: &mut TransformCtx<'_, '_>,
    block: BlockId,
    lower: Term,
    upper: Term,
) -> SynthResult<()> {
    let sample_time = match ctx.sample_time(block)? {
        SampleTime::Continuous => SampleTime::Inherited,
        st => st,
    };
    let v = ctx.fresh_variable(block, "");
    let x = Term::sym(v.clone());
    let bounds = Formula::and([lower.le(x.clone()), x.clone().le(upper)]);
    ctx.add_init(bounds.clone());
    ctx.step(sample_time).prepend(HybridProgram::seq([
        HybridProgram::AssignAny(v),
        HybridProgram::test(bounds),
    ]));
    ctx.define(block, 0, MacroBody::Simple(x))
}

/// A top-level input is an arbitrary bounded signal. Inside a subsystem the
/// port forwards whatever feeds the subsystem.
pub fn inport(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    if let Some(parent) = ctx.block(block).parent() {
        return routing::inner_inport(ctx, block, parent);
    }
    let lower = bound(ctx, block, "OutMin", "min")?;
    let upper = bound(ctx, block, "OutMax", "max")?;
    resampled(ctx, block, lower, upper)
}

pub fn uniform_random(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let lower = ctx.param_term(block, "Minimum", Some("-1"))?;
    let upper = ctx.param_term(block, "Maximum", Some("1"))?;
    resampled(ctx, block, lower, upper)
}

#[cfg(test)]
mod tests {
    use super::super::tests::run_blocks;
    use crate::config::SynthConfig;
    use crate::hp::{HybridProgram, SampleTime};
    use crate::macros::MacroBody;
    use crate::term::{Formula, Number, Term};

    #[test]
    fn constants() {
        let run = run_blocks(
            "model m\nblock Constant a { Value = \"2.5\"; }\nblock Constant b { Value = \"[1 k]\"; }\nblock Constant c { Value = \"gain * 2\"; }\n",
            &SynthConfig::default(),
        );
        assert_eq!(run.body("a", 0), MacroBody::Simple(Term::num(2.5)));
        assert_eq!(
            run.body("b", 0),
            MacroBody::Vector(vec![
                MacroBody::Simple(Term::one()),
                MacroBody::Simple(Term::sym("k")),
            ])
        );
        let constants: Vec<&str> = run.model.constants.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(constants, vec!["k", "gain"]);
        assert!(run.model.variables.is_empty());
    }

    #[test]
    fn top_level_inport_is_resampled_first() {
        let run = run_blocks(
            "model m\nblock Inport u { }\nblock Inport w { OutMin = \"0\"; OutMax = \"10\"; SampleTime = \"0.5\"; }\nblock UnitDelay z { }\nline u.1 -> z.1\n",
            &SynthConfig::default(),
        );
        let u = Term::sym("u");
        let u_bounds = Formula::and([
            Term::sym("u_min").le(u.clone()),
            u.clone().le(Term::sym("u_max")),
        ]);
        let constants: Vec<&str> = run.model.constants.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(constants, vec!["u_min", "u_max"]);

        let inherited = &run.model.discrete[0];
        assert_eq!(inherited.sample_time, SampleTime::Inherited);
        // the delay appended its update after the resampling of `u`
        assert_eq!(
            inherited.statements[0],
            HybridProgram::seq([
                HybridProgram::AssignAny("u".to_string()),
                HybridProgram::test(u_bounds.clone()),
            ])
        );
        assert_eq!(
            inherited.statements[1],
            HybridProgram::assign("z_state", u.clone())
        );

        let periodic = &run.model.discrete[1];
        assert_eq!(periodic.sample_time, SampleTime::Discrete(Number::from(0.5)));
        let w = Term::sym("w");
        assert_eq!(
            periodic.statements[0],
            HybridProgram::seq([
                HybridProgram::AssignAny("w".to_string()),
                HybridProgram::test(Formula::and([
                    Term::zero().le(w.clone()),
                    w.le(Term::num(10)),
                ])),
            ])
        );
        let Formula::And(init) = &run.model.init else {
            panic!("expected a conjunction, got {:?}", run.model.init);
        };
        assert!(init.contains(&Term::sym("u_min").le(u.clone())));
        assert!(init.contains(&u.le(Term::sym("u_max"))));
    }

    #[test]
    fn clock_evolves_time() {
        let run = run_blocks("model m\nblock Clock clk { }\n", &SynthConfig::default());
        assert_eq!(run.body("clk", 0), MacroBody::Simple(Term::sym("clk_t")));
        assert_eq!(run.model.init, Term::sym("clk_t").eq(Term::zero()));
        let HybridProgram::Evolve(ode) = &run.model.evolution else {
            panic!("expected an evolution");
        };
        assert_eq!(ode.equations, vec![("clk_t".to_string(), Term::one())]);
    }

    #[test]
    fn uniform_random_uses_its_range() {
        let run = run_blocks(
            "model m\nblock UniformRandomNumber r { Minimum = \"-2\"; Maximum = \"hi\"; }\n",
            &SynthConfig::default(),
        );
        let r = Term::sym("r");
        assert_eq!(
            run.model.init,
            Formula::and([Term::num(-2).le(r.clone()), r.le(Term::sym("hi"))])
        );
        assert_eq!(run.model.constants[0].name, "hi");
    }
}
