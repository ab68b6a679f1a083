// Copyright 2024 Cornell University
// released under MIT License

use super::TransformCtx;
use crate::errors::{SynthError, SynthResult};
use crate::hp::{HybridProgram, Ode, SampleTime};
use crate::ir::BlockId;
use crate::macros::MacroBody;
use crate::term::{Formula, RelOp, Term};

/// `false` for limits that are literally infinite.
fn is_finite_limit(t: &Term) -> bool {
    t.as_number().map_or(true, |n| n.is_finite())
}

/// `x' = u`, optionally pinned at saturation limits and reset by a level
/// signal on the second input.
///
/// Every regime becomes its own container. While pinned at a limit the state
/// stays put; the free regime runs whenever neither limit is pinning it.
pub fn integrator(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    if ctx.param(block, "InitialConditionSource") == Some("external") {
        return ctx.degrade(block, "an external initial condition");
    }
    let ic = ctx.param_term(block, "InitialCondition", Some("0"))?;
    let state = ctx.fresh_variable(block, "state");
    let x = Term::sym(state.clone());
    ctx.add_init(x.clone().eq(ic.clone()));
    ctx.define(block, 0, MacroBody::Simple(x.clone()))?;
    let u = ctx.input(block, 0);

    let mut regimes: Vec<(Term, Formula)> = Vec::new();
    if ctx.param(block, "LimitOutput") == Some("on") {
        let upper = ctx.param_term(block, "UpperSaturationLimit", Some("inf"))?;
        let lower = ctx.param_term(block, "LowerSaturationLimit", Some("-inf"))?;
        let mut pinned = Vec::new();
        if is_finite_limit(&upper) {
            let (at_limit, _) = ctx.env.split(x.clone(), RelOp::Ge, upper);
            let (rising, _) = ctx.env.split(u.clone(), RelOp::Ge, Term::zero());
            pinned.push(Formula::and([at_limit, rising]));
        }
        if is_finite_limit(&lower) {
            let (at_limit, _) = ctx.env.split(x.clone(), RelOp::Le, lower);
            let (falling, _) = ctx.env.split(u.clone(), RelOp::Le, Term::zero());
            pinned.push(Formula::and([at_limit, falling]));
        }
        let free = Formula::and(pinned.iter().map(Formula::negate));
        regimes.push((u.clone(), free));
        regimes.extend(pinned.into_iter().map(|p| (Term::zero(), p)));
    } else {
        regimes.push((u.clone(), Formula::True));
    }

    let running = match ctx.param(block, "ExternalReset").unwrap_or("none") {
        "none" => Formula::True,
        "level" => {
            let r = ctx.input(block, 1);
            let (active, inactive) = ctx.env.split(r, RelOp::Ne, Term::zero());
            ctx.commit(
                SampleTime::Inherited,
                [HybridProgram::choice([
                    HybridProgram::seq([
                        HybridProgram::test(active.clone()),
                        HybridProgram::assign(state.clone(), ic),
                    ]),
                    HybridProgram::test(inactive.clone()),
                ])],
            );
            ctx.model.add_evolution(
                block,
                Ode::new(vec![(state.clone(), Term::zero())], active),
            );
            inactive
        }
        other => {
            ctx.warn(SynthError::unsupported(block, format!("{other} reset")));
            Formula::True
        }
    };

    for (rate, domain) in regimes {
        ctx.model.add_evolution(
            block,
            Ode::new(
                vec![(state.clone(), rate)],
                Formula::and([domain, running.clone()]),
            ),
        );
    }
    Ok(())
}
