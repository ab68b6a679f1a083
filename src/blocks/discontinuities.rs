// Copyright 2024 Cornell University
// released under MIT License

use super::math::per_element;
use super::{element, TransformCtx};
use crate::errors::{SynthError, SynthResult};
use crate::hp::{HybridProgram, SampleTime};
use crate::ir::BlockId;
use crate::macros::{MacroBody, Shape};
use crate::term::{Formula, RelOp, Term};

/// Passes `u1` while the control input `u2` meets the criterion, `u3` otherwise.
pub fn switch(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let criteria = ctx.param(block, "Criteria").unwrap_or("u2 >= Threshold");
    let (op, rhs) = match criteria {
        "u2 >= Threshold" => (RelOp::Ge, ctx.param_term(block, "Threshold", Some("0"))?),
        "u2 > Threshold" => (RelOp::Gt, ctx.param_term(block, "Threshold", Some("0"))?),
        "u2 ~= 0" => (RelOp::Ne, Term::zero()),
        other => {
            return Err(SynthError::bad_parameter(
                block,
                "Criteria",
                other,
                "expected `u2 >= Threshold`, `u2 > Threshold` or `u2 ~= 0`",
            ))
        }
    };
    let pass = ctx.input(block, 0);
    let control = ctx.input(block, 1);
    let other = ctx.input(block, 2);
    let (taken, not_taken) = ctx.env.split(control, op, rhs);

    let width = [&pass, &other].iter().find_map(|t| match ctx.shape(t) {
        Shape::Vector(n) => Some(n),
        _ => None,
    });
    let select = |a: Term, b: Term| {
        MacroBody::Conditional(vec![(taken.clone(), a), (not_taken.clone(), b)])
    };
    let body = match width {
        None => select(pass, other),
        Some(n) => {
            let pick = |t: &Term, k: u32| match ctx.shape(t) {
                Shape::Vector(_) => element(t, k),
                _ => t.clone(),
            };
            MacroBody::Vector(
                (0..n as u32)
                    .map(|k| select(pick(&pass, k), pick(&other, k)))
                    .collect(),
            )
        }
    };
    ctx.define(block, 0, body)
}

/// Hysteresis: switches on at or above `OnSwitchValue`, off at or below
/// `OffSwitchValue` and keeps its last output in between.
pub fn relay(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let on_switch = ctx.param_term(block, "OnSwitchValue", Some("eps"))?;
    let off_switch = ctx.param_term(block, "OffSwitchValue", Some("eps"))?;
    let on_value = ctx.param_term(block, "OnOutputValue", Some("1"))?;
    let off_value = ctx.param_term(block, "OffOutputValue", Some("0"))?;
    let sample_time = match ctx.sample_time(block)? {
        SampleTime::Continuous => SampleTime::Inherited,
        st => st,
    };
    let Some(out) = ctx.output(block, 0) else {
        return Err(SynthError::bad_parameter(block, "ports", "", "a relay needs an output"));
    };

    let u = ctx.input(block, 0);
    let (on, not_on) = ctx.env.split(u.clone(), RelOp::Ge, on_switch);
    let (off, not_off) = ctx.env.split(u, RelOp::Le, off_switch);

    let state = ctx.fresh_variable(block, "state");
    let held = Term::sym(state.clone());
    ctx.define(
        block,
        0,
        MacroBody::Conditional(vec![
            (on.clone(), on_value.clone()),
            (Formula::and([not_on.clone(), off]), off_value.clone()),
            (Formula::and([not_on.clone(), not_off]), held.clone()),
        ]),
    )?;

    // the relay starts out switched off
    ctx.add_init(Formula::and([
        on.implies(held.clone().eq(on_value)),
        not_on.implies(held.eq(off_value)),
    ]));
    ctx.commit(sample_time, [HybridProgram::assign(state, Term::port(out))]);
    Ok(())
}

/// Clamps its input to `[LowerLimit, UpperLimit]`.
pub fn saturation(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let upper = ctx.param_term(block, "UpperLimit", Some("0.5"))?;
    let lower = ctx.param_term(block, "LowerLimit", Some("-0.5"))?;
    let u = ctx.input(block, 0);
    let env = &*ctx.env;
    let body = per_element(ctx, &u, |x| {
        let (above, not_above) = env.split(x.clone(), RelOp::Gt, upper.clone());
        let (below, not_below) = env.split(x.clone(), RelOp::Lt, lower.clone());
        MacroBody::Conditional(vec![
            (above, upper.clone()),
            (Formula::and([not_above.clone(), below]), lower.clone()),
            (Formula::and([not_above, not_below]), x),
        ])
    });
    ctx.define(block, 0, body)
}
