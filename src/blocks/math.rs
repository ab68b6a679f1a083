// Copyright 2024 Cornell University
// released under MIT License

use super::{element, TransformCtx};
use crate::errors::{SynthError, SynthResult};
use crate::ir::BlockId;
use crate::kind::operator_list;
use crate::macros::{MacroBody, Shape};
use crate::parser::ParamValue;
use crate::term::{Formula, Func, RelOp, Term};

/// Body of an elementwise operation over several inputs. Scalar inputs are
/// broadcast against vector inputs.
pub(super) fn broadcast(
    ctx: &TransformCtx<'_, '_>,
    inputs: &[Term],
    f: impl Fn(&[Term]) -> Term,
) -> MacroBody {
    let shapes: Vec<Shape> = inputs.iter().map(|t| ctx.shape(t)).collect();
    let width = shapes.iter().find_map(|s| match s {
        Shape::Vector(n) => Some(*n),
        _ => None,
    });
    match (width, inputs) {
        (Some(n), _) => MacroBody::Vector(
            (0..n as u32)
                .map(|k| {
                    let elements: Vec<Term> = inputs
                        .iter()
                        .zip(&shapes)
                        .map(|(t, s)| match s {
                            Shape::Vector(_) => element(t, k),
                            _ => t.clone(),
                        })
                        .collect();
                    MacroBody::Simple(f(&elements))
                })
                .collect(),
        ),
        (None, [single]) => ctx.elementwise(single, |t| f(&[t])),
        (None, _) => MacroBody::Simple(f(inputs)),
    }
}

/// Applies `f` to every element of `input` separately.
pub(super) fn per_element(
    ctx: &TransformCtx<'_, '_>,
    input: &Term,
    f: impl Fn(Term) -> MacroBody,
) -> MacroBody {
    match ctx.shape(input) {
        Shape::Vector(n) => MacroBody::Vector((0..n as u32).map(|k| f(element(input, k))).collect()),
        _ => f(input.clone()),
    }
}

/// Elements of a vector input, or the input itself.
fn elements_of(ctx: &TransformCtx<'_, '_>, input: &Term) -> Vec<Term> {
    match ctx.shape(input) {
        Shape::Vector(n) => (0..n as u32).map(|k| element(input, k)).collect(),
        _ => vec![input.clone()],
    }
}

/// Operator list from the `Inputs` parameter, checked against the port count.
fn operators(
    ctx: &TransformCtx<'_, '_>,
    block: BlockId,
    ops: &str,
) -> SynthResult<Vec<char>> {
    let signs = ctx.param(block, "Inputs");
    let list = operator_list(signs, ops)
        .map_err(|e| SynthError::bad_parameter(block, "Inputs", signs.unwrap_or_default(), e))?;
    let ports = ctx.block(block).inputs().len();
    if list.len() != ports {
        return Err(SynthError::bad_parameter(
            block,
            "Inputs",
            signs.unwrap_or_default(),
            format!("{} operators for {ports} inputs", list.len()),
        ));
    }
    Ok(list)
}

fn signed_sum(signs: &[char], terms: &[Term]) -> Term {
    let mut acc: Option<Term> = None;
    for (sign, t) in signs.iter().zip(terms) {
        let t = t.clone();
        acc = Some(match (acc, sign) {
            (None, '-') => t.neg(),
            (None, _) => t,
            (Some(a), '-') => a.minus(t),
            (Some(Term::Add(mut parts)), _) => {
                parts.push(t);
                Term::Add(parts)
            }
            (Some(a), _) => a.plus(t),
        });
    }
    acc.unwrap_or_else(Term::zero)
}

fn signed_product(ops: &[char], terms: &[Term]) -> Term {
    let mut acc: Option<Term> = None;
    for (op, t) in ops.iter().zip(terms) {
        let t = t.clone();
        acc = Some(match (acc, op) {
            (None, '/') => Term::one().over(t),
            (None, _) => t,
            (Some(a), '/') => a.over(t),
            (Some(Term::Mul(mut parts)), _) => {
                parts.push(t);
                Term::Mul(parts)
            }
            (Some(a), _) => a.times(t),
        });
    }
    acc.unwrap_or_else(Term::one)
}

/// Sum of all elements, one operand per element.
fn reduce_sum(elements: Vec<Term>) -> Term {
    let n = elements.len();
    signed_sum(&vec!['+'; n], &elements)
}

fn reduce_product(elements: Vec<Term>) -> Term {
    let n = elements.len();
    signed_product(&vec!['*'; n], &elements)
}

/// `Inputs` is either a port count or a sign per port (`|` spaces them out).
/// A single port sums up the elements of its vector input.
pub fn sum(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let signs = operators(ctx, block, "+-")?;
    let inputs = ctx.inputs(block);
    let body = if let ([sign], [u]) = (signs.as_slice(), inputs.as_slice()) {
        let total = reduce_sum(elements_of(ctx, u));
        MacroBody::Simple(if *sign == '-' { total.neg() } else { total })
    } else {
        broadcast(ctx, &inputs, |ts| signed_sum(&signs, ts))
    };
    ctx.define(block, 0, body)
}

pub fn product(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    match ctx.param(block, "Multiplication") {
        None | Some("Element-wise(.*)") => {}
        Some(mode) => return ctx.degrade(block, format!("multiplication mode `{mode}`")),
    }
    let ops = operators(ctx, block, "*/")?;
    let inputs = ctx.inputs(block);
    let body = if let ([op], [u]) = (ops.as_slice(), inputs.as_slice()) {
        let total = reduce_product(elements_of(ctx, u));
        MacroBody::Simple(if *op == '/' { Term::one().over(total) } else { total })
    } else {
        broadcast(ctx, &inputs, |ts| signed_product(&ops, ts))
    };
    ctx.define(block, 0, body)
}

pub fn gain(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    match ctx.param(block, "Multiplication") {
        None | Some("Element-wise(K.*u)") => {}
        Some(mode) => return ctx.degrade(block, format!("multiplication mode `{mode}`")),
    }
    let u = ctx.input(block, 0);
    let body = match ctx.param_value(block, "Gain", Some("1"))? {
        ParamValue::Scalar(k) => broadcast(ctx, &[u], |ts| k.clone().times(ts[0].clone())),
        ParamValue::Vector(ks) => {
            let vector_input = matches!(ctx.shape(&u), Shape::Vector(_));
            MacroBody::Vector(
                ks.into_iter()
                    .zip(0u32..)
                    .map(|(k, i)| {
                        let x = if vector_input { element(&u, i) } else { u.clone() };
                        MacroBody::Simple(k.times(x))
                    })
                    .collect(),
            )
        }
    };
    ctx.define(block, 0, body)
}

pub fn bias(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let u = ctx.input(block, 0);
    let b = ctx.param_term(block, "Bias", Some("0"))?;
    let body = broadcast(ctx, &[u], |ts| ts[0].clone().plus(b.clone()));
    ctx.define(block, 0, body)
}

pub fn abs(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let u = ctx.input(block, 0);
    let body = ctx.elementwise(&u, |t| Term::call(Func::Abs, vec![t]));
    ctx.define(block, 0, body)
}

pub fn unary_minus(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let u = ctx.input(block, 0);
    let body = ctx.elementwise(&u, Term::neg);
    ctx.define(block, 0, body)
}

/// With one input the elements of that input are compared, otherwise the
/// inputs are compared elementwise.
pub fn min_max(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let func = match ctx.param(block, "Function").unwrap_or("min") {
        "min" => Func::Min,
        "max" => Func::Max,
        other => {
            return Err(SynthError::bad_parameter(
                block,
                "Function",
                other,
                "expected `min` or `max`",
            ))
        }
    };
    let inputs = ctx.inputs(block);
    let body = match inputs.as_slice() {
        [u] => match elements_of(ctx, u).as_slice() {
            [single] => MacroBody::Simple(single.clone()),
            many => MacroBody::Simple(Term::call(func, many.to_vec())),
        },
        _ => broadcast(ctx, &inputs, |ts| Term::call(func, ts.to_vec())),
    };
    ctx.define(block, 0, body)
}

/// Three-way selection between `1`, `0` and `-1`. A margin widens the band
/// that selects `0`.
pub fn sign(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let u = ctx.input(block, 0);
    let env = &*ctx.env;
    let body = per_element(ctx, &u, |x| {
        let (nonpos, pos) = env.split(x.clone(), RelOp::Le, Term::zero());
        let (nonneg, neg) = env.split(x, RelOp::Ge, Term::zero());
        MacroBody::Conditional(vec![
            (pos, Term::one()),
            (Formula::and([nonpos.clone(), nonneg]), Term::zero()),
            (Formula::and([nonpos, neg]), Term::num(-1)),
        ])
    });
    ctx.define(block, 0, body)
}
