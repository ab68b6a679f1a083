// Copyright 2024 Cornell University
// released under MIT License

use super::{contract_for, element, service, TransformCtx};
use crate::errors::{SynthError, SynthResult};
use crate::ir::BlockId;
use crate::kind::BlockKind;
use crate::macros::{MacroBody, Shape};
use crate::term::Term;

/// 1-based `Port` of an inner `Inport`/`Outport`. Without the parameter the
/// port number is the position among blocks of the same kind in the scope.
fn port_number(ctx: &TransformCtx<'_, '_>, block: BlockId) -> SynthResult<usize> {
    let diagram = ctx.diagram();
    let kind = BlockKind::from_type_name(diagram[block].type_name());
    let position = diagram
        .scope(diagram[block].parent())
        .iter()
        .filter(|b| BlockKind::from_type_name(diagram[**b].type_name()) == kind)
        .position(|b| *b == block)
        .unwrap_or(0)
        + 1;
    let n = ctx.param_number(block, "Port", &position.to_string())?;
    if !n.is_integer() || n.value() < 1.0 {
        return Err(SynthError::bad_parameter(
            block,
            "Port",
            &n.to_string(),
            "expected a positive port number",
        ));
    }
    Ok(n.value() as usize)
}

/// An `Inport` inside a subsystem forwards what feeds the subsystem.
pub(super) fn inner_inport(
    ctx: &mut TransformCtx<'_, '_>,
    block: BlockId,
    parent: BlockId,
) -> SynthResult<()> {
    let k = port_number(ctx, block)?;
    let available = ctx.block(parent).inputs().len();
    if k > available {
        return Err(SynthError::bad_parameter(
            block,
            "Port",
            &k.to_string(),
            format!("the subsystem has {available} inputs"),
        ));
    }
    let u = ctx.input(parent, k - 1);
    ctx.define(block, 0, MacroBody::Simple(u))
}

/// A subsystem either follows its contract or is flattened: its inner blocks
/// were transformed already and each output reads the matching `Outport`.
pub fn subsystem(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    if let Some(contract) = contract_for(ctx.diagram(), block, ctx.contracts) {
        return service::apply_contract(ctx, block, contract);
    }
    let diagram = ctx.diagram();
    let outports: Vec<BlockId> = diagram
        .scope(Some(block))
        .iter()
        .copied()
        .filter(|b| BlockKind::from_type_name(diagram[*b].type_name()) == Some(BlockKind::Outport))
        .collect();
    let mut numbered = Vec::with_capacity(outports.len());
    for o in outports {
        numbered.push((port_number(ctx, o)?, o));
    }

    for index in 0..ctx.block(block).outputs().len() {
        let body = match numbered.iter().find(|(k, _)| *k == index + 1) {
            Some((_, o)) => MacroBody::Simple(ctx.input(*o, 0)),
            None => {
                ctx.warn(SynthError::unsupported(
                    block,
                    format!("output {} without an Outport", index + 1),
                ));
                MacroBody::Simple(Term::zero())
            }
        };
        ctx.define(block, index, body)?;
    }
    Ok(())
}

/// Outports, terminators and displays contribute nothing.
pub fn sink(_ctx: &mut TransformCtx<'_, '_>, _block: BlockId) -> SynthResult<()> {
    Ok(())
}

/// Concatenates the elements of all inputs into one vector.
pub fn mux(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let mut elements = Vec::new();
    for u in ctx.inputs(block) {
        match ctx.shape(&u) {
            Shape::Vector(n) => {
                elements.extend((0..n as u32).map(|k| MacroBody::Simple(element(&u, k))))
            }
            _ => elements.push(MacroBody::Simple(u)),
        }
    }
    ctx.define(block, 0, MacroBody::Vector(elements))
}

/// Splits a vector evenly across the outputs.
pub fn demux(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let u = ctx.input(block, 0);
    let outputs = ctx.block(block).outputs().len();
    let width = match ctx.shape(&u) {
        Shape::Scalar => 1,
        Shape::Vector(n) => n,
        Shape::Unknown => {
            return ctx.degrade(block, "demultiplexing a signal of unknown width");
        }
    };
    if outputs == 0 || width % outputs != 0 {
        return ctx.degrade(
            block,
            format!("splitting {width} elements into {outputs} outputs"),
        );
    }
    if width == 1 {
        return ctx.define(block, 0, MacroBody::Simple(u));
    }
    let chunk = width / outputs;
    for index in 0..outputs {
        let part: Vec<MacroBody> = (0..chunk)
            .map(|j| MacroBody::Simple(element(&u, (index * chunk + j) as u32)))
            .collect();
        let body = match <[MacroBody; 1]>::try_from(part) {
            Ok([single]) => single,
            Err(part) => MacroBody::Vector(part),
        };
        ctx.define(block, index, body)?;
    }
    Ok(())
}
