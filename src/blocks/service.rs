// Copyright 2024 Cornell University
// released under MIT License

//! Subsystems replaced wholesale by a hand-written contract.

use log::debug;
use rustc_hash::FxHashMap;

use super::TransformCtx;
use crate::errors::{SynthError, SynthResult};
use crate::hp::{Contract, HybridProgram, SampleTime};
use crate::ir::{BlockId, Diagram};
use crate::kind::BlockKind;
use crate::macros::MacroBody;
use crate::term::Term;

/// Contract standing in for `block`, matched by library reference first and
/// by block name second.
pub fn contract_for<'c>(
    diagram: &Diagram,
    block: BlockId,
    contracts: &'c [Contract],
) -> Option<&'c Contract> {
    let b = &diagram[block];
    if BlockKind::from_type_name(b.type_name()) != Some(BlockKind::SubSystem) {
        return None;
    }
    b.library_ref
        .as_deref()
        .and_then(|lib| contracts.iter().find(|c| c.name == lib))
        .or_else(|| contracts.iter().find(|c| c.name == b.name()))
}

fn check_arity(
    block: BlockId,
    contract: &Contract,
    what: &str,
    declared: usize,
    present: usize,
) -> SynthResult<()> {
    if declared == present {
        return Ok(());
    }
    Err(SynthError::bad_parameter(
        block,
        "contract",
        &contract.name,
        format!("declares {declared} {what} but the subsystem has {present}"),
    ))
}

/// Instantiates `contract` for `block`.
///
/// Contract inputs read the terms feeding the subsystem. Outputs, ghosts and
/// any other symbol the program assigns become variables of the block, and
/// the remaining symbols are model constants. The step
/// `?assumption; program` runs with the inherited sample time.
pub fn apply_contract(
    ctx: &mut TransformCtx<'_, '_>,
    block: BlockId,
    contract: &Contract,
) -> SynthResult<()> {
    check_arity(
        block,
        contract,
        "inputs",
        contract.inputs.len(),
        ctx.block(block).inputs().len(),
    )?;
    check_arity(
        block,
        contract,
        "outputs",
        contract.outputs.len(),
        ctx.block(block).outputs().len(),
    )?;
    debug!(
        "{} follows contract `{}`",
        ctx.diagram().full_name(block),
        contract.name
    );

    let mut map: FxHashMap<String, Term> = FxHashMap::default();
    for (i, name) in contract.inputs.iter().enumerate() {
        let u = ctx.input(block, i);
        map.insert(name.clone(), u);
    }
    for (i, name) in contract.outputs.iter().enumerate() {
        let y = Term::sym(ctx.fresh_variable(block, name));
        ctx.define(block, i, MacroBody::Simple(y.clone()))?;
        map.insert(name.clone(), y);
    }
    for name in &contract.ghosts {
        let g = Term::sym(ctx.fresh_variable(block, name));
        map.insert(name.clone(), g);
    }

    let behavior = HybridProgram::seq([
        HybridProgram::test(contract.assumption.clone()),
        contract.program.clone(),
    ]);
    for local in behavior.bound_variables() {
        if !map.contains_key(&local) {
            let v = Term::sym(ctx.fresh_variable(block, &local));
            map.insert(local, v);
        }
    }
    for s in behavior.symbols() {
        if !map.contains_key(&s) {
            ctx.add_constant(block, &s);
        }
    }
    ctx.commit(SampleTime::Inherited, [behavior.rename(&map)]);
    Ok(())
}
