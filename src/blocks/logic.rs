// Copyright 2024 Cornell University
// released under MIT License

use super::TransformCtx;
use crate::config::Environment;
use crate::errors::{SynthError, SynthResult};
use crate::ir::BlockId;
use crate::macros::MacroBody;
use crate::term::{Formula, Term};

/// `1` while `f` holds, `0` otherwise.
fn indicator(f: Formula) -> MacroBody {
    let not_f = f.negate();
    MacroBody::Conditional(vec![(f, Term::one()), (not_f, Term::zero())])
}

fn xor(a: Formula, b: Formula) -> Formula {
    Formula::or([
        Formula::and([a.clone(), b.negate()]),
        Formula::and([a.negate(), b]),
    ])
}

/// Boolean combination of the inputs, each read as true when nonzero.
pub fn logic(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let op = ctx.param(block, "Operator").unwrap_or("AND");
    let truth: Vec<Formula> = ctx
        .inputs(block)
        .into_iter()
        .map(|u| u.ne(Term::zero()))
        .collect();
    let f = match op {
        "AND" => Formula::and(truth),
        "OR" => Formula::or(truth),
        "NAND" => Formula::and(truth).negate(),
        "NOR" => Formula::or(truth).negate(),
        "XOR" | "NXOR" => {
            let mut bits = truth.into_iter();
            let first = bits.next().unwrap_or(Formula::False);
            let folded = bits.fold(first, xor);
            if op == "XOR" {
                folded
            } else {
                folded.negate()
            }
        }
        "NOT" => match truth.as_slice() {
            [single] => single.negate(),
            _ => {
                return Err(SynthError::bad_parameter(
                    block,
                    "Operator",
                    op,
                    "NOT takes exactly one input",
                ))
            }
        },
        _ => return ctx.degrade(block, format!("logic operator `{op}`")),
    };
    ctx.define(block, 0, indicator(f))
}

/// `u1 op u2` as a `1`/`0` signal.
pub fn relational(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let text = ctx.param(block, "Operator").unwrap_or("<=");
    let Some(op) = Environment::canonical_relop(text) else {
        return match text {
            "isInf" | "isNaN" | "isFinite" => ctx.degrade(block, format!("operator `{text}`")),
            _ => Err(SynthError::bad_parameter(
                block,
                "Operator",
                text,
                "unknown relational operator",
            )),
        };
    };
    let lhs = ctx.input(block, 0);
    let rhs = ctx.input(block, 1);
    let (pos, neg) = ctx.env.split(lhs, op, rhs);
    ctx.define(
        block,
        0,
        MacroBody::Conditional(vec![(pos, Term::one()), (neg, Term::zero())]),
    )
}

#[cfg(test)]
mod tests {
    use super::super::tests::run_blocks;
    use crate::config::SynthConfig;
    use crate::macros::MacroBody;
    use crate::term::Term;

    fn truth_table(op: &str, inputs: usize) -> Vec<(Vec<f64>, f64)> {
        let names = ["a", "b", "c"];
        let mut src = String::from("model m\n");
        for n in &names[..inputs] {
            src.push_str(&format!("block Inport {n} {{ }}\n"));
        }
        src.push_str(&format!(
            "block Logic l {{ Operator = \"{op}\"; Inputs = \"{inputs}\"; }}\n"
        ));
        for (i, n) in names[..inputs].iter().enumerate() {
            src.push_str(&format!("line {n}.1 -> l.{}\n", i + 1));
        }
        let run = run_blocks(&src, &SynthConfig::default());
        let MacroBody::Conditional(branches) = run.body("l", 0) else {
            panic!("expected a conditional");
        };

        let mut rows = Vec::new();
        for bits in 0..(1u32 << inputs) {
            let values: Vec<f64> = (0..inputs)
                .map(|i| if bits & (1 << i) != 0 { 2.5 } else { 0.0 })
                .collect();
            let lookup = |s: &str| names.iter().position(|n| *n == s).map(|i| values[i]);
            let selected: Vec<f64> = branches
                .iter()
                .filter(|(g, _)| g.holds(&lookup).unwrap())
                .map(|(_, t)| t.eval(&lookup).unwrap())
                .collect();
            assert_eq!(selected.len(), 1, "{op} {values:?}");
            rows.push((values, selected[0]));
        }
        rows
    }

    fn outputs(rows: &[(Vec<f64>, f64)]) -> Vec<f64> {
        rows.iter().map(|(_, y)| *y).collect()
    }

    #[test]
    fn binary_operators() {
        // rows are 00, 10, 01, 11
        assert_eq!(outputs(&truth_table("AND", 2)), vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(outputs(&truth_table("OR", 2)), vec![0.0, 1.0, 1.0, 1.0]);
        assert_eq!(outputs(&truth_table("NAND", 2)), vec![1.0, 1.0, 1.0, 0.0]);
        assert_eq!(outputs(&truth_table("NOR", 2)), vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(outputs(&truth_table("XOR", 2)), vec![0.0, 1.0, 1.0, 0.0]);
        assert_eq!(outputs(&truth_table("NXOR", 2)), vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn xor_of_three_is_parity() {
        for (values, y) in truth_table("XOR", 3) {
            let ones = values.iter().filter(|v| **v != 0.0).count();
            assert_eq!(y, (ones % 2) as f64, "{values:?}");
        }
    }

    #[test]
    fn not_has_one_input() {
        assert_eq!(outputs(&truth_table("NOT", 1)), vec![1.0, 0.0]);
    }

    #[test]
    fn relational_uses_the_boundary_policy() {
        let src = "model m\nblock Inport a { }\nblock Inport b { }\nblock RelationalOperator r { Operator = \"<\"; }\nblock RelationalOperator q { Operator = \"isNaN\"; }\nline a.1 -> r.1, q.1\nline b.1 -> r.2\n";
        let (a, b) = (Term::sym("a"), Term::sym("b"));

        let strict = run_blocks(src, &SynthConfig::default());
        assert_eq!(
            strict.body("r", 0),
            MacroBody::Conditional(vec![
                (a.clone().lt(b.clone()), Term::one()),
                (a.clone().ge(b.clone()), Term::zero()),
            ])
        );
        assert!(strict.diagnostics.contains("operator `isNaN` is not supported"));

        let overlapping = run_blocks(
            src,
            &SynthConfig {
                overlapping_bounds: true,
                ..SynthConfig::default()
            },
        );
        assert_eq!(
            overlapping.body("r", 0),
            MacroBody::Conditional(vec![
                (a.clone().le(b.clone()), Term::one()),
                (a.ge(b), Term::zero()),
            ])
        );
        assert!(matches!(
            overlapping.body("q", 0),
            MacroBody::Simple(Term::Sym(ref v)) if v == "q_out1"
        ));
    }
}
