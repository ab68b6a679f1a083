// Copyright 2024 Cornell University
// released under MIT License

use std::io::Write;

use crate::assemble::HybridModel;
use crate::config::sanitize;
use crate::hp::{HybridProgram, Ode};
use crate::ir::{BlockId, Diagram};
use crate::kind::BlockKind;
use crate::macros::MacroBody;
use crate::term::{Formula, PortRef, RelOp, Term};

pub fn serialize_to_string(
    diagram: &Diagram,
    model: &HybridModel,
    show_macros: bool,
) -> std::io::Result<String> {
    let mut out = Vec::new();
    serialize_model(&mut out, diagram, model, show_macros)?;
    let out = String::from_utf8_lossy(&out).into_owned();
    Ok(out)
}

/// `ctrl_sum_out1`, with `[k]` appended for element `k - 1`.
fn serialize_port(diagram: &Diagram, r: &PortRef) -> String {
    let p = &diagram[r.port];
    let name = format!(
        "{}_{}{}",
        sanitize(&diagram.full_name(p.owner())),
        p.dir(),
        p.index() + 1
    );
    match r.element {
        Some(k) => format!("{name}[{}]", k + 1),
        None => name,
    }
}

fn term_prec(t: &Term) -> u8 {
    match t {
        Term::Add(_) | Term::Sub(..) => 1,
        Term::Mul(_) | Term::Div(..) => 2,
        Term::Neg(_) => 3,
        Term::Num(n) if n.value() < 0.0 => 3,
        Term::Pow(..) => 4,
        _ => 5,
    }
}

fn wrap_term(diagram: &Diagram, t: &Term, parens: bool) -> String {
    let s = serialize_term(diagram, t);
    if parens {
        format!("({s})")
    } else {
        s
    }
}

pub fn serialize_term(diagram: &Diagram, t: &Term) -> String {
    let sub = |t: &Term, min: u8| wrap_term(diagram, t, term_prec(t) < min);
    match t {
        Term::Num(n) => n.to_string(),
        Term::Sym(s) => s.clone(),
        Term::Port(r) => serialize_port(diagram, r),
        Term::Neg(x) => format!("-{}", sub(x, 4)),
        Term::Add(args) => args
            .iter()
            .map(|a| sub(a, 1))
            .collect::<Vec<_>>()
            .join(" + "),
        Term::Sub(a, b) => format!("{} - {}", sub(a, 1), sub(b, 2)),
        Term::Mul(args) => args
            .iter()
            .map(|a| sub(a, 2))
            .collect::<Vec<_>>()
            .join(" * "),
        Term::Div(a, b) => format!("{} / {}", sub(a, 2), sub(b, 3)),
        Term::Pow(a, b) => format!("{}^{}", sub(a, 5), sub(b, 5)),
        Term::Call(func, args) => format!(
            "{}({})",
            func.name(),
            args.iter()
                .map(|a| serialize_term(diagram, a))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn serialize_relop(op: RelOp) -> &'static str {
    match op {
        RelOp::Eq => "=",
        RelOp::Ne => "!=",
        RelOp::Lt => "<",
        RelOp::Le => "<=",
        RelOp::Gt => ">",
        RelOp::Ge => ">=",
    }
}

fn formula_prec(f: &Formula) -> u8 {
    match f {
        Formula::Forall(..) | Formula::Exists(..) => 0,
        Formula::Implies(..) => 1,
        Formula::Or(_) => 2,
        Formula::And(_) => 3,
        _ => 4,
    }
}

pub fn serialize_formula(diagram: &Diagram, f: &Formula) -> String {
    let sub = |g: &Formula, min: u8| {
        let s = serialize_formula(diagram, g);
        if formula_prec(g) < min {
            format!("({s})")
        } else {
            s
        }
    };
    match f {
        Formula::True => "true".to_string(),
        Formula::False => "false".to_string(),
        Formula::Rel(a, op, b) => format!(
            "{} {} {}",
            serialize_term(diagram, a),
            serialize_relop(*op),
            serialize_term(diagram, b)
        ),
        Formula::And(parts) => parts
            .iter()
            .map(|p| sub(p, 4))
            .collect::<Vec<_>>()
            .join(" & "),
        Formula::Or(parts) => parts
            .iter()
            .map(|p| sub(p, 3))
            .collect::<Vec<_>>()
            .join(" | "),
        Formula::Not(inner) => format!("!({})", serialize_formula(diagram, inner)),
        Formula::Implies(a, b) => format!("{} -> {}", sub(a, 2), sub(b, 1)),
        Formula::Forall(v, body) => format!("forall {v}. {}", serialize_formula(diagram, body)),
        Formula::Exists(v, body) => format!("exists {v}. {}", serialize_formula(diagram, body)),
    }
}

fn serialize_ode(diagram: &Diagram, ode: &Ode) -> String {
    let eqs = ode
        .equations
        .iter()
        .map(|(x, t)| format!("{x}' = {}", serialize_term(diagram, t)))
        .collect::<Vec<_>>()
        .join(", ");
    match &ode.domain {
        Formula::True => format!("{{{eqs}}}"),
        domain => format!("{{{eqs} & {}}}", serialize_formula(diagram, domain)),
    }
}

/// Single-line rendering of a program.
pub fn serialize_program(diagram: &Diagram, p: &HybridProgram) -> String {
    match p {
        HybridProgram::Assign(x, t) => format!("{x} := {}", serialize_term(diagram, t)),
        HybridProgram::AssignAny(x) => format!("{x} := *"),
        HybridProgram::Test(f) => format!("?{}", serialize_formula(diagram, f)),
        HybridProgram::Evolve(ode) => serialize_ode(diagram, ode),
        HybridProgram::Seq(parts) if parts.is_empty() => "?true".to_string(),
        HybridProgram::Seq(parts) => parts
            .iter()
            .map(|q| match q {
                HybridProgram::Choice(_) => format!("{{ {} }}", serialize_program(diagram, q)),
                _ => serialize_program(diagram, q),
            })
            .collect::<Vec<_>>()
            .join("; "),
        HybridProgram::Choice(parts) => parts
            .iter()
            .map(|q| serialize_program(diagram, q))
            .collect::<Vec<_>>()
            .join(" ++ "),
        HybridProgram::Loop(body) => format!("{{ {} }}*", serialize_program(diagram, body)),
    }
}

/// One statement per line. Choices and loops open an indented block.
fn build_statements(
    out: &mut impl Write,
    diagram: &Diagram,
    p: &HybridProgram,
    index: usize,
) -> std::io::Result<()> {
    match p {
        HybridProgram::Seq(parts) if !parts.is_empty() => {
            for q in parts {
                build_statements(out, diagram, q, index)?;
            }
        }
        HybridProgram::Choice(parts) => {
            writeln!(out, "{}{{", "  ".repeat(index))?;
            for (i, q) in parts.iter().enumerate() {
                if i > 0 {
                    writeln!(out, "{}++", "  ".repeat(index))?;
                }
                build_statements(out, diagram, q, index + 1)?;
            }
            writeln!(out, "{}}}", "  ".repeat(index))?;
        }
        HybridProgram::Loop(body) => {
            writeln!(out, "{}{{", "  ".repeat(index))?;
            build_statements(out, diagram, body, index + 1)?;
            writeln!(out, "{}}}*", "  ".repeat(index))?;
        }
        atom => writeln!(
            out,
            "{}{};",
            "  ".repeat(index),
            serialize_program(diagram, atom)
        )?,
    }
    Ok(())
}

pub fn serialize_body(diagram: &Diagram, body: &MacroBody) -> String {
    match body {
        MacroBody::Simple(t) => serialize_term(diagram, t),
        MacroBody::Conditional(branches) => format!(
            "{{ {} }}",
            branches
                .iter()
                .map(|(g, t)| format!(
                    "{} if {}",
                    serialize_term(diagram, t),
                    serialize_formula(diagram, g)
                ))
                .collect::<Vec<_>>()
                .join("; ")
        ),
        MacroBody::Vector(elements) => format!(
            "[{}]",
            elements
                .iter()
                .map(|e| serialize_body(diagram, e))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        MacroBody::SizePropagation { source, template } => format!(
            "each {} in {}",
            serialize_port(
                diagram,
                &PortRef {
                    port: *source,
                    element: None
                }
            ),
            serialize_term(diagram, template)
        ),
        MacroBody::Placeholder => "?".to_string(),
    }
}

fn serialize_origin(diagram: &Diagram, origin: Option<BlockId>) -> String {
    match origin {
        Some(b) => {
            let type_name = diagram[b].type_name();
            let label = BlockKind::from_type_name(type_name).map_or(type_name, |k| k.label());
            format!("  // {label} `{}`", diagram.full_name(b))
        }
        None => String::new(),
    }
}

pub fn serialize_model(
    out: &mut impl Write,
    diagram: &Diagram,
    model: &HybridModel,
    show_macros: bool,
) -> std::io::Result<()> {
    writeln!(out, "model {}", model.name)?;

    if !model.variables.is_empty() {
        writeln!(out, "\nvariables")?;
        for v in &model.variables {
            writeln!(out, "  {}{}", v.name, serialize_origin(diagram, v.origin))?;
        }
    }
    if !model.constants.is_empty() {
        writeln!(out, "\nconstants")?;
        for c in &model.constants {
            writeln!(out, "  {}{}", c.name, serialize_origin(diagram, c.origin))?;
        }
    }

    writeln!(out, "\ninit")?;
    match &model.init {
        Formula::And(parts) => {
            for p in parts {
                writeln!(out, "  {}", serialize_formula(diagram, p))?;
            }
        }
        f => writeln!(out, "  {}", serialize_formula(diagram, f))?,
    }

    for step in &model.discrete {
        writeln!(out, "\ndiscrete {}", step.sample_time)?;
        for stmt in &step.statements {
            build_statements(out, diagram, stmt, 1)?;
        }
    }

    writeln!(out, "\nevolution")?;
    build_statements(out, diagram, &model.evolution, 1)?;

    if show_macros {
        writeln!(out, "\nmacros")?;
        for m in &model.macros {
            writeln!(
                out,
                "  {} = {}",
                serialize_port(
                    diagram,
                    &PortRef {
                        port: m.port,
                        element: None
                    }
                ),
                serialize_body(diagram, &m.body)
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tests::build_delay_chain;
    use crate::term::Func;

    fn x() -> Term {
        Term::sym("x")
    }

    #[test]
    fn terms_keep_their_grouping() {
        let d = build_delay_chain();
        let (a, b) = (Term::sym("a"), Term::sym("b"));
        let cases = [
            (x().plus(a.clone()).times(b.clone()), "(x + a) * b"),
            (x().minus(a.clone().minus(b.clone())), "x - (a - b)"),
            (x().minus(a.clone()).minus(b.clone()), "x - a - b"),
            (x().over(a.clone().times(b.clone())), "x / (a * b)"),
            (x().times(a.clone()).over(b.clone()), "x * a / b"),
            (x().plus(a.clone()).neg(), "-(x + a)"),
            (x().pow(Term::num(2)).neg(), "-x^2"),
            (Term::num(-2).pow(x()), "(-2)^x"),
            (Term::num(0.5).times(x().neg()), "0.5 * -x"),
            (
                Term::call(Func::Max, vec![x(), a.plus(b)]),
                "max(x, a + b)",
            ),
        ];
        for (t, expected) in cases {
            assert_eq!(serialize_term(&d, &t), expected);
        }
    }

    #[test]
    fn ports_use_stable_identifiers() {
        let d = build_delay_chain();
        let c = d.block_by_name("c").unwrap();
        let out = d[c].outputs()[0];
        assert_eq!(serialize_term(&d, &Term::port(out)), "c_out1");
        assert_eq!(serialize_term(&d, &Term::port_element(out, 2)), "c_out1[3]");
    }

    #[test]
    fn formulas_keep_their_grouping() {
        let d = build_delay_chain();
        let f = Formula::and([
            x().gt(Term::zero()),
            Formula::or([x().lt(Term::one()), x().eq(Term::num(2))]),
        ]);
        assert_eq!(serialize_formula(&d, &f), "x > 0 & (x < 1 | x = 2)");
        assert_eq!(
            serialize_formula(&d, &Formula::Not(Box::new(x().ne(Term::zero())))),
            "!(x != 0)"
        );
        let g = x().ge(Term::zero()).implies(x().le(Term::one()));
        assert_eq!(serialize_formula(&d, &g), "x >= 0 -> x <= 1");
        assert_eq!(
            serialize_formula(&d, &Formula::forall("x", g)),
            "forall x. x >= 0 -> x <= 1"
        );
    }

    #[test]
    fn programs_on_one_line() {
        let d = build_delay_chain();
        let p = HybridProgram::repeat(HybridProgram::seq([
            HybridProgram::choice([
                HybridProgram::seq([
                    HybridProgram::test(x().gt(Term::zero())),
                    HybridProgram::assign("x", Term::zero()),
                ]),
                HybridProgram::AssignAny("x".to_string()),
            ]),
            HybridProgram::Evolve(Ode::new(
                vec![("x".to_string(), Term::one())],
                x().le(Term::num(5)),
            )),
        ]));
        assert_eq!(
            serialize_program(&d, &p),
            "{ { ?x > 0; x := 0 ++ x := * }; {x' = 1 & x <= 5} }*"
        );
        assert_eq!(serialize_program(&d, &HybridProgram::seq([])), "?true");
    }

    #[test]
    fn statements_are_indented() {
        let d = build_delay_chain();
        let p = HybridProgram::seq([
            HybridProgram::assign("y", x()),
            HybridProgram::choice([
                HybridProgram::test(x().ge(Term::zero())),
                HybridProgram::seq([
                    HybridProgram::test(x().lt(Term::zero())),
                    HybridProgram::assign("x", Term::zero()),
                ]),
            ]),
        ]);
        let mut out = Vec::new();
        build_statements(&mut out, &d, &p, 1).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "  y := x;\n  {\n    ?x >= 0;\n  ++\n    ?x < 0;\n    x := 0;\n  }\n"
        );
    }

    #[test]
    fn macro_bodies() {
        let d = build_delay_chain();
        let body = MacroBody::Vector(vec![
            MacroBody::Simple(Term::one()),
            MacroBody::Conditional(vec![
                (x().gt(Term::zero()), Term::one()),
                (x().le(Term::zero()), Term::zero()),
            ]),
        ]);
        assert_eq!(serialize_body(&d, &body), "[1, { 1 if x > 0; 0 if x <= 0 }]");
        assert_eq!(serialize_body(&d, &MacroBody::Placeholder), "?");
    }
}
