// Copyright 2024 Cornell University
// released under MIT License

//! Loader for textual block diagrams and parser for the expression language
//! used in block parameters and service contracts.

use pest::error::InputLocation;
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::PrattParser;
use pest::Parser;
use pest_derive::Parser;

use crate::config::Environment;
use crate::diagnostic::{DiagnosticHandler, Level};
use crate::hp::{Contract, HybridProgram, Ode};
use crate::ir::{BlockId, Diagram, PortId};
use crate::kind::BlockKind;
use crate::term::{Formula, Func, Number, Term};

#[derive(Parser)]
#[grammar = "diagram.pest"]
struct DiagramParser;

lazy_static::lazy_static! {
    static ref TERM_PARSER: PrattParser<Rule> = {
        use pest::pratt_parser::{Assoc::*, Op};
        use Rule::*;

        // Precedence is defined lowest to highest
        PrattParser::new()
            .op(Op::infix(op_add, Left) | Op::infix(op_sub, Left))
            .op(Op::infix(op_mul, Left) | Op::infix(op_div, Left))
            .op(Op::prefix(op_neg))
            .op(Op::infix(op_pow, Right))
    };

    static ref FORMULA_PARSER: PrattParser<Rule> = {
        use pest::pratt_parser::{Assoc::*, Op};
        use Rule::*;

        PrattParser::new()
            .op(Op::infix(f_implies, Right))
            .op(Op::infix(f_or, Left))
            .op(Op::infix(f_and, Left))
            .op(Op::prefix(f_not))
    };
}

/// A parsed block parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Scalar(Term),
    Vector(Vec<Term>),
}

impl ParamValue {
    /// number of elements, `1` for scalars
    pub fn len(&self) -> usize {
        match self {
            ParamValue::Scalar(_) => 1,
            ParamValue::Vector(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elements(&self) -> Vec<Term> {
        match self {
            ParamValue::Scalar(t) => vec![t.clone()],
            ParamValue::Vector(v) => v.clone(),
        }
    }
}

/// Everything a model file declares.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub diagram: Diagram,
    pub contracts: Vec<Contract>,
}

impl LoadedModel {
    pub fn contract(&self, name: &str) -> Option<&Contract> {
        self.contracts.iter().find(|c| c.name == name)
    }
}

fn pest_message(err: &pest::error::Error<Rule>) -> String {
    err.variant.message().to_string()
}

fn next_pair<'i>(pairs: &mut Pairs<'i, Rule>, what: &str) -> Result<Pair<'i, Rule>, String> {
    pairs.next().ok_or_else(|| format!("expected {what}"))
}

fn named_constant(name: &str) -> Option<f64> {
    match name {
        "eps" => Some(f64::EPSILON),
        "inf" | "Inf" => Some(f64::INFINITY),
        "pi" => Some(std::f64::consts::PI),
        _ => None,
    }
}

fn build_primary(primary: Pair<Rule>) -> Result<Term, String> {
    match primary.as_rule() {
        Rule::number => primary
            .as_str()
            .parse::<f64>()
            .map(Term::num)
            .map_err(|e| format!("invalid number `{}`: {e}", primary.as_str())),
        Rule::ident => Ok(match named_constant(primary.as_str()) {
            Some(v) => Term::num(v),
            None => Term::sym(primary.as_str()),
        }),
        Rule::paren => {
            let mut inner = primary.into_inner();
            build_term(next_pair(&mut inner, "a term")?)
        }
        Rule::call => {
            let mut inner = primary.into_inner();
            let name = next_pair(&mut inner, "a function name")?;
            let func = Func::from_name(name.as_str())
                .ok_or_else(|| format!("unknown function `{}`", name.as_str()))?;
            let args = inner.map(build_term).collect::<Result<Vec<_>, _>>()?;
            if func == Func::Abs && args.len() != 1 {
                return Err(format!("abs takes one argument, got {}", args.len()));
            }
            Ok(Term::call(func, args))
        }
        rule => Err(format!("unexpected {rule:?} in a term")),
    }
}

/// Builds a term from a `term` pair.
fn build_term(pair: Pair<Rule>) -> Result<Term, String> {
    TERM_PARSER
        .map_primary(build_primary)
        .map_prefix(|op, rhs| match op.as_rule() {
            Rule::op_neg => Ok(match rhs? {
                Term::Num(n) => Term::num(-n.value()),
                t => t.neg(),
            }),
            rule => Err(format!("unexpected prefix {rule:?}")),
        })
        .map_infix(|lhs, op, rhs| {
            let (lhs, rhs) = (lhs?, rhs?);
            Ok(match op.as_rule() {
                Rule::op_add => match lhs {
                    Term::Add(mut terms) => {
                        terms.push(rhs);
                        Term::Add(terms)
                    }
                    lhs => lhs.plus(rhs),
                },
                Rule::op_sub => lhs.minus(rhs),
                Rule::op_mul => match lhs {
                    Term::Mul(mut terms) => {
                        terms.push(rhs);
                        Term::Mul(terms)
                    }
                    lhs => lhs.times(rhs),
                },
                Rule::op_div => lhs.over(rhs),
                Rule::op_pow => lhs.pow(rhs),
                rule => return Err(format!("unexpected operator {rule:?}")),
            })
        })
        .parse(pair.into_inner())
}

fn build_element(pair: Pair<Rule>) -> Result<Term, String> {
    let mut negate = false;
    let mut value = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::op_neg => negate = true,
            _ => value = Some(build_primary(p)?),
        }
    }
    let value = value.ok_or_else(|| "empty vector element".to_string())?;
    Ok(match (negate, value) {
        (false, v) => v,
        (true, Term::Num(n)) => Term::num(-n.value()),
        (true, v) => v.neg(),
    })
}

fn build_relop(pair: &Pair<Rule>) -> Result<crate::term::RelOp, String> {
    Environment::canonical_relop(pair.as_str())
        .ok_or_else(|| format!("unknown relation `{}`", pair.as_str()))
}

fn build_formula_primary(primary: Pair<Rule>) -> Result<Formula, String> {
    match primary.as_rule() {
        Rule::f_true => Ok(Formula::True),
        Rule::f_false => Ok(Formula::False),
        Rule::rel => {
            let mut inner = primary.into_inner();
            let lhs = build_term(next_pair(&mut inner, "a term")?)?;
            let op = build_relop(&next_pair(&mut inner, "a relation")?)?;
            let rhs = build_term(next_pair(&mut inner, "a term")?)?;
            Ok(Formula::Rel(lhs, op, rhs))
        }
        Rule::f_paren => {
            let mut inner = primary.into_inner();
            build_formula(next_pair(&mut inner, "a formula")?)
        }
        Rule::quantified => {
            let mut inner = primary.into_inner();
            let kw = next_pair(&mut inner, "a quantifier")?;
            let var = next_pair(&mut inner, "a variable")?.as_str().to_string();
            let body = build_formula(next_pair(&mut inner, "a formula")?)?;
            Ok(match kw.as_rule() {
                Rule::kw_forall => Formula::forall(var, body),
                _ => Formula::exists(var, body),
            })
        }
        rule => Err(format!("unexpected {rule:?} in a formula")),
    }
}

/// Builds a formula from a `formula` pair.
fn build_formula(pair: Pair<Rule>) -> Result<Formula, String> {
    FORMULA_PARSER
        .map_primary(build_formula_primary)
        .map_prefix(|op, rhs| match op.as_rule() {
            Rule::f_not => Ok(Formula::Not(Box::new(rhs?))),
            rule => Err(format!("unexpected prefix {rule:?}")),
        })
        .map_infix(|lhs, op, rhs| {
            let (lhs, rhs) = (lhs?, rhs?);
            match op.as_rule() {
                Rule::f_and => Ok(Formula::and([lhs, rhs])),
                Rule::f_or => Ok(Formula::or([lhs, rhs])),
                Rule::f_implies => Ok(lhs.implies(rhs)),
                rule => Err(format!("unexpected connective {rule:?}")),
            }
        })
        .parse(pair.into_inner())
}

fn build_atom(pair: Pair<Rule>) -> Result<HybridProgram, String> {
    match pair.as_rule() {
        Rule::assign => {
            let mut inner = pair.into_inner();
            let var = next_pair(&mut inner, "a variable")?.as_str().to_string();
            let value = build_term(next_pair(&mut inner, "a term")?)?;
            Ok(HybridProgram::assign(var, value))
        }
        Rule::assign_any => {
            let mut inner = pair.into_inner();
            let var = next_pair(&mut inner, "a variable")?.as_str().to_string();
            Ok(HybridProgram::AssignAny(var))
        }
        Rule::test => {
            let mut inner = pair.into_inner();
            Ok(HybridProgram::test(build_formula(next_pair(
                &mut inner,
                "a formula",
            )?)?))
        }
        Rule::group => {
            let mut inner = pair.into_inner();
            build_program(next_pair(&mut inner, "a program")?)
        }
        Rule::repetition => {
            let mut inner = pair.into_inner();
            Ok(HybridProgram::repeat(build_program(next_pair(
                &mut inner,
                "a program",
            )?)?))
        }
        Rule::ode => {
            let mut equations = Vec::new();
            let mut domain = Formula::True;
            for p in pair.into_inner() {
                match p.as_rule() {
                    Rule::ode_eq => {
                        let mut inner = p.into_inner();
                        let var = next_pair(&mut inner, "a variable")?.as_str().to_string();
                        let rhs = build_term(next_pair(&mut inner, "a term")?)?;
                        equations.push((var, rhs));
                    }
                    _ => domain = build_formula(p)?,
                }
            }
            Ok(HybridProgram::Evolve(Ode::new(equations, domain)))
        }
        rule => Err(format!("unexpected {rule:?} in a program")),
    }
}

/// Builds a hybrid program from a `program` pair.
fn build_program(pair: Pair<Rule>) -> Result<HybridProgram, String> {
    let mut alternatives = Vec::new();
    for sequence in pair.into_inner() {
        let atoms = sequence
            .into_inner()
            .map(build_atom)
            .collect::<Result<Vec<_>, _>>()?;
        alternatives.push(HybridProgram::seq(atoms));
    }
    Ok(HybridProgram::choice(alternatives))
}

/// Parses a block parameter: a scalar expression or a vector literal such as `[1 -2 3]`.
pub fn parse_param(text: &str) -> Result<ParamValue, String> {
    let mut pairs = DiagramParser::parse(Rule::param_value, text.trim())
        .map_err(|e| pest_message(&e))?;
    let value = next_pair(&mut pairs, "a parameter")?;
    let mut inner = value.into_inner();
    let body = next_pair(&mut inner, "a value")?;
    match body.as_rule() {
        Rule::vector => Ok(ParamValue::Vector(
            body.into_inner()
                .map(build_element)
                .collect::<Result<Vec<_>, _>>()?,
        )),
        _ => Ok(ParamValue::Scalar(build_term(body)?)),
    }
}

/// Parses a scalar expression.
pub fn parse_term(text: &str) -> Result<Term, String> {
    match parse_param(text)? {
        ParamValue::Scalar(t) => Ok(t),
        ParamValue::Vector(_) => Err(format!("expected a scalar, found `{text}`")),
    }
}

/// Parses a scalar parameter that has to be a plain number.
pub fn parse_number(text: &str) -> Result<Number, String> {
    parse_term(text)?
        .as_number()
        .ok_or_else(|| format!("`{text}` is not a number"))
}

pub fn parse_formula(text: &str) -> Result<Formula, String> {
    let mut pairs = DiagramParser::parse(Rule::formula_entry, text.trim())
        .map_err(|e| pest_message(&e))?;
    let entry = next_pair(&mut pairs, "a formula")?;
    let mut inner = entry.into_inner();
    build_formula(next_pair(&mut inner, "a formula")?)
}

pub fn parse_program(text: &str) -> Result<HybridProgram, String> {
    let mut pairs = DiagramParser::parse(Rule::program_entry, text.trim())
        .map_err(|e| pest_message(&e))?;
    let entry = next_pair(&mut pairs, "a program")?;
    let mut inner = entry.into_inner();
    build_program(next_pair(&mut inner, "a program")?)
}

pub struct ParserContext<'a> {
    pub diagram: &'a mut Diagram,
    pub contracts: &'a mut Vec<Contract>,
    pub fileid: usize,
    pub handler: &'a mut DiagnosticHandler,
}

impl<'a> ParserContext<'a> {
    fn expect_rule<T>(
        &mut self,
        option: Option<T>,
        context_pair: &Pair<Rule>,
        message: &str,
    ) -> Result<T, String> {
        option.ok_or_else(|| self.fail(context_pair, message))
    }

    /// Reports `message` at `pair` and hands it back for propagation.
    fn fail(&mut self, pair: &Pair<Rule>, message: &str) -> String {
        self.handler
            .emit_diagnostic_parsing(message, self.fileid, pair, Level::Error);
        message.to_string()
    }

    fn scoped_name(&self, parent: Option<BlockId>, name: &str) -> String {
        match parent {
            Some(p) => format!("{}/{name}", self.diagram.full_name(p)),
            None => name.to_string(),
        }
    }

    fn declare(
        &mut self,
        pair: &Pair<Rule>,
        type_name: &str,
        name: &str,
        parent: Option<BlockId>,
    ) -> Result<BlockId, String> {
        let full = self.scoped_name(parent, name);
        if self.diagram.block_by_name(&full).is_some() {
            return Err(self.fail(pair, &format!("duplicate block name `{full}`")));
        }
        let id = self.diagram.add_block(type_name, name, parent);
        let span = pair.as_span();
        self.diagram
            .set_location(id, span.start(), span.end(), self.fileid);
        Ok(id)
    }

    fn parse_count(&mut self, pair: Pair<Rule>) -> Result<usize, String> {
        pair.as_str()
            .parse::<usize>()
            .map_err(|e| self.fail(&pair, &format!("invalid count: {e}")))
    }

    fn parse_ports(&mut self, pair: Pair<Rule>) -> Result<(usize, usize), String> {
        let mut inner = pair.clone().into_inner();
        let ins = self.expect_rule(inner.next(), &pair, "expected an input count")?;
        let outs = self.expect_rule(inner.next(), &pair, "expected an output count")?;
        Ok((self.parse_count(ins)?, self.parse_count(outs)?))
    }

    fn parse_assignment(&mut self, pair: Pair<Rule>) -> Result<(String, String), String> {
        let mut inner = pair.clone().into_inner();
        let key = self.expect_rule(inner.next(), &pair, "expected a parameter name")?;
        let value = self.expect_rule(inner.next(), &pair, "expected a parameter value")?;
        let text = value
            .into_inner()
            .next()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();
        Ok((key.as_str().to_string(), text))
    }

    pub fn parse_items<'i>(
        &mut self,
        pairs: impl IntoIterator<Item = Pair<'i, Rule>>,
        parent: Option<BlockId>,
    ) -> Result<(), String> {
        for pair in pairs {
            match pair.as_rule() {
                Rule::block => self.parse_block(pair, parent)?,
                Rule::subsystem => self.parse_subsystem(pair, parent)?,
                Rule::line => self.parse_line(pair, parent)?,
                Rule::contract => self.parse_contract(pair)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_block(&mut self, pair: Pair<Rule>, parent: Option<BlockId>) -> Result<(), String> {
        let mut inner = pair.clone().into_inner();
        let type_name = self.expect_rule(inner.next(), &pair, "expected a block type")?;
        let name = self.expect_rule(inner.next(), &pair, "expected a block name")?;
        let id = self.declare(&pair, type_name.as_str(), name.as_str(), parent)?;

        let mut explicit = None;
        for p in inner {
            match p.as_rule() {
                Rule::ports => explicit = Some(self.parse_ports(p)?),
                Rule::param => {
                    let (key, value) = self.parse_assignment(p)?;
                    self.diagram.set_param(id, key, value);
                }
                _ => {}
            }
        }
        let (ins, outs) = match explicit {
            Some(counts) => counts,
            None => BlockKind::from_type_name(type_name.as_str())
                .and_then(|k| k.default_ports(&self.diagram[id].params))
                .unwrap_or((1, 1)),
        };
        self.diagram.add_ports(id, ins, outs);
        Ok(())
    }

    fn parse_subsystem(&mut self, pair: Pair<Rule>, parent: Option<BlockId>) -> Result<(), String> {
        let mut inner = pair.clone().into_inner();
        let name = self.expect_rule(inner.next(), &pair, "expected a subsystem name")?;
        let ports = self.expect_rule(inner.next(), &pair, "expected a port declaration")?;
        let id = self.declare(&pair, BlockKind::SubSystem.type_name(), name.as_str(), parent)?;
        let (ins, outs) = self.parse_ports(ports)?;
        self.diagram.add_ports(id, ins, outs);

        let mut items = Vec::new();
        for p in inner {
            if p.as_rule() == Rule::attrs {
                for attr in p.into_inner() {
                    let (key, value) = self.parse_assignment(attr)?;
                    if key == "Library" {
                        self.diagram.set_library_ref(id, value.clone());
                    }
                    self.diagram.set_param(id, key, value);
                }
            } else {
                items.push(p);
            }
        }
        self.parse_items(items, Some(id))
    }

    fn resolve_endpoint(
        &mut self,
        pair: Pair<Rule>,
        parent: Option<BlockId>,
        output: bool,
    ) -> Result<PortId, String> {
        let mut inner = pair.clone().into_inner();
        let name = self.expect_rule(inner.next(), &pair, "expected a block name")?;
        let index = self.expect_rule(inner.next(), &pair, "expected a port number")?;
        let index = self.parse_count(index)?;
        let full = self.scoped_name(parent, name.as_str());
        let block = self.diagram.block_by_name(&full);
        let block = self.expect_rule(block, &pair, &format!("unknown block `{full}`"))?;
        let ports = if output {
            self.diagram[block].outputs()
        } else {
            self.diagram[block].inputs()
        };
        let port = index.checked_sub(1).and_then(|i| ports.get(i)).copied();
        let dir = if output { "output" } else { "input" };
        self.expect_rule(port, &pair, &format!("`{full}` has no {dir} {index}"))
    }

    fn parse_line(&mut self, pair: Pair<Rule>, parent: Option<BlockId>) -> Result<(), String> {
        let mut inner = pair.clone().into_inner();
        let src = self.expect_rule(inner.next(), &pair, "expected a line source")?;
        let src = self.resolve_endpoint(src, parent, true)?;
        for dst_pair in inner {
            let dst = self.resolve_endpoint(dst_pair.clone(), parent, false)?;
            if self.diagram[dst].source().is_some() {
                return Err(self.fail(&dst_pair, "input is already driven by another line"));
            }
            self.diagram.connect(src, dst);
        }
        Ok(())
    }

    fn parse_contract(&mut self, pair: Pair<Rule>) -> Result<(), String> {
        let mut inner = pair.clone().into_inner();
        let name = self.expect_rule(inner.next(), &pair, "expected a contract name")?;
        let signature = self.expect_rule(inner.next(), &pair, "expected a signature")?;

        let mut contract = Contract {
            name: name.as_str().to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            ghosts: Vec::new(),
            assumption: Formula::True,
            program: HybridProgram::skip(),
        };
        for part in signature.into_inner() {
            let mut names = part.into_inner();
            let kind = self.expect_rule(names.next(), &pair, "expected in, out or ghost")?;
            let target = match kind.as_str() {
                "in" => &mut contract.inputs,
                "out" => &mut contract.outputs,
                _ => &mut contract.ghosts,
            };
            target.extend(names.map(|n| n.as_str().to_string()));
        }
        for p in inner {
            let body = p.clone().into_inner().next();
            let body = self.expect_rule(body, &p, "expected a body")?;
            match p.as_rule() {
                Rule::assumption => {
                    contract.assumption = build_formula(body).map_err(|e| self.fail(&p, &e))?
                }
                Rule::behavior => {
                    contract.program = build_program(body).map_err(|e| self.fail(&p, &e))?
                }
                _ => {}
            }
        }
        if self.contracts.iter().any(|c| c.name == contract.name) {
            return Err(self.fail(&pair, &format!("duplicate contract `{}`", contract.name)));
        }
        self.contracts.push(contract);
        Ok(())
    }
}

/// Loads a model from source text, reporting problems to `handler` under `source_name`.
pub fn parse_str(
    source_name: &str,
    input: &str,
    handler: &mut DiagnosticHandler,
) -> Result<LoadedModel, String> {
    let fileid = handler.add_file(source_name.to_string(), input.to_string());

    let mut pairs = match DiagramParser::parse(Rule::file, input) {
        Ok(pairs) => pairs,
        Err(err) => {
            let (start, end) = match err.location {
                InputLocation::Pos(start) => (start, start),
                InputLocation::Span(span) => span,
            };
            let msg: String = format!("Lexing failed: {}", err.variant.message());
            handler.emit_diagnostic_lexing(&msg, fileid, start, end, Level::Error);
            return Err(msg);
        }
    };
    let file = next_pair(&mut pairs, "a model")?;
    let mut inner = file.into_inner();
    let name = next_pair(&mut inner, "a model name")?;

    let mut diagram = Diagram::new(name.as_str());
    let mut contracts = Vec::new();
    let mut context = ParserContext {
        diagram: &mut diagram,
        contracts: &mut contracts,
        fileid,
        handler,
    };
    context.parse_items(inner, None)?;
    Ok(LoadedModel { diagram, contracts })
}

pub fn parse_file(
    filename: impl AsRef<std::path::Path>,
    handler: &mut DiagnosticHandler,
) -> Result<LoadedModel, String> {
    let name = filename.as_ref().display().to_string();
    let input =
        std::fs::read_to_string(&filename).map_err(|e| format!("failed to load: {}", e))?;
    parse_str(&name, &input, handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::RelOp;

    fn x() -> Term {
        Term::sym("x")
    }

    #[test]
    fn terms_respect_precedence() {
        assert_eq!(
            parse_term("1 + 2 * x").unwrap(),
            Term::num(1).plus(Term::num(2).times(x()))
        );
        assert_eq!(
            parse_term("-x ^ 2").unwrap(),
            x().pow(Term::num(2)).neg()
        );
        assert_eq!(
            parse_term("2 ^ 3 ^ x").unwrap(),
            Term::num(2).pow(Term::num(3).pow(x()))
        );
        assert_eq!(
            parse_term("(a - b) / c").unwrap(),
            Term::sym("a").minus(Term::sym("b")).over(Term::sym("c"))
        );
        assert_eq!(
            parse_term("a + b + c").unwrap(),
            Term::Add(vec![Term::sym("a"), Term::sym("b"), Term::sym("c")])
        );
        assert_eq!(
            parse_term("max(x, 0)").unwrap(),
            Term::call(Func::Max, vec![x(), Term::zero()])
        );
        assert!(parse_term("abs(x, 1)").is_err());
        assert!(parse_term("1 +").is_err());
    }

    #[test]
    fn numbers_and_named_constants() {
        assert_eq!(parse_number("-1").unwrap(), Number::from(-1));
        assert_eq!(parse_number("2.5e-1").unwrap(), Number::from(0.25));
        assert_eq!(parse_number(".5").unwrap(), Number::from(0.5));
        assert_eq!(parse_number("eps").unwrap(), Number::from(f64::EPSILON));
        assert_eq!(parse_number("-inf").unwrap().value(), f64::NEG_INFINITY);
        assert!(parse_number("k").is_err());
        assert_eq!(parse_term("minimum").unwrap(), Term::sym("minimum"));
    }

    #[test]
    fn vectors() {
        assert_eq!(
            parse_param("[1 -2 x]").unwrap(),
            ParamValue::Vector(vec![Term::num(1), Term::num(-2), x()])
        );
        assert_eq!(
            parse_param("[1, 2; 3]").unwrap().len(),
            3
        );
        assert_eq!(
            parse_param("[(a - b) c]").unwrap(),
            ParamValue::Vector(vec![Term::sym("a").minus(Term::sym("b")), Term::sym("c")])
        );
        assert_eq!(parse_param("4").unwrap().elements(), vec![Term::num(4)]);
        assert!(parse_term("[1 2]").is_err());
    }

    #[test]
    fn formulas() {
        let f = parse_formula("x >= 0 & !(y = 1) -> z < 2 | z > 3").unwrap();
        let expected = Formula::and([
            x().ge(Term::zero()),
            Formula::Not(Box::new(Term::sym("y").eq(Term::one()))),
        ])
        .implies(Formula::or([
            Term::sym("z").lt(Term::num(2)),
            Term::sym("z").gt(Term::num(3)),
        ]));
        assert_eq!(f, expected);
        assert_eq!(
            parse_formula("(x + 1) != 0").unwrap(),
            Formula::Rel(x().plus(Term::one()), RelOp::Ne, Term::zero())
        );
        assert_eq!(
            parse_formula("forall t. t >= 0").unwrap(),
            Formula::forall("t", Term::sym("t").ge(Term::zero()))
        );
        assert_eq!(parse_formula("true").unwrap(), Formula::True);
        assert!(parse_formula("x").is_err());
    }

    #[test]
    fn programs() {
        let p = parse_program("x := *; ?x > 0; {x' = -x, t' = 1 & t <= 1} ++ {y := y + 1}*").unwrap();
        let expected = HybridProgram::choice([
            HybridProgram::seq([
                HybridProgram::AssignAny("x".to_string()),
                HybridProgram::test(x().gt(Term::zero())),
                HybridProgram::Evolve(Ode::new(
                    vec![
                        ("x".to_string(), x().neg()),
                        ("t".to_string(), Term::one()),
                    ],
                    Term::sym("t").le(Term::one()),
                )),
            ]),
            HybridProgram::repeat(HybridProgram::assign(
                "y",
                Term::sym("y").plus(Term::one()),
            )),
        ]);
        assert_eq!(p, expected);
        assert_eq!(
            parse_program("{ a := 1; b := 2 };").unwrap(),
            HybridProgram::seq([
                HybridProgram::assign("a", Term::one()),
                HybridProgram::assign("b", Term::num(2)),
            ])
        );
    }

    const NESTED: &str = r#"
model nested
// plant input
block Inport u { Port = "1"; }
subsystem ctrl (in 1, out 1) [Library = "Saturate"] {
    block Inport i { Port = "1"; }
    block Gain k { Gain = "2"; }
    block Outport o { Port = "1"; }
    line i.1 -> k.1
    line k.1 -> o.1
}
block Sum s { Inputs = "+-|+"; }
line u.1 -> ctrl.1, s.2
line ctrl.1 -> s.1
contract Saturate (in a; out y; ghost g) {
    assume a >= 0;
    program y := min(a, 1);
}
"#;

    #[test]
    fn load_nested_model() {
        let mut handler = DiagnosticHandler::default().quiet();
        let model = parse_str("nested.mdl.txt", NESTED, &mut handler).unwrap();
        let d = &model.diagram;
        assert_eq!(d.name, "nested");
        let ctrl = d.block_by_name("ctrl").unwrap();
        let k = d.block_by_name("ctrl/k").unwrap();
        let s = d.block_by_name("s").unwrap();
        let u = d.block_by_name("u").unwrap();
        assert_eq!(d[ctrl].library_ref.as_deref(), Some("Saturate"));
        assert_eq!(d[k].parent(), Some(ctrl));
        assert_eq!(d[s].inputs().len(), 3);
        assert_eq!(d.feeder(s, 1), Some(d[u].outputs()[0]));
        assert_eq!(d.feeder(s, 0), Some(d[ctrl].outputs()[0]));
        assert_eq!(d.feeder(s, 2), None);
        assert!(d.location(k).is_some());

        let c = model.contract("Saturate").unwrap();
        assert_eq!(c.inputs, vec!["a"]);
        assert_eq!(c.outputs, vec!["y"]);
        assert_eq!(c.ghosts, vec!["g"]);
        assert_eq!(c.assumption, Term::sym("a").ge(Term::zero()));
        assert_eq!(
            c.program,
            HybridProgram::assign("y", Term::call(Func::Min, vec![Term::sym("a"), Term::one()]))
        );
        assert!(!handler.has_errors());
    }

    #[test]
    fn loader_errors_point_at_the_source() {
        let mut handler = DiagnosticHandler::default().quiet();
        let src = "model m\nblock Gain g { }\nline g.1 -> h.1\n";
        let err = parse_str("bad.mdl.txt", src, &mut handler).unwrap_err();
        assert_eq!(err, "unknown block `h`");
        assert!(handler.error_string().contains("bad.mdl.txt:3:13"));

        let mut handler = DiagnosticHandler::default().quiet();
        let src = "model m\nblock Gain g { }\nblock Gain g { }\n";
        assert!(parse_str("dup.mdl.txt", src, &mut handler).is_err());

        let mut handler = DiagnosticHandler::default().quiet();
        let err = parse_str("lex.mdl.txt", "model m\nblock { }\n", &mut handler).unwrap_err();
        assert!(err.starts_with("Lexing failed"));
        assert_eq!(handler.error_count(), 1);
    }
}
