// Copyright 2024 Cornell University
// released under MIT License

use super::TransformCtx;
use crate::errors::{SynthError, SynthResult};
use crate::hp::{HybridProgram, SampleTime};
use crate::ir::BlockId;
use crate::macros::MacroBody;
use crate::parser::ParamValue;
use crate::term::{Formula, Term};

/// Sample time of a block with discrete state. Continuous rates fall back to
/// the inherited step.
fn discrete_rate(ctx: &TransformCtx<'_, '_>, block: BlockId) -> SynthResult<SampleTime> {
    Ok(match ctx.sample_time(block)? {
        SampleTime::Continuous => SampleTime::Inherited,
        st => st,
    })
}

/// A chain of `depth` taps. The newest tap takes the input, every other tap
/// the previous value of its neighbour, and the output reads the oldest tap.
fn delay_line(ctx: &mut TransformCtx<'_, '_>, block: BlockId, depth: usize) -> SynthResult<()> {
    let sample_time = discrete_rate(ctx, block)?;
    let initial = match ctx.param_value(block, "InitialCondition", Some("0"))? {
        ParamValue::Scalar(t) => vec![t; depth],
        ParamValue::Vector(ts) if ts.len() == depth => ts,
        ParamValue::Vector(ts) if ts.len() == 1 => vec![ts[0].clone(); depth],
        ParamValue::Vector(ts) => {
            return Err(SynthError::bad_parameter(
                block,
                "InitialCondition",
                ctx.param(block, "InitialCondition").unwrap_or_default(),
                format!("{} initial values for a delay of length {depth}", ts.len()),
            ))
        }
    };
    let u = ctx.input(block, 0);

    let taps: Vec<String> = (1..=depth)
        .map(|k| {
            let suffix = if depth == 1 {
                "state".to_string()
            } else {
                format!("s{k}")
            };
            ctx.fresh_variable(block, &suffix)
        })
        .collect();
    for (tap, ic) in taps.iter().zip(initial) {
        ctx.add_init(Term::sym(tap.clone()).eq(ic));
    }

    // oldest tap first so that every tap still reads last step's neighbour
    let mut shift: Vec<HybridProgram> = (1..depth)
        .rev()
        .map(|k| HybridProgram::assign(taps[k].clone(), Term::sym(taps[k - 1].clone())))
        .collect();
    shift.push(HybridProgram::assign(taps[0].clone(), u));
    ctx.commit(sample_time, shift);

    let oldest = Term::sym(taps[depth - 1].clone());
    ctx.define(block, 0, MacroBody::Simple(oldest))
}

pub fn unit_delay(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    delay_line(ctx, block, 1)
}

pub fn delay(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    if ctx.param(block, "DelayLengthSource") == Some("Input port") {
        return ctx.degrade(block, "delay length from an input port");
    }
    let n = ctx.param_number(block, "DelayLength", "2")?;
    if !n.is_integer() || n.value() < 1.0 {
        return Err(SynthError::bad_parameter(
            block,
            "DelayLength",
            &n.to_string(),
            "expected a positive integer",
        ));
    }
    delay_line(ctx, block, n.value() as usize)
}

/// Forward Euler: `x := x + K*dt*c; c := u`, where `c` caches the input of
/// the previous step.
pub fn discrete_integrator(ctx: &mut TransformCtx<'_, '_>, block: BlockId) -> SynthResult<()> {
    let method = ctx
        .param(block, "IntegratorMethod")
        .unwrap_or("Integration: Forward Euler");
    if !method.ends_with("Forward Euler") {
        return ctx.degrade(block, format!("integration method `{method}`"));
    }
    if ctx.param(block, "LimitOutput") == Some("on") {
        return ctx.degrade(block, "limited output of a discrete integrator");
    }
    let gain = ctx.param_term(block, "gainval", Some("1"))?;
    let ic = ctx.param_term(block, "InitialCondition", Some("0"))?;
    let sample_time = discrete_rate(ctx, block)?;
    let dt = match sample_time {
        SampleTime::Discrete(period) => Term::Num(period),
        _ => {
            let dt = Term::sym(ctx.fresh_constant(block, "dt"));
            ctx.add_init(dt.clone().gt(Term::zero()));
            dt
        }
    };
    let u = ctx.input(block, 0);

    let state = ctx.fresh_variable(block, "state");
    let cache = ctx.fresh_variable(block, "input");
    let x = Term::sym(state.clone());
    let c = Term::sym(cache.clone());
    ctx.add_init(Formula::and([x.clone().eq(ic), c.clone().eq(u.clone())]));

    ctx.commit(
        sample_time,
        [
            HybridProgram::assign(state, x.clone().plus(Term::Mul(vec![gain, dt, c]))),
            HybridProgram::assign(cache, u),
        ],
    );
    ctx.define(block, 0, MacroBody::Simple(x))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{run_blocks, try_run_blocks};
    use crate::config::SynthConfig;
    use crate::errors::SynthError;
    use crate::hp::{HybridProgram, SampleTime};
    use crate::macros::MacroBody;
    use crate::term::{Formula, Number, Term};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use rustc_hash::FxHashMap;

    #[test]
    fn unit_delay_of_a_constant() {
        let run = run_blocks(
            "model m\nblock Constant c { Value = \"5\"; }\nblock UnitDelay z { InitialCondition = \"3\"; }\nline c.1 -> z.1\n",
            &SynthConfig::default(),
        );
        let state = Term::sym("z_state");
        assert_eq!(run.model.variables.len(), 1);
        assert_eq!(run.model.variables[0].name, "z_state");
        assert_eq!(run.model.init, state.clone().eq(Term::num(3)));
        assert_eq!(run.model.discrete.len(), 1);
        assert_eq!(
            run.model.discrete[0].statements,
            vec![HybridProgram::assign("z_state", Term::num(5))]
        );
        assert_eq!(run.body("z", 0), MacroBody::Simple(state));
    }

    /// Runs the assignments of `step` on `env`; nondeterministic parts are skipped.
    fn execute(step: &[HybridProgram], env: &mut FxHashMap<String, f64>) {
        for stmt in step {
            match stmt {
                HybridProgram::Assign(x, t) => {
                    let v = t.eval(&|s| env.get(s).copied()).unwrap();
                    env.insert(x.clone(), v);
                }
                HybridProgram::Seq(parts) => execute(parts, env),
                _ => {}
            }
        }
    }

    #[test]
    fn taps_shift_one_step_at_a_time() {
        let run = run_blocks(
            "model m\nblock Inport u { }\nblock Delay d { DelayLength = \"3\"; InitialCondition = \"[7 8 9]\"; SampleTime = \"0.1\"; }\nline u.1 -> d.1\n",
            &SynthConfig::default(),
        );
        let taps = ["d_s1", "d_s2", "d_s3"];
        assert_eq!(run.body("d", 0), MacroBody::Simple(Term::sym("d_s3")));
        let Formula::And(init) = &run.model.init else {
            panic!("expected a conjunction");
        };
        for (tap, ic) in taps.iter().zip([7, 8, 9]) {
            assert!(init.contains(&Term::sym(*tap).eq(Term::num(ic))));
        }
        let step = run
            .model
            .discrete
            .iter()
            .find(|d| d.sample_time == SampleTime::Discrete(Number::new(0.1)))
            .unwrap();

        let mut env: FxHashMap<String, f64> = FxHashMap::default();
        for (tap, ic) in taps.iter().zip([7.0, 8.0, 9.0]) {
            env.insert(tap.to_string(), ic);
        }
        let mut rng = StdRng::seed_from_u64(21);
        let inputs: Vec<f64> = (0..20).map(|_| rng.gen_range(-100.0..100.0)).collect();
        for (n, u) in inputs.iter().enumerate() {
            env.insert("u".to_string(), *u);
            execute(&step.statements, &mut env);
            // after n + 1 steps, tap k holds the input of step n - k
            for (k, tap) in taps.iter().enumerate() {
                let expected = if n >= k { inputs[n - k] } else { [7.0, 8.0, 9.0][k - n - 1] };
                assert_eq!(env[*tap], expected, "{tap} after step {n}");
            }
        }
    }

    /// Feeds `inputs` to `u` and returns the values of `watched` after every step.
    fn simulate(
        run: &super::super::tests::Run,
        initial: &[(&str, f64)],
        inputs: &[f64],
        watched: &str,
    ) -> Vec<f64> {
        let step = &run.model.discrete[0];
        assert_eq!(step.sample_time, SampleTime::Inherited);
        let mut env: FxHashMap<String, f64> = initial
            .iter()
            .map(|(name, v)| (name.to_string(), *v))
            .collect();
        inputs
            .iter()
            .map(|u| {
                env.insert("u".to_string(), *u);
                execute(&step.statements, &mut env);
                env[watched]
            })
            .collect()
    }

    fn random_inputs(seed: u64, n: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(-100.0..100.0)).collect()
    }

    #[test]
    fn chained_unit_delays_delay_twice() {
        let run = run_blocks(
            "model m\nblock Inport u { }\nblock UnitDelay z1 { }\nblock UnitDelay z2 { }\nline u.1 -> z1.1\nline z1.1 -> z2.1\n",
            &SynthConfig::default(),
        );
        let inputs = random_inputs(4, 20);
        let z2 = simulate(&run, &[("z1_state", 0.0), ("z2_state", 0.0)], &inputs, "z2_state");
        for (n, v) in z2.iter().enumerate() {
            let expected = if n >= 1 { inputs[n - 1] } else { 0.0 };
            assert_eq!(*v, expected, "z2 after step {n}");
        }
        // no copies are needed for a chain
        assert_eq!(run.model.variables.len(), 3);
    }

    #[test]
    fn delay_feeding_a_unit_delay() {
        let run = run_blocks(
            "model m\nblock Inport u { }\nblock Delay d { DelayLength = \"2\"; }\nblock UnitDelay z { }\nline u.1 -> d.1\nline d.1 -> z.1\n",
            &SynthConfig::default(),
        );
        let inputs = random_inputs(8, 20);
        let z = simulate(
            &run,
            &[("d_s1", 0.0), ("d_s2", 0.0), ("z_state", 0.0)],
            &inputs,
            "z_state",
        );
        for (n, v) in z.iter().enumerate() {
            let expected = if n >= 2 { inputs[n - 2] } else { 0.0 };
            assert_eq!(*v, expected, "z after step {n}");
        }
    }

    #[test]
    fn unit_delay_reads_the_integrator_before_its_update() {
        let run = run_blocks(
            "model m\nblock Inport u { }\nblock DiscreteIntegrator i { }\nblock UnitDelay z { }\nline u.1 -> i.1\nline i.1 -> z.1\n",
            &SynthConfig::default(),
        );
        let statements = &run.model.discrete[0].statements;
        let position = |x: &str| {
            statements
                .iter()
                .position(|s| s.bound_variables().contains(&x.to_string()))
                .unwrap()
        };
        assert!(position("z_state") < position("i_state"));
        assert!(statements.contains(&HybridProgram::assign("z_state", Term::sym("i_state"))));
    }

    #[test]
    fn delays_in_a_ring_swap_their_values() {
        let run = run_blocks(
            "model m\nblock UnitDelay a { InitialCondition = \"1\"; }\nblock UnitDelay b { InitialCondition = \"2\"; }\nline a.1 -> b.1\nline b.1 -> a.1\n",
            &SynthConfig::default(),
        );
        let names: Vec<&str> = run.model.variables.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["a_state", "b_state", "a_state_pre", "b_state_pre"]);
        assert_eq!(
            run.model.discrete[0].statements,
            vec![
                HybridProgram::assign("a_state_pre", Term::sym("a_state")),
                HybridProgram::assign("b_state_pre", Term::sym("b_state")),
                HybridProgram::assign("a_state", Term::sym("b_state_pre")),
                HybridProgram::assign("b_state", Term::sym("a_state_pre")),
            ]
        );

        let mut env: FxHashMap<String, f64> = FxHashMap::default();
        env.insert("a_state".to_string(), 1.0);
        env.insert("b_state".to_string(), 2.0);
        for n in 0..5 {
            execute(&run.model.discrete[0].statements, &mut env);
            let (a, b) = if n % 2 == 0 { (2.0, 1.0) } else { (1.0, 2.0) };
            assert_eq!((env["a_state"], env["b_state"]), (a, b), "after step {n}");
        }
    }

    #[test]
    fn scalar_initial_condition_is_replicated() {
        let run = run_blocks(
            "model m\nblock Delay d { InitialCondition = \"x0\"; }\n",
            &SynthConfig::default(),
        );
        let x0 = Term::sym("x0");
        assert_eq!(
            run.model.init,
            Formula::and([
                Term::sym("d_s1").eq(x0.clone()),
                Term::sym("d_s2").eq(x0),
            ])
        );
        assert_eq!(
            run.model.discrete[0].statements,
            vec![
                HybridProgram::assign("d_s2", Term::sym("d_s1")),
                HybridProgram::assign("d_s1", Term::zero()),
            ]
        );
    }

    #[test]
    fn forward_euler_uses_the_cached_input() {
        let run = run_blocks(
            "model m\nblock Inport u { }\nblock DiscreteIntegrator i { gainval = \"2\"; InitialCondition = \"1\"; SampleTime = \"0.5\"; }\nline u.1 -> i.1\n",
            &SynthConfig::default(),
        );
        let (x, c) = (Term::sym("i_state"), Term::sym("i_input"));
        let step = &run.model.discrete[1];
        assert_eq!(
            step.statements,
            vec![
                HybridProgram::assign(
                    "i_state",
                    x.clone().plus(Term::Mul(vec![Term::num(2), Term::num(0.5), c.clone()]))
                ),
                HybridProgram::assign("i_input", Term::sym("u")),
            ]
        );
        let Formula::And(init) = &run.model.init else {
            panic!("expected a conjunction");
        };
        assert!(init.contains(&x.eq(Term::one())));
        assert!(init.contains(&c.eq(Term::sym("u"))));
    }

    #[test]
    fn inherited_integrator_gets_a_step_constant() {
        let run = run_blocks(
            "model m\nblock Constant k { Value = \"1\"; }\nblock DiscreteIntegrator i { }\nline k.1 -> i.1\n",
            &SynthConfig::default(),
        );
        assert_eq!(run.model.constants[0].name, "i_dt");
        assert!(matches!(
            &run.model.init,
            Formula::And(parts) if parts[0] == Term::sym("i_dt").gt(Term::zero())
        ));
    }

    #[test]
    fn bad_delay_lengths() {
        for (length, ok) in [("0", false), ("1.5", false), ("x", false), ("4", true)] {
            let src = format!("model m\nblock Delay d {{ DelayLength = \"{length}\"; }}\n");
            match try_run_blocks(&src, &SynthConfig::default()) {
                Ok(run) => {
                    assert!(ok, "DelayLength = {length} was accepted");
                    assert_eq!(run.model.variables.len(), 4);
                }
                Err(err) => {
                    assert!(!ok, "DelayLength = {length}: {err}");
                    assert!(matches!(err, SynthError::BadParameter { .. }));
                }
            }
        }
    }
}
