// Copyright 2024 Cornell University
// released under MIT License

use anyhow::{anyhow, Context};
use clap::{ColorChoice, Parser};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use dlsynth::config::SynthConfig;
use dlsynth::diagnostic::DiagnosticHandler;
use dlsynth::kind::BlockKind;
use dlsynth::macros::ConstantFolding;
use dlsynth::parser::{parse_file, parse_number};
use dlsynth::serialize::serialize_model;
use dlsynth::synth::Synthesizer;

// From the top-level directory, run:
// $ cargo run -- tests/thermostat.mdl.txt --macros

/// Args for the synthesizer CLI
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, disable_version_flag = true)]
struct Cli {
    /// Path to a block diagram (.mdl.txt) file
    #[arg(value_name = "MODEL_FILE", required_unless_present = "list_blocks")]
    model: Option<String>,

    /// Make both sides of threshold comparisons non-strict so that
    /// the branches of a conditional overlap on the boundary
    #[arg(long)]
    overlapping_bounds: bool,

    /// Widen every threshold comparison by this margin
    #[arg(long, value_name = "EPSILON")]
    epsilon: Option<String>,

    /// Give up on macro resolution after this many passes
    #[arg(long, value_name = "PASSES", default_value_t = 64)]
    max_passes: usize,

    /// Also print the resolved macro of every output port
    #[arg(long)]
    macros: bool,

    /// Fold arithmetic on literals before resolution
    #[arg(long)]
    fold: bool,

    /// Print every supported block type and exit
    #[arg(long)]
    list_blocks: bool,

    /// Users can specify `-v` or `--verbose` to toggle logging
    #[command(flatten)]
    verbosity: Verbosity<WarnLevel>,

    /// To suppress colors in error messages, pass in `--color never`
    /// Otherwise, by default, error messages are displayed w/ ANSI colors
    #[arg(long, value_name = "COLOR_CHOICE", default_value = "auto")]
    color: ColorChoice,
}

fn list_blocks() {
    for kind in BlockKind::ALL {
        println!(
            "{:<4} {:<22} {:<20} {}",
            kind.icon(),
            kind.type_name(),
            kind.label(),
            kind.category().as_str()
        );
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // For concision, we disable timestamps in the log
    let mut logger = env_logger::Builder::new();
    logger
        .format_timestamp(None)
        .filter_level(cli.verbosity.log_level_filter());
    if cli.color == ColorChoice::Never {
        logger.write_style(env_logger::WriteStyle::Never);
    }
    logger.init();

    if cli.list_blocks {
        list_blocks();
        return Ok(());
    }
    let path = cli
        .model
        .as_deref()
        .context("no model file given")?;

    let epsilon = match &cli.epsilon {
        Some(text) => Some(parse_number(text).map_err(|e| anyhow!("invalid --epsilon: {e}"))?),
        None => None,
    };
    let config = SynthConfig {
        overlapping_bounds: cli.overlapping_bounds,
        epsilon,
        max_resolution_passes: cli.max_passes,
    };

    let mut handler = DiagnosticHandler::new(cli.color);
    let loaded = parse_file(path, &mut handler).map_err(|e| anyhow!("{path}: {e}"))?;

    let mut synthesizer = Synthesizer::new(config);
    if cli.fold {
        synthesizer = synthesizer.with_simplifier(Box::new(ConstantFolding));
    }
    let result = synthesizer.run(&loaded.diagram, &loaded.contracts, &mut handler);

    let mut out = std::io::stdout().lock();
    serialize_model(&mut out, &loaded.diagram, &result.model, cli.macros)
        .context("failed to write the model")?;

    if !result.sound {
        return Err(anyhow!(
            "the model of `{}` is unsound: {} error(s) were reported",
            loaded.diagram.name,
            handler.error_count()
        ));
    }
    Ok(())
}
