mod capabilities;
mod config;
mod engine;
mod sandbox;

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::engine::{ComputationRuntime, DataShape, Dataset, EvaluationRequest, Input};
use crate::sandbox::validator::{validate_source, Rejection};
use crate::sandbox::ExtractOptions;

const DEFAULT_CONFIG_PATH: &str = "config/gate.toml";

fn print_help() {
    println!(
        "\
zkstats-gate v{}

Validates and runs untrusted statistical computations in a restricted
sandbox.

USAGE:
    zkstats-gate [OPTIONS] <COMMAND>

COMMANDS:
    check <COMPUTATION>            Validate a computation file
    run <COMPUTATION> <DATA>       Run a computation on a JSON dataset
    dummy <COMPUTATION> <SHAPE>    Run a computation on random data of a
                                   JSON shape, e.g. {{\"x\": 7, \"y\": 7}}

OPTIONS:
    -c, --config <PATH>    Path to TOML configuration file
                           [default: config/gate.toml, optional]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, zkstats_gate=debug,warn)

EXAMPLES:
    zkstats-gate check mean.py
    zkstats-gate run mean.py data.json
    RUST_LOG=debug zkstats-gate dummy mean.py shape.json",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Check { computation: String },
    Run { computation: String, data: String },
    Dummy { computation: String, shape: String },
}

#[derive(Debug, PartialEq)]
enum Invocation {
    Help,
    Version,
    Execute { config: Option<String>, command: Command },
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Invocation> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => return Ok(Invocation::Version),
            "--help" | "-h" => return Ok(Invocation::Help),
            "--config" | "-c" => {
                config = Some(args.next().ok_or_else(|| anyhow!("--config needs a path"))?);
            }
            flag if flag.starts_with('-') => bail!("unknown option '{flag}'"),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let name = positional.next().ok_or_else(|| anyhow!("missing command, see --help"))?;
    let mut operand = |what: &str| {
        positional
            .next()
            .ok_or_else(|| anyhow!("'{name}' needs a {what} argument"))
    };
    let command = match name.as_str() {
        "check" => Command::Check {
            computation: operand("computation")?,
        },
        "run" => Command::Run {
            computation: operand("computation")?,
            data: operand("dataset")?,
        },
        "dummy" => Command::Dummy {
            computation: operand("computation")?,
            shape: operand("shape")?,
        },
        other => bail!("unknown command '{other}', see --help"),
    };
    if let Some(extra) = positional.next() {
        bail!("unexpected argument '{extra}'");
    }
    Ok(Invocation::Execute { config, command })
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config_path, command) = match parse_args(std::env::args().skip(1))? {
        Invocation::Version => {
            println!("zkstats-gate v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Invocation::Help => {
            print_help();
            return Ok(());
        }
        Invocation::Execute { config, command } => (config, command),
    };

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("zkstats_gate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // An explicit path must exist; the default one is optional.
    let config = match &config_path {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path).with_context(|| format!("cannot load configuration {path}"))?
        }
        None => Config::load_or_default(DEFAULT_CONFIG_PATH)?,
    };

    match command {
        Command::Check { computation } => check(&config, &computation),
        Command::Run { computation, data } => {
            let dataset = Dataset::load(Path::new(&data))?;
            evaluate(&config, &computation, Input::Data(dataset)).await
        }
        Command::Dummy { computation, shape } => {
            let shape = DataShape::load(Path::new(&shape))?;
            evaluate(&config, &computation, Input::Shape(shape)).await
        }
    }
}

fn read_computation(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("cannot read computation {path}"))
}

/// Validation only; nothing is persisted or executed.
fn check(config: &Config, path: &str) -> Result<()> {
    let text = read_computation(path)?;
    let options = ExtractOptions::from_config(config);
    if let Some(limit) = options.max_source_bytes {
        if text.len() > limit {
            println!("rejected: source is {} bytes, the limit is {limit}", text.len());
            std::process::exit(1);
        }
    }
    match validate_source(&text, &options.policy) {
        Ok(_) => {
            println!("accepted");
            Ok(())
        }
        Err(Rejection::Policy(violation)) => {
            println!("rejected: {} ({})", violation.reason, violation.node);
            std::process::exit(1);
        }
        Err(Rejection::Syntax(err)) => {
            println!("rejected: syntax error: {err}");
            std::process::exit(1);
        }
    }
}

async fn evaluate(config: &Config, path: &str, input: Input) -> Result<()> {
    let computation = read_computation(path)?;
    let runtime = ComputationRuntime::new(config);
    match runtime.evaluate(EvaluationRequest { computation, input }).await {
        Ok(evaluation) => {
            println!("{}", serde_json::to_string_pretty(&evaluation)?);
            Ok(())
        }
        Err(e) => {
            warn!("Evaluation failed ({:?} fault)", e.fault());
            Err(anyhow!(e))
        }
    }
}
