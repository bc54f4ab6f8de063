use analyst_core::{AnalystConfig, DataHandle};
use analyst_engine::Analyst;
use analyst_llm::HttpCompletionService;
use analyst_sandbox::SandboxExecutor;
use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("TOML configuration file");

    Command::new("analyst")
        .version(analyst_engine::VERSION)
        .about("Answer data-analysis questions with generated, sandboxed Python")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("run")
                .about("Plan, generate and execute an analysis; prints the JSON report")
                .arg(
                    Arg::new("question")
                        .long("question")
                        .short('q')
                        .required(true)
                        .help("Question text, or @path to read it from a file"),
                )
                .arg(
                    Arg::new("data")
                        .long("data")
                        .short('d')
                        .action(ArgAction::Append)
                        .value_parser(value_parser!(PathBuf))
                        .help("Data file (repeatable)"),
                )
                .arg(config_arg.clone()),
        )
        .subcommand(
            Command::new("check")
                .about("Scan a script against the sandbox policy without running it")
                .arg(
                    Arg::new("script")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Python script to scan"),
                )
                .arg(config_arg.clone()),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(config_arg),
        )
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("run", args)) => run(args).await,
        Some(("check", args)) => check(args),
        Some(("config", args)) => {
            let config = load_config(args)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        _ => Ok(ExitCode::FAILURE),
    }
}

async fn run(args: &ArgMatches) -> Result<ExitCode> {
    let config = load_config(args)?;
    let question = args
        .get_one::<String>("question")
        .context("--question is required")?;
    let question = read_question(question)?;
    let data: Vec<DataHandle> = args
        .get_many::<PathBuf>("data")
        .into_iter()
        .flatten()
        .map(DataHandle::from_path)
        .collect();

    let api_key = std::env::var("ANALYST_API_KEY").ok().filter(|k| !k.is_empty());
    if api_key.is_none() {
        tracing::warn!(
            "ANALYST_API_KEY is not set; the completion service will likely refuse requests"
        );
    }
    let service = HttpCompletionService::new(
        api_key,
        Duration::from_millis(config.completion.request_timeout_ms),
    )?;
    let executor = SandboxExecutor::new(config.sandbox.clone())?;
    executor
        .interpreter()
        .await
        .context("no usable Python interpreter")?;

    let analyst = Analyst::new(config, Arc::new(service), Arc::new(executor));
    let report = analyst.submit_analysis(&question, &data).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.overall_success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn check(args: &ArgMatches) -> Result<ExitCode> {
    let config = load_config(args)?;
    let path = args
        .get_one::<PathBuf>("script")
        .context("a script path is required")?;
    let code = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;

    let executor = SandboxExecutor::new(config.sandbox)?;
    let report = executor.check(&code);
    for violation in &report.violations {
        println!("violation: {violation}");
    }
    if let Some(issue) = &report.syntax_error {
        println!("syntax error at line {}: {}", issue.line, issue.message);
    }
    if report.is_clean() {
        println!("{}: ok", path.display());
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn load_config(args: &ArgMatches) -> Result<AnalystConfig> {
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => AnalystConfig::load(path)?,
        None => AnalystConfig::default(),
    };
    let config = config.with_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn read_question(raw: &str) -> Result<String> {
    match raw.strip_prefix('@') {
        Some(file) => {
            let text = std::fs::read_to_string(Path::new(file))
                .with_context(|| format!("cannot read question file {file}"))?;
            Ok(text.trim().to_string())
        }
        None => Ok(raw.to_string()),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
