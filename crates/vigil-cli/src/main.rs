//! `vigil`: validate and inspect policy documents from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vigil_core::{builtin_names, load_file, PolicyKind, Stage, StageEngine};

#[derive(Parser)]
#[command(name = "vigil", version, about = "Runtime policy evaluation for AI agent calls")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a policy document and report what it compiles to.
    Validate {
        /// Path to the YAML policy document.
        path: PathBuf,
    },

    /// List the rule functions policies may call.
    Rules,

    /// Evaluate a policy document against a sample call, stage by stage.
    Check {
        /// Path to the YAML policy document.
        path: PathBuf,

        /// Agent name to evaluate as.
        #[arg(long, default_value = "default")]
        agent: String,

        /// Path to a JSON file holding `{"request": ..., "output": ...}`.
        #[arg(long)]
        call: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { path } => validate(&path),
        Command::Rules => {
            for name in builtin_names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Check { path, agent, call } => check(&path, &agent, &call),
    }
}

fn validate(path: &PathBuf) -> anyhow::Result<()> {
    let registry = load_file(path)
        .with_context(|| format!("policy document {} is invalid", path.display()))?;

    println!(
        "OK: {} policies ({} agent scopes)",
        registry.policy_count(),
        registry.agent_names().len()
    );
    for stage in Stage::ALL {
        for policy in registry.global_policies(stage) {
            println!("  [global/{stage}] {}", describe(policy));
        }
    }
    // Agent sections list only what the agent declares itself; inherited
    // global entries are already shown above.
    for agent in registry.agent_names() {
        for stage in Stage::ALL {
            for policy in registry.agent_declared(agent, stage) {
                println!("  [{agent}/{stage}] {}", describe(policy));
            }
        }
    }
    Ok(())
}

fn describe(policy: &vigil_core::PolicyDefinition) -> String {
    let kind = match &policy.kind {
        PolicyKind::Guardrail { response, .. } => format!("guardrail/{response}"),
        PolicyKind::Criterion { tier, .. } => format!("criterion/{tier:?}").to_lowercase(),
    };
    let enabled = if policy.enabled { "" } else { " (disabled)" };
    format!("{} {kind}{enabled}", policy.name)
}

fn check(path: &PathBuf, agent: &str, call: &PathBuf) -> anyhow::Result<()> {
    let registry = load_file(path)
        .with_context(|| format!("policy document {} is invalid", path.display()))?;
    let engine = StageEngine::new(Arc::new(registry));

    let call_text = std::fs::read_to_string(call)
        .with_context(|| format!("cannot read call file {}", call.display()))?;
    let call: serde_json::Value =
        serde_json::from_str(&call_text).context("call file is not valid JSON")?;
    let request = call.get("request").cloned().unwrap_or_default();
    let output = call.get("output").cloned();

    let mut ctx = engine.begin(agent, request);
    let result = (|| {
        engine.pre_call(&mut ctx)?;
        match &output {
            Some(output) => engine.post_call(&mut ctx, output).map(Some),
            None => Ok(None),
        }
    })();

    match result {
        Ok(repaired) => {
            if let Some(repaired) = repaired {
                println!("output: {}", serde_json::to_string_pretty(&repaired)?);
            }
            println!("call allowed");
        }
        Err(block) => {
            println!("call blocked (status {})", block.http_status());
            println!("{}", serde_json::to_string_pretty(&block.to_response_body())?);
        }
    }
    for outcome in ctx.outcomes() {
        println!("  {}", serde_json::to_string(outcome)?);
    }
    Ok(())
}
