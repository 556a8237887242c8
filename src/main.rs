// chat-ask: submit one prompt to the configured chat project and print the answer.
//
// Connection settings come from chat-automation.yaml, .env and the environment
// (CHATGPT_PROJECT_URL, EMAIL, PASSWORD). Logs go to stderr; the answer goes
// to stdout.

use anyhow::{Context, Result};
use chat_automation::{Answer, Config, ask_once};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chat-ask")]
#[command(about = "Ask the configured chat project a question through the browser")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./chat-automation.yaml when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Prompt text
    #[arg(long, conflicts_with = "prompt_file", required_unless_present = "prompt_file")]
    prompt: Option<String>,

    /// Read the prompt from a file; `{current_date}` is replaced with the current UTC time
    /// and `{{`/`}}` are literal braces
    #[arg(long, value_name = "FILE")]
    prompt_file: Option<PathBuf>,

    /// Attach a file to the prompt
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Ask for a single JSON object and print it parsed
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

const DATE_PLACEHOLDER: &str = "{current_date}";

/// Fill `{current_date}`; `{{` and `}}` stand for literal braces
///
/// Any other brace is copied through unchanged.
fn render_prompt(template: &str, now: DateTime<Utc>) -> String {
    let date = now.to_string();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        if rest.starts_with("{{") || rest.starts_with("}}") {
            out.push_str(&rest[..1]);
            rest = &rest[2..];
        } else if rest.starts_with(DATE_PLACEHOLDER) {
            out.push_str(&date);
            rest = &rest[DATE_PLACEHOLDER.len()..];
        } else {
            out.push_str(&rest[..1]);
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

fn load_prompt(cli: &Cli) -> Result<String> {
    match (&cli.prompt, &cli.prompt_file) {
        (Some(prompt), _) => Ok(prompt.clone()),
        (None, Some(path)) => {
            let template = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompt file {}", path.display()))?;
            Ok(render_prompt(&template, Utc::now()))
        }
        (None, None) => anyhow::bail!("Either --prompt or --prompt-file is required"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "info,chat_automation=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let prompt = load_prompt(&cli)?;
    tracing::debug!("Prompt: {}", prompt);

    match ask_once(&config, prompt, cli.file.clone(), cli.json).await? {
        Answer::Text(text) => println!("{text}"),
        Answer::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(())
}
