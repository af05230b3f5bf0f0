use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use guide::config::AppConfig;
use guide::db::Database;
use guide::expansion::ConceptTable;
use guide::models::SelectionRequest;
use guide::random::SeededRandom;
use guide::QuotationSelector;

#[derive(Parser, Debug)]
#[command(name = "eval")]
#[command(about = "Run quotation selection over a prompt set and report tier hits")]
struct Cli {
    #[arg(long, default_value = "eval/prompts.jsonl")]
    file: String,
    #[arg(long, default_value_t = 7)]
    seed: u64,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct EvalPrompt {
    id: String,
    message: String,
    #[serde(default)]
    exclude_ids: Vec<String>,
    #[serde(default)]
    expect_id: Option<String>,
    #[serde(default)]
    expect_tier: Option<String>,
    #[serde(default)]
    expect_none: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let db = Database::new(&config).await?;
    let concepts = match &config.selection.concept_table_path {
        Some(path) => ConceptTable::load(path)?,
        None => ConceptTable::default(),
    };
    let selector = QuotationSelector::new(
        Arc::new(db),
        Arc::new(concepts),
        Arc::new(SeededRandom::new(cli.seed)),
        config.selection_limits(),
    );

    let prompts = load_prompts(&cli.file)?;
    if prompts.is_empty() {
        anyhow::bail!("no prompts found in {}", cli.file);
    }

    let mut total = 0usize;
    let mut passed = 0usize;
    let mut by_tier = [0usize; 3];
    let mut empty = 0usize;

    for prompt in prompts {
        total += 1;
        let request = SelectionRequest::new(prompt.message.clone())
            .excluding(prompt.exclude_ids.iter().cloned());
        let selection = selector
            .select_with_tier(&request, &CancellationToken::new())
            .await;

        let mut ok = true;
        match &selection {
            Some(found) => {
                by_tier[found.tier as usize] += 1;
                if prompt.expect_none.unwrap_or(false) {
                    ok = false;
                }
                if let Some(expected) = &prompt.expect_id {
                    ok &= &found.quotation.id == expected;
                }
                if let Some(expected) = &prompt.expect_tier {
                    ok &= found.tier.as_str() == expected.as_str();
                }
            }
            None => {
                empty += 1;
                ok = prompt.expect_none.unwrap_or(false);
            }
        }

        if ok {
            passed += 1;
        }
        if cli.verbose || !ok {
            println!(
                "[{}] {} -> {}",
                if ok { "pass" } else { "FAIL" },
                prompt.id,
                selection
                    .as_ref()
                    .map(|s| format!("{} ({})", s.quotation.id, s.tier.as_str()))
                    .unwrap_or_else(|| "none".to_string())
            );
        }
    }

    println!(
        "Eval complete. total={} passed={} direct={} concept={} fallback={} none={}",
        total, passed, by_tier[0], by_tier[1], by_tier[2], empty
    );

    Ok(())
}

fn load_prompts(path: &str) -> Result<Vec<EvalPrompt>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let prompt: EvalPrompt = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON on line {}", idx + 1))?;
        out.push(prompt);
    }

    Ok(out)
}
