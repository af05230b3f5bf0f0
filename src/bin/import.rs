use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use guide::config::AppConfig;
use guide::db::Database;
use guide::models::{Part, Quotation};
use guide::store::QuotationStore;

#[derive(Parser, Debug)]
#[command(name = "import")]
#[command(about = "Load Hidden Words passages from a JSON file into the quotation store")]
struct Cli {
    #[arg(long)]
    file: String,
    /// Delete every stored passage before loading.
    #[arg(long, default_value_t = false)]
    replace: bool,
}

#[derive(Debug, Deserialize)]
struct ImportRecord {
    #[serde(default)]
    id: Option<String>,
    text: String,
    addressee: String,
    part: Part,
    number: i64,
    #[serde(default)]
    section_title: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    let db = Database::new(&config).await?;

    let raw = tokio::fs::read_to_string(&cli.file)
        .await
        .with_context(|| format!("failed reading {}", cli.file))?;
    let records: Vec<ImportRecord> =
        serde_json::from_str(&raw).with_context(|| format!("failed parsing {}", cli.file))?;

    let mut quotations = Vec::with_capacity(records.len());
    for (idx, record) in records.into_iter().enumerate() {
        quotations.push(
            into_quotation(record).with_context(|| format!("invalid record at index {idx}"))?,
        );
    }

    if cli.replace {
        db.replace_quotations(&quotations).await?;
    } else {
        db.upsert_quotations(&quotations).await?;
    }

    println!(
        "Import complete. loaded={} stored={}",
        quotations.len(),
        db.count().await?
    );

    Ok(())
}

fn into_quotation(record: ImportRecord) -> Result<Quotation> {
    let text = record.text.trim().to_string();
    if text.is_empty() {
        anyhow::bail!("text must not be empty");
    }
    if record.number <= 0 {
        anyhow::bail!("number must be positive, got {}", record.number);
    }

    Ok(Quotation {
        id: record
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        text,
        addressee: record.addressee.trim().to_string(),
        part: record.part,
        number: record.number,
        section_title: record
            .section_title
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty()),
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
