use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use credit_curation::export::rule_catalog_records;
use credit_curation::logging::init_logging;
use credit_curation::{
    Assembler, Exporter, Pipeline, PipelineConfig, RawRecord, RuleEngine, Salt, VERSION,
};

#[derive(Parser)]
#[command(name = "credit-curation")]
#[command(about = "Curate raw credit application records into audit and analysis datasets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full curation pipeline over one JSON batch
    Run {
        /// Raw records: a JSON array of objects
        #[arg(long)]
        input: PathBuf,

        /// Directory the CSV outputs are written to
        #[arg(long)]
        output_dir: PathBuf,

        /// TOML run configuration (defaults when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Debug logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the validation rule catalog
    Catalog,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            output_dir,
            config,
            verbose,
        } => {
            init_logging(verbose);
            run(&input, &output_dir, config.as_deref())
        }
        Commands::Catalog => {
            print_catalog();
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(p) => PipelineConfig::from_file(p)
            .with_context(|| format!("Failed to load config {}", p.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn load_records(path: &Path) -> Result<Vec<RawRecord>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read input {}", path.display()))?;
    let value: Value = serde_json::from_str(&content).context("Failed to parse input JSON")?;

    match value {
        Value::Array(items) => Ok(RawRecord::from_batch(items)),
        other => bail!(
            "Expected a top-level JSON array in {}, found {}",
            path.display(),
            credit_curation::values::kind_name(&other)
        ),
    }
}

fn run(input: &Path, output_dir: &Path, config_path: Option<&Path>) -> Result<()> {
    println!("🧾 Credit Curation v{}", VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = load_config(config_path)?;
    let salt = Salt::from_env(&config.salt_env_var)
        .with_context(|| format!("Set {} to run the pipeline", config.salt_env_var))?;

    let pipeline = Pipeline::new(config).context("Catalog check failed")?;

    println!("\n📂 Loading records...");
    let records = load_records(input)?;
    println!("✓ Loaded {} records", records.len());

    println!("\n🔍 Running pipeline...");
    let output = pipeline.run(&records, Some(salt)).context("Pipeline run failed")?;
    println!("✓ {}", output.resolution.summary());
    println!("✓ {}", output.pre_issues.summary());
    println!("✓ {}", output.post_issues.summary());

    println!("\n🧱 Assembling datasets...");
    let datasets = Assembler::for_pipeline(&pipeline)
        .assemble(&output)
        .context("Failed to assemble datasets")?;
    println!(
        "✓ audit: {} rows, analysis: {} rows, spending: {} rows",
        datasets.audit.len(),
        datasets.analysis.len(),
        datasets.spending.len()
    );
    println!("✓ PII inventory: {} fields", datasets.pii_inventory.len());

    println!("\n💾 Writing CSV files...");
    let written = Exporter::new(pipeline.engine(), pipeline.cleaner())
        .export(output_dir, &datasets, &output)
        .with_context(|| format!("Failed to write outputs to {}", output_dir.display()))?;
    for path in &written {
        println!("✓ {}", path.display());
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Run complete");
    info!(outputs = written.len(), "done");

    Ok(())
}

fn print_catalog() {
    let engine = RuleEngine::credit_applications();

    println!("📋 Rule catalog ({} rules)", engine.rule_count());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for rule in rule_catalog_records(&engine) {
        println!(
            "{:<16} {:<12} {:<7} {:<20} {}",
            rule.rule_id, rule.scope, rule.severity, rule.issue_group, rule.description
        );
    }
}
