//! manyshot-eval - evaluate multimodal LLMs with many-shot in-context
//! learning while tracking subgroup bias in the sampled demonstrations

use clap::Parser;
use manyshot_eval::{
    ApiConfig, BatchOutcome, CancelSignal, Demographics, ExperimentConfig, HarnessError,
    ImageStore, LabelTable, OpenAiClient, Result, RetryPolicy, Runner,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run one many-shot ICL experiment configuration against a remote model
#[derive(Parser, Debug)]
#[command(name = "manyshot-eval")]
#[command(version)]
#[command(about = "Many-shot ICL evaluation with subgroup-stratified demonstrations")]
struct Args {
    /// Demo pool CSV: blank-named id column, one 0/1 column per class
    #[arg(long)]
    demo_csv: PathBuf,

    /// Test set CSV, same schema as the demo pool
    #[arg(long)]
    test_csv: PathBuf,

    /// Demographics CSV with 'updated_path' and 'binary_race' columns
    #[arg(long)]
    demographics_csv: PathBuf,

    /// Base directory holding the image subfolders
    #[arg(long)]
    images: PathBuf,

    /// Subfolder with demo images
    #[arg(long)]
    demo_subdir: String,

    /// Subfolder with test images
    #[arg(long)]
    test_subdir: String,

    /// Suffix appended to identifiers when resolving image files, e.g. ".png"
    #[arg(long, default_value = "")]
    file_suffix: String,

    /// Dataset name used in the experiment identity
    #[arg(long)]
    dataset_name: String,

    /// Model configuration: model=name,base_url=url[,api_key=key,timeout=N,detail=auto]
    #[arg(long)]
    model_args: String,

    /// Demonstration examples per class
    #[arg(long)]
    shots_per_class: usize,

    /// Target fraction of Black-subgroup demonstrations per class, in [0,1]
    #[arg(long)]
    split: f64,

    /// Test questions batched into one API call
    #[arg(long, default_value = "1")]
    batch_size: usize,

    /// Seed for the experiment-level test-set shuffle
    #[arg(long, default_value = "66")]
    seed: u64,

    /// Directory for the checkpoint file and results table
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Attempts per batch within one invocation
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Comma-separated class descriptions shown as answer choices; defaults
    /// to the class column names
    #[arg(long)]
    class_descriptions: Option<String>,
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let api_config = ApiConfig::from_model_args(&args.model_args)?;
    let model_name = api_config.model.clone();

    let demo_pool = LabelTable::from_csv(&args.demo_csv)?;
    let test_set = LabelTable::from_csv(&args.test_csv)?;
    let demographics = Demographics::from_csv(&args.demographics_csv)?;

    let class_desp: Vec<String> = match args.class_descriptions {
        Some(ref descriptions) => descriptions
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => demo_pool.classes.clone(),
    };

    let images = ImageStore {
        base_dir: args.images,
        demo_subdir: args.demo_subdir,
        test_subdir: args.test_subdir,
        file_suffix: args.file_suffix,
    };

    let config = ExperimentConfig {
        dataset_name: args.dataset_name,
        model_name,
        shots_per_class: args.shots_per_class,
        split: args.split,
        batch_size: args.batch_size,
        seed: args.seed,
        out_dir: args.out_dir,
        retry: RetryPolicy {
            max_attempts: args.max_attempts,
        },
    };

    let client = OpenAiClient::new(api_config)?;

    let (cancel_tx, cancel) = CancelSignal::listen();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; flushing at the next call boundary");
            let _ = cancel_tx.send(true);
        }
    });

    let report = Runner::new(client, config)
        .with_cancel(cancel)
        .run(&test_set, &demo_pool, &demographics, &class_desp, &images)
        .await?;

    let summary = serde_json::json!({
        "experiment": report.exp_name,
        "batches": report.outcomes.len(),
        "skipped": report.count(BatchOutcome::Skipped),
        "succeeded": report.count(BatchOutcome::Succeeded),
        "failed": report.count(BatchOutcome::Failed),
        "calls_made": report.calls_made,
        "token_usage": report.usage,
        "checkpoint": report.checkpoint_path,
        "results_table": report.results_table_path,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => {}
        Err(HarnessError::Cancelled) => {
            eprintln!("cancelled");
            std::process::exit(130);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
