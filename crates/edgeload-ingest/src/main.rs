//! Edgeload - dataset loader

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgeload_common::logging::{init_logging, LogConfig, LogLevel};
use edgeload_ingest::transcode::RecordReader;
use edgeload_ingest::upload::RecordingSleeper;
use edgeload_ingest::{
    pipeline, HttpRemote, LoadRequest, LoaderConfig, MemoryRemote, Operation, Pipeline, RemoteService,
    UploadFormat, UploadMode,
};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "edgeload")]
#[command(author, version, about = "Load delimited files into a remote analytics dataset")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Digest a file and upload it to a dataset
    Upload {
        /// Input file
        file: PathBuf,

        /// Dataset alias
        #[arg(short, long)]
        alias: String,

        /// Folder (app) the dataset belongs to
        #[arg(long)]
        folder: Option<String>,

        /// Dataset label
        #[arg(long)]
        label: Option<String>,

        /// Artifact format
        #[arg(long, default_value = "binary")]
        format: UploadFormat,

        /// Input character set, overriding the schema
        #[arg(long)]
        charset: Option<String>,

        /// How the upload merges into the dataset
        #[arg(long, default_value = "overwrite")]
        operation: Operation,

        /// Submit parts as async batches instead of one call per part
        #[arg(long)]
        bulk: bool,

        /// Run against an in-memory remote; nothing leaves this machine
        #[arg(long)]
        dry_run: bool,
    },

    /// Derive or validate the schema of a file without uploading
    Schema {
        /// Input file
        file: PathBuf,

        /// Input character set
        #[arg(long)]
        charset: Option<String>,
    },

    /// Print the fields and first records of a binary artifact
    Inspect {
        /// Gzip-wrapped binary artifact
        artifact: PathBuf,

        /// Records to print
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("edgeload")
        .build()
        .with_env_overrides()?;

    let _guard = init_logging(&log_config)?;

    if let Err(e) = run(cli.command).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Upload {
            file,
            alias,
            folder,
            label,
            format,
            charset,
            operation,
            bulk,
            dry_run,
        } => {
            let config = LoaderConfig::from_env()?;
            config.validate(dry_run)?;

            let remote: Arc<dyn RemoteService> = if dry_run {
                info!("Dry run, using in-memory remote");
                Arc::new(MemoryRemote::new())
            } else {
                Arc::new(
                    HttpRemote::new(
                        &config.server_url,
                        &config.access_token,
                        &config.api_version,
                        config.request_timeout(),
                    )
                    .context("Failed to build HTTP client")?,
                )
            };

            let mut pipeline = Pipeline::new(remote, config);
            if dry_run {
                pipeline = pipeline.with_sleeper(Arc::new(RecordingSleeper::new()));
            }

            let request = LoadRequest {
                input: file,
                alias: Some(alias),
                folder,
                label,
                format,
                charset,
                operation,
                mode: if bulk { UploadMode::Batch } else { UploadMode::Direct },
            };
            let outcome = pipeline.run(&request).await?.ensure_success()?;
            println!(
                "Job {}: {} rows, {} loaded, {} rejected",
                outcome.job_id.as_deref().unwrap_or("-"),
                outcome.total_row_count,
                outcome.success_row_count,
                outcome.error_row_count
            );
            if let Some(path) = &outcome.error_file {
                println!("Rejected rows: {}", path.display());
            }
        },

        Command::Schema { file, charset } => {
            let (schema, _, path) = pipeline::prepare_schema(&file, None, charset.as_deref()).await?;
            println!("{} fields written to {}", schema.fields().len(), path.display());
        },

        Command::Inspect { artifact, limit } => {
            let file = File::open(&artifact).with_context(|| format!("Failed to open {}", artifact.display()))?;
            let mut reader = RecordReader::new(BufReader::new(GzDecoder::new(file)))
                .with_context(|| format!("{} is not a binary artifact", artifact.display()))?;

            let fields = reader.fields().to_vec();
            for field in &fields {
                println!(
                    "{}\t{}\tprecision={} scale={}{}",
                    field.name,
                    field.kind.as_str(),
                    field.precision,
                    field.scale,
                    if field.multi_value { " multi" } else { "" }
                );
            }
            println!();

            let mut shown = 0;
            while shown < limit {
                let Some(record) = reader.next_record()? else { break };
                let cells: Vec<String> = fields.iter().zip(&record).map(|(f, v)| f.render(v)).collect();
                println!("{}", cells.join("\t"));
                shown += 1;
            }
        },
    }
    Ok(())
}
