//! Presign Uploadr - upload a file through pre-signed URLs

use anyhow::{anyhow, Context};
use clap::Parser;
use presign_uploadr::config::Config;
use presign_uploadr::signer::PART_CONTENT_TYPE;
use presign_uploadr::upload::{FileSource, ObjectSource, UploadCoordinator, UploadEvent};
use presign_uploadr::{metrics, telemetry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Presign Uploadr - upload a file to S3 through a signing endpoint
#[derive(Parser, Debug)]
#[command(name = "presign-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// File to upload
    #[arg(short, long)]
    file: PathBuf,

    /// Remote object name (defaults to the file name)
    #[arg(short, long)]
    name: Option<String>,

    /// Content type (defaults to a guess from the file extension)
    #[arg(long)]
    content_type: Option<String>,

    /// Extra header sent with the object, as `Name:Value` (repeatable)
    #[arg(long = "header", value_name = "NAME:VALUE")]
    headers: Vec<String>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print Prometheus metrics to stdout when done
    #[arg(long)]
    print_metrics: bool,
}

fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("header '{}' must be NAME:VALUE", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("header '{}' has an empty name", raw));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {:?}", args.config))?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    telemetry::init_subscriber(&config.logging)?;

    info!("Starting Presign Uploadr v{}", presign_uploadr::VERSION);

    let object = FileSource::open(&args.file)
        .await
        .with_context(|| format!("opening {:?}", args.file))?;

    let content_type = args
        .content_type
        .or_else(|| object.content_type().map(str::to_string))
        .unwrap_or_else(|| PART_CONTENT_TYPE.to_string());

    let mut builder = UploadCoordinator::builder(Arc::new(object))
        .from_config(&config)?
        .content_type(content_type);
    if let Some(name) = args.name {
        builder = builder.name(name);
    }

    let mut upload = builder.build()?;
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        upload.set(name, value);
    }

    info!(
        upload.id = %upload.attempt_id(),
        name = %upload.job().name,
        bytes = upload.job().object_len(),
        multipart = upload.is_multipart(),
        "Uploading"
    );

    let mut events = upload.subscribe();
    let reporter = tokio::spawn(async move {
        let mut last_percent = -1i64;
        while let Some(event) = events.recv().await {
            match event {
                UploadEvent::Progress { loaded, total, percent } => {
                    let whole = percent.floor() as i64;
                    if whole != last_percent {
                        last_percent = whole;
                        info!(loaded = loaded, total = total, "Progress {}%", whole);
                    }
                }
                UploadEvent::Abort => warn!("Upload aborted"),
                UploadEvent::Error { message, status } => {
                    warn!(status = ?status, "Upload error: {}", message)
                }
                UploadEvent::End => info!("Upload finished"),
            }
        }
    });

    let outcome = {
        let end = upload.end();
        tokio::pin!(end);
        tokio::select! {
            result = &mut end => result,
            _ = tokio::signal::ctrl_c() => {
                upload.abort();
                end.await
            }
        }
    };
    drop(upload);
    let _ = reporter.await;

    if args.print_metrics {
        print!("{}", metrics::render());
    }

    let result = outcome?;
    info!(
        etag = ?result.etag,
        version_id = ?result.version_id,
        upload_id = ?result.upload_id,
        parts = result.parts_count,
        bytes = result.bytes_written,
        "Upload complete"
    );
    if let Some(etag) = &result.etag {
        println!("{}", etag);
    }

    Ok(())
}
