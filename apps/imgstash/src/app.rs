//! Upload command: wires the local server and the uploader together.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use imgstash_session::{Caller, ContentPublisher, FsContentStore, GuestPolicy, UploadService};
use imgstash_transfer::{ChunkStore, DiskChunkStore, MemoryChunkStore};
use imgstash_uploader::{UploadError, UploadEvent, UploadOutcome, Uploader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::LocalSink;
use crate::config::{Config, StagingMode, expand_path};

/// Arguments of `imgstash upload`.
#[derive(Debug, Clone, clap::Args)]
pub struct UploadArgs {
    /// Images to upload
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Publish under this name instead of the file's own (single file only)
    #[arg(long)]
    pub name: Option<String>,

    /// MIME type; detected from the extension when omitted
    #[arg(long)]
    pub mime: Option<String>,

    /// Chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Chunks in flight per upload
    #[arg(long)]
    pub concurrency: Option<usize>,
}

/// Builds the in-process upload server described by `config`.
pub fn build_service(config: &Config) -> anyhow::Result<UploadService> {
    let server = &config.server;

    let content_dir = expand_path(&server.content_dir);
    let content = FsContentStore::new(&content_dir)
        .with_context(|| format!("opening content dir {}", content_dir.display()))?;

    let chunks: Arc<dyn ChunkStore> = match server.staging {
        StagingMode::Memory => Arc::new(MemoryChunkStore::new()),
        StagingMode::Disk => {
            let dir = expand_path(&server.staging_dir);
            Arc::new(
                DiskChunkStore::new(&dir)
                    .with_context(|| format!("opening staging dir {}", dir.display()))?,
            )
        }
    };

    let publisher = ContentPublisher::new(Arc::new(content), &server.base_url);
    Ok(
        UploadService::new(config.session_config(), chunks, publisher).with_policy(Arc::new(
            GuestPolicy {
                allow_guests: server.allow_guests,
            },
        )),
    )
}

fn caller() -> Caller {
    match std::env::var("USER") {
        Ok(user) if !user.is_empty() => Caller::User(user),
        _ => Caller::Guest,
    }
}

/// Runs `imgstash upload`. Returns the outcomes of the successful uploads.
pub async fn upload(config: Config, args: UploadArgs) -> anyhow::Result<Vec<UploadOutcome>> {
    if args.name.is_some() && args.files.len() > 1 {
        anyhow::bail!("--name can only be used with a single file");
    }

    let mut uploader_config = config.uploader_config();
    if let Some(size) = args.chunk_size {
        uploader_config.chunk_size = size;
    }
    if let Some(n) = args.concurrency {
        uploader_config.transport.max_concurrent = n;
    }

    let service = Arc::new(build_service(&config)?);
    let sink = Arc::new(LocalSink::new(service, caller()));
    let mut uploader = Uploader::new(sink, uploader_config);

    let events = uploader.take_events();
    let logger = tokio::spawn(async move {
        if let Some(rx) = events {
            log_events(rx).await;
        }
    });

    let cancel = uploader.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling upload");
            cancel.cancel();
        }
    });

    let mut outcomes = Vec::with_capacity(args.files.len());
    let mut failed = 0usize;
    for file in &args.files {
        match uploader
            .upload_file(file, args.name.as_deref(), args.mime.as_deref())
            .await
        {
            Ok(outcome) => {
                print_links(&outcome);
                outcomes.push(outcome);
            }
            Err(UploadError::Cancelled) => {
                failed += 1;
                break;
            }
            Err(e) => {
                eprintln!("{}: {e}", file.display());
                failed += 1;
            }
        }
    }

    drop(uploader);
    let _ = logger.await;

    if failed > 0 {
        anyhow::bail!("{failed} of {} uploads did not complete", args.files.len());
    }
    Ok(outcomes)
}

fn print_links(outcome: &UploadOutcome) {
    println!("{}", outcome.links.url);
    println!("  markdown: {}", outcome.links.markdown);
    println!("  html:     {}", outcome.links.html);
    println!("  bbcode:   {}", outcome.links.bbcode);
}

async fn log_events(mut rx: mpsc::Receiver<UploadEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            UploadEvent::Started {
                file_name,
                total_bytes,
                total_chunks,
            } => info!(file = %file_name, bytes = total_bytes, chunks = total_chunks, "uploading"),
            UploadEvent::ChunkAcked { index, len } => debug!(index, len, "chunk sent"),
            UploadEvent::ChunkRetry {
                index,
                attempt,
                delay,
                error,
            } => debug!(index, attempt, delay_ms = delay.as_millis() as u64, error = %error, "chunk retry scheduled"),
            UploadEvent::Progress(p) => info!(
                percent = format_args!("{:.1}", p.percent()),
                throughput_bps = p.throughput_bps as u64,
                eta_secs = p.eta_seconds.map(|s| s.round() as u64),
                "progress"
            ),
            UploadEvent::Completed { .. } | UploadEvent::Failed { .. } => {}
        }
    }
}
