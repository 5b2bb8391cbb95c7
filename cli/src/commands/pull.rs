//! `vmpull pull` command.

use std::sync::Arc;

use clap::Args;
use vmpull_core::config::{PruneConfig, PullConfig, RetryConfig, DEFAULT_CONCURRENCY};
use vmpull_core::event::{events, PullEvent};
use vmpull_runtime::{CredentialChain, Registry, RemoteName, VmPuller};

use crate::output;

#[derive(Args)]
pub struct PullArgs {
    /// Remote VM name (e.g., "ghcr.io/org/vm:1.0", "localhost:5000/vm@sha256:...")
    pub remote_name: String,

    /// Connect to the registry over plain HTTP
    #[arg(long)]
    pub insecure: bool,

    /// Number of blobs to download in parallel
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Clone or hardlink blobs into the VM directory instead of copying
    #[arg(long, hide = true)]
    pub deduplicate: bool,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = PullConfig {
        concurrency: args.concurrency,
        deduplicate: args.deduplicate,
        retry: RetryConfig::default(),
        prune: PruneConfig::from_env(),
    };
    config.validate()?;

    let storage = super::storage();
    let retry = config.retry.clone();
    let puller = VmPuller::open(&storage, config)?;

    if puller.namespace().local_exists(&args.remote_name) {
        println!("\"{}\" is a local image, nothing to pull here!", args.remote_name);
        return Ok(());
    }

    let name = RemoteName::parse(&args.remote_name)?;
    let credentials = CredentialChain::standard(&storage).resolve(name.host())?;
    tracing::debug!(
        registry = %name.host(),
        anonymous = credentials.is_anonymous(),
        "Resolved registry credentials"
    );
    let registry = Arc::new(Registry::new(&name, credentials, args.insecure, retry)?);

    let progress = if args.quiet {
        None
    } else {
        println!("Pulling {}...", name);
        let mut stream = puller.emitter().subscribe_filtered(|e| describe(e).is_some());
        Some(tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if let Some(line) = describe(&event) {
                    println!("{line}");
                }
            }
        }))
    };

    let result = puller.pull(&name, registry).await;
    let path = puller.namespace().path_for(&name);

    // Closing the emitter lets the progress task drain and finish
    drop(puller);
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    let record = result?;
    if args.quiet {
        println!("{}", path.display());
    } else {
        println!(
            "Pulled: {} ({}, {})",
            name,
            output::short_digest(record.manifest_digest.as_str()),
            output::format_bytes(record.size_bytes)
        );
    }
    Ok(())
}

/// Progress line for an event, if it is worth showing.
fn describe(event: &PullEvent) -> Option<String> {
    let text = |field: &str| {
        event
            .field(field)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    let bytes = |field: &str| {
        output::format_bytes(event.field(field).and_then(|v| v.as_u64()).unwrap_or(0))
    };
    let digest = || output::short_digest(&text("digest"));

    match event.key.as_str() {
        events::PULL_MANIFEST_RESOLVED => Some(format!(
            "Manifest {}: {} layers, {}",
            digest(),
            event.field("layers").and_then(|v| v.as_u64()).unwrap_or(0),
            bytes("size_bytes")
        )),
        events::PULL_PRUNE_EVICTED => Some(format!(
            "Pruned {} ({})",
            digest(),
            bytes("size_bytes")
        )),
        events::PULL_BLOB_SKIPPED => Some(format!("{}: already present", digest())),
        events::PULL_BLOB_FETCHED => Some(format!(
            "{}: downloaded {} (total {})",
            digest(),
            bytes("size_bytes"),
            bytes("bytes_transferred")
        )),
        events::PULL_BLOB_RETRY => Some(format!("{}: verification failed, retrying", digest())),
        _ => None,
    }
}
