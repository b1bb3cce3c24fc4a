//! Bundle Pipeline CLI
//!
//! Commands:
//!   bundle-pipeline bundle <source-file>
//!   bundle-pipeline build <project-dir> [--container] [--allow-scripts]
//!   bundle-pipeline publish <source-file> --owner <uid> --title <title>
//!   bundle-pipeline status <build-id>
//!   bundle-pipeline promote <listing-id> <archived-build-id> --owner <uid>
//!   bundle-pipeline headers <build-id>
//!
//! `publish` enqueues when the worker is enabled, otherwise runs the build
//! synchronously and reports its terminal state.

use anyhow::{anyhow, Result};
use bundle_pipeline::bundler::{bundle, BundleOptions};
use bundle_pipeline::executor::ExecMode;
use bundle_pipeline::listing::ListingStore;
use bundle_pipeline::orchestrator::{BuildPayload, BuildRequest};
use bundle_pipeline::resolver::{ImportPolicy, ImportResolver};
use bundle_pipeline::{derive_headers, Orchestrator, PipelineConfig, PipelineError, PublishRequest};

fn print_usage() {
    eprintln!("Bundle Pipeline - untrusted app source to policy-constrained bundles");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  bundle-pipeline bundle <source-file>");
    eprintln!("  bundle-pipeline build <project-dir> [--container] [--allow-scripts]");
    eprintln!("  bundle-pipeline publish <source-file> --owner <uid> --title <title>");
    eprintln!("  bundle-pipeline status <build-id>");
    eprintln!("  bundle-pipeline promote <listing-id> <archived-build-id> --owner <uid>");
    eprintln!("  bundle-pipeline headers <build-id>");
}

async fn run_bundle(config: &PipelineConfig, source_file: &str) -> Result<()> {
    let source = std::fs::read_to_string(source_file)?;
    let resolver = ImportResolver::new(
        config.cdn_base_trimmed(),
        &config.cache_dir,
        config.fetch_retries,
    );
    let policy = ImportPolicy {
        allow_any: config.allow_any,
        allow_list: config.allow_list.iter().cloned().collect(),
        pin_map: config.pin_map.clone(),
    };
    let out = bundle(&source, &BundleOptions::default(), &resolver, &policy).await?;
    println!("{out}");
    Ok(())
}

async fn run_build(config: PipelineConfig, project_dir: &str, args: &[String]) -> Result<()> {
    let mode = if args.iter().any(|a| a == "--container") {
        ExecMode::Container
    } else {
        ExecMode::Native
    };
    let allow_scripts = args.iter().any(|a| a == "--allow-scripts");
    let orchestrator = Orchestrator::new(config);
    let build_id = uuid::Uuid::new_v4().to_string();
    let job = orchestrator
        .run_now(BuildRequest {
            build_id: build_id.clone(),
            payload: BuildPayload::Project {
                dir: project_dir.into(),
                mode,
                allow_scripts,
            },
        })
        .await?;
    println!("build {build_id}: {}", job.state);
    if let Some(error) = job.error {
        eprintln!("{error}");
    }
    Ok(())
}

async fn run_publish(config: PipelineConfig, source_file: &str, args: &[String]) -> Result<()> {
    let owner = flag_value(args, "--owner").ok_or_else(|| anyhow!("--owner is required"))?;
    let title = flag_value(args, "--title").ok_or_else(|| anyhow!("--title is required"))?;
    let inline_code = std::fs::read_to_string(source_file)?;

    let listings = ListingStore::new(
        config.bundle_root.join("listings.json"),
        config.archive_ttl,
    );
    let orchestrator = Orchestrator::new(config);
    orchestrator.start_worker();

    let request = PublishRequest {
        listing: flag_value(args, "--listing"),
        title,
        description: flag_value(args, "--description").unwrap_or_default(),
        capabilities: Default::default(),
        inline_code,
        visibility: None,
    };

    let (build_request, outcome) =
        bundle_pipeline::publish::accept(&orchestrator, &listings, &owner, false, request)?;
    match orchestrator.enqueue(build_request.clone()).await {
        Ok(_) => {
            println!(
                "accepted build={} listing={} slug={}",
                outcome.build_id, outcome.listing_id, outcome.slug
            );
            // Follow the job to a worker-terminal state before exiting.
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                let status = orchestrator.status(&outcome.build_id)?;
                println!("state={} progress={}", status.state, status.progress);
                if status.state.is_terminal()
                    || status.state == bundle_pipeline::JobState::PendingReview
                {
                    break;
                }
            }
        }
        Err(PipelineError::QueueDisabled) => {
            // No queue backend configured: run on this task instead.
            let job = orchestrator.run_now(build_request).await?;
            println!(
                "built synchronously build={} listing={} slug={} state={}",
                outcome.build_id, outcome.listing_id, outcome.slug, job.state
            );
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

fn run_status(config: PipelineConfig, build_id: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(config);
    let status = orchestrator.status(build_id)?;
    println!("state={} progress={}", status.state, status.progress);
    if let Some(error) = status.error {
        println!("error={error}");
    }
    if let Some(artifacts) = status.artifacts {
        for file in &artifacts.files {
            println!("present {file}");
        }
        for file in &artifacts.missing {
            println!("missing {file}");
        }
    }
    Ok(())
}

async fn run_promote(config: PipelineConfig, listing_id: &str, build_id: &str, args: &[String]) -> Result<()> {
    let owner = flag_value(args, "--owner").ok_or_else(|| anyhow!("--owner is required"))?;
    let listings = ListingStore::new(
        config.bundle_root.join("listings.json"),
        config.archive_ttl,
    );
    let artifacts = bundle_pipeline::ArtifactStore::new(&config.bundle_root);
    let listing = bundle_pipeline::listing::promote_with_preview(
        &listings,
        &artifacts,
        &config,
        listing_id,
        build_id,
        &owner,
        bundle_pipeline::listing::now_ms(),
    )
    .await?;
    println!(
        "promoted listing={} build={} version={}",
        listing.id,
        listing.build_id.as_deref().unwrap_or("-"),
        listing.version
    );
    Ok(())
}

fn run_headers(config: &PipelineConfig, build_id: &str) -> Result<()> {
    let store = bundle_pipeline::ArtifactStore::new(&config.bundle_root);
    let headers = derive_headers(&store, config, build_id);
    println!("Content-Security-Policy: {}", headers.csp);
    println!("Permissions-Policy: {}", headers.permissions_policy);
    println!("Referrer-Policy: {}", headers.referrer_policy);
    Ok(())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return Err(anyhow!("missing command"));
    };
    let config = PipelineConfig::from_env();

    match command.as_str() {
        "bundle" => {
            let file = args.get(1).ok_or_else(|| anyhow!("missing source file"))?;
            run_bundle(&config, file).await
        }
        "build" => {
            let dir = args.get(1).ok_or_else(|| anyhow!("missing project dir"))?;
            run_build(config, dir, &args[2..]).await
        }
        "publish" => {
            let file = args.get(1).ok_or_else(|| anyhow!("missing source file"))?;
            run_publish(config, file, &args[2..]).await
        }
        "status" => {
            let id = args.get(1).ok_or_else(|| anyhow!("missing build id"))?;
            run_status(config, id)
        }
        "promote" => {
            let listing_id = args.get(1).ok_or_else(|| anyhow!("missing listing id"))?;
            let build_id = args.get(2).ok_or_else(|| anyhow!("missing archived build id"))?;
            run_promote(config.clone(), listing_id, build_id, &args[3..]).await
        }
        "headers" => {
            let id = args.get(1).ok_or_else(|| anyhow!("missing build id"))?;
            run_headers(&config, id)
        }
        _ => {
            print_usage();
            Err(anyhow!("unknown command '{command}'"))
        }
    }
}
