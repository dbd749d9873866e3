//! nlink entrypoint: a thin CLI front end over the pipeline engine. Not
//! itself part of the core model — it only parses a manifest, builds a
//! `Pipeline`, and reports what it finds.
mod loader;

use clap::Parser;
use loader::DylibImageLoader;
use nlink_context::Context;
use nlink_pipeline::{component_image_path, ConfigSource, JsonConfigSource, Pipeline};
use nlink_result::NexusError;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

const EXIT_SUCCESS: u8 = 0;
const EXIT_INVALID_ARGS: u8 = 1;
const EXIT_CONFIG_NOT_FOUND: u8 = 2;
const EXIT_PARSE_FAILED: u8 = 3;
const EXIT_VALIDATION_FAILED: u8 = 4;
const EXIT_THREADING_INVALID: u8 = 5;
const EXIT_DISCOVERY_FAILED: u8 = 6;
const EXIT_INTERNAL: u8 = 7;
const EXIT_UNSPECIFIED: u8 = 99;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "nlink", version, about = "NexusLink pipeline driver")]
struct Args {
    /// Path to a pipeline manifest (JSON).
    manifest: Option<PathBuf>,

    /// Parse and validate the manifest, then exit.
    #[arg(long)]
    config_check: bool,

    /// List every declared component and the image path it resolves to.
    #[arg(long)]
    discover_components: bool,

    /// Build the execution plan and report whether its threading shape
    /// (SPS acyclic / MPS reentrance) is valid, without loading images.
    #[arg(long)]
    validate_threading: bool,

    /// Parse the manifest document only; skip semantic validation.
    #[arg(long)]
    parse_only: bool,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            use clap::error::ErrorKind;
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    print!("{e}");
                    return ExitCode::from(EXIT_SUCCESS);
                }
                _ => {
                    eprint!("{e}");
                    return ExitCode::from(EXIT_INVALID_ARGS);
                }
            }
        }
    };

    let _log_guard = configure_logging();
    info!(target: "cli", ?args, "startup");

    let actions_selected =
        [args.config_check, args.discover_components, args.validate_threading, args.parse_only]
            .iter()
            .filter(|a| **a)
            .count();
    if actions_selected != 1 {
        eprintln!("exactly one of --config-check, --discover-components, --validate-threading, --parse-only is required");
        return ExitCode::from(EXIT_INVALID_ARGS);
    }
    let Some(manifest_path) = args.manifest.as_deref() else {
        eprintln!("a manifest path is required");
        return ExitCode::from(EXIT_INVALID_ARGS);
    };

    let manifest_path = manifest_path.to_path_buf();
    let outcome = std::panic::catch_unwind(move || {
        if args.config_check {
            run_config_check(&manifest_path)
        } else if args.parse_only {
            run_parse_only(&manifest_path)
        } else if args.discover_components {
            run_discover_components(&manifest_path)
        } else {
            run_validate_threading(&manifest_path)
        }
    });
    let code = outcome.unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(target: "cli", message = message.as_str(), "unhandled panic");
        EXIT_UNSPECIFIED
    });
    ExitCode::from(code)
}

fn configure_logging() -> Option<WorkerGuard> {
    let log_dir = Path::new(".");
    let file_appender = tracing_appender::rolling::never(log_dir, "nlink.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    match tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(writer)
        .try_init()
    {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}

fn read_manifest_document(path: &Path) -> std::result::Result<String, u8> {
    if !path.exists() {
        error!(target: "cli", path = %path.display(), "manifest_not_found");
        return Err(EXIT_CONFIG_NOT_FOUND);
    }
    use anyhow::Context as _;
    std::fs::read_to_string(path)
        .context("reading manifest file")
        .map_err(|e| {
            error!(target: "cli", path = %path.display(), error = %e, "manifest_unreadable");
            EXIT_INTERNAL
        })
}

fn run_parse_only(path: &Path) -> u8 {
    let document = match read_manifest_document(path) {
        Ok(d) => d,
        Err(code) => return code,
    };
    match JsonConfigSource::from_str(document).load() {
        Ok(manifest) => {
            println!(
                "parsed pipeline {:?}: {} components, multi-pass={}",
                manifest.pipeline_id,
                manifest.components.len(),
                manifest.is_multi_pass()
            );
            EXIT_SUCCESS
        }
        Err(e) => {
            error!(target: "cli", error = %e, "manifest_parse_failed");
            EXIT_PARSE_FAILED
        }
    }
}

fn run_config_check(path: &Path) -> u8 {
    let document = match read_manifest_document(path) {
        Ok(d) => d,
        Err(code) => return code,
    };
    let manifest = match JsonConfigSource::from_str(document).load() {
        Ok(m) => m,
        Err(_) => return EXIT_PARSE_FAILED,
    };
    match manifest.validate() {
        Ok(()) => {
            println!("{:?} is valid: {} components", manifest.pipeline_id, manifest.components.len());
            EXIT_SUCCESS
        }
        Err(e) => {
            error!(target: "cli", error = %e, "manifest_validation_failed");
            EXIT_VALIDATION_FAILED
        }
    }
}

fn run_discover_components(path: &Path) -> u8 {
    let document = match read_manifest_document(path) {
        Ok(d) => d,
        Err(code) => return code,
    };
    let manifest = match JsonConfigSource::from_str(document).load() {
        Ok(m) => m,
        Err(_) => return EXIT_PARSE_FAILED,
    };
    if manifest.components.is_empty() {
        error!(target: "cli", "no components declared");
        return EXIT_DISCOVERY_FAILED;
    }
    for component in &manifest.components {
        println!(
            "{}\t{}\toptional={}",
            component.component_id,
            component_image_path(&component.component_id),
            component.optional
        );
    }
    EXIT_SUCCESS
}

/// Buckets a `Pipeline::create` failure into "structurally invalid
/// manifest" (4) vs. "threading/execution-graph shape invalid" (5): the
/// latter is everything that can only be discovered once the dependency
/// or reentrance graph is actually built.
fn threading_exit_code(error: &NexusError) -> u8 {
    match error {
        NexusError::DependencyCycle { .. }
        | NexusError::MissingRequiredDependency { .. }
        | NexusError::NonReentrantCycle(_) => EXIT_THREADING_INVALID,
        _ => EXIT_VALIDATION_FAILED,
    }
}

fn run_validate_threading(path: &Path) -> u8 {
    let document = match read_manifest_document(path) {
        Ok(d) => d,
        Err(code) => return code,
    };
    let manifest = match JsonConfigSource::from_str(document).load() {
        Ok(m) => m,
        Err(_) => return EXIT_PARSE_FAILED,
    };
    let multi_pass = manifest.is_multi_pass();
    let component_count = manifest.components.len();
    match Pipeline::create(manifest, DylibImageLoader::new(), Context::with_defaults()) {
        Ok(_pipeline) => {
            println!("threading plan valid: {component_count} components, multi-pass={multi_pass}");
            EXIT_SUCCESS
        }
        Err(e) => {
            error!(target: "cli", error = %e, "threading_invalid");
            threading_exit_code(&e)
        }
    }
}
