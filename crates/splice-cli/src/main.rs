/// splice CLI: replay a module bundle through the patch engine

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use splice_patch::{PatchManifest, Strictness};
use splice_runtime::{Bundle, ExportSignature, LoadReport, Runtime, RuntimeOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "splice")]
#[command(about = "Patch a module bundle with plugin manifests and report what applied")]
#[command(version)]
struct Args {
    /// Module bundle (JSON)
    #[arg(value_name = "BUNDLE")]
    bundle: PathBuf,

    /// Patch manifest (JSON); may be given more than once
    #[arg(short, long = "patches", value_name = "FILE")]
    patches: Vec<PathBuf>,

    /// Directory to write patched module sources into
    #[arg(short, long, value_name = "DIR")]
    out: Option<PathBuf>,

    /// Resolve the first export carrying all of these properties
    #[arg(long, value_name = "PROPS", value_delimiter = ',')]
    find_props: Vec<String>,

    /// Keep running a required set after one of its rules fails
    #[arg(long = "continue")]
    keep_going: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let report = run(&args)?;
    print!("{}", report);

    if report.has_failures() {
        process::exit(1);
    }
    Ok(())
}

fn run(args: &Args) -> Result<LoadReport> {
    let strictness = if args.keep_going {
        Strictness::Continue
    } else {
        Strictness::AbortSet
    };
    let mut runtime = Runtime::init(RuntimeOptions::new().strictness(strictness));

    for path in &args.patches {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read patch manifest {}", path.display()))?;
        let manifest = PatchManifest::from_json(&text)
            .with_context(|| format!("Invalid patch manifest {}", path.display()))?;
        let ids = runtime.register_manifest(&manifest)?;
        tracing::info!(manifest = %path.display(), sets = ids.len(), "registered patches");
    }

    let wanted = (!args.find_props.is_empty())
        .then(|| runtime.lazy(ExportSignature::props(args.find_props.iter().cloned())));

    let text = fs::read_to_string(&args.bundle)
        .with_context(|| format!("Failed to read bundle {}", args.bundle.display()))?;
    let bundle = Bundle::from_json(&text)?;
    bundle.define_all(&mut runtime);

    let mut host = bundle.host();
    for error in runtime.load_all(&mut host) {
        tracing::warn!(%error, "module not loaded");
    }
    runtime.loading_finished();

    if let Some(dir) = &args.out {
        write_sources(dir, host.executed())?;
    }

    if let Some(placeholder) = wanted {
        match placeholder.value() {
            Ok(value) => {
                let module_id = placeholder.module_id().unwrap_or_default();
                match placeholder.export_path() {
                    Some(path) => println!("found {} in module {} at {}", placeholder.description(), module_id, path),
                    None => println!("found {} in module {}", placeholder.description(), module_id),
                }
                println!("{}", value.to_json());
            }
            Err(e) => println!("{}", e),
        }
    }

    Ok(runtime.teardown())
}

/// Write each executed module as `<id>.js`.
fn write_sources(dir: &Path, modules: &[(String, String)]) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    for (module_id, source) in modules {
        let path = dir.join(format!("{}.js", file_stem(module_id)));
        fs::write(&path, source).with_context(|| format!("Failed to write {}", path.display()))?;
    }
    tracing::info!(dir = %dir.display(), modules = modules.len(), "wrote patched sources");
    Ok(())
}

/// Percent-encode every byte of a module id outside `[A-Za-z0-9_-]`, so
/// distinct ids never share a file.
fn file_stem(module_id: &str) -> String {
    let mut stem = String::with_capacity(module_id.len());
    for byte in module_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}
