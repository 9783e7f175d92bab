use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use ias::manifest::Manifest;
use ias::run::{self, RunOutcome};
use ias::settings::Settings;
use ias::{logging, plan, signing};

const DEFAULT_CONFIG_NAME: &str = "ias.yaml";

#[derive(Parser, Debug)]
#[command(name = "iasd", version, about = "Workstation provisioning daemon")]
struct Cli {
    /// Configuration file (defaults to ias.yaml next to the executable)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Log intended actions without running installers or scripts
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the control manifest and run all phases (default)
    Run,

    /// Print the phase plan of a local manifest file and exit
    Plan { manifest: PathBuf },

    /// Generate an Ed25519 keypair for manifest signing
    Keygen {
        #[arg(long, default_value = ".keys")]
        out_dir: PathBuf,
    },

    /// Sign a manifest with an Ed25519 private key
    Sign {
        manifest: PathBuf,
        #[arg(long)]
        key: PathBuf,
        #[arg(long, default_value = "dev-local")]
        key_id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Verify a signed manifest
    Verify {
        manifest: PathBuf,
        #[arg(long)]
        key: Option<PathBuf>,
    },
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    match real_main() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            print_error_chain(&err);
            std::process::exit(1);
        }
    }
}

fn real_main() -> Result<i32> {
    let cli = Cli::parse();

    logging::init(cli.debug);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let config = cli.config.or_else(default_config_path);
            let mut settings = Settings::load(config.as_deref())?;
            if cli.dry_run {
                settings.dry_run = true;
            }
            run::ensure_privileges(&settings)?;
            let outcome = run::run(settings)?;
            match outcome {
                RunOutcome::Completed => info!("deployment complete"),
                RunOutcome::AlreadyProvisioned => info!("already provisioned; nothing to do"),
                RunOutcome::Aborted(phase) => info!(%phase, "deployment aborted"),
            }
            Ok(outcome.exit_code())
        }
        Command::Plan { manifest } => {
            let doc = Manifest::load_from_file(&manifest)
                .with_context(|| format!("failed to load manifest: {}", manifest.display()))?;
            print!("{}", plan::render_plan(&doc));
            Ok(0)
        }
        Command::Keygen { out_dir } => {
            let (private, public) = signing::keygen(&out_dir)?;
            println!("private key: {}", private.display());
            println!("public key: {}", public.display());
            Ok(0)
        }
        Command::Sign {
            manifest,
            key,
            key_id,
            out,
        } => {
            let written = signing::sign_file(&manifest, &key, &key_id, out.as_deref())?;
            println!("signed {}", written.display());
            Ok(0)
        }
        Command::Verify { manifest, key } => {
            signing::verify_file(&manifest, key.as_deref())?;
            println!("signature OK: {}", manifest.display());
            Ok(0)
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join(DEFAULT_CONFIG_NAME))
}
