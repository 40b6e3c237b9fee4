//! Booster CLI - registry synchronization server and gzip utilities.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use booster::recompress;

/// Booster - synchronize container image registries by shipping deltas
#[derive(Parser)]
#[command(name = "booster")]
#[command(version)]
#[command(about = "Delta-transfer synchronization for container image registries")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, default_value = "5000")]
    port: u16,

    /// Registry base directory
    #[arg(long, default_value = "/var/lib/registry")]
    path: PathBuf,

    /// Primary URL; empty means this instance is the primary
    #[arg(long, default_value = "")]
    primary: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the sync HTTP API (default action)
    Serve(ServeArgs),

    /// Gzip standard input to standard output with the reference encoder
    Compress,

    /// Check whether standard input recompresses transparently; exits 0 if so
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Serve(args)) => run_serve(args).await,
        None => run_serve(cli.serve).await,
        Some(Commands::Compress) => run_compress(),
        Some(Commands::Check) => run_check(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(args: ServeArgs) -> booster::Result<()> {
    let primary = if args.primary.is_empty() {
        None
    } else {
        Some(args.primary.as_str())
    };
    booster::api::serve(args.path, args.port, primary).await
}

fn run_compress() -> booster::Result<()> {
    let stdout = io::stdout().lock();
    recompress::compress(&mut io::stdin().lock(), stdout)
}

fn run_check() -> booster::Result<()> {
    // The probe needs a seekable stream; buffer stdin first.
    let mut input = Vec::new();
    io::stdin().lock().read_to_end(&mut input)?;

    let mut cursor = io::Cursor::new(&input);
    if !recompress::is_gzip(&mut cursor)? {
        return Err(booster::BoosterError::Validation(
            "input is not a gzip archive".to_string(),
        ));
    }

    if recompress::recompressible(cursor)? {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "Archive is reconstructable!")?;
        Ok(())
    } else {
        Err(booster::BoosterError::Validation(
            "archive is NOT reconstructable".to_string(),
        ))
    }
}
