use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vault_extensions::builtin_catalog;
use vault_kernel::{Kernel, KernelOptions};
use vault_server::logging::init_logging;
use vault_server::{run_server, spawn_ticker};

#[derive(Parser, Debug, Clone)]
#[command(name = "vault-server")]
#[command(about = "Vault kernel over JSON-RPC")]
#[command(version)]
struct Cli {
    /// Vault directory to serve
    #[arg(long, env = "VAULT_PATH")]
    vault: PathBuf,

    /// Bind address
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(long, env = "PORT", default_value = "8765")]
    port: u16,

    /// Enable debug mode
    #[arg(long, env = "DEBUG", default_value = "false")]
    debug: bool,

    /// Log level (overrides debug flag)
    #[arg(long)]
    log_level: Option<String>,
}

#[actix_web::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_level.as_deref());

    log::info!("Starting vault server for {}", cli.vault.display());

    let options = KernelOptions::new(&cli.vault).with_catalog(builtin_catalog());
    let kernel = match Kernel::init(options) {
        Ok(kernel) => kernel,
        Err(e) => {
            log::error!("Cannot open vault: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = kernel.initialize().await {
        log::error!("Kernel failed to initialize: {}", e);
        return ExitCode::FAILURE;
    }

    let ticker = spawn_ticker(kernel.clone());
    let served = run_server(kernel.clone(), &cli.host, cli.port).await;

    kernel.shutdown().await;
    if let Err(e) = ticker.await {
        log::warn!("Tick loop ended abnormally: {}", e);
    }

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
