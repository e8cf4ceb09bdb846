use anyhow::Context;
use secrecy::SecretString;

use cipher_store::config::StoreConfig;
use cipher_store::dispatcher::Dispatcher;
use cipher_store::store::CloseOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = StoreConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export CIPHER_STORE_CONFIG_DIR=~/.config/app");
        eprintln!("  export CIPHER_STORE_KEY=<64 hex chars>");
        std::process::exit(1);
    });

    eprintln!("🔐 Cipher Store v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config dir: {}", config.config_dir.display());
    eprintln!("   Main store: {}", config.main_dir().display());
    eprintln!("   Accelerator: {}", config.accelerator_dir().display());

    let dispatcher = Dispatcher::new();
    dispatcher
        .initialize(config)
        .await
        .context("Failed to open the encrypted stores")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let outcome = match args.first().map(String::as_str) {
        None => Ok(()),
        Some("routes") => {
            if let Some(routes) = dispatcher.routes() {
                for method in routes.accelerator_methods() {
                    println!("{method}\taccelerator");
                }
            }
            Ok(())
        }
        Some("backup") => dispatcher.backup().await.map(|dir| {
            println!("{}", dir.display());
        }),
        Some("rekey") => match args.get(1) {
            Some(key) => dispatcher.rekey(&SecretString::from(key.clone())).await,
            None => {
                eprintln!("Usage: cipher-store rekey <hex key>");
                Ok(())
            }
        },
        Some(other) => {
            eprintln!("Unknown command: {other}");
            eprintln!("Commands: routes, backup, rekey <hex key>");
            Ok(())
        }
    };

    let closed = dispatcher
        .close(
            true,
            CloseOptions {
                optimize: true,
                vacuum: false,
            },
        )
        .await;

    outcome.context("Command failed")?;
    closed.context("Failed to close the stores")?;
    Ok(())
}
