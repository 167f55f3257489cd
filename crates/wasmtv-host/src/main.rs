//! Command-line host: loads every plugin from `PLUGIN_DIR`, reports the
//! files named on the command line to them, then unloads them.
//!
//! ```text
//! wasmtv-host <library> <file>...
//! ```

use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wasmtv_plugin::{HostContext, PluginRegistry};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(library) = args.next() else {
        eprintln!("usage: wasmtv-host <library> <file>...");
        std::process::exit(2);
    };
    let files: Vec<String> = args.collect();

    let services = match HostContext::from_env(tokio::runtime::Handle::current()) {
        Ok(services) => Arc::new(services),
        Err(e) => {
            tracing::error!("failed to set up host services: {e}");
            std::process::exit(1);
        }
    };

    let registry = match PluginRegistry::from_env(services) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!("failed to start plugin runtime: {e}");
            std::process::exit(1);
        }
    };

    let loaded = registry.load_all().await;
    tracing::info!(
        dir = %registry.plugin_dir().display(),
        "{} plugin(s) loaded",
        loaded.len()
    );

    for file in &files {
        for report in registry.file_found(&library, file).await {
            match serde_json::to_string(&report) {
                Ok(line) => println!("{file}\t{line}"),
                Err(e) => tracing::warn!(file = %file, "failed to encode report: {e}"),
            }
        }
    }

    for (plugin, result) in registry.unload_all().await {
        match result {
            Ok(ledger) => tracing::info!(
                plugin = %plugin,
                buffers = ledger.buffers,
                bytes = ledger.bytes,
                "plugin unloaded"
            ),
            Err(e) => tracing::warn!(plugin = %plugin, "plugin unload failed: {e}"),
        }
    }
}
