use rmcp::{ServiceExt, transport::stdio};

use mirage::config::Config;
use mirage::server::MirageServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries MCP frames; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env from the binary's directory (MCP hosts may start us with any CWD),
    // then the cargo project root for development builds, then the CWD.
    let env_file = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .map(|dir| [dir.join(".env"), dir.join("../../.env")])
        .and_then(|candidates| candidates.into_iter().find(|p| p.exists()));
    match env_file {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing::info!("mirage starting");

    let config = Config::load();
    let server = MirageServer::new(config);

    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    tracing::info!("mirage shutting down");
    Ok(())
}
