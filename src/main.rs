use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};

use plume::config::Config;
use plume::dispatcher::Dispatcher;
use plume::server::PlumeServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // MCP servers may start with any CWD: prefer a .env next to the binary,
    // then the cargo project root (target/<profile>/../..), then CWD.
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.to_path_buf()));
    let env_file = exe_dir.and_then(|dir| {
        [dir.join(".env"), dir.join("../../.env")]
            .into_iter()
            .find(|p| p.exists())
    });
    match env_file {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing::info!("plume starting");

    let config = Config::load();
    let dispatcher = Arc::new(Dispatcher::from_config(&config)?);
    tracing::info!(
        providers = config.providers.len(),
        policy = config.router.policy.as_str(),
        max_concurrent = config.queue.max_concurrent,
        "dispatcher ready"
    );

    let service = PlumeServer::new(dispatcher)
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    tracing::info!("plume shutting down");
    Ok(())
}
