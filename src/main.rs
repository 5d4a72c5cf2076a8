//! Process entry point: wires up the LLM registry, the tool registry, the
//! Server Coordinator, and the HTTP/SSE surface, then serves until killed.

use anyhow::{Context, Result};
use chorus_agent::ManagerConfig;
use chorus_core::config::{BrowserConfig, EvictionConfig, GatewayConfig};
use chorus_gateway::{router, AppState, Coordinator, ResolvedAuth};
use chorus_llm::{AnthropicProvider, LlmRegistry};
use chorus_tools::create_default_registry;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Multi-conversation agent server.
#[derive(Parser, Debug)]
#[command(name = "chorus-gateway", version)]
struct Cli {
    /// Directory tools operate against. Defaults to the current directory.
    #[arg(long)]
    workspace: Option<String>,

    /// System prompt prepended to every conversation's turn loop.
    #[arg(long)]
    system_prompt: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "chorus=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let workspace_root = cli
        .workspace
        .map(std::path::PathBuf::from)
        .unwrap_or(std::env::current_dir().context("resolving current directory")?);

    let mut llm_registry = LlmRegistry::new();
    match std::env::var("ANTHROPIC_API_KEY") {
        Ok(key) if !key.is_empty() => {
            llm_registry.register(Arc::new(AnthropicProvider::new(key)));
        }
        _ => {
            tracing::warn!("ANTHROPIC_API_KEY not set; starting with no LLM providers registered");
        }
    }

    let (tools, browser_runtime) = create_default_registry(&workspace_root, BrowserConfig::from_env());

    let manager_config = ManagerConfig {
        system_prompt: cli.system_prompt,
        ..ManagerConfig::default()
    };

    let eviction_config = EvictionConfig::default();
    let coordinator = Coordinator::new(Arc::new(tools), Arc::new(llm_registry), manager_config, eviction_config.clone());
    coordinator.spawn_eviction_sweep();

    tokio::spawn({
        let sweep_interval = eviction_config.sweep_interval;
        async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                browser_runtime.sweep_idle().await;
            }
        }
    });

    let gateway_config = GatewayConfig::from_env();
    let auth = ResolvedAuth::from_config(&gateway_config.auth, None);
    let app = router(AppState { coordinator, auth });

    let addr = format!("{}:{}", gateway_config.bind.to_addr(), gateway_config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding to {addr}"))?;
    tracing::info!(%addr, "chorus gateway listening");
    axum::serve(listener, app).await.context("serving http")?;

    Ok(())
}
