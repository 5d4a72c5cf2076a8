//! Tool implementations — modular, one file per capability.
//!
//! Each tool is a self-contained file in src/tools/.
//! To add a tool: create the file, implement Tool trait, register below.
//! To remove a tool: delete the file, remove from mod.rs and registry below.

pub mod browser;
pub mod registry;
pub mod tools;

pub use browser::{BrowserError, BrowserRuntime};
pub use registry::{Tool, ToolRegistry, ToolResult};

use chorus_core::config::BrowserConfig;
use std::path::Path;
use std::sync::Arc;

/// Create the default tool registry with all builtin tools, sharing one
/// Browser Runtime (spec §4.C) across the browser and read-image tools.
/// Also returns that runtime handle so the caller can drive its idle sweep
/// (see `BrowserRuntime::sweep_idle`) on the same cadence as manager
/// eviction.
///
/// Edit this function to add or remove tools from the agent.
pub fn create_default_registry(
    workspace_root: impl AsRef<Path>,
    browser_config: BrowserConfig,
) -> (ToolRegistry, Arc<BrowserRuntime>) {
    let mut registry = ToolRegistry::new();
    let root = workspace_root.as_ref();
    let browser_runtime = Arc::new(BrowserRuntime::new(browser_config.clone()));

    // --- Core tools (read-only) ---
    registry.register(tools::read::ReadTool::new(root));
    registry.register(tools::glob::GlobTool::new(root));
    registry.register(tools::grep::GrepTool::new(root));
    registry.register(tools::read_image::ReadImageTool::new(&browser_config));

    // --- Mutation tools ---
    registry.register(tools::write::WriteTool::new(root));
    registry.register(tools::edit::EditTool::new(root));
    registry.register(tools::bash::BashTool::new(root));
    registry.register(tools::browser::BrowserTool::new(browser_runtime.clone()));

    (registry, browser_runtime)
}
