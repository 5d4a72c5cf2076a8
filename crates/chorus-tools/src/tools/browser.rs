//! Browser tool — combined dispatch over the shared Browser Runtime
//! (spec §4.C/§4.D): navigate, eval, resize, screenshot, console_logs,
//! clear_console_logs, all routed by an `action` field.

use crate::browser::{BrowserError, BrowserRuntime};
use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub struct BrowserTool {
    runtime: Arc<BrowserRuntime>,
}

impl BrowserTool {
    pub fn new(runtime: Arc<BrowserRuntime>) -> Self {
        Self { runtime }
    }
}

fn timeout_of(args: &Value) -> Option<Duration> {
    args["timeout"].as_u64().map(Duration::from_secs)
}

fn to_result<T: std::fmt::Display>(r: Result<T, BrowserError>) -> ToolResult {
    match r {
        Ok(v) => ToolResult::text(v.to_string()),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

#[async_trait::async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> &str {
        "Control a shared headless browser: navigate, eval, resize, screenshot, \
         console_logs, clear_console_logs. Dispatch by the `action` field."
    }

    fn prompt(&self) -> &str {
        "The browser tool shares one process across calls — session state (cookies, \
         DOM) persists between actions until the browser is idle-evicted. Navigating \
         to a url on port 80 is rejected; use https or an explicit non-80 port."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["navigate", "eval", "resize", "screenshot", "console_logs", "clear_console_logs"]
                },
                "url": { "type": "string", "description": "navigate: URL to load" },
                "expression": { "type": "string", "description": "eval: JavaScript expression" },
                "await_promise": { "type": "boolean", "description": "eval: await the result if it's a promise" },
                "width": { "type": "integer", "description": "resize: viewport width" },
                "height": { "type": "integer", "description": "resize: viewport height" },
                "selector": { "type": "string", "description": "screenshot: CSS selector of an element" },
                "limit": { "type": "integer", "description": "console_logs: max entries (default 100)" },
                "timeout": { "type": "integer", "description": "per-action timeout in seconds (default 15)" }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let action = match args["action"].as_str() {
            Some(a) => a,
            None => return ToolResult::error("Missing required parameter: action"),
        };

        match action {
            "navigate" => {
                let url = match args["url"].as_str() {
                    Some(u) => u,
                    None => return ToolResult::error("navigate requires: url"),
                };
                to_result(self.runtime.navigate(url, timeout_of(&args)).await)
            }
            "eval" => {
                let expr = match args["expression"].as_str() {
                    Some(e) => e,
                    None => return ToolResult::error("eval requires: expression"),
                };
                let await_promise = args["await_promise"].as_bool().unwrap_or(false);
                to_result(self.runtime.eval(expr, await_promise, timeout_of(&args)).await)
            }
            "resize" => {
                let width = args["width"].as_u64().unwrap_or(0) as u32;
                let height = args["height"].as_u64().unwrap_or(0) as u32;
                to_result(self.runtime.resize(width, height, timeout_of(&args)).await)
            }
            "screenshot" => {
                let selector = args["selector"].as_str();
                match self.runtime.screenshot(selector, timeout_of(&args)).await {
                    Ok((id, bytes)) => ToolResult::text_with_display(
                        format!("Screenshot saved: {id}"),
                        json!({ "screenshot_id": id, "url": format!("/screenshots/{id}.png"), "bytes": bytes.len() }),
                    ),
                    Err(e) => ToolResult::error(e.to_string()),
                }
            }
            "console_logs" => {
                let limit = args["limit"].as_u64().map(|n| n as usize);
                to_result(self.runtime.console_logs(limit).await)
            }
            "clear_console_logs" => match self.runtime.clear_console_logs().await {
                Ok(n) => ToolResult::text(format!("Cleared {n} console log entries")),
                Err(e) => ToolResult::error(e.to_string()),
            },
            other => ToolResult::error(format!("Unknown browser action: {other}")),
        }
    }
}
