//! Browser Runtime state machine (spec §4.C): Idle → Starting → Ready → Idle,
//! wrapping a single shared chromiumoxide process.

use crate::browser::console::{ConsoleLogEntry, ConsoleRing};
use crate::browser::download::DownloadTracker;
use chorus_core::config::BrowserConfig;
use chromiumoxide::browser::{Browser, BrowserConfig as CdpBrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{SetDownloadBehaviorBehavior, SetDownloadBehaviorParamsBuilder};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParamsBuilder;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParamsBuilder, DownloadProgressState,
    EventDownloadProgress, EventDownloadWillBegin,
};
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVAL_SPILL_THRESHOLD_BYTES: usize = 1024;
const CONSOLE_SNAPSHOT_SPILL_THRESHOLD_BYTES: usize = 1024;
const DOWNLOAD_ABORT_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum BrowserError {
    StartFailed(String),
    NotReady,
    Timeout(String),
    Port80Rejected(String),
    InvalidDimensions,
    ActionFailed(String),
    NotAnImage,
}

impl std::fmt::Display for BrowserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StartFailed(e) => write!(
                f,
                "failed to start browser: {e} (install a Chromium/Chrome build and point \
                 CHROMIUMOXIDE_CHROME at it, or install it on PATH)"
            ),
            Self::NotReady => write!(f, "browser runtime is not ready"),
            Self::Timeout(action) => write!(f, "browser action timed out: {action}"),
            Self::Port80Rejected(url) => write!(f, "refusing to navigate to port 80: {url}"),
            Self::InvalidDimensions => write!(f, "width and height must both be > 0"),
            Self::ActionFailed(e) => write!(f, "{e}"),
            Self::NotAnImage => write!(f, "file does not contain recognizable image data"),
        }
    }
}

impl std::error::Error for BrowserError {}

pub type BrowserResult<T> = Result<T, BrowserError>;

struct Session {
    handle: SessionHandle,
    _browser: Browser,
    _handler_task: tokio::task::JoinHandle<()>,
    _console_task: tokio::task::JoinHandle<()>,
    _download_task: tokio::task::JoinHandle<()>,
}

/// Cheap, cloneable handle onto a live session's page and side channels.
/// Actions clone this out from under `BrowserRuntime::session`'s lock and
/// then drop the lock before running, so the lifecycle mutex only ever
/// guards start/stop, never an individual action (spec §5).
#[derive(Clone)]
struct SessionHandle {
    page: Page,
    crashed: CancellationToken,
    console: Arc<AsyncMutex<ConsoleRing>>,
    downloads: Arc<AsyncMutex<DownloadTracker>>,
    last_activity: Arc<std::sync::Mutex<Instant>>,
}

impl SessionHandle {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

pub struct BrowserRuntime {
    config: BrowserConfig,
    session: AsyncMutex<Option<Session>>,
}

impl BrowserRuntime {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            session: AsyncMutex::new(None),
        }
    }

    /// Starts the process if `Idle`, or recovers from a crashed one. Crash
    /// detection is lazy: we only notice the lifetime token fired the next
    /// time a caller demands the runtime (spec §4.C).
    async fn ensure_ready<'a>(
        &'a self,
        guard: &mut tokio::sync::MutexGuard<'a, Option<Session>>,
    ) -> BrowserResult<SessionHandle> {
        if let Some(session) = guard.as_ref() {
            if !session.handle.crashed.is_cancelled() {
                return Ok(session.handle.clone());
            }
            warn!("browser process crashed, restarting on next demand");
            **guard = None;
        }

        debug!("starting browser process");
        tokio::fs::create_dir_all(&self.config.download_dir)
            .await
            .map_err(|e| BrowserError::StartFailed(e.to_string()))?;

        let cdp_config = CdpBrowserConfig::builder()
            .no_sandbox()
            .window_size(1280, 720)
            .arg("--disable-dbus")
            .arg("--disable-features=site-per-process,Translate,BlinkGenPropertyTrees,WebAuthentication")
            .request_timeout(Duration::from_secs(60))
            .build()
            .map_err(BrowserError::StartFailed)?;

        let (browser, mut handler) = Browser::launch(cdp_config)
            .await
            .map_err(|e| BrowserError::StartFailed(e.to_string()))?;

        let crashed = CancellationToken::new();
        let crash_signal = crashed.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            crash_signal.cancel();
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::StartFailed(e.to_string()))?;

        browser
            .execute(
                SetDownloadBehaviorParamsBuilder::default()
                    .behavior(SetDownloadBehaviorBehavior::AllowAndName)
                    .download_path(self.config.download_dir.to_string_lossy().to_string())
                    .events_enabled(true)
                    .build()
                    .map_err(BrowserError::StartFailed)?,
            )
            .await
            .map_err(|e| BrowserError::StartFailed(e.to_string()))?;

        let _ = page
            .execute(
                SetDeviceMetricsOverrideParamsBuilder::default()
                    .width(1280)
                    .height(720)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .unwrap(),
            )
            .await;

        let console = Arc::new(AsyncMutex::new(ConsoleRing::new(self.config.console_ring_capacity)));
        let console_sink = console.clone();
        let mut console_events = page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .map_err(|e| BrowserError::StartFailed(e.to_string()))?;
        let console_task = tokio::spawn(async move {
            while let Some(event) = console_events.next().await {
                let args = event
                    .args
                    .iter()
                    .filter_map(|a| a.value.clone())
                    .collect::<Vec<Value>>();
                console_sink.lock().await.push(ConsoleLogEntry {
                    level: format!("{:?}", event.r#type),
                    args,
                    timestamp_ms: (event.timestamp.inner() * 1000.0) as i64,
                });
            }
        });

        let downloads = Arc::new(AsyncMutex::new(DownloadTracker::new(
            self.config.download_dir.clone(),
        )));
        let downloads_sink = downloads.clone();
        let mut begin_events = page
            .event_listener::<EventDownloadWillBegin>()
            .await
            .map_err(|e| BrowserError::StartFailed(e.to_string()))?;
        let mut progress_events = page
            .event_listener::<EventDownloadProgress>()
            .await
            .map_err(|e| BrowserError::StartFailed(e.to_string()))?;
        let download_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = begin_events.next() => {
                        match event {
                            Some(event) => {
                                downloads_sink.lock().await.begin(
                                    event.guid.clone(),
                                    event.url.clone(),
                                    event.suggested_filename.clone(),
                                );
                            }
                            None => break,
                        }
                    }
                    event = progress_events.next() => {
                        match event {
                            Some(event) => match event.state {
                                DownloadProgressState::Completed => {
                                    downloads_sink.lock().await.complete(&event.guid).await;
                                }
                                DownloadProgressState::Canceled => {
                                    downloads_sink.lock().await.cancel(&event.guid);
                                }
                                DownloadProgressState::InProgress => {}
                            },
                            None => break,
                        }
                    }
                }
            }
        });

        **guard = Some(Session {
            handle: SessionHandle {
                page,
                crashed,
                console,
                downloads,
                last_activity: Arc::new(std::sync::Mutex::new(Instant::now())),
            },
            _browser: browser,
            _handler_task: handler_task,
            _console_task: console_task,
            _download_task: download_task,
        });

        Ok(guard.as_ref().unwrap().handle.clone())
    }

    fn effective_idle_timeout(&self) -> Duration {
        if self.config.idle_timeout.is_zero() {
            BrowserConfig::default().idle_timeout
        } else {
            self.config.idle_timeout
        }
    }

    /// Closes the session if it has been idle past the configured threshold.
    /// Driven by the same periodic sweep that evicts conversation managers.
    pub async fn sweep_idle(&self) {
        let timeout = self.effective_idle_timeout();
        let mut guard = self.session.lock().await;
        let expired = guard
            .as_ref()
            .map(|s| s.handle.last_activity.lock().unwrap().elapsed() >= timeout)
            .unwrap_or(false);
        if expired {
            debug!("browser runtime idle, closing");
            *guard = None;
        }
    }

    pub async fn close(&self) {
        *self.session.lock().await = None;
    }

    pub async fn navigate(&self, url: &str, timeout: Option<Duration>) -> BrowserResult<String> {
        if is_port_80(url) {
            return Err(BrowserError::Port80Rejected(url.to_string()));
        }

        let handle = {
            let mut guard = self.session.lock().await;
            self.ensure_ready(&mut guard).await?
        };

        let fut = async {
            handle
                .page
                .goto(url)
                .await
                .map_err(|e| BrowserError::ActionFailed(e.to_string()))?;
            handle
                .page
                .wait_for_navigation()
                .await
                .map_err(|e| BrowserError::ActionFailed(e.to_string()))?;
            Ok::<_, BrowserError>(())
        };

        let aborted = match tokio::time::timeout(timeout.unwrap_or(self.config.action_timeout), fut).await {
            Ok(Ok(())) => false,
            Ok(Err(_)) => true,
            Err(_) => return Err(BrowserError::Timeout(format!("navigate to {url}"))),
        };

        if aborted {
            tokio::time::sleep(DOWNLOAD_ABORT_SETTLE).await;
        }

        handle.touch();
        let mut report = if aborted {
            format!("Navigation to {url} was interrupted")
        } else {
            format!("Navigated to {url}")
        };
        if let Some(extra) = handle.downloads.lock().await.drain_completed_report() {
            report.push('\n');
            report.push_str(&extra);
        }
        Ok(report)
    }

    pub async fn eval(
        &self,
        expression: &str,
        await_promise: bool,
        timeout: Option<Duration>,
    ) -> BrowserResult<String> {
        let handle = {
            let mut guard = self.session.lock().await;
            self.ensure_ready(&mut guard).await?
        };

        let fut = async {
            let result = if await_promise {
                handle.page.evaluate_expression(expression).await
            } else {
                handle.page.evaluate(expression).await
            }
            .map_err(|e| BrowserError::ActionFailed(e.to_string()))?;
            result
                .into_value::<Value>()
                .map_err(|e| BrowserError::ActionFailed(e.to_string()))
        };

        let value = match tokio::time::timeout(timeout.unwrap_or(self.config.action_timeout), fut).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BrowserError::Timeout("eval".into())),
        };

        handle.touch();
        let serialized = serde_json::to_string(&value).unwrap_or_else(|_| "null".into());
        if serialized.len() > EVAL_SPILL_THRESHOLD_BYTES {
            spill_to_file(&self.config.download_dir, "eval", &serialized).await
        } else {
            Ok(serialized)
        }
    }

    pub async fn resize(&self, width: u32, height: u32, timeout: Option<Duration>) -> BrowserResult<String> {
        if width == 0 || height == 0 {
            return Err(BrowserError::InvalidDimensions);
        }

        let handle = {
            let mut guard = self.session.lock().await;
            self.ensure_ready(&mut guard).await?
        };

        let params = SetDeviceMetricsOverrideParamsBuilder::default()
            .width(width)
            .height(height)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(BrowserError::ActionFailed)?;

        tokio::time::timeout(
            timeout.unwrap_or(self.config.action_timeout),
            handle.page.execute(params),
        )
        .await
        .map_err(|_| BrowserError::Timeout("resize".into()))?
        .map_err(|e| BrowserError::ActionFailed(e.to_string()))?;

        handle.touch();
        Ok(format!("Viewport resized to {width}x{height}"))
    }

    pub async fn screenshot(
        &self,
        selector: Option<&str>,
        timeout: Option<Duration>,
    ) -> BrowserResult<(String, Vec<u8>)> {
        let handle = {
            let mut guard = self.session.lock().await;
            self.ensure_ready(&mut guard).await?
        };

        let fut = async {
            match selector {
                Some(sel) => {
                    let element = handle
                        .page
                        .find_element(sel)
                        .await
                        .map_err(|e| BrowserError::ActionFailed(e.to_string()))?;
                    element
                        .screenshot(CaptureScreenshotFormat::Png)
                        .await
                        .map_err(|e| BrowserError::ActionFailed(e.to_string()))
                }
                None => handle
                    .page
                    .screenshot(
                        CaptureScreenshotParamsBuilder::default()
                            .format(CaptureScreenshotFormat::Png)
                            .build(),
                    )
                    .await
                    .map_err(|e| BrowserError::ActionFailed(e.to_string())),
            }
        };

        let bytes = match tokio::time::timeout(timeout.unwrap_or(self.config.action_timeout), fut).await {
            Ok(Ok(b)) => b,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BrowserError::Timeout("screenshot".into())),
        };

        handle.touch();
        let bytes = match self.config.max_image_dimension {
            Some(max) => resample_if_needed(&bytes, max)?,
            None => bytes,
        };

        let id = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&self.config.screenshot_dir)
            .await
            .map_err(|e| BrowserError::ActionFailed(e.to_string()))?;
        let path = self.config.screenshot_dir.join(format!("{id}.png"));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| BrowserError::ActionFailed(e.to_string()))?;

        Ok((id, bytes))
    }

    pub async fn console_logs(&self, limit: Option<usize>) -> BrowserResult<String> {
        let handle = {
            let mut guard = self.session.lock().await;
            self.ensure_ready(&mut guard).await?
        };
        handle.touch();

        let entries = handle.console.lock().await.tail(limit.unwrap_or(100));
        let serialized = serde_json::to_string(&entries).unwrap_or_else(|_| "[]".into());
        if serialized.len() > CONSOLE_SNAPSHOT_SPILL_THRESHOLD_BYTES {
            spill_to_file(&self.config.console_log_dir, "console", &serialized).await
        } else {
            Ok(serialized)
        }
    }

    pub async fn clear_console_logs(&self) -> BrowserResult<usize> {
        let handle = {
            let mut guard = self.session.lock().await;
            self.ensure_ready(&mut guard).await?
        };
        handle.touch();
        Ok(handle.console.lock().await.clear())
    }
}

/// Rejects a URL whose explicit or implicit port is 80. An explicit port
/// always wins over the scheme's default.
fn is_port_80(raw_url: &str) -> bool {
    let after_scheme = raw_url.splitn(2, "://").nth(1);
    let authority = match after_scheme {
        Some(rest) => rest.split(['/', '?', '#']).next().unwrap_or(""),
        None => return false,
    };
    let host_port = authority.rsplit('@').next().unwrap_or(authority);

    if let Some((_, port_str)) = host_port.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return port == 80;
        }
    }

    raw_url.starts_with("http://")
}

async fn spill_to_file(dir: &Path, prefix: &str, content: &str) -> BrowserResult<String> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| BrowserError::ActionFailed(e.to_string()))?;
    let path = dir.join(format!("{prefix}-{}.json", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| BrowserError::ActionFailed(e.to_string()))?;
    Ok(path.to_string_lossy().to_string())
}

pub(crate) fn resample_if_needed(bytes: &[u8], max_dimension: u32) -> BrowserResult<Vec<u8>> {
    let img = image::load_from_memory(bytes).map_err(|_| BrowserError::NotAnImage)?;
    if img.width() <= max_dimension && img.height() <= max_dimension {
        return Ok(bytes.to_vec());
    }
    let resized = img.resize(max_dimension, max_dimension, image::imageops::FilterType::Lanczos3);
    let mut out = Vec::new();
    resized
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| BrowserError::ActionFailed(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_port_80_is_rejected() {
        assert!(is_port_80("http://example.com:80/path"));
        assert!(is_port_80("https://example.com:80/path"));
    }

    #[test]
    fn implicit_http_default_is_rejected() {
        assert!(is_port_80("http://example.com/path"));
    }

    #[test]
    fn implicit_https_default_is_not_rejected() {
        assert!(!is_port_80("https://example.com/path"));
    }

    #[test]
    fn explicit_non_80_port_is_not_rejected() {
        assert!(!is_port_80("http://example.com:8080/path"));
    }

    #[test]
    fn explicit_port_trumps_scheme() {
        assert!(!is_port_80("http://example.com:443/path"));
    }
}
