//! Headless Chromium login against the portal's HTML form (chromiumoxide / CDP).
//!
//! Each login runs in a freshly launched browser with a throwaway profile
//! directory; the browser, its CDP handler task and the profile are torn down
//! whether the login succeeds or not.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::Cookie;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::PortalError;

use super::cookies::{Credentials, SessionCookie};
use super::session::Authenticator;

/// Username inputs, most specific first.
pub const USERNAME_SELECTORS: &[&str] = &[
    "#UserName",
    "input[name='UserName']",
    "input[name='username']",
    "input[name='Email']",
    "input[type='email']",
    "input[name*='user' i]",
];

pub const PASSWORD_SELECTORS: &[&str] = &[
    "#Password",
    "input[name='Password']",
    "input[type='password']",
];

pub const SUBMIT_SELECTORS: &[&str] = &["button[type='submit']", "input[type='submit']"];

/// Frames whose URL contains one of these host the login form.
const FRAME_HINTS: &[&str] = &["login", "account"];

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// No new network resources for this long counts as idle.
const IDLE_QUIET_PERIOD: Duration = Duration::from_millis(500);

/// One login form control, resolved from an ordered candidate list.
#[derive(Debug, Clone, Copy)]
pub struct FieldLocator {
    pub field: &'static str,
    pub candidates: &'static [&'static str],
}

pub const USERNAME: FieldLocator = FieldLocator {
    field: "username",
    candidates: USERNAME_SELECTORS,
};

pub const PASSWORD: FieldLocator = FieldLocator {
    field: "password",
    candidates: PASSWORD_SELECTORS,
};

pub const SUBMIT: FieldLocator = FieldLocator {
    field: "submit",
    candidates: SUBMIT_SELECTORS,
};

impl FieldLocator {
    fn not_found(&self) -> PortalError {
        PortalError::LoginFieldNotFound {
            field: self.field,
            tried: self.candidates.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Timeouts for the individual login steps.
#[derive(Debug, Clone, Copy)]
pub struct LoginTimeouts {
    /// Navigation to the login page and the page reaching `complete`.
    pub navigation: Duration,
    /// Per selector candidate.
    pub field: Duration,
    /// Post-submit network idle wait.
    pub idle: Duration,
}

/// Logs in by driving the portal's HTML form in headless Chromium.
pub struct BrowserAuthenticator {
    login_url: String,
    chromium_path: Option<String>,
    timeouts: LoginTimeouts,
}

impl BrowserAuthenticator {
    pub fn new(
        login_url: impl Into<String>,
        chromium_path: Option<String>,
        timeouts: LoginTimeouts,
    ) -> Self {
        Self {
            login_url: login_url.into(),
            chromium_path,
            timeouts,
        }
    }

    async fn launch(
        &self,
        profile: &tempfile::TempDir,
    ) -> Result<(Browser, tokio::task::JoinHandle<()>), PortalError> {
        tracing::info!("BrowserAuthenticator: launching headless Chromium...");

        let mut config = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--no-first-run")
            .user_data_dir(profile.path())
            .request_timeout(self.timeouts.navigation)
            .window_size(1366, 900);

        if let Some(ref path) = self.chromium_path {
            config = config.chrome_executable(path);
        }

        let config = config
            .build()
            .map_err(|e| PortalError::Browser(format!("browser config error: {e}")))?;
        let (browser, mut handler) = Browser::launch(config).await?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("BrowserAuthenticator: handler event error");
                    break;
                }
            }
        });

        Ok((browser, handler_task))
    }

    /// The login flow proper; the caller owns browser teardown.
    async fn drive_login(
        &self,
        browser: &Browser,
        credentials: &Credentials,
    ) -> Result<Vec<SessionCookie>, PortalError> {
        let page = browser.new_page("about:blank").await?;

        tracing::info!(url = %self.login_url, "BrowserAuthenticator: opening login page");
        tokio::time::timeout(self.timeouts.navigation, page.goto(self.login_url.as_str()))
            .await
            .map_err(|_| PortalError::Browser(format!("timed out loading {}", self.login_url)))??;
        wait_for_load(&page, self.timeouts.navigation).await?;
        log_unreachable_login_frames(&page).await;

        let username = resolve_field(&page, USERNAME, self.timeouts.field).await?;
        let password = resolve_field(&page, PASSWORD, self.timeouts.field).await?;
        tracing::debug!(
            username_selector = username,
            password_selector = password,
            "BrowserAuthenticator: login fields located"
        );

        fill(&page, username, credentials.username()).await?;
        fill(&page, password, credentials.password()).await?;

        match resolve_field(&page, SUBMIT, self.timeouts.field).await {
            Ok(submit) => {
                tracing::debug!(submit, "BrowserAuthenticator: clicking submit");
                click(&page, submit).await?;
            }
            Err(PortalError::LoginFieldNotFound { .. }) => {
                tracing::debug!(
                    "BrowserAuthenticator: no submit control, submitting password form"
                );
                submit_form_of(&page, password).await?;
            }
            Err(e) => return Err(e),
        }

        wait_for_network_idle(&page, self.timeouts.idle).await?;

        if let Ok(Some(url)) = page.url().await
            && url.to_ascii_lowercase().contains("/login")
        {
            tracing::warn!(
                url = %url,
                "BrowserAuthenticator: still on the login page after submit"
            );
        }

        // Every cookie in the browser, not only those matching the page URL.
        let cookies = session_jar(browser.get_cookies().await?);
        tracing::debug!(count = cookies.len(), "BrowserAuthenticator: captured cookies");

        Ok(cookies)
    }
}

fn session_jar(cookies: Vec<Cookie>) -> Vec<SessionCookie> {
    cookies
        .into_iter()
        .map(|c| SessionCookie {
            domain: Some(c.domain),
            path: Some(c.path),
            expires: Some(c.expires),
            http_only: c.http_only,
            secure: c.secure,
            ..SessionCookie::new(c.name, c.value)
        })
        .collect()
}

#[async_trait]
impl Authenticator for BrowserAuthenticator {
    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<SessionCookie>, PortalError> {
        let profile = tempfile::Builder::new()
            .prefix("renewal-report-chromium-")
            .tempdir()
            .map_err(|e| PortalError::Browser(format!("cannot create browser profile dir: {e}")))?;

        let (mut browser, handler_task) = self.launch(&profile).await?;
        let result = self.drive_login(&browser, credentials).await;

        if let Err(e) = browser.close().await {
            tracing::warn!("BrowserAuthenticator: close failed: {e}");
        }
        if let Err(e) = browser.wait().await {
            tracing::warn!("BrowserAuthenticator: waiting for Chromium exit failed: {e}");
        }
        handler_task.abort();
        drop(profile);
        tracing::info!("BrowserAuthenticator: closed");

        result
    }
}

/// Try each candidate in order, giving each up to `timeout`; first hit wins.
async fn resolve_field(
    page: &Page,
    locator: FieldLocator,
    timeout: Duration,
) -> Result<&'static str, PortalError> {
    for &selector in locator.candidates {
        if wait_for_selector(page, selector, timeout).await? {
            return Ok(selector);
        }
        tracing::debug!(
            field = locator.field,
            selector,
            "BrowserAuthenticator: candidate did not match"
        );
    }
    Err(locator.not_found())
}

async fn wait_for_selector(
    page: &Page,
    selector: &str,
    timeout: Duration,
) -> Result<bool, PortalError> {
    let script = scoped_script(&format!(
        "return !!scope.querySelector({sel});",
        sel = js_string(selector)?
    ));
    let deadline = Instant::now() + timeout;
    loop {
        let found: bool = eval(page, &script).await?;
        if found {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn fill(page: &Page, selector: &str, value: &str) -> Result<(), PortalError> {
    let script = scoped_script(&format!(
        r#"
        const el = scope.querySelector({sel});
        if (!el) return false;
        el.focus();
        el.value = {value};
        el.dispatchEvent(new Event("input", {{ bubbles: true }}));
        el.dispatchEvent(new Event("change", {{ bubbles: true }}));
        return true;
        "#,
        sel = js_string(selector)?,
        value = js_string(value)?,
    ));
    expect_true(page, &script, selector).await
}

async fn click(page: &Page, selector: &str) -> Result<(), PortalError> {
    let script = scoped_script(&format!(
        r#"
        const el = scope.querySelector({sel});
        if (!el) return false;
        el.click();
        return true;
        "#,
        sel = js_string(selector)?,
    ));
    expect_true(page, &script, selector).await
}

async fn submit_form_of(page: &Page, selector: &str) -> Result<(), PortalError> {
    let script = scoped_script(&format!(
        r#"
        const el = scope.querySelector({sel});
        if (!el || !el.form) return false;
        if (el.form.requestSubmit) el.form.requestSubmit(); else el.form.submit();
        return true;
        "#,
        sel = js_string(selector)?,
    ));
    let submitted: bool = eval(page, &script).await?;
    if submitted { Ok(()) } else { Err(SUBMIT.not_found()) }
}

async fn expect_true(page: &Page, script: &str, selector: &str) -> Result<(), PortalError> {
    let ok: bool = eval(page, script).await?;
    if ok {
        Ok(())
    } else {
        Err(PortalError::Browser(format!("element {selector} disappeared before it could be used")))
    }
}

async fn wait_for_load(page: &Page, timeout: Duration) -> Result<(), PortalError> {
    let deadline = Instant::now() + timeout;
    loop {
        let state: String = eval(page, "document.readyState").await?;
        if state == "complete" {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(PortalError::Browser(format!("login page stuck in readyState {state}")));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[derive(Deserialize)]
struct LoadProbe {
    ready: bool,
    resources: f64,
}

/// Wait until the document is complete and no new resources have been
/// fetched for [`IDLE_QUIET_PERIOD`]. A timeout is logged, not fatal.
async fn wait_for_network_idle(page: &Page, timeout: Duration) -> Result<(), PortalError> {
    const PROBE: &str = r#"({
        ready: document.readyState === "complete",
        resources: performance.getEntriesByType("resource").length
    })"#;

    let deadline = Instant::now() + timeout;
    let mut last: Option<(f64, Instant)> = None;
    loop {
        // The document may be replaced mid-navigation; treat that as "not idle yet".
        let probe = eval::<LoadProbe>(page, PROBE).await.ok();

        match (probe, last) {
            (Some(p), Some((count, since))) if p.ready && p.resources == count => {
                if since.elapsed() >= IDLE_QUIET_PERIOD {
                    tracing::debug!(resources = count, "BrowserAuthenticator: network idle");
                    return Ok(());
                }
            }
            (Some(p), _) if p.ready => last = Some((p.resources, Instant::now())),
            _ => last = None,
        }

        if Instant::now() >= deadline {
            tracing::warn!("BrowserAuthenticator: network idle timeout, continuing anyway...");
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Hinted frames we cannot script into (cross-origin) are skipped by
/// [`scoped_script`]; say so, since the form is then looked up in the top document.
async fn log_unreachable_login_frames(page: &Page) {
    match eval::<Vec<String>>(page, &unreachable_frames_script()).await {
        Ok(urls) => {
            for url in urls {
                tracing::debug!(
                    url = %url,
                    "BrowserAuthenticator: login frame is not reachable, skipping"
                );
            }
        }
        Err(e) => tracing::debug!("BrowserAuthenticator: frame inspection failed: {e}"),
    }
}

fn unreachable_frames_script() -> String {
    format!(
        r#"(() => {{
    const hints = {hints};
    const blocked = [];
    for (const frame of document.querySelectorAll("iframe, frame")) {{
        let url = frame.src || "";
        let doc = null;
        try {{ url = frame.contentWindow.location.href || url; }} catch (_) {{}}
        try {{ doc = frame.contentDocument; }} catch (_) {{}}
        if (hints.some(h => url.toLowerCase().includes(h)) && !doc) blocked.push(url);
    }}
    return blocked;
}})()"#,
        hints = frame_hints()
    )
}

fn frame_hints() -> String {
    serde_json::to_string(FRAME_HINTS).unwrap_or_else(|_| "[]".into())
}

/// Wrap `body` so it runs with `scope` bound to the login form's document:
/// the first reachable frame whose URL hints at login, else the top document.
fn scoped_script(body: &str) -> String {
    let hints = frame_hints();
    format!(
        r#"(() => {{
    const hints = {hints};
    const pickScope = () => {{
        for (const frame of document.querySelectorAll("iframe, frame")) {{
            let url = frame.src || "";
            try {{ url = frame.contentWindow.location.href || url; }} catch (_) {{}}
            if (!hints.some(h => url.toLowerCase().includes(h))) continue;
            try {{ if (frame.contentDocument) return frame.contentDocument; }} catch (_) {{}}
        }}
        return document;
    }};
    const scope = pickScope();
    {body}
}})()"#
    )
}

/// Evaluate `script` as an expression and deserialize its value.
async fn eval<T: DeserializeOwned>(page: &Page, script: &str) -> Result<T, PortalError> {
    let params = EvaluateParams::builder()
        .expression(script)
        .return_by_value(true)
        .await_promise(true)
        .build()
        .map_err(PortalError::Browser)?;

    page.evaluate_expression(params)
        .await?
        .into_value()
        .map_err(|e| PortalError::Browser(format!("unexpected script result: {e}")))
}

fn js_string(value: &str) -> Result<String, PortalError> {
    serde_json::to_string(value)
        .map_err(|e| PortalError::Browser(format!("cannot encode script argument: {e}")))
}
