//! Upcoming-renewal report retrieval with one-shot re-authentication.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode, redirect};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PortalError;

use super::dates::{self, DisplayZone};
use super::session::SessionManager;

/// One report row, vendor field names in upstream order.
pub type ReportRow = serde_json::Map<String, Value>;

/// Fields rewritten from `/Date(<millis>)/` into `DD-MM-YYYY`.
pub const DATE_FIELDS: [&str; 2] = ["PlanActivationDate", "PlanExpiryDate"];

const BROWSER_USER_AGENT: &str = "Mozilla/5.0";

/// DataTables-style paging window and filters sent to the report endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportQuery {
    pub draw: u32,
    pub start: u32,
    pub length: u32,
    #[serde(rename = "From_Date")]
    pub from_date: String,
    #[serde(rename = "To_Date")]
    pub to_date: String,
    #[serde(rename = "ZoneId")]
    pub zone_id: String,
}

#[derive(Deserialize)]
struct ReportEnvelope {
    #[serde(default)]
    data: Option<Vec<ReportRow>>,
}

/// Fetches report rows, renewing the portal session at most once per call.
#[derive(Clone)]
pub struct ReportFetcher {
    client: Client,
    report_url: String,
    query: ReportQuery,
    zone: DisplayZone,
    session: SessionManager,
}

impl ReportFetcher {
    pub fn new(
        session: SessionManager,
        report_url: impl Into<String>,
        query: ReportQuery,
        zone: DisplayZone,
        timeout: Duration,
    ) -> Result<Self, PortalError> {
        // Expired sessions answer 302 to the login page; it must stay visible.
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            report_url: report_url.into(),
            query,
            zone,
            session,
        })
    }

    pub async fn fetch_report(&self) -> Result<Vec<ReportRow>, PortalError> {
        let cookie = self.session.ensure_cookie_header().await?;
        let mut resp = self.post(&cookie).await?;

        if is_session_expired(resp.status()) {
            tracing::info!(status = %resp.status(), "Portal session expired, logging in again");
            let cookie = self.session.renew().await?;
            resp = self.post(&cookie).await?;
        }

        let status = resp.status();
        if !status.is_success() {
            return Err(PortalError::UpstreamHttp { status });
        }

        let text = resp.text().await?;
        let envelope: ReportEnvelope = serde_json::from_str(&text).map_err(|e| {
            PortalError::Decode(format!("{e}. Body: {}", truncate(&text, 200)))
        })?;

        let mut rows = envelope.data.unwrap_or_default();
        for row in &mut rows {
            normalize_row(row, self.zone)?;
        }

        tracing::info!(rows = rows.len(), "Fetched renewal report");
        Ok(rows)
    }

    async fn post(&self, cookie: &str) -> Result<reqwest::Response, PortalError> {
        let resp = self
            .client
            .post(&self.report_url)
            .form(&self.query)
            .headers(request_headers(cookie)?)
            .send()
            .await?;
        tracing::debug!(status = %resp.status(), "Report endpoint responded");
        Ok(resp)
    }
}

fn is_session_expired(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FOUND
}

fn request_headers(cookie: &str) -> Result<HeaderMap, PortalError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded; charset=UTF-8"),
    );
    let cookie =
        HeaderValue::from_str(cookie).map_err(|e| PortalError::CookieHeader(e.to_string()))?;
    headers.insert(COOKIE, cookie);
    Ok(headers)
}

/// Rewrite the vendor date fields of one row in place.
pub fn normalize_row(row: &mut ReportRow, zone: DisplayZone) -> Result<(), PortalError> {
    for field in DATE_FIELDS {
        let rendered = match row.get(field) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(raw)) => dates::format_vendor_date(raw, zone)
                .ok_or_else(|| date_error(field, &Value::String(raw.clone())))?,
            Some(other) => return Err(date_error(field, other)),
        };
        row.insert(field.to_string(), Value::String(rendered));
    }
    Ok(())
}

fn date_error(field: &str, value: &Value) -> PortalError {
    PortalError::DateFormat {
        field: field.to_string(),
        value: value.to_string(),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::{
        Router,
        extract::State,
        http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus},
        response::{IntoResponse, Response},
        routing::post,
    };
    use tokio::net::TcpListener;

    use super::*;
    use crate::portal::cookies::SessionCookie;
    use crate::portal::session::testing::*;

    const UTC: DisplayZone = DisplayZone::Named(chrono_tz::UTC);

    /// Stand-in for the portal's report endpoint: replies from a script and
    /// records what each request carried.
    #[derive(Default)]
    struct FakePortal {
        replies: Mutex<Vec<(u16, String)>>,
        calls: AtomicUsize,
        cookies: Mutex<Vec<String>>,
        bodies: Mutex<Vec<String>>,
        headers: Mutex<Vec<AxumHeaders>>,
    }

    impl FakePortal {
        fn scripted(replies: &[(u16, &str)]) -> Arc<Self> {
            let portal = Self::default();
            *portal.replies.lock().unwrap() = replies
                .iter()
                .rev()
                .map(|(s, b)| (*s, b.to_string()))
                .collect();
            Arc::new(portal)
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    async fn report_endpoint(
        State(portal): State<Arc<FakePortal>>,
        headers: AxumHeaders,
        body: String,
    ) -> Response {
        portal.calls.fetch_add(1, Ordering::SeqCst);
        let cookie = headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        portal.cookies.lock().unwrap().push(cookie);
        portal.bodies.lock().unwrap().push(body);
        portal.headers.lock().unwrap().push(headers);

        let (status, body) = portal
            .replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or((500, "script exhausted".to_string()));
        let status = AxumStatus::from_u16(status).unwrap();
        if status == AxumStatus::FOUND {
            return (status, [("location", "/Account/Login")], body).into_response();
        }
        (status, body).into_response()
    }

    async fn serve(portal: Arc<FakePortal>) -> String {
        let app = Router::new()
            .route("/MISReport/UpcommingRenewal/GetData", post(report_endpoint))
            .with_state(portal);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/MISReport/UpcommingRenewal/GetData")
    }

    fn query() -> ReportQuery {
        ReportQuery {
            draw: 1,
            start: 0,
            length: 50,
            from_date: "2025/12/31".into(),
            to_date: "2025/12/31".into(),
            zone_id: String::new(),
        }
    }

    fn fetcher(
        url: String,
        store: Arc<MemorySessionStore>,
        auth: Arc<CountingAuthenticator>,
    ) -> ReportFetcher {
        let session = SessionManager::new(credentials(), store, auth);
        ReportFetcher::new(session, url, query(), UTC, Duration::from_secs(5)).unwrap()
    }

    fn stale_store() -> Arc<MemorySessionStore> {
        Arc::new(MemorySessionStore::with(vec![SessionCookie::new("session", "stale")]))
    }

    const ONE_ROW: &str =
        r#"{"data":[{"CustomerName":"A","PlanActivationDate":"/Date(1735603200000)/","PlanExpiryDate":null}]}"#;

    #[tokio::test]
    async fn accepted_cache_means_one_call_and_no_login() {
        let portal = FakePortal::scripted(&[(200, ONE_ROW)]);
        let auth = Arc::new(CountingAuthenticator::default());
        let rows = fetcher(serve(portal.clone()).await, stale_store(), auth.clone())
            .fetch_report()
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["PlanActivationDate"], "31-12-2024");
        assert_eq!(rows[0]["PlanExpiryDate"], "");
        assert_eq!(rows[0]["CustomerName"], "A");
        assert_eq!(portal.call_count(), 1);
        assert_eq!(auth.login_count(), 0);
    }

    #[tokio::test]
    async fn rejected_cache_relogs_once_and_returns_second_rows() {
        let second = r#"{"data":[{"CustomerName":"B"},{"CustomerName":"C"}]}"#;
        let portal = FakePortal::scripted(&[(401, ""), (200, second)]);
        let store = stale_store();
        let auth = Arc::new(CountingAuthenticator::default());

        let rows = fetcher(serve(portal.clone()).await, store.clone(), auth.clone())
            .fetch_report()
            .await
            .unwrap();

        let names: Vec<_> = rows.iter().map(|r| r["CustomerName"].clone()).collect();
        assert_eq!(names, vec!["B", "C"]);
        assert_eq!(portal.call_count(), 2);
        assert_eq!(auth.login_count(), 1);
        assert_eq!(store.clears.load(Ordering::SeqCst), 1);
        assert_eq!(*portal.cookies.lock().unwrap(), vec!["session=stale", "session=fresh-1"]);
    }

    #[tokio::test]
    async fn redirect_to_login_counts_as_expiry() {
        let portal = FakePortal::scripted(&[(302, ""), (200, r#"{"data":[]}"#)]);
        let auth = Arc::new(CountingAuthenticator::default());

        let rows = fetcher(serve(portal.clone()).await, stale_store(), auth.clone())
            .fetch_report()
            .await
            .unwrap();

        assert!(rows.is_empty());
        assert_eq!(portal.call_count(), 2);
        assert_eq!(auth.login_count(), 1);
    }

    #[tokio::test]
    async fn second_rejection_is_fatal_without_third_call() {
        let portal = FakePortal::scripted(&[(401, ""), (401, ""), (200, ONE_ROW)]);
        let auth = Arc::new(CountingAuthenticator::default());

        let err = fetcher(serve(portal.clone()).await, stale_store(), auth.clone())
            .fetch_report()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PortalError::UpstreamHttp { status } if status == StatusCode::UNAUTHORIZED
        ));
        assert_eq!(portal.call_count(), 2);
        assert_eq!(auth.login_count(), 1);
    }

    #[tokio::test]
    async fn server_error_is_not_retried() {
        let portal = FakePortal::scripted(&[(500, "boom"), (200, ONE_ROW)]);
        let auth = Arc::new(CountingAuthenticator::default());

        let err = fetcher(serve(portal.clone()).await, stale_store(), auth.clone())
            .fetch_report()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PortalError::UpstreamHttp { status } if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert_eq!(portal.call_count(), 1);
        assert_eq!(auth.login_count(), 0);
    }

    #[tokio::test]
    async fn no_cache_logs_in_before_first_call() {
        let portal = FakePortal::scripted(&[(200, ONE_ROW)]);
        let auth = Arc::new(CountingAuthenticator::default());

        fetcher(serve(portal.clone()).await, Arc::new(MemorySessionStore::default()), auth.clone())
            .fetch_report()
            .await
            .unwrap();

        assert_eq!(auth.login_count(), 1);
        assert_eq!(portal.call_count(), 1);
        assert_eq!(*portal.cookies.lock().unwrap(), vec!["session=fresh-1"]);
    }

    #[tokio::test]
    async fn unsendable_cached_jar_is_replaced_before_the_call() {
        let portal = FakePortal::scripted(&[(200, ONE_ROW)]);
        let store = Arc::new(MemorySessionStore::with(vec![SessionCookie::new(
            "session",
            "bad\u{7f}",
        )]));
        let auth = Arc::new(CountingAuthenticator::default());

        fetcher(serve(portal.clone()).await, store.clone(), auth.clone())
            .fetch_report()
            .await
            .unwrap();

        assert_eq!(auth.login_count(), 1);
        assert_eq!(store.clears.load(Ordering::SeqCst), 1);
        assert_eq!(*portal.cookies.lock().unwrap(), vec!["session=fresh-1"]);
    }

    #[tokio::test]
    async fn login_failure_during_renewal_propagates() {
        let portal = FakePortal::scripted(&[(401, ""), (200, ONE_ROW)]);
        let auth = Arc::new(CountingAuthenticator::failing());

        let err = fetcher(serve(portal.clone()).await, stale_store(), auth.clone())
            .fetch_report()
            .await
            .unwrap_err();

        assert!(matches!(err, PortalError::LoginFieldNotFound { .. }));
        assert_eq!(portal.call_count(), 1);
        assert_eq!(auth.login_count(), 1);
    }

    #[tokio::test]
    async fn sends_form_payload_and_ajax_headers() {
        let portal = FakePortal::scripted(&[(200, r#"{"data":[]}"#)]);
        let auth = Arc::new(CountingAuthenticator::default());
        fetcher(serve(portal.clone()).await, stale_store(), auth)
            .fetch_report()
            .await
            .unwrap();

        let body = portal.bodies.lock().unwrap()[0].clone();
        assert_eq!(
            body,
            "draw=1&start=0&length=50&From_Date=2025%2F12%2F31&To_Date=2025%2F12%2F31&ZoneId="
        );

        let headers = portal.headers.lock().unwrap()[0].clone();
        assert_eq!(headers["x-requested-with"], "XMLHttpRequest");
        assert_eq!(headers["user-agent"], "Mozilla/5.0");
        assert_eq!(
            headers["content-type"],
            "application/x-www-form-urlencoded; charset=UTF-8"
        );
    }

    #[tokio::test]
    async fn missing_or_null_data_is_an_empty_report() {
        for body in ["{}", r#"{"data":null,"recordsTotal":0}"#] {
            let portal = FakePortal::scripted(&[(200, body)]);
            let auth = Arc::new(CountingAuthenticator::default());
            let rows = fetcher(serve(portal).await, stale_store(), auth)
                .fetch_report()
                .await
                .unwrap();
            assert!(rows.is_empty(), "{body}");
        }
    }

    #[tokio::test]
    async fn html_body_is_a_decode_error() {
        let portal = FakePortal::scripted(&[(200, "<html>Login</html>")]);
        let auth = Arc::new(CountingAuthenticator::default());
        let err = fetcher(serve(portal).await, stale_store(), auth)
            .fetch_report()
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Decode(ref msg) if msg.contains("<html>Login</html>")));
    }

    #[tokio::test]
    async fn bad_vendor_date_fails_the_report() {
        let body = r#"{"data":[{"PlanActivationDate":"31/12/2024"}]}"#;
        let portal = FakePortal::scripted(&[(200, body)]);
        let auth = Arc::new(CountingAuthenticator::default());
        let err = fetcher(serve(portal).await, stale_store(), auth)
            .fetch_report()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PortalError::DateFormat { ref field, .. } if field == "PlanActivationDate"
        ));
    }

    #[test]
    fn normalize_fills_absent_and_rejects_non_strings() {
        let mut row: ReportRow = serde_json::from_str(r#"{"CustomerName":"A"}"#).unwrap();
        normalize_row(&mut row, UTC).unwrap();
        assert_eq!(row["PlanActivationDate"], "");
        assert_eq!(row["PlanExpiryDate"], "");

        let mut row: ReportRow =
            serde_json::from_str(r#"{"PlanExpiryDate":1735603200000}"#).unwrap();
        let err = normalize_row(&mut row, UTC).unwrap_err();
        assert!(matches!(
            err,
            PortalError::DateFormat { ref value, .. } if value == "1735603200000"
        ));
    }

    #[test]
    fn normalize_keeps_column_order() {
        let mut row: ReportRow = serde_json::from_str(
            r#"{"Zone":"N","PlanExpiryDate":"/Date(1735603200000)/","CustomerName":"A","PlanActivationDate":""}"#,
        )
        .unwrap();
        normalize_row(&mut row, UTC).unwrap();
        let keys: Vec<_> = row.keys().cloned().collect();
        assert_eq!(keys, vec!["Zone", "PlanExpiryDate", "CustomerName", "PlanActivationDate"]);
        assert_eq!(row["PlanExpiryDate"], "31-12-2024");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
