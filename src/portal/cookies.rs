//! Portal credentials and the cookie jar captured after login.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Login credentials for the portal form.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// One cookie from the authenticated browser context.
///
/// Stored in the same shape browser tooling writes (`httpOnly`, `sameSite`, ...);
/// keys this type does not model are carried through `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Unix seconds; `-1` marks a session cookie.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            http_only: false,
            secure: false,
            extra: serde_json::Map::new(),
        }
    }
}

/// Format a jar as a `Cookie` request header value.
pub fn cookie_header(cookies: &[SessionCookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_joins_pairs_in_jar_order() {
        let jar = vec![
            SessionCookie::new("ASP.NET_SessionId", "abc123"),
            SessionCookie::new(".AspNet.ApplicationCookie", "tok=en"),
        ];
        assert_eq!(
            cookie_header(&jar),
            "ASP.NET_SessionId=abc123; .AspNet.ApplicationCookie=tok=en"
        );
        assert_eq!(cookie_header(&[]), "");
    }

    #[test]
    fn browser_shaped_cookie_keeps_unknown_keys() {
        let raw = r#"{"name":"sid","value":"v","domain":"ims.example","path":"/","expires":-1,
                      "httpOnly":true,"secure":true,"sameSite":"Lax"}"#;
        let cookie: SessionCookie = serde_json::from_str(raw).unwrap();

        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.domain.as_deref(), Some("ims.example"));
        assert_eq!(cookie.expires, Some(-1.0));
        assert!(cookie.http_only);
        assert_eq!(cookie.extra.get("sameSite"), Some(&serde_json::json!("Lax")));

        let back = serde_json::to_value(&cookie).unwrap();
        assert_eq!(back["sameSite"], "Lax");
        assert_eq!(back["httpOnly"], true);
    }

    #[test]
    fn minimal_cookie_needs_only_name_and_value() {
        let cookie: SessionCookie = serde_json::from_str(r#"{"name":"a","value":"b"}"#).unwrap();
        assert_eq!(cookie, SessionCookie::new("a", "b"));
    }

    #[test]
    fn debug_hides_password() {
        let creds = Credentials::new("ops", "hunter2");
        let shown = format!("{creds:?}");
        assert!(shown.contains("ops"));
        assert!(!shown.contains("hunter2"));
    }
}
