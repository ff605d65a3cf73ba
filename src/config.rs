use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::PortalError;
use crate::portal::{Credentials, DisplayZone, ReportQuery};

const DEFAULT_LOGIN_URL: &str = "https://ims.marvellousfiber.com/Account/Login";
const DEFAULT_REPORT_URL: &str = "https://ims.marvellousfiber.com/MISReport/UpcommingRenewal/GetData";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub credentials: Credentials,
    /// Portal HTML login form.
    pub login_url: String,
    /// AJAX endpoint serving the upcoming-renewal rows.
    pub report_url: String,
    /// Cookie jar written after every successful login.
    pub cookie_file: PathBuf,
    /// Chromium binary; auto-detected when unset.
    pub chromium_path: Option<String>,
    pub query: ReportQuery,
    /// Timezone used to render vendor dates.
    pub display_zone: DisplayZone,
    /// Bound for page navigation and for the post-submit idle wait.
    pub login_timeout: Duration,
    /// Bound for each login field selector candidate.
    pub field_timeout: Duration,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, PortalError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PortalError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| PortalError::Configuration(format!("{key} is not set")))
        };

        let credentials = Credentials::new(required("ISP_USERNAME")?, required("ISP_PASSWORD")?);

        let display_zone = match get("REPORT_TIMEZONE") {
            Some(name) => DisplayZone::Named(name.parse().map_err(|_| {
                PortalError::Configuration(format!(
                    "REPORT_TIMEZONE is not a known timezone: {name}"
                ))
            })?),
            None => DisplayZone::Local,
        };

        Ok(Self {
            port: parse_or(&get, "PORT", 5000)?,
            credentials,
            login_url: get("ISP_LOGIN_URL").unwrap_or_else(|| DEFAULT_LOGIN_URL.into()),
            report_url: get("ISP_REPORT_URL").unwrap_or_else(|| DEFAULT_REPORT_URL.into()),
            cookie_file: get("COOKIE_FILE")
                .unwrap_or_else(|| "cookies.json".into())
                .into(),
            chromium_path: get("CHROMIUM_PATH"),
            query: ReportQuery {
                draw: 1,
                start: 0,
                length: parse_or(&get, "REPORT_PAGE_LENGTH", 50)?,
                from_date: get("REPORT_FROM_DATE").unwrap_or_else(|| "2025/12/31".into()),
                to_date: get("REPORT_TO_DATE").unwrap_or_else(|| "2025/12/31".into()),
                zone_id: get("REPORT_ZONE_ID").unwrap_or_default(),
            },
            display_zone,
            login_timeout: Duration::from_secs(parse_or(&get, "LOGIN_TIMEOUT_SECS", 30)?),
            field_timeout: Duration::from_secs(parse_or(&get, "FIELD_TIMEOUT_SECS", 5)?),
            http_timeout: Duration::from_secs(parse_or(&get, "HTTP_TIMEOUT_SECS", 30)?),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, PortalError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            PortalError::Configuration(format!("{key} must be a number, got {raw:?}"))
        }),
        None => Ok(default),
    }
}
