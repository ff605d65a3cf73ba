//! ISP portal access: browser login, cookie cache and the renewal report call.

pub mod browser;
pub mod cookies;
pub mod dates;
pub mod report;
pub mod session;
pub mod store;

pub use browser::{BrowserAuthenticator, LoginTimeouts};
pub use cookies::Credentials;
pub use dates::DisplayZone;
pub use report::{ReportFetcher, ReportQuery, ReportRow};
pub use session::SessionManager;
pub use store::FileSessionStore;
