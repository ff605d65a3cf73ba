mod report;

use std::sync::Arc;

use axum::Router;

use crate::AppState;

pub use report::templates;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().merge(report::router(state))
}
