use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    response::Html,
    routing::get,
};
use minijinja::{Environment, context};
use serde_json::Value;

use crate::AppState;
use crate::error::PortalError;
use crate::portal::{ReportQuery, ReportRow};

pub const TEMPLATE_NAME: &str = "index.html";

/// Template environment with the report page registered.
pub fn templates() -> Result<Environment<'static>, PortalError> {
    let mut env = Environment::new();
    env.add_template(TEMPLATE_NAME, include_str!("../../templates/index.html"))?;
    Ok(env)
}

/// GET /: the renewal report as an HTML table.
async fn index(State(state): State<Arc<AppState>>) -> Result<Html<String>, PortalError> {
    let rows = state.fetcher.fetch_report().await?;
    render(&state.templates, &state.config.query, &rows).map(Html)
}

pub fn render(
    env: &Environment<'_>,
    query: &ReportQuery,
    rows: &[ReportRow],
) -> Result<String, PortalError> {
    let columns = columns(rows);
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| columns.iter().map(|c| cell_text(row.get(c.as_str()))).collect())
        .collect();

    let html = env.get_template(TEMPLATE_NAME)?.render(context! {
        from_date => &query.from_date,
        to_date => &query.to_date,
        columns => &columns,
        rows => cells,
    })?;
    Ok(html)
}

/// Column order: first appearance across all rows.
fn columns(rows: &[ReportRow]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for key in rows.iter().flat_map(|row| row.keys()) {
        if !columns.iter().any(|c| c == key) {
            columns.push(key.clone());
        }
    }
    columns
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .with_state(state)
}
