//! Deception targets mounted inside the protected service.

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::any,
    Json, Router,
};
use serde_json::{json, Value};

/// Path of the fake product page.
pub const DECOY_PAGE_PATH: &str = "/honeypot";
/// Path of the fake database dump.
pub const DECOY_DB_PATH: &str = "/honeypot/fakedb";

const FAKE_PAGE_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Products - Shop</title></head>
<body>
  <h1>Products</h1>
  <table border="1">
    <tr><th>ID</th><th>Name</th><th>Price</th></tr>
    <tr><td>1001</td><td>Widget A</td><td>$9.99</td></tr>
    <tr><td>1002</td><td>Gadget B</td><td>$19.99</td></tr>
  </table>
</body>
</html>
"#;

fn fake_rows() -> Value {
    json!({
        "rows": [
            { "id": 1001, "username": "alice", "email": "alice@example.com" },
            { "id": 1002, "username": "bob", "email": "bob@example.com" },
            { "id": 1003, "username": "carol", "email": "carol@example.com" }
        ],
        "note": "simulated data"
    })
}

/// Serialized fake table dump; also the placeholder for fake-data verdicts without a body.
#[must_use]
pub fn fake_table_dump() -> String {
    fake_rows().to_string()
}

/// Router serving the decoy page and fake database on any method.
pub fn routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route(DECOY_PAGE_PATH, any(fake_page))
        .route(DECOY_DB_PATH, any(fake_db))
}

async fn fake_page() -> impl IntoResponse {
    (StatusCode::OK, Html(FAKE_PAGE_HTML))
}

async fn fake_db() -> impl IntoResponse {
    (StatusCode::OK, Json(fake_rows()))
}
