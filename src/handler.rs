//! HTTP handlers mapping the paste/view API onto the document store.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use serde::Serialize;
use tracing::info;

use crate::allocator::IdentifierAllocator;
use crate::db::Database;
use crate::error::StoreError;
use crate::model::CreateDocument;
use crate::render;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub allocator: Arc<IdentifierAllocator>,
    pub base_url: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// What a successful create returns: the code, when it was stored, and the
/// shareable view link.
#[derive(Debug, Serialize)]
pub struct CreatedDocument {
    pub short_code: String,
    pub created_at: String,
    pub url: String,
}

fn success<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse { data })).into_response()
}

fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse { data })).into_response()
}

fn not_found(msg: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: msg.to_string() })).into_response()
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: msg.to_string() })).into_response()
}

fn service_unavailable(msg: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse { error: msg.to_string() }),
    )
        .into_response()
}

fn internal_error(msg: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: msg.to_string() }),
    )
        .into_response()
}

fn store_error_response(action: &str, err: StoreError) -> Response {
    match err {
        StoreError::Validation(msg) => bad_request(&msg),
        StoreError::NotFound(code) => not_found(&format!("no document with code {}", code)),
        StoreError::Unavailable(msg) => {
            tracing::error!("failed to {}: storage unavailable: {}", action, msg);
            service_unavailable("storage unavailable, try again shortly")
        }
        err => {
            tracing::error!("failed to {}: {}", action, err);
            internal_error(&format!("failed to {}", action))
        }
    }
}

fn share_url(base_url: &str, short_code: &str) -> String {
    format!("{}/view/{}", base_url.trim_end_matches('/'), short_code)
}

pub async fn healthcheck() -> impl IntoResponse {
    info!("got healthcheck request");
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn create_document(State(state): State<AppState>, Json(payload): Json<CreateDocument>) -> Response {
    match state.db.create_document(&state.allocator, payload).await {
        Ok(doc) => {
            info!(code = %doc.short_code, "stored pasted document");
            created(CreatedDocument {
                url: share_url(&state.base_url, &doc.short_code),
                short_code: doc.short_code,
                created_at: doc.created_at,
            })
        }
        Err(e) => store_error_response("create document", e),
    }
}

/// Title for uploaded files. Browsers send an empty filename for fields
/// with no file attached, so blank names count as absent.
fn upload_title(file_name: Option<&str>) -> String {
    file_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string())
        .unwrap_or_else(|| "Uploaded Document".to_string())
}

/// Multipart upload path: the first file field becomes the document, its
/// filename the title.
pub async fn upload_document(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    while let Ok(Some(field)) = multipart.next_field().await {
        let title = upload_title(field.file_name());

        let data = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("failed to read upload field: {}", e);
                return bad_request("failed to read uploaded file");
            }
        };

        let content = match String::from_utf8(data.to_vec()) {
            Ok(content) => content,
            Err(_) => return bad_request("uploaded file is not valid UTF-8 text"),
        };

        let input = CreateDocument {
            content,
            title: Some(title),
        };
        return match state.db.create_document(&state.allocator, input).await {
            Ok(doc) => {
                info!(code = %doc.short_code, "stored uploaded document");
                created(CreatedDocument {
                    url: share_url(&state.base_url, &doc.short_code),
                    short_code: doc.short_code,
                    created_at: doc.created_at,
                })
            }
            Err(e) => store_error_response("store uploaded document", e),
        };
    }

    bad_request("no file provided")
}

pub async fn get_document(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    match state.db.get_document_by_code(&code).await {
        Ok(doc) => success(doc),
        Err(e) => store_error_response("get document", e),
    }
}

pub async fn view_document(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    match state.db.get_document_by_code(&code).await {
        Ok(doc) => Html(render::render_page(&doc.title, &doc.content)).into_response(),
        Err(StoreError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Html("<!doctype html><html><body><p>Document not found.</p></body></html>".to_string()),
        )
            .into_response(),
        Err(e) => store_error_response("render document", e),
    }
}

pub async fn show_editor() -> Html<&'static str> {
    Html(
        r#"
        <!doctype html>
        <html>
            <head><title>kickshare</title></head>
            <body>
                <h1>kickshare</h1>
                <p>Upload a markdown file, or POST JSON to <code>/markdown</code>.</p>
                <form action="/markdown/upload" method="post" enctype="multipart/form-data">
                    <label>
                        Markdown file:
                        <input type="file" name="file" accept=".md,.markdown,text/markdown">
                    </label>

                    <input type="submit" value="Share">
                </form>
            </body>
        </html>
        "#,
    )
}
