//! Web form: one image upload in, one caption out.

use std::sync::{Arc, Mutex};

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    response::Html,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::settings::ServerSettings;
use crate::{caption_or_message, CaptionError, Captioner, GenerationParams, ImageSource};

/// Returned instead of a caption when the form is submitted without an image.
pub const EMPTY_SUBMISSION_PROMPT: &str = "Please upload an image first.";

const UPLOAD_FIELD: &str = "image";
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub type SharedCaptioner = Arc<Mutex<Box<dyn Captioner + Send>>>;

#[derive(Clone)]
pub struct AppState {
    captioner: SharedCaptioner,
    params: GenerationParams,
    model_id: String,
    show_error: bool,
}

impl AppState {
    pub fn new(captioner: Box<dyn Captioner + Send>, params: GenerationParams, model_id: impl Into<String>) -> Self {
        Self {
            captioner: Arc::new(Mutex::new(captioner)),
            params,
            model_id: model_id.into(),
            show_error: true,
        }
    }

    pub fn with_show_error(mut self, show_error: bool) -> Self {
        self.show_error = show_error;
        self
    }
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index).post(submit))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the configured address and serves until the process is stopped.
pub async fn serve(server: &ServerSettings, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(server.addr).await?;
    let local_addr = listener.local_addr()?;

    if server.share {
        tracing::warn!("A public share link was requested but is not supported; serving on the local address only");
    }
    println!("🚀 Caption form running on http://{}", local_addr);
    tracing::info!("Listening on {}", local_addr);

    axum::serve(listener, create_router(state.with_show_error(server.show_error))).await?;
    Ok(())
}

async fn index() -> Html<String> {
    Html(render_page(None))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.model_id.clone(),
    })
}

async fn submit(State(state): State<AppState>, mut multipart: Multipart) -> Html<String> {
    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(UPLOAD_FIELD) => match field.bytes().await {
                Ok(bytes) => {
                    upload = Some(bytes.to_vec());
                    break;
                }
                Err(e) => return Html(render_page(Some(&upload_error(&state, e)))),
            },
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => return Html(render_page(Some(&upload_error(&state, e)))),
        }
    }

    let caption = caption_upload(&state, upload).await;
    Html(render_page(Some(&caption)))
}

fn upload_error(state: &AppState, e: impl std::fmt::Display) -> String {
    tracing::warn!("Could not read upload: {}", e);
    flatten(state, Err(CaptionError::ImageDecode(format!("could not read upload: {e}"))))
}

/// Captions one submission; empty submissions never reach the model.
pub async fn caption_upload(state: &AppState, upload: Option<Vec<u8>>) -> String {
    let Some(bytes) = upload.filter(|bytes| !bytes.is_empty()) else {
        return EMPTY_SUBMISSION_PROMPT.to_string();
    };

    let captioner = Arc::clone(&state.captioner);
    let params = state.params;
    // inference is blocking; the mutex keeps one request in flight
    let result = tokio::task::spawn_blocking(move || {
        let mut captioner = captioner
            .lock()
            .map_err(|_| CaptionError::generation("captioner lock poisoned"))?;
        captioner.caption_source(ImageSource::Bytes(bytes), &params)
    })
    .await
    .map_err(CaptionError::generation)
    .and_then(|result| result);

    flatten(state, result)
}

fn flatten(state: &AppState, result: Result<String, CaptionError>) -> String {
    match result {
        Err(e) if !state.show_error => {
            tracing::warn!("Caption request failed: {}", e);
            "Error generating caption.".to_string()
        }
        result => caption_or_message(result),
    }
}

fn render_page(caption: Option<&str>) -> String {
    let caption = escape_html(caption.unwrap_or(""));
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>AI Image Caption Generator</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 720px; margin: 40px auto; padding: 0 20px; color: #333; }}
        form {{ display: flex; flex-direction: column; gap: 16px; }}
        label {{ font-weight: 600; }}
        textarea {{ width: 100%; font-size: 1.1em; padding: 10px; box-sizing: border-box; }}
        button {{ align-self: flex-start; padding: 8px 20px; font-size: 1em; }}
    </style>
</head>
<body>
    <h1>🖼️ AI Image Caption Generator</h1>
    <p>Upload any image and let AI generate a descriptive caption!</p>
    <p>This tool uses the BLIP (Bootstrapping Language-Image Pre-training) model
    to understand image content and generate natural language descriptions.</p>
    <form method="post" action="/" enctype="multipart/form-data">
        <label for="image">Upload an Image</label>
        <input type="file" id="image" name="{UPLOAD_FIELD}" accept="image/*">
        <button type="submit">Submit</button>
        <label for="caption">Generated Caption</label>
        <textarea id="caption" rows="3" readonly>{caption}</textarea>
    </form>
</body>
</html>
"#
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
