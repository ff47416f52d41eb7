#![forbid(unsafe_code)]

// Attachment uploads — extension allow-list, role gate, and chat fan-out of
// the stored file's link.

use crate::error::ChatError;
use crate::room::moderation;
use crate::signaling::SignalingServer;
use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Extensions accepted for upload. Anything else is refused before the file
/// touches disk.
const ALLOWED_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "gif", "webp", "pdf", "doc", "docx"];

fn allowed_extension(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// POST /upload — multipart with a `userId` field and a `file` field.
/// Only mod and above may upload; on success a chat message embedding the
/// file link is broadcast and the URL returned.
pub async fn handle_upload(
    State(server): State<SignalingServer>,
    mut multipart: Multipart,
) -> Response {
    let mut user_id: Option<String> = None;
    let mut file: Option<(String, axum::body::Bytes)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid multipart body: {e}")),
        };
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "userId" => match field.text().await {
                Ok(text) => user_id = Some(text),
                Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid userId field: {e}")),
            },
            "file" => {
                let name = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => file = Some((name, bytes)),
                    Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid file field: {e}")),
                }
            }
            _ => {}
        }
    }

    let Some(user_id) = user_id else {
        return error_response(StatusCode::BAD_REQUEST, "Missing userId field".to_string());
    };
    let Some((original_name, bytes)) = file else {
        return error_response(StatusCode::BAD_REQUEST, "Missing file field".to_string());
    };

    // Role gate: mod and above
    let Some(role) = server.coordinator().user_role(&user_id).await else {
        return error_response(StatusCode::FORBIDDEN, ChatError::UserNotFound(user_id).to_string());
    };
    if !moderation::can_upload(role) {
        return error_response(StatusCode::FORBIDDEN, ChatError::Unauthorized("upload").to_string());
    }

    // Extension allow-list
    let Some(ext) = allowed_extension(&original_name) else {
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ChatError::UnsupportedFileType(original_name).to_string(),
        );
    };

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let file_name = format!("{}-{}.{}", millis, rand::random::<u32>(), ext);
    let path = server.upload_dir().join(&file_name);

    if let Err(e) = tokio::fs::create_dir_all(server.upload_dir()).await {
        warn!("Failed to create upload directory: {}", e);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Upload failed".to_string());
    }
    if let Err(e) = tokio::fs::write(&path, &bytes).await {
        warn!("Failed to store upload {}: {}", path.display(), e);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Upload failed".to_string());
    }

    let url = format!("/uploads/{file_name}");
    info!("upload: {} stored {} ({} bytes)", user_id, url, bytes.len());
    server.metrics().inc_uploads();

    // The uploader may have disconnected between the gate and the write;
    // the stored file stays either way
    if let Err(e) = server.coordinator().broadcast_attachment(&user_id, url.clone()).await {
        warn!("Upload stored but not announced: {}", e);
    }

    (StatusCode::OK, Json(serde_json::json!({ "url": url }))).into_response()
}
