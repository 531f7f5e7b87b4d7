//! Request and response bodies of the upload/stream HTTP contract.
//!
//! Only the shapes live here; binding them to a server is up to the caller.

use serde::{Deserialize, Serialize};

use crate::receipt::{ChunkReceipt, FileReceipt, OpenedRange};
use crate::upload::FinalizeOptions;
use crate::{FileId, GridError, SessionId, SessionRequest, UploadSession, UploadStatus};

/// Query of `POST /CreateSession`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionQuery {
    pub filename: String,
    pub total_size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

impl From<CreateSessionQuery> for SessionRequest {
    fn from(query: CreateSessionQuery) -> Self {
        let mut request = SessionRequest::new(query.filename, query.total_size);
        request.content_type = query.content_type;
        request.file_hash = query.file_hash;
        request.chunk_size = query.chunk_size;
        request
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub chunk_size: u64,
    pub status: UploadStatus,
    /// Present when the content already existed and the session completed instantly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
}

impl From<&UploadSession> for CreateSessionResponse {
    fn from(session: &UploadSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            chunk_size: session.chunk_size,
            status: session.status,
            file_id: (session.status == UploadStatus::Completed).then(|| session.file_id.clone()),
        }
    }
}

/// Query of `POST /UploadChunk`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkQuery {
    pub session_id: SessionId,
    pub chunk_number: u64,
    pub chunk_hash: String,
}

/// Session state returned after each chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: UploadStatus,
    pub uploaded_chunks: u64,
    pub total_chunks: u64,
    pub uploaded_size: u64,
    pub total_size: u64,
    pub missing_chunks: Vec<u64>,
}

impl From<&UploadSession> for SessionSummary {
    fn from(session: &UploadSession) -> Self {
        let progress = session.progress();
        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            uploaded_chunks: progress.uploaded_chunks,
            total_chunks: progress.total_chunks,
            uploaded_size: progress.uploaded_size,
            total_size: progress.total_size,
            missing_chunks: progress.missing_chunks,
        }
    }
}

impl From<&ChunkReceipt> for SessionSummary {
    fn from(receipt: &ChunkReceipt) -> Self {
        Self::from(&receipt.session)
    }
}

/// Query of `POST /Finalize/{sessionId}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeQuery {
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub skip_hash_validation: bool,
}

impl From<FinalizeQuery> for FinalizeOptions {
    fn from(query: FinalizeQuery) -> Self {
        let mut options = FinalizeOptions::new();
        if let Some(hash) = query.file_hash {
            options = options.with_file_hash(hash);
        }
        if query.skip_hash_validation {
            options = options.skip_hash_validation();
        }
        options
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub file_id: FileId,
}

impl From<&FileReceipt> for FinalizeResponse {
    fn from(receipt: &FileReceipt) -> Self {
        Self {
            file_id: receipt.file_id.clone(),
        }
    }
}

/// Status line and headers for a `GET /StreamRange/{fileId}` answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeaders {
    pub status: u16,
    pub content_length: u64,
    /// Only set for partial content
    pub content_range: Option<String>,
    pub content_type: String,
}

impl From<&OpenedRange> for StreamHeaders {
    fn from(opened: &OpenedRange) -> Self {
        let status = opened.status_code();
        Self {
            status,
            content_length: opened.range.content_length(),
            content_range: (status == 206).then(|| opened.range.content_range()),
            content_type: opened
                .object
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        }
    }
}

/// Error body sent with any non-2xx status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: u16,
    pub class_name: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_chunks: Option<Vec<u64>>,
}

impl From<&GridError> for ErrorBody {
    fn from(error: &GridError) -> Self {
        let missing_chunks = match error {
            GridError::IncompleteUpload { missing } => Some(missing.clone()),
            _ => None,
        };
        Self {
            code: error.status_code(),
            class_name: error.class_name().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            missing_chunks,
        }
    }
}

/// Bearer token from the `Authorization` header, falling back to the
/// `access_token` query parameter for clients that cannot set headers.
pub fn resolve_bearer(authorization: Option<&str>, access_token: Option<&str>) -> Option<String> {
    let from_header = authorization.and_then(|value| {
        let value = value.trim();
        let prefix = "Bearer ";
        if value.len() <= prefix.len() || !value.starts_with(prefix) {
            return None;
        }
        Some(value[prefix.len()..].trim().to_string())
    });
    from_header.or_else(|| {
        access_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_prefers_header_then_query() {
        assert_eq!(resolve_bearer(Some("Bearer abc"), Some("xyz")).as_deref(), Some("abc"));
        assert_eq!(resolve_bearer(None, Some("xyz")).as_deref(), Some("xyz"));
        assert_eq!(resolve_bearer(Some("Basic abc"), Some("xyz")).as_deref(), Some("xyz"));
        assert_eq!(resolve_bearer(Some("Bearer "), None), None);
        assert_eq!(resolve_bearer(None, Some("  ")), None);
    }

    #[test]
    fn create_session_query_uses_camel_case() {
        let query: CreateSessionQuery = serde_json::from_value(serde_json::json!({
            "filename": "movie.mp4",
            "totalSize": 5_000_000u64,
            "contentType": "video/mp4",
        }))
        .unwrap();
        let request = SessionRequest::from(query);
        assert_eq!(request.total_size, 5_000_000);
        assert_eq!(request.content_type.as_deref(), Some("video/mp4"));
        assert!(request.file_hash.is_none());
    }

    #[test]
    fn instant_completion_carries_file_id() {
        let response = CreateSessionResponse {
            session_id: SessionId::from_string("ups_1".to_string()),
            chunk_size: 1_048_576,
            status: UploadStatus::Completed,
            file_id: Some(FileId::from_string("f1".to_string())),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "Completed");
        assert_eq!(json["fileId"], "f1");
        assert_eq!(json["sessionId"], "ups_1");

        let pending = CreateSessionResponse { file_id: None, status: UploadStatus::InProgress, ..response };
        let json = serde_json::to_value(&pending).unwrap();
        assert!(json.get("fileId").is_none());
    }

    #[test]
    fn error_body_reports_missing_chunks() {
        let body = ErrorBody::from(&GridError::IncompleteUpload { missing: vec![3] });
        assert_eq!(body.code, 409);
        assert_eq!(body.class_name, "incomplete-upload");
        assert_eq!(body.missing_chunks, Some(vec![3]));
        assert!(body.retryable);

        let json = serde_json::to_value(ErrorBody::from(&GridError::not_found("x"))).unwrap();
        assert!(json.get("missingChunks").is_none());
    }

    #[test]
    fn finalize_query_maps_to_options() {
        let query: FinalizeQuery =
            serde_json::from_value(serde_json::json!({ "skipHashValidation": true })).unwrap();
        let options = FinalizeOptions::from(query);
        assert!(options.skip_hash_validation);
        assert!(options.file_hash.is_none());
    }
}
