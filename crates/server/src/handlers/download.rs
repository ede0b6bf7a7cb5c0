//! File download endpoint.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::parse_file_id;
use crate::metrics;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use larder_core::{BlobInfo, LogicalFile};
use larder_storage::StorageError;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::instrument;

/// Characters left unencoded in an RFC 5987 `filename*` value.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// GET /api/download/{id}/ - Stream a file's bytes.
///
/// The blob's stored length is checked against the ledger before the
/// response starts. A missing or wrong-sized blob is an integrity failure
/// and produces a 500, never a partial or empty body.
#[instrument(skip(state))]
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_file_id(&id)?;
    let file = state
        .metadata
        .get_file(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("file {id} not found")))?;

    let info = BlobInfo::new(file.digest, file.size);
    let stream = match state.blobs.fetch_verified(&info).await {
        Ok(stream) => stream,
        Err(e @ (StorageError::NotFound(_) | StorageError::SizeMismatch { .. })) => {
            return Err(integrity_failure(&file, &e));
        }
        Err(e) => return Err(e.into()),
    };

    let file_id = file.id;
    let digest = file.digest;
    let stream = stream.inspect_err(move |e| {
        if matches!(e, StorageError::SizeMismatch { .. }) {
            metrics::INTEGRITY_ERRORS.inc();
        }
        tracing::error!(file_id = %file_id, digest = %digest, error = %e, "download aborted mid-stream");
    });

    let headers = [
        (header::CONTENT_TYPE, header_value(&file.file_type)?),
        (header::CONTENT_LENGTH, HeaderValue::from(file.size)),
        (
            header::CONTENT_DISPOSITION,
            header_value(&content_disposition(&file.original_filename))?,
        ),
    ];

    Ok((headers, Body::from_stream(stream)).into_response())
}

fn integrity_failure(file: &LogicalFile, e: &StorageError) -> ApiError {
    metrics::INTEGRITY_ERRORS.inc();
    tracing::error!(
        file_id = %file.id,
        digest = %file.digest,
        size = file.size,
        error = %e,
        "ledger references a blob that storage cannot produce"
    );
    ApiError::Integrity(format!("content for file {} is unavailable", file.id))
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ApiError::Internal(format!("invalid header value {value:?}: {e}")))
}

/// Build an attachment disposition with an ASCII fallback and a UTF-8 name.
pub fn content_disposition(filename: &str) -> String {
    let mut fallback = String::with_capacity(filename.len());
    for c in filename.chars() {
        match c {
            '"' | '\\' => {
                fallback.push('\\');
                fallback.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => fallback.push(c),
            _ => fallback.push('_'),
        }
    }

    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        utf8_percent_encode(filename, ATTR_CHAR)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_plain_name() {
        assert_eq!(
            content_disposition("report.pdf"),
            "attachment; filename=\"report.pdf\"; filename*=UTF-8''report.pdf"
        );
    }

    #[test]
    fn test_disposition_escapes_quotes_and_backslashes() {
        let value = content_disposition(r#"my "quoted" \name.txt"#);
        assert!(value.starts_with(r#"attachment; filename="my \"quoted\" \\name.txt""#));
        assert!(value.ends_with("filename*=UTF-8''my%20%22quoted%22%20%5Cname.txt"));
        assert!(HeaderValue::from_str(&value).is_ok());
    }

    #[test]
    fn test_disposition_replaces_non_ascii_in_fallback() {
        let value = content_disposition("résumé.txt");
        assert!(value.contains("filename=\"r_sum_.txt\""));
        assert!(value.contains("filename*=UTF-8''r%C3%A9sum%C3%A9.txt"));
    }
}
