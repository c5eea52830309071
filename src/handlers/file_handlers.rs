//! HTTP handlers for uploading, downloading and deleting shared files.
//! Streams bodies in both directions and delegates storage concerns to
//! `BlobStore`.

use crate::{
    errors::AppError,
    models::record::ObjectRecord,
    services::blob_store::BlobStore,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::io;
use tokio_util::io::ReaderStream;

const INDEX_TEMPLATE: &str = include_str!("../../templates/index.html");
const UPLOAD_FIELD: &str = "file";
const FALLBACK_NAME: &str = "upload";
/// Headroom for multipart boundaries and part headers in `Content-Length`.
const MULTIPART_FRAMING_ALLOWANCE: u64 = 64 * 1024;

/// JSON body returned after a successful upload.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub url: String,
    pub md5: String,
    pub curl: String,
    pub expire_at: DateTime<Utc>,
}

impl UploadResponse {
    fn new(record: &ObjectRecord, host: &str) -> Self {
        let url = download_path(&record.id);
        let curl = format!(
            "curl -L -o \"{}\" \"http://{}{}\"",
            shell_quote_safe(&record.original_name),
            host,
            url
        );
        Self {
            message: "File uploaded successfully".into(),
            url,
            md5: record.checksum.clone(),
            curl,
            expire_at: record.expire_at,
        }
    }
}

/// `GET /`: landing page with the upload form.
pub async fn index(State(store): State<BlobStore>) -> Html<String> {
    Html(INDEX_TEMPLATE.replace("{{RETENTION}}", &describe_retention(store.retention())))
}

/// `POST /upload`: multipart upload; the payload is read from the `file` field.
///
/// The request `Content-Length`, less the multipart framing allowance, is
/// passed to the store as the declared size so clearly oversized uploads are
/// refused before anything is written. The exact limit is enforced on the
/// streamed bytes.
pub async fn upload_file(
    State(store): State<BlobStore>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(0, |len| len.saturating_sub(MULTIPART_FRAMING_ALLOWANCE));
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("localhost")
        .to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.body_text()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let original_name = field
            .file_name()
            .map(str::to_string)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_NAME.into());
        let stream = field.map(|chunk| chunk.map_err(io::Error::other));

        let record = store.create(stream, &original_name, declared_size).await?;
        return Ok(Json(UploadResponse::new(&record, &host)));
    }

    Err(AppError::bad_request("No file uploaded"))
}

/// `GET /download/{id}`: stream a verified payload back under its original name.
pub async fn download_file(
    State(store): State<BlobStore>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (file, record) = store.get(&id).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &record);

    Ok(response)
}

/// `DELETE /download/{id}`: remove an upload before it expires.
pub async fn delete_file(
    State(store): State<BlobStore>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    store.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn download_path(id: &str) -> String {
    format!("/download/{}", id)
}

fn set_download_headers(headers: &mut HeaderMap, record: &ObjectRecord) {
    let disposition = format!(
        "attachment; filename*=UTF-8''{}",
        encode_filename(&record.original_name)
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        HeaderName::from_static("content-transfer-encoding"),
        HeaderValue::from_static("binary"),
    );
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("public"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.size_bytes));

    if let Ok(value) = HeaderValue::from_str(&record.checksum) {
        headers.insert(HeaderName::from_static("x-file-md5"), value);
    }
    if let Some(value) = content_md5(&record.checksum).and_then(|v| HeaderValue::from_str(&v).ok())
    {
        headers.insert(HeaderName::from_static("content-md5"), value);
    }
}

/// RFC 5987 value for `filename*`: UTF-8 bytes, percent-encoded.
fn encode_filename(name: &str) -> String {
    url::form_urlencoded::byte_serialize(name.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
        .replace('*', "%2A")
}

/// Base64 of the raw digest, as `Content-MD5` expects, from its hex form.
fn content_md5(checksum: &str) -> Option<String> {
    hex::decode(checksum)
        .ok()
        .map(|raw| general_purpose::STANDARD.encode(raw))
}

/// Double quotes would end the quoted argument in the suggested command.
fn shell_quote_safe(name: &str) -> String {
    name.replace(['"', '\\', '$', '`'], "_")
}

fn describe_retention(retention: chrono::Duration) -> String {
    let hours = retention.num_hours();
    match hours {
        h if h > 0 && h % 24 == 0 => plural(h / 24, "day"),
        h if h > 0 => plural(h, "hour"),
        _ => plural(retention.num_minutes().max(1), "minute"),
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_percent_encoded() {
        assert_eq!(encode_filename("report.pdf"), "report.pdf");
        assert_eq!(encode_filename("my file*.txt"), "my%20file%2A.txt");
        assert_eq!(encode_filename("报告.docx"), "%E6%8A%A5%E5%91%8A.docx");
        assert_eq!(encode_filename("a\"b;c"), "a%22b%3Bc");
    }

    #[test]
    fn content_md5_is_base64_of_raw_digest() {
        // MD5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(
            content_md5("d41d8cd98f00b204e9800998ecf8427e").as_deref(),
            Some("1B2M2Y8AsgTpgAmY7PhCfg==")
        );
        assert_eq!(
            content_md5(&format!("{:x}", md5::compute(b"hello-test"))).as_deref(),
            Some(general_purpose::STANDARD.encode(md5::compute(b"hello-test").0).as_str())
        );
        assert_eq!(content_md5("abc"), None);
        assert_eq!(content_md5("zz"), None);
    }

    #[test]
    fn retention_is_described_in_largest_whole_unit() {
        assert_eq!(describe_retention(chrono::Duration::days(7)), "7 days");
        assert_eq!(describe_retention(chrono::Duration::hours(24)), "1 day");
        assert_eq!(describe_retention(chrono::Duration::hours(36)), "36 hours");
        assert_eq!(describe_retention(chrono::Duration::hours(1)), "1 hour");
        assert_eq!(describe_retention(chrono::Duration::minutes(5)), "5 minutes");
    }

    #[test]
    fn curl_command_neutralizes_quotes() {
        assert_eq!(shell_quote_safe("a\"b$c`d.txt"), "a_b_c_d.txt");
        assert_eq!(shell_quote_safe("plain.txt"), "plain.txt");
    }
}
