use std::io;
use std::path::Path;

use axum::body::Body;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::Response;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::cache::{content_type_for, extension_of};

/// Finalized cache content is immutable, so clients may hold onto it.
const CACHE_CONTROL_FINALIZED: &str = "public, max-age=86400";

#[derive(Debug, PartialEq, Eq)]
pub enum RangeError {
    Malformed,
    Unsatisfiable,
}

/// Parse a `bytes=<start>-<end>?` header against a known file size.
///
/// An omitted end means end-of-file, and an end past the file is clamped.
/// Anything else (no `bytes=` prefix, suffix form, multiple ranges, start at
/// or past the file) fails closed; the whole file is never served off a bad
/// range header.
pub fn parse_range(header: &str, file_size: u64) -> Result<(u64, u64), RangeError> {
    let raw = header.trim().strip_prefix("bytes=").ok_or(RangeError::Malformed)?;
    let (start_s, end_s) = raw.split_once('-').ok_or(RangeError::Malformed)?;

    let start: u64 = start_s.trim().parse().map_err(|_| RangeError::Malformed)?;
    let end: u64 = if end_s.trim().is_empty() {
        file_size.saturating_sub(1)
    } else {
        end_s.trim().parse().map_err(|_| RangeError::Malformed)?
    };
    let end = end.min(file_size.saturating_sub(1));

    if file_size == 0 || start >= file_size || start > end {
        return Err(RangeError::Unsatisfiable);
    }
    Ok((start, end))
}

/// Serve a finalized cache file, honoring a byte-range header when present.
pub async fn serve_file(path: &Path, range_header: Option<&str>) -> io::Result<Response> {
    let meta = tokio::fs::metadata(path).await?;
    let file_size = meta.len();
    let content_type = content_type_for(extension_of(path));

    let Some(raw_range) = range_header else {
        let file = tokio::fs::File::open(path).await?;
        return respond(
            StatusCode::OK,
            vec![
                (header::CONTENT_TYPE, content_type.to_string()),
                (header::CONTENT_LENGTH, file_size.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CACHE_CONTROL, CACHE_CONTROL_FINALIZED.to_string()),
            ],
            Body::from_stream(ReaderStream::new(file)),
        );
    };

    let (start, end) = match parse_range(raw_range, file_size) {
        Ok(bounds) => bounds,
        Err(_) => {
            return respond(
                StatusCode::RANGE_NOT_SATISFIABLE,
                vec![(
                    header::CONTENT_RANGE,
                    format!("bytes */{}", file_size),
                )],
                Body::empty(),
            );
        }
    };

    let len = end - start + 1;
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(io::SeekFrom::Start(start)).await?;
    let slice = file.take(len);

    respond(
        StatusCode::PARTIAL_CONTENT,
        vec![
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, file_size),
            ),
            (header::CONTENT_LENGTH, len.to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (header::CACHE_CONTROL, CACHE_CONTROL_FINALIZED.to_string()),
        ],
        Body::from_stream(ReaderStream::new(slice)),
    )
}

/// Serve a cache file as a download attachment with an explicit filename.
pub async fn serve_attachment(path: &Path, filename: &str) -> io::Result<Response> {
    let meta = tokio::fs::metadata(path).await?;
    let ext = extension_of(path);
    let file = tokio::fs::File::open(path).await?;

    respond(
        StatusCode::OK,
        vec![
            (header::CONTENT_TYPE, content_type_for(ext).to_string()),
            (header::CONTENT_LENGTH, meta.len().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!(
                    "attachment; filename=\"{}.{}\"",
                    urlencoding::encode(filename),
                    ext
                ),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
}

fn respond(
    status: StatusCode,
    headers: Vec<(HeaderName, String)>,
    body: Body,
) -> io::Result<Response> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
