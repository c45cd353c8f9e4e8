//! Static file target
//!
//! Serves files below a root directory. Directories answer with their
//! `index.html`, a directory requested without a trailing slash is redirected
//! to the slashed path, and misses fall back to a root `404.html` if present.

use crate::gateway::{empty_body, full_body, BoxError, GatewayBody};
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{ALLOW, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

const INDEX_FILE: &str = "index.html";
const NOT_FOUND_FILE: &str = "404.html";

#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn serve<B>(&self, req: &Request<B>) -> Response<GatewayBody> {
        let head = req.method() == Method::HEAD;
        if req.method() != Method::GET && !head {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(ALLOW, "GET, HEAD")
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(full_body("Method Not Allowed"))
                .expect("valid response builder");
        }

        let path = req.uri().path();
        let Some(relative) = sanitize_path(path) else {
            debug!(path, "Rejected static file path");
            return self.not_found(head).await;
        };
        let full = self.root.join(relative);

        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => {
                if !path.ends_with('/') {
                    let location = match req.uri().query() {
                        Some(query) => format!("{}/?{}", path, query),
                        None => format!("{}/", path),
                    };
                    return Response::builder()
                        .status(StatusCode::TEMPORARY_REDIRECT)
                        .header(LOCATION, location)
                        .body(empty_body())
                        .expect("valid response builder");
                }
                let index = full.join(INDEX_FILE);
                match self.file_response(&index, StatusCode::OK, head).await {
                    Some(response) => response,
                    None => self.not_found(head).await,
                }
            }
            Ok(_) => match self.file_response(&full, StatusCode::OK, head).await {
                Some(response) => response,
                None => self.not_found(head).await,
            },
            Err(_) => self.not_found(head).await,
        }
    }

    async fn file_response(
        &self,
        path: &Path,
        status: StatusCode,
        head: bool,
    ) -> Option<Response<GatewayBody>> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Failed to open static file");
                return None;
            }
        };
        let len = match file.metadata().await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return None,
        };

        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let content_type = if mime.type_() == mime_guess::mime::TEXT {
            format!("{}; charset=utf-8", mime.essence_str())
        } else {
            mime.essence_str().to_string()
        };

        let body = if head {
            empty_body()
        } else {
            let frames = ReaderStream::new(file)
                .map_ok(Frame::data)
                .map_err(BoxError::from);
            StreamBody::new(frames).boxed_unsync()
        };

        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, len)
            .body(body)
            .ok()
    }

    async fn not_found(&self, head: bool) -> Response<GatewayBody> {
        let custom = self.root.join(NOT_FOUND_FILE);
        if let Some(response) = self.file_response(&custom, StatusCode::NOT_FOUND, head).await {
            return response;
        }
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(if head { empty_body() } else { full_body("Not Found") })
            .expect("valid response builder")
    }
}

/// Percent-decode a request path into a path relative to the root.
///
/// Returns `None` for anything that could escape the root.
fn sanitize_path(path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(path).ok()?;
    let mut relative = PathBuf::new();
    for segment in decoded.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment.contains(['\\', '\0']) {
            return None;
        }
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => relative.push(part),
            _ => return None,
        }
    }
    Some(relative)
}
