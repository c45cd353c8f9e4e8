//! Decoding of compressed backend response bodies
//!
//! Backends may compress whatever the client accepts (or ignore
//! `Accept-Encoding` entirely, e.g. for precompressed assets). Responses are
//! decoded as a stream before they leave the gateway, so the forwarded
//! headers never carry a `Content-Encoding`.

use crate::gateway::{BoxError, GatewayBody};
use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder};
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH};
use hyper::http::response::Parts;
use hyper::StatusCode;
use std::io;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    /// zlib-wrapped, as HTTP means it
    Deflate,
    Brotli,
}

impl ContentCoding {
    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(ContentCoding::Gzip),
            "deflate" => Some(ContentCoding::Deflate),
            "br" => Some(ContentCoding::Brotli),
            _ => None,
        }
    }
}

/// Codings in the order the sender applied them.
///
/// `None` when any coding is unsupported; `identity` is skipped.
pub fn parse_codings(headers: &HeaderMap) -> Option<Vec<ContentCoding>> {
    let mut codings = Vec::new();
    for value in headers.get_all(CONTENT_ENCODING) {
        let value = value.to_str().ok()?;
        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token.eq_ignore_ascii_case("identity") {
                continue;
            }
            codings.push(ContentCoding::from_token(token)?);
        }
    }
    Some(codings)
}

/// Strip `Content-Encoding` from `parts` and decode `body` to match.
///
/// Unsupported codings are forwarded untouched, header included, since
/// the client may still understand them.
pub fn decode_response<B>(parts: &mut Parts, body: B, head_request: bool) -> GatewayBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    if !parts.headers.contains_key(CONTENT_ENCODING) {
        return passthrough(body);
    }

    let Some(codings) = parse_codings(&parts.headers) else {
        debug!(
            encoding = ?parts.headers.get(CONTENT_ENCODING),
            "Unsupported content coding, relaying as-is"
        );
        return passthrough(body);
    };

    parts.headers.remove(CONTENT_ENCODING);
    if codings.is_empty() {
        return passthrough(body);
    }
    // Decoded length is unknown up front
    parts.headers.remove(CONTENT_LENGTH);

    let bodiless = head_request
        || parts.status == StatusCode::NO_CONTENT
        || parts.status == StatusCode::NOT_MODIFIED
        || body.is_end_stream();
    if bodiless {
        return passthrough(body);
    }

    decode_body(body, &codings)
}

fn passthrough<B>(body: B) -> GatewayBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

type BoxReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Undo `codings` (applied in order) on a streaming body
pub fn decode_body<B>(body: B, codings: &[ContentCoding]) -> GatewayBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let chunks = body.into_data_stream().map_err(io::Error::other);
    let mut reader: BoxReader = Box::new(StreamReader::new(Box::pin(chunks)));

    for coding in codings.iter().rev() {
        reader = match coding {
            ContentCoding::Gzip => {
                let mut decoder = GzipDecoder::new(reader);
                decoder.multiple_members(true);
                Box::new(BufReader::new(decoder))
            }
            ContentCoding::Deflate => Box::new(BufReader::new(ZlibDecoder::new(reader))),
            ContentCoding::Brotli => Box::new(BufReader::new(BrotliDecoder::new(reader))),
        };
    }

    let frames = ReaderStream::new(reader)
        .map_ok(Frame::data)
        .map_err(BoxError::from);
    StreamBody::new(frames).boxed_unsync()
}
