//! OCR backends turning an inbound image into text.

use std::sync::Arc;
#[cfg(feature = "http-services")]
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use super::pdf::extract_text;

/// Name of the built-in engine selected by the `ocr_model` option.
pub const EMBEDDED_TEXT_MODEL: &str = "embedded-text";

/// Failure of an OCR backend.
#[derive(Debug, Error)]
pub enum OcrError {
    /// The engine ran but found no text.
    #[error("no text found in image")]
    Empty,
    /// The engine cannot read this image format.
    #[error("image format not readable by the `{engine}` engine")]
    Unreadable { engine: &'static str },
    /// The OCR service did not answer in time.
    #[error("OCR service timed out")]
    Timeout,
    /// The OCR service answered with an error status.
    #[error("OCR service returned status {0}")]
    Status(u16),
    /// The OCR request could not be sent or its answer decoded.
    #[cfg(feature = "http-services")]
    #[error("OCR request failed")]
    Request {
        #[source]
        source: reqwest::Error,
    },
}

/// Text recognition over raw image bytes.
pub trait OcrEngine: Send + Sync {
    /// Identifier of the backend (the configured `ocr_model`).
    fn model(&self) -> &str;

    /// Recognise the text of `image`.
    fn read_text(&self, image: Arc<[u8]>) -> BoxFuture<'static, Result<String, OcrError>>;
}

/// Reads the text layer of PDFs rendered by this service, or images that are
/// already plain UTF-8 text (pre-OCR'd uploads, test fixtures).
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedTextOcr;

impl OcrEngine for EmbeddedTextOcr {
    fn model(&self) -> &str {
        EMBEDDED_TEXT_MODEL
    }

    fn read_text(&self, image: Arc<[u8]>) -> BoxFuture<'static, Result<String, OcrError>> {
        Box::pin(async move {
            let text = match extract_text(&image).map_err(unreadable)? {
                Some(text) => text,
                None => std::str::from_utf8(&image)
                    .map(str::to_owned)
                    .map_err(unreadable)?,
            };
            if text.trim().is_empty() {
                return Err(OcrError::Empty);
            }
            Ok(text)
        })
    }
}

fn unreadable<E>(_: E) -> OcrError {
    OcrError::Unreadable {
        engine: EMBEDDED_TEXT_MODEL,
    }
}

/// Remote OCR service: the image is POSTed as the request body and the
/// service answers `{"text": "..."}`.
#[cfg(feature = "http-services")]
#[derive(Clone)]
pub struct HttpOcr {
    client: reqwest::Client,
    endpoint: Arc<str>,
    model: Arc<str>,
    timeout: Duration,
}

#[cfg(feature = "http-services")]
#[derive(serde::Deserialize)]
struct OcrResponse {
    text: String,
}

#[cfg(feature = "http-services")]
impl HttpOcr {
    /// Client for the service at `endpoint` running `model`.
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: Arc::from(endpoint),
            model: Arc::from(model),
            timeout,
        }
    }
}

#[cfg(feature = "http-services")]
impl OcrEngine for HttpOcr {
    fn model(&self) -> &str {
        &self.model
    }

    fn read_text(&self, image: Arc<[u8]>) -> BoxFuture<'static, Result<String, OcrError>> {
        let engine = self.clone();
        Box::pin(async move {
            let response = engine
                .client
                .post(engine.endpoint.as_ref())
                .header("x-ocr-model", engine.model.as_ref())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .timeout(engine.timeout)
                .body(image.to_vec())
                .send()
                .await
                .map_err(request_error)?;

            if !response.status().is_success() {
                return Err(OcrError::Status(response.status().as_u16()));
            }
            let payload = response
                .json::<OcrResponse>()
                .await
                .map_err(request_error)?;
            if payload.text.trim().is_empty() {
                return Err(OcrError::Empty);
            }
            Ok(payload.text)
        })
    }
}

#[cfg(feature = "http-services")]
fn request_error(source: reqwest::Error) -> OcrError {
    if source.is_timeout() {
        OcrError::Timeout
    } else {
        OcrError::Request { source }
    }
}
