//! # Transcription Endpoint
//!
//! `POST /transcribe` accepts audio two ways:
//! - **multipart/form-data**: the `file` field, or the first field carrying a file name
//! - **anything else**: the whole request body is the audio
//!
//! The credential header is checked before a single body byte is read. The body
//! is then read incrementally and refused with 413 as soon as it passes
//! `limits.max_upload_bytes`. Everything after intake (format checks, storage,
//! inference, cleanup) belongs to the [`TranscriptionPipeline`].
//!
//! ## Response:
//! ```json
//! {
//!   "text": "Hello, this is a test transcription.",
//!   "language": "en",
//!   "duration": 3.21,
//!   "processing_time": 0.84,
//!   "model_used": "base"
//! }
//! ```
//!
//! [`TranscriptionPipeline`]: crate::pipeline::TranscriptionPipeline

use actix_multipart::{Field, Multipart};
use actix_web::http::header::{self, HeaderMap};
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::{Bytes, BytesMut};
use futures_util::stream::StreamExt;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::pipeline::validator::{AudioSource, TranscriptionRequest};
use crate::pipeline::{PipelineError, TranscriptionResult};
use crate::state::AppState;

/// Multipart field the audio is expected in.
const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize)]
pub struct TranscriptionResponse {
    pub text: String,
    pub language: String,
    /// Audio length in seconds
    pub duration: f64,
    /// Inference wall-clock time in seconds
    pub processing_time: f64,
    pub model_used: String,
}

impl From<TranscriptionResult> for TranscriptionResponse {
    fn from(result: TranscriptionResult) -> Self {
        Self {
            text: result.text,
            language: result.language,
            duration: round2(result.duration),
            processing_time: round2(result.processing_time.as_secs_f64()),
            model_used: result.model,
        }
    }
}

/// Non-negative, two decimal places.
fn round2(value: f64) -> f64 {
    ((value * 100.0).round() / 100.0).max(0.0)
}

/// Transcribe an uploaded audio file.
///
/// ## Endpoint: `POST /transcribe`
///
/// ## Status codes:
/// - 200 with the transcript, or `"[no speech detected]"` when nothing was said
/// - 400 unsupported format, empty payload or malformed multipart body
/// - 403 missing or wrong API key (when one is configured)
/// - 413 body larger than the configured limit
/// - 500 the audio could not be stored or transcribed
/// - 504 transcription took longer than the configured timeout
pub async fn transcribe(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> AppResult<HttpResponse> {
    let credential = header_value(req.headers(), &state.config.auth.header);
    if !state.pipeline.authorizes(credential.as_deref()) {
        let rejected = PipelineError::AuthenticationFailed;
        warn!(reason = %rejected, "Transcription request rejected before reading the body");
        state.record_transcription_failure(&rejected);
        return Err(AppError::from(rejected));
    }

    let limit = state.config.limits.max_upload_bytes;
    reject_declared_oversize(req.headers(), limit)?;

    let source = if is_multipart(req.headers()) {
        read_multipart(Multipart::new(req.headers(), payload), limit).await?
    } else {
        AudioSource::RawBody {
            bytes: read_body(payload, limit).await?,
            content_type: header_value(req.headers(), header::CONTENT_TYPE.as_str()),
        }
    };

    let request = TranscriptionRequest { credential, source };
    info!(
        source = request.source.kind(),
        bytes = request.source.bytes().len(),
        "Transcription request received"
    );

    // The pipeline runs as its own task, so a timeout or a client disconnect
    // never interrupts it between persisting and releasing the file.
    let pipeline = state.pipeline.clone();
    let task = tokio::spawn(async move { pipeline.run(request).await });

    let joined = match state.config.limits.request_timeout_secs {
        0 => task.await,
        secs => match tokio::time::timeout(Duration::from_secs(secs), task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(timeout_secs = secs, "Transcription exceeded request timeout");
                state.record_transcription_timeout();
                return Err(AppError::Timeout(format!("transcription did not finish within {}s", secs)));
            }
        },
    };

    let outcome = joined.map_err(|e| AppError::Internal(format!("transcription task failed: {}", e)))?;
    match outcome {
        Ok(result) => {
            state.record_transcription(&result);
            Ok(HttpResponse::Ok().json(TranscriptionResponse::from(result)))
        }
        Err(e) => {
            state.record_transcription_failure(&e);
            Err(AppError::from(e))
        }
    }
}

fn is_multipart(headers: &HeaderMap) -> bool {
    header_value(headers, header::CONTENT_TYPE.as_str())
        .map(|value| value.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn too_large(limit: usize) -> AppError {
    AppError::PayloadTooLarge(format!("upload exceeds the {} byte limit", limit))
}

/// Refuse early when `Content-Length` already announces an oversized body.
fn reject_declared_oversize(headers: &HeaderMap, limit: usize) -> AppResult<()> {
    let declared = header_value(headers, header::CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse::<u64>().ok());
    match declared {
        Some(length) if length > limit as u64 => Err(too_large(limit)),
        _ => Ok(()),
    }
}

async fn read_body(mut payload: web::Payload, limit: usize) -> AppResult<Bytes> {
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("failed to read request body: {}", e)))?;
        if body.len() + chunk.len() > limit {
            return Err(too_large(limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// Read one field to the end, counting its bytes against the shared budget.
async fn read_field(field: &mut Field, consumed: &mut usize, limit: usize) -> AppResult<BytesMut> {
    let mut bytes = BytesMut::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        *consumed += chunk.len();
        if *consumed > limit {
            return Err(too_large(limit));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

async fn read_multipart(mut multipart: Multipart, limit: usize) -> AppResult<AudioSource> {
    let mut consumed = 0usize;

    while let Some(item) = multipart.next().await {
        let mut field = item?;

        let (name, filename) = match field.content_disposition() {
            Some(disposition) => (
                disposition.get_name().map(str::to_string),
                disposition.get_filename().map(str::to_string),
            ),
            None => (None, None),
        };

        let bytes = read_field(&mut field, &mut consumed, limit).await?;
        if filename.is_some() || name.as_deref() == Some(FILE_FIELD) {
            return Ok(AudioSource::Multipart {
                bytes: bytes.freeze(),
                filename: filename.unwrap_or_default(),
            });
        }
    }

    Err(AppError::BadRequest(format!(
        "multipart body has no \"{}\" field or file upload",
        FILE_FIELD
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::NO_SPEECH_SENTINEL;
    use crate::testing::{pipeline_with, sine_wave, write_wav, ScriptedEngine};
    use actix_web::http::StatusCode;
    use actix_web::test as actix_test;
    use actix_web::App;
    use std::path::Path;
    use std::sync::Arc;

    const BOUNDARY: &str = "gateway-test-boundary";

    fn multipart_body(field: &str, filename: Option<&str>, data: &[u8]) -> Vec<u8> {
        let disposition = match filename {
            Some(name) => format!("form-data; name=\"{}\"; filename=\"{}\"", field, name),
            None => format!("form-data; name=\"{}\"", field),
        };
        let mut body = format!(
            "--{}\r\nContent-Disposition: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
            BOUNDARY, disposition
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload(filename: &str, data: &[u8]) -> actix_test::TestRequest {
        actix_test::TestRequest::post()
            .uri("/transcribe")
            .insert_header((header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY)))
            .set_payload(multipart_body("file", Some(filename), data))
    }

    fn state(engine: Arc<ScriptedEngine>, dir: &Path, api_key: Option<&str>, config: AppConfig) -> AppState {
        AppState::new(config, pipeline_with(engine, dir, api_key, 1), "cpu")
    }

    macro_rules! app {
        ($state:expr) => {
            actix_test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/transcribe", web::post().to(transcribe)),
            )
            .await
        };
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.0), 1.0);
        assert_eq!(round2(0.126), 0.13);
        assert_eq!(round2(-0.001), 0.0);
    }

    #[actix_web::test]
    async fn test_multipart_upload_is_transcribed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::speaking(&["Hola", "mundo."]));
        let app = app!(state(engine.clone(), dir.path(), None, AppConfig::default()));

        let wav = write_wav(&sine_wave(440.0, 0.5, 16_000), 16_000, 1);
        let response = actix_test::call_service(&app, upload("voice.wav", &wav).to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = actix_test::read_body_json(response).await;
        assert_eq!(body["text"], "Hola mundo.");
        assert_eq!(body["language"], "es");
        assert_eq!(body["model_used"], "scripted");
        assert_eq!(body["duration"].as_f64(), Some(round2(2.345)));
        assert!(body["processing_time"].as_f64().unwrap() >= 0.0);

        assert_eq!(engine.seen_payloads(), vec![wav]);
        assert_eq!(files_in(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_first_file_field_is_used_when_not_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::speaking(&["ok"]));
        let app = app!(state(engine.clone(), dir.path(), None, AppConfig::default()));

        let request = actix_test::TestRequest::post()
            .uri("/transcribe")
            .insert_header((header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY)))
            .set_payload(multipart_body("data", Some("note.ogg"), b"ogg bytes"))
            .to_request();
        let response = actix_test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(engine.seen_payloads(), vec![b"ogg bytes".to_vec()]);
    }

    #[actix_web::test]
    async fn test_raw_body_is_transcribed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::speaking(&["raw works"]));
        let app = app!(state(engine.clone(), dir.path(), None, AppConfig::default()));

        let request = actix_test::TestRequest::post()
            .uri("/transcribe")
            .insert_header((header::CONTENT_TYPE, "audio/ogg"))
            .set_payload(&b"OggS...."[..])
            .to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, request).await;
        assert_eq!(body["text"], "raw works");

        let seen = engine.seen_paths();
        assert_eq!(seen[0].extension().and_then(|e| e.to_str()), Some("ogg"));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_unsupported_format_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::speaking(&["never"]));
        let app = app!(state(engine.clone(), dir.path(), None, AppConfig::default()));

        let response = actix_test::call_service(&app, upload("clip.txt", b"hello").to_request()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = actix_test::read_body_json(response).await;
        assert!(body["detail"].as_str().unwrap().contains("clip.txt"));
        assert_eq!(body["error"]["type"], "unsupported_format");

        assert_eq!(engine.calls(), 0);
        assert_eq!(files_in(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_api_key_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::speaking(&["secret words"]));
        let app = app!(state(engine.clone(), dir.path(), Some("s3cret"), AppConfig::default()));

        let response = actix_test::call_service(&app, upload("a.wav", b"data").to_request()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let wrong = upload("a.wav", b"data").insert_header(("x-api-key", "guess")).to_request();
        assert_eq!(actix_test::call_service(&app, wrong).await.status(), StatusCode::FORBIDDEN);
        assert_eq!(engine.calls(), 0);
        assert_eq!(files_in(dir.path()), 0);

        let right = upload("a.wav", b"data").insert_header(("x-api-key", "s3cret")).to_request();
        assert_eq!(actix_test::call_service(&app, right).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_bad_credential_is_refused_before_the_body_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.limits.max_upload_bytes = 16;
        let engine = Arc::new(ScriptedEngine::speaking(&["never"]));
        let app = app!(state(engine.clone(), dir.path(), Some("s3cret"), config));

        // Oversized and malformed bodies would otherwise be 413 and 400
        let oversized = upload("a.wav", &[7u8; 64]).insert_header(("x-api-key", "guess")).to_request();
        assert_eq!(actix_test::call_service(&app, oversized).await.status(), StatusCode::FORBIDDEN);

        let malformed = actix_test::TestRequest::post()
            .uri("/transcribe")
            .insert_header((header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY)))
            .set_payload(&b"not multipart at all"[..])
            .to_request();
        let response = actix_test::call_service(&app, malformed).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = actix_test::read_body_json(response).await;
        assert_eq!(body["error"]["type"], "forbidden");

        assert_eq!(engine.calls(), 0);
        assert_eq!(files_in(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_custom_auth_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.auth.header = "authorization-token".to_string();
        let app = app!(state(Arc::new(ScriptedEngine::speaking(&["ok"])), dir.path(), Some("k"), config));

        let request = upload("a.wav", b"data").insert_header(("authorization-token", "k")).to_request();
        assert_eq!(actix_test::call_service(&app, request).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_oversized_upload_is_413() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.limits.max_upload_bytes = 16;
        let engine = Arc::new(ScriptedEngine::speaking(&["never"]));
        let app = app!(state(engine.clone(), dir.path(), None, config));

        let raw = actix_test::TestRequest::post()
            .uri("/transcribe")
            .set_payload(vec![7u8; 64])
            .to_request();
        assert_eq!(actix_test::call_service(&app, raw).await.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = actix_test::call_service(&app, upload("a.wav", &[7u8; 64]).to_request()).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(engine.calls(), 0);
        assert_eq!(files_in(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_empty_and_malformed_bodies_are_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = app!(state(Arc::new(ScriptedEngine::speaking(&["never"])), dir.path(), None, AppConfig::default()));

        let empty = actix_test::TestRequest::post().uri("/transcribe").to_request();
        assert_eq!(actix_test::call_service(&app, empty).await.status(), StatusCode::BAD_REQUEST);

        let no_file = actix_test::TestRequest::post()
            .uri("/transcribe")
            .insert_header((header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY)))
            .set_payload(multipart_body("comment", None, b"just text"))
            .to_request();
        let response = actix_test::call_service(&app, no_file).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = actix_test::read_body_json(response).await;
        assert_eq!(body["error"]["type"], "bad_request");
    }

    #[actix_web::test]
    async fn test_silence_returns_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let app = app!(state(Arc::new(ScriptedEngine::silent()), dir.path(), None, AppConfig::default()));

        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, upload("quiet.wav", b"data").to_request()).await;
        assert_eq!(body["text"], NO_SPEECH_SENTINEL);
    }

    #[actix_web::test]
    async fn test_engine_failure_is_500_with_detail() {
        let dir = tempfile::tempdir().unwrap();
        let app = app!(state(Arc::new(ScriptedEngine::failing("corrupt stream")), dir.path(), None, AppConfig::default()));

        let response = actix_test::call_service(&app, upload("a.mp3", b"data").to_request()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = actix_test::read_body_json(response).await;
        assert!(body["detail"].as_str().unwrap().contains("corrupt stream"));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_timeout_is_504_and_file_is_still_released() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.limits.request_timeout_secs = 1;
        let engine = Arc::new(ScriptedEngine::speaking(&["late"]).with_delay(Duration::from_millis(1500)));
        let app = app!(state(engine.clone(), dir.path(), None, config));

        let response = actix_test::call_service(&app, upload("a.wav", b"data").to_request()).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(engine.calls(), 1);
        assert_eq!(files_in(dir.path()), 0);
    }

    #[test]
    fn test_multipart_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_multipart(&headers));
        headers.insert(header::CONTENT_TYPE, "Multipart/Form-Data; boundary=x".parse().unwrap());
        assert!(is_multipart(&headers));
        headers.insert(header::CONTENT_TYPE, "audio/wav".parse().unwrap());
        assert!(!is_multipart(&headers));
    }
}
