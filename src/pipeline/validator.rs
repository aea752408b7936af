//! # Request Validation
//!
//! Decides whether an inbound transcription request may proceed, before any
//! disk I/O happens. Only metadata is inspected: the credential, the file name
//! and the payload length. The audio bytes themselves are never read here.
//!
//! ## Checks, in order:
//! 1. **Auth**: when a shared secret is configured the credential must match it exactly
//! 2. **Format**: multipart uploads must carry an allow-listed audio extension
//! 3. **Empty**: a zero-byte payload is rejected in either mode

use bytes::Bytes;

/// Extensions accepted for multipart uploads (compared case-insensitively).
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "ogg", "oga"];

/// Extension given to raw-body uploads whose content type says nothing useful.
pub const DEFAULT_RAW_EXTENSION: &str = "ogg";

/// Where the audio bytes came from.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// A `multipart/form-data` file field, with the client's file name
    Multipart { bytes: Bytes, filename: String },
    /// The whole request body, with its `Content-Type` if any
    RawBody { bytes: Bytes, content_type: Option<String> },
}

impl AudioSource {
    pub fn bytes(&self) -> &Bytes {
        match self {
            AudioSource::Multipart { bytes, .. } | AudioSource::RawBody { bytes, .. } => bytes,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AudioSource::Multipart { .. } => "multipart",
            AudioSource::RawBody { .. } => "raw",
        }
    }
}

/// One inbound transcription request.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub source: AudioSource,
    /// Value of the auth header, if the client sent one
    pub credential: Option<String>,
}

/// Shared-secret check applied to every transcription request.
#[derive(Clone, Default)]
pub struct AuthPolicy {
    secret: Option<String>,
}

impl std::fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl AuthPolicy {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret: secret.filter(|s| !s.is_empty()) }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Whether `credential` grants access.
    pub fn permits(&self, credential: Option<&str>) -> bool {
        match (&self.secret, credential) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(secret), Some(given)) => constant_time_eq(secret.as_bytes(), given.as_bytes()),
        }
    }
}

/// Compare without exiting on the first differing byte.
fn constant_time_eq(expected: &[u8], given: &[u8]) -> bool {
    let mut diff = expected.len() ^ given.len();
    for i in 0..expected.len().max(given.len()) {
        let a = expected.get(i).copied().unwrap_or(0);
        let b = given.get(i).copied().unwrap_or(0);
        diff |= (a ^ b) as usize;
    }
    diff == 0
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("missing or invalid API key")]
    Forbidden,
    #[error("unsupported audio format: {0:?} (allowed: mp3, wav, m4a, ogg, oga)")]
    UnsupportedFormat(String),
    #[error("audio payload is empty")]
    EmptyPayload,
}

/// What the store needs to persist an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
    pub extension: String,
    pub original_name: Option<String>,
}

/// Validate `request` against `policy`.
pub fn validate(policy: &AuthPolicy, request: &TranscriptionRequest) -> Result<ValidatedUpload, Rejection> {
    if !policy.permits(request.credential.as_deref()) {
        return Err(Rejection::Forbidden);
    }

    let upload = match &request.source {
        AudioSource::Multipart { filename, .. } => {
            let extension = allowed_extension(filename)
                .ok_or_else(|| Rejection::UnsupportedFormat(filename.clone()))?;
            ValidatedUpload {
                extension: extension.to_string(),
                original_name: Some(filename.clone()),
            }
        }
        AudioSource::RawBody { content_type, .. } => ValidatedUpload {
            extension: content_type
                .as_deref()
                .and_then(extension_for_content_type)
                .unwrap_or(DEFAULT_RAW_EXTENSION)
                .to_string(),
            original_name: None,
        },
    };

    if request.source.bytes().is_empty() {
        return Err(Rejection::EmptyPayload);
    }

    Ok(upload)
}

fn allowed_extension(filename: &str) -> Option<&'static str> {
    let (_, suffix) = filename.rsplit_once('.')?;
    ALLOWED_EXTENSIONS
        .iter()
        .copied()
        .find(|allowed| allowed.eq_ignore_ascii_case(suffix))
}

/// Map an audio MIME type to a file extension the decoder can hint on.
fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next()?.trim().to_ascii_lowercase();
    match essence.as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/wav" | "audio/wave" | "audio/x-wav" | "audio/vnd.wave" => Some("wav"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/ogg" | "application/ogg" | "audio/opus" => Some("ogg"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "audio/webm" => Some("webm"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipart(filename: &str, bytes: &'static [u8]) -> TranscriptionRequest {
        TranscriptionRequest {
            source: AudioSource::Multipart { bytes: Bytes::from_static(bytes), filename: filename.to_string() },
            credential: None,
        }
    }

    fn raw(content_type: Option<&str>, bytes: &'static [u8]) -> TranscriptionRequest {
        TranscriptionRequest {
            source: AudioSource::RawBody {
                bytes: Bytes::from_static(bytes),
                content_type: content_type.map(str::to_string),
            },
            credential: None,
        }
    }

    #[test]
    fn test_allowed_extensions_pass() {
        let open = AuthPolicy::default();
        for name in ["a.mp3", "b.wav", "c.m4a", "d.ogg", "voice.note.oga", "LOUD.WAV"] {
            let upload = validate(&open, &multipart(name, b"data")).unwrap();
            assert_eq!(upload.original_name.as_deref(), Some(name));
        }
        assert_eq!(validate(&open, &multipart("LOUD.WAV", b"x")).unwrap().extension, "wav");
    }

    #[test]
    fn test_other_extensions_are_rejected() {
        let open = AuthPolicy::default();
        for name in ["clip.txt", "clip", "clip.wav.exe", "", "mp3"] {
            assert_eq!(
                validate(&open, &multipart(name, b"data")),
                Err(Rejection::UnsupportedFormat(name.to_string()))
            );
        }
    }

    #[test]
    fn test_empty_payload_is_rejected_in_both_modes() {
        let open = AuthPolicy::default();
        assert_eq!(validate(&open, &multipart("a.wav", b"")), Err(Rejection::EmptyPayload));
        assert_eq!(validate(&open, &raw(None, b"")), Err(Rejection::EmptyPayload));
    }

    #[test]
    fn test_raw_body_skips_format_check() {
        let open = AuthPolicy::default();
        assert_eq!(validate(&open, &raw(None, b"data")).unwrap().extension, DEFAULT_RAW_EXTENSION);
        assert_eq!(validate(&open, &raw(Some("audio/mpeg"), b"data")).unwrap().extension, "mp3");
        assert_eq!(validate(&open, &raw(Some("audio/wav; codecs=1"), b"data")).unwrap().extension, "wav");
        assert_eq!(
            validate(&open, &raw(Some("application/octet-stream"), b"data")).unwrap().extension,
            DEFAULT_RAW_EXTENSION
        );
        assert!(validate(&open, &raw(None, b"data")).unwrap().original_name.is_none());
    }

    #[test]
    fn test_auth_runs_first() {
        let locked = AuthPolicy::new(Some("s3cret".to_string()));

        // A bad extension from an unauthenticated caller is still a 403
        assert_eq!(validate(&locked, &multipart("clip.txt", b"data")), Err(Rejection::Forbidden));

        let mut request = multipart("a.wav", b"data");
        request.credential = Some("wrong".to_string());
        assert_eq!(validate(&locked, &request), Err(Rejection::Forbidden));

        request.credential = Some("s3cret".to_string());
        assert!(validate(&locked, &request).is_ok());
    }

    #[test]
    fn test_policy_without_secret_permits_everything() {
        let open = AuthPolicy::new(Some(String::new()));
        assert!(!open.is_enabled());
        assert!(open.permits(None));
        assert!(open.permits(Some("anything")));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"abc", b""));
        assert!(format!("{:?}", AuthPolicy::new(Some("s3cret".into()))).contains("enabled: true"));
    }
}
