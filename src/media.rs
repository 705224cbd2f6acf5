use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("unsupported media reference: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl FetchedMedia {
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64.encode(&self.bytes))
    }
}

/// Resolves an image/video reference (remote URL or data URI) to raw bytes.
/// Callers absorb failures: a reference that cannot be resolved is skipped,
/// never fatal.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia, MediaError>;
}

pub struct HttpMediaFetcher {
    client: Client,
}

impl HttpMediaFetcher {
    pub fn new() -> Self {
        let client = Client::builder().build().expect("reqwest client");
        Self { client }
    }
}

impl Default for HttpMediaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia, MediaError> {
        if url.starts_with("data:") {
            return decode_data_uri(url);
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(MediaError::Unsupported(url.to_string()));
        }
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        let bytes = resp.bytes().await?.to_vec();
        Ok(FetchedMedia { bytes, mime })
    }
}

pub fn decode_data_uri(uri: &str) -> Result<FetchedMedia, MediaError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| MediaError::Unsupported(uri.to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| MediaError::Unsupported(uri.to_string()))?;
    if !header.ends_with(";base64") {
        return Err(MediaError::Unsupported("non-base64 data uri".into()));
    }
    let mime = header.trim_end_matches(";base64");
    let mime = if mime.is_empty() { "text/plain" } else { mime };
    let bytes = BASE64.decode(payload.trim())?;
    Ok(FetchedMedia {
        bytes,
        mime: mime.to_string(),
    })
}

/// Pixel dimensions probed from the encoded header, when the format is known.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    imagesize::blob_size(bytes)
        .ok()
        .map(|s| (s.width as u32, s.height as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base64_data_uri() {
        let media = decode_data_uri("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(media.mime, "image/png");
        assert_eq!(media.bytes, b"hello");
    }

    #[test]
    fn rejects_plain_text_data_uri() {
        assert!(decode_data_uri("data:text/plain,hello").is_err());
    }

    #[test]
    fn data_uri_round_trip() {
        let media = FetchedMedia {
            bytes: b"hello".to_vec(),
            mime: "image/jpeg".into(),
        };
        let again = decode_data_uri(&media.to_data_uri()).unwrap();
        assert_eq!(again.bytes, media.bytes);
        assert_eq!(again.mime, media.mime);
    }

    // Minimal PNG header: signature + IHDR chunk carrying 1024x768.
    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes
    }

    #[test]
    fn probes_png_dimensions() {
        let bytes = png_header(1024, 768);
        assert_eq!(image_dimensions(&bytes), Some((1024, 768)));
    }
}
