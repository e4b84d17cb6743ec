use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use fusion_contracts::{FusionError, Result};
use image::ImageFormat;
use reqwest::blocking::Client as HttpClient;
use tracing::{debug, warn};
use url::Url;

use crate::client::truncate_text;

const BASE64_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    Url(Url),
    Base64(String),
}

impl ImagePayload {
    /// Absolute http(s) URLs are fetched; anything else is base64.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match Url::parse(trimmed) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Url(url),
            _ => Self::Base64(trimmed.to_string()),
        }
    }
}

pub fn decode_base64(raw: &str) -> Result<Vec<u8>> {
    let mut body = raw.trim();
    let is_data_uri = body
        .get(..10)
        .map(|head| head.eq_ignore_ascii_case("data:image"))
        .unwrap_or(false);
    if is_data_uri {
        body = body
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| FusionError::Format("data URI has no payload".to_string()))?;
    }
    let compact: String = body.chars().filter(|ch| !ch.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(FusionError::Format("empty image payload".to_string()));
    }
    let bytes = BASE64_LENIENT.decode(compact.as_bytes()).map_err(|err| {
        FusionError::Format(format!(
            "invalid base64 ({err}): {}",
            truncate_text(&compact, 48)
        ))
    })?;
    if bytes.is_empty() {
        return Err(FusionError::Format("decoded image is empty".to_string()));
    }
    Ok(bytes)
}

/// File extension for image bytes, `png` when the format is not recognized.
pub fn sniff_extension(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(ImageFormat::WebP) => "webp",
        Ok(ImageFormat::Gif) => "gif",
        _ => "png",
    }
}

pub struct Materializer {
    http: HttpClient,
}

impl Materializer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FusionError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { http })
    }

    pub fn fetch_bytes(&self, payload: &ImagePayload) -> Result<Vec<u8>> {
        match payload {
            ImagePayload::Base64(raw) => decode_base64(raw),
            ImagePayload::Url(url) => self.download(url),
        }
    }

    pub fn materialize(&self, payload: &ImagePayload, destination: &Path) -> Result<PathBuf> {
        let bytes = self.fetch_bytes(payload)?;
        write_bytes(destination, &bytes)?;
        Ok(destination.to_path_buf())
    }

    /// Saves every file as `<dir>/image_<n>.<ext>`, one result per file.
    /// A failed image does not stop the ones after it. Once `cancel` is
    /// raised the remaining files are skipped as `Cancelled`.
    pub fn persist_all(
        &self,
        files: &[String],
        dir: &Path,
        cancel: &AtomicBool,
    ) -> Vec<Result<PathBuf>> {
        files
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                if cancel.load(Ordering::SeqCst) {
                    return Err(FusionError::Cancelled);
                }
                let saved = self.fetch_bytes(&ImagePayload::parse(raw)).and_then(|bytes| {
                    let path = dir.join(format!("image_{}.{}", index + 1, sniff_extension(&bytes)));
                    write_bytes(&path, &bytes)?;
                    Ok(path)
                });
                match &saved {
                    Ok(path) => debug!(path = %path.display(), "image saved"),
                    Err(err) => warn!(index, error = %err, "image could not be saved"),
                }
                saved
            })
            .collect()
    }

    fn download(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url.as_str())
            .send()
            .map_err(|err| FusionError::network(format!("image download failed ({url}): {err}")))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(FusionError::http_status(
                code,
                format!("image download failed: {}", truncate_text(&body, 512)),
            ));
        }
        let bytes = response
            .bytes()
            .map_err(|err| FusionError::network(format!("failed reading image bytes: {err}")))?;
        Ok(bytes.to_vec())
    }
}

pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| FusionError::io(parent, err))?;
    }
    fs::write(path, bytes).map_err(|err| FusionError::io(path, err))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use fusion_contracts::FusionError;
    use httpmock::prelude::*;

    use super::{decode_base64, sniff_extension, ImagePayload, Materializer};
    use crate::testing::{png_base64, png_bytes};

    fn materializer() -> anyhow::Result<Materializer> {
        Ok(Materializer::new(Duration::from_secs(5))?)
    }

    #[test]
    fn data_uri_prefix_and_whitespace_are_ignored() -> anyhow::Result<()> {
        let plain = png_base64();
        let prefixed = format!("data:image/png;base64,{plain}");
        let wrapped: String = plain
            .as_bytes()
            .chunks(16)
            .map(|chunk| String::from_utf8_lossy(chunk).to_string())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(decode_base64(&plain)?, png_bytes());
        assert_eq!(decode_base64(&prefixed)?, png_bytes());
        assert_eq!(decode_base64(&wrapped)?, png_bytes());
        Ok(())
    }

    #[test]
    fn missing_padding_is_tolerated() -> anyhow::Result<()> {
        assert_eq!(decode_base64("aGk")?, b"hi".to_vec());
        assert_eq!(decode_base64("aGk=")?, b"hi".to_vec());
        Ok(())
    }

    #[test]
    fn undecodable_or_empty_payload_is_a_format_error() {
        assert!(matches!(decode_base64("***not base64***"), Err(FusionError::Format(_))));
        assert!(matches!(decode_base64("   "), Err(FusionError::Format(_))));
        assert!(matches!(
            decode_base64("data:image/png;base64,"),
            Err(FusionError::Format(_))
        ));
    }

    #[test]
    fn payload_classification() {
        assert!(matches!(
            ImagePayload::parse("https://cdn.example.com/a.png"),
            ImagePayload::Url(_)
        ));
        assert!(matches!(ImagePayload::parse("aGk="), ImagePayload::Base64(_)));
        assert!(matches!(
            ImagePayload::parse("ftp://example.com/a.png"),
            ImagePayload::Base64(_)
        ));
    }

    #[test]
    fn url_payload_is_fetched_once_and_written_verbatim() -> anyhow::Result<()> {
        let server = MockServer::start();
        let body = png_bytes();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/img/1.png");
            then.status(200).body(body.clone());
        });
        let temp = tempfile::tempdir()?;
        let dest = temp.path().join("nested").join("out.png");

        let payload = ImagePayload::parse(&server.url("/img/1.png"));
        let written = materializer()?.materialize(&payload, &dest)?;
        mock.assert();
        assert_eq!(written, dest);
        assert_eq!(fs::read(&dest)?, png_bytes());
        Ok(())
    }

    #[test]
    fn url_error_status_is_a_network_error() -> anyhow::Result<()> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/gone.png");
            then.status(404).body("missing");
        });
        let payload = ImagePayload::parse(&server.url("/gone.png"));
        let err = materializer()?.fetch_bytes(&payload).err();
        assert!(matches!(err, Some(FusionError::Network { status: Some(404), .. })));
        Ok(())
    }

    #[test]
    fn persist_all_keeps_going_after_a_bad_image() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path().join("task-1");
        let files = vec![png_base64(), "@@@".to_string(), png_base64()];

        let saved = materializer()?.persist_all(&files, &dir, &AtomicBool::new(false));
        assert_eq!(saved.len(), 3);
        assert_eq!(saved[0].as_ref().ok(), Some(&dir.join("image_1.png")));
        assert!(matches!(saved[1], Err(FusionError::Format(_))));
        assert_eq!(saved[2].as_ref().ok(), Some(&dir.join("image_3.png")));
        assert_eq!(fs::read(dir.join("image_3.png"))?, png_bytes());
        Ok(())
    }

    #[test]
    fn raised_cancel_flag_skips_remaining_downloads() -> anyhow::Result<()> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/img/1.png");
            then.status(200).body(png_bytes());
        });
        let temp = tempfile::tempdir()?;
        let files = vec![server.url("/img/1.png"), server.url("/img/1.png")];

        let saved = materializer()?.persist_all(&files, temp.path(), &AtomicBool::new(true));
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().all(|item| matches!(item, Err(FusionError::Cancelled))));
        mock.assert_calls(0);
        assert!(!temp.path().join("image_1.png").exists());
        Ok(())
    }

    #[test]
    fn extension_is_sniffed_from_bytes() {
        assert_eq!(sniff_extension(&png_bytes()), "png");
        assert_eq!(sniff_extension(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), "jpg");
        assert_eq!(sniff_extension(b"plain text"), "png");
    }
}
