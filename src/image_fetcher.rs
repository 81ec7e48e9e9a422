//! Downloads image attachments and encodes them for the ACP image block.
//!
//! Grounded on `ncat/image_utils.py`: prefers the response's `Content-Type`
//! header, falls back to a URL-extension guess, then `image/png`. There is
//! no `mimetypes.guess_type` equivalent in the crate ecosystem reachable
//! here, so the extension table below is hand-rolled and intentionally
//! small — just the formats OneBot/NapCat actually send.

use std::time::Duration;

use base64::Engine;
use tracing::warn;

/// A downloaded image, ready to embed in an ACP image content block.
pub struct DownloadedImage {
    pub base64: String,
    pub mime: String,
}

fn normalize_content_type(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next()?.trim().to_lowercase();
    if mime.is_empty() {
        None
    } else {
        Some(mime)
    }
}

fn guess_mime_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('.').next()?.to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

/// Downloads `url`, returning `None` on any network/HTTP error so the
/// caller can fall back to embedding the URL as text.
pub async fn download_image(client: &reqwest::Client, url: &str, timeout: Duration) -> Option<DownloadedImage> {
    let response = match client.get(url).timeout(timeout).send().await {
        Ok(resp) => resp,
        Err(err) => {
            warn!(url, error = %err, "failed to download image, falling back to URL");
            return None;
        }
    };

    let response = match response.error_for_status() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(url, error = %err, "image download returned an error status");
            return None;
        }
    };

    let mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(normalize_content_type)
        .or_else(|| guess_mime_from_url(url).map(str::to_string))
        .unwrap_or_else(|| "image/png".to_string());

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(url, error = %err, "failed to read image body, falling back to URL");
            return None;
        }
    };

    let base64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    Some(DownloadedImage { base64, mime })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_content_type_with_charset() {
        assert_eq!(
            normalize_content_type("image/jpeg; charset=binary"),
            Some("image/jpeg".to_string())
        );
    }

    #[test]
    fn empty_content_type_is_none() {
        assert_eq!(normalize_content_type("   "), None);
    }

    #[test]
    fn guesses_mime_from_extension() {
        assert_eq!(guess_mime_from_url("http://x.com/a.PNG"), Some("image/png"));
        assert_eq!(
            guess_mime_from_url("http://x.com/a.jpeg?size=large"),
            Some("image/jpeg")
        );
        assert_eq!(guess_mime_from_url("http://x.com/a.unknownext"), None);
    }
}
