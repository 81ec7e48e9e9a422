//! Builds the ordered ACP content blocks for a `session/prompt` call.
//!
//! Grounded on `ncat/converter.py`'s `build_prompt_blocks` /
//! `_replace_image_placeholders`: a leading text block carries the context
//! header plus the body with `"[image]"` placeholders resolved, followed by
//! one image block per successfully downloaded attachment (only when the
//! agent's `supportsImage` flag is set).

use agent_client_protocol as acp;
use tracing::warn;

use crate::converter::{build_context_header, ParsedMessage, IMAGE_PLACEHOLDER};
use crate::image_fetcher::DownloadedImage;

/// Replaces each `"[image]"` placeholder in `text` with the matching entry
/// in `replacements`, in order. Surplus attachments are appended as extra
/// lines; surplus placeholders are left in the text literally.
fn replace_image_placeholders(text: &str, replacements: &[String]) -> String {
    if replacements.is_empty() {
        return text.to_string();
    }

    let placeholder_count = text.matches(IMAGE_PLACEHOLDER).count();
    if placeholder_count > replacements.len() {
        warn!(
            placeholder_count,
            attachment_count = replacements.len(),
            "more image placeholders than attachments"
        );
    }

    let mut out = String::new();
    let mut rest = text;
    let mut used = 0;
    while used < replacements.len() {
        match rest.find(IMAGE_PLACEHOLDER) {
            Some(idx) => {
                out.push_str(&rest[..idx]);
                out.push_str(&replacements[used]);
                used += 1;
                rest = &rest[idx + IMAGE_PLACEHOLDER.len()..];
            }
            None => break,
        }
    }
    out.push_str(rest);

    if used < replacements.len() {
        let extra = replacements[used..].join("\n");
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&extra);
        warn!(
            placeholder_count,
            attachment_count = replacements.len(),
            "more attachments than image placeholders, appended extras"
        );
    }

    out
}

/// Builds the content blocks to send as `session/prompt` params.
///
/// `downloaded_images` must be the same length and order as
/// `parsed.images`, with `None` for attachments that failed to download.
pub fn build_prompt_blocks(
    parsed: &ParsedMessage,
    downloaded_images: &[Option<DownloadedImage>],
    agent_supports_image: bool,
) -> Vec<acp::ContentBlock> {
    let mut replacements = Vec::with_capacity(parsed.images.len());
    for (i, attachment) in parsed.images.iter().enumerate() {
        let downloaded = downloaded_images.get(i).and_then(Option::as_ref);
        if agent_supports_image && downloaded.is_some() {
            replacements.push(IMAGE_PLACEHOLDER.to_string());
            continue;
        }
        let url = attachment.url.trim();
        if url.is_empty() {
            replacements.push(IMAGE_PLACEHOLDER.to_string());
        } else {
            replacements.push(format!("[image url={url}]"));
        }
    }

    let body = replace_image_placeholders(&parsed.text, &replacements);
    let header = build_context_header(parsed);

    let mut blocks = vec![acp::ContentBlock::Text(acp::TextContent::new(format!(
        "{header}\n{body}"
    )))];

    if agent_supports_image {
        for downloaded in downloaded_images.iter().flatten() {
            blocks.push(acp::ContentBlock::Image(acp::ImageContent {
                data: downloaded.base64.clone(),
                mime_type: downloaded.mime.clone(),
                uri: None,
                annotations: None,
                meta: None,
            }));
        }
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{ChatKind, ImageAttachment};

    fn parsed(text: &str, images: Vec<ImageAttachment>) -> ParsedMessage {
        ParsedMessage {
            chat_id: "private:1".to_string(),
            kind: ChatKind::Private,
            text: text.to_string(),
            is_at_bot: false,
            sender_name: "alice".to_string(),
            sender_id: 1,
            group_name: None,
            images,
        }
    }

    #[test]
    fn no_images_yields_single_text_block() {
        let msg = parsed("hello", vec![]);
        let blocks = build_prompt_blocks(&msg, &[], true);
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            acp::ContentBlock::Text(text) => {
                assert_eq!(text.text, "[Private chat, user alice(1)]\nhello");
            }
            other => panic!("expected text block, got {other:?}"),
        }
    }

    #[test]
    fn downloaded_image_kept_as_placeholder_and_appended_as_block() {
        let msg = parsed(
            &format!("look {IMAGE_PLACEHOLDER}"),
            vec![ImageAttachment { url: "http://x/a.png".to_string() }],
        );
        let downloaded = vec![Some(DownloadedImage {
            base64: "abc".to_string(),
            mime: "image/png".to_string(),
        })];
        let blocks = build_prompt_blocks(&msg, &downloaded, true);
        assert_eq!(blocks.len(), 2);
        match &blocks[0] {
            acp::ContentBlock::Text(text) => assert!(text.text.ends_with(&format!("look {IMAGE_PLACEHOLDER}"))),
            other => panic!("expected text block, got {other:?}"),
        }
        match &blocks[1] {
            acp::ContentBlock::Image(img) => assert_eq!(img.data, "abc"),
            other => panic!("expected image block, got {other:?}"),
        }
    }

    #[test]
    fn failed_download_falls_back_to_url_in_text() {
        let msg = parsed(
            IMAGE_PLACEHOLDER,
            vec![ImageAttachment { url: "http://x/a.png".to_string() }],
        );
        let blocks = build_prompt_blocks(&msg, &[None], true);
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            acp::ContentBlock::Text(text) => assert!(text.text.contains("[image url=http://x/a.png]")),
            other => panic!("expected text block, got {other:?}"),
        }
    }

    #[test]
    fn agent_without_image_support_never_appends_image_blocks() {
        let msg = parsed(
            IMAGE_PLACEHOLDER,
            vec![ImageAttachment { url: "http://x/a.png".to_string() }],
        );
        let downloaded = vec![Some(DownloadedImage {
            base64: "abc".to_string(),
            mime: "image/png".to_string(),
        })];
        let blocks = build_prompt_blocks(&msg, &downloaded, false);
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn more_attachments_than_placeholders_appends_extra_lines() {
        let msg = parsed(
            "no placeholder here",
            vec![
                ImageAttachment { url: "http://x/a.png".to_string() },
                ImageAttachment { url: "http://x/b.png".to_string() },
            ],
        );
        let blocks = build_prompt_blocks(&msg, &[None, None], true);
        match &blocks[0] {
            acp::ContentBlock::Text(text) => {
                assert!(text.text.contains("[image url=http://x/a.png]"));
                assert!(text.text.contains("[image url=http://x/b.png]"));
            }
            other => panic!("expected text block, got {other:?}"),
        }
    }
}
