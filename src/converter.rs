//! Conversion between OneBot 11 message events and the bridge's internal
//! message/reply representation.
//!
//! Grounded on the original `ncat/converter.py`/`ncat/models.py`: text
//! segments are concatenated, `at` segments are stripped when they target
//! the bot (and otherwise rendered as `@qq`), `image` segments become a
//! `"[image]"` placeholder plus a queued [`ImageAttachment`], and `face`
//! segments become `"[emoji]"`.

use serde_json::{json, Value};

use crate::onebot::MessageEvent;

/// Marker left in parsed text for every image segment, later interleaved
/// back with downloaded image data by the prompt builder.
pub const IMAGE_PLACEHOLDER: &str = "[image]";
const EMOJI_PLACEHOLDER: &str = "[emoji]";

/// A raw image reference extracted from OneBot message segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub url: String,
}

/// One ordered piece of an agent reply: plain text, or an already-encoded
/// image. This is the accumulator unit streamed out of a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPart {
    Text(String),
    Image { base64: String, mime: String },
}

/// The chat a message or reply belongs to: either a private DM or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatKind {
    Private,
    Group,
}

/// Result of parsing an incoming OneBot message event.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    /// `"private:<user_id>"` or `"group:<group_id>"`.
    pub chat_id: String,
    pub kind: ChatKind,
    /// Plain text with `@bot` stripped and images/faces turned into placeholders.
    pub text: String,
    /// Whether the bot was @-mentioned (always `false` for private chats).
    pub is_at_bot: bool,
    pub sender_name: String,
    pub sender_id: i64,
    pub group_name: Option<String>,
    pub images: Vec<ImageAttachment>,
}

/// Parses a raw OneBot `message` event into a [`ParsedMessage`].
pub fn onebot_to_internal(event: &MessageEvent, bot_id: i64) -> ParsedMessage {
    let kind = if event.message_type == "private" {
        ChatKind::Private
    } else {
        ChatKind::Group
    };
    let chat_id = match kind {
        ChatKind::Private => format!("private:{}", event.user_id),
        ChatKind::Group => format!("group:{}", event.group_id.unwrap_or_default()),
    };

    let sender_name = event
        .sender
        .as_ref()
        .and_then(|s| s.card.clone().filter(|c| !c.is_empty()))
        .or_else(|| event.sender.as_ref().and_then(|s| s.nickname.clone()))
        .unwrap_or_else(|| event.user_id.to_string());

    let mut text_parts: Vec<String> = Vec::new();
    let mut is_at_bot = false;
    let mut images = Vec::new();

    for seg in &event.message {
        match seg.seg_type.as_str() {
            "text" => {
                if let Some(text) = seg.data.get("text").and_then(Value::as_str) {
                    text_parts.push(text.to_string());
                }
            }
            "at" => {
                let qq = seg
                    .data
                    .get("qq")
                    .map(value_to_string)
                    .unwrap_or_default();
                if qq == bot_id.to_string() {
                    is_at_bot = true;
                } else {
                    text_parts.push(format!("@{qq}"));
                }
            }
            "image" => {
                text_parts.push(IMAGE_PLACEHOLDER.to_string());
                let url = seg
                    .data
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                images.push(ImageAttachment { url });
            }
            "face" => text_parts.push(EMOJI_PLACEHOLDER.to_string()),
            _ => {}
        }
    }

    ParsedMessage {
        chat_id,
        kind,
        text: text_parts.concat().trim().to_string(),
        is_at_bot,
        sender_name,
        sender_id: event.user_id,
        group_name: event.group_name.clone(),
        images,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string().trim_matches('"').to_string(),
    }
}

/// Builds the `"[Private chat, user NAME(ID)]"` / `"[Group chat NAME(ID),
/// user NAME(ID)]"` header prepended to every prompt sent to the agent.
pub fn build_context_header(parsed: &ParsedMessage) -> String {
    match parsed.kind {
        ChatKind::Private => format!(
            "[Private chat, user {}({})]",
            parsed.sender_name, parsed.sender_id
        ),
        ChatKind::Group => {
            let group_id = parsed.chat_id.split(':').nth(1).unwrap_or_default();
            format!(
                "[Group chat {}({group_id}), user {}({})]",
                parsed.group_name.as_deref().unwrap_or(""),
                parsed.sender_name,
                parsed.sender_id
            )
        }
    }
}

/// Converts ordered [`ReplyPart`]s into OneBot 11 message segments suitable
/// for `send_private_msg`/`send_group_msg`.
///
/// Falls back to a single empty text segment if `parts` produces nothing
/// usable, since OneBot actions require a non-empty segment array.
pub fn reply_parts_to_onebot(parts: &[ReplyPart]) -> Vec<Value> {
    let mut segments = Vec::new();
    for part in parts {
        match part {
            ReplyPart::Text(text) => {
                if !text.is_empty() {
                    segments.push(json!({"type": "text", "data": {"text": text}}));
                }
            }
            ReplyPart::Image { base64, .. } => {
                segments.push(json!({
                    "type": "image",
                    "data": {"file": format!("base64://{base64}")}
                }));
            }
        }
    }
    if segments.is_empty() {
        segments.push(json!({"type": "text", "data": {"text": ""}}));
    }
    segments
}
