//! Construction of user messages from request input.

use crate::message::{ContentPart, ImageUrl, Message, UserContent};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// Builds the user message for a turn.
///
/// Without an image (or with an empty one) the message is plain text. With an
/// image it is multimodal with exactly two parts: the text first, then the
/// image inlined as a base64 data URL.
#[must_use]
pub fn build_user_message(text: &str, image: Option<&[u8]>) -> Message {
    match image {
        Some(bytes) if !bytes.is_empty() => Message::user_content(UserContent::Parts(vec![
            ContentPart::Text {
                text: text.to_string(),
            },
            image_part(bytes),
        ])),
        _ => Message::user(text),
    }
}

/// Encodes raw image bytes as an image content part.
#[must_use]
pub fn image_part(bytes: &[u8]) -> ContentPart {
    ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: format!("data:{};base64,{}", sniff_image_mime(bytes), STANDARD.encode(bytes)),
        },
    }
}

/// Guesses an image MIME type from its magic bytes.
#[must_use]
pub fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        DEFAULT_IMAGE_MIME
    }
}
