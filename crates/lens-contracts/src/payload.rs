use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::AnalyzeError;
use crate::media::{detect_media_type, MediaType};

/// One block of multimodal message content, in the upstream wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: MediaType,
    pub data: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn base64_image(bytes: &[u8], media_type: MediaType) -> Self {
        Self::Image {
            source: ImageSource {
                source_type: "base64".to_string(),
                media_type,
                data: BASE64.encode(bytes),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text.as_str()),
            Self::Image { .. } => None,
        }
    }
}

/// Builds `[text, image]` content for a user question about an image whose
/// format is already known.
pub fn encode_user_content(
    bytes: &[u8],
    media_type: MediaType,
    question: &str,
) -> Result<Vec<ContentBlock>, AnalyzeError> {
    let question = question.trim();
    if question.is_empty() {
        return Err(AnalyzeError::EmptyQuestion);
    }
    Ok(vec![
        ContentBlock::text(question),
        ContentBlock::base64_image(bytes, media_type),
    ])
}

/// Same as [`encode_user_content`] but runs format detection first, so the
/// media type in the payload always comes from the bytes themselves.
pub fn encode_image_content(
    bytes: &[u8],
    filename_hint: Option<&str>,
    question: &str,
) -> Result<Vec<ContentBlock>, AnalyzeError> {
    if question.trim().is_empty() {
        return Err(AnalyzeError::EmptyQuestion);
    }
    let detection = detect_media_type(bytes, filename_hint)?;
    encode_user_content(bytes, detection.media_type, question)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use base64::Engine as _;
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::json;

    use super::*;

    fn png_bytes() -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbImage::from_pixel(8, 8, Rgb([0, 128, 255]))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn content_is_text_then_image() {
        let blocks = encode_user_content(b"raw", MediaType::Jpeg, "  What is this?  ").unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].as_text(), Some("What is this?"));
        assert_eq!(
            serde_json::to_value(&blocks[1]).unwrap(),
            json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": "image/jpeg",
                    "data": "cmF3",
                }
            })
        );
    }

    #[test]
    fn blank_question_is_rejected() {
        assert_eq!(
            encode_user_content(b"raw", MediaType::Png, " \t\n"),
            Err(AnalyzeError::EmptyQuestion)
        );
        assert_eq!(
            encode_image_content(b"raw", Some("notes.txt"), "   "),
            Err(AnalyzeError::EmptyQuestion)
        );
    }

    #[test]
    fn detection_runs_before_encoding_and_full_buffer_is_encoded() {
        let png = png_bytes();
        let blocks = encode_image_content(&png, Some("mislabeled.jpg"), "Colors?").unwrap();
        let ContentBlock::Image { source } = &blocks[1] else {
            panic!("expected image block");
        };
        assert_eq!(source.media_type, MediaType::Png);
        let decoded = BASE64.decode(&source.data).unwrap();
        assert_eq!(decoded, png);
    }

    #[test]
    fn unsupported_format_propagates() {
        let err = encode_image_content(b"plain text", Some("notes.txt"), "What?").unwrap_err();
        assert_eq!(err.kind(), "unsupported_format");
    }

    #[test]
    fn text_block_wire_shape() {
        assert_eq!(
            serde_json::to_value(ContentBlock::text("hi")).unwrap(),
            json!({"type": "text", "text": "hi"})
        );
    }
}
