use std::fmt;
use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use image::{ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};

use crate::error::AnalyzeError;

/// Image encodings the upstream model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/webp")]
    Webp,
}

impl MediaType {
    pub fn as_mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }

    pub fn from_mime(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn from_filename(name: &str) -> Option<Self> {
        let ext = Path::new(name.trim())
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::WebP => Some(Self::Webp),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    Header,
    Extension,
}

impl DetectionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Extension => "extension",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub media_type: MediaType,
    pub source: DetectionSource,
}

enum HeaderSniff {
    Supported(MediaType),
    Unsupported(ImageFormat),
    Undecodable,
}

/// Determines the real encoding of `bytes`.
///
/// The decoded header wins over everything else. A signature of any other
/// image format is rejected outright. The filename extension is consulted
/// only when no signature matches or a PNG/JPEG/WEBP one fails to decode. A
/// client-declared MIME type never takes part in the decision; see
/// [`declared_mime_mismatch`].
pub fn detect_media_type(
    bytes: &[u8],
    filename_hint: Option<&str>,
) -> Result<Detection, AnalyzeError> {
    let name = filename_hint
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("upload");

    match sniff_header(bytes) {
        HeaderSniff::Supported(media_type) => {
            return Ok(Detection {
                media_type,
                source: DetectionSource::Header,
            });
        }
        HeaderSniff::Unsupported(format) => {
            return Err(AnalyzeError::unsupported(
                name,
                format!("image data is {format:?}; expected PNG, JPEG or WEBP"),
            ));
        }
        HeaderSniff::Undecodable => {}
    }

    if let Some(media_type) = filename_hint.and_then(MediaType::from_filename) {
        return Ok(Detection {
            media_type,
            source: DetectionSource::Extension,
        });
    }

    Err(AnalyzeError::unsupported(
        name,
        "image header is not decodable and the extension is not .png, .jpg, .jpeg or .webp",
    ))
}

/// Describes the disagreement between a declared MIME type and the detected
/// one, if any. Unknown declarations count as a mismatch.
pub fn declared_mime_mismatch(declared: Option<&str>, detected: MediaType) -> Option<String> {
    let declared = declared.map(str::trim).filter(|value| !value.is_empty())?;
    match MediaType::from_mime(declared) {
        Some(media_type) if media_type == detected => None,
        _ => Some(format!(
            "declared type '{declared}' does not match image data ({detected})"
        )),
    }
}

/// Raw upload as received from the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub name: String,
    pub bytes: Vec<u8>,
    pub declared_mime: Option<String>,
}

impl ImageUpload {
    /// Reads a local file. The declared type is guessed from the extension,
    /// the way a browser file picker labels uploads.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read image {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            name,
            bytes,
            declared_mime: mime_for_path(path).map(str::to_string),
        })
    }
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

fn sniff_header(bytes: &[u8]) -> HeaderSniff {
    let Ok(format) = image::guess_format(bytes) else {
        return HeaderSniff::Undecodable;
    };
    // A foreign signature is rejected even when this build cannot decode it.
    let Some(media_type) = MediaType::from_image_format(format) else {
        return HeaderSniff::Unsupported(format);
    };
    // The cursor borrows the slice, so the caller's buffer is never advanced.
    let decodes = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .is_ok();
    if decodes {
        HeaderSniff::Supported(media_type)
    } else {
        HeaderSniff::Undecodable
    }
}
