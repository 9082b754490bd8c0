//! Outgoing image preparation: decode, downscale and re-encode as JPEG.

use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use chat_core::MediaUpload;
use image::{DynamicImage, ImageFormat, imageops::FilterType};
use tracing::debug;

/// Caps applied to every outgoing image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentLimits {
    pub max_dimension: u32,
    pub max_bytes: usize,
}

/// Read and downscale the image at `path` on the blocking pool.
pub async fn load_attachment(path: PathBuf, limits: AttachmentLimits) -> Result<MediaUpload, String> {
    tokio::task::spawn_blocking(move || {
        let bytes = std::fs::read(&path)
            .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
        prepare_attachment(&file_name_of(&path), &bytes, limits)
    })
    .await
    .map_err(|err| format!("attachment worker failed: {err}"))?
}

/// Decode `bytes`, shrink the image so its longest edge is at most
/// `max_dimension` and encode it as JPEG.
pub fn prepare_attachment(
    file_name: &str,
    bytes: &[u8],
    limits: AttachmentLimits,
) -> Result<MediaUpload, String> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| format!("{file_name} is not a supported image: {err}"))?;
    let (width, height) = (decoded.width(), decoded.height());
    let resized = if width > limits.max_dimension || height > limits.max_dimension {
        decoded.resize(limits.max_dimension, limits.max_dimension, FilterType::Triangle)
    } else {
        decoded
    };

    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut encoded = Cursor::new(Vec::new());
    rgb.write_to(&mut encoded, ImageFormat::Jpeg)
        .map_err(|err| format!("failed encoding {file_name}: {err}"))?;
    let encoded = encoded.into_inner();
    if encoded.len() > limits.max_bytes {
        return Err(format!(
            "{file_name} is {} bytes after downscaling; the limit is {}",
            encoded.len(),
            limits.max_bytes
        ));
    }

    debug!(
        %file_name,
        from = %format!("{width}x{height}"),
        to = %format!("{}x{}", rgb.width(), rgb.height()),
        bytes = encoded.len(),
        "attachment prepared"
    );
    Ok(MediaUpload {
        file_name: jpeg_name(file_name),
        content_type: "image/jpeg".to_owned(),
        bytes: encoded,
    })
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image")
        .to_owned()
}

fn jpeg_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("image");
    format!("{stem}.jpg")
}
