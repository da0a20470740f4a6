//! Image part resolution for multimodal requests.
//!
//! `data:` and `http(s):` URLs pass through untouched. Filesystem paths
//! (absolute, or relative resolved against the request's `image_directory`)
//! are loaded, downscaled when they exceed the configured size budget, and
//! embedded as base64 `data:` URLs.

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::request::{ContentPart, Message, MessageContent};

/// Rewrite every image part of `messages` in place.
pub fn resolve_image_parts(
    messages: &mut [Message],
    image_directory: Option<&Path>,
    max_size_kb: u64,
) -> Result<()> {
    for message in messages.iter_mut() {
        let MessageContent::Parts(parts) = &mut message.content else {
            continue;
        };
        for part in parts.iter_mut() {
            let ContentPart::ImageUrl { image_url } = part else {
                continue;
            };
            let url = image_url.url.as_str();
            if url.starts_with("data:") || url.starts_with("http:") || url.starts_with("https:") {
                continue;
            }

            let path = resolve_path(url, image_directory);
            image_url.url = file_to_data_url(&path, max_size_kb).with_context(|| {
                format!("failed to resolve image part: {}", path.display())
            })?;
        }
    }
    Ok(())
}

fn resolve_path(url: &str, image_directory: Option<&Path>) -> PathBuf {
    let raw = Path::new(url);
    if raw.is_absolute() {
        return raw.to_path_buf();
    }
    match image_directory {
        Some(dir) => dir.join(raw),
        None => {
            warn!("relative image path '{url}' without image_directory");
            raw.to_path_buf()
        }
    }
}

/// Load a file and return it as a base64 `data:` URL, downscaling images
/// that exceed `max_size_kb`.
pub fn file_to_data_url(path: &Path, max_size_kb: u64) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read image file: {}", path.display()))?;
    if bytes.is_empty() {
        bail!("image file is empty: {}", path.display());
    }

    let max_bytes = (max_size_kb as usize).saturating_mul(1024);
    if bytes.len() <= max_bytes {
        return Ok(data_url(mime_for(path), &bytes));
    }

    debug!(
        "downscaling {} ({} bytes > {} KiB budget)",
        path.display(),
        bytes.len(),
        max_size_kb
    );
    let downscaled = downscale(&bytes, max_bytes)
        .with_context(|| format!("failed to downscale image: {}", path.display()))?;
    Ok(data_url("image/jpeg", &downscaled))
}

/// Iteratively shrink dimensions until the JPEG encoding fits the budget.
fn downscale(bytes: &[u8], max_bytes: usize) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes).context("failed to decode image")?;
    let (mut width, mut height) = (img.width(), img.height());

    for _ in 0..6 {
        let scale = ((max_bytes as f64) / (bytes.len() as f64)).sqrt().min(0.9);
        width = ((f64::from(width) * scale) as u32).max(16);
        height = ((f64::from(height) * scale) as u32).max(16);

        let resized = img.thumbnail(width, height);
        let mut out = Cursor::new(Vec::new());
        resized
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .context("failed to encode resized image")?;
        let encoded = out.into_inner();
        if encoded.len() <= max_bytes {
            return Ok(encoded);
        }
    }
    bail!("image could not be reduced below {max_bytes} bytes");
}

fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ImageUrl;

    fn png_fixture(dir: &Path, name: &str) -> PathBuf {
        // 1x1 white pixel, written through the image crate so the bytes are
        // a real decodable PNG.
        let path = dir.join(name);
        let img = image::RgbImage::from_pixel(1, 1, image::Rgb([255, 255, 255]));
        img.save_with_format(&path, image::ImageFormat::Png).unwrap();
        path
    }

    #[test]
    fn passthrough_urls_untouched() {
        let mut messages = vec![Message::user(MessageContent::Parts(vec![
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://example.com/cat.png".into(),
                    detail: None,
                },
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".into(),
                    detail: None,
                },
            },
        ]))];
        resolve_image_parts(&mut messages, None, 500).unwrap();
        let MessageContent::Parts(parts) = &messages[0].content else {
            panic!("expected parts");
        };
        let ContentPart::ImageUrl { image_url } = &parts[0] else {
            panic!("expected image");
        };
        assert_eq!(image_url.url, "https://example.com/cat.png");
    }

    #[test]
    fn relative_path_resolves_against_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        png_fixture(tmp.path(), "pic.png");

        let mut messages = vec![Message::user(MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what is this".into(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "pic.png".into(),
                    detail: None,
                },
            },
        ]))];
        resolve_image_parts(&mut messages, Some(tmp.path()), 500).unwrap();

        let MessageContent::Parts(parts) = &messages[0].content else {
            panic!("expected parts");
        };
        let ContentPart::ImageUrl { image_url } = &parts[1] else {
            panic!("expected image");
        };
        assert!(image_url.url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut messages = vec![Message::user(MessageContent::Parts(vec![
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "/nonexistent/image.png".into(),
                    detail: None,
                },
            },
        ]))];
        assert!(resolve_image_parts(&mut messages, None, 500).is_err());
    }

    #[test]
    fn oversize_image_is_downscaled_to_jpeg() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("big.png");
        // Noise compresses poorly, guaranteeing the file exceeds a 1 KiB budget.
        let img = image::RgbImage::from_fn(256, 256, |x, y| {
            image::Rgb([(x % 255) as u8, (y % 255) as u8, ((x * y) % 255) as u8])
        });
        img.save_with_format(&path, image::ImageFormat::Png).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 1024);

        let url = file_to_data_url(&path, 1).unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn text_only_messages_are_untouched() {
        let mut messages = vec![Message::user("plain text")];
        resolve_image_parts(&mut messages, None, 500).unwrap();
        assert_eq!(messages[0].text(), "plain text");
    }
}
