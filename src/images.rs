use std::io::Cursor;

use image::{imageops::FilterType, ImageFormat, ImageReader};

/// Thumbnail geometry: bounded preview, covering fit
pub const THUMB_WIDTH: u32 = 480;
pub const THUMB_HEIGHT: u32 = 320;

/// Render a covering-fit lossy preview of an image.
///
/// The source is scaled to fill `width`x`height` and center-cropped, so the
/// preview has a fixed aspect ratio regardless of the input.
pub fn thumbnail(file: &[u8], width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
    let cursor = Cursor::new(file);

    let image_reader = ImageReader::new(cursor).with_guessed_format()?;
    let decoded = image_reader.decode()?;

    let image_buf = decoded.resize_to_fill(width, height, FilterType::Lanczos3);

    let mut bytes = Vec::new();
    image_buf.write_to(&mut Cursor::new(&mut bytes), ImageFormat::WebP)?;

    Ok(bytes)
}

/// Pixel dimensions of an encoded image without a full decode.
pub fn dimensions(file: &[u8]) -> anyhow::Result<(u32, u32)> {
    let cursor = Cursor::new(file);
    let reader = ImageReader::new(cursor).with_guessed_format()?;
    Ok(reader.into_dimensions()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_png(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(w, h, image::Rgba([10, 120, 200, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_thumbnail_has_cover_geometry() {
        let src = sample_png(1000, 400);
        let thumb = thumbnail(&src, THUMB_WIDTH, THUMB_HEIGHT).unwrap();

        let (w, h) = dimensions(&thumb).unwrap();
        assert_eq!((w, h), (THUMB_WIDTH, THUMB_HEIGHT));
    }

    #[test]
    fn test_thumbnail_of_garbage_fails() {
        assert!(thumbnail(b"definitely not an image", 480, 320).is_err());
    }

    #[test]
    fn test_dimensions() {
        let src = sample_png(64, 48);
        assert_eq!(dimensions(&src).unwrap(), (64, 48));
    }
}
