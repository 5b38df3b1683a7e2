use exif::{In, Reader, Tag};
use image::DynamicImage;
use std::io::Cursor;

/// EXIF orientation as stored in tag 0x0112. Values outside 1..=8 are
/// treated as upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orientation(pub u32);

impl Orientation {
    pub const UPRIGHT: Orientation = Orientation(1);
}

/// Reads camera orientation so images are compared the way they display.
pub struct ExifService;

impl ExifService {
    pub fn new() -> Self {
        Self
    }

    /// Orientation from an encoded image's EXIF block. Missing or unreadable
    /// metadata yields `None`.
    pub fn orientation(&self, bytes: &[u8]) -> Option<Orientation> {
        let mut cursor = Cursor::new(bytes);
        let exif = match Reader::new().read_from_container(&mut cursor) {
            Ok(exif) => exif,
            Err(_) => return None,
        };
        let field = exif.get_field(Tag::Orientation, In::PRIMARY)?;
        field.value.get_uint(0).map(Orientation)
    }

    /// Rotate or flip `image` upright and drop alpha and extra channels.
    pub fn normalize(&self, image: DynamicImage, orientation: Option<Orientation>) -> DynamicImage {
        let upright = match orientation.unwrap_or(Orientation::UPRIGHT).0 {
            2 => image.fliph(),
            3 => image.rotate180(),
            4 => image.flipv(),
            5 => image.rotate90().fliph(),
            6 => image.rotate90(),
            7 => image.rotate270().fliph(),
            8 => image.rotate270(),
            _ => image,
        };
        DynamicImage::ImageRgb8(upright.to_rgb8())
    }
}

impl Default for ExifService {
    fn default() -> Self {
        Self::new()
    }
}
