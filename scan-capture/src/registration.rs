//! Color-to-depth registration.

use image::RgbaImage;
use image::imageops::{self, FilterType};

/// Resample a color frame into depth image space.
///
/// Uses nearest-neighbour sampling. When depth is mirrored during
/// conversion, color is flipped horizontally with it so both stay aligned.
pub fn align_color_to_depth(
    color: &RgbaImage,
    depth_width: u32,
    depth_height: u32,
    mirror_depth: bool,
) -> RgbaImage {
    let mut aligned = if color.dimensions() == (depth_width, depth_height) {
        color.clone()
    } else {
        imageops::resize(color, depth_width, depth_height, FilterType::Nearest)
    };

    if mirror_depth {
        imageops::flip_horizontal_in_place(&mut aligned);
    }
    aligned
}
