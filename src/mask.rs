//! Turning a model mask into something that can be displayed.

use crate::segmentation::Mask;
use image::{GrayImage, Luma};
use rayon::prelude::*;

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// Binary grayscale image with the mask's dimensions: 255 where the mask is
/// set, 0 elsewhere.
pub fn render(mask: &Mask) -> GrayImage {
    let pixels: Vec<u8> = mask
        .data
        .par_iter()
        .map(|&on| if on { FOREGROUND } else { BACKGROUND })
        .collect();
    GrayImage::from_raw(mask.width, mask.height, pixels)
        .unwrap_or_else(|| GrayImage::from_pixel(mask.width, mask.height, Luma([BACKGROUND])))
}

/// Upload-ready RGBA copy of a rendered mask (gray replicated, opaque).
pub fn to_color_image(gray: &GrayImage) -> egui::ColorImage {
    let rgba: Vec<u8> = gray
        .as_raw()
        .par_iter()
        .flat_map_iter(|&v| [v, v, v, 255])
        .collect();
    egui::ColorImage::from_rgba_unmultiplied([gray.width() as usize, gray.height() as usize], &rgba)
}

/// RGBA copy of the source image for the canvas texture.
pub fn rgb_to_color_image(rgb: &image::RgbImage) -> egui::ColorImage {
    egui::ColorImage::from_rgb([rgb.width() as usize, rgb.height() as usize], rgb.as_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_mask_is_binary_with_same_size() {
        let mask = Mask::new(3, 2, vec![true, false, false, false, true, true]).unwrap();
        let img = render(&mask);
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.as_raw(), &vec![255, 0, 0, 0, 255, 255]);
        assert!(img.as_raw().iter().all(|&v| v == 0 || v == 255));
    }

    #[test]
    fn empty_mask_renders_black() {
        let img = render(&Mask::empty(4, 4));
        assert!(img.pixels().all(|p| p.0[0] == BACKGROUND));
    }

    #[test]
    fn color_image_replicates_gray() {
        let mask = Mask::new(2, 1, vec![true, false]).unwrap();
        let color = to_color_image(&render(&mask));
        assert_eq!(color.size, [2, 1]);
        assert_eq!(color.pixels[0], egui::Color32::WHITE);
        assert_eq!(color.pixels[1], egui::Color32::BLACK);
    }
}
