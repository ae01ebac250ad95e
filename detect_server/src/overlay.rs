//! Overlay surface and the renderer drawing detections onto it.
//!
use std::{io::Cursor, path::Path};

use anyhow::{anyhow, Result};
use common::detection::Detection;
use image::{DynamicImage, ImageOutputFormat, Rgba, RgbImage, RgbaImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use rusttype::{Font, Scale};

/// Fully transparent pixel the surface is cleared to.
pub const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Stroke width of the box outlines in pixels.
const LINE_WIDTH: u32 = 2;

/// Height of the label text in pixels.
const LABEL_HEIGHT: f32 = 18.0;

const PALETTE: [[u8; 3]; 12] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [255, 0, 255],
    [0, 255, 255],
    [255, 128, 0],
    [255, 0, 128],
    [128, 255, 0],
    [0, 128, 255],
    [255, 255, 255],
    [128, 0, 255],
];

/// A label drawn next to a box.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayLabel {
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub color: Rgba<u8>,
}

/// Transparent drawing area aligned with the video frame.
pub struct OverlaySurface {
    image: RgbaImage,
    labels: Vec<OverlayLabel>,
}

impl OverlaySurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, CLEAR),
            labels: vec![],
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Match the surface to the given dimensions.
    ///
    /// A changed size re-allocates and therefore clears the surface, an unchanged size keeps the
    /// current drawing. Returns whether the surface was re-allocated.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        if self.dimensions() == (width, height) {
            return false;
        }

        log::debug!("Resizing overlay to {}x{}", width, height);
        *self = Self::new(width, height);
        true
    }

    pub fn clear(&mut self) {
        self.image.pixels_mut().for_each(|pixel| *pixel = CLEAR);
        self.labels.clear();
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Labels drawn since the last clear, in drawing order.
    pub fn labels(&self) -> &[OverlayLabel] {
        &self.labels
    }

    /// Blend the surface on top of a video frame.
    pub fn composite(&self, frame: &RgbImage) -> RgbImage {
        let mut base = DynamicImage::ImageRgb8(frame.clone()).into_rgba8();
        image::imageops::overlay(&mut base, &self.image, 0, 0);
        DynamicImage::ImageRgba8(base).into_rgb8()
    }

    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Cursor::new(Vec::new());
        self.image.write_to(&mut buf, ImageOutputFormat::Png)?;
        Ok(buf.into_inner())
    }
}

impl Default for OverlaySurface {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// Draws boxes and labels. Label glyphs are only rasterized when a font is available.
#[derive(Default)]
pub struct OverlayRenderer {
    font: Option<Font<'static>>,
}

impl OverlayRenderer {
    pub fn new(font: Option<Font<'static>>) -> Self {
        Self { font }
    }

    /// Load a TrueType font from disk.
    pub fn load_font(path: impl AsRef<Path>) -> Result<Font<'static>> {
        let font_data = std::fs::read(path.as_ref())?;
        Font::try_from_vec(font_data)
            .ok_or_else(|| anyhow!("invalid font file {}", path.as_ref().display()))
    }

    /// Clear the surface and draw one labeled rectangle per detection.
    pub fn draw(&self, detections: &[Detection], surface: &mut OverlaySurface) {
        surface.clear();

        // Boxes are kept within one surface size around the surface so offsets never overflow
        let (surface_width, surface_height) = surface.dimensions();
        let (max_x, max_y) = (surface_width as f32, surface_height as f32);

        for detection in detections {
            let color = class_color(&detection.class);
            let [x, y, width, height] = detection.bbox;
            let (x, y) = (
                x.clamp(-max_x, max_x).round() as i32,
                y.clamp(-max_y, max_y).round() as i32,
            );
            let (width, height) = (
                width.clamp(1.0, 2.0 * max_x + 1.0).round() as u32,
                height.clamp(1.0, 2.0 * max_y + 1.0).round() as u32,
            );

            for inset in 0..LINE_WIDTH {
                if width <= 2 * inset || height <= 2 * inset {
                    break;
                }
                let rect = Rect::at(x + inset as i32, y + inset as i32)
                    .of_size(width - 2 * inset, height - 2 * inset);
                draw_hollow_rect_mut(&mut surface.image, rect, color);
            }

            // Above the box, or just inside it when the box touches the top edge
            let label_y = if y as f32 >= LABEL_HEIGHT {
                y - LABEL_HEIGHT as i32
            } else {
                y + LINE_WIDTH as i32
            };
            let text = format!("{} {}%", detection.class, detection.percent());

            if let Some(font) = &self.font {
                draw_text_mut(
                    &mut surface.image,
                    color,
                    x,
                    label_y,
                    Scale::uniform(LABEL_HEIGHT),
                    font,
                    &text,
                );
            }

            surface.labels.push(OverlayLabel {
                text,
                x,
                y: label_y,
                color,
            });
        }
    }
}

/// Stable color for a class name.
pub fn class_color(class: &str) -> Rgba<u8> {
    let hash = class
        .bytes()
        .fold(0_usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    let [r, g, b] = PALETTE[hash % PALETTE.len()];
    Rgba([r, g, b, 255])
}
