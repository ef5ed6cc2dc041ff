//! The drawing surface scripts paint onto.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, Rgba, RgbaImage};

use crate::export::error::{ExportError, ExportPhase};
use crate::gfx::{Color, Drawing, Grob, Paint};

/// Output formats a canvas snapshot can be requested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Pdf,
    Eps,
    Png,
    Jpeg,
    Tiff,
    Gif,
    Bmp,
}

impl ImageFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "eps" => Some(Self::Eps),
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "tif" | "tiff" => Some(Self::Tiff),
            "gif" => Some(Self::Gif),
            "bmp" => Some(Self::Bmp),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Eps => "eps",
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Tiff => "tiff",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Pdf | Self::Eps)
    }

    fn raster(&self) -> Option<image::ImageFormat> {
        match self {
            Self::Png => Some(image::ImageFormat::Png),
            Self::Jpeg => Some(image::ImageFormat::Jpeg),
            Self::Tiff => Some(image::ImageFormat::Tiff),
            Self::Gif => Some(image::ImageFormat::Gif),
            Self::Bmp => Some(image::ImageFormat::Bmp),
            Self::Pdf | Self::Eps => None,
        }
    }
}

/// A surface that is cleared, redrawn by the script, then snapshotted.
pub trait Canvas {
    fn clear(&mut self);

    /// Replace the canvas content with a freshly recorded drawing.
    fn draw(&mut self, drawing: Drawing);

    fn size(&self) -> (u32, u32);

    fn is_empty(&self) -> bool;

    fn rasterize(&self) -> Result<RgbaImage, ExportError>;

    /// Encode the current content in `format`.
    fn snapshot(&self, format: ImageFormat) -> Result<Vec<u8>, ExportError>;

    fn save(&self, path: &Path, format: ImageFormat) -> Result<(), ExportError> {
        let data = self.snapshot(format)?;
        std::fs::write(path, data).map_err(|e| {
            ExportError::with_source(ExportPhase::Write, format!("Failed to write {:?}", path), e)
        })
    }
}

/// Default canvas: rasterises the recorded shapes into RGBA pixels.
#[derive(Debug, Clone)]
pub struct RasterCanvas {
    drawing: Option<Drawing>,
    width: u32,
    height: u32,
}

impl Default for RasterCanvas {
    fn default() -> Self {
        Self::new()
    }
}

impl RasterCanvas {
    pub fn new() -> Self {
        Self {
            drawing: None,
            width: crate::gfx::DEFAULT_WIDTH,
            height: crate::gfx::DEFAULT_HEIGHT,
        }
    }

    pub fn drawing(&self) -> Option<&Drawing> {
        self.drawing.as_ref()
    }
}

impl Canvas for RasterCanvas {
    fn clear(&mut self) {
        self.drawing = None;
    }

    fn draw(&mut self, drawing: Drawing) {
        self.width = drawing.width;
        self.height = drawing.height;
        self.drawing = Some(drawing);
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_empty(&self) -> bool {
        self.drawing.is_none()
    }

    fn rasterize(&self) -> Result<RgbaImage, ExportError> {
        let mut img = RgbaImage::new(self.width, self.height);
        if let Some(drawing) = &self.drawing {
            if let Some(bg) = drawing.background {
                let px = Rgba(bg.to_rgba8());
                img.pixels_mut().for_each(|p| *p = px);
            }
            for grob in &drawing.grobs {
                paint_grob(&mut img, grob);
            }
        }
        Ok(img)
    }

    fn snapshot(&self, format: ImageFormat) -> Result<Vec<u8>, ExportError> {
        let Some(target) = format.raster() else {
            return Err(ExportError::new(
                ExportPhase::Write,
                format!(
                    "{} output needs a vector canvas; the raster canvas cannot produce it",
                    format.extension().to_uppercase()
                ),
            ));
        };

        let img = self.rasterize()?;
        let mut buf = Cursor::new(Vec::new());
        let written = if format == ImageFormat::Jpeg {
            DynamicImage::ImageRgba8(img).to_rgb8().write_to(&mut buf, target)
        } else {
            img.write_to(&mut buf, target)
        };
        written.map_err(|e| {
            ExportError::with_source(
                ExportPhase::Encode,
                format!("Failed to encode {} image", format.extension()),
                e,
            )
        })?;
        Ok(buf.into_inner())
    }
}

fn blend(img: &mut RgbaImage, x: i64, y: i64, color: Color) {
    if x < 0 || y < 0 || x >= img.width() as i64 || y >= img.height() as i64 {
        return;
    }
    let dst = img.get_pixel_mut(x as u32, y as u32);
    let [sr, sg, sb, _] = color.to_rgba8();
    let a = color.a;
    let mix = |s: u8, d: u8| (s as f32 * a + d as f32 * (1.0 - a)).round() as u8;
    let out_a = (a * 255.0 + dst[3] as f32 * (1.0 - a)).round() as u8;
    *dst = Rgba([mix(sr, dst[0]), mix(sg, dst[1]), mix(sb, dst[2]), out_a]);
}

/// Visit the pixel centers inside an axis-aligned box, clipped to a `width` x `height` image.
fn for_each_pixel(
    (width, height): (u32, u32),
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
    mut f: impl FnMut(i64, i64, f32, f32),
) {
    let (x0, x1) = (x0.min(x1), x0.max(x1));
    let (y0, y1) = (y0.min(y1), y0.max(y1));
    let cols = (x0.floor() as i64).max(0)..=(x1.ceil() as i64).min(width as i64 - 1);
    let rows = (y0.floor() as i64).max(0)..=(y1.ceil() as i64).min(height as i64 - 1);
    for py in rows {
        for px in cols.clone() {
            let (cx, cy) = (px as f32 + 0.5, py as f32 + 0.5);
            f(px, py, cx, cy);
        }
    }
}

fn in_rect(cx: f32, cy: f32, x: f32, y: f32, w: f32, h: f32) -> bool {
    let (x0, x1) = (x.min(x + w), x.max(x + w));
    let (y0, y1) = (y.min(y + h), y.max(y + h));
    cx >= x0 && cx < x1 && cy >= y0 && cy < y1
}

fn in_oval(cx: f32, cy: f32, x: f32, y: f32, w: f32, h: f32) -> bool {
    let (rx, ry) = (w.abs() / 2.0, h.abs() / 2.0);
    if rx <= 0.0 || ry <= 0.0 {
        return false;
    }
    let (ox, oy) = (x + w / 2.0, y + h / 2.0);
    let (dx, dy) = ((cx - ox) / rx, (cy - oy) / ry);
    dx * dx + dy * dy <= 1.0
}

fn segment_distance(px: f32, py: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> f32 {
    let (vx, vy) = (x2 - x1, y2 - y1);
    let len2 = vx * vx + vy * vy;
    let t = if len2 == 0.0 {
        0.0
    } else {
        (((px - x1) * vx + (py - y1) * vy) / len2).clamp(0.0, 1.0)
    };
    let (qx, qy) = (x1 + t * vx, y1 + t * vy);
    ((px - qx).powi(2) + (py - qy).powi(2)).sqrt()
}

fn paint_box(img: &mut RgbaImage, oval: bool, x: f32, y: f32, w: f32, h: f32, paint: &Paint) {
    let inside = if oval { in_oval } else { in_rect };
    let bounds = img.dimensions();
    if let Some(fill) = paint.fill {
        for_each_pixel(bounds, x, y, x + w, y + h, |px, py, cx, cy| {
            if inside(cx, cy, x, y, w, h) {
                blend(img, px, py, fill);
            }
        });
    }
    if let Some(stroke) = paint.stroke {
        if paint.nib <= 0.0 {
            return;
        }
        let half = paint.nib / 2.0;
        let (ox, oy, ow, oh) = (x - half, y - half, w + paint.nib, h + paint.nib);
        let (ix, iy, iw, ih) = (x + half, y + half, w - paint.nib, h - paint.nib);
        for_each_pixel(bounds, ox, oy, ox + ow, oy + oh, |px, py, cx, cy| {
            let inner = iw > 0.0 && ih > 0.0 && inside(cx, cy, ix, iy, iw, ih);
            if inside(cx, cy, ox, oy, ow, oh) && !inner {
                blend(img, px, py, stroke);
            }
        });
    }
}

fn paint_grob(img: &mut RgbaImage, grob: &Grob) {
    match grob {
        Grob::Rect { x, y, w, h, paint } => paint_box(img, false, *x, *y, *w, *h, paint),
        Grob::Oval { x, y, w, h, paint } => paint_box(img, true, *x, *y, *w, *h, paint),
        Grob::Line {
            x1,
            y1,
            x2,
            y2,
            paint,
        } => {
            let Some(stroke) = paint.stroke.or(paint.fill) else {
                return;
            };
            let half = (paint.nib / 2.0).max(0.5);
            let (bx0, by0) = (x1.min(*x2) - half, y1.min(*y2) - half);
            let (bx1, by1) = (x1.max(*x2) + half, y1.max(*y2) + half);
            let bounds = img.dimensions();
            for_each_pixel(bounds, bx0, by0, bx1, by1, |px, py, cx, cy| {
                if segment_distance(cx, cy, *x1, *y1, *x2, *y2) <= half {
                    blend(img, px, py, stroke);
                }
            });
        }
    }
}
