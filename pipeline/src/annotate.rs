use ab_glyph::{point, Font, FontArc, PxScale, ScaleFont};
use blur_watch_common::frame::{BlurResult, Classification, Detection};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::Path;
use tracing::{error, info, warn};

pub const CLEAR_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const BLURRY_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const STATUS_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
pub const STATUS_LABEL: &str = "Blur Detection Active";

const LABEL_PX: f32 = 24.0;
const SCORE_PX: f32 = 18.0;
const FACE_COUNT_PX: f32 = 30.0;
const STATUS_PX: f32 = 21.0;

/// DejaVu Sans Mono, compiled in so labels render without any files on disk.
static BUILTIN_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

pub fn color_for(classification: Classification) -> Rgb<u8> {
    match classification {
        Classification::Clear => CLEAR_COLOR,
        Classification::Blurry => BLURRY_COLOR,
    }
}

/// Draws detection boxes, per-face labels and the frame overlays.
///
/// Glyph coverage is thresholded instead of alpha-blended, so drawing the
/// same text twice leaves the frame unchanged. An annotator built with
/// `new(None)` draws boxes only.
pub struct FrameAnnotator {
    font: Option<FontArc>,
}

impl FrameAnnotator {
    pub fn new(font: Option<FontArc>) -> Self {
        Self { font }
    }

    /// Annotator using the compiled-in label font.
    pub fn builtin() -> Self {
        match FontArc::try_from_slice(BUILTIN_FONT) {
            Ok(font) => Self::new(Some(font)),
            Err(e) => {
                error!(error = %e, "built-in annotation font is unreadable, labels disabled");
                Self::new(None)
            }
        }
    }

    /// Use the font at `path` when given and readable, the built-in font
    /// otherwise.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::builtin();
        };
        let font = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| FontArc::try_from_vec(bytes).map_err(|e| e.to_string()));
        match font {
            Ok(font) => {
                info!(path = path.display().to_string(), "annotation font loaded");
                Self::new(Some(font))
            }
            Err(e) => {
                warn!(
                    path = path.display().to_string(),
                    error = %e,
                    "failed to load annotation font, using built-in font"
                );
                Self::builtin()
            }
        }
    }

    pub fn has_text(&self) -> bool {
        self.font.is_some()
    }

    /// Return an annotated copy of `frame`. The input is never modified.
    pub fn annotate(&self, frame: &RgbImage, faces: &[(Detection, BlurResult)]) -> RgbImage {
        let mut out = frame.clone();

        self.draw_text(
            &mut out,
            &format!("Faces: {}", faces.len()),
            (10, 30),
            FACE_COUNT_PX,
            CLEAR_COLOR,
        );
        self.draw_text(&mut out, STATUS_LABEL, (10, 60), STATUS_PX, STATUS_COLOR);

        for (detection, result) in faces {
            let color = color_for(result.classification);
            draw_box(&mut out, detection, color);

            let x = detection.x as i32 + 5;
            let y = detection.y as i32;
            self.draw_text(
                &mut out,
                result.classification.label(),
                (x, y + 25),
                LABEL_PX,
                color,
            );
            self.draw_text(
                &mut out,
                &format!("Score: {:.1}", result.score),
                (x, y + 50),
                SCORE_PX,
                color,
            );
        }

        out
    }

    /// Render `text` with its baseline starting at `origin`.
    fn draw_text(
        &self,
        canvas: &mut RgbImage,
        text: &str,
        origin: (i32, i32),
        px: f32,
        color: Rgb<u8>,
    ) {
        let Some(font) = &self.font else {
            return;
        };
        let (width, height) = canvas.dimensions();
        let scaled = font.as_scaled(PxScale::from(px));
        let mut caret = point(origin.0 as f32, origin.1 as f32);

        for ch in text.chars() {
            let mut glyph = scaled.scaled_glyph(ch);
            glyph.position = caret;
            caret.x += scaled.h_advance(glyph.id);

            let Some(outlined) = font.outline_glyph(glyph) else {
                continue;
            };
            let bounds = outlined.px_bounds();
            outlined.draw(|gx, gy, coverage| {
                if coverage < 0.5 {
                    return;
                }
                let px = bounds.min.x as i32 + gx as i32;
                let py = bounds.min.y as i32 + gy as i32;
                if px >= 0 && py >= 0 && (px as u32) < width && (py as u32) < height {
                    canvas.put_pixel(px as u32, py as u32, color);
                }
            });
        }
    }
}

/// Two-pixel rectangle outline along the inside of the detection bounds.
fn draw_box(canvas: &mut RgbImage, detection: &Detection, color: Rgb<u8>) {
    if detection.width == 0 || detection.height == 0 {
        return;
    }
    let (x, y) = (detection.x as i32, detection.y as i32);
    draw_hollow_rect_mut(
        canvas,
        Rect::at(x, y).of_size(detection.width, detection.height),
        color,
    );
    if detection.width > 2 && detection.height > 2 {
        draw_hollow_rect_mut(
            canvas,
            Rect::at(x + 1, y + 1).of_size(detection.width - 2, detection.height - 2),
            color,
        );
    }
}
