use image::RgbaImage;
use thiserror::Error;

/// Errors produced by template construction and the persistence codec.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template image has zero width or height")]
    EmptyImage,

    #[error("match threshold {0} outside [0.1, 1.0]")]
    ThresholdOutOfRange(f64),

    #[error("radius must be greater than zero")]
    ZeroRadius,

    #[error("radius {radius} exceeds template extent {max_extent}")]
    RadiusTooLarge { radius: u32, max_extent: u32 },

    #[error("malformed template record: {0}")]
    Malformed(String),

    #[error("template image payload: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A stored reference image anchored around a point, with the acceptance
/// threshold used when matching it against a screen capture.
///
/// Templates are immutable: validated once in [`Template::new`], read-only
/// afterwards. The search loop shares them as `Arc<Template>` and replaces
/// the whole value to change the active template.
#[derive(Debug, Clone)]
pub struct Template {
    center_x: i32,
    center_y: i32,
    radius: u32,
    image: RgbaImage,
    match_threshold: f64,
    created_at_ms: u64,
}

impl Template {
    /// Validate and construct a template.
    ///
    /// Invariants enforced here: non-empty image, threshold in [0.1, 1.0],
    /// radius > 0 and no larger than the template's longest side.
    pub fn new(
        center_x: i32,
        center_y: i32,
        radius: u32,
        image: RgbaImage,
        match_threshold: f64,
        created_at_ms: u64,
    ) -> Result<Self, TemplateError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(TemplateError::EmptyImage);
        }
        if !(0.1..=1.0).contains(&match_threshold) {
            return Err(TemplateError::ThresholdOutOfRange(match_threshold));
        }
        if radius == 0 {
            return Err(TemplateError::ZeroRadius);
        }
        let max_extent = image.width().max(image.height());
        if radius > max_extent {
            return Err(TemplateError::RadiusTooLarge { radius, max_extent });
        }
        Ok(Self {
            center_x,
            center_y,
            radius,
            image,
            match_threshold,
            created_at_ms,
        })
    }

    /// Build a template by cropping the square region of side `2 * radius`
    /// around the anchor point out of a captured frame. The region is clamped
    /// to the frame bounds, so anchors near an edge yield a smaller crop.
    pub fn from_region(
        frame: &RgbaImage,
        center_x: i32,
        center_y: i32,
        radius: u32,
        match_threshold: f64,
    ) -> Result<Self, TemplateError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(TemplateError::EmptyImage);
        }
        let side = radius.saturating_mul(2).max(1);
        let x0 = (center_x.saturating_sub(radius as i32)).max(0) as u32;
        let y0 = (center_y.saturating_sub(radius as i32)).max(0) as u32;
        let x0 = x0.min(frame.width() - 1);
        let y0 = y0.min(frame.height() - 1);
        let w = side.min(frame.width() - x0);
        let h = side.min(frame.height() - y0);

        let image = image::imageops::crop_imm(frame, x0, y0, w, h).to_image();
        Self::new(center_x, center_y, radius, image, match_threshold, now_ms())
    }

    /// Anchor point in the source image's coordinate space.
    pub fn center(&self) -> (i32, i32) {
        (self.center_x, self.center_y)
    }

    /// Region-of-interest radius, also the non-overlap distance used when
    /// suppressing duplicate matches.
    pub fn radius(&self) -> u32 {
        self.radius
    }

    /// The cropped reference pixels.
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn match_threshold(&self) -> f64 {
        self.match_threshold
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn white(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]))
    }

    #[test]
    fn test_new_validates_threshold() {
        assert!(matches!(
            Template::new(5, 5, 4, white(8, 8), 0.05, 0),
            Err(TemplateError::ThresholdOutOfRange(_))
        ));
        assert!(matches!(
            Template::new(5, 5, 4, white(8, 8), 1.5, 0),
            Err(TemplateError::ThresholdOutOfRange(_))
        ));
        assert!(Template::new(5, 5, 4, white(8, 8), 0.1, 0).is_ok());
        assert!(Template::new(5, 5, 4, white(8, 8), 1.0, 0).is_ok());
    }

    #[test]
    fn test_new_validates_radius() {
        assert!(matches!(
            Template::new(5, 5, 0, white(8, 8), 0.8, 0),
            Err(TemplateError::ZeroRadius)
        ));
        assert!(matches!(
            Template::new(5, 5, 9, white(8, 8), 0.8, 0),
            Err(TemplateError::RadiusTooLarge { .. })
        ));
        // radius may reach the longest side
        assert!(Template::new(5, 5, 8, white(8, 4), 0.8, 0).is_ok());
    }

    #[test]
    fn test_new_rejects_empty_image() {
        assert!(matches!(
            Template::new(0, 0, 1, RgbaImage::new(0, 0), 0.8, 0),
            Err(TemplateError::EmptyImage)
        ));
    }

    #[test]
    fn test_from_region_crops_around_anchor() {
        let mut frame = RgbaImage::from_pixel(40, 40, Rgba([0, 0, 0, 255]));
        for y in 16..24 {
            for x in 16..24 {
                frame.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        let tmpl = Template::from_region(&frame, 20, 20, 4, 0.9).unwrap();
        assert_eq!(tmpl.image().dimensions(), (8, 8));
        assert!(tmpl.image().pixels().all(|p| p[0] == 255));
        assert_eq!(tmpl.center(), (20, 20));
    }

    #[test]
    fn test_from_region_clamps_at_edges() {
        let frame = RgbaImage::from_pixel(40, 40, Rgba([9, 9, 9, 255]));
        let tmpl = Template::from_region(&frame, 1, 1, 4, 0.9).unwrap();
        // Anchor near the origin: crop starts at (0, 0) and keeps whatever fits.
        assert_eq!(tmpl.image().dimensions(), (8, 8));

        let tmpl = Template::from_region(&frame, 38, 38, 4, 0.9).unwrap();
        assert_eq!(tmpl.image().dimensions(), (6, 6));
    }
}
