use blur_watch_common::frame::{BlurResult, Classification};
use image::GrayImage;

/// Laplacian-variance focus measure.
///
/// Applies the 3x3 Laplacian `[0 1 0; 1 -4 1; 0 1 0]` with a reflect-101
/// border and returns the population variance of the response. Flat regions
/// score 0; strong edges score high. Scores are compared against a
/// threshold: anything strictly below it is blurry.
#[derive(Debug, Clone, Copy)]
pub struct BlurScorer {
    threshold: f64,
}

impl BlurScorer {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn evaluate(&self, region: &GrayImage) -> BlurResult {
        let score = laplacian_variance(region);
        BlurResult {
            score,
            classification: classify(score, self.threshold),
        }
    }
}

/// `Blurry` iff `score < threshold`. A score equal to the threshold is `Clear`.
pub fn classify(score: f64, threshold: f64) -> Classification {
    if score < threshold {
        Classification::Blurry
    } else {
        Classification::Clear
    }
}

/// Variance of the Laplacian response over `region`. Empty regions score 0.
pub fn laplacian_variance(region: &GrayImage) -> f64 {
    let (width, height) = region.dimensions();
    if width == 0 || height == 0 {
        return 0.0;
    }

    let px = |x: i64, y: i64| -> f64 {
        let x = reflect101(x, width as i64);
        let y = reflect101(y, height as i64);
        region.get_pixel(x as u32, y as u32).0[0] as f64
    };

    let n = (width as u64 * height as u64) as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let response =
                px(x, y - 1) + px(x - 1, y) + px(x + 1, y) + px(x, y + 1) - 4.0 * px(x, y);
            sum += response;
            sum_sq += response * response;
        }
    }

    let mean = sum / n;
    // Rounding can push a flat region a hair below zero.
    (sum_sq / n - mean * mean).max(0.0)
}

/// Border index mapping `gfedcb|abcdefgh|gfedcba`. Only used for offsets of
/// at most one pixel past either edge.
fn reflect101(i: i64, len: i64) -> i64 {
    if len == 1 {
        0
    } else if i < 0 {
        -i
    } else if i >= len {
        2 * len - i - 2
    } else {
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn uniform_region_scores_zero_and_is_blurry() {
        for value in [0u8, 128, 255] {
            let region = GrayImage::from_pixel(37, 23, Luma([value]));
            let result = BlurScorer::new(80.0).evaluate(&region);
            assert_eq!(result.score, 0.0);
            assert_eq!(result.classification, Classification::Blurry);
        }
        assert_eq!(classify(0.0, 0.001), Classification::Blurry);
    }

    #[test]
    fn classify_boundaries() {
        assert_eq!(classify(80.0, 80.0), Classification::Clear);
        assert_eq!(classify(79.999, 80.0), Classification::Blurry);
        assert_eq!(classify(80.001, 80.0), Classification::Clear);
        assert_eq!(classify(1e9, 80.0), Classification::Clear);
        assert_eq!(classify(0.0, 0.0), Classification::Clear);
    }

    #[test]
    fn checkerboard_is_sharp() {
        let region = GrayImage::from_fn(32, 32, |x, y| {
            if (x + y) % 2 == 0 {
                Luma([0])
            } else {
                Luma([255])
            }
        });
        let result = BlurScorer::new(80.0).evaluate(&region);
        assert!(result.score > 10_000.0, "score was {}", result.score);
        assert_eq!(result.classification, Classification::Clear);
    }

    #[test]
    fn single_bright_pixel_matches_hand_computation() {
        // 5x5 zeros with a 1 in the centre. Responses: centre -4, the four
        // direct neighbours 1, everything else 0 -> mean 0, variance 20 / 25.
        let mut region = GrayImage::new(5, 5);
        region.put_pixel(2, 2, Luma([1]));
        let score = laplacian_variance(&region);
        assert!((score - 0.8).abs() < 1e-12, "score was {score}");
    }

    #[test]
    fn border_reflection_counts_mirrored_neighbour() {
        // In a 3x3 region reflect-101 mirrors the centre pixel across every
        // edge, so the edge midpoints see it twice.
        let mut region = GrayImage::new(3, 3);
        region.put_pixel(1, 1, Luma([1]));
        // responses: centre -4, edge midpoints 2, corners 0
        let mean: f64 = 4.0 / 9.0;
        let expected = 32.0 / 9.0 - mean * mean;
        assert!((laplacian_variance(&region) - expected).abs() < 1e-12);
    }

    #[test]
    fn horizontal_ramp_is_flat_inside() {
        // A linear ramp has zero second derivative away from the border;
        // reflect-101 makes the border columns non-zero.
        let region = GrayImage::from_fn(5, 1, |x, _| Luma([(x * 10) as u8]));
        // responses: x=0: 10+10-0 = 20, x=1..3: 0, x=4: 30+30-80 = -20
        let expected = (400.0 + 400.0) / 5.0;
        assert!((laplacian_variance(&region) - expected).abs() < 1e-9);
    }

    #[test]
    fn one_pixel_region_scores_zero() {
        let region = GrayImage::from_pixel(1, 1, Luma([200]));
        assert_eq!(laplacian_variance(&region), 0.0);
    }

    #[test]
    fn empty_region_scores_zero() {
        assert_eq!(laplacian_variance(&GrayImage::new(0, 0)), 0.0);
    }

    #[test]
    fn deterministic_for_identical_pixels() {
        let region = GrayImage::from_fn(40, 40, |x, y| Luma([((x * 7 + y * 13) % 251) as u8]));
        let a = laplacian_variance(&region);
        let b = laplacian_variance(&region.clone());
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
