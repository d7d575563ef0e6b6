//! Photo vs. non-photo scoring.

use image::imageops;

use crate::preprocess::DecodedImage;

/// Scores how photo-like an image is.
pub trait Classifier: Send + Sync {
    /// A score in `[0, 1]`, or `None` when the classifier cannot judge.
    fn score(&self, image: &DecodedImage) -> Option<f32>;
}

/// Laplacian kernel matching the usual "find edges" filter.
const FIND_EDGES: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 8.0, -1.0, -1.0, -1.0, -1.0];

const THUMBNAIL_SIDE: u32 = 224;

/// Cheap CPU heuristic: real photos carry fine detail and colour variance,
/// drawings tend to have flat fills.
///
/// `score = 0.6 * edge_mean + 0.4 * min(1, 10 * rgb_variance)`
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl Classifier for HeuristicClassifier {
    fn score(&self, decoded: &DecodedImage) -> Option<f32> {
        if decoded.width == 0 || decoded.height == 0 {
            return None;
        }
        let small = decoded.image.thumbnail(THUMBNAIL_SIDE, THUMBNAIL_SIDE);

        let edges = imageops::filter3x3(&small.to_luma8(), &FIND_EDGES);
        let edge_mean = mean(edges.as_raw().iter().map(|&p| f64::from(p) / 255.0));

        let rgb = small.to_rgb8();
        let channel = |p: &u8| f64::from(*p) / 255.0;
        let rgb_mean = mean(rgb.as_raw().iter().map(channel));
        let variance = mean(rgb.as_raw().iter().map(|p| (channel(p) - rgb_mean).powi(2)));

        let score = 0.6 * edge_mean.clamp(0.0, 1.0) + 0.4 * (variance * 10.0).clamp(0.0, 1.0);
        Some(score.clamp(0.0, 1.0) as f32)
    }
}

fn mean<I: Iterator<Item = f64>>(values: I) -> f64 {
    let (sum, count) = values.fold((0.0, 0u64), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
