//! Template-matching kernel.
//!
//! Pure computation, executed inside worker processes: zero-mean normalized
//! cross-correlation of each template against every position of the search
//! image, best score wins. No shared state, no IO.

use image::RgbaImage;

/// Outcome of matching one image against a set of templates
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    /// Best correlation score across all templates (0.0..=1.0)
    pub score: f32,
    /// Top-left corner of the best match, in search-image coordinates
    pub location: Option<(u32, u32)>,
    /// Size (w, h) of the template that produced the best score
    pub template_size: Option<(u32, u32)>,
}

impl MatchOutcome {
    pub fn none() -> Self {
        Self {
            score: 0.0,
            location: None,
            template_size: None,
        }
    }

    pub fn is_match(&self, threshold: f32) -> bool {
        self.location.is_some() && self.score >= threshold
    }
}

/// Match `templates` against `image`, returning the best hit.
///
/// Templates larger than the image are skipped. With `grayscale` the
/// correlation runs on luma values, otherwise on interleaved RGB samples.
pub fn match_templates(image: &RgbaImage, templates: &[RgbaImage], grayscale: bool) -> MatchOutcome {
    let haystack = Plane::from_rgba(image, grayscale);

    let mut best = MatchOutcome::none();
    for tpl in templates {
        if tpl.width() > image.width() || tpl.height() > image.height() {
            continue;
        }
        if tpl.width() == 0 || tpl.height() == 0 {
            continue;
        }

        let needle = Plane::from_rgba(tpl, grayscale);
        if let Some((score, loc)) = best_correlation(&haystack, &needle) {
            if score > best.score || best.location.is_none() {
                best = MatchOutcome {
                    score,
                    location: Some(loc),
                    template_size: Some((tpl.width(), tpl.height())),
                };
            }
        }
    }

    best
}

/// Compute the final click point for a match.
///
/// `roi offset + match location + template center + configured pixel offset`,
/// in screen/frame coordinates.
pub fn click_point(
    roi_offset: (i32, i32),
    location: (u32, u32),
    template_size: (u32, u32),
    click_offset: (i32, i32),
) -> (i32, i32) {
    let (tw, th) = template_size;
    (
        roi_offset.0 + location.0 as i32 + (tw / 2) as i32 + click_offset.0,
        roi_offset.1 + location.1 as i32 + (th / 2) as i32 + click_offset.1,
    )
}

/// A sample plane: `channels` interleaved f32 samples per pixel
struct Plane {
    samples: Vec<f32>,
    width: u32,
    height: u32,
    channels: u32,
}

impl Plane {
    fn from_rgba(img: &RgbaImage, grayscale: bool) -> Self {
        if grayscale {
            let gray = image::DynamicImage::ImageRgba8(img.clone()).to_luma8();
            Self {
                samples: gray.pixels().map(|p| p.0[0] as f32).collect(),
                width: img.width(),
                height: img.height(),
                channels: 1,
            }
        } else {
            let mut samples = Vec::with_capacity((img.width() * img.height() * 3) as usize);
            for p in img.pixels() {
                samples.push(p.0[0] as f32);
                samples.push(p.0[1] as f32);
                samples.push(p.0[2] as f32);
            }
            Self {
                samples,
                width: img.width(),
                height: img.height(),
                channels: 3,
            }
        }
    }

    #[inline]
    fn sample(&self, x: u32, y: u32, c: u32) -> f32 {
        self.samples[((y * self.width + x) * self.channels + c) as usize]
    }
}

/// Best zero-mean normalized cross-correlation of `needle` over `haystack`.
///
/// Returns `(score, top_left)` with the score clamped into 0.0..=1.0; a flat
/// (zero-variance) window correlates to zero. A flat template has no
/// variance to correlate against, so it is scored by direct similarity
/// instead (solid-color buttons are a common template).
fn best_correlation(haystack: &Plane, needle: &Plane) -> Option<(f32, (u32, u32))> {
    debug_assert_eq!(haystack.channels, needle.channels);

    let n = (needle.width * needle.height * needle.channels) as f32;
    let tpl_mean = needle.samples.iter().sum::<f32>() / n;
    let tpl_dev: Vec<f32> = needle.samples.iter().map(|s| s - tpl_mean).collect();
    let tpl_norm = tpl_dev.iter().map(|d| d * d).sum::<f32>().sqrt();
    if tpl_norm == 0.0 {
        return best_flat_similarity(haystack, needle, tpl_mean);
    }

    let mut best_score = f32::MIN;
    let mut best_loc = (0u32, 0u32);

    for oy in 0..=(haystack.height - needle.height) {
        for ox in 0..=(haystack.width - needle.width) {
            // Window mean
            let mut sum = 0.0f32;
            for ty in 0..needle.height {
                for tx in 0..needle.width {
                    for c in 0..needle.channels {
                        sum += haystack.sample(ox + tx, oy + ty, c);
                    }
                }
            }
            let win_mean = sum / n;

            // Correlation and window norm
            let mut dot = 0.0f32;
            let mut win_norm_sq = 0.0f32;
            let mut i = 0usize;
            for ty in 0..needle.height {
                for tx in 0..needle.width {
                    for c in 0..needle.channels {
                        let d = haystack.sample(ox + tx, oy + ty, c) - win_mean;
                        dot += d * tpl_dev[i];
                        win_norm_sq += d * d;
                        i += 1;
                    }
                }
            }

            let score = if win_norm_sq == 0.0 {
                0.0
            } else {
                dot / (win_norm_sq.sqrt() * tpl_norm)
            };

            if score > best_score {
                best_score = score;
                best_loc = (ox, oy);
            }
        }
    }

    Some((best_score.clamp(0.0, 1.0), best_loc))
}

/// Best placement of a zero-variance template: one minus the normalized mean
/// absolute difference of the window against the template's value. An exact
/// flat region scores 1.0.
fn best_flat_similarity(
    haystack: &Plane,
    needle: &Plane,
    tpl_value: f32,
) -> Option<(f32, (u32, u32))> {
    let n = (needle.width * needle.height * needle.channels) as f32;

    let mut best_score = f32::MIN;
    let mut best_loc = (0u32, 0u32);

    for oy in 0..=(haystack.height - needle.height) {
        for ox in 0..=(haystack.width - needle.width) {
            let mut abs_diff = 0.0f32;
            for ty in 0..needle.height {
                for tx in 0..needle.width {
                    for c in 0..needle.channels {
                        abs_diff += (haystack.sample(ox + tx, oy + ty, c) - tpl_value).abs();
                    }
                }
            }

            let score = 1.0 - abs_diff / (n * 255.0);
            if score > best_score {
                best_score = score;
                best_loc = (ox, oy);
            }
        }
    }

    Some((best_score.clamp(0.0, 1.0), best_loc))
}
