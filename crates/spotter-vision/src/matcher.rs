use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::template::{now_ms, Template};

/// Tunables for the scan. The defaults are empirically-tuned values, not
/// derived from template or screen size; callers with better knowledge of
/// their UI may override them without changing the matching contract.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Width of the central search window, in pixels.
    pub search_width: u32,
    /// Height of the central search window, in pixels.
    pub search_height: u32,
    /// Step between candidate window positions.
    pub stride: u32,
    /// Sample every n-th pixel in each axis when scoring a candidate.
    pub sample_step: u32,
    /// Per-channel color distance (of 255) still counted as agreement.
    pub channel_tolerance: u8,
    /// Stop scanning the moment a candidate exceeds this score.
    pub short_circuit_score: f64,
    /// Slack applied when the template demands an exact match.
    pub exact_epsilon: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            search_width: 400,
            search_height: 600,
            stride: 10,
            sample_step: 5,
            channel_tolerance: 50,
            short_circuit_score: 0.9,
            exact_epsilon: 0.001,
        }
    }
}

/// Outcome of one match engine invocation. `coordinates` is the center of
/// the accepted window and is only meaningful when `found` is set;
/// `confidence` carries the best score seen either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub found: bool,
    pub coordinates: Option<(i32, i32)>,
    pub confidence: f64,
    pub timestamp_ms: u64,
}

impl MatchResult {
    pub(crate) fn hit(x: i32, y: i32, confidence: f64) -> Self {
        Self {
            found: true,
            coordinates: Some((x, y)),
            confidence,
            timestamp_ms: now_ms(),
        }
    }

    pub(crate) fn miss(confidence: f64) -> Self {
        Self {
            found: false,
            coordinates: None,
            confidence,
            timestamp_ms: now_ms(),
        }
    }
}

/// Inclusive range of candidate top-left positions.
struct ScanBounds {
    x0: u32,
    x1: u32,
    y0: u32,
    y1: u32,
}

/// Slide the template over a central sub-rectangle of the screen and return
/// the best-scoring position, if it clears the template's threshold.
///
/// Ties are broken by scan order: the best is only replaced on strict
/// improvement, and the whole scan short-circuits once a candidate exceeds
/// `short_circuit_score`.
pub fn find_match(screen: &RgbaImage, template: &Template, config: &MatchConfig) -> MatchResult {
    let tmpl = template.image();
    let (sw, sh) = screen.dimensions();
    let (tw, th) = tmpl.dimensions();

    if tw > sw || th > sh {
        debug!("template {tw}x{th} exceeds screen {sw}x{sh}, not scanning");
        return MatchResult::miss(0.0);
    }

    let bounds = scan_bounds(sw, sh, tw, th, config);
    let stride = config.stride.max(1) as usize;

    let mut best: Option<(f64, u32, u32)> = None;
    'scan: for y in (bounds.y0..=bounds.y1).step_by(stride) {
        for x in (bounds.x0..=bounds.x1).step_by(stride) {
            let score = sample_score(screen, tmpl, x, y, config);
            if best.map_or(true, |(b, _, _)| score > b) {
                best = Some((score, x, y));
                if score > config.short_circuit_score {
                    trace!("short-circuit at ({x}, {y}) with score {score:.3}");
                    break 'scan;
                }
            }
        }
    }

    let Some((score, x, y)) = best else {
        return MatchResult::miss(0.0);
    };
    if meets_threshold(score, template.match_threshold(), config.exact_epsilon) {
        let (cx, cy) = window_center(x, y, tw, th);
        MatchResult::hit(cx, cy, score)
    } else {
        MatchResult::miss(score)
    }
}

/// Enumerate every above-threshold window, de-duplicated by non-maximum
/// suppression: candidates are visited in descending score order and any
/// candidate whose center lies within `template.radius()` of an accepted one
/// is dropped. The stable sort preserves scan order among equal scores.
pub fn find_all_matches(
    screen: &RgbaImage,
    template: &Template,
    config: &MatchConfig,
) -> Vec<MatchResult> {
    let tmpl = template.image();
    let (sw, sh) = screen.dimensions();
    let (tw, th) = tmpl.dimensions();

    if tw > sw || th > sh {
        debug!("template {tw}x{th} exceeds screen {sw}x{sh}, not scanning");
        return Vec::new();
    }

    let bounds = scan_bounds(sw, sh, tw, th, config);
    let stride = config.stride.max(1) as usize;

    let mut candidates: Vec<(f64, u32, u32)> = Vec::new();
    for y in (bounds.y0..=bounds.y1).step_by(stride) {
        for x in (bounds.x0..=bounds.x1).step_by(stride) {
            let score = sample_score(screen, tmpl, x, y, config);
            if meets_threshold(score, template.match_threshold(), config.exact_epsilon) {
                candidates.push((score, x, y));
            }
        }
    }

    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let min_distance = f64::from(template.radius());
    let mut accepted: Vec<(f64, i32, i32)> = Vec::new();
    for (score, x, y) in candidates {
        let (cx, cy) = window_center(x, y, tw, th);
        let overlaps = accepted.iter().any(|&(_, ax, ay)| {
            let dx = f64::from(cx - ax);
            let dy = f64::from(cy - ay);
            (dx * dx + dy * dy).sqrt() < min_distance
        });
        if !overlaps {
            accepted.push((score, cx, cy));
        }
    }

    accepted
        .into_iter()
        .map(|(score, cx, cy)| MatchResult::hit(cx, cy, score))
        .collect()
}

/// Candidate top-left range: a centered sub-rectangle capped at the
/// configured search size, grown as needed to fit the template.
fn scan_bounds(sw: u32, sh: u32, tw: u32, th: u32, config: &MatchConfig) -> ScanBounds {
    let rw = config.search_width.clamp(tw, sw);
    let rh = config.search_height.clamp(th, sh);
    let rx = (sw - rw) / 2;
    let ry = (sh - rh) / 2;
    ScanBounds {
        x0: rx,
        x1: rx + rw - tw,
        y0: ry,
        y1: ry + rh - th,
    }
}

/// Fraction of sparsely-sampled pixel pairs whose color agrees within the
/// per-channel tolerance.
fn sample_score(screen: &RgbaImage, tmpl: &RgbaImage, ox: u32, oy: u32, config: &MatchConfig) -> f64 {
    let step = config.sample_step.max(1) as usize;
    let tolerance = i32::from(config.channel_tolerance);

    let mut total = 0u32;
    let mut agree = 0u32;
    for ty in (0..tmpl.height()).step_by(step) {
        for tx in (0..tmpl.width()).step_by(step) {
            total += 1;
            if channels_close(screen.get_pixel(ox + tx, oy + ty), tmpl.get_pixel(tx, ty), tolerance)
            {
                agree += 1;
            }
        }
    }

    if total == 0 {
        0.0
    } else {
        f64::from(agree) / f64::from(total)
    }
}

fn channels_close(a: &Rgba<u8>, b: &Rgba<u8>, tolerance: i32) -> bool {
    (0..3).all(|c| (i32::from(a[c]) - i32::from(b[c])).abs() <= tolerance)
}

/// Exact-match templates (threshold at 1.0) accept within a small epsilon of
/// a perfect score, since comparing floats to exactly 1.0 is unreliable.
fn meets_threshold(score: f64, threshold: f64, epsilon: f64) -> bool {
    if threshold >= 1.0 {
        score >= 1.0 - epsilon
    } else {
        score >= threshold
    }
}

fn window_center(x: u32, y: u32, tw: u32, th: u32) -> (i32, i32) {
    ((x + tw / 2) as i32, (y + th / 2) as i32)
}
