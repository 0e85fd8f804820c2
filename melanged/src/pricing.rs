//! Token and cost accounting for generative requests.
//!
//! Image tokens follow the provider's tile rule: images at or under
//! 384x384 cost a flat small-image rate; larger images are billed per
//! 768-pixel tile. Video is billed per second of output.

/// Both dimensions at or under this are billed at the flat rate.
const SMALL_IMAGE_THRESHOLD: u32 = 384;
const SMALL_IMAGE_TOKENS: u64 = 258;
const TILE_SIZE: u32 = 768;
const TOKENS_PER_TILE: u64 = 258;

/// USD per image-processing token.
const IMAGE_TOKEN_RATE: f64 = 0.000_002_58;

/// USD per second of generated video.
const VIDEO_RATE_PER_SECOND: f64 = 0.40;

/// Token count for an image at the given dimensions, after applying the
/// resolution multiplier.
pub fn image_tokens(width: u32, height: u32, resolution_multiplier: f64) -> u64 {
    let effective_width = (width as f64 * resolution_multiplier) as u32;
    let effective_height = (height as f64 * resolution_multiplier) as u32;

    if effective_width <= SMALL_IMAGE_THRESHOLD && effective_height <= SMALL_IMAGE_THRESHOLD {
        return SMALL_IMAGE_TOKENS;
    }

    let tiles_x = effective_width.div_ceil(TILE_SIZE) as u64;
    let tiles_y = effective_height.div_ceil(TILE_SIZE) as u64;
    tiles_x * tiles_y * TOKENS_PER_TILE
}

/// USD cost of a token count at the image-processing rate.
pub fn token_cost(tokens: u64) -> f64 {
    tokens as f64 * IMAGE_TOKEN_RATE
}

/// USD cost of a generated video.
pub fn video_cost(duration_seconds: u32) -> f64 {
    duration_seconds as f64 * VIDEO_RATE_PER_SECOND
}

/// Breakdown attached to transform results.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImageCost {
    pub tokens: u64,
    pub estimated_cost: String,
    pub tile_count: u64,
}

/// Compute the full cost payload for an image.
pub fn image_cost(width: u32, height: u32, resolution_multiplier: f64) -> ImageCost {
    let tokens = image_tokens(width, height, resolution_multiplier);
    let tile_count = if tokens == SMALL_IMAGE_TOKENS
        && width.max(height) <= SMALL_IMAGE_THRESHOLD
    {
        1
    } else {
        tokens / TOKENS_PER_TILE
    };
    ImageCost {
        tokens,
        estimated_cost: format!("${:.3}", token_cost(tokens)),
        tile_count,
    }
}
