//! Filename templates for persisted artifacts.
//!
//! All on-disk naming conventions live here so tests can assert conformance
//! in one place instead of scanning call sites.

use chrono::{DateTime, Utc};

use crate::types::Uid;

/// Generated image: `<uid>_<yyyymmdd>.png`.
pub fn generated_image(uid: &Uid, now: DateTime<Utc>) -> String {
    format!("{}_{}.png", uid, now.format("%Y%m%d"))
}

/// Generated video: `<uid>_<yyyymmdd>.mp4`.
pub fn generated_video(uid: &Uid, now: DateTime<Utc>) -> String {
    format!("{}_{}.mp4", uid, now.format("%Y%m%d"))
}

/// Legacy video name carried for files produced before UID-first naming:
/// `<parent-stem>_VEO3_<unix-ts>.mp4`.
pub fn legacy_video(parent_stem: &str, timestamp: i64) -> String {
    format!("{parent_stem}_VEO3_{timestamp}.mp4")
}

/// Legacy styled-image name: `<original-stem>_NB_<unix-ts>.png`.
pub fn legacy_styled_image(original_stem: &str, timestamp: i64) -> String {
    format!("{original_stem}_NB_{timestamp}.png")
}

/// Sidecar metadata file for a reference image blob.
pub fn reference_meta(refer_uid: &str) -> String {
    format!("{refer_uid}_meta.json")
}

/// Texture file inside an avatar blob directory, 1-based.
pub fn avatar_texture(index: usize) -> String {
    format!("texture_{index:03}.png")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UidKind;
    use chrono::TimeZone;

    #[test]
    fn generated_names_embed_uid_and_date() {
        let uid = Uid::new(UidKind::Image, 3);
        let at = Utc.with_ymd_and_hms(2025, 10, 2, 12, 0, 0).unwrap();
        assert_eq!(generated_image(&uid, at), "img_003_20251002.png");

        let vid = Uid::new(UidKind::Video, 14);
        assert_eq!(generated_video(&vid, at), "vid_014_20251002.mp4");
    }

    #[test]
    fn legacy_names_keep_their_markers() {
        assert_eq!(
            legacy_video("ScreenShot00039", 1700000000),
            "ScreenShot00039_VEO3_1700000000.mp4"
        );
        assert_eq!(
            legacy_styled_image("ScreenShot00039", 1700000000),
            "ScreenShot00039_NB_1700000000.png"
        );
    }

    #[test]
    fn texture_names_are_zero_padded() {
        assert_eq!(avatar_texture(1), "texture_001.png");
        assert_eq!(avatar_texture(12), "texture_012.png");
        assert_eq!(avatar_texture(123), "texture_123.png");
    }
}
