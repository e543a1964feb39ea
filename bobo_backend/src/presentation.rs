use crate::pet::state::Mood;

/// Asset shown while a hug animation plays.
pub const HUG_ASSET: &str = "hugs";
/// Asset used for anything the adapter does not recognize.
pub const FALLBACK_ASSET: &str = "idle";

/// Maps a decoded mood to its presentation asset key.
pub fn asset_for(mood: Mood) -> &'static str {
    match mood {
        Mood::Idle => "idle",
        Mood::Happy => "happy",
        Mood::Sad => "sad",
        Mood::Lonely => "lonely",
    }
}

/// Total mapping from a raw mood string to an asset key. Unknown values get
/// the fallback asset instead of an error.
pub fn mood_to_asset(mood: &str) -> &'static str {
    Mood::parse(mood).map(asset_for).unwrap_or(FALLBACK_ASSET)
}

/// Static path the web presenter serves an asset from.
pub fn asset_path(asset: &str) -> String {
    format!("/images/{asset}.gif")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mood_has_its_own_asset() {
        for mood in Mood::ALL {
            assert_eq!(mood_to_asset(mood.as_str()), mood.as_str());
        }
    }

    #[test]
    fn unknown_mood_falls_back_to_idle() {
        assert_eq!(mood_to_asset("confused"), FALLBACK_ASSET);
        assert_eq!(mood_to_asset(""), FALLBACK_ASSET);
    }

    #[test]
    fn asset_paths_point_at_gifs() {
        assert_eq!(asset_path(asset_for(Mood::Happy)), "/images/happy.gif");
        assert_eq!(asset_path(HUG_ASSET), "/images/hugs.gif");
    }
}
