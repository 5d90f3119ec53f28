use std::error::Error as StdError;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    Image,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Image => "image",
        }
    }

    pub fn from_str(v: &str) -> Option<MediaKind> {
        match v {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            "image" => Some(MediaKind::Image),
            _ => None,
        }
    }
}

pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "opus", "m4a", "aac", "wav", "wma", "ape", "mpc",
];

// This list is what extensions image crate recognizes
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "tif", "tiff", "tga", "bmp", "ico", "hdr", "pbm", "pam",
    "ppm", "pgm",
];

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "webm", "mov", "wmv", "mpg", "mpeg", "m4v", "ts",
];

pub fn default_extensions() -> Vec<String> {
    AUDIO_EXTENSIONS
        .iter()
        .chain(IMAGE_EXTENSIONS.iter())
        .chain(VIDEO_EXTENSIONS.iter())
        .map(|e| e.to_string())
        .collect()
}

pub fn kind_for_extension(extension: &str) -> Option<MediaKind> {
    if AUDIO_EXTENSIONS.iter().any(|&e| e == extension) {
        Some(MediaKind::Audio)
    } else if IMAGE_EXTENSIONS.iter().any(|&e| e == extension) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.iter().any(|&e| e == extension) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// One extracted metadata field, ready for the store.
#[derive(Debug, Clone)]
pub struct Fact {
    pub name: String,
    pub value: String,
}

impl Fact {
    pub fn new(name: &str, value: &str) -> Fact {
        Fact {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Extracts the facts for a single media file. Format-specific probing
/// happens here; failures degrade to the path-derived facts so a file with
/// an unreadable payload still gets indexed.
pub fn extract_facts(fs_path: &Path, virtual_path: &Path) -> Vec<Fact> {
    let mut facts: Vec<Fact> = Vec::new();

    let extension = match fs_path.extension().and_then(|e| e.to_str()) {
        Some(e) => e.to_ascii_lowercase(),
        None => return facts,
    };

    let kind = match kind_for_extension(&extension) {
        Some(k) => k,
        None => return facts,
    };

    facts.push(Fact::new("kind", kind.as_str()));
    facts.push(Fact::new("ext", &extension));

    if let Some(stem) = fs_path.file_stem().and_then(|s| s.to_str()) {
        facts.push(Fact::new("name", stem));
    }

    // The category tag is the name of the root the file lives under.
    if let Some(root) = virtual_path.iter().next().and_then(|c| c.to_str()) {
        facts.push(Fact::new("category", root));
    }

    if kind == MediaKind::Image {
        match image::image_dimensions(fs_path) {
            Ok(dimensions) => {
                facts.push(Fact::new("width", &dimensions.0.to_string()));
                facts.push(Fact::new("height", &dimensions.1.to_string()));
            }
            Err(e) => {
                debug!(
                    "can't read image dimensions '{}': {}",
                    fs_path.to_string_lossy(),
                    e.description()
                );
            }
        }
    }

    facts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_resolution() {
        assert_eq!(kind_for_extension("flac"), Some(MediaKind::Audio));
        assert_eq!(kind_for_extension("png"), Some(MediaKind::Image));
        assert_eq!(kind_for_extension("mkv"), Some(MediaKind::Video));
        assert_eq!(kind_for_extension("txt"), None);
    }

    #[test]
    fn path_facts() {
        let facts = extract_facts(
            Path::new("/music/albums/track01.mp3"),
            Path::new("music/albums/track01.mp3"),
        );

        let get = |name: &str| {
            facts
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.value.clone())
        };

        assert_eq!(get("kind"), Some("audio".to_string()));
        assert_eq!(get("ext"), Some("mp3".to_string()));
        assert_eq!(get("name"), Some("track01".to_string()));
        assert_eq!(get("category"), Some("music".to_string()));
    }

    #[test]
    fn no_facts_for_unknown_extension() {
        let facts = extract_facts(Path::new("/tmp/readme.txt"), Path::new("docs/readme.txt"));
        assert!(facts.is_empty());
    }
}
