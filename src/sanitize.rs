#![forbid(unsafe_code)]

//! Turns untrusted video titles into filenames that are valid on Linux,
//! macOS and Windows alike.

use crate::video_url::VideoUrl;

/// Union of the characters rejected by common filesystems.
const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
pub const DEFAULT_MAX_NAME_LEN: usize = 150;
/// 255-byte file name limit (ext4, APFS, NTFS) minus room for the longest
/// staging suffix, `.webm.part`.
pub const MAX_NAME_BYTES: usize = 255 - ".webm.part".len();
const FALLBACK_NAME: &str = "video";
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Sanitizes a title. Returns `None` when nothing usable is left.
///
/// Forbidden and control characters become spaces, whitespace runs collapse
/// to one space, and leading/trailing dots and spaces are trimmed. The
/// result is capped at `max_len` characters and at [`MAX_NAME_BYTES`] bytes.
/// Reserved device names get a `_` right after the device part
/// (`NUL.tar.gz` becomes `NUL_.tar.gz`), within the same caps.
pub fn sanitize_title(title: &str, max_len: usize) -> Option<String> {
    let replaced: String = title
        .chars()
        .map(|c| {
            if FORBIDDEN_CHARS.contains(&c) || c.is_control() {
                ' '
            } else {
                c
            }
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");

    let name = fit(&collapsed, max_len, MAX_NAME_BYTES)?;
    if !is_reserved(name) {
        return Some(name.to_string());
    }
    let name = fit(&collapsed, max_len.saturating_sub(1), MAX_NAME_BYTES - 1)?;
    Some(unreserve(name))
}

/// Name for the final file: the sanitized title, or `video-<id>` when the
/// title sanitizes to nothing.
pub fn output_stem(title: Option<&str>, url: &VideoUrl, max_len: usize) -> String {
    title
        .and_then(|title| sanitize_title(title, max_len))
        .or_else(|| sanitize_title(&format!("{FALLBACK_NAME}-{}", url.id()), max_len))
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

/// Longest prefix within both caps, cut on a char boundary, edges trimmed.
fn fit(value: &str, max_chars: usize, max_bytes: usize) -> Option<&str> {
    let max_chars = max_chars.max(1);
    let mut end = 0;
    for (count, (idx, c)) in value.char_indices().enumerate() {
        if count == max_chars || idx + c.len_utf8() > max_bytes {
            break;
        }
        end = idx + c.len_utf8();
    }
    let trimmed = trim_edges(&value[..end]);
    (!trimmed.is_empty()).then_some(trimmed)
}

fn unreserve(name: &str) -> String {
    let base_len = name.split('.').next().unwrap_or(name).trim_end().len();
    let mut fixed = String::with_capacity(name.len() + 1);
    fixed.push_str(&name[..base_len]);
    fixed.push('_');
    fixed.push_str(&name[base_len..]);
    fixed
}

fn trim_edges(value: &str) -> &str {
    value.trim_matches(|c: char| c == '.' || c == ' ')
}

fn is_reserved(name: &str) -> bool {
    let base = name.split('.').next().unwrap_or(name).trim_end();
    RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitize(title: &str) -> Option<String> {
        sanitize_title(title, DEFAULT_MAX_NAME_LEN)
    }

    #[test]
    fn strips_separators_and_punctuation() {
        assert_eq!(
            sanitize("My Video: Part 1/2?").as_deref(),
            Some("My Video Part 1 2")
        );
        assert_eq!(
            sanitize("a\\b*c\"d<e>f|g").as_deref(),
            Some("a b c d e f g")
        );
    }

    #[test]
    fn output_never_contains_forbidden_characters() {
        let titles = [
            "What?! <Live> \"Official\"",
            "tab\there\nnewline\r\u{0}nul",
            "C:\\Windows\\System32",
            "////",
            "  .. spaced .. ",
            "emoji 🎵 / unicode ünïcödé: ok",
        ];
        for title in titles {
            if let Some(name) = sanitize(title) {
                assert!(!name.is_empty());
                assert!(
                    !name
                        .chars()
                        .any(|c| FORBIDDEN_CHARS.contains(&c) || c.is_control()),
                    "{name:?} still has forbidden characters"
                );
                assert!(!name.ends_with('.') && !name.ends_with(' '));
            }
        }
    }

    #[test]
    fn is_deterministic() {
        let title = "Same: title / every * time";
        assert_eq!(sanitize(title), sanitize(title));
    }

    #[test]
    fn empty_results_become_none() {
        assert_eq!(sanitize(""), None);
        assert_eq!(sanitize("???"), None);
        assert_eq!(sanitize(" .. "), None);
    }

    #[test]
    fn caps_length_on_char_boundaries() {
        let title = "é".repeat(400);
        let name = sanitize_title(&title, 10).unwrap();
        assert_eq!(name.chars().count(), 10);

        let name = sanitize_title("abcdefgh .xyz", 9).unwrap();
        assert_eq!(name, "abcdefgh");
    }

    #[test]
    fn suffixes_reserved_device_names() {
        assert_eq!(sanitize("con").as_deref(), Some("con_"));
        assert_eq!(sanitize("NUL").as_deref(), Some("NUL_"));
        assert_eq!(sanitize("Console").as_deref(), Some("Console"));
        assert_eq!(sanitize("CON.txt").as_deref(), Some("CON_.txt"));
        assert_eq!(sanitize("nul.tar.gz").as_deref(), Some("nul_.tar.gz"));
        assert_eq!(sanitize("NUL.tar.gz").as_deref(), Some("NUL_.tar.gz"));
        assert_eq!(sanitize("aux .log").as_deref(), Some("aux_ .log"));
        for name in ["CON.txt", "nul.tar.gz", "aux .log", "LPT1"] {
            assert!(!is_reserved(&sanitize(name).unwrap()));
        }
    }

    #[test]
    fn reserved_suffix_stays_within_the_cap() {
        let name = sanitize_title("LPT1.txt", 8).unwrap();
        assert_eq!(name, "LPT1_.tx");
        assert_eq!(name.chars().count(), 8);
        assert!(!is_reserved(&name));

        let name = sanitize_title("COM1", 4).unwrap();
        assert!(name.chars().count() <= 4);
        assert!(!is_reserved(&name));
    }

    #[test]
    fn wide_titles_fit_the_file_name_limit() {
        let title = "日本語のタイトル".repeat(30);
        let name = sanitize(&title).unwrap();
        assert!(name.len() <= MAX_NAME_BYTES);
        assert!(title.starts_with(&name));

        let staging = format!("{name}.webm.part");
        assert!(staging.len() <= 255);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(&staging), "media").unwrap();

        let emoji = sanitize(&"🎵".repeat(200)).unwrap();
        assert!(emoji.len() <= MAX_NAME_BYTES);
        assert_eq!(emoji.chars().count(), MAX_NAME_BYTES / 4);
    }

    #[test]
    fn output_stem_falls_back_to_video_id() {
        let url = VideoUrl::parse("https://www.youtube.com/watch?v=abc123").unwrap();
        assert_eq!(
            output_stem(Some("My Video: Part 1/2?"), &url, DEFAULT_MAX_NAME_LEN),
            "My Video Part 1 2"
        );
        assert_eq!(
            output_stem(Some("/:*?"), &url, DEFAULT_MAX_NAME_LEN),
            "video-abc123"
        );
        assert_eq!(output_stem(None, &url, DEFAULT_MAX_NAME_LEN), "video-abc123");
    }
}
