//! Image staging for synced image sources
//!
//! Slaves write received image bytes to a process-shared temp area and point
//! the local OBS input at the staged file. File names derive from the source
//! name so repeated updates overwrite in place; no cleanup is needed between
//! runs.

use std::path::PathBuf;

/// Directory under the system temp dir where synced images land
const STAGING_DIR_NAME: &str = "obs-sync";

/// Classify image bytes by magic number and pick a file extension.
///
/// Unknown content falls back to `bin`; the apply attempt still proceeds
/// since OBS sniffs formats itself.
pub fn sniff_extension(data: &[u8]) -> &'static str {
    if data.len() < 4 {
        return "bin";
    }

    match &data[0..4] {
        [0x89, 0x50, 0x4E, 0x47] => "png",
        [0xFF, 0xD8, 0xFF, _] => "jpg",
        [0x47, 0x49, 0x46, 0x38] => "gif",
        [0x42, 0x4D, _, _] => "bmp",
        [0x52, 0x49, 0x46, 0x46] if data.len() >= 12 && &data[8..12] == b"WEBP" => "webp",
        _ => "bin",
    }
}

/// The shared staging directory, `<system temp>/obs-sync`
pub fn staging_dir() -> PathBuf {
    std::env::temp_dir().join(STAGING_DIR_NAME)
}

/// Stable staged path for a source: `<staging>/<sanitized source name>.<ext>`
pub fn staged_path(source_name: &str, extension: &str) -> PathBuf {
    staging_dir().join(format!("{}.{}", sanitize(source_name), extension))
}

/// Strip path separators and other characters that would escape the staging
/// directory or upset the filesystem.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "source".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_known_formats() {
        assert_eq!(sniff_extension(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A]), "png");
        assert_eq!(sniff_extension(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]), "jpg");
        assert_eq!(sniff_extension(b"GIF89a..."), "gif");
        assert_eq!(sniff_extension(b"BM\x00\x00\x00\x00"), "bmp");

        let mut webp = Vec::from(*b"RIFF");
        webp.extend_from_slice(&[0x10, 0x00, 0x00, 0x00]);
        webp.extend_from_slice(b"WEBP");
        assert_eq!(sniff_extension(&webp), "webp");
    }

    #[test]
    fn test_sniff_unknown_falls_back_to_bin() {
        assert_eq!(sniff_extension(b"\x00\x01\x02\x03"), "bin");
        // RIFF without the WEBP fourcc is not an image we know
        assert_eq!(sniff_extension(b"RIFF\x10\x00\x00\x00WAVE"), "bin");
        // Too short to classify
        assert_eq!(sniff_extension(&[0x89]), "bin");
        assert_eq!(sniff_extension(&[]), "bin");
    }

    #[test]
    fn test_staged_path_is_stable_and_sanitized() {
        let a = staged_path("Logo", "png");
        let b = staged_path("Logo", "png");
        assert_eq!(a, b);
        assert!(a.ends_with("obs-sync/Logo.png") || a.ends_with("obs-sync\\Logo.png"));

        let tricky = staged_path("../etc/passwd", "png");
        let name = tricky.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, ".._etc_passwd.png");
    }

    #[test]
    fn test_sanitize_empty_name() {
        assert_eq!(sanitize(""), "source");
    }
}
