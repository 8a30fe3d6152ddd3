//! Payload validation and classification for the capture surface.
//!
//! The controller is the only component that rejects input; the engine
//! re-derives categories from the path on ingest as defence in depth, so
//! both sides share these tables.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

use crate::items::Category;

pub static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?://|www\.)\S+$").expect("malformed url regex"));

/// Extension -> category allow-list. Anything not here is refused.
const ALLOW: &[(&str, Category)] = &[
    ("pdf", Category::Documents),
    ("doc", Category::Documents),
    ("docx", Category::Documents),
    ("txt", Category::Documents),
    ("md", Category::Documents),
    ("rtf", Category::Documents),
    ("odt", Category::Documents),
    ("epub", Category::Documents),
    ("png", Category::Images),
    ("jpg", Category::Images),
    ("jpeg", Category::Images),
    ("gif", Category::Images),
    ("webp", Category::Images),
    ("bmp", Category::Images),
    ("svg", Category::Images),
    ("tiff", Category::Images),
    ("heic", Category::Images),
    ("mp4", Category::Videos),
    ("mov", Category::Videos),
    ("webm", Category::Videos),
    ("mkv", Category::Videos),
    ("avi", Category::Videos),
    ("m4v", Category::Videos),
    ("csv", Category::Csv),
    ("tsv", Category::Csv),
];

/// Extension -> human-readable refusal reason.
const REJECT: &[(&str, &str)] = &[
    ("mp3", "audio files aren't supported"),
    ("wav", "audio files aren't supported"),
    ("flac", "audio files aren't supported"),
    ("aac", "audio files aren't supported"),
    ("ogg", "audio files aren't supported"),
    ("m4a", "audio files aren't supported"),
    ("opus", "audio files aren't supported"),
    ("exe", "executables can't go in the vault"),
    ("msi", "executables can't go in the vault"),
    ("dll", "executables can't go in the vault"),
    ("so", "executables can't go in the vault"),
    ("dylib", "executables can't go in the vault"),
    ("bat", "executables can't go in the vault"),
    ("cmd", "executables can't go in the vault"),
    ("com", "executables can't go in the vault"),
    ("app", "executables can't go in the vault"),
    ("apk", "executables can't go in the vault"),
    ("zip", "archives aren't supported, drop the files inside instead"),
    ("tar", "archives aren't supported, drop the files inside instead"),
    ("gz", "archives aren't supported, drop the files inside instead"),
    ("tgz", "archives aren't supported, drop the files inside instead"),
    ("bz2", "archives aren't supported, drop the files inside instead"),
    ("7z", "archives aren't supported, drop the files inside instead"),
    ("rar", "archives aren't supported, drop the files inside instead"),
    ("xz", "archives aren't supported, drop the files inside instead"),
    ("sys", "system files aren't supported"),
    ("ini", "system files aren't supported"),
    ("lnk", "system files aren't supported"),
    ("plist", "system files aren't supported"),
    ("tmp", "system files aren't supported"),
    ("lock", "system files aren't supported"),
];

/// Map a dropped path to its category, or a refusal reason.
pub fn classify_path(path: &Path) -> Result<Category, String> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let ext = match crate::blobstore::ext_of(path) {
        Some(ext) => ext,
        None => return Err(format!("{name}: files without an extension aren't supported")),
    };

    if let Some((_, reason)) = REJECT.iter().find(|(e, _)| *e == ext) {
        return Err(format!("{name}: {reason}"));
    }

    ALLOW
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, category)| *category)
        .ok_or_else(|| format!("{name}: .{ext} files aren't supported"))
}

/// Informational MIME type derived from the extension at ingest.
pub fn mime_from_ext(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "rtf" => "application/rtf",
        "odt" => "application/vnd.oasis.opendocument.text",
        "epub" => "application/epub+zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "tiff" => "image/tiff",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "m4v" => "video/x-m4v",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        _ => return None,
    };
    Some(mime)
}

/// Keywords that push free text towards the `code` category.
const CODE_KEYWORDS: &[&str] = &[
    "fn ", "def ", "class ", "impl ", "import ", "from ", "let ", "const ", "var ", "func ",
    "return ", "#include", "pub ", "struct ", "enum ", "match ", "lambda ",
];

/// Classify typed or pasted text: link by pattern, then code/notes, with
/// `ideas` as the fallback for short free-form thoughts.
pub fn classify_text(text: &str) -> Category {
    let trimmed = text.trim();

    if URL_RE.is_match(trimmed) {
        return Category::Links;
    }

    if looks_like_code(trimmed) {
        return Category::Code;
    }

    if looks_like_notes(trimmed) {
        return Category::Notes;
    }

    Category::Ideas
}

fn looks_like_code(text: &str) -> bool {
    let keyword_hits = CODE_KEYWORDS
        .iter()
        .filter(|kw| text.contains(*kw))
        .count();
    if keyword_hits >= 2 {
        return true;
    }

    // structural characters per line: braces, semicolons, arrows
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() >= 2 {
        let structural = lines
            .iter()
            .filter(|l| {
                let t = l.trim_end();
                t.ends_with('{')
                    || t.ends_with('}')
                    || t.ends_with(';')
                    || t.contains("=>")
                    || t.contains("->")
                    || l.starts_with("    ")
                    || l.starts_with('\t')
            })
            .count();
        if structural * 2 >= lines.len() {
            return true;
        }
    }

    keyword_hits >= 1 && text.contains('(') && text.contains(')')
}

fn looks_like_notes(text: &str) -> bool {
    if text.chars().count() > 200 {
        return true;
    }

    let bullet_lines = text
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with("- ")
                || t.starts_with("* ")
                || t.starts_with("[ ]")
                || t.starts_with("[x]")
                || t.chars().next().is_some_and(|c| c.is_ascii_digit()) && t.contains(". ")
        })
        .count();

    bullet_lines >= 2 || text.lines().count() >= 4
}
