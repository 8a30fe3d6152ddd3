//! Text and preview extraction from stored blobs.
//!
//! PDF text comes from `pdf_extract`, the PDF info dictionary from `lopdf`.
//! OCR, PDF cover rendering, and video posters shell out to the host's
//! `tesseract` / `pdftoppm` / `ffmpeg` when present; all three are
//! best-effort and bounded by a hard timeout.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Upper bound for any extracted text stored in item metadata (1 MiB)
pub const MAX_EXTRACTED_TEXT: usize = 1_048_576;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("{tool} failed: {detail}")]
    Tool { tool: &'static str, detail: String },

    #[error("{tool} is not installed")]
    ToolMissing { tool: &'static str },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout {
        tool: &'static str,
        timeout: Duration,
    },
}

/// Bounded body text of a PDF.
pub fn pdf_text(path: &Path) -> Result<String, ExtractError> {
    let text =
        pdf_extract::extract_text(path).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(truncate_text(&text))
}

/// Document metadata read from the PDF trailer's Info dictionary.
#[derive(Debug, Clone, Default)]
pub struct PdfInfo {
    pub page_count: u32,
    pub author: Option<String>,
    pub title: Option<String>,
    pub creation_date: Option<String>,
}

pub fn pdf_info(path: &Path) -> Result<PdfInfo, ExtractError> {
    let doc = lopdf::Document::load(path).map_err(|e| ExtractError::Pdf(e.to_string()))?;

    let mut info = PdfInfo {
        page_count: doc.get_pages().len() as u32,
        ..Default::default()
    };

    if let Ok(obj) = doc.trailer.get(b"Info") {
        let dict = match obj {
            lopdf::Object::Reference(id) => doc
                .get_object(*id)
                .ok()
                .and_then(|o| o.as_dict().ok()),
            lopdf::Object::Dictionary(dict) => Some(dict),
            _ => None,
        };

        if let Some(dict) = dict {
            info.author = pdf_string(dict, b"Author");
            info.title = pdf_string(dict, b"Title");
            info.creation_date = pdf_string(dict, b"CreationDate");
        }
    }

    Ok(info)
}

fn pdf_string(dict: &lopdf::Dictionary, key: &[u8]) -> Option<String> {
    let raw = dict.get(key).ok().and_then(|o| o.as_str().ok())?;
    let decoded = decode_pdf_text(raw);
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// PDF text strings are either UTF-16BE with a BOM or PDFDocEncoding
/// (latin-1 superset, close enough for metadata).
fn decode_pdf_text(raw: &[u8]) -> String {
    if raw.len() >= 2 && raw[0] == 0xFE && raw[1] == 0xFF {
        let utf16: Vec<u16> = raw[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&utf16)
    } else {
        raw.iter().map(|&b| b as char).collect()
    }
}

/// Bounded contents of a text-like file (.txt, .csv, .tsv).
pub fn plain_text(path: &Path) -> Result<String, ExtractError> {
    use std::io::Read;

    let file = std::fs::File::open(path)?;
    let mut bytes = Vec::new();
    file.take(MAX_EXTRACTED_TEXT as u64)
        .read_to_end(&mut bytes)?;

    Ok(truncate_text(&String::from_utf8_lossy(&bytes)))
}

/// OCR an image via the system `tesseract`. Output lands in a temp file to
/// avoid pipe-buffer stalls on large pages.
pub fn ocr_image(path: &Path, timeout: Duration) -> Result<String, ExtractError> {
    let out_base = temp_file_base("dv-ocr");

    let mut cmd = Command::new("tesseract");
    cmd.arg(path).arg(&out_base).arg("--psm").arg("3");

    let run = run_with_timeout(cmd, "tesseract", timeout);
    let out_txt = out_base.with_extension("txt");
    let result = run.and_then(|_| {
        let text = std::fs::read_to_string(&out_txt)?;
        Ok(truncate_text(&text))
    });

    let _ = std::fs::remove_file(&out_txt);
    result
}

/// Rasterise page 1 of a PDF via `pdftoppm` into JPEG bytes.
pub fn pdf_cover(path: &Path, timeout: Duration) -> Result<Vec<u8>, ExtractError> {
    let out_base = temp_file_base("dv-cover");

    let mut cmd = Command::new("pdftoppm");
    cmd.arg("-jpeg")
        .arg("-f")
        .arg("1")
        .arg("-l")
        .arg("1")
        .arg("-singlefile")
        .arg(path)
        .arg(&out_base);

    let run = run_with_timeout(cmd, "pdftoppm", timeout);
    let out_jpg = out_base.with_extension("jpg");
    let result = run.and_then(|_| Ok(std::fs::read(&out_jpg)?));

    let _ = std::fs::remove_file(&out_jpg);
    result
}

/// Grab a single frame near t=1s via `ffmpeg` as JPEG bytes.
pub fn video_poster(path: &Path, timeout: Duration) -> Result<Vec<u8>, ExtractError> {
    let out_jpg = temp_file_base("dv-poster").with_extension("jpg");

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-ss")
        .arg("1")
        .arg("-i")
        .arg(path)
        .arg("-frames:v")
        .arg("1")
        .arg(&out_jpg);

    let run = run_with_timeout(cmd, "ffmpeg", timeout);
    let result = run.and_then(|_| Ok(std::fs::read(&out_jpg)?));

    let _ = std::fs::remove_file(&out_jpg);
    result
}

/// Whether a tool exists on PATH; lets stages skip cleanly instead of
/// logging a spawn failure per item.
pub fn tool_available(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn temp_file_base(prefix: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    std::env::temp_dir().join(format!(
        "{prefix}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
}

/// Run a command to completion, killing it when the timeout elapses.
fn run_with_timeout(
    mut cmd: Command,
    tool: &'static str,
    timeout: Duration,
) -> Result<(), ExtractError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ExtractError::ToolMissing { tool }
            } else {
                ExtractError::Io(err)
            }
        })?;

    let start = Instant::now();
    loop {
        match child.try_wait()? {
            Some(status) if status.success() => return Ok(()),
            Some(status) => {
                return Err(ExtractError::Tool {
                    tool,
                    detail: format!("exited with {status}"),
                })
            }
            None if start.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExtractError::Timeout { tool, timeout });
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

fn truncate_text(text: &str) -> String {
    if text.len() <= MAX_EXTRACTED_TEXT {
        return text.to_string();
    }
    text.chars().take(MAX_EXTRACTED_TEXT).collect()
}
