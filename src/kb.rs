//! KB corpus loading.
//!
//! Reads every file matching the configured glob into a [`KbDocument`].
//! PDFs go through `pdf-extract`; everything else is read as UTF-8 text.
//! A file that fails to load is logged and skipped — one bad file must not
//! take down the whole corpus.

use anyhow::Result;
use std::path::Path;
use tracing::warn;

use crate::fingerprint::stat_matching_files;
use crate::models::KbDocument;

/// Load all KB documents matching the glob pattern.
pub fn load_kb_docs(glob_pattern: &str) -> Result<Vec<KbDocument>> {
    let mut stamps = stat_matching_files(glob_pattern)?;
    stamps.sort_by(|a, b| a.path.cmp(&b.path));

    let mut docs = Vec::new();
    for stamp in &stamps {
        match load_one(Path::new(&stamp.path)) {
            Ok(Some(doc)) => docs.push(doc),
            Ok(None) => {}
            Err(e) => {
                warn!(path = %stamp.path, error = %e, "failed to load KB file, skipping");
            }
        }
    }

    Ok(docs)
}

fn load_one(path: &Path) -> Result<Option<KbDocument>> {
    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let is_pdf = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);

    let body = if is_pdf {
        pdf_extract::extract_text(path)?
    } else {
        std::fs::read_to_string(path)?
    };

    if body.trim().is_empty() {
        return Ok(None);
    }

    Ok(Some(KbDocument {
        source,
        page: None,
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_text_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "anticoagulant therapy notes").unwrap();
        fs::write(tmp.path().join("b.md"), "## Dosage\ncheck INR weekly").unwrap();

        let pattern = format!("{}/*", tmp.path().display());
        let docs = load_kb_docs(&pattern).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].source, "a.txt");
        assert!(docs[1].body.contains("INR"));
    }

    #[test]
    fn test_empty_files_skipped() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("empty.txt"), "   ").unwrap();
        fs::write(tmp.path().join("real.txt"), "content").unwrap();

        let pattern = format!("{}/*", tmp.path().display());
        let docs = load_kb_docs(&pattern).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source, "real.txt");
    }

    #[test]
    fn test_unreadable_file_does_not_fail_corpus() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("ok.txt"), "fine").unwrap();
        // Invalid UTF-8 forces a per-file read error.
        fs::write(tmp.path().join("bad.txt"), [0xff, 0xfe, 0x00, 0x01]).unwrap();

        let pattern = format!("{}/*.txt", tmp.path().display());
        let docs = load_kb_docs(&pattern).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source, "ok.txt");
    }
}
