//! Program-page data extraction and study-plan text extraction.
//!
//! Program pages are server-rendered and carry the payload their client-side
//! renderer hydrates from in a single `script#__NEXT_DATA__` block; scraping
//! that block is the primary data source, there is no dedicated API. Study
//! plans are PDFs; pdfium reads them page by page, and pages with no
//! extractable text (scans) contribute empty strings rather than errors.

use std::path::{Path, PathBuf};

use mpa_core::ProgramDraft;
use pdfium_render::prelude::*;
use scraper::{Html, Selector};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "mpa-extract";

/// CSS selector of the embedded hydration payload.
const DATA_BLOCK_SELECTOR: &str = "script#__NEXT_DATA__";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("embedded data block not found in page")]
    MissingDataBlock,
    #[error("embedded data block is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("embedded data is missing required field {0}")]
    MissingField(&'static str),
    #[error("{0}")]
    Selector(String),
}

#[derive(Debug, Error)]
pub enum DocumentOpenError {
    #[error("cannot open study plan {path}: {detail}")]
    Open { path: PathBuf, detail: String },
    #[error("study-plan extraction task failed: {0}")]
    Task(String),
}

/// Recover the embedded JSON payload from a program page.
///
/// Fails when the block is absent, empty, or unparseable: a page without its
/// hydration payload yields no record at all, never a partial one.
pub fn extract_embedded_data(html: &str) -> Result<JsonValue, ExtractionError> {
    let selector =
        Selector::parse(DATA_BLOCK_SELECTOR).map_err(|e| ExtractionError::Selector(e.to_string()))?;
    let document = Html::parse_document(html);
    let raw = document
        .select(&selector)
        .next()
        .map(|node| node.text().collect::<String>())
        .ok_or(ExtractionError::MissingDataBlock)?;
    if raw.trim().is_empty() {
        return Err(ExtractionError::MissingDataBlock);
    }
    Ok(serde_json::from_str(&raw)?)
}

/// Project a [`ProgramDraft`] out of the embedded payload.
///
/// Identity and title are mandatory; exam dates and admission quotas default
/// to empty blobs when the page omits them.
pub fn program_draft(data: &JsonValue, slug: &str) -> Result<ProgramDraft, ExtractionError> {
    let page_props = json_at(data, &["props", "pageProps"])
        .ok_or(ExtractionError::MissingField("props.pageProps"))?;
    let api_program = page_props
        .get("apiProgram")
        .ok_or(ExtractionError::MissingField("apiProgram"))?;

    let program_id = api_program
        .get("id")
        .and_then(JsonValue::as_i64)
        .ok_or(ExtractionError::MissingField("apiProgram.id"))?;
    let title = api_program
        .get("title")
        .and_then(JsonValue::as_str)
        .ok_or(ExtractionError::MissingField("apiProgram.title"))?
        .to_string();

    let exam_dates = page_props
        .get("examDates")
        .cloned()
        .unwrap_or_else(|| json!([]));
    let admission_quotas = page_props
        .get("admission_quotas")
        .cloned()
        .unwrap_or_else(|| json!({}));

    Ok(ProgramDraft {
        slug: slug.to_string(),
        program_id,
        title,
        exam_dates,
        admission_quotas,
    })
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// Extract the plain text of a study-plan document, page order preserved.
///
/// pdfium wraps a C++ library that must not run on the async workers, so the
/// whole read happens inside `spawn_blocking`. Only an unopenable document is
/// an error; a page that yields no text contributes an empty line.
pub async fn extract_document_text(path: &Path) -> Result<String, DocumentOpenError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_text_blocking(&path))
        .await
        .map_err(|e| DocumentOpenError::Task(e.to_string()))?
}

fn extract_text_blocking(path: &Path) -> Result<String, DocumentOpenError> {
    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| DocumentOpenError::Open {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })?;

    let pages = document.pages();
    debug!(path = %path.display(), pages = pages.len(), "extracting study-plan text");

    let mut page_texts = Vec::with_capacity(pages.len() as usize);
    for page in pages.iter() {
        page_texts.push(page.text().map(|t| t.all()).unwrap_or_default());
    }
    Ok(join_page_texts(page_texts))
}

/// Join per-page texts with newline separators, preserving page order.
pub fn join_page_texts<I>(pages: I) -> String
where
    I: IntoIterator<Item = String>,
{
    pages.into_iter().collect::<Vec<_>>().join("\n")
}
