//! Core domain model for the Master's Program Advisor.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "mpa-core";

/// Fully ingested master's program: the unit of grounding knowledge.
///
/// A `ProgramRecord` value always has every field populated; partial state
/// during ingestion lives in [`ProgramDraft`], which is only completed into a
/// record once the study-plan document has been fetched and its text
/// extracted. `document_text` may legitimately be empty (a scanned plan with
/// no extractable text), but it is never absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramRecord {
    /// Stable human-readable identifier, unique key in the store.
    pub slug: String,
    /// Numeric identifier assigned by the upstream source.
    pub program_id: i64,
    /// Display name.
    pub title: String,
    /// Opaque pass-through blob of exam dates/labels.
    pub exam_dates: JsonValue,
    /// Opaque pass-through blob of admission quotas.
    pub admission_quotas: JsonValue,
    /// Canonical study-plan document location at the source.
    pub document_url: String,
    /// Local path of the downloaded study-plan document.
    pub document_path: String,
    /// Extracted plain text of the study plan, page order preserved.
    pub document_text: String,
}

/// Pre-document handoff produced by the page extractor.
///
/// Carries everything the embedded page data yields; the ingest pipeline
/// fills in the document fields via [`ProgramDraft::into_record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDraft {
    pub slug: String,
    pub program_id: i64,
    pub title: String,
    pub exam_dates: JsonValue,
    pub admission_quotas: JsonValue,
}

impl ProgramDraft {
    /// Complete the draft into a full record once the study plan is on disk.
    pub fn into_record(
        self,
        document_url: String,
        document_path: String,
        document_text: String,
    ) -> ProgramRecord {
        ProgramRecord {
            slug: self.slug,
            program_id: self.program_id,
            title: self.title,
            exam_dates: self.exam_dates,
            admission_quotas: self.admission_quotas,
            document_url,
            document_path,
            document_text,
        }
    }
}
