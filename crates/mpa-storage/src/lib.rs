//! HTTP fetch utilities, study-plan file storage, and the program store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mpa_core::ProgramRecord;
use reqwest::header;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpa-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Downloaded study-plan document body plus the response's
/// `Content-Disposition` value, used for destination naming.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub bytes: Vec<u8>,
    pub content_disposition: Option<String>,
}

/// Fetch seam for the ingest pipeline: program pages and their study-plan
/// documents. Implemented by [`HttpFetcher`] in production and by in-memory
/// doubles under test.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;
    async fn fetch_document(&self, url: &str) -> Result<FetchedDocument, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    async fn checked(&self, resp: reqwest::Response) -> Result<reqwest::Response, FetchError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        debug!(url, "fetching program page");
        let resp = self.client.get(url).send().await?;
        let resp = self.checked(resp).await?;
        Ok(resp.text().await?)
    }

    async fn fetch_document(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        debug!(url, "fetching study-plan document");
        let resp = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/pdf")
            .send()
            .await?;
        let resp = self.checked(resp).await?;
        let content_disposition = resp
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let bytes = resp.bytes().await?.to_vec();
        Ok(FetchedDocument {
            bytes,
            content_disposition,
        })
    }
}

/// Extract the `filename=` parameter from a `Content-Disposition` value.
///
/// Returns `None` when the header carries no usable name, so the caller can
/// fall back to a deterministic one.
pub fn disposition_filename(header: Option<&str>) -> Option<String> {
    let header = header?;
    let (_, rest) = header.split_once("filename=")?;
    let name = rest
        .split(';')
        .next()
        .unwrap_or(rest)
        .trim()
        .trim_matches(|c| c == '"' || c == '\'');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Flat directory of downloaded study-plan documents, one file per program.
///
/// Re-ingesting the same program overwrites the same path; writes go through
/// a temp file + rename so a crashed run never leaves a half-written plan
/// behind.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn store(&self, filename: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        // The filename may come from an HTTP header; keep only the final
        // path component.
        let filename = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty())
            .context("destination filename is empty")?;

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating document directory {}", self.root.display()))?;

        let dest = self.root.join(&filename);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("opening temp document file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp document file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp document file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &dest).await {
            Ok(()) => Ok(dest),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp document {} -> {}",
                        temp_path.display(),
                        dest.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed program store: upsert-by-slug plus fetch-by-slug-set.
///
/// `fetch_by_slugs` returns records ordered by `slug`; the prompt assembler
/// relies on that ordering being stable across runs.
#[async_trait]
pub trait ProgramRepository: Send + Sync {
    async fn upsert(&self, record: &ProgramRecord) -> Result<(), PersistenceError>;
    async fn fetch_by_slugs(&self, slugs: &[String]) -> Result<Vec<ProgramRecord>, PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct ProgramStore {
    pool: PgPool,
}

impl ProgramStore {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS programs (
                slug             TEXT PRIMARY KEY,
                program_id       BIGINT NOT NULL,
                title            TEXT NOT NULL,
                exam_dates       JSONB NOT NULL,
                admission_quotas JSONB NOT NULL,
                document_url     TEXT NOT NULL,
                document_path    TEXT NOT NULL,
                document_text    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProgramRepository for ProgramStore {
    async fn upsert(&self, record: &ProgramRecord) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO programs
                (slug, program_id, title, exam_dates, admission_quotas,
                 document_url, document_path, document_text)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (slug) DO UPDATE SET
                program_id       = EXCLUDED.program_id,
                title            = EXCLUDED.title,
                exam_dates       = EXCLUDED.exam_dates,
                admission_quotas = EXCLUDED.admission_quotas,
                document_url     = EXCLUDED.document_url,
                document_path    = EXCLUDED.document_path,
                document_text    = EXCLUDED.document_text
            "#,
        )
        .bind(&record.slug)
        .bind(record.program_id)
        .bind(&record.title)
        .bind(&record.exam_dates)
        .bind(&record.admission_quotas)
        .bind(&record.document_url)
        .bind(&record.document_path)
        .bind(&record.document_text)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_by_slugs(&self, slugs: &[String]) -> Result<Vec<ProgramRecord>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT slug, program_id, title, exam_dates, admission_quotas,
                   document_url, document_path, document_text
              FROM programs
             WHERE slug = ANY($1)
             ORDER BY slug
            "#,
        )
        .bind(slugs)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ProgramRecord {
                slug: row.try_get("slug")?,
                program_id: row.try_get("program_id")?,
                title: row.try_get("title")?,
                exam_dates: row.try_get("exam_dates")?,
                admission_quotas: row.try_get("admission_quotas")?,
                document_url: row.try_get("document_url")?,
                document_path: row.try_get("document_path")?,
                document_text: row.try_get("document_text")?,
            });
        }
        Ok(out)
    }
}

/// In-memory repository double, slug-keyed like the real store.
#[derive(Debug, Default)]
pub struct MemoryProgramRepository {
    records: Mutex<BTreeMap<String, ProgramRecord>>,
}

impl MemoryProgramRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<ProgramRecord> {
        self.records.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl ProgramRepository for MemoryProgramRepository {
    async fn upsert(&self, record: &ProgramRecord) -> Result<(), PersistenceError> {
        self.records
            .lock()
            .await
            .insert(record.slug.clone(), record.clone());
        Ok(())
    }

    async fn fetch_by_slugs(&self, slugs: &[String]) -> Result<Vec<ProgramRecord>, PersistenceError> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| slugs.contains(&r.slug))
            .cloned()
            .collect())
    }
}
