//! Search index implementation using Tantivy

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{IndexRecordOption, Term, Value};
use tantivy::{
    DocId, Index, IndexReader, IndexWriter, ReloadPolicy, Score, SegmentReader, TantivyDocument,
};

use crate::models::{Email, EmailId, MailboxScope, ThreadId};
use crate::storage::MailboxStore;

use super::schema::{ACTIVITY_MS, SchemaFields, build_schema};

/// Default heap size for index writer (50MB)
const DEFAULT_HEAP_SIZE: usize = 50_000_000;

/// One ranked match
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub email_id: EmailId,
    pub thread_id: ThreadId,
    pub score: f32,
    pub activity_ms: i64,
}

/// One page of ranked matches plus the total match count
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHits {
    pub hits: Vec<SearchHit>,
    pub total: usize,
}

/// Thread-safe search index wrapper
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    writer: Mutex<IndexWriter>,
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex")
            .field("index", &"<tantivy::Index>")
            .finish()
    }
}

impl SearchIndex {
    /// Open or create index at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).context("Failed to create index directory")?;

        let dir = MmapDirectory::open(path).context("Failed to open index directory")?;
        let index =
            Index::open_or_create(dir, build_schema()).context("Failed to open or create index")?;

        info!("[SEARCH] Opened search index at {:?}", path);
        Self::from_index(index, ReloadPolicy::OnCommitWithDelay)
    }

    /// Create an in-memory index
    pub fn in_memory() -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()), ReloadPolicy::Manual)
    }

    fn from_index(index: Index, policy: ReloadPolicy) -> Result<Self> {
        let reader = index
            .reader_builder()
            .reload_policy(policy)
            .try_into()
            .context("Failed to create index reader")?;
        let fields = SchemaFields::new(&index.schema())?;
        let writer = index
            .writer(DEFAULT_HEAP_SIZE)
            .context("Failed to create index writer")?;

        Ok(Self {
            index,
            reader,
            fields,
            writer: Mutex::new(writer),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, IndexWriter>> {
        self.writer
            .lock()
            .map_err(|e| anyhow!("Lock poisoned: {}", e))
    }

    /// Index a single email
    ///
    /// This implements upsert semantics - if an email with the same ID exists,
    /// it will be replaced.
    pub fn index_email(&self, email: &Email) -> Result<()> {
        let writer = self.writer()?;
        self.add_document(&writer, email)
    }

    fn add_document(&self, writer: &IndexWriter, email: &Email) -> Result<()> {
        let email_id = email.id.to_string();
        writer.delete_term(Term::from_field_text(self.fields.email_id, &email_id));

        let mut doc = TantivyDocument::new();
        doc.add_text(self.fields.email_id, &email_id);
        doc.add_text(self.fields.thread_id, email.thread_id.to_string());
        doc.add_text(self.fields.tenant_id, email.tenant_id.to_string());
        doc.add_text(self.fields.user_id, email.user_id.to_string());

        doc.add_text(self.fields.subject, &email.subject);
        match (&email.body_text, &email.body_html) {
            (Some(text), _) => doc.add_text(self.fields.body_text, text),
            // Snippet is already tag-stripped
            (None, Some(_)) => doc.add_text(self.fields.body_text, &email.snippet),
            (None, None) => {}
        }
        if let Some(name) = &email.from.name {
            doc.add_text(self.fields.from, name);
        }
        doc.add_text(self.fields.from_email, &email.from.email);
        doc.add_i64(self.fields.activity_ms, email.activity_at().timestamp_millis());

        writer.add_document(doc)?;
        Ok(())
    }

    /// Remove emails from the index
    pub fn remove_emails(&self, ids: &[EmailId]) -> Result<()> {
        let writer = self.writer()?;
        for id in ids {
            writer.delete_term(Term::from_field_text(self.fields.email_id, &id.to_string()));
        }
        Ok(())
    }

    /// Commit pending changes
    pub fn commit(&self) -> Result<()> {
        self.writer()?.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Ranked emails matching `query` within one mailbox
    ///
    /// Ordered by relevance over subject and body; equal scores fall back to
    /// the most recent message first. The collector ranks on both keys, so
    /// pages are consistent across the whole result set. An offset at or past
    /// the match count yields an empty page.
    pub fn search(
        &self,
        scope: MailboxScope,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<SearchHits> {
        let searcher = self.reader.searcher();
        let query = self.build_query(scope, query);

        // The collector reserves room for offset + limit entries
        let total = searcher.search(&query, &Count)?;
        if limit == 0 || offset >= total {
            return Ok(SearchHits {
                hits: Vec::new(),
                total,
            });
        }

        let collector = TopDocs::with_limit(limit)
            .and_offset(offset)
            .tweak_score(|segment: &SegmentReader| {
                let activity = segment.fast_fields().i64(ACTIVITY_MS).ok();
                move |doc: DocId, score: Score| {
                    let activity_ms = activity
                        .as_ref()
                        .and_then(|column| column.first(doc))
                        .unwrap_or(i64::MIN);
                    (score, activity_ms)
                }
            });
        let top_docs = searcher.search(&query, &collector)?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for ((score, activity_ms), address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let email_id = doc
                .get_first(self.fields.email_id)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<EmailId>().ok());
            let thread_id = doc
                .get_first(self.fields.thread_id)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<ThreadId>().ok());
            match (email_id, thread_id) {
                (Some(email_id), Some(thread_id)) => hits.push(SearchHit {
                    email_id,
                    thread_id,
                    score,
                    activity_ms,
                }),
                _ => warn!("[SEARCH] Skipping document with malformed ids"),
            }
        }

        Ok(SearchHits { hits, total })
    }

    /// Scope terms are mandatory; free text must match subject or body
    fn build_query(&self, scope: MailboxScope, text: &str) -> Box<dyn Query> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![
            (
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.fields.tenant_id, &scope.tenant_id.to_string()),
                    IndexRecordOption::Basic,
                )),
            ),
            (
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.fields.user_id, &scope.user_id.to_string()),
                    IndexRecordOption::Basic,
                )),
            ),
        ];

        let parser =
            QueryParser::for_index(&self.index, vec![self.fields.subject, self.fields.body_text]);
        let (text_query, errors) = parser.parse_query_lenient(text);
        if !errors.is_empty() {
            debug!("[SEARCH] Lenient parse of {:?} dropped {} terms", text, errors.len());
        }
        clauses.push((Occur::Must, text_query));

        Box::new(BooleanQuery::new(clauses))
    }

    /// Rebuild entire index from storage
    ///
    /// Clears the existing index and re-indexes all emails from the store.
    /// Returns the number of emails indexed.
    pub fn rebuild(&self, store: &dyn MailboxStore) -> Result<usize> {
        let emails = store.all_emails()?;
        {
            let mut writer = self.writer()?;
            writer.delete_all_documents()?;
            for email in &emails {
                self.add_document(&writer, email)?;
            }
            writer.commit()?;
        }
        self.reader.reload()?;

        info!("[SEARCH] Rebuilt search index with {} emails", emails.len());
        Ok(emails.len())
    }
}
