//! Tantivy schema definition for email indexing

use tantivy::schema::{
    FAST, Field, IndexRecordOption, STORED, STRING, Schema, TextFieldIndexing, TextOptions,
};

/// Fast field holding the activity timestamp, read while ranking
pub const ACTIVITY_MS: &str = "activity_ms";

/// Build the Tantivy schema for email indexing
///
/// Fields indexed:
/// - email_id, thread_id: String IDs for retrieval
/// - tenant_id, user_id: Exact-match scope terms, required on every query
/// - subject, body_text: Full-text searchable content
/// - from, from_email: Sender search
/// - activity_ms: Recency tie-break
pub fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    // ID fields (stored for retrieval, STRING for exact match)
    builder.add_text_field("email_id", STRING | STORED);
    builder.add_text_field("thread_id", STRING | STORED);
    builder.add_text_field("tenant_id", STRING);
    builder.add_text_field("user_id", STRING);

    // Full-text fields with positions for phrase queries
    let text_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_index_option(IndexRecordOption::WithFreqsAndPositions)
            .set_tokenizer("default"),
    );

    builder.add_text_field("subject", text_opts.clone());
    builder.add_text_field("body_text", text_opts.clone());
    builder.add_text_field("from", text_opts.clone());
    builder.add_text_field("from_email", text_opts);

    builder.add_i64_field(ACTIVITY_MS, FAST | STORED);

    builder.build()
}

/// Field handles for quick access during indexing and searching
pub struct SchemaFields {
    pub email_id: Field,
    pub thread_id: Field,
    pub tenant_id: Field,
    pub user_id: Field,
    pub subject: Field,
    pub body_text: Field,
    pub from: Field,
    pub from_email: Field,
    pub activity_ms: Field,
}

impl SchemaFields {
    /// Create field handles from a schema
    pub fn new(schema: &Schema) -> tantivy::Result<Self> {
        Ok(Self {
            email_id: schema.get_field("email_id")?,
            thread_id: schema.get_field("thread_id")?,
            tenant_id: schema.get_field("tenant_id")?,
            user_id: schema.get_field("user_id")?,
            subject: schema.get_field("subject")?,
            body_text: schema.get_field("body_text")?,
            from: schema.get_field("from")?,
            from_email: schema.get_field("from_email")?,
            activity_ms: schema.get_field(ACTIVITY_MS)?,
        })
    }
}
