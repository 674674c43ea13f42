use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::StoreError;

pub const SUMMARY_SCHEMA: &str = "course_evals";
pub const SUMMARY_TABLE: &str = "class_summaries";

/// Suffix of the respondent-count column paired with each value column.
pub const COUNT_SUFFIX: &str = "_N";

/// Class attributes leading every summary row, as (column, expression).
const CLASS_COLUMNS: [(&str, &str); 9] = [
    ("AcademicYear", "c.academic_year"),
    ("Term", "t.name"),
    ("Department", "c.department"),
    ("Course", "c.department || '-' || c.code"),
    ("Name", "c.name"),
    ("Section", "c.section"),
    ("CRN", "c.crn"),
    ("Instructor", "c.instructor"),
    ("ADLN", "c.adln"),
];

static SHORT_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid regex"));

pub fn is_valid_short_key(key: &str) -> bool {
    SHORT_KEY_RE.is_match(key)
        && !key.ends_with(COUNT_SUFFIX)
        && !CLASS_COLUMNS.iter().any(|(column, _)| *column == key)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryStats {
    pub question_keys: usize,
    pub rows: i64,
}

/// Builds the wide table: one row per class, and a weighted average plus
/// respondent count column for every question short key.
pub fn summary_table_sql(keys: &[String]) -> Result<String, StoreError> {
    let mut columns: Vec<String> = CLASS_COLUMNS
        .iter()
        .map(|(column, expr)| format!("{expr} AS \"{column}\""))
        .collect();

    for key in keys {
        if !is_valid_short_key(key) {
            return Err(StoreError::InvalidShortKey(key.clone()));
        }
        columns.push(format!(
            "MAX(CASE WHEN q.short_string = '{key}' THEN qa.avg END) AS \"{key}\""
        ));
        columns.push(format!(
            "MAX(CASE WHEN q.short_string = '{key}' THEN qa.respondents END) AS \"{key}{COUNT_SUFFIX}\""
        ));
    }

    Ok(format!(
        r#"CREATE TABLE {SUMMARY_SCHEMA}.{SUMMARY_TABLE} AS
SELECT
    {columns}
FROM course_evals.classes c
LEFT JOIN course_evals.terms t ON t.term_id = c.term_id
LEFT JOIN course_evals.question_avgs qa ON qa.class_id = c.class_id
LEFT JOIN course_evals.questions q ON q.question_id = qa.question_id
GROUP BY c.class_id, t.name
ORDER BY c.class_id"#,
        columns = columns.join(",\n    ")
    ))
}

async fn short_keys(pool: &PgPool) -> Result<Vec<String>, StoreError> {
    let keys: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT short_string
        FROM course_evals.questions
        WHERE short_string IS NOT NULL
        GROUP BY short_string
        ORDER BY MIN(question_id)
        "#,
    )
    .fetch_all(pool)
    .await?;

    let (valid, invalid): (Vec<String>, Vec<String>) =
        keys.into_iter().partition(|key| is_valid_short_key(key));
    for key in &invalid {
        warn!(key = %key, "skipping question short key that is not a usable column name");
    }
    Ok(valid)
}

/// Replaces the summary table. Drop and create share one transaction, so
/// readers see either the previous table or the new one.
pub async fn rebuild(pool: &PgPool) -> Result<SummaryStats, StoreError> {
    let keys = short_keys(pool).await?;
    let create = summary_table_sql(&keys)?;

    let mut tx = pool.begin().await?;
    sqlx::query(&format!(
        "DROP TABLE IF EXISTS {SUMMARY_SCHEMA}.{SUMMARY_TABLE}"
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query(&create).execute(&mut *tx).await?;
    tx.commit().await?;

    let rows: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {SUMMARY_SCHEMA}.{SUMMARY_TABLE}"
    ))
    .fetch_one(pool)
    .await?;

    info!(question_keys = keys.len(), rows, "rebuilt class summaries");
    Ok(SummaryStats {
        question_keys: keys.len(),
        rows,
    })
}

/// Column names of the summary table in table order.
pub async fn summary_columns(pool: &PgPool) -> Result<Vec<String>, StoreError> {
    let columns = sqlx::query_scalar(
        r#"
        SELECT column_name::TEXT
        FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ORDER BY ordinal_position
        "#,
    )
    .bind(SUMMARY_SCHEMA)
    .bind(SUMMARY_TABLE)
    .fetch_all(pool)
    .await?;
    Ok(columns)
}
