use std::fmt;
use std::num::ParseIntError;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("login failed: {0}")]
    Auth(String),

    #[error("timed out fetching {reference}")]
    Timeout { reference: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl CrawlError {
    /// Maps a transport failure, keeping timeouts distinguishable.
    pub fn from_request(reference: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CrawlError::Timeout {
                reference: reference.to_string(),
            }
        } else {
            CrawlError::Http(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStage {
    Header,
    Body,
}

impl fmt::Display for ParseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseStage::Header => f.write_str("header"),
            ParseStage::Body => f.write_str("body"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("parse error in {stage} stage: {cause}")]
pub struct ParseError {
    pub stage: ParseStage,
    pub cause: String,
    #[source]
    pub source: Option<ParseIntError>,
}

impl ParseError {
    pub fn header(cause: impl Into<String>) -> Self {
        Self {
            stage: ParseStage::Header,
            cause: cause.into(),
            source: None,
        }
    }

    pub fn body(cause: impl Into<String>) -> Self {
        Self {
            stage: ParseStage::Body,
            cause: cause.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, err: ParseIntError) -> Self {
        self.source = Some(err);
        self
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate row violates {constraint}")]
    Duplicate { constraint: String },

    #[error("unknown column {column} on {table}")]
    UnknownColumn { table: String, column: String },

    #[error("invalid question short key {0:?}")]
    InvalidShortKey(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("unexpected stored value: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    /// A second copy of a class that is already stored, as opposed to a
    /// conflict inside one class's rows.
    pub fn is_class_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { constraint } if constraint == crate::db::CLASS_KEY)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StoreError::Duplicate {
                    constraint: db_err.constraint().unwrap_or("unique key").to_string(),
                };
            }
        }
        StoreError::Database(err)
    }
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("value column {column} has no paired {column}_N count column")]
    Configuration { column: String },

    #[error("unknown column {0}")]
    UnknownColumn(String),

    #[error("request declares no columns")]
    NoColumns,

    #[error("summary table has not been built")]
    MissingSummary,

    #[error("invalid order direction {0:?}, expected asc or desc")]
    InvalidDirection(String),

    #[error("order references column {index} but only {len} columns were declared")]
    InvalidOrderColumn { index: usize, len: usize },

    #[error("invalid paging: {0}")]
    InvalidPaging(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        QueryError::Store(StoreError::from(err))
    }
}

/// Failures that stop a scrape run rather than a single item.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error(transparent)]
    Crawl(#[from] CrawlError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
