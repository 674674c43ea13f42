use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::QueryError;
use crate::summary::{self, COUNT_SUFFIX, SUMMARY_SCHEMA, SUMMARY_TABLE};

/// `length` value a table client sends for "all rows".
pub const UNBOUNDED_LENGTH: i64 = -1;

const FILTERED_COUNT_COLUMN: &str = "__records_filtered";
const SUMMARY_ALIAS: &str = "s";

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub draw: serde_json::Value,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub search: Option<Search>,
    #[serde(default)]
    pub order: Vec<OrderSpec>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub length: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default = "default_true")]
    pub searchable: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Search {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderSpec {
    pub column: usize,
    pub dir: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub draw: serde_json::Value,
    pub records_total: i64,
    pub records_filtered: i64,
    pub data: Vec<Vec<String>>,
}

/// How one requested column takes part in the aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnTag {
    /// Visible parameter column, passed through and grouped on.
    Group,
    /// Respondent count column, summed.
    Sum,
    /// Value column, averaged with its `_N` column as weight.
    WeightedAverage,
    /// Blank placeholder that keeps column positions stable.
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn parse(dir: &str) -> Result<Self, QueryError> {
        match dir {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(QueryError::InvalidDirection(other.to_string())),
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

/// SQL text plus the values bound to it, in placeholder order: the search
/// pattern first when present, then limit and offset. `count_sql` counts the
/// filtered rows without paging and binds only the search pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub count_sql: String,
    pub search_pattern: Option<String>,
    pub page: Option<Page>,
}

pub fn classify(columns: &[ColumnSpec]) -> Result<Vec<ColumnTag>, QueryError> {
    let names: HashSet<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let mut tags = Vec::with_capacity(columns.len());
    let mut previous: Option<&ColumnSpec> = None;

    for column in columns {
        let is_count = column.name.ends_with(COUNT_SUFFIX);
        let follows_visible_value = previous.is_some_and(|p| p.visible && !p.searchable);

        let tag = if !column.visible && !(is_count && follows_visible_value) {
            ColumnTag::Hidden
        } else if column.visible && column.searchable {
            ColumnTag::Group
        } else if !column.searchable {
            if is_count {
                ColumnTag::Sum
            } else if names.contains(format!("{}{COUNT_SUFFIX}", column.name).as_str()) {
                ColumnTag::WeightedAverage
            } else {
                return Err(QueryError::Configuration {
                    column: column.name.clone(),
                });
            }
        } else {
            ColumnTag::Hidden
        };

        tags.push(tag);
        previous = Some(column);
    }

    Ok(tags)
}

pub fn compile(request: &QueryRequest, known_columns: &[String]) -> Result<CompiledQuery, QueryError> {
    if request.columns.is_empty() {
        return Err(QueryError::NoColumns);
    }
    for column in &request.columns {
        if !known_columns.iter().any(|known| *known == column.name) {
            return Err(QueryError::UnknownColumn(column.name.clone()));
        }
    }

    let mut order = Vec::with_capacity(request.order.len());
    for entry in &request.order {
        if entry.column >= request.columns.len() {
            return Err(QueryError::InvalidOrderColumn {
                index: entry.column,
                len: request.columns.len(),
            });
        }
        order.push((entry.column, Direction::parse(&entry.dir)?));
    }

    let page = page(request.start, request.length)?;
    let tags = classify(&request.columns)?;

    let mut select = Vec::with_capacity(tags.len());
    let mut group_by = Vec::new();
    for (column, tag) in request.columns.iter().zip(&tags) {
        let input = column_ref(&column.name);
        let expr = match tag {
            ColumnTag::Group => {
                group_by.push(input.clone());
                format!("CAST({input} AS TEXT)")
            }
            ColumnTag::Sum => format!("CAST(SUM({input}) AS TEXT)"),
            ColumnTag::WeightedAverage => format!(
                "CAST(ROUND(CAST({} AS NUMERIC), 4) AS TEXT)",
                weighted_average(&column.name)
            ),
            ColumnTag::Hidden => "''".to_string(),
        };
        select.push(format!("{expr} AS {}", quote_ident(&column.name)));
    }
    let select = select.join(", ");

    let mut body = format!(" FROM {SUMMARY_SCHEMA}.{SUMMARY_TABLE} AS {SUMMARY_ALIAS}");
    let mut placeholder = 0;

    let search_value = request
        .search
        .as_ref()
        .map(|search| search.value.as_str())
        .unwrap_or("");
    let search_pattern = if search_value.is_empty() {
        None
    } else {
        placeholder += 1;
        let filters: Vec<String> = request
            .columns
            .iter()
            .map(|column| format!("CAST({} AS TEXT) LIKE ${placeholder}", column_ref(&column.name)))
            .collect();
        body.push_str(&format!(" WHERE {}", filters.join(" OR ")));
        Some(format!("%{}%", escape_like(search_value)))
    };

    if !group_by.is_empty() {
        body.push_str(&format!(" GROUP BY {}", group_by.join(", ")));
    }

    let count_sql = format!("SELECT COUNT(*) FROM (SELECT {select}{body}) AS filtered");
    let mut sql = format!("SELECT {select}, COUNT(*) OVER () AS {FILTERED_COUNT_COLUMN}{body}");

    let order_terms: Vec<String> = order
        .iter()
        .filter_map(|(index, direction)| {
            let column = &request.columns[*index];
            order_expr(&column.name, tags[*index]).map(|expr| format!("{expr} {}", direction.as_sql()))
        })
        .collect();
    if !order_terms.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order_terms.join(", ")));
    }

    if page.is_some() {
        sql.push_str(&format!(
            " LIMIT ${} OFFSET ${}",
            placeholder + 1,
            placeholder + 2
        ));
    }

    Ok(CompiledQuery {
        sql,
        count_sql,
        search_pattern,
        page,
    })
}

/// Runs a request against the summary table.
pub async fn execute(pool: &PgPool, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
    let known = summary::summary_columns(pool).await?;
    if known.is_empty() {
        return Err(QueryError::MissingSummary);
    }
    let compiled = compile(request, &known)?;
    debug!(sql = %compiled.sql, "compiled summary query");

    let records_total: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {SUMMARY_SCHEMA}.{SUMMARY_TABLE}"
    ))
    .fetch_one(pool)
    .await?;

    let mut query = sqlx::query(&compiled.sql);
    if let Some(pattern) = &compiled.search_pattern {
        query = query.bind(pattern);
    }
    if let Some(page) = compiled.page {
        query = query.bind(page.limit).bind(page.offset);
    }
    let rows = query.fetch_all(pool).await?;

    let width = request.columns.len();
    let mut records_filtered = 0;
    let mut data = Vec::with_capacity(rows.len());
    for row in rows {
        records_filtered = row.try_get::<i64, _>(width)?;
        let mut cells = Vec::with_capacity(width);
        for index in 0..width {
            let cell: Option<String> = row.try_get(index)?;
            cells.push(escape_cell(&cell.unwrap_or_default()));
        }
        data.push(cells);
    }

    // An empty page past the end still reports the filtered total.
    if data.is_empty() && compiled.page.is_some() {
        let mut count = sqlx::query_scalar::<_, i64>(&compiled.count_sql);
        if let Some(pattern) = &compiled.search_pattern {
            count = count.bind(pattern);
        }
        records_filtered = count.fetch_one(pool).await?;
    }

    Ok(QueryResponse {
        draw: request.draw.clone(),
        records_total,
        records_filtered,
        data,
    })
}

fn page(start: Option<i64>, length: Option<i64>) -> Result<Option<Page>, QueryError> {
    match (start, length) {
        (None, None) => Ok(None),
        (Some(start), Some(length)) => {
            if start < 0 {
                return Err(QueryError::InvalidPaging(format!("negative start {start}")));
            }
            if length == UNBOUNDED_LENGTH {
                return Ok(None);
            }
            if length < 0 {
                return Err(QueryError::InvalidPaging(format!("negative length {length}")));
            }
            Ok(Some(Page {
                offset: start,
                limit: length,
            }))
        }
        _ => Err(QueryError::InvalidPaging(
            "start and length must be given together".to_string(),
        )),
    }
}

fn weighted_average(name: &str) -> String {
    let value = column_ref(name);
    let count = column_ref(&format!("{name}{COUNT_SUFFIX}"));
    format!("SUM({value} * {count}) / NULLIF(SUM({count}), 0)")
}

fn order_expr(name: &str, tag: ColumnTag) -> Option<String> {
    match tag {
        ColumnTag::Group => Some(column_ref(name)),
        ColumnTag::Sum => Some(format!("SUM({})", column_ref(name))),
        ColumnTag::WeightedAverage => Some(weighted_average(name)),
        ColumnTag::Hidden => None,
    }
}

/// The summary table's own column. A bare name in ORDER BY would resolve to
/// the text-cast output column instead.
fn column_ref(name: &str) -> String {
    format!("{SUMMARY_ALIAS}.{}", quote_ident(name))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn escape_cell(value: &str) -> String {
    value.replace('"', "\\\"")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDefinition {
    pub title: String,
    pub name: String,
    pub searchable: bool,
    pub visible: bool,
}

/// Column setup handed to a table client for the summary table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnLayout {
    pub columns: Vec<ColumnDefinition>,
    pub count_columns: Vec<usize>,
    pub value_columns: Vec<usize>,
    pub param_columns: Vec<usize>,
    pub initial_order: Vec<(usize, String)>,
}

pub const DEFAULT_VISIBLE: [&str; 3] = ["AcademicYear", "Instructor", "Course"];

/// Value and count columns are aggregated, everything else is a searchable
/// parameter. With no explicit `visible` list, the default parameters and the
/// first value column are shown.
pub fn column_layout(names: &[String], visible: &[String]) -> ColumnLayout {
    let is_count = |name: &str| name.ends_with(COUNT_SUFFIX);
    let is_value = |name: &str| names.iter().any(|n| *n == format!("{name}{COUNT_SUFFIX}"));

    let count_columns: Vec<usize> = (0..names.len()).filter(|&i| is_count(&names[i])).collect();
    let value_columns: Vec<usize> = (0..names.len()).filter(|&i| is_value(&names[i])).collect();
    let param_columns: Vec<usize> = (0..names.len())
        .filter(|i| !count_columns.contains(i) && !value_columns.contains(i))
        .collect();

    let shown: Vec<String> = if visible.is_empty() {
        DEFAULT_VISIBLE
            .iter()
            .map(|name| name.to_string())
            .chain(value_columns.first().map(|&i| names[i].clone()))
            .collect()
    } else {
        visible.to_vec()
    };

    let columns = names
        .iter()
        .enumerate()
        .map(|(index, name)| ColumnDefinition {
            title: name.clone(),
            name: name.clone(),
            searchable: param_columns.contains(&index),
            visible: shown.contains(name),
        })
        .collect();

    let initial_order = value_columns
        .first()
        .map(|&index| vec![(index, "desc".to_string())])
        .unwrap_or_default();

    ColumnLayout {
        columns,
        count_columns,
        value_columns,
        param_columns,
        initial_order,
    }
}
