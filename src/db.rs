use std::collections::HashSet;
use std::path::Path;

use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{CatalogQuestion, Evaluation, FailedGroup, FailedScrape, QuestionInstance};
use crate::summary;

const SCHEMA_SQL: &str = include_str!("../migrations/0001_course_evals.sql");

/// Unique key of a stored class: (crn, academic_year, instructor).
pub const CLASS_KEY: &str = "uc_class";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Terms,
    Classes,
    Questions,
    AnswerFields,
    FailedScrapes,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Terms,
        Table::Classes,
        Table::Questions,
        Table::AnswerFields,
        Table::FailedScrapes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Terms => "terms",
            Table::Classes => "classes",
            Table::Questions => "questions",
            Table::AnswerFields => "answer_fields",
            Table::FailedScrapes => "failed_scrapes",
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            Table::Terms => "term_id",
            Table::Classes => "class_id",
            Table::Questions => "question_id",
            Table::AnswerFields => "answer_field_id",
            Table::FailedScrapes => "failed_scrape_id",
        }
    }

    fn columns(self) -> &'static [&'static str] {
        match self {
            Table::Terms => &["term_id", "name", "month"],
            Table::Classes => &[
                "class_id",
                "crn",
                "academic_year",
                "term_id",
                "name",
                "department",
                "code",
                "section",
                "instructor",
                "adln",
            ],
            Table::Questions => &["question_id", "num", "full_string", "short_string"],
            Table::AnswerFields => &[
                "answer_field_id",
                "answer_text",
                "weight",
                "respondents",
                "question_id",
                "class_id",
            ],
            Table::FailedScrapes => &[
                "failed_scrape_id",
                "crn",
                "academic_year",
                "adln",
                "reason",
                "failed_at",
            ],
        }
    }

    fn check_column(self, column: &str) -> Result<(), StoreError> {
        if self.columns().contains(&column) {
            Ok(())
        } else {
            Err(StoreError::UnknownColumn {
                table: self.name().to_string(),
                column: column.to_string(),
            })
        }
    }
}

/// One group of a `group_concat` call: the grouping values followed by the
/// collected column values, all in their text form.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedColumn {
    pub keys: Vec<String>,
    pub values: Vec<String>,
}

pub async fn init_db(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Drops every table and view, then recreates the schema with the seeded terms.
pub async fn reset(pool: &PgPool) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::raw_sql("DROP SCHEMA IF EXISTS course_evals CASCADE")
        .execute(&mut *tx)
        .await?;
    sqlx::raw_sql(SCHEMA_SQL).execute(&mut *tx).await?;
    tx.commit().await?;
    info!("schema reset");
    Ok(())
}

/// Stores one evaluation with its questions and answers. Nothing is kept if
/// any row of the tree fails.
pub async fn store_evaluation(
    pool: &PgPool,
    evaluation: &Evaluation,
    adln: bool,
) -> Result<i32, StoreError> {
    let mut tx = pool.begin().await?;

    let term_id: Option<i32> = match evaluation.term {
        Some(term) => {
            sqlx::query_scalar("SELECT term_id FROM course_evals.terms WHERE name = $1")
                .bind(term.as_str())
                .fetch_optional(&mut *tx)
                .await?
        }
        None => None,
    };

    let class_id: i32 = sqlx::query_scalar(
        r#"
        INSERT INTO course_evals.classes
        (crn, academic_year, term_id, name, department, code, section, instructor, adln)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING class_id
        "#,
    )
    .bind(evaluation.crn)
    .bind(evaluation.academic_year)
    .bind(term_id)
    .bind(&evaluation.name)
    .bind(&evaluation.department)
    .bind(&evaluation.code)
    .bind(&evaluation.section)
    .bind(&evaluation.instructor)
    .bind(adln)
    .fetch_one(&mut *tx)
    .await?;

    for question in &evaluation.questions {
        let question_id = resolve_question(&mut tx, question).await?;

        for answer in &question.answers {
            sqlx::query(
                r#"
                INSERT INTO course_evals.answer_fields
                (answer_text, weight, respondents, question_id, class_id)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(answer.answer_text.as_deref())
            .bind(answer.weight)
            .bind(answer.respondents)
            .bind(question_id)
            .bind(class_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    debug!(class_id, crn = evaluation.crn, "stored evaluation");
    Ok(class_id)
}

/// Reuses the question with the same number and text, inserting it otherwise.
async fn resolve_question(
    conn: &mut PgConnection,
    question: &QuestionInstance,
) -> Result<i32, StoreError> {
    let existing: Option<i32> = sqlx::query_scalar(
        "SELECT question_id FROM course_evals.questions WHERE num = $1 AND full_string = $2",
    )
    .bind(&question.number)
    .bind(&question.full_text)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(question_id) = existing {
        return Ok(question_id);
    }

    let question_id: i32 = sqlx::query_scalar(
        r#"
        INSERT INTO course_evals.questions (num, full_string, short_string)
        VALUES ($1, $2, $3)
        RETURNING question_id
        "#,
    )
    .bind(&question.number)
    .bind(&question.full_text)
    .bind(question.default_short_key())
    .fetch_one(&mut *conn)
    .await?;

    debug!(question_id, number = %question.number, "stored new question");
    Ok(question_id)
}

pub async fn record_failure(pool: &PgPool, failed: &FailedScrape) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO course_evals.failed_scrapes (crn, academic_year, adln, reason)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(failed.crn)
    .bind(failed.academic_year)
    .bind(failed.adln)
    .bind(failed.reason.as_deref())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_failures(pool: &PgPool) -> Result<Vec<FailedScrape>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT crn, academic_year, adln, reason, failed_at
        FROM course_evals.failed_scrapes
        ORDER BY academic_year, adln, crn
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut failures = Vec::new();
    for row in rows {
        failures.push(FailedScrape {
            crn: row.try_get("crn")?,
            academic_year: row.try_get("academic_year")?,
            adln: row.try_get("adln")?,
            reason: row.try_get("reason")?,
            failed_at: row.try_get("failed_at")?,
        });
    }

    Ok(failures)
}

/// Deletes the recorded failures of one (year, adln) group.
pub async fn clear_failed_group(pool: &PgPool, group: &FailedGroup) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        DELETE FROM course_evals.failed_scrapes
        WHERE academic_year = $1 AND adln = $2 AND crn = ANY($3)
        "#,
    )
    .bind(group.academic_year)
    .bind(group.adln)
    .bind(&group.crns)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn table_counts(pool: &PgPool) -> Result<Vec<(Table, i64)>, StoreError> {
    let mut counts = Vec::with_capacity(Table::ALL.len());
    for table in Table::ALL {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM course_evals.{}",
            table.name()
        ))
        .fetch_one(pool)
        .await?;
        counts.push((table, count));
    }
    Ok(counts)
}

pub async fn stored_crns(pool: &PgPool, year: i32, adln: bool) -> Result<HashSet<i32>, StoreError> {
    let crns: Vec<i32> = sqlx::query_scalar(
        "SELECT DISTINCT crn FROM course_evals.classes WHERE academic_year = $1 AND adln = $2",
    )
    .bind(year)
    .bind(adln)
    .fetch_all(pool)
    .await?;
    Ok(crns.into_iter().collect())
}

/// Collects `column` per distinct combination of `groups`, like a
/// comma-joined GROUP_CONCAT split back into a list.
pub async fn group_concat(
    pool: &PgPool,
    table: Table,
    column: &str,
    groups: &[&str],
) -> Result<Vec<GroupedColumn>, StoreError> {
    table.check_column(column)?;
    for group in groups {
        table.check_column(group)?;
    }

    let mut query = String::from("SELECT ");
    for group in groups {
        query.push_str(&format!("CAST({group} AS TEXT) AS {group}, "));
    }
    query.push_str(&format!(
        "string_agg(CAST({column} AS TEXT), ',' ORDER BY {id}) AS {column} FROM course_evals.{table}",
        id = table.id_column(),
        table = table.name(),
    ));
    if !groups.is_empty() {
        let joined = groups.join(", ");
        query.push_str(&format!(" GROUP BY {joined} ORDER BY {joined}"));
    }

    let rows = sqlx::query(&query).fetch_all(pool).await?;
    let mut grouped = Vec::new();

    for row in rows {
        let mut keys = Vec::with_capacity(groups.len());
        for index in 0..groups.len() {
            let key: Option<String> = row.try_get(index)?;
            keys.push(key.unwrap_or_default());
        }
        let joined: Option<String> = row.try_get(groups.len())?;
        let values: Vec<String> = joined
            .map(|joined| joined.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        if !values.is_empty() {
            grouped.push(GroupedColumn { keys, values });
        }
    }

    Ok(grouped)
}

pub async fn failed_groups(pool: &PgPool) -> Result<Vec<FailedGroup>, StoreError> {
    let grouped = group_concat(
        pool,
        Table::FailedScrapes,
        "crn",
        &["academic_year", "adln"],
    )
    .await?;
    grouped.iter().map(failed_group_from).collect()
}

fn failed_group_from(group: &GroupedColumn) -> Result<FailedGroup, StoreError> {
    let [year, adln] = group.keys.as_slice() else {
        return Err(StoreError::Decode(format!(
            "expected year and adln keys, got {:?}",
            group.keys
        )));
    };
    let academic_year = year
        .parse()
        .map_err(|_| StoreError::Decode(format!("academic year {year:?}")))?;
    let adln = match adln.as_str() {
        "true" => true,
        "false" => false,
        other => return Err(StoreError::Decode(format!("adln flag {other:?}"))),
    };
    let mut crns = Vec::with_capacity(group.values.len());
    for value in &group.values {
        crns.push(
            value
                .parse()
                .map_err(|_| StoreError::Decode(format!("crn {value:?}")))?,
        );
    }

    Ok(FailedGroup {
        academic_year,
        adln,
        crns,
    })
}

/// Loads a `Num,ShortString,FullString` catalog, setting the pivot key of
/// each listed question.
pub async fn import_questions(pool: &PgPool, csv_path: &Path) -> Result<usize, StoreError> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut imported = 0usize;

    for result in reader.deserialize::<CatalogQuestion>() {
        let row = result?;
        if !summary::is_valid_short_key(&row.short_key) {
            return Err(StoreError::InvalidShortKey(row.short_key));
        }

        sqlx::query(
            r#"
            INSERT INTO course_evals.questions (num, full_string, short_string)
            VALUES ($1, $2, $3)
            ON CONFLICT (num, full_string) DO UPDATE
            SET short_string = EXCLUDED.short_string
            "#,
        )
        .bind(&row.number)
        .bind(&row.full_text)
        .bind(&row.short_key)
        .execute(pool)
        .await?;
        imported += 1;
    }

    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnswerField, TermName};
    use pretty_assertions::assert_eq;

    fn question(number: &str, text: &str) -> QuestionInstance {
        QuestionInstance {
            number: number.to_string(),
            full_text: text.to_string(),
            answers: vec![
                AnswerField {
                    answer_text: None,
                    weight: Some(1),
                    respondents: 3,
                },
                AnswerField {
                    answer_text: None,
                    weight: Some(5),
                    respondents: 1,
                },
            ],
        }
    }

    fn evaluation(crn: i32, instructor: &str) -> Evaluation {
        Evaluation {
            crn,
            academic_year: 2016,
            term: Some(TermName::B),
            name: "Algorithms".to_string(),
            department: "CS".to_string(),
            code: "2223".to_string(),
            section: "B01".to_string(),
            instructor: instructor.to_string(),
            questions: vec![question("1A", "Overall quality of this course")],
        }
    }

    #[test]
    fn group_columns_come_from_a_closed_set() {
        assert!(Table::FailedScrapes.check_column("crn").is_ok());
        let err = Table::FailedScrapes.check_column("crn; DROP TABLE x").unwrap_err();
        assert!(matches!(err, StoreError::UnknownColumn { .. }));
    }

    #[test]
    fn failed_group_decodes_text_keys() {
        let group = GroupedColumn {
            keys: vec!["2015".to_string(), "true".to_string()],
            values: vec!["30071".to_string(), "30072".to_string()],
        };
        assert_eq!(
            failed_group_from(&group).unwrap(),
            FailedGroup {
                academic_year: 2015,
                adln: true,
                crns: vec![30071, 30072],
            }
        );

        let bad = GroupedColumn {
            keys: vec!["2015".to_string(), "maybe".to_string()],
            values: vec!["1".to_string()],
        };
        assert!(matches!(failed_group_from(&bad), Err(StoreError::Decode(_))));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL pointing at Postgres"]
    async fn same_question_is_stored_once(pool: PgPool) {
        let q = question("1A", "Overall quality of this course");
        let mut conn = pool.acquire().await.unwrap();
        let first = resolve_question(&mut conn, &q).await.unwrap();
        let second = resolve_question(&mut conn, &q).await.unwrap();
        drop(conn);
        assert_eq!(first, second);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM course_evals.questions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL pointing at Postgres"]
    async fn duplicate_class_is_reported(pool: PgPool) {
        store_evaluation(&pool, &evaluation(30071, "Smith"), false)
            .await
            .unwrap();
        store_evaluation(&pool, &evaluation(30071, "Jones"), false)
            .await
            .unwrap();

        let err = store_evaluation(&pool, &evaluation(30071, "Smith"), false)
            .await
            .unwrap_err();
        assert!(err.is_class_duplicate());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL pointing at Postgres"]
    async fn failed_answer_rolls_back_the_class(pool: PgPool) {
        let mut broken = evaluation(40000, "Smith");
        broken.questions[0].answers[1].respondents = -1;

        let err = store_evaluation(&pool, &broken, true).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert!(stored_crns(&pool, 2016, true).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL pointing at Postgres"]
    async fn unlabeled_answers_may_repeat(pool: PgPool) {
        let mut labeled = evaluation(40001, "Smith");
        labeled.questions = vec![QuestionInstance {
            number: "24".to_string(),
            full_text: "Hours per week".to_string(),
            answers: vec![
                AnswerField {
                    answer_text: None,
                    weight: None,
                    respondents: 2,
                },
                AnswerField {
                    answer_text: None,
                    weight: None,
                    respondents: 5,
                },
            ],
        }];

        store_evaluation(&pool, &labeled, false).await.unwrap();
        let answers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM course_evals.answer_fields")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(answers, 2);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL pointing at Postgres"]
    async fn failures_group_by_year_and_flag(pool: PgPool) {
        for (crn, year, adln) in [(1, 2015, true), (2, 2015, true), (3, 2016, false)] {
            record_failure(&pool, &FailedScrape::new(crn, year, adln, "timeout"))
                .await
                .unwrap();
        }

        let groups = failed_groups(&pool).await.unwrap();
        assert_eq!(
            groups,
            vec![
                FailedGroup {
                    academic_year: 2015,
                    adln: true,
                    crns: vec![1, 2],
                },
                FailedGroup {
                    academic_year: 2016,
                    adln: false,
                    crns: vec![3],
                },
            ]
        );

        assert_eq!(clear_failed_group(&pool, &groups[0]).await.unwrap(), 2);
        let remaining: Vec<i32> = fetch_failures(&pool)
            .await
            .unwrap()
            .iter()
            .map(|failed| failed.crn)
            .collect();
        assert_eq!(remaining, vec![3]);
    }
}
