use std::collections::HashSet;

use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::crawler::{ClassRef, PageSource};
use crate::db;
use crate::error::{CrawlError, ScrapeError, StoreError};
use crate::models::{Evaluation, FailedGroup, FailedScrape, RunSummary, YearCoverage};
use crate::parser;

/// Persistence needed by a scrape run.
#[allow(async_fn_in_trait)]
pub trait EvalStore {
    async fn store_evaluation(&self, evaluation: &Evaluation, adln: bool) -> Result<i32, StoreError>;

    async fn record_failure(&self, failed: &FailedScrape) -> Result<(), StoreError>;

    async fn failures(&self) -> Result<Vec<FailedScrape>, StoreError>;

    async fn failed_groups(&self) -> Result<Vec<FailedGroup>, StoreError>;

    async fn clear_failed_group(&self, group: &FailedGroup) -> Result<(), StoreError>;

    async fn stored_crns(&self, year: i32, adln: bool) -> Result<HashSet<i32>, StoreError>;
}

impl EvalStore for PgPool {
    async fn store_evaluation(&self, evaluation: &Evaluation, adln: bool) -> Result<i32, StoreError> {
        db::store_evaluation(self, evaluation, adln).await
    }

    async fn record_failure(&self, failed: &FailedScrape) -> Result<(), StoreError> {
        db::record_failure(self, failed).await
    }

    async fn failures(&self) -> Result<Vec<FailedScrape>, StoreError> {
        db::fetch_failures(self).await
    }

    async fn failed_groups(&self) -> Result<Vec<FailedGroup>, StoreError> {
        db::failed_groups(self).await
    }

    async fn clear_failed_group(&self, group: &FailedGroup) -> Result<(), StoreError> {
        let cleared = db::clear_failed_group(self, group).await?;
        debug!(year = group.academic_year, adln = group.adln, cleared, "cleared failed group");
        Ok(())
    }

    async fn stored_crns(&self, year: i32, adln: bool) -> Result<HashSet<i32>, StoreError> {
        db::stored_crns(self, year, adln).await
    }
}

/// What happened to one class reference. Failures and duplicates both carry
/// the reason recorded for them.
enum Outcome {
    Stored,
    Failed(String),
    Duplicate(String),
}

/// Scrapes every class of one (year, adln) listing, optionally narrowed to
/// `crns`. Per-class failures are recorded and skipped; login and store
/// bookkeeping failures end the run.
pub async fn process_listing<S, D>(
    source: &mut S,
    store: &D,
    year: i32,
    adln: bool,
    crns: &[i32],
) -> Result<RunSummary, ScrapeError>
where
    S: PageSource,
    D: EvalStore,
{
    let references = source.discover_urls(year, adln, crns).await?;
    let mut classes = Vec::with_capacity(references.len());
    for reference in &references {
        match ClassRef::parse(reference)? {
            Some(class) => classes.push(class),
            None => warn!(reference = %reference, year, adln, "listing link has no CRN, skipping"),
        }
    }
    process_classes(source, store, &classes, year, adln).await
}

/// Scrapes explicit references. Year and ADLN come from each reference and
/// fall back to the given defaults.
pub async fn process_classes<S, D>(
    source: &mut S,
    store: &D,
    classes: &[ClassRef],
    default_year: i32,
    default_adln: bool,
) -> Result<RunSummary, ScrapeError>
where
    S: PageSource,
    D: EvalStore,
{
    let mut summary = RunSummary::default();
    let total = classes.len();

    for (index, class) in classes.iter().enumerate() {
        let year = class.academic_year.unwrap_or(default_year);
        let adln = class.adln.unwrap_or(default_adln);
        info!(crn = class.crn, year, adln, "processing class {}/{}", index + 1, total);

        match process_one(source, store, class, adln).await? {
            Outcome::Stored => summary.stored += 1,
            Outcome::Duplicate(reason) => {
                store
                    .record_failure(&FailedScrape::new(class.crn, year, adln, reason))
                    .await?;
                summary.duplicates += 1;
            }
            Outcome::Failed(reason) => {
                store
                    .record_failure(&FailedScrape::new(class.crn, year, adln, reason))
                    .await?;
                summary.failed += 1;
            }
        }
    }

    info!(
        stored = summary.stored,
        failed = summary.failed,
        duplicates = summary.duplicates,
        "batch finished"
    );
    Ok(summary)
}

async fn process_one<S, D>(
    source: &mut S,
    store: &D,
    class: &ClassRef,
    adln: bool,
) -> Result<Outcome, ScrapeError>
where
    S: PageSource,
    D: EvalStore,
{
    let text = match source.fetch_page(&class.reference).await {
        Ok(text) => text,
        Err(err @ CrawlError::Auth(_)) | Err(err @ CrawlError::Protocol(_)) => {
            return Err(err.into())
        }
        Err(err) => {
            warn!(crn = class.crn, adln, error = %err, "download failed");
            return Ok(Outcome::Failed(err.to_string()));
        }
    };

    let evaluation = match parser::parse_evaluation(&text) {
        Ok(evaluation) => evaluation,
        Err(err) => {
            warn!(crn = class.crn, adln, stage = %err.stage, cause = %err.cause, "parse failed");
            return Ok(Outcome::Failed(err.to_string()));
        }
    };

    match store.store_evaluation(&evaluation, adln).await {
        Ok(class_id) => {
            debug!(class_id, crn = evaluation.crn, course = %evaluation.course_label(), "class stored");
            Ok(Outcome::Stored)
        }
        Err(err) if err.is_class_duplicate() => {
            error!(
                crn = evaluation.crn,
                year = evaluation.academic_year,
                adln,
                "class already stored; crawler or parser produced a duplicate"
            );
            Ok(Outcome::Duplicate(format!("duplicate: {err}")))
        }
        Err(err) => {
            warn!(crn = class.crn, adln, error = %err, "store failed");
            Ok(Outcome::Failed(err.to_string()))
        }
    }
}

/// Retries every recorded failure once, one (year, adln) group at a time.
/// A group is cleared only when its retry starts. Classes that are already
/// stored are dropped from the group; anything that fails again is recorded
/// again, and a retry that stops early records the rest of its group back.
pub async fn retry_failed<S, D>(source: &mut S, store: &D) -> Result<RunSummary, ScrapeError>
where
    S: PageSource,
    D: EvalStore,
{
    let groups = store.failed_groups().await?;

    let mut summary = RunSummary::default();
    for group in groups {
        let stored = store.stored_crns(group.academic_year, group.adln).await?;
        let mut seen = HashSet::new();
        let pending: Vec<i32> = group
            .crns
            .iter()
            .copied()
            .filter(|crn| !stored.contains(crn) && seen.insert(*crn))
            .collect();

        store.clear_failed_group(&group).await?;
        if pending.is_empty() {
            continue;
        }
        info!(
            year = group.academic_year,
            adln = group.adln,
            count = pending.len(),
            "retrying failed classes"
        );

        match process_listing(source, store, group.academic_year, group.adln, &pending).await {
            Ok(batch) => summary.absorb(batch),
            Err(err) => {
                let kept = restore_group(store, &group, &pending, &err).await?;
                match err {
                    ScrapeError::Crawl(CrawlError::Timeout { .. } | CrawlError::Http(_)) => {
                        warn!(year = group.academic_year, adln = group.adln, error = %err, "listing failed, keeping group");
                        summary.failed += kept;
                    }
                    err => return Err(err),
                }
            }
        }
    }

    Ok(summary)
}

/// Records again every pending class of a group that the interrupted retry
/// neither stored nor recorded itself.
async fn restore_group<D: EvalStore>(
    store: &D,
    group: &FailedGroup,
    pending: &[i32],
    err: &ScrapeError,
) -> Result<usize, ScrapeError> {
    let stored = store.stored_crns(group.academic_year, group.adln).await?;
    let recorded: HashSet<i32> = store
        .failures()
        .await?
        .into_iter()
        .filter(|f| f.academic_year == group.academic_year && f.adln == group.adln)
        .map(|f| f.crn)
        .collect();

    let mut kept = 0;
    for &crn in pending {
        if stored.contains(&crn) || recorded.contains(&crn) {
            continue;
        }
        store
            .record_failure(&FailedScrape::new(
                crn,
                group.academic_year,
                group.adln,
                format!("retry: {err}"),
            ))
            .await?;
        kept += 1;
    }
    Ok(kept)
}

/// Recorded failures whose class is still absent from the store.
pub async fn outstanding_failures<D: EvalStore>(store: &D) -> Result<Vec<FailedScrape>, ScrapeError> {
    let mut outstanding = Vec::new();
    let mut stored_by_listing: Vec<((i32, bool), HashSet<i32>)> = Vec::new();

    for failed in store.failures().await? {
        let key = (failed.academic_year, failed.adln);
        let position = match stored_by_listing.iter().position(|(k, _)| *k == key) {
            Some(position) => position,
            None => {
                let stored = store.stored_crns(key.0, key.1).await?;
                stored_by_listing.push((key, stored));
                stored_by_listing.len() - 1
            }
        };
        if !stored_by_listing[position].1.contains(&failed.crn) {
            outstanding.push(failed);
        }
    }

    Ok(outstanding)
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub coverage: Vec<YearCoverage>,
    pub missing: Vec<ClassRef>,
    pub fixed: Option<RunSummary>,
}

/// Compares every listed class against stored and failed classes, and
/// optionally scrapes the ones that are in neither.
pub async fn reconcile<S, D>(
    source: &mut S,
    store: &D,
    years: &[i32],
    fix: bool,
) -> Result<Reconciliation, ScrapeError>
where
    S: PageSource,
    D: EvalStore,
{
    let years = if years.is_empty() {
        source.discover_years().await?
    } else {
        years.to_vec()
    };
    let failures = store.failures().await?;
    let mut report = Reconciliation::default();

    for year in years {
        let mut coverage = YearCoverage {
            academic_year: year,
            listed: 0,
            missing: 0,
        };

        for adln in [true, false] {
            let mut known = store.stored_crns(year, adln).await?;
            known.extend(
                failures
                    .iter()
                    .filter(|f| f.academic_year == year && f.adln == adln)
                    .map(|f| f.crn),
            );

            for reference in source.discover_urls(year, adln, &[]).await? {
                let Some(class) = ClassRef::parse(&reference)? else {
                    continue;
                };
                coverage.listed += 1;
                if !known.contains(&class.crn) {
                    coverage.missing += 1;
                    report.missing.push(ClassRef {
                        academic_year: class.academic_year.or(Some(year)),
                        adln: class.adln.or(Some(adln)),
                        ..class
                    });
                }
            }
        }

        info!(
            year,
            missing = coverage.missing,
            listed = coverage.listed,
            "reconciled academic year"
        );
        report.coverage.push(coverage);
    }

    if fix && !report.missing.is_empty() {
        let missing = report.missing.clone();
        // every missing reference carries its own year and flag
        report.fixed = Some(process_classes(source, store, &missing, 0, false).await?);
    }

    Ok(report)
}
