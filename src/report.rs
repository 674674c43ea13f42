use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::crawler::adln_flag;
use crate::models::FailedScrape;
use crate::scrape::Reconciliation;

const MISSING_LISTED: usize = 50;

pub fn build_reconciliation_report(report: &Reconciliation, generated_at: DateTime<Utc>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Evaluation Coverage Report");
    let _ = writeln!(output, "Generated {}", generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Coverage by Academic Year");

    if report.coverage.is_empty() {
        let _ = writeln!(output, "No academic years checked.");
    } else {
        for year in &report.coverage {
            let _ = writeln!(
                output,
                "- {}-{}: {} missing of {} listed",
                year.academic_year - 1,
                year.academic_year,
                year.missing,
                year.listed
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Missing Classes");

    if report.missing.is_empty() {
        let _ = writeln!(output, "Every listed class is stored or recorded as failed.");
    } else {
        let _ = writeln!(output, "{} classes total.", report.missing.len());
        for class in report.missing.iter().take(MISSING_LISTED) {
            let _ = writeln!(
                output,
                "- CRN {} ({}, {})",
                class.crn,
                class
                    .academic_year
                    .map(|year| year.to_string())
                    .unwrap_or_else(|| "unknown year".to_string()),
                class.adln.map(adln_flag).unwrap_or("?"),
            );
        }
        if report.missing.len() > MISSING_LISTED {
            let _ = writeln!(output, "- ... and {} more", report.missing.len() - MISSING_LISTED);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Repair Pass");

    match &report.fixed {
        Some(summary) => {
            let _ = writeln!(
                output,
                "Stored {}, failed {}, duplicates {}.",
                summary.stored, summary.failed, summary.duplicates
            );
        }
        None => {
            let _ = writeln!(output, "Not run.");
        }
    }

    output
}

pub fn format_failures(failures: &[FailedScrape]) -> String {
    let mut output = String::new();

    if failures.is_empty() {
        let _ = writeln!(output, "No outstanding failures.");
        return output;
    }

    let _ = writeln!(output, "{} outstanding failures:", failures.len());
    for failed in failures {
        let when = failed
            .failed_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let _ = writeln!(
            output,
            "- CRN {} ({}, {}) {} {}",
            failed.crn,
            failed.academic_year,
            adln_flag(failed.adln),
            when,
            failed.reason.as_deref().unwrap_or("")
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::ClassRef;
    use crate::models::{RunSummary, YearCoverage};
    use chrono::TimeZone;

    #[test]
    fn report_lists_years_missing_and_repairs() {
        let report = Reconciliation {
            coverage: vec![YearCoverage {
                academic_year: 2016,
                listed: 12,
                missing: 1,
            }],
            missing: vec![ClassRef {
                reference: "/x?IN_CRN=20371".to_string(),
                crn: 20371,
                academic_year: Some(2016),
                adln: Some(false),
            }],
            fixed: Some(RunSummary {
                stored: 1,
                failed: 0,
                duplicates: 0,
            }),
        };
        let generated = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let text = build_reconciliation_report(&report, generated);
        assert!(text.contains("Generated 2026-03-01 12:00 UTC"));
        assert!(text.contains("- 2015-2016: 1 missing of 12 listed"));
        assert!(text.contains("- CRN 20371 (2016, X)"));
        assert!(text.contains("Stored 1, failed 0, duplicates 0."));
    }

    #[test]
    fn empty_failures_say_so() {
        assert_eq!(format_failures(&[]), "No outstanding failures.\n");

        let text = format_failures(&[FailedScrape::new(5, 2014, true, "timed out")]);
        assert!(text.starts_with("1 outstanding failures:"));
        assert!(text.contains("- CRN 5 (2014, O)"));
        assert!(text.contains("timed out"));
    }
}
