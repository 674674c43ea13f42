use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TermName {
    A,
    Fall,
    B,
    C,
    Spring,
    D,
    E1,
    E2,
    Summer,
}

impl TermName {
    pub const ALL: [TermName; 9] = [
        TermName::A,
        TermName::Fall,
        TermName::B,
        TermName::C,
        TermName::Spring,
        TermName::D,
        TermName::E1,
        TermName::E2,
        TermName::Summer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TermName::A => "A",
            TermName::Fall => "Fall",
            TermName::B => "B",
            TermName::C => "C",
            TermName::Spring => "Spring",
            TermName::D => "D",
            TermName::E1 => "E1",
            TermName::E2 => "E2",
            TermName::Summer => "Summer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|term| term.as_str() == name)
    }
}

/// One scraped evaluation page, before it has any database identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub crn: i32,
    pub academic_year: i32,
    pub term: Option<TermName>,
    pub name: String,
    pub department: String,
    pub code: String,
    pub section: String,
    pub instructor: String,
    pub questions: Vec<QuestionInstance>,
}

impl Evaluation {
    pub fn course_label(&self) -> String {
        format!("{}-{}", self.department, self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionInstance {
    pub number: String,
    pub full_text: String,
    pub answers: Vec<AnswerField>,
}

impl QuestionInstance {
    /// Pivot key used when no catalog entry names the question.
    pub fn default_short_key(&self) -> String {
        format!("Q{}", self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerField {
    pub answer_text: Option<String>,
    pub weight: Option<i32>,
    pub respondents: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedScrape {
    pub crn: i32,
    pub academic_year: i32,
    pub adln: bool,
    pub reason: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl FailedScrape {
    pub fn new(crn: i32, academic_year: i32, adln: bool, reason: impl Into<String>) -> Self {
        Self {
            crn,
            academic_year,
            adln,
            reason: Some(reason.into()),
            failed_at: None,
        }
    }
}

/// Failed CRNs of one (year, adln) listing.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedGroup {
    pub academic_year: i32,
    pub adln: bool,
    pub crns: Vec<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogQuestion {
    #[serde(rename = "Num")]
    pub number: String,
    #[serde(rename = "ShortString")]
    pub short_key: String,
    #[serde(rename = "FullString")]
    pub full_text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub stored: usize,
    pub failed: usize,
    pub duplicates: usize,
}

impl RunSummary {
    pub fn absorb(&mut self, other: RunSummary) {
        self.stored += other.stored;
        self.failed += other.failed;
        self.duplicates += other.duplicates;
    }
}

#[derive(Debug, Clone)]
pub struct YearCoverage {
    pub academic_year: i32,
    pub listed: usize,
    pub missing: usize,
}
