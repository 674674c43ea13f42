use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};

use crate::error::ParseError;
use crate::models::{AnswerField, Evaluation, QuestionInstance, TermName};

static ACADEMIC_YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Academic Year \d{4}-(\d{4})").expect("valid regex"));
static CRN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"CRN (\d+)").expect("valid regex"));
static COURSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<b>([A-Z]{2,4})-([\dX]{3,4}) (.+?)</b>").expect("valid regex")
});
static SECTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Section (\w+)").expect("valid regex"));
static SEASON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(Spring|Fall|Summer) \d{4}").expect("valid regex"));
static INSTRUCTOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<th[^>]*>Prof\. (.*?)</th>").expect("valid regex"));
static QUESTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2}[A-Z]?)\. (.+)").expect("valid regex"));

static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td.dddefault").expect("valid selector"));
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("th.ddtitle").expect("valid selector"));
static PARAGRAPH: Lazy<Selector> = Lazy::new(|| Selector::parse("p").expect("valid selector"));

/// Section letters that name their term directly.
const LETTER_TERMS: &str = "ABCD";

/// Cells in a question row using the fixed 1-5 weighted layout:
/// question text, five counts, mean, total.
const WEIGHTED_ROW_CELLS: usize = 8;
const WEIGHT_SLOTS: usize = 5;

pub fn parse_evaluation(raw: &str) -> Result<Evaluation, ParseError> {
    let text = raw.replace('\u{a0}', " ").replace("&nbsp;", " ");
    let document = Html::parse_document(&text);

    let mut evaluation = parse_header(&text, &document)?;
    evaluation.questions = parse_questions(&document)?;
    Ok(evaluation)
}

fn parse_header(text: &str, document: &Html) -> Result<Evaluation, ParseError> {
    let academic_year = capture(&ACADEMIC_YEAR_RE, text, "academic year")?
        .parse::<i32>()
        .map_err(|err| ParseError::header("academic year is not a number").with_source(err))?;

    let crn_text = document
        .root_element()
        .descendants()
        .filter_map(|node| node.value().as_text())
        .find(|t| CRN_RE.is_match(t))
        .ok_or_else(|| ParseError::header("no CRN in page"))?;
    let crn = capture(&CRN_RE, crn_text, "CRN")?
        .parse::<i32>()
        .map_err(|err| ParseError::header("CRN is not a number").with_source(err))?;

    // The course line, section and season share the row holding the CRN.
    let header_row = document
        .root_element()
        .descendants()
        .find(|node| node.value().as_text().is_some_and(|t| CRN_RE.is_match(t)))
        .and_then(|node| node.parent())
        .and_then(|node| node.parent())
        .and_then(ElementRef::wrap)
        .map(|row| row.html().replace("&amp;", "&"))
        .ok_or_else(|| ParseError::header("CRN is not inside a header row"))?;

    let course = COURSE_RE
        .captures(&header_row)
        .ok_or_else(|| ParseError::header("no department-code course line"))?;
    let department = course[1].to_string();
    let code = course[2].to_string();
    let name = course[3].trim().to_string();

    let section = capture(&SECTION_RE, &header_row, "section")?.to_string();
    let term = match section.chars().next() {
        Some(letter) if LETTER_TERMS.contains(letter) => TermName::from_name(&section[..1]),
        _ => {
            let season = capture(&SEASON_RE, &header_row, "season")?;
            TermName::from_name(season)
        }
    };

    let instructor = capture(&INSTRUCTOR_RE, text, "instructor")?.trim().to_string();

    Ok(Evaluation {
        crn,
        academic_year,
        term,
        name,
        department,
        code,
        section,
        instructor,
        questions: Vec::new(),
    })
}

fn parse_questions(document: &Html) -> Result<Vec<QuestionInstance>, ParseError> {
    let mut questions = Vec::new();

    for cell in document.select(&CELL) {
        let cell_text = text_of(cell);
        let Some(caps) = QUESTION_RE.captures(&cell_text) else {
            continue;
        };

        let row = cell
            .parent()
            .and_then(ElementRef::wrap)
            .filter(|row| row.value().name() == "tr")
            .ok_or_else(|| ParseError::body("question cell outside a table row"))?;

        let mut question = QuestionInstance {
            number: caps[1].to_string(),
            full_text: caps[2].trim().to_string(),
            answers: Vec::new(),
        };

        let cells: Vec<ElementRef> = row.select(&CELL).collect();
        match cells.len() {
            WEIGHTED_ROW_CELLS => {
                for slot in 0..WEIGHT_SLOTS {
                    question.answers.push(AnswerField {
                        answer_text: None,
                        weight: Some(slot as i32 + 1),
                        respondents: weighted_count(cells[slot + 1])?,
                    });
                }
            }
            1 => {
                for sibling in row.next_siblings() {
                    let Some(next_row) = ElementRef::wrap(sibling) else {
                        continue;
                    };
                    if next_row.value().name() != "tr" {
                        continue;
                    }
                    if next_row.select(&TITLE).next().is_some() {
                        break;
                    }

                    let answer_cells: Vec<ElementRef> = next_row.select(&CELL).collect();
                    let Some(label_cell) = answer_cells.first() else {
                        continue;
                    };
                    let label = text_of(*label_cell);
                    if QUESTION_RE.is_match(&label) {
                        break;
                    }
                    let count_cell = answer_cells.get(1).ok_or_else(|| {
                        ParseError::body(format!(
                            "answer row for question {} has no respondent cell",
                            question.number
                        ))
                    })?;

                    question.answers.push(AnswerField {
                        answer_text: (!label.is_empty()).then_some(label),
                        weight: None,
                        respondents: parse_count(&text_of(*count_cell))?,
                    });
                }
            }
            other => {
                return Err(ParseError::body(format!(
                    "unexpected layout: {other} cells in row of question {}",
                    question.number
                )))
            }
        }

        questions.push(question);
    }

    Ok(questions)
}

fn capture<'t>(re: &Regex, text: &'t str, field: &str) -> Result<&'t str, ParseError> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| ParseError::header(format!("missing {field}")))
}

fn text_of(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// The count sits after the bar image inside the cell's paragraph.
fn weighted_count(cell: ElementRef) -> Result<i32, ParseError> {
    let paragraph = cell
        .select(&PARAGRAPH)
        .next()
        .ok_or_else(|| ParseError::body("weighted answer cell has no paragraph"))?;
    let node = paragraph
        .children()
        .nth(1)
        .ok_or_else(|| ParseError::body("weighted answer cell has no count"))?;
    let text = match node.value() {
        Node::Text(text) => text.trim().to_string(),
        Node::Element(_) => ElementRef::wrap(node).map(text_of).unwrap_or_default(),
        _ => String::new(),
    };
    parse_count(&text)
}

fn parse_count(text: &str) -> Result<i32, ParseError> {
    let trimmed = text.trim();
    match trimmed.parse::<i32>() {
        Ok(count) if count >= 0 => Ok(count),
        Ok(count) => Err(ParseError::body(format!("respondent count {count} is negative"))),
        Err(err) => Err(
            ParseError::body(format!("respondent count {trimmed:?} is not a number")).with_source(err),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseStage;
    use pretty_assertions::assert_eq;

    fn page(header: &str, body: &str) -> String {
        format!(
            r#"<html><body>
<table class="datadisplaytable">
<tr><th class="ddtitle" colspan="8">Course Evaluation Results, Academic Year 2015-2016</th></tr>
{header}
<tr><TH CLASS="ddheader" colspan="8">Prof. Jane Q. Smith</TH></tr>
</table>
<table class="datadisplaytable">
{body}
</table>
</body></html>"#
        )
    }

    const TERM_HEADER: &str = r#"<tr><td class="dddefault"><b>CS-2102 Object-Oriented Design Concepts</b><br>CRN&nbsp;12345 Section A01</td></tr>"#;

    const SEASON_HEADER: &str = "<tr><td class=\"dddefault\"><b>MA-1021 Calculus I</b><br>CRN\u{a0}20371 Section 01 Spring 2016</td></tr>";

    fn weighted_row(number: &str, counts: [i32; 5]) -> String {
        let mut row = format!(r#"<tr><td class="dddefault">{number}. Overall quality of this course</td>"#);
        for count in counts {
            row.push_str(&format!(
                r#"<td class="dddefault"><p class="bar"><img src="bar.gif" width="10">{count}</p></td>"#
            ));
        }
        row.push_str(r#"<td class="dddefault">4.1</td><td class="dddefault">28</td></tr>"#);
        row
    }

    const LABEL_ROWS: &str = r#"
<tr><th class="ddtitle">Workload</th></tr>
<tr><td class="dddefault">24. Hours per week spent outside class</td></tr>
<tr><td class="dddefault">0 to 5</td><td class="dddefault">4</td></tr>
<tr><td class="dddefault">6 to 10</td><td class="dddefault">9</td></tr>
<tr><td class="dddefault"></td><td class="dddefault">1</td></tr>
<tr><th class="ddtitle">Comments</th></tr>
<tr><td class="dddefault">Great course overall</td><td class="dddefault">x</td></tr>
"#;

    #[test]
    fn parses_header_fields() {
        let evaluation = parse_evaluation(&page(TERM_HEADER, "")).unwrap();
        assert_eq!(evaluation.academic_year, 2016);
        assert_eq!(evaluation.crn, 12345);
        assert_eq!(evaluation.department, "CS");
        assert_eq!(evaluation.code, "2102");
        assert_eq!(evaluation.name, "Object-Oriented Design Concepts");
        assert_eq!(evaluation.section, "A01");
        assert_eq!(evaluation.term, Some(TermName::A));
        assert_eq!(evaluation.instructor, "Jane Q. Smith");
        assert_eq!(evaluation.course_label(), "CS-2102");
    }

    #[test]
    fn term_falls_back_to_season() {
        let evaluation = parse_evaluation(&page(SEASON_HEADER, "")).unwrap();
        assert_eq!(evaluation.crn, 20371);
        assert_eq!(evaluation.section, "01");
        assert_eq!(evaluation.term, Some(TermName::Spring));
    }

    #[test]
    fn missing_season_is_a_header_error() {
        let header = r#"<tr><td class="dddefault"><b>MA-1021 Calculus I</b><br>CRN 20371 Section 01</td></tr>"#;
        let err = parse_evaluation(&page(header, "")).unwrap_err();
        assert_eq!(err.stage, ParseStage::Header);
    }

    #[test]
    fn missing_crn_is_a_header_error() {
        let header = r#"<tr><td class="dddefault"><b>CS-2102 Design</b> Section A01</td></tr>"#;
        let err = parse_evaluation(&page(header, "")).unwrap_err();
        assert_eq!(err.stage, ParseStage::Header);
        assert!(err.cause.contains("CRN"));
    }

    #[test]
    fn parsing_is_repeatable() {
        let text = page(TERM_HEADER, &weighted_row("1A", [2, 3, 5, 7, 11]));
        assert_eq!(parse_evaluation(&text).unwrap(), parse_evaluation(&text).unwrap());
    }

    #[test]
    fn eight_cell_row_uses_weighted_layout() {
        let evaluation =
            parse_evaluation(&page(TERM_HEADER, &weighted_row("1A", [2, 3, 5, 7, 11]))).unwrap();
        assert_eq!(evaluation.questions.len(), 1);
        let question = &evaluation.questions[0];
        assert_eq!(question.number, "1A");
        assert_eq!(question.full_text, "Overall quality of this course");
        let weights: Vec<Option<i32>> = question.answers.iter().map(|a| a.weight).collect();
        let counts: Vec<i32> = question.answers.iter().map(|a| a.respondents).collect();
        assert_eq!(weights, vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);
        assert_eq!(counts, vec![2, 3, 5, 7, 11]);
        assert!(question.answers.iter().all(|a| a.answer_text.is_none()));
    }

    #[test]
    fn single_cell_row_uses_label_layout() {
        let evaluation = parse_evaluation(&page(TERM_HEADER, LABEL_ROWS)).unwrap();
        assert_eq!(evaluation.questions.len(), 1);
        let question = &evaluation.questions[0];
        assert_eq!(question.number, "24");
        assert_eq!(
            question.answers,
            vec![
                AnswerField {
                    answer_text: Some("0 to 5".to_string()),
                    weight: None,
                    respondents: 4,
                },
                AnswerField {
                    answer_text: Some("6 to 10".to_string()),
                    weight: None,
                    respondents: 9,
                },
                AnswerField {
                    answer_text: None,
                    weight: None,
                    respondents: 1,
                },
            ]
        );
    }

    #[test]
    fn mixed_layouts_keep_page_order() {
        let body = format!("{}{}", weighted_row("2", [0, 0, 1, 4, 9]), LABEL_ROWS);
        let evaluation = parse_evaluation(&page(TERM_HEADER, &body)).unwrap();
        let numbers: Vec<&str> = evaluation.questions.iter().map(|q| q.number.as_str()).collect();
        assert_eq!(numbers, vec!["2", "24"]);
    }

    #[test]
    fn other_cell_counts_are_a_body_error() {
        let body = r#"<tr><td class="dddefault">3. Textbook value</td><td class="dddefault">1</td><td class="dddefault">2</td></tr>"#;
        let err = parse_evaluation(&page(TERM_HEADER, body)).unwrap_err();
        assert_eq!(err.stage, ParseStage::Body);
        assert!(err.cause.contains("unexpected layout"));
    }

    #[test]
    fn non_numeric_count_is_a_body_error() {
        let body = r#"
<tr><td class="dddefault">24. Hours per week</td></tr>
<tr><td class="dddefault">0 to 5</td><td class="dddefault">many</td></tr>"#;
        let err = parse_evaluation(&page(TERM_HEADER, body)).unwrap_err();
        assert_eq!(err.stage, ParseStage::Body);
        let source = std::error::Error::source(&err).map(|source| source.to_string());
        assert_eq!(source.as_deref(), Some("invalid digit found in string"));
    }
}
