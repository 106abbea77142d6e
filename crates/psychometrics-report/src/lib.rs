//! Report artifact writers: five semicolon-delimited CSV tables plus a JSON
//! course summary, with per-field validation that drops bad rows instead of
//! publishing them.

use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use psychometrics_core::{ContentRow, ItemRow, LogParser, ReviewRow, SolutionRow, ViewRow};
use tracing::warn;

/// Rendered form of a missing timestamp; the time column rejects it.
const NONE_FIELD: &str = "None";

const SUMMARY_FILE_NAME: &str = "course.json";

/// One output column: header name plus the validator every rendered field
/// must pass.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub check: fn(&str) -> bool,
}

fn non_empty(value: &str) -> bool {
    !value.is_empty()
}

fn non_empty_or_none(value: &str) -> bool {
    !value.is_empty() && value != NONE_FIELD
}

fn zero_or_one(value: &str) -> bool {
    value == "0" || value == "1"
}

fn positive_int(value: &str) -> bool {
    value.parse::<i64>().is_ok_and(|number| number > 0)
}

fn non_negative_int(value: &str) -> bool {
    value.parse::<i64>().is_ok_and(|number| number >= 0)
}

const USER_ID: Column = Column { name: "user_id", check: non_empty };
const REVIEWER_ID: Column = Column { name: "reviewer_id", check: non_empty };
const ITEM_ID: Column = Column { name: "item_id", check: non_empty };
const ITEM_TYPE: Column = Column { name: "item_type", check: non_empty };
const ITEM_NAME: Column = Column { name: "item_name", check: non_empty };
const CONTENT_ID: Column = Column { name: "content_piece_id", check: non_empty };
const CONTENT_TYPE: Column = Column { name: "content_piece_type", check: non_empty };
const CONTENT_NAME: Column = Column { name: "content_piece_name", check: non_empty };
const MODULE_ID: Column = Column { name: "module_id", check: non_empty };
const MODULE_ORDER: Column = Column { name: "module_order", check: positive_int };
const MODULE_NAME: Column = Column { name: "module_name", check: non_empty };
const SCORE: Column = Column { name: "score", check: non_negative_int };
const MAX_SCORE: Column = Column { name: "max_score", check: positive_int };
const CORRECT: Column = Column { name: "correct", check: zero_or_one };
const VIEWED: Column = Column { name: "viewed", check: zero_or_one };
const TIME: Column = Column { name: "time", check: non_empty_or_none };

const SOLUTION_COLUMNS: [Column; 4] = [USER_ID, ITEM_ID, CORRECT, TIME];
const ITEM_COLUMNS: [Column; 6] = [
    ITEM_ID,
    ITEM_TYPE,
    ITEM_NAME,
    MODULE_ID,
    MODULE_ORDER,
    MODULE_NAME,
];
const VIEW_COLUMNS: [Column; 3] = [USER_ID, CONTENT_ID, VIEWED];
const CONTENT_COLUMNS: [Column; 6] = [
    CONTENT_ID,
    CONTENT_TYPE,
    CONTENT_NAME,
    MODULE_ID,
    MODULE_ORDER,
    MODULE_NAME,
];
const REVIEW_COLUMNS: [Column; 5] = [USER_ID, ITEM_ID, REVIEWER_ID, SCORE, MAX_SCORE];

/// Semicolon-delimited writer that checks every rendered field against its
/// column before committing the row; one failing field drops the whole row.
pub struct TableWriter<W: Write> {
    writer: csv::Writer<W>,
    columns: &'static [Column],
}

impl<W: Write> TableWriter<W> {
    /// Creates the writer and emits the header row.
    ///
    /// # Errors
    /// Returns an error when the header cannot be written.
    pub fn new(destination: W, columns: &'static [Column]) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_writer(destination);
        writer
            .write_record(columns.iter().map(|column| column.name))
            .context("failed writing header row")?;
        Ok(Self { writer, columns })
    }

    /// Validates and writes one row; invalid rows are logged and dropped.
    ///
    /// # Errors
    /// Returns an error only when the destination itself fails.
    pub fn write_row(&mut self, fields: &[String]) -> Result<()> {
        for (field, column) in fields.iter().zip(self.columns) {
            if !(column.check)(field) {
                warn!("invalid {} value {field:?} in {fields:?}, row skipped", column.name);
                return Ok(());
            }
        }
        self.writer.write_record(fields).context("failed writing row")
    }

    /// Flushes buffered rows to the destination.
    ///
    /// # Errors
    /// Returns an error when flushing fails.
    pub fn finish(mut self) -> Result<()> {
        self.writer.flush().context("failed flushing table")
    }
}

fn solution_fields(row: &SolutionRow) -> [String; 4] {
    [
        row.learner_id.clone(),
        row.item_id.clone(),
        row.correct.to_string(),
        row.time.clone().unwrap_or_else(|| NONE_FIELD.to_string()),
    ]
}

fn item_fields(row: &ItemRow) -> [String; 6] {
    [
        row.item_id.clone(),
        row.item_type.clone(),
        row.item_name.clone(),
        row.module_id.clone(),
        row.module_order.to_string(),
        row.module_name.clone(),
    ]
}

fn view_fields(row: &ViewRow) -> [String; 3] {
    [
        row.learner_id.clone(),
        row.content_piece_id.clone(),
        row.viewed.to_string(),
    ]
}

fn content_fields(row: &ContentRow) -> [String; 6] {
    [
        row.content_piece_id.clone(),
        row.content_piece_type.clone(),
        row.content_piece_name.clone(),
        row.module_id.clone(),
        row.module_order.to_string(),
        row.module_name.clone(),
    ]
}

fn review_fields(row: &ReviewRow) -> [String; 5] {
    [
        row.learner_id.clone(),
        row.item_id.clone(),
        row.reviewer_id.clone(),
        row.score.to_string(),
        row.max_score.to_string(),
    ]
}

/// Writes the learner solutions table.
///
/// # Errors
/// Returns an error when the destination fails.
pub fn write_solutions<W: Write>(destination: W, parser: &LogParser) -> Result<()> {
    let mut table = TableWriter::new(destination, &SOLUTION_COLUMNS)?;
    for row in parser.learner_solutions() {
        table.write_row(&solution_fields(&row))?;
    }
    table.finish()
}

/// Writes the item catalog table.
///
/// # Errors
/// Returns an error when the destination fails.
pub fn write_item_catalog<W: Write>(destination: W, parser: &LogParser) -> Result<()> {
    let mut table = TableWriter::new(destination, &ITEM_COLUMNS)?;
    for row in parser.item_catalog() {
        table.write_row(&item_fields(&row))?;
    }
    table.finish()
}

/// Writes the viewed content table.
///
/// # Errors
/// Returns an error when the destination fails.
pub fn write_learner_content<W: Write>(destination: W, parser: &LogParser) -> Result<()> {
    let mut table = TableWriter::new(destination, &VIEW_COLUMNS)?;
    for row in parser.learner_content() {
        table.write_row(&view_fields(&row))?;
    }
    table.finish()
}

/// Writes the content catalog table.
///
/// # Errors
/// Returns an error when the destination fails.
pub fn write_content_catalog<W: Write>(destination: W, parser: &LogParser) -> Result<()> {
    let mut table = TableWriter::new(destination, &CONTENT_COLUMNS)?;
    for row in parser.content_catalog() {
        table.write_row(&content_fields(&row))?;
    }
    table.finish()
}

/// Writes the assessment scores table.
///
/// # Errors
/// Returns an error when the destination fails.
pub fn write_assessment_scores<W: Write>(destination: W, parser: &LogParser) -> Result<()> {
    let mut table = TableWriter::new(destination, &REVIEW_COLUMNS)?;
    for row in parser.assessment_scores() {
        table.write_row(&review_fields(&row))?;
    }
    table.finish()
}

/// Writes the resolved course identity as a compact JSON object.
///
/// # Errors
/// Returns an error when serialization or the destination fails.
pub fn write_course_summary<W: Write>(destination: W, parser: &LogParser) -> Result<()> {
    serde_json::to_writer(destination, &parser.course_info())
        .context("failed writing course summary")
}

const TABLE_WRITERS: [fn(File, &LogParser) -> Result<()>; 5] = [
    write_solutions,
    write_item_catalog,
    write_learner_content,
    write_content_catalog,
    write_assessment_scores,
];

fn csv_artifact_path(prefix: &Path, index: usize) -> PathBuf {
    let mut name = prefix
        .file_name()
        .map_or_else(OsString::new, ToOwned::to_owned);
    name.push(format!("{index}.csv"));
    prefix.with_file_name(name)
}

fn summary_artifact_path(prefix: &Path) -> PathBuf {
    prefix
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(SUMMARY_FILE_NAME)
}

/// Writes all report artifacts: `<prefix>1.csv` through `<prefix>5.csv` plus
/// `course.json` in the prefix directory.
///
/// # Errors
/// Returns an error when any artifact cannot be created or written.
pub fn write_all_reports(prefix: &Path, parser: &LogParser) -> Result<()> {
    for (position, write_table) in TABLE_WRITERS.iter().enumerate() {
        let path = csv_artifact_path(prefix, position + 1);
        let file = File::create(&path)
            .with_context(|| format!("failed creating {}", path.display()))?;
        write_table(file, parser)?;
    }
    let path = summary_artifact_path(prefix);
    let file = File::create(&path)
        .with_context(|| format!("failed creating {}", path.display()))?;
    write_course_summary(file, parser)
}

#[cfg(test)]
mod tests {
    use super::*;
    use psychometrics_core::{CourseNames, CourseOutline, LegacyAnswers};

    fn must_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        result.unwrap_or_else(|err| panic!("unexpected error: {err:?}"))
    }

    fn sample_parser() -> LogParser {
        let log = [
            r#"{"event_type": "load_video", "event": "{\"id\": \"v1\"}", "page": "https://h/c/x/m1/s1/", "context": {"course_id": "course-v1:org+x"}}"#,
            r#"{"event_type": "play_video", "event": "{\"id\": \"v1\"}", "context": {"user_id": "uu"}}"#,
            r#"{"event_type": "edx.grades.problem.submitted", "event": {"problem_id": "block@pp"}, "referer": "https://h/c/x/m2/s2/", "time": "2018-01-02T09:30:00", "context": {"user_id": "15"}}"#,
            r#"{"event_type": "problem_check", "event_source": "server", "event": {"problem_id": "block@pp", "submission": {"t1": {"question": "QQ", "response_type": "type", "correct": false}}}, "context": {"user_id": "15"}, "time": "2018-01-02T09:30:05"}"#,
        ]
        .join("\n");
        let outline = must_ok(CourseOutline::parse(
            &b"m1;x;Module 1\nm2;x;Module 2\n"[..],
        ));
        must_ok(LogParser::parse(
            log.as_bytes(),
            &outline,
            &LegacyAnswers::default(),
            &must_ok(CourseNames::parse(&b"org+x;Example\n"[..])),
        ))
    }

    fn utf8(buffer: Vec<u8>) -> String {
        String::from_utf8(buffer).unwrap_or_else(|err| panic!("non-utf8 output: {err}"))
    }

    #[test]
    fn checkers_accept_and_reject() {
        assert!(non_empty("x"));
        assert!(!non_empty(""));
        assert!(non_empty_or_none("02.01.2018 09:30:00"));
        assert!(!non_empty_or_none("None"));
        assert!(!non_empty_or_none(""));
        assert!(zero_or_one("0"));
        assert!(zero_or_one("1"));
        assert!(!zero_or_one("2"));
        assert!(!zero_or_one(""));
        assert!(positive_int("3"));
        assert!(!positive_int("0"));
        assert!(!positive_int("x"));
        assert!(non_negative_int("0"));
        assert!(non_negative_int("7"));
        assert!(!non_negative_int("-1"));
    }

    #[test]
    fn writer_emits_header_and_valid_rows() {
        let mut buffer = Vec::new();
        let mut table = must_ok(TableWriter::new(&mut buffer, &VIEW_COLUMNS));
        must_ok(table.write_row(&["u1".to_string(), "v1".to_string(), "1".to_string()]));
        must_ok(table.finish());
        assert_eq!(utf8(buffer), "user_id;content_piece_id;viewed\nu1;v1;1\n");
    }

    #[test]
    fn writer_drops_row_with_any_invalid_field() {
        let mut buffer = Vec::new();
        let mut table = must_ok(TableWriter::new(&mut buffer, &VIEW_COLUMNS));
        must_ok(table.write_row(&["u1".to_string(), String::new(), "1".to_string()]));
        must_ok(table.write_row(&["u1".to_string(), "v1".to_string(), "2".to_string()]));
        must_ok(table.write_row(&["u2".to_string(), "v1".to_string(), "0".to_string()]));
        must_ok(table.finish());
        assert_eq!(utf8(buffer), "user_id;content_piece_id;viewed\nu2;v1;0\n");
    }

    #[test]
    fn missing_time_renders_none_and_is_dropped() {
        let row = SolutionRow {
            learner_id: "u".to_string(),
            item_id: "t".to_string(),
            correct: 1,
            time: None,
        };
        let fields = solution_fields(&row);
        assert_eq!(fields[3], "None");

        let mut buffer = Vec::new();
        let mut table = must_ok(TableWriter::new(&mut buffer, &SOLUTION_COLUMNS));
        must_ok(table.write_row(&fields));
        must_ok(table.finish());
        assert_eq!(utf8(buffer), "user_id;item_id;correct;time\n");
    }

    #[test]
    fn solutions_table_renders_attempts() {
        let mut buffer = Vec::new();
        must_ok(write_solutions(&mut buffer, &sample_parser()));
        assert_eq!(
            utf8(buffer),
            "user_id;item_id;correct;time\n15;t1;0;02.01.2018 09:30:00\n"
        );
    }

    #[test]
    fn item_catalog_table_renders_linked_tasks() {
        let mut buffer = Vec::new();
        must_ok(write_item_catalog(&mut buffer, &sample_parser()));
        assert_eq!(
            utf8(buffer),
            "item_id;item_type;item_name;module_id;module_order;module_name\n\
             t1;type;QQ;m2;2;Module 2\n"
        );
    }

    #[test]
    fn view_and_content_tables_render_videos() {
        let parser = sample_parser();
        let mut views = Vec::new();
        must_ok(write_learner_content(&mut views, &parser));
        assert_eq!(utf8(views), "user_id;content_piece_id;viewed\nuu;v1;1\n");

        let mut content = Vec::new();
        must_ok(write_content_catalog(&mut content, &parser));
        assert_eq!(
            utf8(content),
            "content_piece_id;content_piece_type;content_piece_name;module_id;module_order;module_name\n\
             v1;video;NA;m1;1;Module 1\n"
        );
    }

    #[test]
    fn empty_scores_table_is_header_only() {
        let mut buffer = Vec::new();
        must_ok(write_assessment_scores(&mut buffer, &sample_parser()));
        assert_eq!(utf8(buffer), "user_id;item_id;reviewer_id;score;max_score\n");
    }

    #[test]
    fn course_summary_is_compact_json() {
        let mut buffer = Vec::new();
        must_ok(write_course_summary(&mut buffer, &sample_parser()));
        assert_eq!(utf8(buffer), r#"{"short_name":"org+x","long_name":"Example"}"#);
    }

    #[test]
    fn artifact_paths_extend_the_prefix() {
        assert_eq!(
            csv_artifact_path(Path::new("/out/csv"), 3),
            Path::new("/out/csv3.csv")
        );
        assert_eq!(csv_artifact_path(Path::new("csv"), 1), Path::new("csv1.csv"));
        assert_eq!(
            summary_artifact_path(Path::new("/out/csv")),
            Path::new("/out/course.json")
        );
        assert_eq!(
            summary_artifact_path(Path::new("csv")),
            Path::new("course.json")
        );
    }

    #[test]
    fn write_all_reports_places_six_artifacts() {
        let dir = must_ok(tempfile::tempdir());
        let prefix = dir.path().join("csv");
        let parser = sample_parser();
        must_ok(write_all_reports(&prefix, &parser));

        for index in 1..=5 {
            assert!(dir.path().join(format!("csv{index}.csv")).is_file());
        }
        let summary = must_ok(std::fs::read_to_string(dir.path().join("course.json")));
        assert_eq!(summary, r#"{"short_name":"org+x","long_name":"Example"}"#);
    }

    #[test]
    fn write_all_reports_is_deterministic() {
        let dir = must_ok(tempfile::tempdir());
        let parser = sample_parser();
        let first = dir.path().join("a");
        let second = dir.path().join("b");
        must_ok(std::fs::create_dir_all(&first));
        must_ok(std::fs::create_dir_all(&second));
        must_ok(write_all_reports(&first.join("csv"), &parser));
        must_ok(write_all_reports(&second.join("csv"), &parser));

        for name in ["csv1.csv", "csv2.csv", "csv3.csv", "csv4.csv", "csv5.csv", "course.json"] {
            let left = must_ok(std::fs::read(first.join(name)));
            let right = must_ok(std::fs::read(second.join(name)));
            assert_eq!(left, right, "{name} differs between runs");
        }
    }
}
