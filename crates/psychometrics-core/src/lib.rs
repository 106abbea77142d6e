//! Aggregation core for course event logs: streams platform events into
//! per-learner, per-task, per-module, and per-content models, reconciles them
//! against supplementary course snapshots, and serves the flat row queries
//! the report tables are built from.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufRead, Read};

use serde::Serialize;
use serde_json::{Map, Value};
use time::macros::format_description;
use time::PrimitiveDateTime;
use tracing::warn;

/// Placeholder display value for names the sources never provided.
pub const FALLBACK_NAME: &str = "NA";

/// Content type recorded for video items.
pub const VIDEO_CONTENT_TYPE: &str = "video";

/// Item type reported for open-response assessments.
pub const OPEN_ASSESSMENT_ITEM_TYPE: &str = "openassessment";

const PROBLEM_MARKER: &str = "type@problem";
const OPEN_ASSESSMENT_MARKER: &str = "type@openassessment";
const VIDEO_MARKER: &str = "type@video";

/// Structural markers identifying content item references in outline rows.
const CONTENT_MARKERS: [&str; 3] = [PROBLEM_MARKER, OPEN_ASSESSMENT_MARKER, VIDEO_MARKER];

/// Length of the `YYYY-MM-DDTHH:MM:SS` date-time base.
const ISO_BASE_LEN: usize = 19;

/// Minimum field count for a usable legacy answers row.
const ANSWER_ROW_MIN_FIELDS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("malformed timestamp {0:?}")]
    MalformedTimestamp(String),
    #[error("cannot read field {path:?} as {target}")]
    TypeCoercion { path: String, target: &'static str },
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("log read failed: {0}")]
    Io(#[from] io::Error),
    #[error("source read failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Last `@`-separated segment of a platform identifier; plain identifiers
/// pass through unchanged.
#[must_use]
pub fn extract_id(composite: &str) -> &str {
    composite.rsplit('@').next().unwrap_or(composite)
}

/// Everything after the first `:` of a course identifier, or the identifier
/// itself when it carries no scheme prefix.
#[must_use]
pub fn short_course_name(course_id: &str) -> &str {
    course_id.split_once(':').map_or(course_id, |(_, rest)| rest)
}

/// Normalizes a platform timestamp to `DD.MM.YYYY HH:MM:SS` display form.
///
/// Fractional seconds and any zone suffix (`.123`, `+00:00`, `-0500`) are
/// discarded before parsing.
///
/// # Errors
/// Returns [`ConvertError::MalformedTimestamp`] when the remaining base is
/// not a `YYYY-MM-DDTHH:MM:SS` date-time.
pub fn normalize_timestamp(raw: &str) -> Result<String, ConvertError> {
    let base = raw.split('.').next().unwrap_or(raw);
    let base = base.split('+').next().unwrap_or(base);
    // A negative zone offset can only start right after the full date-time
    // base; every earlier `-` belongs to the date itself.
    let base = if base.len() > ISO_BASE_LEN && base.as_bytes()[ISO_BASE_LEN] == b'-' {
        &base[..ISO_BASE_LEN]
    } else {
        base
    };

    let parsed = PrimitiveDateTime::parse(
        base,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    )
    .map_err(|_| ConvertError::MalformedTimestamp(raw.to_string()))?;

    parsed
        .format(format_description!(
            "[day].[month].[year] [hour]:[minute]:[second]"
        ))
        .map_err(|_| ConvertError::MalformedTimestamp(raw.to_string()))
}

/// Truncates a page URL at the first `#` or `?`, then cuts it back to its
/// last `/`; yields the empty string when no `/` survives.
#[must_use]
pub fn normalize_module_url(url: &str) -> &str {
    let trimmed = url.find(['#', '?']).map_or(url, |cut| &url[..cut]);
    trimmed.rfind('/').map_or("", |cut| &trimmed[..=cut])
}

/// Second-to-last non-empty `/`-segment of a normalized page URL, which is
/// where the platform keeps the module identifier.
///
/// # Errors
/// Returns [`ConvertError::MalformedEvent`] when fewer than two non-empty
/// segments remain.
pub fn module_id_from_url(url: &str) -> Result<&str, ConvertError> {
    let normalized = normalize_module_url(url);
    let segments: Vec<&str> = normalized
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.len() < 2 {
        return Err(ConvertError::MalformedEvent(format!(
            "page URL {url:?} has no module segment"
        )));
    }
    Ok(segments[segments.len() - 2])
}

/// Leaf coercion target for [`lookup`].
pub trait FieldValue: Sized + Default {
    /// Name used in coercion error messages.
    const KIND: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FieldValue for String {
    const KIND: &'static str = "string";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }
}

impl FieldValue for i64 {
    const KIND: &'static str = "integer";

    #[allow(clippy::cast_possible_truncation)]
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|float| float as Self)),
            Value::String(text) => text.trim().parse().ok(),
            Value::Bool(flag) => Some(Self::from(*flag)),
            _ => None,
        }
    }
}

impl FieldValue for bool {
    const KIND: &'static str = "boolean";

    fn from_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => false,
            Value::Bool(flag) => *flag,
            Value::Number(number) => number.as_f64().is_some_and(|float| float != 0.0),
            Value::String(text) => !text.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(fields) => !fields.is_empty(),
        })
    }
}

impl FieldValue for Map<String, Value> {
    const KIND: &'static str = "object";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(fields.clone()),
            _ => None,
        }
    }
}

impl FieldValue for Vec<Value> {
    const KIND: &'static str = "array";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => Some(items.clone()),
            _ => None,
        }
    }
}

/// Descends `root` along a dot-separated `path` of object fields and coerces
/// the leaf to `T`.
///
/// Missing keys and `null` leaves yield `T::default()`, matching the loose
/// shape of real platform event payloads.
///
/// # Errors
/// Returns [`ConvertError::TypeCoercion`] when the descent crosses a
/// non-object value or a present leaf cannot be read as `T`.
pub fn lookup<T: FieldValue>(root: &Value, path: &str) -> Result<T, ConvertError> {
    let mut current = root;
    for segment in path.split('.') {
        let fields = match current {
            Value::Object(fields) => fields,
            Value::Null => return Ok(T::default()),
            _ => {
                return Err(ConvertError::TypeCoercion {
                    path: path.to_string(),
                    target: "object",
                })
            }
        };
        match fields.get(segment) {
            Some(next) => current = next,
            None => return Ok(T::default()),
        }
    }
    if current.is_null() {
        return Ok(T::default());
    }
    T::from_value(current).ok_or_else(|| ConvertError::TypeCoercion {
        path: path.to_string(),
        target: T::KIND,
    })
}

/// Emptiness test the merge containers gate writes on.
pub trait Emptiness {
    fn is_empty_value(&self) -> bool;
}

impl Emptiness for String {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl Emptiness for i64 {
    fn is_empty_value(&self) -> bool {
        *self == 0
    }
}

/// Map where the first write always registers the key but an empty value
/// never clobbers a stored one.
#[derive(Debug, Clone)]
pub struct NonEmptyMap<V> {
    entries: BTreeMap<String, V>,
}

impl<V> Default for NonEmptyMap<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V: Emptiness> NonEmptyMap<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: V) {
        if !value.is_empty_value() || !self.entries.contains_key(key) {
            self.entries.insert(key.to_string(), value);
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// [`NonEmptyMap`] that additionally remembers first-insertion order;
/// re-setting an existing key never moves it.
#[derive(Debug, Clone)]
pub struct NonEmptyOrderedMap<V> {
    order: Vec<String>,
    entries: BTreeMap<String, V>,
}

impl<V> Default for NonEmptyOrderedMap<V> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            entries: BTreeMap::new(),
        }
    }
}

impl<V: Emptiness> NonEmptyOrderedMap<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: V) {
        if !self.entries.contains_key(key) {
            self.order.push(key.to_string());
            self.entries.insert(key.to_string(), value);
        } else if !value.is_empty_value() {
            self.entries.insert(key.to_string(), value);
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Entries in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.order.iter().filter_map(|key| {
            self.entries
                .get(key)
                .map(|value| (key.as_str(), value))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Event handler: mutates parser state from one decoded event record.
pub type Handler<S> = fn(&mut S, &Value) -> Result<(), ConvertError>;

/// Conjunction of field-in-set predicates over top-level string fields of an
/// event record.
#[derive(Debug, Clone, Default)]
pub struct Match {
    predicates: Vec<(String, Vec<String>)>,
}

impl Match {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(self, name: &str, value: &str) -> Self {
        self.field_in(name, &[value])
    }

    #[must_use]
    pub fn field_in(mut self, name: &str, values: &[&str]) -> Self {
        self.predicates.push((
            name.to_string(),
            values.iter().map(ToString::to_string).collect(),
        ));
        self
    }

    fn accepts(&self, event: &Value) -> bool {
        self.predicates.iter().all(|(name, values)| {
            event
                .get(name)
                .and_then(Value::as_str)
                .is_some_and(|actual| values.iter().any(|value| value == actual))
        })
    }
}

/// Priority-ordered routing table from field predicates to handlers.
///
/// Dispatch scans entries in registration order and runs the first full
/// match; events matching no entry fall through to a default no-op.
pub struct Registry<S> {
    entries: Vec<(Match, Handler<S>)>,
    default: Handler<S>,
}

impl<S> Registry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            default: |_, _| Ok(()),
        }
    }

    pub fn register(&mut self, matcher: Match, handler: Handler<S>) {
        self.entries.push((matcher, handler));
    }

    pub fn set_default(&mut self, handler: Handler<S>) {
        self.default = handler;
    }

    /// Routes `event` to the first matching handler, or the default.
    ///
    /// # Errors
    /// Propagates the invoked handler's error.
    pub fn dispatch(&self, state: &mut S, event: &Value) -> Result<(), ConvertError> {
        for (matcher, handler) in &self.entries {
            if matcher.accepts(event) {
                return handler(state, event);
            }
        }
        (self.default)(state, event)
    }
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn delimited_reader<R: Read>(source: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(source)
}

fn field_at(row: &csv::StringRecord, index: usize) -> &str {
    row.get(index).unwrap_or_default()
}

/// Parsed course outline: chapter display names in declaration order plus
/// the chapter each referenced content item belongs to.
#[derive(Debug, Clone, Default)]
pub struct CourseOutline {
    modules: NonEmptyOrderedMap<String>,
    content: BTreeMap<String, String>,
}

impl CourseOutline {
    /// Reads semicolon-delimited outline rows of the form
    /// `chapter_ref;...;leaf_ref;chapter_display_name`.
    ///
    /// Rows with fewer than two fields are logged and skipped. Middle fields
    /// carrying a content marker are linked to the row's chapter; a later
    /// row linking the same reference wins.
    ///
    /// # Errors
    /// Returns [`ConvertError::Csv`] when the source fails mid-read.
    pub fn parse<R: Read>(source: R) -> Result<Self, ConvertError> {
        let mut outline = Self::default();
        let mut reader = delimited_reader(source);
        for (index, row) in reader.records().enumerate() {
            let row = row?;
            if row.len() < 2 {
                warn!("invalid row {index} in course outline source");
                continue;
            }
            let module_id = extract_id(field_at(&row, 0)).to_string();
            let name = field_at(&row, row.len() - 1).trim().to_string();
            outline.modules.set(&module_id, name);
            for field in row.iter().take(row.len() - 1).skip(1) {
                if CONTENT_MARKERS.iter().any(|marker| field.contains(marker)) {
                    outline.content.insert(field.to_string(), module_id.clone());
                }
            }
        }
        Ok(outline)
    }

    #[must_use]
    pub fn modules(&self) -> &NonEmptyOrderedMap<String> {
        &self.modules
    }

    #[must_use]
    pub fn content(&self) -> &BTreeMap<String, String> {
        &self.content
    }
}

/// One historical attempt from the legacy answers dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRecord {
    pub task_ref: String,
    pub subtask_id: String,
    pub question: String,
    pub learner_id: String,
    pub timestamp: String,
    pub correct: i64,
}

/// Legacy answers dump, in row order.
#[derive(Debug, Clone, Default)]
pub struct LegacyAnswers {
    records: Vec<AnswerRecord>,
}

impl LegacyAnswers {
    /// Reads semicolon-delimited legacy answer rows.
    ///
    /// A usable row has at least ten fields: the task reference, subtask id,
    /// learner id, timestamp, and correctness flag sit in columns 2 through
    /// 6, the question text in the second-to-last column (`NULL` meaning no
    /// text). Shorter rows and rows with a non-integer correctness flag are
    /// logged and skipped.
    ///
    /// # Errors
    /// Returns [`ConvertError::Csv`] when the source fails mid-read.
    pub fn parse<R: Read>(source: R) -> Result<Self, ConvertError> {
        let mut answers = Self::default();
        let mut reader = delimited_reader(source);
        for (index, row) in reader.records().enumerate() {
            let row = row?;
            if row.len() < ANSWER_ROW_MIN_FIELDS {
                warn!("invalid row {index} in legacy answers source");
                continue;
            }
            let Ok(correct) = field_at(&row, 6).trim().parse::<i64>() else {
                warn!("invalid correctness flag in row {index} of legacy answers source");
                continue;
            };
            let question = match field_at(&row, row.len() - 2) {
                "NULL" => String::new(),
                text => text.to_string(),
            };
            answers.records.push(AnswerRecord {
                task_ref: field_at(&row, 2).to_string(),
                subtask_id: field_at(&row, 3).to_string(),
                question,
                learner_id: field_at(&row, 4).to_string(),
                timestamp: field_at(&row, 5).to_string(),
                correct,
            });
        }
        Ok(answers)
    }

    #[must_use]
    pub fn records(&self) -> &[AnswerRecord] {
        &self.records
    }
}

/// Course id to display name table.
#[derive(Debug, Clone, Default)]
pub struct CourseNames {
    names: BTreeMap<String, String>,
}

impl CourseNames {
    /// Reads semicolon-delimited `course_id;course_name` rows; rows with
    /// fewer than two fields are logged and skipped, extra fields are
    /// ignored.
    ///
    /// # Errors
    /// Returns [`ConvertError::Csv`] when the source fails mid-read.
    pub fn parse<R: Read>(source: R) -> Result<Self, ConvertError> {
        let mut names = Self::default();
        let mut reader = delimited_reader(source);
        for (index, row) in reader.records().enumerate() {
            let row = row?;
            if row.len() < 2 {
                warn!("invalid row {index} in course names source");
                continue;
            }
            names
                .names
                .insert(field_at(&row, 0).to_string(), field_at(&row, 1).to_string());
        }
        Ok(names)
    }

    /// Display name for a course id, falling back to the id itself.
    #[must_use]
    pub fn resolve<'a>(&'a self, course_id: &'a str) -> &'a str {
        self.names.get(course_id).map_or(course_id, String::as_str)
    }
}

/// One scored attempt at a subtask; `time` is `None` only when no submission
/// timestamp was ever recorded for the parent task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub time: Option<String>,
    pub correct: i64,
}

/// One review of an open-response submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub reviewer_id: String,
    pub points: i64,
    pub points_possible: i64,
}

/// Per-learner activity: submission times, scored attempts, open-response
/// submissions with their reviews, and viewed content.
#[derive(Debug, Default)]
pub struct LearnerActivity {
    times: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    submits: BTreeMap<String, BTreeMap<String, Vec<Attempt>>>,
    submissions: BTreeMap<String, (String, String)>,
    reviews: BTreeMap<String, Vec<Review>>,
    viewed: BTreeMap<String, BTreeSet<String>>,
}

impl LearnerActivity {
    pub fn record_submission(&mut self, learner_id: &str, task_id: &str, time: String) {
        self.times
            .entry(learner_id.to_string())
            .or_default()
            .entry(task_id.to_string())
            .or_default()
            .push(time);
    }

    /// Appends a scored attempt, timestamped with the most recent submission
    /// time recorded for the parent task, else `fallback`.
    pub fn record_attempt(
        &mut self,
        learner_id: &str,
        task_id: &str,
        subtask_id: &str,
        correct: i64,
        fallback: Option<String>,
    ) {
        let time = self
            .times
            .get(learner_id)
            .and_then(|by_task| by_task.get(task_id))
            .and_then(|times| times.last())
            .cloned()
            .or(fallback);
        self.submits
            .entry(learner_id.to_string())
            .or_default()
            .entry(subtask_id.to_string())
            .or_default()
            .push(Attempt { time, correct });
    }

    pub fn register_submission(&mut self, submission_id: &str, learner_id: &str, task_id: &str) {
        self.submissions.insert(
            submission_id.to_string(),
            (learner_id.to_string(), task_id.to_string()),
        );
    }

    pub fn record_review(
        &mut self,
        submission_id: &str,
        reviewer_id: &str,
        points: i64,
        points_possible: i64,
    ) {
        self.reviews
            .entry(submission_id.to_string())
            .or_default()
            .push(Review {
                reviewer_id: reviewer_id.to_string(),
                points,
                points_possible,
            });
    }

    pub fn mark_viewed(&mut self, learner_id: &str, content_id: &str) {
        self.viewed
            .entry(learner_id.to_string())
            .or_default()
            .insert(content_id.to_string());
    }

    fn has_attempt(&self, learner_id: &str, subtask_id: &str) -> bool {
        self.submits
            .get(learner_id)
            .and_then(|by_subtask| by_subtask.get(subtask_id))
            .is_some_and(|attempts| !attempts.is_empty())
    }

    /// Backfills attempts from the legacy answers dump. Log-derived attempts
    /// always win; a legacy record only fills a subtask the learner has no
    /// attempt for, and records with unparseable timestamps are logged and
    /// skipped.
    pub fn reconcile(&mut self, answers: &LegacyAnswers) {
        for record in answers.records() {
            let time = match normalize_timestamp(&record.timestamp) {
                Ok(time) => time,
                Err(err) => {
                    warn!(
                        "skipping legacy answer for subtask {}: {err}",
                        record.subtask_id
                    );
                    continue;
                }
            };
            if self.has_attempt(&record.learner_id, &record.subtask_id) {
                continue;
            }
            self.record_submission(&record.learner_id, &record.task_ref, time);
            self.record_attempt(
                &record.learner_id,
                &record.task_ref,
                &record.subtask_id,
                record.correct,
                None,
            );
        }
    }
}

/// Catalog of scorable items: subtasks per task, their question text and
/// response type, and display names for open-response assessments.
#[derive(Debug, Default)]
pub struct TaskCatalog {
    tasks: BTreeMap<String, BTreeSet<String>>,
    subtask_text: NonEmptyMap<String>,
    subtask_type: NonEmptyMap<String>,
    assessments: NonEmptyMap<String>,
}

impl TaskCatalog {
    pub fn add_task(
        &mut self,
        task_id: &str,
        subtask_id: &str,
        question: String,
        response_type: String,
    ) {
        self.tasks
            .entry(task_id.to_string())
            .or_default()
            .insert(subtask_id.to_string());
        self.subtask_text.set(subtask_id, question);
        self.subtask_type.set(subtask_id, response_type);
    }

    pub fn add_assessment(&mut self, task_id: &str, name: String) {
        self.assessments.set(task_id, name);
    }

    /// Backfills question text from the legacy answers dump for subtasks the
    /// event log never described.
    pub fn reconcile(&mut self, answers: &LegacyAnswers) {
        for record in answers.records() {
            if !self.subtask_text.contains_key(&record.subtask_id) {
                self.add_task(
                    &record.task_ref,
                    &record.subtask_id,
                    record.question.clone(),
                    FALLBACK_NAME.to_string(),
                );
            }
        }
    }
}

/// Position of a module in the report ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    pub module_id: String,
    pub order: usize,
    pub name: String,
}

/// Maps tasks and content items to the module containing them and assigns
/// every referenced module a stable 1-based display order.
#[derive(Debug, Default)]
pub struct ModuleIndex {
    tasks: NonEmptyMap<String>,
    content: NonEmptyMap<String>,
    index: BTreeMap<String, ModuleEntry>,
}

impl ModuleIndex {
    /// Links a task to the module its submission page belongs to.
    ///
    /// # Errors
    /// Returns [`ConvertError::MalformedEvent`] when the URL carries no
    /// module segment.
    pub fn link_task(&mut self, page_url: &str, task_ref: &str) -> Result<(), ConvertError> {
        let module_id = module_id_from_url(page_url)?.to_string();
        self.tasks.set(extract_id(task_ref), module_id);
        Ok(())
    }

    pub fn link_task_to_module(&mut self, module_id: &str, task_ref: &str) {
        self.tasks.set(extract_id(task_ref), module_id.to_string());
    }

    /// Links a content item to the module its page belongs to.
    ///
    /// # Errors
    /// Returns [`ConvertError::MalformedEvent`] when the URL carries no
    /// module segment.
    pub fn link_content(&mut self, page_url: &str, content_ref: &str) -> Result<(), ConvertError> {
        let module_id = module_id_from_url(page_url)?.to_string();
        self.content.set(extract_id(content_ref), module_id);
        Ok(())
    }

    pub fn link_content_to_module(&mut self, module_id: &str, content_ref: &str) {
        self.content.set(extract_id(content_ref), module_id.to_string());
    }

    /// Indexed module containing a task, when both sides are known.
    #[must_use]
    pub fn task_module(&self, task_ref: &str) -> Option<&ModuleEntry> {
        self.tasks
            .get(extract_id(task_ref))
            .and_then(|module_id| self.index.get(module_id))
    }

    /// Indexed module containing a content item, when both sides are known.
    #[must_use]
    pub fn content_module(&self, content_ref: &str) -> Option<&ModuleEntry> {
        self.content
            .get(extract_id(content_ref))
            .and_then(|module_id| self.index.get(module_id))
    }

    /// Consumes outline links, then indexes every module referenced by a
    /// known task or content item: in outline declaration order when an
    /// outline was supplied, otherwise in sorted id order with a placeholder
    /// display name. Open-response outline references never produce links.
    pub fn reconcile(&mut self, outline: &CourseOutline) {
        for (content_ref, module_id) in outline.content() {
            if content_ref.contains(PROBLEM_MARKER) {
                self.link_task_to_module(module_id, content_ref);
            } else if content_ref.contains(VIDEO_MARKER) {
                self.link_content_to_module(module_id, content_ref);
            }
        }

        let referenced: BTreeSet<String> = self
            .tasks
            .iter()
            .chain(self.content.iter())
            .map(|(_, module_id)| module_id.clone())
            .collect();

        if outline.modules().is_empty() {
            for module_id in &referenced {
                self.index_module(module_id, "");
            }
        } else {
            for (module_id, name) in outline.modules().iter() {
                if referenced.contains(module_id) {
                    self.index_module(module_id, name);
                }
            }
        }
    }

    fn index_module(&mut self, module_id: &str, name: &str) {
        let display = if name.is_empty() { FALLBACK_NAME } else { name };
        let order = self.index.len() + 1;
        self.index.insert(
            module_id.to_string(),
            ModuleEntry {
                module_id: module_id.to_string(),
                order,
                name: display.to_string(),
            },
        );
    }
}

/// Content items grouped by type.
#[derive(Debug, Default)]
pub struct ContentCatalog {
    content: BTreeMap<String, BTreeSet<String>>,
}

impl ContentCatalog {
    pub fn add(&mut self, content_type: &str, content_id: &str) {
        self.content
            .entry(content_type.to_string())
            .or_default()
            .insert(content_id.to_string());
    }

    /// Adds outline-declared videos the event log never mentioned.
    pub fn reconcile(&mut self, outline: &CourseOutline) {
        for content_ref in outline.content().keys() {
            if content_ref.contains(VIDEO_MARKER) {
                self.add(VIDEO_CONTENT_TYPE, extract_id(content_ref));
            }
        }
    }
}

/// Course identity for the summary artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseInfo {
    pub short_name: String,
    pub long_name: String,
}

/// One row of the learner solutions table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolutionRow {
    pub learner_id: String,
    pub item_id: String,
    pub correct: i64,
    pub time: Option<String>,
}

/// One row of the item catalog table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRow {
    pub item_id: String,
    pub item_type: String,
    pub item_name: String,
    pub module_id: String,
    pub module_order: usize,
    pub module_name: String,
}

/// One row of the viewed content table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRow {
    pub learner_id: String,
    pub content_piece_id: String,
    pub viewed: i64,
}

/// One row of the content catalog table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRow {
    pub content_piece_id: String,
    pub content_piece_type: String,
    pub content_piece_name: String,
    pub module_id: String,
    pub module_order: usize,
    pub module_name: String,
}

/// One row of the assessment scores table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRow {
    pub learner_id: String,
    pub item_id: String,
    pub reviewer_id: String,
    pub score: i64,
    pub max_score: i64,
}

/// Replays a platform event log into the aggregation models, reconciles them
/// against the supplementary sources, and serves the report row queries.
#[derive(Debug)]
pub struct LogParser {
    course_name: String,
    course_long_name: String,
    learners: LearnerActivity,
    tasks: TaskCatalog,
    modules: ModuleIndex,
    content: ContentCatalog,
}

impl LogParser {
    /// Replays `log` line by line, then reconciles the models.
    ///
    /// Per-line failures (invalid UTF-8, bad JSON, a failing handler) are
    /// logged and skipped; only a stream read failure aborts the run.
    /// Reconciliation runs learners, tasks, modules, then content, and the
    /// course display name resolves last so it can see the final short name.
    ///
    /// # Errors
    /// Returns [`ConvertError::Io`] when reading from `log` fails.
    pub fn parse<R: BufRead>(
        log: R,
        outline: &CourseOutline,
        answers: &LegacyAnswers,
        names: &CourseNames,
    ) -> Result<Self, ConvertError> {
        let registry = event_registry();
        let mut parser = Self {
            course_name: String::new(),
            course_long_name: String::new(),
            learners: LearnerActivity::default(),
            tasks: TaskCatalog::default(),
            modules: ModuleIndex::default(),
            content: ContentCatalog::default(),
        };

        for (index, line) in log.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    warn!("skipping line {index}: not valid UTF-8");
                    continue;
                }
                Err(err) => return Err(ConvertError::Io(err)),
            };
            let payload = strip_line_number(line.trim());
            let event: Value = match serde_json::from_str(payload) {
                Ok(event) => event,
                Err(err) => {
                    warn!("skipping line {index}: {err}");
                    continue;
                }
            };
            if let Err(err) = registry.dispatch(&mut parser, &event) {
                warn!("skipping line {index}: {err}");
            }
        }

        parser.learners.reconcile(answers);
        parser.tasks.reconcile(answers);
        parser.modules.reconcile(outline);
        parser.content.reconcile(outline);
        parser.course_long_name = names.resolve(&parser.course_name).to_string();

        Ok(parser)
    }

    /// Resolved course identity.
    #[must_use]
    pub fn course_info(&self) -> CourseInfo {
        CourseInfo {
            short_name: self.course_name.clone(),
            long_name: self.course_long_name.clone(),
        }
    }

    /// One row per recorded attempt, ordered by learner, subtask, then
    /// attempt sequence.
    pub fn learner_solutions(&self) -> impl Iterator<Item = SolutionRow> + '_ {
        self.learners
            .submits
            .iter()
            .flat_map(|(learner_id, by_subtask)| {
                by_subtask.iter().flat_map(move |(subtask_id, attempts)| {
                    attempts.iter().map(move |attempt| SolutionRow {
                        learner_id: learner_id.clone(),
                        item_id: subtask_id.clone(),
                        correct: attempt.correct,
                        time: attempt.time.clone(),
                    })
                })
            })
    }

    /// Catalog rows for every module-linked task: one row per subtask plus
    /// an open-response row per named assessment. Tasks without a module
    /// link produce no rows.
    pub fn item_catalog(&self) -> impl Iterator<Item = ItemRow> + '_ {
        let task_ids: BTreeSet<&str> = self
            .tasks
            .tasks
            .keys()
            .map(String::as_str)
            .chain(self.tasks.assessments.iter().map(|(task_id, _)| task_id))
            .collect();
        task_ids
            .into_iter()
            .flat_map(move |task_id| self.task_rows(task_id))
    }

    fn task_rows(&self, task_id: &str) -> Vec<ItemRow> {
        let Some(module) = self.modules.task_module(task_id) else {
            return Vec::new();
        };
        let mut rows = Vec::new();
        if let Some(subtask_ids) = self.tasks.tasks.get(task_id) {
            for subtask_id in subtask_ids {
                let text = self
                    .tasks
                    .subtask_text
                    .get(subtask_id)
                    .filter(|text| !text.is_empty())
                    .cloned()
                    .unwrap_or_else(|| FALLBACK_NAME.to_string());
                rows.push(ItemRow {
                    item_id: subtask_id.clone(),
                    item_type: self
                        .tasks
                        .subtask_type
                        .get(subtask_id)
                        .cloned()
                        .unwrap_or_default(),
                    item_name: text,
                    module_id: module.module_id.clone(),
                    module_order: module.order,
                    module_name: module.name.clone(),
                });
            }
        }
        if let Some(name) = self.tasks.assessments.get(task_id) {
            let display = if name.is_empty() {
                FALLBACK_NAME
            } else {
                name.as_str()
            };
            rows.push(ItemRow {
                item_id: extract_id(task_id).to_string(),
                item_type: OPEN_ASSESSMENT_ITEM_TYPE.to_string(),
                item_name: display.to_string(),
                module_id: module.module_id.clone(),
                module_order: module.order,
                module_name: module.name.clone(),
            });
        }
        rows
    }

    /// Viewed flags: every learner that viewed anything, crossed with every
    /// module-linked content item of every type.
    pub fn learner_content(&self) -> impl Iterator<Item = ViewRow> + '_ {
        self.learners
            .viewed
            .iter()
            .flat_map(move |(learner_id, viewed)| {
                self.content
                    .content
                    .values()
                    .flat_map(move |content_ids| {
                        content_ids
                            .iter()
                            .filter(move |content_id| {
                                self.modules.content_module(content_id).is_some()
                            })
                            .map(move |content_id| ViewRow {
                                learner_id: learner_id.clone(),
                                content_piece_id: content_id.clone(),
                                viewed: i64::from(viewed.contains(content_id)),
                            })
                    })
            })
    }

    /// Catalog rows for every module-linked content item.
    pub fn content_catalog(&self) -> impl Iterator<Item = ContentRow> + '_ {
        self.content
            .content
            .iter()
            .flat_map(move |(content_type, content_ids)| {
                content_ids.iter().filter_map(move |content_id| {
                    self.modules.content_module(content_id).map(|module| ContentRow {
                        content_piece_id: content_id.clone(),
                        content_piece_type: content_type.clone(),
                        content_piece_name: FALLBACK_NAME.to_string(),
                        module_id: module.module_id.clone(),
                        module_order: module.order,
                        module_name: module.name.clone(),
                    })
                })
            })
    }

    /// One row per review of every registered open-response submission.
    pub fn assessment_scores(&self) -> impl Iterator<Item = ReviewRow> + '_ {
        self.learners
            .submissions
            .iter()
            .flat_map(move |(submission_id, (learner_id, task_id))| {
                self.learners
                    .reviews
                    .get(submission_id)
                    .into_iter()
                    .flatten()
                    .map(move |review| ReviewRow {
                        learner_id: learner_id.clone(),
                        item_id: extract_id(task_id).to_string(),
                        reviewer_id: review.reviewer_id.clone(),
                        score: review.points,
                        max_score: review.points_possible,
                    })
            })
    }
}

/// Strips the `<n>:` prefix some exporters put on log lines; anything else,
/// including bare JSON with a leading brace, passes through untouched.
fn strip_line_number(line: &str) -> &str {
    match line.split_once(':') {
        Some((prefix, rest))
            if !prefix.is_empty() && prefix.bytes().all(|byte| byte.is_ascii_digit()) =>
        {
            rest
        }
        _ => line,
    }
}

/// Routing table for the event stream; entry order is significant, the
/// first matching entry wins.
fn event_registry() -> Registry<LogParser> {
    let mut registry = Registry::new();
    registry.register(
        Match::new().field_in("event_type", &["load_video", "edx.video.loaded"]),
        handle_video_loaded,
    );
    registry.register(
        Match::new().field_in("event_type", &["play_video", "edx.video.played"]),
        handle_video_played,
    );
    registry.register(
        Match::new()
            .field("event_type", "problem_check")
            .field("event_source", "server"),
        handle_problem_checked,
    );
    registry.register(
        Match::new().field("event_type", "edx.grades.problem.submitted"),
        handle_problem_submitted,
    );
    registry.register(
        Match::new().field("event_type", "openassessmentblock.create_submission"),
        handle_submission_created,
    );
    registry.register(
        Match::new().field_in(
            "event_type",
            &[
                "openassessmentblock.self_assess",
                "openassessmentblock.peer_assess",
                "openassessmentblock.staff_assess",
            ],
        ),
        handle_submission_assessed,
    );
    registry
}

/// Refreshes the short course name; an event without a usable course id
/// keeps the previous value.
fn refresh_course(parser: &mut LogParser, event: &Value) -> Result<(), ConvertError> {
    let course_id = lookup::<String>(event, "context.course_id")?;
    let short_name = short_course_name(&course_id);
    if !short_name.is_empty() {
        parser.course_name = short_name.to_string();
    }
    Ok(())
}

/// Video events carry their payload as a JSON-encoded string in the `event`
/// field.
fn decode_event_payload(event: &Value) -> Result<Value, ConvertError> {
    let encoded = lookup::<String>(event, "event")?;
    serde_json::from_str(&encoded).map_err(|err| {
        ConvertError::MalformedEvent(format!("event field is not valid JSON: {err}"))
    })
}

fn handle_video_loaded(parser: &mut LogParser, event: &Value) -> Result<(), ConvertError> {
    refresh_course(parser, event)?;
    let payload = decode_event_payload(event)?;
    let video_id = lookup::<String>(&payload, "id")?;
    let page = lookup::<String>(event, "page")?;
    parser.content.add(VIDEO_CONTENT_TYPE, &video_id);
    parser.modules.link_content(&page, &video_id)
}

fn handle_video_played(parser: &mut LogParser, event: &Value) -> Result<(), ConvertError> {
    refresh_course(parser, event)?;
    let learner_id = lookup::<String>(event, "context.user_id")?;
    let payload = decode_event_payload(event)?;
    let video_id = lookup::<String>(&payload, "id")?;
    parser.learners.mark_viewed(&learner_id, &video_id);
    Ok(())
}

fn handle_problem_checked(parser: &mut LogParser, event: &Value) -> Result<(), ConvertError> {
    refresh_course(parser, event)?;
    let task_id = lookup::<String>(event, "event.problem_id")?;
    let learner_id = lookup::<String>(event, "context.user_id")?;
    let time = lookup::<String>(event, "time")?;
    let submission = lookup::<Map<String, Value>>(event, "event.submission")?;
    for (subtask_id, subtask) in &submission {
        let question = lookup::<String>(subtask, "question")?;
        let response_type = lookup::<String>(subtask, "response_type")?;
        let correct = lookup::<bool>(subtask, "correct")?;
        parser
            .tasks
            .add_task(&task_id, subtask_id, question, response_type);
        parser.learners.record_attempt(
            &learner_id,
            &task_id,
            subtask_id,
            i64::from(correct),
            Some(time.clone()),
        );
    }
    Ok(())
}

fn handle_problem_submitted(parser: &mut LogParser, event: &Value) -> Result<(), ConvertError> {
    refresh_course(parser, event)?;
    let learner_id = lookup::<String>(event, "context.user_id")?;
    let task_id = lookup::<String>(event, "event.problem_id")?;
    let page = lookup::<String>(event, "referer")?;
    let time = lookup::<String>(event, "time")?;
    parser.modules.link_task(&page, &task_id)?;
    let submitted_at = normalize_timestamp(&time)?;
    parser
        .learners
        .record_submission(&learner_id, &task_id, submitted_at);
    Ok(())
}

fn handle_submission_created(parser: &mut LogParser, event: &Value) -> Result<(), ConvertError> {
    refresh_course(parser, event)?;
    let submission_id = lookup::<String>(event, "event.submission_uuid")?;
    let task_id = lookup::<String>(event, "context.module.usage_key")?;
    let learner_id = lookup::<String>(event, "context.user_id")?;
    let name = lookup::<String>(event, "context.module.display_name")?;
    let page = lookup::<String>(event, "referer")?;
    parser
        .learners
        .register_submission(&submission_id, &learner_id, &task_id);
    parser.modules.link_task(&page, &task_id)?;
    parser.tasks.add_assessment(&task_id, name);
    Ok(())
}

fn handle_submission_assessed(parser: &mut LogParser, event: &Value) -> Result<(), ConvertError> {
    refresh_course(parser, event)?;
    let submission_id = lookup::<String>(event, "event.submission_uuid")?;
    let reviewer_id = lookup::<String>(event, "context.user_id")?;
    let parts = lookup::<Vec<Value>>(event, "event.parts")?;
    let mut points = 0_i64;
    let mut points_possible = 0_i64;
    for part in &parts {
        points += lookup::<i64>(part, "option.points")?;
        points_possible += lookup::<i64>(part, "criterion.points_possible")?;
    }
    parser
        .learners
        .record_review(&submission_id, &reviewer_id, points, points_possible);
    Ok(())
}
