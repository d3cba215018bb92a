//! Plain-text task list engine.
//!
//! One task per line, markdown-like inline tags. The library re-derives the whole model
//! (tasks, nesting, due state, tag/project/context indexes) from text on every call and
//! hands back values or text-edit descriptors; it never touches an editor buffer.

pub mod core {
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    /* ------------------------------- Ranges ------------------------------- */

    /// Byte range inside a single line (`start..end`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct SourceRange {
        pub start: usize,
        pub end: usize,
    }

    impl SourceRange {
        pub fn new(start: usize, end: usize) -> Self {
            Self { start, end }
        }

        /// Zero-width range, used for insertions.
        pub fn empty_at(pos: usize) -> Self {
            Self {
                start: pos,
                end: pos,
            }
        }

        pub fn slice<'a>(&self, source: &'a str) -> &'a str {
            source.get(self.start..self.end).unwrap_or_default()
        }

        pub fn is_empty(&self) -> bool {
            self.start == self.end
        }

        pub fn overlaps(&self, other: &SourceRange) -> bool {
            self.start < other.end && other.start < self.end
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Single-letter priority `(A)`..`(Z)`; `A` sorts first.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Priority(pub char);

    impl Priority {
        pub fn new(letter: char) -> Option<Self> {
            letter.is_ascii_uppercase().then_some(Self(letter))
        }
    }

    /// Sigil tokens (`#tag`, `+project`, `@context`) in first-seen order.
    pub type TokenMap = IndexMap<String, SourceRange>;

    /// Closed set of due states.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum DueState {
        NotDue,
        Due,
        Overdue,
        Invalid,
    }

    impl DueState {
        pub(crate) fn rank(self) -> u8 {
            match self {
                DueState::Invalid => 0,
                DueState::NotDue => 1,
                DueState::Overdue => 2,
                DueState::Due => 3,
            }
        }

        pub fn is_actionable(self) -> bool {
            matches!(self, DueState::Due | DueState::Overdue)
        }
    }

    /// Result of evaluating a due expression against one date.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DueInfo {
        /// Expression exactly as written inside `{due:...}`.
        pub raw: String,
        pub is_due: DueState,
        pub is_recurring: bool,
        pub is_range: bool,
        /// Days since the missed date when `is_due == Overdue`.
        pub overdue_in_days: Option<i64>,
        /// Nearest date on or after the target on which the expression is due.
        pub closest_due_date: Option<NaiveDate>,
        pub days_until_due: Option<i64>,
    }

    /// A `{due:...}` token: evaluated info plus where it sits in the line.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Due {
        #[serde(flatten)]
        pub info: DueInfo,
        pub range: SourceRange,
    }

    /// Progress counter `{count:current/needed}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Count {
        pub current: u32,
        pub needed: u32,
        pub range: SourceRange,
    }

    impl Count {
        /// Counts past the target are complete too; they are never rewritten.
        pub fn is_complete(&self) -> bool {
            self.current >= self.needed
        }
    }

    /// `{overdue:YYYY-MM-DD}`: the occurrence a recurring task missed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OverdueFlag {
        pub since: NaiveDate,
        pub range: SourceRange,
    }

    /// Date with optional time-of-day, as used by `{cm:...}` and `{cr:...}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Stamp {
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
        pub range: SourceRange,
    }

    /* ------------------------------ Entities ------------------------------ */

    /// One task line. Built once by the parser and normalized once by the tree builder;
    /// edits are expressed as `TextEdit`s and a re-parse, never as field writes.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        pub line_number: usize,
        pub title: String,
        pub raw_text: String,
        pub indent_level: usize,

        pub done: bool,
        pub done_marker: Option<SourceRange>,
        pub priority: Option<Priority>,

        #[serde(default)]
        pub tags: TokenMap,
        #[serde(default)]
        pub projects: TokenMap,
        #[serde(default)]
        pub contexts: TokenMap,

        pub due: Option<Due>,
        pub count: Option<Count>,
        pub overdue: Option<OverdueFlag>,
        pub completion_date: Option<Stamp>,
        pub creation_date: Option<Stamp>,

        pub hidden: bool,
        pub collapsed: bool,
        pub collapsed_range: Option<SourceRange>,

        /// Children by line number, in source order.
        #[serde(default)]
        pub subtasks: Vec<usize>,
        /// Parent line number (navigation only).
        pub parent: Option<usize>,
    }

    impl Task {
        pub fn new(line_number: usize, raw_text: &str) -> Self {
            Self {
                line_number,
                title: String::new(),
                raw_text: raw_text.to_string(),
                indent_level: 0,
                done: false,
                done_marker: None,
                priority: None,
                tags: TokenMap::new(),
                projects: TokenMap::new(),
                contexts: TokenMap::new(),
                due: None,
                count: None,
                overdue: None,
                completion_date: None,
                creation_date: None,
                hidden: false,
                collapsed: false,
                collapsed_range: None,
                subtasks: vec![],
                parent: None,
            }
        }

        pub fn is_recurring(&self) -> bool {
            self.due.as_ref().is_some_and(|d| d.info.is_recurring)
        }

        pub fn due_state(&self) -> Option<DueState> {
            self.due.as_ref().map(|d| d.info.is_due)
        }

        /// Byte offset where the line body starts (after indentation).
        pub fn body_start(&self) -> usize {
            self.raw_text.len() - self.raw_text.trim_start().len()
        }

        /// Byte offset right after the last non-whitespace character.
        pub fn content_end(&self) -> usize {
            self.raw_text.trim_end().len()
        }
    }

    /// A comment line kept aside so collaborators can put it back in place.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CommentLine {
        pub line_number: usize,
        pub text: String,
    }

    /// Outcome of parsing one line. Parsing is total: every line maps to a variant.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ParsedLine {
        Task(Box<Task>),
        Comment(CommentLine),
        Blank,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum TodoError {
        #[error("no active task document")]
        NoActiveDocument,
        #[error("invalid setting `{field}`: {reason}")]
        InvalidSettings { field: &'static str, reason: String },
        #[error("invalid edit on line {line_number}: {reason}")]
        InvalidEdit { line_number: usize, reason: String },
        #[error("malformed settings file: {0}")]
        Config(#[from] toml::de::Error),
        #[error(transparent)]
        Io(#[from] std::io::Error),
    }
}

pub mod date_math {
    //! Day-granularity arithmetic over local, timezone-free instants.

    use chrono::{Duration, Local, NaiveDate, NaiveDateTime};

    pub fn truncate_to_date(instant: NaiveDateTime) -> NaiveDate {
        instant.date()
    }

    /// Whole calendar days from `a` to `b` (negative when `b` is earlier).
    /// Time-of-day is dropped before subtracting.
    pub fn diff_in_whole_days(a: NaiveDateTime, b: NaiveDateTime) -> i64 {
        days_between(truncate_to_date(a), truncate_to_date(b))
    }

    pub fn days_between(a: NaiveDate, b: NaiveDate) -> i64 {
        (b - a).num_days()
    }

    /// Saturates at the calendar bounds instead of failing.
    pub fn shift_by_days(date: NaiveDate, n: i64) -> NaiveDate {
        Duration::try_days(n)
            .and_then(|delta| date.checked_add_signed(delta))
            .unwrap_or(if n < 0 { NaiveDate::MIN } else { NaiveDate::MAX })
    }

    pub fn is_same_calendar_day(a: NaiveDateTime, b: NaiveDateTime) -> bool {
        a.date() == b.date()
    }

    pub fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    pub fn now() -> NaiveDateTime {
        Local::now().naive_local()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveTime;

        fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_time(NaiveTime::from_hms_opt(h, min, 0).unwrap())
        }

        #[test]
        fn diff_ignores_time_of_day() {
            assert_eq!(diff_in_whole_days(at(2024, 3, 1, 23, 59), at(2024, 3, 2, 0, 1)), 1);
            assert_eq!(diff_in_whole_days(at(2024, 3, 2, 0, 1), at(2024, 3, 1, 23, 59)), -1);
            assert_eq!(diff_in_whole_days(at(2024, 3, 1, 0, 0), at(2024, 3, 1, 23, 0)), 0);
        }

        #[test]
        fn diff_crosses_leap_day() {
            assert_eq!(diff_in_whole_days(at(2024, 2, 28, 8, 0), at(2024, 3, 1, 8, 0)), 2);
        }

        #[test]
        fn shift_moves_both_directions_and_saturates() {
            let d = NaiveDate::from_ymd_opt(2020, 1, 31).unwrap();
            assert_eq!(shift_by_days(d, 1), NaiveDate::from_ymd_opt(2020, 2, 1).unwrap());
            assert_eq!(shift_by_days(d, -31), NaiveDate::from_ymd_opt(2019, 12, 31).unwrap());
            assert_eq!(shift_by_days(d, i64::MAX), NaiveDate::MAX);
            assert_eq!(shift_by_days(d, i64::MIN), NaiveDate::MIN);
        }

        #[test]
        fn clock_helpers_agree() {
            let before = today();
            let instant = now();
            let after = today();
            assert!(truncate_to_date(instant) == before || truncate_to_date(instant) == after);
        }

        #[test]
        fn same_day_and_truncation() {
            assert!(is_same_calendar_day(at(2024, 5, 5, 0, 0), at(2024, 5, 5, 23, 59)));
            assert!(!is_same_calendar_day(at(2024, 5, 5, 23, 59), at(2024, 5, 6, 0, 0)));
            assert_eq!(
                truncate_to_date(at(2024, 5, 5, 13, 30)),
                NaiveDate::from_ymd_opt(2024, 5, 5).unwrap()
            );
        }
    }
}

pub mod settings {
    //! Parser and edit settings. Hosts load these from TOML; every field has a default.

    use crate::core::TodoError;
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    pub const DEFAULT_INDENT_UNIT: usize = 4;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        /// Whitespace columns per nesting level.
        pub indent_unit: usize,
        /// Columns a tab counts for when measuring indentation.
        pub tab_size: usize,
        pub completion_symbol: String,
        pub comment_prefix: String,
        /// Append `{cm:...}` when completing a task.
        pub add_completion_date: bool,
        pub completion_date_includes_time: bool,
        /// Extensions the host treats as task files when scanning directories.
        pub file_extensions: Vec<String>,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                indent_unit: DEFAULT_INDENT_UNIT,
                tab_size: 4,
                completion_symbol: "x ".into(),
                comment_prefix: "# ".into(),
                add_completion_date: true,
                completion_date_includes_time: false,
                file_extensions: vec!["md".into(), "txt".into()],
            }
        }
    }

    impl Settings {
        pub fn from_toml_str(input: &str) -> Result<Self, TodoError> {
            let settings: Settings = toml::from_str(input)?;
            settings.validate()?;
            Ok(settings)
        }

        pub fn load(path: &Path) -> Result<Self, TodoError> {
            let text = fs::read_to_string(path)?;
            Self::from_toml_str(&text)
        }

        pub fn validate(&self) -> Result<(), TodoError> {
            if self.indent_unit == 0 {
                return Err(TodoError::InvalidSettings {
                    field: "indent_unit",
                    reason: "must be at least 1".into(),
                });
            }
            if self.tab_size == 0 {
                return Err(TodoError::InvalidSettings {
                    field: "tab_size",
                    reason: "must be at least 1".into(),
                });
            }
            if self.completion_symbol.trim().is_empty() {
                return Err(TodoError::InvalidSettings {
                    field: "completion_symbol",
                    reason: "must contain a visible character".into(),
                });
            }
            Ok(())
        }

        /// Indent unit with the fallback applied, for hosts that cannot report one.
        pub fn effective_indent_unit(&self) -> usize {
            if self.indent_unit == 0 {
                DEFAULT_INDENT_UNIT
            } else {
                self.indent_unit
            }
        }

        pub fn effective_tab_size(&self) -> usize {
            self.tab_size.max(1)
        }

        pub fn accepts_extension(&self, ext: &str) -> bool {
            self.file_extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        }
    }

}

pub mod due {
    //! Due-date mini-language, persisted verbatim inside `{due:...}` tags.
    //!
    //! Alternatives are separated by `,`; each one is one of:
    //! - `today`, `ed` (every day)
    //! - `YYYY-MM-DD` (fixed date)
    //! - `YYYY-MM-DD|e<N>d` (every N days from the date; `-` also accepted as separator)
    //! - a weekday, full or 3-letter, any case (`mon`, `Friday`)
    //! - `YYYY-MM-DD..YYYY-MM-DD` (inclusive range)
    //!
    //! Combined state: any `Due` wins, then any `Overdue`, then `NotDue`. Invalid
    //! alternatives only matter when every alternative is invalid.

    use crate::core::{DueInfo, DueState};
    use crate::date_math::{days_between, shift_by_days};
    use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, tag_no_case, take_while, take_while1},
        character::complete::{char, digit1, one_of},
        combinator::{all_consuming, map, map_opt, map_res, opt, value},
        error::{VerboseError, VerboseErrorKind},
        sequence::{preceded, separated_pair, tuple},
    };
    use serde::{Deserialize, Serialize};

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------------ Model ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Alternative {
        Today,
        EveryDay,
        Weekday(Weekday),
        Date(NaiveDate),
        EveryNDays { start: NaiveDate, interval: u32 },
        Range { from: NaiveDate, to: NaiveDate },
        Invalid,
    }

    impl Alternative {
        pub fn parse(input: &str) -> Self {
            match all_consuming(alternative)(input.trim()) {
                Ok((_, alt)) => alt,
                Err(_) => Alternative::Invalid,
            }
        }

        pub fn is_valid(&self) -> bool {
            !matches!(self, Alternative::Invalid)
        }

        pub fn is_recurring(&self) -> bool {
            matches!(
                self,
                Alternative::EveryDay | Alternative::Weekday(_) | Alternative::EveryNDays { .. }
            )
        }

        pub fn is_range(&self) -> bool {
            matches!(self, Alternative::Range { .. })
        }

        pub fn state_on(&self, target: NaiveDate) -> DueState {
            match *self {
                Alternative::Today | Alternative::EveryDay => DueState::Due,
                Alternative::Weekday(day) => {
                    if target.weekday() == day {
                        DueState::Due
                    } else {
                        DueState::NotDue
                    }
                }
                Alternative::Date(date) => match date.cmp(&target) {
                    std::cmp::Ordering::Equal => DueState::Due,
                    std::cmp::Ordering::Less => DueState::Overdue,
                    std::cmp::Ordering::Greater => DueState::NotDue,
                },
                Alternative::EveryNDays { start, interval } => {
                    let diff = days_between(start, target);
                    if diff >= 0 && diff % i64::from(interval) == 0 {
                        DueState::Due
                    } else {
                        DueState::NotDue
                    }
                }
                Alternative::Range { from, to } => {
                    if to < target {
                        DueState::Overdue
                    } else if from <= target {
                        DueState::Due
                    } else {
                        DueState::NotDue
                    }
                }
                Alternative::Invalid => DueState::Invalid,
            }
        }

        /// Earliest date `>= target` on which this alternative is due.
        pub fn next_due_on_or_after(&self, target: NaiveDate) -> Option<NaiveDate> {
            match *self {
                Alternative::Today | Alternative::EveryDay => Some(target),
                Alternative::Weekday(day) => {
                    let ahead = (7 + i64::from(day.num_days_from_monday())
                        - i64::from(target.weekday().num_days_from_monday()))
                        % 7;
                    Some(shift_by_days(target, ahead))
                }
                Alternative::Date(date) => (date >= target).then_some(date),
                Alternative::EveryNDays { start, interval } => {
                    let diff = days_between(start, target);
                    if diff <= 0 {
                        return Some(start);
                    }
                    let rem = diff % i64::from(interval);
                    if rem == 0 {
                        Some(target)
                    } else {
                        Some(shift_by_days(target, i64::from(interval) - rem))
                    }
                }
                Alternative::Range { from, to } => (target <= to).then(|| from.max(target)),
                Alternative::Invalid => None,
            }
        }

        /// Latest date `<= target` on which this alternative is `Due` or `Overdue`.
        pub fn last_actionable_on_or_before(&self, target: NaiveDate) -> Option<NaiveDate> {
            match *self {
                Alternative::Today | Alternative::EveryDay => Some(target),
                Alternative::Weekday(day) => {
                    let back = (7 + i64::from(target.weekday().num_days_from_monday())
                        - i64::from(day.num_days_from_monday()))
                        % 7;
                    Some(shift_by_days(target, -back))
                }
                // Overdue every day after the date / range start, so `target` itself.
                Alternative::Date(start) | Alternative::Range { from: start, .. } => {
                    (start <= target).then_some(target)
                }
                Alternative::EveryNDays { start, interval } => {
                    let diff = days_between(start, target);
                    (diff >= 0).then(|| shift_by_days(target, -(diff % i64::from(interval))))
                }
                Alternative::Invalid => None,
            }
        }

        fn overdue_days(&self, target: NaiveDate) -> Option<i64> {
            match *self {
                Alternative::Date(date) if date < target => Some(days_between(date, target)),
                Alternative::Range { to, .. } if to < target => Some(days_between(to, target)),
                _ => None,
            }
        }
    }

    /// A parsed due expression; evaluate it against as many dates as needed.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DueExpression {
        pub raw: String,
        pub alternatives: Vec<Alternative>,
    }

    impl DueExpression {
        pub fn parse(raw: &str) -> Self {
            Self {
                raw: raw.to_string(),
                alternatives: raw.split(',').map(Alternative::parse).collect(),
            }
        }

        pub fn is_valid(&self) -> bool {
            self.alternatives.iter().any(Alternative::is_valid)
        }

        pub fn is_recurring(&self) -> bool {
            self.alternatives.iter().any(Alternative::is_recurring)
        }

        pub fn is_range(&self) -> bool {
            !self.is_recurring() && self.alternatives.iter().any(Alternative::is_range)
        }

        pub fn state_on(&self, target: NaiveDate) -> DueState {
            self.alternatives
                .iter()
                .map(|alt| alt.state_on(target))
                .max_by_key(|state| state.rank())
                .unwrap_or(DueState::Invalid)
        }

        pub fn closest_due_date(&self, target: NaiveDate) -> Option<NaiveDate> {
            self.alternatives
                .iter()
                .filter_map(|alt| alt.next_due_on_or_after(target))
                .min()
        }

        pub fn evaluate(&self, target: NaiveDate) -> DueInfo {
            let is_due = self.state_on(target);
            let overdue_in_days = if is_due == DueState::Overdue {
                self.alternatives
                    .iter()
                    .filter_map(|alt| alt.overdue_days(target))
                    .min()
            } else {
                None
            };
            let closest_due_date = self.closest_due_date(target);
            DueInfo {
                raw: self.raw.clone(),
                is_due,
                is_recurring: self.is_recurring(),
                is_range: self.is_range(),
                overdue_in_days,
                closest_due_date,
                days_until_due: closest_due_date.map(|date| days_between(target, date)),
            }
        }
    }

    /// Evaluate `expression` against `target`.
    pub fn evaluate(expression: &str, target: NaiveDate) -> DueInfo {
        DueExpression::parse(expression).evaluate(target)
    }

    impl DueInfo {
        /// A persisted overdue flag keeps a valid expression overdue until the task is
        /// completed, whatever today's evaluation says.
        pub fn with_overdue_flag(mut self, since: NaiveDate, target: NaiveDate) -> Self {
            if self.is_due != DueState::Invalid {
                self.is_due = DueState::Overdue;
                self.overdue_in_days = Some(days_between(since, target).max(0));
            }
            self
        }
    }

    /* ------------------------------ Grammar ------------------------------ */

    fn alternative(i: &str) -> PResult<'_, Alternative> {
        alt((
            date_range,
            every_n_days,
            map(parse_date, Alternative::Date),
            map(
                map_opt(take_while1(|c: char| c.is_ascii_alphabetic()), weekday_from_name),
                Alternative::Weekday,
            ),
            value(Alternative::Today, tag_no_case("today")),
            value(Alternative::EveryDay, tag_no_case("ed")),
        ))(i)
    }

    fn date_range(i: &str) -> PResult<'_, Alternative> {
        map_opt(
            separated_pair(parse_date, tag(".."), parse_date),
            |(from, to)| (from <= to).then_some(Alternative::Range { from, to }),
        )(i)
    }

    fn every_n_days(i: &str) -> PResult<'_, Alternative> {
        map_opt(
            tuple((
                parse_date,
                one_of("|-"),
                tag_no_case("e"),
                map_res(digit1, |s: &str| s.parse::<u32>()),
                tag_no_case("d"),
            )),
            |(start, _, _, interval, _)| {
                (interval > 0).then_some(Alternative::EveryNDays { start, interval })
            },
        )(i)
    }

    fn weekday_from_name(name: &str) -> Option<Weekday> {
        const NAMES: [(&str, &str, Weekday); 7] = [
            ("sun", "sunday", Weekday::Sun),
            ("mon", "monday", Weekday::Mon),
            ("tue", "tuesday", Weekday::Tue),
            ("wed", "wednesday", Weekday::Wed),
            ("thu", "thursday", Weekday::Thu),
            ("fri", "friday", Weekday::Fri),
            ("sat", "saturday", Weekday::Sat),
        ];
        let lower = name.to_ascii_lowercase();
        NAMES
            .iter()
            .find(|(short, long, _)| lower == *short || lower == *long)
            .map(|(_, _, day)| *day)
    }

    /// Strict `YYYY-MM-DD`: exactly 4/2/2 digits and a real calendar day.
    pub(crate) fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    /// `HH:MM` or `HH:MM:SS`.
    pub(crate) fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                opt(preceded(
                    char(':'),
                    map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                        s.parse::<u32>()
                    }),
                )),
            )),
            |(h, _, m, s)| NaiveTime::from_hms_opt(h, m, s.unwrap_or(0)).ok_or("invalid time"),
        )(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (i, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((i, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::date_math::shift_by_days;

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn fixed_date_is_due_overdue_or_not_due() {
            let due = ymd(2021, 6, 15);
            let mut day = ymd(2021, 5, 1);
            while day <= ymd(2021, 8, 1) {
                let expected = if day == due {
                    DueState::Due
                } else if due < day {
                    DueState::Overdue
                } else {
                    DueState::NotDue
                };
                let info = evaluate("2021-06-15", day);
                assert_eq!(info.is_due, expected, "on {day}");
                assert!(!info.is_recurring && !info.is_range);
                day = shift_by_days(day, 1);
            }
        }

        #[test]
        fn weekdays_match_in_any_spelling() {
            let names = [
                ("sun", "Sunday", Weekday::Sun),
                ("MON", "monday", Weekday::Mon),
                ("Tue", "TUESDAY", Weekday::Tue),
                ("wed", "Wednesday", Weekday::Wed),
                ("thu", "thursday", Weekday::Thu),
                ("fri", "FrIdAy", Weekday::Fri),
                ("sat", "saturday", Weekday::Sat),
            ];
            for year in [1999, 2018, 2024] {
                for offset in 0..14 {
                    let day = shift_by_days(ymd(year, 3, 1), offset);
                    for (short, long, weekday) in names {
                        let expected = if day.weekday() == weekday {
                            DueState::Due
                        } else {
                            DueState::NotDue
                        };
                        assert_eq!(evaluate(short, day).is_due, expected);
                        let info = evaluate(long, day);
                        assert_eq!(info.is_due, expected);
                        assert!(info.is_recurring);
                    }
                }
            }
        }

        #[test]
        fn every_two_days_from_anchor() {
            let expr = "2018-01-01|e2d";
            assert_eq!(evaluate(expr, ymd(2018, 1, 1)).is_due, DueState::Due);
            assert_eq!(evaluate(expr, ymd(2018, 1, 2)).is_due, DueState::NotDue);
            assert_eq!(evaluate(expr, ymd(2018, 1, 3)).is_due, DueState::Due);
            assert_eq!(evaluate(expr, ymd(2017, 12, 30)).is_due, DueState::NotDue);
            assert!(evaluate(expr, ymd(2018, 1, 2)).is_recurring);
        }

        #[test]
        fn dash_separator_is_accepted() {
            assert_eq!(
                evaluate("2018-01-01-e3d", ymd(2018, 1, 4)).is_due,
                DueState::Due
            );
        }

        #[test]
        fn monday_or_sunday() {
            // 2024-01-01 is a Monday.
            for offset in 0..7 {
                let day = shift_by_days(ymd(2024, 1, 1), offset);
                let expected = match day.weekday() {
                    Weekday::Mon | Weekday::Sun => DueState::Due,
                    _ => DueState::NotDue,
                };
                assert_eq!(evaluate("mon,sun", day).is_due, expected, "on {day}");
            }
        }

        #[test]
        fn invalid_fixtures() {
            for raw in ["2020", "2020-05-2", "2020-07-31|e14", "2020-07-35", "", "someday"] {
                let info = evaluate(raw, ymd(2020, 7, 1));
                assert_eq!(info.is_due, DueState::Invalid, "{raw:?}");
                assert!(!info.is_recurring && !info.is_range);
                assert_eq!(info.closest_due_date, None);
            }
        }

        #[test]
        fn malformed_interval_is_invalid() {
            for raw in [
                "2020-01-01|e0d",
                "2020-01-01|exd",
                "2020-13-01|e2d",
                "2020-01-01|e2w",
                "2020-01-01|e99999999999d",
            ] {
                assert_eq!(evaluate(raw, ymd(2020, 1, 1)).is_due, DueState::Invalid, "{raw}");
            }
        }

        #[test]
        fn today_and_every_day_are_always_due() {
            let day = ymd(2022, 9, 9);
            let today = evaluate("today", day);
            assert_eq!(today.is_due, DueState::Due);
            assert!(!today.is_recurring);
            let ed = evaluate("ED", day);
            assert_eq!(ed.is_due, DueState::Due);
            assert!(ed.is_recurring);
        }

        #[test]
        fn range_states() {
            let raw = "2022-03-10..2022-03-12";
            assert_eq!(evaluate(raw, ymd(2022, 3, 9)).is_due, DueState::NotDue);
            assert_eq!(evaluate(raw, ymd(2022, 3, 10)).is_due, DueState::Due);
            assert_eq!(evaluate(raw, ymd(2022, 3, 12)).is_due, DueState::Due);
            let after = evaluate(raw, ymd(2022, 3, 15));
            assert_eq!(after.is_due, DueState::Overdue);
            assert_eq!(after.overdue_in_days, Some(3));
            assert!(after.is_range && !after.is_recurring);
        }

        #[test]
        fn malformed_range_endpoints_are_invalid() {
            for raw in ["2022-03-10..", "2022-03-10..2022-3-12", "2022-03-12..2022-03-10"] {
                assert_eq!(evaluate(raw, ymd(2022, 3, 11)).is_due, DueState::Invalid, "{raw}");
            }
        }

        // Invalid alternatives are ignored unless all of them are invalid.
        #[test]
        fn mixed_valid_and_invalid_alternatives() {
            let day = ymd(2024, 1, 1); // Monday
            assert_eq!(evaluate("mon,garbage", day).is_due, DueState::Due);
            assert_eq!(evaluate("tue,2020-99-99", day).is_due, DueState::NotDue);
            assert_eq!(evaluate("2023-12-01,nope", day).is_due, DueState::Overdue);
            assert_eq!(evaluate("nope,2020-99-99", day).is_due, DueState::Invalid);
        }

        #[test]
        fn due_beats_overdue_across_alternatives() {
            let day = ymd(2024, 1, 1);
            assert_eq!(evaluate("2023-12-01,mon", day).is_due, DueState::Due);
            let info = evaluate("2023-12-01,tue", day);
            assert_eq!(info.is_due, DueState::Overdue);
            assert_eq!(info.overdue_in_days, Some(31));
            assert!(info.is_recurring);
        }

        #[test]
        fn closest_due_date_looks_forward() {
            let day = ymd(2024, 1, 1); // Monday
            assert_eq!(evaluate("fri", day).closest_due_date, Some(ymd(2024, 1, 5)));
            assert_eq!(evaluate("fri", day).days_until_due, Some(4));
            assert_eq!(evaluate("mon", day).days_until_due, Some(0));
            assert_eq!(
                evaluate("2023-12-25|e10d", day).closest_due_date,
                Some(ymd(2024, 1, 4))
            );
            assert_eq!(
                evaluate("2024-02-01|e10d", day).closest_due_date,
                Some(ymd(2024, 2, 1))
            );
            assert_eq!(evaluate("2023-05-05", day).closest_due_date, None);
            assert_eq!(
                evaluate("2023-05-05,2024-01-20", day).closest_due_date,
                Some(ymd(2024, 1, 20))
            );
        }

        #[test]
        fn overdue_flag_forces_overdue_for_valid_expressions() {
            let day = ymd(2024, 1, 10);
            let info = evaluate("mon", day).with_overdue_flag(ymd(2024, 1, 8), day);
            assert_eq!(info.is_due, DueState::Overdue);
            assert_eq!(info.overdue_in_days, Some(2));
            let invalid = evaluate("nope", day).with_overdue_flag(ymd(2024, 1, 8), day);
            assert_eq!(invalid.is_due, DueState::Invalid);
        }

        #[test]
        fn expression_is_reusable_across_dates() {
            let expr = DueExpression::parse(" wed , 2024-01-01..2024-01-02 ");
            assert_eq!(expr.alternatives.len(), 2);
            assert!(expr.is_recurring());
            assert!(!expr.is_range());
            assert_eq!(expr.state_on(ymd(2024, 1, 2)), DueState::Due);
            assert_eq!(expr.state_on(ymd(2024, 1, 3)), DueState::Due);
            assert_eq!(expr.state_on(ymd(2024, 1, 4)), DueState::Overdue);
        }

        #[test]
        fn time_parser_accepts_optional_seconds() {
            assert_eq!(
                parse_time("09:30").unwrap().1,
                NaiveTime::from_hms_opt(9, 30, 0).unwrap()
            );
            assert_eq!(
                parse_time("23:59:58").unwrap().1,
                NaiveTime::from_hms_opt(23, 59, 58).unwrap()
            );
            assert!(parse_time("25:00").is_err());
        }
    }
}

pub mod parser {
    //! Line parser built on `nom`.
    //!
    //! Parsing strategy:
    //! - Measure indentation, then peel the comment prefix, completion marker and `(X)`
    //!   priority off the front of the line.
    //! - Walk the rest left to right. At each position try a `{key:value}` tag, then a
    //!   sigil token (`#tag`, `+project`, `@context`) when at a word boundary.
    //! - Recognized tokens are cut from the title. Anything that does not have the
    //!   expected shape stays in the title as plain text, so parsing never fails.

    use crate::core::*;
    use crate::due::{self, PResult, parse_date, parse_time};
    use crate::settings::Settings;
    use chrono::NaiveDate;
    use log::trace;
    use nom::{
        branch::alt,
        bytes::complete::{take_till, take_till1, take_while1},
        character::complete::{char, digit1, one_of, satisfy, space1},
        combinator::{all_consuming, eof, map_res, opt},
        sequence::{delimited, pair, preceded, separated_pair, terminated},
    };

    /// Parses lines against fixed settings and a fixed "today".
    #[derive(Debug, Clone, Copy)]
    pub struct LineParser<'a> {
        settings: &'a Settings,
        today: NaiveDate,
    }

    impl<'a> LineParser<'a> {
        pub fn new(settings: &'a Settings, today: NaiveDate) -> Self {
            Self { settings, today }
        }

        pub fn today(&self) -> NaiveDate {
            self.today
        }

        pub fn parse_line(&self, text: &str, line_number: usize) -> ParsedLine {
            if text.trim().is_empty() {
                return ParsedLine::Blank;
            }

            let body_start = text.len() - text.trim_start().len();
            let body = &text[body_start..];
            let comment_prefix = self.settings.comment_prefix.as_str();
            if !comment_prefix.is_empty() && body.starts_with(comment_prefix) {
                trace!("event=parse_line line={line_number} kind=comment");
                return ParsedLine::Comment(CommentLine {
                    line_number,
                    text: text.to_string(),
                });
            }

            let mut task = Task::new(line_number, text);
            task.indent_level = self.indent_level(&text[..body_start]);

            let mut pos = body_start;
            let symbol = self.settings.completion_symbol.as_str();
            if !symbol.is_empty() && body.starts_with(symbol) {
                task.done = true;
                task.done_marker = Some(SourceRange::new(pos, pos + symbol.len()));
                pos += symbol.len();
                pos += text[pos..].len() - text[pos..].trim_start().len();
            }

            if let Ok((rest, letter)) = priority(&text[pos..]) {
                task.priority = Priority::new(letter);
                pos = text.len() - rest.len();
            }

            let scan_start = pos;
            let mut removed: Vec<SourceRange> = Vec::new();
            let mut due_token: Option<(&str, SourceRange)> = None;

            while pos < text.len() {
                let rest = &text[pos..];
                let Some(ch) = rest.chars().next() else {
                    break;
                };
                if ch == '{' {
                    if let Ok((after, (key, value))) = special_tag(rest) {
                        let range = SourceRange::new(pos, text.len() - after.len());
                        if apply_special(&mut task, &mut due_token, key, value, range) {
                            removed.push(range);
                        } else {
                            trace!(
                                "event=token_kept line={line_number} token={:?}",
                                range.slice(text)
                            );
                        }
                        pos = range.end;
                        continue;
                    }
                } else if is_sigil(ch) && at_word_boundary(text, pos, scan_start) {
                    if let Ok((after, name)) = sigil_name(rest) {
                        let range = SourceRange::new(pos, text.len() - after.len());
                        let bucket = match ch {
                            '#' => &mut task.tags,
                            '+' => &mut task.projects,
                            _ => &mut task.contexts,
                        };
                        bucket.entry(name.to_string()).or_insert(range);
                        removed.push(range);
                        pos = range.end;
                        continue;
                    }
                }
                pos += ch.len_utf8();
            }

            if let Some((raw, range)) = due_token {
                let mut info = due::evaluate(raw, self.today);
                if !task.done {
                    if let Some(flag) = task.overdue {
                        info = info.with_overdue_flag(flag.since, self.today);
                    }
                }
                task.due = Some(Due { info, range });
            }

            task.title = strip_ranges(text, scan_start, &removed);
            trace!(
                "event=parse_line line={line_number} kind=task indent={} done={} tokens={}",
                task.indent_level,
                task.done,
                removed.len()
            );
            ParsedLine::Task(Box::new(task))
        }

        fn indent_level(&self, leading: &str) -> usize {
            let tab = self.settings.effective_tab_size();
            let width: usize = leading
                .chars()
                .map(|c| if c == '\t' { tab } else { 1 })
                .sum();
            width / self.settings.effective_indent_unit()
        }
    }

    /// Parse one line with the given settings, evaluating `{due:...}` against `today`.
    pub fn parse_line(
        text: &str,
        line_number: usize,
        settings: &Settings,
        today: NaiveDate,
    ) -> ParsedLine {
        LineParser::new(settings, today).parse_line(text, line_number)
    }

    /* ------------------------------- Tokens ------------------------------- */

    fn apply_special<'t>(
        task: &mut Task,
        due_token: &mut Option<(&'t str, SourceRange)>,
        key: &str,
        value: Option<&'t str>,
        range: SourceRange,
    ) -> bool {
        match (key, value) {
            ("due", Some(raw)) if due_token.is_none() => {
                *due_token = Some((raw, range));
                true
            }
            ("cm", Some(raw)) if task.completion_date.is_none() => match parse_stamp(raw, range) {
                Some(stamp) => {
                    task.completion_date = Some(stamp);
                    true
                }
                None => false,
            },
            ("cr", Some(raw)) if task.creation_date.is_none() => match parse_stamp(raw, range) {
                Some(stamp) => {
                    task.creation_date = Some(stamp);
                    true
                }
                None => false,
            },
            ("count", Some(raw)) if task.count.is_none() => match parse_count(raw) {
                Some((current, needed)) => {
                    task.count = Some(Count {
                        current,
                        needed,
                        range,
                    });
                    true
                }
                None => false,
            },
            ("overdue", Some(raw)) if task.overdue.is_none() => {
                match all_consuming(parse_date)(raw.trim()) {
                    Ok((_, since)) => {
                        task.overdue = Some(OverdueFlag { since, range });
                        true
                    }
                    Err(_) => false,
                }
            }
            ("h", None) => {
                task.hidden = true;
                true
            }
            ("c", None) => {
                task.collapsed = true;
                task.collapsed_range.get_or_insert(range);
                true
            }
            _ => false,
        }
    }

    /// `{key}` or `{key:value}`; the value runs to the closing brace.
    fn special_tag(i: &str) -> PResult<'_, (&str, Option<&str>)> {
        delimited(
            char('{'),
            pair(
                take_while1(|c: char| c.is_ascii_alphanumeric()),
                opt(preceded(char(':'), take_till(|c: char| c == '}' || c == '{'))),
            ),
            char('}'),
        )(i)
    }

    /// `(A)` followed by whitespace or end of line.
    fn priority(i: &str) -> PResult<'_, char> {
        terminated(
            delimited(char('('), satisfy(|c: char| c.is_ascii_uppercase()), char(')')),
            alt((space1, eof)),
        )(i)
    }

    fn sigil_name(i: &str) -> PResult<'_, &str> {
        preceded(one_of("#+@"), take_till1(|c: char| c.is_whitespace()))(i)
    }

    fn parse_stamp(raw: &str, range: SourceRange) -> Option<Stamp> {
        let (_, (date, time)) =
            all_consuming(pair(parse_date, opt(preceded(char('T'), parse_time))))(raw.trim())
                .ok()?;
        Some(Stamp { date, time, range })
    }

    fn parse_count(raw: &str) -> Option<(u32, u32)> {
        let (_, counts) =
            all_consuming(separated_pair(count_number, char('/'), count_number))(raw.trim())
                .ok()?;
        Some(counts)
    }

    fn count_number(i: &str) -> PResult<'_, u32> {
        map_res(digit1, |s: &str| s.parse::<u32>())(i)
    }

    fn is_sigil(c: char) -> bool {
        matches!(c, '#' | '+' | '@')
    }

    fn at_word_boundary(text: &str, pos: usize, start: usize) -> bool {
        pos == start
            || text[..pos]
                .chars()
                .next_back()
                .is_some_and(char::is_whitespace)
    }

    /// Title text: everything from `start` minus the removed ranges, whitespace collapsed.
    fn strip_ranges(text: &str, start: usize, removed: &[SourceRange]) -> String {
        let mut kept = String::with_capacity(text.len() - start);
        let mut cursor = start;
        for range in removed {
            kept.push_str(&text[cursor..range.start]);
            kept.push(' ');
            cursor = range.end;
        }
        kept.push_str(&text[cursor..]);
        kept.split_whitespace().collect::<Vec<_>>().join(" ")
    }

}

pub mod tree {
    //! Indentation-driven tree building.
    //!
    //! Tasks live in an arena keyed by line number; parent and child links are line
    //! numbers, never references, so a snapshot can be cloned or serialized as is.

    use crate::core::Task;
    use indexmap::IndexMap;
    use log::debug;
    use serde::{Deserialize, Serialize};

    /// Tag / project / context → owning line numbers, in first-seen order.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TaskIndexes {
        #[serde(default)]
        pub tags: IndexMap<String, Vec<usize>>,
        #[serde(default)]
        pub projects: IndexMap<String, Vec<usize>>,
        #[serde(default)]
        pub contexts: IndexMap<String, Vec<usize>>,
    }

    impl TaskIndexes {
        fn record(&mut self, task: &Task) {
            for name in task.tags.keys() {
                self.tags.entry(name.clone()).or_default().push(task.line_number);
            }
            for name in task.projects.keys() {
                self.projects
                    .entry(name.clone())
                    .or_default()
                    .push(task.line_number);
            }
            for name in task.contexts.keys() {
                self.contexts
                    .entry(name.clone())
                    .or_default()
                    .push(task.line_number);
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TaskTree {
        /// Every task in document order (which is also pre-order).
        pub tasks: IndexMap<usize, Task>,
        pub roots: Vec<usize>,
        pub indexes: TaskIndexes,
    }

    /// Nest tasks by indentation in one pass.
    ///
    /// Pops the ancestor stack until its top is indented less than the current line,
    /// attaches the line there (or makes it a root), then pushes it. Levels are
    /// normalized to `parent + 1`, so a line indented two steps past its predecessor
    /// becomes that predecessor's child. Line numbers are expected to be unique.
    pub fn build_tree(tasks: impl IntoIterator<Item = Task>) -> TaskTree {
        let mut tree = TaskTree::default();
        // (measured indent, line number)
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for mut task in tasks {
            let measured = task.indent_level;
            while stack.last().is_some_and(|&(indent, _)| indent >= measured) {
                stack.pop();
            }

            let line = task.line_number;
            match stack
                .last()
                .and_then(|&(_, parent_line)| tree.tasks.get_mut(&parent_line))
            {
                Some(parent) => {
                    parent.subtasks.push(line);
                    task.parent = Some(parent.line_number);
                    task.indent_level = parent.indent_level + 1;
                }
                None => {
                    task.parent = None;
                    task.indent_level = 0;
                    tree.roots.push(line);
                }
            }

            tree.indexes.record(&task);
            stack.push((measured, line));
            debug_assert!(!tree.tasks.contains_key(&line), "duplicate line {line}");
            tree.tasks.insert(line, task);
        }

        debug!(
            "event=build_tree tasks={} roots={} tags={} projects={} contexts={}",
            tree.tasks.len(),
            tree.roots.len(),
            tree.indexes.tags.len(),
            tree.indexes.projects.len(),
            tree.indexes.contexts.len()
        );
        tree
    }

    /// Line numbers reached by a depth-first walk from `roots`.
    pub fn preorder(tasks: &IndexMap<usize, Task>, roots: &[usize]) -> Vec<usize> {
        let mut out = Vec::with_capacity(tasks.len());
        let mut pending: Vec<usize> = roots.iter().rev().copied().collect();
        while let Some(line) = pending.pop() {
            out.push(line);
            if let Some(task) = tasks.get(&line) {
                pending.extend(task.subtasks.iter().rev().copied());
            }
        }
        out
    }

}

pub mod document {
    //! Whole-document entry point and navigation over a parsed snapshot.

    use crate::core::*;
    use crate::parser::LineParser;
    use crate::settings::Settings;
    use crate::tree::{TaskIndexes, build_tree, preorder};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use log::debug;
    use serde::{Deserialize, Serialize};

    /// Snapshot of one document. Rebuilt from scratch on every change.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ParsedDocument {
        /// Tasks keyed by line number, in document order.
        pub tasks: IndexMap<usize, Task>,
        pub roots: Vec<usize>,
        #[serde(default)]
        pub comment_lines: Vec<CommentLine>,
        #[serde(default)]
        pub indexes: TaskIndexes,
    }

    pub fn parse_document(text: &str, settings: &Settings, today: NaiveDate) -> ParsedDocument {
        parse_lines(text.lines().enumerate(), settings, today)
    }

    /// Parse `(line_number, text)` pairs supplied by a host.
    pub fn parse_lines<'a>(
        lines: impl IntoIterator<Item = (usize, &'a str)>,
        settings: &Settings,
        today: NaiveDate,
    ) -> ParsedDocument {
        let parser = LineParser::new(settings, today);
        let mut tasks = Vec::new();
        let mut comment_lines = Vec::new();
        for (line_number, text) in lines {
            match parser.parse_line(text, line_number) {
                ParsedLine::Task(task) => tasks.push(*task),
                ParsedLine::Comment(comment) => comment_lines.push(comment),
                ParsedLine::Blank => {}
            }
        }
        let tree = build_tree(tasks);
        debug!(
            "event=parse_document tasks={} comments={} today={}",
            tree.tasks.len(),
            comment_lines.len(),
            today
        );
        ParsedDocument {
            tasks: tree.tasks,
            roots: tree.roots,
            comment_lines,
            indexes: tree.indexes,
        }
    }

    impl ParsedDocument {
        pub fn get(&self, line_number: usize) -> Option<&Task> {
            self.tasks.get(&line_number)
        }

        pub fn len(&self) -> usize {
            self.tasks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.tasks.is_empty()
        }

        /// Tasks in document order.
        pub fn iter(&self) -> impl Iterator<Item = &Task> {
            self.tasks.values()
        }

        pub fn root_tasks(&self) -> impl Iterator<Item = &Task> {
            self.roots.iter().filter_map(|line| self.tasks.get(line))
        }

        pub fn children<'a>(&'a self, task: &'a Task) -> impl Iterator<Item = &'a Task> {
            task.subtasks.iter().filter_map(|line| self.tasks.get(line))
        }

        pub fn parent(&self, task: &Task) -> Option<&Task> {
            task.parent.and_then(|line| self.tasks.get(&line))
        }

        /// Ancestors from the direct parent up to the root.
        pub fn ancestors(&self, task: &Task) -> Vec<&Task> {
            let mut out = Vec::new();
            let mut cursor = self.parent(task);
            while let Some(t) = cursor {
                out.push(t);
                cursor = self.parent(t);
            }
            out
        }

        /// Depth-first walk from the roots.
        pub fn preorder(&self) -> Vec<&Task> {
            preorder(&self.tasks, &self.roots)
                .into_iter()
                .filter_map(|line| self.tasks.get(&line))
                .collect()
        }

        pub fn tasks_with_tag(&self, tag: &str) -> Vec<&Task> {
            self.lookup(self.indexes.tags.get(tag))
        }

        pub fn tasks_in_project(&self, project: &str) -> Vec<&Task> {
            self.lookup(self.indexes.projects.get(project))
        }

        pub fn tasks_in_context(&self, context: &str) -> Vec<&Task> {
            self.lookup(self.indexes.contexts.get(context))
        }

        fn lookup(&self, lines: Option<&Vec<usize>>) -> Vec<&Task> {
            lines
                .map(|lines| lines.iter().filter_map(|l| self.tasks.get(l)).collect())
                .unwrap_or_default()
        }
    }

}

pub mod edits {
    //! Text-edit descriptors and the builders behind user commands.
    //!
    //! Builders only describe changes against a task's `raw_text`; hosts apply them to
    //! their buffer (or use [`apply_edits`]) and re-parse.

    use crate::core::*;
    use crate::settings::Settings;
    use chrono::{NaiveDate, NaiveDateTime};
    use log::debug;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum EditKind {
        InsertOverdueTag { since: NaiveDate },
        RemoveOverdueTag,
        ClearCount,
        SetCount { current: u32 },
        ClearCompletion,
        Complete,
        ToggleCollapsed,
    }

    /// Replace `range` of line `line_number` with `new_text`. Empty range = insertion.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TextEdit {
        pub line_number: usize,
        pub range: SourceRange,
        pub new_text: String,
        pub kind: EditKind,
    }

    impl TextEdit {
        fn replace(task: &Task, range: SourceRange, new_text: String, kind: EditKind) -> Self {
            Self {
                line_number: task.line_number,
                range,
                new_text,
                kind,
            }
        }

        fn insert_at_end(task: &Task, token: String, kind: EditKind) -> Self {
            let end = task.content_end();
            Self::replace(task, SourceRange::empty_at(end), format!(" {token}"), kind)
        }

        fn remove(task: &Task, range: SourceRange, kind: EditKind) -> Self {
            Self::replace(task, removal_range(task, range), String::new(), kind)
        }
    }

    /* ------------------------------ Builders ------------------------------ */

    pub fn insert_overdue_tag(task: &Task, since: NaiveDate) -> TextEdit {
        TextEdit::insert_at_end(
            task,
            format!("{{overdue:{}}}", since.format("%Y-%m-%d")),
            EditKind::InsertOverdueTag { since },
        )
    }

    pub fn clear_count(task: &Task) -> Option<TextEdit> {
        task.count.map(|count| {
            TextEdit::replace(
                task,
                count.range,
                format!("{{count:0/{}}}", count.needed),
                EditKind::ClearCount,
            )
        })
    }

    /// Drop the completion marker and the `{cm:...}` stamp.
    pub fn clear_completion(task: &Task) -> Vec<TextEdit> {
        let mut out = Vec::new();
        if let Some(marker) = task.done_marker {
            out.push(TextEdit::replace(
                task,
                marker,
                String::new(),
                EditKind::ClearCompletion,
            ));
        }
        if let Some(stamp) = task.completion_date {
            out.push(TextEdit::remove(task, stamp.range, EditKind::ClearCompletion));
        }
        out
    }

    /// Mark a task done: marker, optional `{cm:...}` stamp, and no more overdue flag.
    pub fn complete(task: &Task, settings: &Settings, now: NaiveDateTime) -> Vec<TextEdit> {
        if task.done {
            return Vec::new();
        }
        let mut out = vec![TextEdit::replace(
            task,
            SourceRange::empty_at(task.body_start()),
            settings.completion_symbol.clone(),
            EditKind::Complete,
        )];
        if let Some(flag) = task.overdue {
            out.push(TextEdit::remove(task, flag.range, EditKind::RemoveOverdueTag));
        }
        if settings.add_completion_date {
            let stamp = completion_stamp(settings, now);
            out.push(match task.completion_date {
                Some(existing) => {
                    TextEdit::replace(task, existing.range, stamp, EditKind::Complete)
                }
                None => TextEdit::insert_at_end(task, stamp, EditKind::Complete),
            });
        }
        out
    }

    pub fn toggle_done(task: &Task, settings: &Settings, now: NaiveDateTime) -> Vec<TextEdit> {
        let out = if task.done {
            clear_completion(task)
        } else {
            complete(task, settings, now)
        };
        debug!(
            "event=toggle_done line={} done={} edits={}",
            task.line_number,
            task.done,
            out.len()
        );
        out
    }

    /// Bump the counter; reaching the target completes the task.
    pub fn increment_count(task: &Task, settings: &Settings, now: NaiveDateTime) -> Vec<TextEdit> {
        let Some(count) = task.count else {
            return Vec::new();
        };
        let current = count.current.saturating_add(1);
        let mut out = vec![set_count(task, &count, current)];
        if current >= count.needed && !task.done {
            out.extend(complete(task, settings, now));
        }
        out
    }

    pub fn decrement_count(task: &Task) -> Vec<TextEdit> {
        match task.count {
            Some(count) if count.current > 0 => vec![set_count(task, &count, count.current - 1)],
            _ => Vec::new(),
        }
    }

    pub fn toggle_collapsed(task: &Task) -> TextEdit {
        match task.collapsed_range {
            Some(range) => TextEdit::remove(task, range, EditKind::ToggleCollapsed),
            None => TextEdit::insert_at_end(task, "{c}".into(), EditKind::ToggleCollapsed),
        }
    }

    fn set_count(task: &Task, count: &Count, current: u32) -> TextEdit {
        TextEdit::replace(
            task,
            count.range,
            format!("{{count:{current}/{}}}", count.needed),
            EditKind::SetCount { current },
        )
    }

    fn completion_stamp(settings: &Settings, now: NaiveDateTime) -> String {
        let fmt = if settings.completion_date_includes_time {
            "%Y-%m-%dT%H:%M"
        } else {
            "%Y-%m-%d"
        };
        format!("{{cm:{}}}", now.format(fmt))
    }

    /// Widen a token's range by one neighbouring space so removal leaves no double gap.
    /// The following space goes first; the preceding one only if it is not part of the
    /// indentation or the completion marker.
    fn removal_range(task: &Task, range: SourceRange) -> SourceRange {
        let text = task.raw_text.as_str();
        if text[range.end..].starts_with(' ') {
            return SourceRange::new(range.start, range.end + 1);
        }
        let floor = task
            .done_marker
            .map_or(task.body_start(), |marker| marker.end);
        if range.start > floor && text[..range.start].ends_with(' ') {
            return SourceRange::new(range.start - 1, range.end);
        }
        range
    }

    /* ------------------------------ Applying ------------------------------ */

    /// Apply edits to a whole text. Lines are split on `\n`; edits on one line must not
    /// overlap and must sit on char boundaries.
    pub fn apply_edits(text: &str, edits: &[TextEdit]) -> Result<String, TodoError> {
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let mut sorted: Vec<&TextEdit> = edits.iter().collect();
        sorted.sort_by_key(|e| (e.line_number, e.range.start, e.range.end));

        for group in sorted.chunk_by(|a, b| a.line_number == b.line_number) {
            let line_number = group[0].line_number;
            let invalid = |reason: String| TodoError::InvalidEdit {
                line_number,
                reason,
            };
            let line = lines
                .get_mut(line_number)
                .ok_or_else(|| invalid("line does not exist".into()))?;

            for edit in group {
                let SourceRange { start, end } = edit.range;
                if start > end || end > line.len() {
                    return Err(invalid(format!("range {start}..{end} out of bounds")));
                }
                if !line.is_char_boundary(start) || !line.is_char_boundary(end) {
                    return Err(invalid(format!("range {start}..{end} splits a character")));
                }
            }
            if let Some(pair) = group.windows(2).find(|w| w[0].range.overlaps(&w[1].range)) {
                return Err(invalid(format!(
                    "edits {}..{} and {}..{} overlap",
                    pair[0].range.start, pair[0].range.end, pair[1].range.start, pair[1].range.end
                )));
            }

            for edit in group.iter().rev() {
                line.replace_range(edit.range.start..edit.range.end, &edit.new_text);
            }
        }

        debug!("event=apply_edits edits={}", edits.len());
        Ok(lines.join("\n"))
    }

}

pub mod recurrence {
    //! Day-change pass over recurring tasks.

    use crate::core::Task;
    use crate::date_math::shift_by_days;
    use crate::due::DueExpression;
    use crate::edits::{TextEdit, clear_completion, clear_count, insert_overdue_tag};
    use chrono::{NaiveDate, NaiveDateTime};
    use log::debug;

    /// Edits that carry recurring tasks from the last visit into a new day.
    ///
    /// Per task, in order: a missed occurrence (`{overdue:...}`), a counter reset, and
    /// reopening when done. Missed occurrences are only looked for when `now` is on a
    /// later calendar day than `last_visit`; counter resets and reopening always apply.
    pub fn reset_for_new_visit<'a>(
        tasks: impl IntoIterator<Item = &'a Task>,
        last_visit: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Vec<TextEdit> {
        let (since, today) = (last_visit.date(), now.date());
        let new_day = today > since;

        let mut edits = Vec::new();
        for task in tasks {
            let Some(due) = task.due.as_ref().filter(|d| d.info.is_recurring) else {
                continue;
            };

            if new_day && !task.done && task.overdue.is_none() {
                let expression = DueExpression::parse(&due.info.raw);
                if let Some(missed) = find_missed_occurrence(&expression, since, today) {
                    debug!(
                        "event=missed_occurrence line={} date={missed}",
                        task.line_number
                    );
                    edits.push(insert_overdue_tag(task, missed));
                }
            }
            edits.extend(clear_count(task));
            if task.done {
                edits.extend(clear_completion(task));
            }
        }

        debug!(
            "event=reset_for_new_visit last_visit={since} now={today} new_day={new_day} edits={}",
            edits.len()
        );
        edits
    }

    /// Latest day in `[since, today)` on which the expression was due or overdue.
    ///
    /// Each alternative reports its own latest such day directly, so the cost does not
    /// grow with the gap between `since` and `today`.
    pub fn find_missed_occurrence(
        expression: &DueExpression,
        since: NaiveDate,
        today: NaiveDate,
    ) -> Option<NaiveDate> {
        if today <= since {
            return None;
        }
        let yesterday = shift_by_days(today, -1);
        expression
            .alternatives
            .iter()
            .filter_map(|alt| alt.last_actionable_on_or_before(yesterday))
            .max()
            .filter(|day| *day >= since)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::ParsedLine;
        use crate::edits::{EditKind, apply_edits};
        use crate::parser::parse_line;
        use crate::settings::Settings;
        use chrono::{Datelike, Weekday};

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn at(date: NaiveDate, h: u32) -> NaiveDateTime {
            date.and_hms_opt(h, 0, 0).unwrap()
        }

        fn task(text: &str, line: usize, today: NaiveDate) -> Task {
            match parse_line(text, line, &Settings::default(), today) {
                ParsedLine::Task(t) => *t,
                other => panic!("expected task, got {:?}", other),
            }
        }

        // Wednesday
        fn now() -> NaiveDate {
            ymd(2024, 5, 15)
        }

        #[test]
        fn missed_occurrence_three_days_back() {
            let today = now();
            let missed = shift_by_days(today, -3);
            assert_eq!(missed.weekday(), Weekday::Sun);
            let t = task("stretch {due:sun}", 0, today);
            let edits = reset_for_new_visit(
                [&t],
                at(shift_by_days(today, -5), 9),
                at(today, 8),
            );
            assert_eq!(edits.len(), 1);
            assert_eq!(edits[0].kind, EditKind::InsertOverdueTag { since: missed });
            assert_eq!(edits[0].new_text, " {overdue:2024-05-12}");
        }

        #[test]
        fn closest_occurrence_wins() {
            let today = now();
            let t = task("review {due:mon,fri}", 0, today);
            let edits = reset_for_new_visit([&t], at(ymd(2024, 5, 1), 9), at(today, 9));
            // Monday the 13th is closer than Friday the 10th.
            assert_eq!(
                edits[0].kind,
                EditKind::InsertOverdueTag {
                    since: ymd(2024, 5, 13)
                }
            );
        }

        #[test]
        fn last_visit_day_is_inclusive_and_today_is_excluded() {
            let today = now();
            let t = task("weekly {due:tue}", 0, today);
            let hit = reset_for_new_visit([&t], at(ymd(2024, 5, 14), 23), at(today, 0));
            assert_eq!(hit.len(), 1);

            let due_today = task("mid {due:wed}", 0, today);
            assert!(
                reset_for_new_visit([&due_today], at(ymd(2024, 5, 14), 9), at(today, 9)).is_empty()
            );
        }

        #[test]
        fn same_day_visit_still_resets_and_reopens() {
            let today = now();
            let t = task("x daily {due:ed} {count:3/3} {cm:2024-05-14}", 0, today);
            let edits = reset_for_new_visit([&t], at(today, 7), at(today, 22));
            let kinds: Vec<&EditKind> = edits.iter().map(|e| &e.kind).collect();
            assert_eq!(
                kinds,
                vec![
                    &EditKind::ClearCount,
                    &EditKind::ClearCompletion,
                    &EditKind::ClearCompletion
                ]
            );

            let open = task("daily {due:ed} {count:1/3}", 1, today);
            let edits = reset_for_new_visit([&open], at(today, 7), at(today, 22));
            assert_eq!(edits.len(), 1);
            assert_eq!(edits[0].kind, EditKind::ClearCount);
        }

        #[test]
        fn last_visit_after_now_never_flags() {
            let today = now();
            let t = task("daily {due:ed}", 0, today);
            assert!(reset_for_new_visit([&t], at(ymd(2024, 6, 1), 7), at(today, 22)).is_empty());
        }

        #[test]
        fn already_flagged_task_is_not_flagged_again() {
            let today = now();
            let t = task("daily {due:ed} {overdue:2024-05-10}", 0, today);
            assert!(reset_for_new_visit([&t], at(ymd(2024, 5, 9), 9), at(today, 9)).is_empty());
        }

        #[test]
        fn done_recurring_task_reopens_and_resets_count() {
            let today = now();
            let text = "x daily {due:ed} {count:3/3} {cm:2024-05-14}";
            let t = task(text, 0, today);
            let edits = reset_for_new_visit([&t], at(ymd(2024, 5, 14), 20), at(today, 8));
            let kinds: Vec<&EditKind> = edits.iter().map(|e| &e.kind).collect();
            assert_eq!(
                kinds,
                vec![
                    &EditKind::ClearCount,
                    &EditKind::ClearCompletion,
                    &EditKind::ClearCompletion
                ]
            );
            assert_eq!(apply_edits(text, &edits).expect("apply"), "daily {due:ed} {count:0/3}");
        }

        #[test]
        fn undone_counter_task_is_flagged_and_reset() {
            let today = now();
            let text = "  reps {due:ed} {count:1/5}";
            let t = task(text, 0, today);
            let edits = reset_for_new_visit([&t], at(ymd(2024, 5, 13), 9), at(today, 9));
            assert_eq!(
                apply_edits(text, &edits).expect("apply"),
                "  reps {due:ed} {count:0/5} {overdue:2024-05-14}"
            );
        }

        #[test]
        fn non_recurring_tasks_are_ignored() {
            let today = now();
            let tasks = [
                task("x paid {due:2024-05-10} {cm:2024-05-10}", 0, today),
                task("trip {due:2024-05-01..2024-05-20} {count:1/2}", 1, today),
                task("plain", 2, today),
                task("broken {due:someday}", 3, today),
            ];
            assert!(reset_for_new_visit(&tasks, at(ymd(2024, 5, 1), 9), at(today, 9)).is_empty());
        }

        #[test]
        fn interval_recurrence_scans_anchor_dates() {
            let expr = DueExpression::parse("2024-05-01|e4d");
            assert_eq!(
                find_missed_occurrence(&expr, ymd(2024, 5, 1), ymd(2024, 5, 12)),
                Some(ymd(2024, 5, 9))
            );
            assert_eq!(
                find_missed_occurrence(&expr, ymd(2024, 5, 10), ymd(2024, 5, 13)),
                None
            );
        }

        #[test]
        fn missed_occurrence_matches_day_by_day_scan() {
            let today = now();
            let since = ymd(2024, 3, 20);
            for raw in [
                "ed",
                "sat",
                "mon,thu",
                "2024-04-02|e9d",
                "2024-05-14|e3d",
                "2024-06-01|e2d",
                "2024-05-01..2024-05-03",
                "2024-03-01",
                "2024-07-01,fri",
                "nonsense",
            ] {
                let expr = DueExpression::parse(raw);
                let mut expected = None;
                let mut day = shift_by_days(today, -1);
                while day >= since {
                    if expr.state_on(day).is_actionable() {
                        expected = Some(day);
                        break;
                    }
                    day = shift_by_days(day, -1);
                }
                assert_eq!(
                    find_missed_occurrence(&expr, since, today),
                    expected,
                    "{raw}"
                );
            }
        }

        #[test]
        fn distant_last_visit_with_future_anchor_finds_nothing() {
            let expr = DueExpression::parse("2024-06-01|e2d");
            assert_eq!(
                find_missed_occurrence(&expr, NaiveDate::MIN, ymd(2024, 5, 15)),
                None
            );
            let weekly = DueExpression::parse("fri");
            assert_eq!(
                find_missed_occurrence(&weekly, NaiveDate::MIN, ymd(2024, 5, 15)),
                Some(ymd(2024, 5, 10))
            );
        }

        #[test]
        fn edits_follow_task_order() {
            let today = now();
            let tasks = [task("a {due:ed}", 4, today), task("b {due:ed}", 9, today)];
            let lines: Vec<usize> = reset_for_new_visit(&tasks, at(ymd(2024, 5, 10), 9), at(today, 9))
                .iter()
                .map(|e| e.line_number)
                .collect();
            assert_eq!(lines, vec![4, 9]);
        }
    }
}

pub mod projectors {
    pub mod agenda {
        //! Agenda read model: tasks that need attention on a given day.

        use crate::core::*;
        use crate::document::ParsedDocument;
        use crate::due;
        use chrono::NaiveDate;
        use serde::{Deserialize, Serialize};

        /// Denormalized task slice for agenda lists.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct AgendaItem {
            pub line_number: usize,
            pub title: String,
            pub done: bool,
            pub priority: Option<Priority>,
            pub due: DueInfo,
            pub tags: Vec<String>,
            pub projects: Vec<String>,
            pub contexts: Vec<String>,
            pub context_path: Vec<String>, // ancestor titles, root first
        }

        #[derive(Debug, Clone, Copy, Default)]
        pub struct AgendaOptions {
            pub include_done: bool,
            pub include_hidden: bool,
        }

        /// Tasks due or overdue on `date`: overdue first, then by priority, then by line.
        pub fn project_agenda(
            doc: &ParsedDocument,
            date: NaiveDate,
            opts: AgendaOptions,
        ) -> Vec<AgendaItem> {
            let mut out: Vec<AgendaItem> = doc
                .iter()
                .filter(|t| opts.include_done || !t.done)
                .filter(|t| opts.include_hidden || !t.hidden)
                .filter_map(|t| {
                    let info = due_on(t, date)?;
                    info.is_due.is_actionable().then(|| make_item(doc, t, info))
                })
                .collect();
            out.sort_by_key(|item| {
                (
                    item.due.is_due != DueState::Overdue,
                    item.priority.is_none(),
                    item.priority,
                    item.line_number,
                )
            });
            out
        }

        /// Re-evaluate a task's due expression against `date`.
        pub fn due_on(task: &Task, date: NaiveDate) -> Option<DueInfo> {
            let due = task.due.as_ref()?;
            let info = due::evaluate(&due.info.raw, date);
            Some(match task.overdue {
                Some(flag) if !task.done => info.with_overdue_flag(flag.since, date),
                _ => info,
            })
        }

        fn make_item(doc: &ParsedDocument, task: &Task, due: DueInfo) -> AgendaItem {
            let mut context_path: Vec<String> =
                doc.ancestors(task).iter().map(|a| a.title.clone()).collect();
            context_path.reverse();
            AgendaItem {
                line_number: task.line_number,
                title: task.title.clone(),
                done: task.done,
                priority: task.priority,
                due,
                tags: task.tags.keys().cloned().collect(),
                projects: task.projects.keys().cloned().collect(),
                contexts: task.contexts.keys().cloned().collect(),
                context_path,
            }
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::document::parse_document;
            use crate::settings::Settings;

            fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
                NaiveDate::from_ymd_opt(y, m, d).unwrap()
            }

            const DOC: &str = "\
home +house
    (B) vacuum {due:2024-03-04}
    (A) mop {due:2024-03-01}
    dust {due:mon}
        shelves {due:ed}
x paid rent {due:2024-03-04}
secret {due:ed} {h}
later {due:2024-04-01}
(C) weekly sync {due:fri} {overdue:2024-03-01}
";

            fn lines(items: &[AgendaItem]) -> Vec<usize> {
                items.iter().map(|i| i.line_number).collect()
            }

            #[test]
            fn sorts_overdue_then_priority_then_line() {
                // 2024-03-04 is a Monday.
                let doc = parse_document(DOC, &Settings::default(), ymd(2024, 3, 4));
                let items = project_agenda(&doc, ymd(2024, 3, 4), AgendaOptions::default());
                assert_eq!(lines(&items), vec![2, 8, 1, 3, 4]);
                assert_eq!(items[0].due.overdue_in_days, Some(3));
                assert_eq!(items[1].due.overdue_in_days, Some(3));
                assert_eq!(items[4].context_path, vec!["home", "dust"]);
            }

            #[test]
            fn evaluates_against_requested_date() {
                let doc = parse_document(DOC, &Settings::default(), ymd(2024, 3, 4));
                let items = project_agenda(&doc, ymd(2024, 2, 29), AgendaOptions::default());
                // Thursday: only daily tasks and the flagged one.
                assert_eq!(lines(&items), vec![8, 4]);
            }

            #[test]
            fn options_widen_the_selection() {
                let doc = parse_document(DOC, &Settings::default(), ymd(2024, 3, 4));
                let items = project_agenda(
                    &doc,
                    ymd(2024, 3, 4),
                    AgendaOptions {
                        include_done: true,
                        include_hidden: true,
                    },
                );
                assert!(lines(&items).contains(&5));
                assert!(lines(&items).contains(&6));
                let paid = items.iter().find(|i| i.line_number == 5).expect("paid");
                assert!(paid.done);
            }

            #[test]
            fn done_task_ignores_overdue_flag() {
                let doc = parse_document(
                    "x sync {due:fri} {overdue:2024-03-01}",
                    &Settings::default(),
                    ymd(2024, 3, 4),
                );
                let task = doc.get(0).expect("task");
                assert_eq!(due_on(task, ymd(2024, 3, 4)).map(|d| d.is_due), Some(DueState::NotDue));
            }
        }
    }

    pub mod tree_view {
        //! Group and hierarchy views handed to tree UIs.

        use crate::core::*;
        use crate::document::ParsedDocument;
        use indexmap::IndexMap;
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum GroupBy {
            #[default]
            Tasks,
            Tags,
            Projects,
            Contexts,
        }

        /// Closed set of tree nodes.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        pub enum TreeItem {
            TagGroup {
                name: String,
                tasks: Vec<TreeItem>,
            },
            ProjectGroup {
                name: String,
                tasks: Vec<TreeItem>,
            },
            ContextGroup {
                name: String,
                tasks: Vec<TreeItem>,
            },
            TaskNode {
                line_number: usize,
                title: String,
                done: bool,
                due: Option<DueState>,
                collapsed: bool,
                children: Vec<TreeItem>,
            },
        }

        impl TreeItem {
            pub fn label(&self) -> &str {
                match self {
                    TreeItem::TagGroup { name, .. }
                    | TreeItem::ProjectGroup { name, .. }
                    | TreeItem::ContextGroup { name, .. } => name,
                    TreeItem::TaskNode { title, .. } => title,
                }
            }

            pub fn children(&self) -> &[TreeItem] {
                match self {
                    TreeItem::TagGroup { tasks, .. }
                    | TreeItem::ProjectGroup { tasks, .. }
                    | TreeItem::ContextGroup { tasks, .. } => tasks,
                    TreeItem::TaskNode { children, .. } => children,
                }
            }
        }

        /// Hidden tasks (and everything under them) never appear.
        pub fn project_tree(doc: &ParsedDocument, group: GroupBy) -> Vec<TreeItem> {
            match group {
                GroupBy::Tasks => doc
                    .root_tasks()
                    .filter(|t| !t.hidden)
                    .map(|t| task_node(doc, t))
                    .collect(),
                GroupBy::Tags => groups(doc, &doc.indexes.tags, |name, tasks| TreeItem::TagGroup {
                    name,
                    tasks,
                }),
                GroupBy::Projects => groups(doc, &doc.indexes.projects, |name, tasks| {
                    TreeItem::ProjectGroup { name, tasks }
                }),
                GroupBy::Contexts => groups(doc, &doc.indexes.contexts, |name, tasks| {
                    TreeItem::ContextGroup { name, tasks }
                }),
            }
        }

        fn task_node(doc: &ParsedDocument, task: &Task) -> TreeItem {
            TreeItem::TaskNode {
                line_number: task.line_number,
                title: task.title.clone(),
                done: task.done,
                due: task.due_state(),
                collapsed: task.collapsed,
                children: doc
                    .children(task)
                    .filter(|t| !t.hidden)
                    .map(|t| task_node(doc, t))
                    .collect(),
            }
        }

        fn leaf(task: &Task) -> TreeItem {
            TreeItem::TaskNode {
                line_number: task.line_number,
                title: task.title.clone(),
                done: task.done,
                due: task.due_state(),
                collapsed: task.collapsed,
                children: Vec::new(),
            }
        }

        /// Groups sorted by name (case-insensitive); empty groups are dropped.
        fn groups(
            doc: &ParsedDocument,
            index: &IndexMap<String, Vec<usize>>,
            make: impl Fn(String, Vec<TreeItem>) -> TreeItem,
        ) -> Vec<TreeItem> {
            let mut names: Vec<&String> = index.keys().collect();
            names.sort_by_key(|n| (n.to_lowercase(), n.as_str()));
            names
                .into_iter()
                .filter_map(|name| {
                    let tasks: Vec<TreeItem> = index[name]
                        .iter()
                        .filter_map(|line| doc.get(*line))
                        .filter(|t| !t.hidden)
                        .map(leaf)
                        .collect();
                    (!tasks.is_empty()).then(|| make(name.clone(), tasks))
                })
                .collect()
        }

    }
}

pub mod storage {
    //! Loading documents from disk.

    use crate::core::TodoError;
    use crate::document::{ParsedDocument, parse_document};
    use crate::settings::Settings;
    use anyhow::{Context, Result};
    use chrono::NaiveDate;
    use log::debug;
    use std::{fs, path::Path};

    /// Separates reading a document from the parse itself.
    pub trait DocumentSource {
        fn read_text(&self, path: &Path) -> Result<String>;
        fn load_document(&self, path: &Path) -> Result<ParsedDocument>;
    }

    /// Reads files from the local filesystem and parses them with fixed settings.
    #[derive(Debug, Clone)]
    pub struct FsDocumentSource {
        pub settings: Settings,
        pub today: NaiveDate,
    }

    impl FsDocumentSource {
        pub fn new(settings: Settings, today: NaiveDate) -> Self {
            Self { settings, today }
        }
    }

    impl DocumentSource for FsDocumentSource {
        fn read_text(&self, path: &Path) -> Result<String> {
            fs::read_to_string(path)
                .map_err(TodoError::from)
                .with_context(|| format!("reading {}", path.display()))
        }

        fn load_document(&self, path: &Path) -> Result<ParsedDocument> {
            let text = self.read_text(path)?;
            let doc = parse_document(&text, &self.settings, self.today);
            debug!(
                "event=load_document path={} tasks={}",
                path.display(),
                doc.len()
            );
            Ok(doc)
        }
    }

}

pub use crate::core::{DueInfo, DueState, ParsedLine, Task, TodoError};
pub use document::{ParsedDocument, parse_document, parse_lines};
pub use due::{DueExpression, evaluate};
pub use edits::{TextEdit, apply_edits};
pub use parser::{LineParser, parse_line};
pub use recurrence::reset_for_new_visit;
pub use settings::Settings;
pub use tree::build_tree;
