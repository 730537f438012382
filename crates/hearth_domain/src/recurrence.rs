use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Timestamp layout used by `UNTIL=` clauses (iCalendar basic format).
const UNTIL_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("recurrence rule `{0}` has no FREQ clause")]
    MissingFreq(String),
    #[error("unknown frequency `{0}`")]
    UnknownFreq(String),
    #[error("invalid INTERVAL `{0}`")]
    InvalidInterval(String),
    #[error("BYDAY clause has no days")]
    EmptyByDay,
    #[error("unknown BYDAY token `{0}`")]
    UnknownDay(String),
    #[error("invalid COUNT `{0}`")]
    InvalidCount(String),
    #[error("invalid UNTIL timestamp `{0}`")]
    InvalidUntil(String),
    #[error("malformed clause `{0}`")]
    MalformedClause(String),
}

/// A recurrence attached to exactly one item: the pattern string plus the
/// anchor timestamp of the first instance and an optional termination
/// condition. `count` and `end_until` are mutually exclusive; when both are
/// present `count` governs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub rrule: String,
    pub start_anchor: NaiveDateTime,
    pub end_until: Option<NaiveDateTime>,
    pub count: Option<u32>,
}

impl RecurrenceRule {
    pub fn new(rrule: impl Into<String>, start_anchor: NaiveDateTime) -> Self {
        Self {
            rrule: rrule.into(),
            start_anchor,
            end_until: None,
            count: None,
        }
    }

    pub fn until(mut self, end_until: NaiveDateTime) -> Self {
        self.end_until = Some(end_until);
        self
    }

    pub fn counted(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Parses the pattern string and folds the row-level termination
    /// condition into it. A `COUNT=` already present in the string is never
    /// overridden, and `end_until` only applies when no count exists at all.
    pub fn effective_pattern(&self) -> Result<RulePattern, RuleParseError> {
        let mut pattern: RulePattern = self.rrule.parse()?;
        if pattern.count.is_none() {
            if let Some(count) = self.count {
                pattern.count = Some(count);
            } else if pattern.until.is_none() {
                pattern.until = self.end_until;
            }
        }
        Ok(pattern)
    }
}

/// Parsed form of the supported RRULE subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePattern {
    pub freq: Frequency,
    pub interval: u32,
    pub by_day: Vec<Weekday>,
    pub count: Option<u32>,
    pub until: Option<NaiveDateTime>,
}

impl FromStr for RulePattern {
    type Err = RuleParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut freq: Option<Frequency> = None;
        let mut interval: u32 = 1;
        let mut by_day: Vec<Weekday> = Vec::new();
        let mut count: Option<u32> = None;
        let mut until: Option<NaiveDateTime> = None;

        for clause in input.split(';') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let Some((key, value)) = clause.split_once('=') else {
                return Err(RuleParseError::MalformedClause(clause.to_string()));
            };
            match key.trim().to_ascii_uppercase().as_str() {
                "FREQ" => {
                    freq = Some(parse_frequency(value.trim())?);
                }
                "INTERVAL" => {
                    interval = value
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|parsed| *parsed >= 1)
                        .ok_or_else(|| RuleParseError::InvalidInterval(value.to_string()))?;
                }
                "BYDAY" => {
                    by_day = parse_by_day(value.trim())?;
                }
                "COUNT" => {
                    count = Some(
                        value
                            .trim()
                            .parse::<u32>()
                            .ok()
                            .filter(|parsed| *parsed >= 1)
                            .ok_or_else(|| RuleParseError::InvalidCount(value.to_string()))?,
                    );
                }
                "UNTIL" => {
                    until = Some(
                        NaiveDateTime::parse_from_str(value.trim(), UNTIL_FORMAT)
                            .map_err(|_| RuleParseError::InvalidUntil(value.to_string()))?,
                    );
                }
                _ => return Err(RuleParseError::MalformedClause(clause.to_string())),
            }
        }

        let freq = freq.ok_or_else(|| RuleParseError::MissingFreq(input.to_string()))?;
        Ok(Self {
            freq,
            interval,
            by_day,
            count,
            until,
        })
    }
}

impl fmt::Display for RulePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FREQ={}", frequency_token(self.freq))?;
        if self.interval > 1 {
            write!(f, ";INTERVAL={}", self.interval)?;
        }
        if !self.by_day.is_empty() {
            let days: Vec<&str> = self.by_day.iter().map(|day| day_token(*day)).collect();
            write!(f, ";BYDAY={}", days.join(","))?;
        }
        if let Some(count) = self.count {
            write!(f, ";COUNT={}", count)?;
        }
        if let Some(until) = self.until {
            write!(f, ";UNTIL={}", until.format(UNTIL_FORMAT))?;
        }
        Ok(())
    }
}

fn parse_frequency(token: &str) -> Result<Frequency, RuleParseError> {
    match token.to_ascii_uppercase().as_str() {
        "DAILY" => Ok(Frequency::Daily),
        "WEEKLY" => Ok(Frequency::Weekly),
        "MONTHLY" => Ok(Frequency::Monthly),
        "YEARLY" => Ok(Frequency::Yearly),
        _ => Err(RuleParseError::UnknownFreq(token.to_string())),
    }
}

fn frequency_token(freq: Frequency) -> &'static str {
    match freq {
        Frequency::Daily => "DAILY",
        Frequency::Weekly => "WEEKLY",
        Frequency::Monthly => "MONTHLY",
        Frequency::Yearly => "YEARLY",
    }
}

fn parse_by_day(value: &str) -> Result<Vec<Weekday>, RuleParseError> {
    if value.is_empty() {
        return Err(RuleParseError::EmptyByDay);
    }
    let mut days = Vec::new();
    for token in value.split(',') {
        let token = token.trim();
        let day = match token.to_ascii_uppercase().as_str() {
            "MO" => Weekday::Mon,
            "TU" => Weekday::Tue,
            "WE" => Weekday::Wed,
            "TH" => Weekday::Thu,
            "FR" => Weekday::Fri,
            "SA" => Weekday::Sat,
            "SU" => Weekday::Sun,
            _ => return Err(RuleParseError::UnknownDay(token.to_string())),
        };
        days.push(day);
    }
    days.sort_by_key(|day| day.num_days_from_monday());
    days.dedup();
    Ok(days)
}

fn day_token(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

/// Monday of the calendar week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Expands a rule over `[window_start, window_end]`, inclusive of both
/// bounds. The result is strictly increasing and deduplicated. A `COUNT`
/// budget is consumed from the series start, so occurrences before the
/// window still count against it.
pub fn expand(
    rule: &RecurrenceRule,
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
) -> Result<Vec<NaiveDateTime>, RuleParseError> {
    let pattern = rule.effective_pattern()?;
    Ok(expand_pattern(
        &pattern,
        rule.start_anchor,
        window_start,
        window_end,
    ))
}

enum Step {
    Keep,
    Stop,
}

fn expand_pattern(
    pattern: &RulePattern,
    anchor: NaiveDateTime,
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
) -> Vec<NaiveDateTime> {
    let mut out: Vec<NaiveDateTime> = Vec::new();
    let mut produced: u32 = 0;

    let mut emit = |candidate: NaiveDateTime| -> Step {
        if candidate < anchor {
            return Step::Keep;
        }
        if let Some(until) = pattern.until {
            if candidate > until {
                return Step::Stop;
            }
        }
        if let Some(count) = pattern.count {
            if produced >= count {
                return Step::Stop;
            }
        }
        if candidate > window_end {
            return Step::Stop;
        }
        produced += 1;
        if candidate >= window_start {
            out.push(candidate);
        }
        Step::Keep
    };

    if pattern.freq == Frequency::Weekly && !pattern.by_day.is_empty() {
        // One candidate per listed weekday per interval-th week, walking
        // weeks from the anchor's Monday. Days before the anchor itself are
        // skipped without consuming the count budget.
        let base_week = week_start(anchor.date());
        'weeks: for week_index in 0u64.. {
            let Some(week) = base_week.checked_add_days(Days::new(
                week_index * pattern.interval as u64 * 7,
            )) else {
                break;
            };
            for day in &pattern.by_day {
                let Some(date) =
                    week.checked_add_days(Days::new(day.num_days_from_monday() as u64))
                else {
                    break 'weeks;
                };
                if let Step::Stop = emit(date.and_time(anchor.time())) {
                    break 'weeks;
                }
            }
        }
    } else {
        for step_index in 0u64.. {
            let offset = step_index * pattern.interval as u64;
            let Some(candidate) = advance(pattern.freq, anchor, offset) else {
                break;
            };
            if let Step::Stop = emit(candidate) {
                break;
            }
        }
    }

    out.dedup();
    out
}

fn advance(freq: Frequency, anchor: NaiveDateTime, offset: u64) -> Option<NaiveDateTime> {
    match freq {
        Frequency::Daily => anchor.checked_add_days(Days::new(offset)),
        Frequency::Weekly => anchor.checked_add_days(Days::new(offset * 7)),
        Frequency::Monthly => {
            anchor.checked_add_months(chrono::Months::new(u32::try_from(offset).ok()?))
        }
        Frequency::Yearly => {
            anchor.checked_add_months(chrono::Months::new(u32::try_from(offset * 12).ok()?))
        }
    }
}
