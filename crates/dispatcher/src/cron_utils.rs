//! CRON表达式解析和求值
//!
//! 支持两种字段布局：
//!
//! | 布局 | 字段 |
//! |---|---|
//! | 5字段 | 分 时 日 月 周 |
//! | 6字段 | 秒 分 时 日 月 周 |
//!
//! 每个字段支持 `*`、单值、逗号列表、范围 `a-b`、步长 `a/n` / `a-b/n` / `*/n`。
//! 月份与星期支持英文缩写（`JAN`-`DEC`、`SUN`-`SAT`），星期中 `7` 等同于周日，
//! 日与周字段接受 `?` 作为 `*`。日与周同时受限时二者取"或"。

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike,
};

use scheduler_core::{SchedulerError, SchedulerResult};

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// 闰年2月29日最长间隔8年出现一次
const SEARCH_YEARS: i32 = 9;

/// 字段布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronSchema {
    /// 分 时 日 月 周，秒固定为0
    Standard,
    /// 秒 分 时 日 月 周
    WithSeconds,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: Option<(&'static [&'static str], u32)>,
    allow_question: bool,
}

const SECONDS: FieldSpec = FieldSpec {
    name: "秒",
    min: 0,
    max: 59,
    names: None,
    allow_question: false,
};
const MINUTES: FieldSpec = FieldSpec {
    name: "分钟",
    min: 0,
    max: 59,
    names: None,
    allow_question: false,
};
const HOURS: FieldSpec = FieldSpec {
    name: "小时",
    min: 0,
    max: 23,
    names: None,
    allow_question: false,
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "日",
    min: 1,
    max: 31,
    names: None,
    allow_question: true,
};
const MONTHS: FieldSpec = FieldSpec {
    name: "月",
    min: 1,
    max: 12,
    names: Some((MONTH_NAMES, 1)),
    allow_question: false,
};
const DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "星期",
    min: 0,
    max: 7,
    names: Some((WEEKDAY_NAMES, 0)),
    allow_question: true,
};

/// 单个字段的取值集合（位图）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    /// 字段不是以 `*` / `?` 开头
    restricted: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }
}

/// 解析后的CRON表达式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    expression: String,
    schema: CronSchema,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpression {
    /// 解析CRON表达式
    pub fn parse(expression: &str) -> SchedulerResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let schema = match fields.len() {
            5 => CronSchema::Standard,
            6 => CronSchema::WithSeconds,
            n => {
                return Err(invalid(
                    expression,
                    format!("字段数量必须为5或6，实际为{n}"),
                ))
            }
        };

        let (second_field, rest) = match schema {
            CronSchema::Standard => ("0", &fields[..]),
            CronSchema::WithSeconds => (fields[0], &fields[1..]),
        };

        let parse = |field: &str, spec: &FieldSpec| {
            parse_field(field, spec).map_err(|message| invalid(expression, message))
        };

        Ok(Self {
            expression: expression.trim().to_string(),
            schema,
            seconds: parse(second_field, &SECONDS)?,
            minutes: parse(rest[0], &MINUTES)?,
            hours: parse(rest[1], &HOURS)?,
            days_of_month: parse(rest[2], &DAYS_OF_MONTH)?,
            months: parse(rest[3], &MONTHS)?,
            days_of_week: parse(rest[4], &DAYS_OF_WEEK)?,
        })
    }

    /// 验证CRON表达式是否有效
    pub fn validate(expression: &str) -> SchedulerResult<()> {
        Self::parse(expression).map(|_| ())
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn schema(&self) -> CronSchema {
        self.schema
    }

    /// 给定时间（按其所在时区的本地时间）是否匹配全部字段
    pub fn matches<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> bool {
        let local = time.naive_local();
        self.time_matches(&local) && self.date_matches(local.date())
    }

    /// 严格晚于 `after` 的最早匹配时间
    ///
    /// 在 `after` 所在时区求值。夏令时跳过的本地时间不会触发；
    /// 回拨造成的重复本地时间取较早的一次。
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let mut candidate = after.naive_local().with_nanosecond(0)? + Duration::seconds(1);
        let last_year = candidate.year() + SEARCH_YEARS;

        loop {
            if candidate.year() > last_year {
                return None;
            }

            if !self.months.contains(candidate.month()) {
                candidate = first_day_of_next_month(candidate.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.date_matches(candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.hours.contains(candidate.hour()) {
                candidate = candidate.date().and_hms_opt(candidate.hour(), 0, 0)?
                    + Duration::hours(1);
                continue;
            }

            if !self.minutes.contains(candidate.minute()) {
                candidate = candidate
                    .date()
                    .and_hms_opt(candidate.hour(), candidate.minute(), 0)?
                    + Duration::minutes(1);
                continue;
            }

            if !self.seconds.contains(candidate.second()) {
                candidate += Duration::seconds(1);
                continue;
            }

            match tz.from_local_datetime(&candidate) {
                LocalResult::Single(time) if time > *after => return Some(time),
                LocalResult::Ambiguous(earliest, latest) => {
                    if earliest > *after {
                        return Some(earliest);
                    }
                    if latest > *after {
                        return Some(latest);
                    }
                }
                _ => {}
            }
            candidate += Duration::seconds(1);
        }
    }

    /// 从 `after` 开始的若干次触发时间
    pub fn upcoming<Tz: TimeZone>(&self, after: &DateTime<Tz>, count: usize) -> Vec<DateTime<Tz>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after.clone();
        while times.len() < count {
            match self.next_after(&cursor) {
                Some(next) => {
                    cursor = next.clone();
                    times.push(next);
                }
                None => break,
            }
        }
        times
    }

    fn time_matches(&self, local: &NaiveDateTime) -> bool {
        self.seconds.contains(local.second())
            && self.minutes.contains(local.minute())
            && self.hours.contains(local.hour())
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        if self.days_of_month.restricted && self.days_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl std::fmt::Display for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

fn invalid(expression: &str, message: String) -> SchedulerError {
    SchedulerError::InvalidCronExpression {
        expr: expression.to_string(),
        message,
    }
}

fn first_day_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<FieldSet, String> {
    if field.is_empty() {
        return Err(format!("{}字段为空", spec.name));
    }
    if field == "?" && !spec.allow_question {
        return Err(format!("{}字段不支持 '?'", spec.name));
    }

    let restricted = !(field.starts_with('*') || field.starts_with('?'));
    let mut bits = 0u64;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("{}字段的步长无效: '{part}'", spec.name))?;
                if step == 0 {
                    return Err(format!("{}字段的步长必须大于0: '{part}'", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" || (range == "?" && spec.allow_question) {
            (spec.min, spec.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, spec)?, parse_value(high, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(format!("{}字段的范围无效: '{part}'", spec.name));
        }

        for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
            // 星期字段中7与0都表示周日
            let value = if spec.max == 7 && value == 7 { 0 } else { value };
            bits |= 1u64 << value;
        }
    }

    Ok(FieldSet { bits, restricted })
}

fn parse_value(text: &str, spec: &FieldSpec) -> Result<u32, String> {
    let value = match text.parse::<u32>() {
        Ok(value) => value,
        Err(_) => {
            let (names, offset) = spec
                .names
                .ok_or_else(|| format!("{}字段的值无效: '{text}'", spec.name))?;
            let index = names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(text))
                .ok_or_else(|| format!("{}字段的值无效: '{text}'", spec.name))?;
            index as u32 + offset
        }
    };

    if value < spec.min || value > spec.max {
        return Err(format!(
            "{}字段的值 {value} 超出范围 {}-{}",
            spec.name, spec.min, spec.max
        ));
    }
    Ok(value)
}
