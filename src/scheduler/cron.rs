//! 6 段 cron 表达式：`秒 分 时 日 月 周`
//!
//! 周字段采用 1 = SUN … 7 = SAT 编号，`?` 表示不限制该字段。

use crate::error::{Result, TidyError};
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use std::fmt;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// 查找下次触发时间时最多向后搜索的年数
const SEARCH_YEARS: i32 = 5;

/// 单个字段的取值集合
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    /// 第 n 位表示取值 n
    bits: u64,
    /// `*` 或 `?`
    unrestricted: bool,
}

impl CronField {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }

    fn parse(text: &str, min: u32, max: u32, names: &[&str], name_base: u32) -> Result<Self> {
        let text = text.trim();
        let invalid = |reason: &str| TidyError::config(format!("无效的 cron 字段 '{}': {}", text, reason));

        if text == "*" || text == "?" {
            return Ok(Self {
                bits: range_bits(min, max, 1),
                unrestricted: true,
            });
        }

        let value = |s: &str| -> Result<u32> {
            let upper = s.trim().to_uppercase();
            if let Some(idx) = names.iter().position(|n| *n == upper) {
                return Ok(idx as u32 + name_base);
            }
            let v: u32 = upper.parse().map_err(|_| invalid("无法解析的取值"))?;
            if v < min || v > max {
                return Err(invalid("取值超出范围"));
            }
            Ok(v)
        };

        let mut bits = 0u64;
        for item in text.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((r, s)) => {
                    let step: u32 = s.trim().parse().map_err(|_| invalid("步长无效"))?;
                    if step == 0 {
                        return Err(invalid("步长不能为 0"));
                    }
                    (r.trim(), step)
                }
                None => (item.trim(), 1),
            };

            let (start, end) = if range == "*" || range == "?" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (value(a)?, value(b)?)
            } else {
                let v = value(range)?;
                // `a/s` 表示从 a 开始到最大值
                if item.contains('/') {
                    (v, max)
                } else {
                    (v, v)
                }
            };
            if start > end {
                return Err(invalid("范围起点大于终点"));
            }
            bits |= range_bits(start, end, step);
        }

        Ok(Self {
            bits,
            unrestricted: false,
        })
    }
}

fn range_bits(start: u32, end: u32, step: u32) -> u64 {
    (start..=end)
        .step_by(step as usize)
        .fold(0u64, |acc, v| acc | (1u64 << v))
}

/// 已解析的 cron 表达式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: CronField,
    minutes: CronField,
    hours: CronField,
    days_of_month: CronField,
    months: CronField,
    days_of_week: CronField,
}

impl FromStr for CronSchedule {
    type Err = TidyError;

    fn from_str(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(TidyError::config(format!(
                "cron 表达式需要 6 个字段，实际 {} 个: {}",
                fields.len(),
                expression
            )));
        }

        Ok(Self {
            expression: fields.join(" "),
            seconds: CronField::parse(fields[0], 0, 59, &[], 0)?,
            minutes: CronField::parse(fields[1], 0, 59, &[], 0)?,
            hours: CronField::parse(fields[2], 0, 23, &[], 0)?,
            days_of_month: CronField::parse(fields[3], 1, 31, &[], 0)?,
            months: CronField::parse(fields[4], 1, 12, &MONTH_NAMES, 1)?,
            days_of_week: CronField::parse(fields[5], 1, 7, &DAY_NAMES, 1)?,
        })
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        expression.parse()
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().number_from_sunday());
        match (self.days_of_month.unrestricted, self.days_of_week.unrestricted) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            (false, false) => dom || dow,
        }
    }

    fn matches(&self, t: &NaiveDateTime) -> bool {
        self.months.contains(t.month())
            && self.day_matches(t.date())
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
            && self.seconds.contains(t.second())
    }

    /// `after` 之后（不含）的下一次触发时间
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let start = after.naive_local().with_nanosecond(0)? + Duration::seconds(1);
        let limit_year = start.year() + SEARCH_YEARS;
        let mut t = start;

        while t.year() <= limit_year {
            if !self.months.contains(t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }

            match Local.from_local_datetime(&t).earliest() {
                Some(local) if local > after => return Some(local),
                // 夏令时跳过的时刻
                _ => t += Duration::seconds(1),
            }
        }
        None
    }
}

fn cron_component(field: &str) -> String {
    let values: Vec<&str> = field
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        "*".to_string()
    } else {
        values.join(",")
    }
}

/// 由分、时、日、月、周组成 cron 表达式，秒固定为 0
///
/// 指定周时日字段为 `?`，否则周字段为 `?`；空字段视为 `*`。
pub fn build_cron_expression(minute: &str, hour: &str, day_of_month: &str, month: &str, day_of_week: &str) -> String {
    let dow = day_of_week.trim();
    let (dom, dow) = if dow.is_empty() || dow == "?" || dow == "*" {
        (cron_component(day_of_month), "?".to_string())
    } else {
        ("?".to_string(), cron_component(dow))
    };
    format!(
        "0 {} {} {} {} {}",
        cron_component(minute),
        cron_component(hour),
        dom,
        cron_component(month),
        dow
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_build_expression() {
        assert_eq!(build_cron_expression("30", "8", "", "", ""), "0 30 8 * * ?");
        assert_eq!(build_cron_expression("0", "9", "15", "", "MON"), "0 0 9 ? * MON");
        assert_eq!(build_cron_expression("", "", "1, 15", "JAN", ""), "0 * * 1,15 JAN ?");
        assert!(CronSchedule::parse(&build_cron_expression("*/5", "", "", "", "2-6")).is_ok());
    }

    #[test]
    fn test_parse_errors() {
        assert!(CronSchedule::parse("0 0 * * *").is_err());
        assert!(CronSchedule::parse("0 60 * * * ?").is_err());
        assert!(CronSchedule::parse("0 0 25 * * ?").is_err());
        assert!(CronSchedule::parse("0 */0 * * * ?").is_err());
        assert!(CronSchedule::parse("0 0 0 ? * FOO").is_err());
        assert!(CronSchedule::parse("0 0 10-5 * * ?").is_err());
    }

    #[test]
    fn test_next_daily() {
        let cron = CronSchedule::parse("0 30 8 * * ?").unwrap();
        let next = cron.next_after(local(2024, 3, 10, 9, 0, 0)).unwrap();
        assert_eq!(next, local(2024, 3, 11, 8, 30, 0));
        let next = cron.next_after(local(2024, 3, 10, 8, 0, 0)).unwrap();
        assert_eq!(next, local(2024, 3, 10, 8, 30, 0));
        // 恰好在触发时刻时取下一次
        let next = cron.next_after(local(2024, 3, 10, 8, 30, 0)).unwrap();
        assert_eq!(next, local(2024, 3, 11, 8, 30, 0));
    }

    #[test]
    fn test_day_of_week_quartz_numbering() {
        // 2024-06-01 是星期六
        let cron = CronSchedule::parse("0 0 12 ? * 2").unwrap();
        let next = cron.next_after(local(2024, 6, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, local(2024, 6, 3, 12, 0, 0));
        assert_eq!(next.weekday(), chrono::Weekday::Mon);

        let by_name = CronSchedule::parse("0 0 12 ? * MON").unwrap();
        assert_eq!(by_name.next_after(local(2024, 6, 1, 0, 0, 0)), Some(next));
    }

    #[test]
    fn test_steps_lists_and_months() {
        let cron = CronSchedule::parse("0 */15 9-10 * * ?").unwrap();
        let first = cron.next_after(local(2024, 1, 1, 9, 50, 0)).unwrap();
        assert_eq!(first, local(2024, 1, 1, 10, 0, 0));
        let second = cron.next_after(first).unwrap();
        assert_eq!(second, local(2024, 1, 1, 10, 15, 0));
        assert_eq!(cron.next_after(second), Some(local(2024, 1, 1, 10, 30, 0)));

        let cron = CronSchedule::parse("0 0 0 1 FEB,DEC ?").unwrap();
        let next = cron.next_after(local(2024, 3, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, local(2024, 12, 1, 0, 0, 0));

        let cron = CronSchedule::parse("10/20 0 0 * * ?").unwrap();
        assert_eq!(
            cron.next_after(local(2024, 1, 1, 0, 0, 30)),
            Some(local(2024, 1, 1, 0, 0, 50))
        );
        assert_eq!(
            cron.next_after(local(2024, 1, 1, 0, 0, 0)),
            Some(local(2024, 1, 1, 0, 0, 10))
        );
    }

    #[test]
    fn test_day_of_month_or_week() {
        // 两个字段都受限时取并集
        let cron = CronSchedule::parse("0 0 0 13 * 7").unwrap();
        // 2024-09-07 是星期六，2024-09-13 是星期五
        let next = cron.next_after(local(2024, 9, 6, 1, 0, 0)).unwrap();
        assert_eq!(next, local(2024, 9, 7, 0, 0, 0));
        let next = cron.next_after(local(2024, 9, 8, 1, 0, 0)).unwrap();
        assert_eq!(next, local(2024, 9, 13, 0, 0, 0));
    }

    #[test]
    fn test_impossible_date() {
        let cron = CronSchedule::parse("0 0 0 31 2 ?").unwrap();
        assert!(cron.next_after(local(2024, 1, 1, 0, 0, 0)).is_none());
    }
}
