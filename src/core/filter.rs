//! 属性过滤器与跳过判定

use crate::core::rule::{FilterItem, PathPredicate};
use crate::error::{Result, TidyError};
use chrono::{DateTime, Duration as ChronoDuration, Local, Months};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparison {
    GreaterThan,
    Equal,
    LessThan,
    Between,
    NotBetween,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparison::GreaterThan => write!(f, "greaterThan"),
            Comparison::Equal => write!(f, "equal"),
            Comparison::LessThan => write!(f, "lessThan"),
            Comparison::Between => write!(f, "between"),
            Comparison::NotBetween => write!(f, "notBetween"),
        }
    }
}

impl Comparison {
    fn is_range(&self) -> bool {
        matches!(self, Comparison::Between | Comparison::NotBetween)
    }
}

/// 大小单位（1024 进制）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SizeUnit {
    #[default]
    Byte,
    Kilobyte,
    Megabyte,
    Gigabyte,
}

impl SizeUnit {
    pub fn bytes(&self) -> u64 {
        match self {
            SizeUnit::Byte => 1,
            SizeUnit::Kilobyte => 1024,
            SizeUnit::Megabyte => 1024 * 1024,
            SizeUnit::Gigabyte => 1024 * 1024 * 1024,
        }
    }
}

/// 相对日期单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DateUnit {
    Second,
    Minute,
    Hour,
    #[default]
    Day,
    Month,
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum YesOrNo {
    Yes,
    No,
}

/// 内容匹配方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentOperator {
    AtLeastOneWord,
    AllWordsInAnyOrder,
    RegularExpression,
    String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeFilter {
    pub operator: Comparison,
    pub value: u64,
    /// Between / NotBetween 的上限
    #[serde(default)]
    pub upper: Option<u64>,
    #[serde(default)]
    pub unit: SizeUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateFilter {
    pub operator: Comparison,
    pub value: i64,
    #[serde(default)]
    pub upper: Option<i64>,
    #[serde(default)]
    pub unit: DateUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentFilter {
    pub operator: ContentOperator,
    pub text: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// 属性过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterSpec {
    pub size: Option<SizeFilter>,
    pub create_date: Option<DateFilter>,
    pub modify_date: Option<DateFilter>,
    pub visit_date: Option<DateFilter>,
    pub archive: Option<YesOrNo>,
    pub hidden: Option<YesOrNo>,
    pub read_only: Option<YesOrNo>,
    pub system: Option<YesOrNo>,
    pub temporary: Option<YesOrNo>,
    /// 逗号分隔的文件名列表
    pub include_names: Option<String>,
    pub content: Option<ContentFilter>,
}

impl FilterSpec {
    pub fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.create_date.is_none()
            && self.modify_date.is_none()
            && self.visit_date.is_none()
            && self.archive.is_none()
            && self.hidden.is_none()
            && self.read_only.is_none()
            && self.system.is_none()
            && self.temporary.is_none()
            && self.include_names.as_deref().map_or(true, |s| s.trim().is_empty())
            && self.content.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
enum DateStamp {
    Created,
    Modified,
    Accessed,
}

#[derive(Debug, Clone, Copy)]
enum Attribute {
    Archive,
    Hidden,
    ReadOnly,
    System,
    Temporary,
}

/// 属性过滤器工厂
pub struct AttributeFilterFactory;

impl AttributeFilterFactory {
    /// 编译过滤条件，每个启用的维度生成一个谓词
    pub fn build(spec: &FilterSpec) -> Result<Vec<PathPredicate>> {
        let mut predicates = Vec::new();

        if let Some(size) = &spec.size {
            predicates.push(Self::size_predicate(size)?);
        }

        let dates = [
            (DateStamp::Created, &spec.create_date),
            (DateStamp::Modified, &spec.modify_date),
            (DateStamp::Accessed, &spec.visit_date),
        ];
        for (stamp, filter) in dates {
            if let Some(filter) = filter {
                predicates.push(Self::date_predicate(stamp, filter)?);
            }
        }

        let attributes = [
            (Attribute::Archive, spec.archive),
            (Attribute::Hidden, spec.hidden),
            (Attribute::ReadOnly, spec.read_only),
            (Attribute::System, spec.system),
            (Attribute::Temporary, spec.temporary),
        ];
        for (attribute, expected) in attributes {
            if let Some(expected) = expected {
                let want = expected == YesOrNo::Yes;
                predicates.push(Arc::new(move |path: &Path| {
                    has_attribute(path, attribute) == want
                }));
            }
        }

        if let Some(names) = spec.include_names.as_deref().filter(|s| !s.trim().is_empty()) {
            predicates.push(Self::include_predicate(names));
        }

        if let Some(content) = &spec.content {
            predicates.push(Self::content_predicate(content)?);
        }

        debug!("属性过滤器编译完成: {} 个条件", predicates.len());
        Ok(predicates)
    }

    /// 编译并组合为单个谓词（全部满足）；无条件时返回 None
    pub fn build_composite(spec: &FilterSpec) -> Result<Option<PathPredicate>> {
        let predicates = Self::build(spec)?;
        Ok(compose(predicates))
    }

    fn size_predicate(filter: &SizeFilter) -> Result<PathPredicate> {
        let unit = filter.unit.bytes();
        let lower = size_to_bytes(filter.value, filter.unit)?;
        let upper = range_upper(filter.operator, filter.upper)?
            .map(|u| u.checked_mul(unit).ok_or_else(|| overflow(u)))
            .transpose()?;
        let op = filter.operator;

        Ok(Arc::new(move |path: &Path| match entry_size(path) {
            Some(size) => compare_size(size, lower, upper, op),
            None => false,
        }))
    }

    fn date_predicate(stamp: DateStamp, filter: &DateFilter) -> Result<PathPredicate> {
        let op = filter.operator;
        let unit = filter.unit;
        let value = filter.value;
        let upper = range_upper(op, filter.upper)?;
        // 校验参数，匹配时再以当前时间计算参考点
        relative_date(Local::now(), value, unit)?;
        if let Some(u) = upper {
            relative_date(Local::now(), u, unit)?;
        }

        Ok(Arc::new(move |path: &Path| {
            let Some(file_date) = entry_date(path, stamp) else {
                return false;
            };
            let now = Local::now();
            let Ok(first) = relative_date(now, value, unit) else {
                return false;
            };
            let second = match upper {
                Some(u) => match relative_date(now, u, unit) {
                    Ok(d) => Some(d),
                    Err(_) => return false,
                },
                None => None,
            };
            compare_dates(file_date, first, second, op)
        }))
    }

    fn include_predicate(names: &str) -> PathPredicate {
        let set: HashSet<String> = names
            .split(',')
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        Arc::new(move |path: &Path| {
            path.file_name()
                .map(|n| set.contains(&n.to_string_lossy().to_lowercase()))
                .unwrap_or(false)
        })
    }

    fn content_predicate(filter: &ContentFilter) -> Result<PathPredicate> {
        let matcher = ContentMatcher::new(filter)?;
        Ok(Arc::new(move |path: &Path| {
            if !path.is_file() {
                return false;
            }
            match std::fs::read(path) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => matcher.is_match(&text),
                    Err(_) => {
                        debug!("非文本文件，跳过内容匹配: {}", path.display());
                        false
                    }
                },
                Err(e) => {
                    warn!("无法读取文件内容: {}, 错误信息: {}", path.display(), e);
                    false
                }
            }
        }))
    }
}

enum ContentMatcher {
    AnyWord { words: Vec<String>, case_sensitive: bool },
    AllWords { words: Vec<String>, case_sensitive: bool },
    Regex(Regex),
    Substring { text: String, case_sensitive: bool },
}

impl ContentMatcher {
    fn new(filter: &ContentFilter) -> Result<Self> {
        let cs = filter.case_sensitive;
        let norm = |s: &str| if cs { s.to_string() } else { s.to_lowercase() };
        let words = || -> Vec<String> { filter.text.split_whitespace().map(norm).collect() };

        Ok(match filter.operator {
            ContentOperator::AtLeastOneWord => ContentMatcher::AnyWord {
                words: words(),
                case_sensitive: cs,
            },
            ContentOperator::AllWordsInAnyOrder => ContentMatcher::AllWords {
                words: words(),
                case_sensitive: cs,
            },
            ContentOperator::RegularExpression => ContentMatcher::Regex(
                Regex::new(&filter.text)
                    .map_err(|e| TidyError::config(format!("无效的内容正则: {}", e)))?,
            ),
            ContentOperator::String => ContentMatcher::Substring {
                text: norm(&filter.text),
                case_sensitive: cs,
            },
        })
    }

    fn is_match(&self, content: &str) -> bool {
        if content.trim().is_empty() {
            return false;
        }
        match self {
            ContentMatcher::AnyWord {
                words,
                case_sensitive,
            } => {
                let content = fold(content, *case_sensitive);
                let present: HashSet<&str> = content.split_whitespace().collect();
                words.iter().any(|w| present.contains(w.as_str()))
            }
            ContentMatcher::AllWords {
                words,
                case_sensitive,
            } => {
                let content = fold(content, *case_sensitive);
                !words.is_empty() && words.iter().all(|w| content.contains(w.as_str()))
            }
            ContentMatcher::Regex(re) => re.is_match(content),
            ContentMatcher::Substring {
                text,
                case_sensitive,
            } => fold(content, *case_sensitive).contains(text.as_str()),
        }
    }
}

fn fold(s: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        s.to_string()
    } else {
        s.to_lowercase()
    }
}

fn overflow(value: u64) -> TidyError {
    TidyError::config(format!("大小阈值溢出: {}", value))
}

fn range_upper<T: Copy>(op: Comparison, upper: Option<T>) -> Result<Option<T>> {
    match (op.is_range(), upper) {
        (true, None) => Err(TidyError::config(format!("{} 需要上限值", op))),
        (true, Some(u)) => Ok(Some(u)),
        (false, _) => Ok(None),
    }
}

/// 大小换算为字节
pub fn size_to_bytes(value: u64, unit: SizeUnit) -> Result<u64> {
    value.checked_mul(unit.bytes()).ok_or_else(|| overflow(value))
}

/// 由当前时间减去相对值得到参考时间
pub fn relative_date(now: DateTime<Local>, value: i64, unit: DateUnit) -> Result<DateTime<Local>> {
    let invalid = || TidyError::config(format!("无效的相对日期: {} {:?}", value, unit));
    let shifted = match unit {
        DateUnit::Second => ChronoDuration::try_seconds(value).and_then(|d| now.checked_sub_signed(d)),
        DateUnit::Minute => ChronoDuration::try_minutes(value).and_then(|d| now.checked_sub_signed(d)),
        DateUnit::Hour => ChronoDuration::try_hours(value).and_then(|d| now.checked_sub_signed(d)),
        DateUnit::Day => ChronoDuration::try_days(value).and_then(|d| now.checked_sub_signed(d)),
        DateUnit::Month => shift_months(now, value),
        DateUnit::Year => value.checked_mul(12).and_then(|m| shift_months(now, m)),
    };
    shifted.ok_or_else(invalid)
}

fn shift_months(now: DateTime<Local>, months: i64) -> Option<DateTime<Local>> {
    let magnitude = u32::try_from(months.unsigned_abs()).ok()?;
    if months >= 0 {
        now.checked_sub_months(Months::new(magnitude))
    } else {
        now.checked_add_months(Months::new(magnitude))
    }
}

fn compare_size(size: u64, lower: u64, upper: Option<u64>, op: Comparison) -> bool {
    let between = |hi: u64| {
        let (lo, hi) = if lower <= hi { (lower, hi) } else { (hi, lower) };
        size >= lo && size <= hi
    };
    match op {
        Comparison::GreaterThan => size > lower,
        Comparison::LessThan => size < lower,
        Comparison::Equal => size == lower,
        Comparison::Between => upper.map(between).unwrap_or(false),
        Comparison::NotBetween => upper.map(|hi| !between(hi)).unwrap_or(false),
    }
}

/// 日期比较：方向以参考时间为主语
fn compare_dates(
    file_date: DateTime<Local>,
    first: DateTime<Local>,
    second: Option<DateTime<Local>>,
    op: Comparison,
) -> bool {
    let between = |second: DateTime<Local>| first >= file_date && second <= file_date;
    match op {
        Comparison::GreaterThan => first > file_date,
        Comparison::LessThan => first < file_date,
        Comparison::Equal => first == file_date,
        Comparison::Between => second.map(between).unwrap_or(false),
        Comparison::NotBetween => second.map(|s| !between(s)).unwrap_or(false),
    }
}

/// 条目大小，目录取递归大小
pub fn entry_size(path: &Path) -> Option<u64> {
    let meta = std::fs::metadata(path).ok()?;
    if meta.is_dir() {
        Some(dir_size(path))
    } else {
        Some(meta.len())
    }
}

/// 目录递归大小
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn entry_date(path: &Path, stamp: DateStamp) -> Option<DateTime<Local>> {
    let meta = std::fs::metadata(path).ok()?;
    let time: SystemTime = match stamp {
        DateStamp::Created => meta.created().or_else(|_| meta.modified()).ok()?,
        DateStamp::Modified => meta.modified().ok()?,
        DateStamp::Accessed => meta.accessed().ok()?,
    };
    Some(DateTime::<Local>::from(time))
}

#[cfg(windows)]
fn has_attribute(path: &Path, attribute: Attribute) -> bool {
    use std::os::windows::fs::MetadataExt;

    const FILE_ATTRIBUTE_READONLY: u32 = 0x1;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;
    const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x20;
    const FILE_ATTRIBUTE_TEMPORARY: u32 = 0x100;

    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let flag = match attribute {
        Attribute::Archive => FILE_ATTRIBUTE_ARCHIVE,
        Attribute::Hidden => FILE_ATTRIBUTE_HIDDEN,
        Attribute::ReadOnly => FILE_ATTRIBUTE_READONLY,
        Attribute::System => FILE_ATTRIBUTE_SYSTEM,
        Attribute::Temporary => FILE_ATTRIBUTE_TEMPORARY,
    };
    meta.file_attributes() & flag != 0
}

/// 非 Windows 平台：隐藏 = 以 `.` 开头，只读取权限位，其余属性不存在
#[cfg(not(windows))]
fn has_attribute(path: &Path, attribute: Attribute) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    match attribute {
        Attribute::Hidden => path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false),
        Attribute::ReadOnly => meta.permissions().readonly(),
        Attribute::Archive | Attribute::System | Attribute::Temporary => false,
    }
}

/// 组合多个谓词为“全部满足”
pub fn compose(predicates: Vec<PathPredicate>) -> Option<PathPredicate> {
    if predicates.is_empty() {
        return None;
    }
    Some(Arc::new(move |path: &Path| predicates.iter().all(|p| p(path))))
}

/// 规则极性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Include,
    Exclude,
}

/// 检查过滤项极性是否一致
pub fn polarity(items: &[FilterItem]) -> Result<Polarity> {
    let first = items
        .first()
        .ok_or_else(|| TidyError::config("过滤项为空"))?
        .is_exclude;
    if items.iter().any(|i| i.is_exclude != first) {
        return Err(TidyError::config("同一规则中混合了包含与排除条件"));
    }
    Ok(if first {
        Polarity::Exclude
    } else {
        Polarity::Include
    })
}

fn is_shortcut(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("lnk"))
        .unwrap_or(false)
}

/// 判断是否跳过该路径
pub fn should_skip(
    items: &[FilterItem],
    path: &Path,
    attribute_predicate: Option<&PathPredicate>,
) -> bool {
    if is_shortcut(path) {
        return true;
    }

    let polarity = match polarity(items) {
        Ok(p) => p,
        Err(TidyError::Configuration(msg)) if !items.is_empty() => {
            error!("配置错误: {}，跳过 {}", msg, path.display());
            return true;
        }
        Err(_) => return true,
    };

    let accepted_by_attributes = || attribute_predicate.map_or(true, |p| p(path));

    match polarity {
        Polarity::Exclude => {
            if items.iter().any(|i| i.matches(path)) {
                return true;
            }
            !accepted_by_attributes()
        }
        Polarity::Include => {
            let matched = items.iter().any(|i| i.matches(path));
            !(matched && accepted_by_attributes())
        }
    }
}

/// 该路径是否被排除类过滤项显式命中
pub fn is_excluded(items: &[FilterItem], path: &Path) -> bool {
    matches!(polarity(items), Ok(Polarity::Exclude)) && items.iter().any(|i| i.matches(path))
}
