//! 重命名模板引擎
//!
//! 支持 `${name,param=value,...}` 与 `$YYYY` 等日期占位符。

use chrono::{DateTime, Datelike, Local, Timelike};
use rand::Rng;
use regex::{NoExpand, Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";
const DEFAULT_RANDOM_LENGTH: usize = 8;
/// 常见文件系统的文件名长度上限
const MAX_RANDOM_LENGTH: usize = 255;

/// 日期占位符，按长度降序排列
const DATE_TOKENS: [&str; 20] = [
    "YYYY", "MMMM", "DDDD", "fff", "MMM", "DDD", "YY", "MM", "DD", "hh", "mm", "ss", "ff", "Y",
    "M", "D", "h", "m", "s", "f",
];

/// 单次遍历内的序号计数器
#[derive(Debug, Default, Clone)]
pub struct RenameCounter {
    current: Option<i64>,
}

impl RenameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// 返回当前值并前进一步；重置后首次调用从 `start` 开始
    fn advance(&mut self, start: i64, step: i64) -> i64 {
        let value = self.current.unwrap_or(start);
        self.current = Some(value.saturating_add(step));
        value
    }
}

pub struct RenameTemplateEngine;

impl RenameTemplateEngine {
    /// 展开模板，返回重命名后的完整路径
    ///
    /// 文件：展开结果作为新主名，保留原扩展名与所在目录；
    /// 目录：展开结果作为同级目录下的新名称。
    pub fn expand(source: &Path, template: &str, counter: &mut RenameCounter) -> PathBuf {
        let name = Self::expand_str(source, template, counter);
        let parent = source.parent().map(Path::to_path_buf).unwrap_or_default();

        if source.is_dir() {
            return parent.join(name);
        }

        match source.extension() {
            Some(ext) => {
                let ext = ext.to_string_lossy();
                let dotted = format!(".{}", ext);
                // 模板已带相同扩展名时不再追加
                if name.to_lowercase().ends_with(&dotted.to_lowercase()) {
                    parent.join(name)
                } else {
                    parent.join(format!("{}{}", name, dotted))
                }
            }
            None => parent.join(name),
        }
    }

    /// 展开模板文本
    pub fn expand_str(source: &Path, template: &str, counter: &mut RenameCounter) -> String {
        if !template.contains('$') {
            return template.to_string();
        }

        let date = source_date(source);
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            if let Some(body) = after.strip_prefix('{') {
                if let Some(end) = body.find('}') {
                    let inner = &body[..end];
                    match expand_token(source, inner, counter) {
                        Some(value) => out.push_str(&value),
                        None => {
                            debug!("无法识别的模板参数，保留原文: ${{{}}}", inner);
                            out.push_str(&rest[pos..pos + 2 + end + 1]);
                        }
                    }
                    rest = &body[end + 1..];
                    continue;
                }
            }

            match DATE_TOKENS.iter().find(|t| after.starts_with(**t)) {
                Some(token) => {
                    out.push_str(&date_value(token, date.as_ref()));
                    rest = &after[token.len()..];
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn base_name(source: &Path) -> String {
    let name = if source.is_dir() {
        source.file_name()
    } else {
        source.file_stem()
    };
    name.map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parent_name(source: &Path) -> String {
    source
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// 展开 `${...}`，无法识别或参数非法时返回 None
fn expand_token(source: &Path, inner: &str, counter: &mut RenameCounter) -> Option<String> {
    let params: Vec<&str> = inner.split(',').map(str::trim).collect();
    let name = params.first().copied().unwrap_or_default();

    let is_counter = inner.trim().is_empty()
        || params.iter().any(|p| {
            let key = p.split('=').next().unwrap_or_default();
            matches!(key.to_lowercase().as_str(), "increment" | "start" | "padding")
        });
    if is_counter {
        return increment(&params, counter);
    }

    match name.to_lowercase().as_str() {
        "rstringalnum" => random_string(&params, &[LOWER, UPPER, DIGITS]),
        "rstringalpha" => random_string(&params, &[LOWER, UPPER]),
        "rstringdigit" => random_string(&params, &[LOWER, DIGITS]),
        "ruuidv4" => Some(uuid::Uuid::new_v4().to_string()),
        "source" => Some(base_name(source)),
        "parent" => Some(parent_name(source)),
        "regex" => {
            let pattern = params.get(1)?;
            let replacement = params.get(2).copied().unwrap_or_default();
            let re = Regex::new(pattern).ok()?;
            Some(re.replace_all(&base_name(source), replacement).into_owned())
        }
        "replace" => {
            let from = params.get(1).filter(|f| !f.is_empty())?;
            let to = params.get(2).copied().unwrap_or_default();
            let case_sensitive = params
                .get(3)
                .map(|p| p.eq_ignore_ascii_case("cs") || p.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            let re = RegexBuilder::new(&regex::escape(from))
                .case_insensitive(!case_sensitive)
                .build()
                .ok()?;
            Some(re.replace_all(&base_name(source), NoExpand(to)).into_owned())
        }
        _ => None,
    }
}

fn increment(params: &[&str], counter: &mut RenameCounter) -> Option<String> {
    let (mut start, mut step, mut padding) = (0i64, 1i64, 0usize);
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_lowercase().as_str() {
            "start" => start = value.trim().parse().ok()?,
            "increment" => step = value.trim().parse().ok()?,
            "padding" => padding = value.trim().parse().ok()?,
            _ => {}
        }
    }
    let value = counter.advance(start, step);
    Some(format!("{:0width$}", value, width = padding))
}

fn random_string(params: &[&str], sets: &[&str]) -> Option<String> {
    let mut length = DEFAULT_RANDOM_LENGTH;
    for param in params {
        if let Some((_, value)) = param.split_once('=') {
            length = value.trim().parse().ok()?;
        }
    }
    if length > MAX_RANDOM_LENGTH {
        warn!("随机字符串长度 {} 超过上限，按 {} 处理", length, MAX_RANDOM_LENGTH);
        length = MAX_RANDOM_LENGTH;
    }
    let charset: Vec<char> = sets.iter().flat_map(|s| s.chars()).collect();
    let mut rng = rand::thread_rng();
    Some(
        (0..length)
            .map(|_| charset[rng.gen_range(0..charset.len())])
            .collect(),
    )
}

/// 创建时间，取不到时退回修改时间
fn source_date(source: &Path) -> Option<DateTime<Local>> {
    let meta = std::fs::metadata(source).ok()?;
    let time = meta.created().or_else(|_| meta.modified()).ok()?;
    Some(DateTime::<Local>::from(time))
}

fn date_value(token: &str, date: Option<&DateTime<Local>>) -> String {
    let Some(dt) = date else {
        return match token {
            "MMMM" | "MMM" | "DDDD" | "DDD" => token.to_string(),
            "YYYY" => "0000".to_string(),
            "fff" => "000".to_string(),
            t if t.len() == 2 => "00".to_string(),
            _ => "0".to_string(),
        };
    };
    let millis = dt.timestamp_subsec_millis();
    match token {
        "YYYY" => format!("{:04}", dt.year()),
        "YY" => format!("{:02}", dt.year().rem_euclid(100)),
        "Y" => format!("{}", dt.year().rem_euclid(10)),
        "MMMM" => dt.format("%B").to_string(),
        "MMM" => dt.format("%b").to_string(),
        "MM" => format!("{:02}", dt.month()),
        "M" => dt.month().to_string(),
        "DDDD" => dt.format("%A").to_string(),
        "DDD" => dt.format("%a").to_string(),
        "DD" => format!("{:02}", dt.day()),
        "D" => dt.day().to_string(),
        "hh" => format!("{:02}", dt.hour()),
        "h" => dt.hour().to_string(),
        "mm" => format!("{:02}", dt.minute()),
        "m" => dt.minute().to_string(),
        "ss" => format!("{:02}", dt.second()),
        "s" => dt.second().to_string(),
        "fff" => format!("{:03}", millis),
        "ff" => format!("{:02}", millis / 10),
        _ => format!("{}", millis / 100),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(source: &Path, template: &str, counter: &mut RenameCounter) -> String {
        RenameTemplateEngine::expand_str(source, template, counter)
    }

    #[test]
    fn test_plain_template_verbatim() {
        let mut counter = RenameCounter::new();
        let s = expand(Path::new("/x/a.txt"), "new_name", &mut counter);
        assert_eq!(s, "new_name");
    }

    #[test]
    fn test_uuid_token() {
        let mut counter = RenameCounter::new();
        let s = expand(Path::new("/x/a.txt"), "${ruuidv4}", &mut counter);
        let parsed = uuid::Uuid::parse_str(&s).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn test_increment_sequence_and_reset() {
        let mut counter = RenameCounter::new();
        let source = Path::new("/x/a.txt");
        let template = "${increment,start=1,padding=3}";
        let seq: Vec<String> = (0..4).map(|_| expand(source, template, &mut counter)).collect();
        assert_eq!(seq, vec!["001", "002", "003", "004"]);

        counter.reset();
        assert_eq!(expand(source, template, &mut counter), "001");
    }

    #[test]
    fn test_increment_step_and_empty_token() {
        let mut counter = RenameCounter::new();
        let source = Path::new("/x/a.txt");
        assert_eq!(expand(source, "${start=10,increment=5}", &mut counter), "10");
        assert_eq!(expand(source, "${start=10,increment=5}", &mut counter), "15");

        let mut counter = RenameCounter::new();
        assert_eq!(expand(source, "img_${}", &mut counter), "img_0");
        assert_eq!(expand(source, "img_${}", &mut counter), "img_1");

        // 参数非法时保留原文
        assert_eq!(expand(source, "${start=x}", &mut counter), "${start=x}");
    }

    #[test]
    fn test_random_strings() {
        let mut counter = RenameCounter::new();
        let source = Path::new("/x/a.txt");

        let s = expand(source, "${rstringalpha}", &mut counter);
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_alphabetic()));

        let s = expand(source, "${rstringdigit,length=12}", &mut counter);
        assert_eq!(s.len(), 12);
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        let s = expand(source, "${rstringalnum,n=5}", &mut counter);
        assert_eq!(s.len(), 5);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));

        let s = expand(source, "${rstringalpha,length=99999999999}", &mut counter);
        assert_eq!(s.len(), MAX_RANDOM_LENGTH);
    }

    #[test]
    fn test_source_parent_regex_replace() {
        let mut counter = RenameCounter::new();
        let source = Path::new("/photos/holiday/IMG_1234.jpg");

        assert_eq!(expand(source, "${source}_bak", &mut counter), "IMG_1234_bak");
        assert_eq!(expand(source, "${parent}-${source}", &mut counter), "holiday-IMG_1234");
        assert_eq!(expand(source, r"${regex,\d+,N}", &mut counter), "IMG_N");
        assert_eq!(expand(source, "${replace,img,photo}", &mut counter), "photo_1234");
        assert_eq!(expand(source, "${replace,img,photo,cs}", &mut counter), "IMG_1234");
        assert_eq!(expand(source, "${regex,([,x}", &mut counter), "${regex,([,x}");
        assert_eq!(expand(source, "${unknown}", &mut counter), "${unknown}");
    }

    #[test]
    fn test_date_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();

        let mut counter = RenameCounter::new();
        let s = expand(&file, "$YYYY-$MM-$DD", &mut counter);
        let date = source_date(&file).unwrap();
        assert_eq!(s, date.format("%Y-%m-%d").to_string());

        let s = expand(&file, "cost$", &mut counter);
        assert_eq!(s, "cost$");

        // 路径不存在时使用占位默认值
        let s = expand(Path::new("/missing/none.txt"), "$YYYY_$MMM", &mut counter);
        assert_eq!(s, "0000_MMM");
    }

    #[test]
    fn test_expand_path_keeps_extension() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        let sub = dir.path().join("folder");
        std::fs::create_dir(&sub).unwrap();

        let mut counter = RenameCounter::new();
        assert_eq!(
            RenameTemplateEngine::expand(&file, "doc_${start=1}", &mut counter),
            dir.path().join("doc_1.txt")
        );
        assert_eq!(
            RenameTemplateEngine::expand(&file, "plain.txt", &mut counter),
            dir.path().join("plain.txt")
        );
        assert_eq!(
            RenameTemplateEngine::expand(&sub, "${source}_old", &mut counter),
            dir.path().join("folder_old")
        );
    }
}
