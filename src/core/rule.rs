//! 规则编译器
//!
//! 将文件规则、文件夹规则、自定义规则和正则规则编译为 `FilterItem` 列表

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

/// 路径谓词
pub type PathPredicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// 规则类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleKind {
    #[default]
    FileRule,
    FolderRule,
    CustomRule,
    ExpressionRule,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::FileRule => write!(f, "fileRule"),
            RuleKind::FolderRule => write!(f, "folderRule"),
            RuleKind::CustomRule => write!(f, "customRule"),
            RuleKind::ExpressionRule => write!(f, "expressionRule"),
        }
    }
}

impl From<&str> for RuleKind {
    fn from(s: &str) -> Self {
        match s {
            "folderRule" | "folder" => RuleKind::FolderRule,
            "customRule" | "custom" => RuleKind::CustomRule,
            "expressionRule" | "expression" | "regex" => RuleKind::ExpressionRule,
            _ => RuleKind::FileRule,
        }
    }
}

/// 规则：模式字符串 + 规则类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub pattern: String,
    #[serde(default)]
    pub kind: RuleKind,
}

impl Rule {
    pub fn new(pattern: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
        }
    }

    pub fn file(pattern: impl Into<String>) -> Self {
        Self::new(pattern, RuleKind::FileRule)
    }

    pub fn folder(pattern: impl Into<String>) -> Self {
        Self::new(pattern, RuleKind::FolderRule)
    }

    /// 规则是否作用于整个文件夹
    pub fn targets_folders(&self) -> bool {
        match self.kind {
            RuleKind::FolderRule => true,
            RuleKind::FileRule | RuleKind::ExpressionRule => false,
            RuleKind::CustomRule => is_folder_clause(&self.pattern),
        }
    }
}

/// 编译后的过滤项
#[derive(Clone)]
pub struct FilterItem {
    pub predicate: PathPredicate,
    /// 为 true 时表示命中即排除
    pub is_exclude: bool,
}

impl FilterItem {
    pub fn include(predicate: PathPredicate) -> Self {
        Self {
            predicate,
            is_exclude: false,
        }
    }

    pub fn exclude(predicate: PathPredicate) -> Self {
        Self {
            predicate,
            is_exclude: true,
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        (self.predicate)(path)
    }
}

impl fmt::Debug for FilterItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterItem")
            .field("is_exclude", &self.is_exclude)
            .finish_non_exhaustive()
    }
}

/// 文件规则子句
#[derive(Debug, Clone)]
enum FileClause {
    AnyFile,
    IncludeExclude { include: Regex, exclude: Regex },
    Contains(String),
    PrefixSuffix { prefix: String, suffix: String },
    Prefix(String),
    Extension(String),
}

impl FileClause {
    /// 解析单个子句（已小写、去空白）
    fn parse(clause: &str) -> Option<Self> {
        if clause == "*" {
            return Some(FileClause::AnyFile);
        }
        if clause.contains('/') {
            let parts: Vec<&str> = clause.split('/').collect();
            if parts.len() != 2 {
                return None;
            }
            let include = wildcard_regex(parts[0].trim())?;
            let exclude = wildcard_regex(parts[1].trim())?;
            return Some(FileClause::IncludeExclude { include, exclude });
        }
        if clause.len() > 1 && clause.starts_with('*') && clause.ends_with('*') {
            return Some(FileClause::Contains(clause.trim_matches('*').to_string()));
        }
        if clause.contains('*') && clause.contains('.') {
            let prefix = clause.split('*').next().unwrap_or_default().to_string();
            let suffix = clause.rsplit('*').next().unwrap_or_default().to_string();
            return Some(FileClause::PrefixSuffix { prefix, suffix });
        }
        if clause.ends_with('*') {
            return Some(FileClause::Prefix(clause.trim_end_matches('*').to_string()));
        }
        if clause.starts_with('*') {
            return Some(FileClause::Extension(clause.trim_start_matches('*').to_string()));
        }
        None
    }

    fn into_predicate(self) -> PathPredicate {
        match self {
            FileClause::AnyFile => Arc::new(|path: &Path| path.is_file()),
            FileClause::IncludeExclude { include, exclude } => Arc::new(move |path: &Path| {
                let name = lower_file_name(path);
                include.is_match(&name) && !exclude.is_match(&name)
            }),
            FileClause::Contains(keyword) => {
                Arc::new(move |path: &Path| lower_file_name(path).contains(&keyword))
            }
            FileClause::PrefixSuffix { prefix, suffix } => Arc::new(move |path: &Path| {
                let name = lower_file_name(path);
                name.len() >= prefix.len() + suffix.len()
                    && name.starts_with(&prefix)
                    && name.ends_with(&suffix)
            }),
            FileClause::Prefix(prefix) => {
                Arc::new(move |path: &Path| lower_file_name(path).trim().starts_with(&prefix))
            }
            FileClause::Extension(ext) => Arc::new(move |path: &Path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| format!(".{}", e.to_lowercase()) == ext)
                    .unwrap_or(false)
            }),
        }
    }
}

/// 文件夹规则子句（大小写敏感）
#[derive(Debug, Clone)]
enum FolderClause {
    AnyDir,
    StartsWith(String),
    Contains(String),
    Exact(String),
}

impl FolderClause {
    fn parse(clause: &str) -> Self {
        if clause == "**" || clause == "##" {
            FolderClause::AnyDir
        } else if let Some(rest) = clause.strip_prefix("**/") {
            FolderClause::StartsWith(rest.trim_end_matches('*').to_string())
        } else if let Some(rest) = clause.strip_prefix("**") {
            FolderClause::Contains(rest.to_string())
        } else if let Some(rest) = clause.strip_suffix("**") {
            FolderClause::StartsWith(rest.to_string())
        } else {
            FolderClause::Exact(clause.to_string())
        }
    }

    fn into_predicate(self) -> PathPredicate {
        match self {
            FolderClause::AnyDir => Arc::new(|path: &Path| path.is_dir()),
            FolderClause::StartsWith(prefix) => Arc::new(move |path: &Path| {
                path.is_dir() && file_name(path).starts_with(prefix.as_str())
            }),
            FolderClause::Contains(keyword) => Arc::new(move |path: &Path| {
                path.is_dir() && file_name(path).contains(keyword.as_str())
            }),
            FolderClause::Exact(name) => {
                Arc::new(move |path: &Path| path.is_dir() && file_name(path) == name)
            }
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn lower_file_name(path: &Path) -> String {
    file_name(path).to_lowercase()
}

/// `*` 通配符转为锚定正则
fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped)).ok()
}

fn split_clauses(pattern: &str) -> impl Iterator<Item = &str> {
    pattern
        .split([';', '|'])
        .map(str::trim)
        .filter(|c| !c.is_empty())
}

/// 子句是否属于文件夹语法
pub fn is_folder_clause(clause: &str) -> bool {
    clause.contains("**") || clause.contains("##")
}

fn compile_file_rule(pattern: &str) -> Vec<FilterItem> {
    let pattern = pattern.trim();
    if let Some(rest) = pattern.strip_prefix('#') {
        // 排除规则：#a&b 表示排除 a 与 b
        let mut items = Vec::new();
        for part in rest.split('&') {
            let part = part.trim().trim_start_matches('#').trim();
            items.extend(
                compile_file_clauses(part)
                    .into_iter()
                    .map(|item| FilterItem::exclude(item.predicate)),
            );
        }
        return items;
    }
    compile_file_clauses(pattern)
}

fn compile_file_clauses(pattern: &str) -> Vec<FilterItem> {
    split_clauses(pattern)
        .filter_map(|clause| {
            let clause = clause.to_lowercase();
            let parsed = FileClause::parse(&clause);
            if parsed.is_none() {
                debug!("忽略无法识别的文件规则: {}", clause);
            }
            parsed
        })
        .map(|c| FilterItem::include(c.into_predicate()))
        .collect()
}

fn compile_folder_clause(clause: &str) -> Vec<FilterItem> {
    if let Some(rest) = clause.strip_prefix("##").filter(|r| !r.is_empty()) {
        // 分组排除：##a&b 表示排除名为 a、b 的文件夹
        return rest
            .split('&')
            .map(|p| p.trim().trim_start_matches('#').trim())
            .filter(|p| !p.is_empty())
            .map(|p| FilterItem::exclude(FolderClause::parse(p).into_predicate()))
            .collect();
    }
    let predicate = FolderClause::parse(clause).into_predicate();
    if clause.starts_with("**/") {
        vec![FilterItem::exclude(predicate)]
    } else {
        vec![FilterItem::include(predicate)]
    }
}

fn compile_folder_rule(pattern: &str) -> Vec<FilterItem> {
    split_clauses(pattern)
        .flat_map(compile_folder_clause)
        .collect()
}

fn compile_custom_rule(pattern: &str) -> Vec<FilterItem> {
    split_clauses(pattern)
        .flat_map(|clause| {
            if is_folder_clause(clause) {
                compile_folder_clause(clause)
            } else {
                compile_file_rule(clause)
            }
        })
        .collect()
}

fn compile_expression_rule(pattern: &str) -> Vec<FilterItem> {
    match Regex::new(pattern) {
        Ok(re) => vec![FilterItem::include(Arc::new(move |path: &Path| {
            re.is_match(&file_name(path))
        }))],
        Err(e) => {
            error!("配置错误: 无效的正则规则 {}: {}", pattern, e);
            Vec::new()
        }
    }
}

/// 编译规则
///
/// 空规则或无法识别的规则返回空列表并记录配置错误，
/// 由 `should_skip` 按“全部跳过”处理。
pub fn compile(rule: &Rule) -> Vec<FilterItem> {
    if rule.pattern.trim().is_empty() {
        error!("配置错误: 规则为空 ({})", rule.kind);
        return Vec::new();
    }

    let items = match rule.kind {
        RuleKind::FileRule => compile_file_rule(&rule.pattern),
        RuleKind::FolderRule => compile_folder_rule(&rule.pattern),
        RuleKind::CustomRule => compile_custom_rule(&rule.pattern),
        RuleKind::ExpressionRule => compile_expression_rule(&rule.pattern),
    };

    if items.is_empty() {
        error!("配置错误: 规则未生成任何过滤项: {} ({})", rule.pattern, rule.kind);
    } else {
        debug!("规则编译完成: {} -> {} 个过滤项", rule.pattern, items.len());
    }
    items
}

/// 展开分组规则：`#` / `##` 会拼接同组其他任务的规则（以 `&` 连接）
pub fn expand_group_rule(pattern: &str, siblings: &[String]) -> String {
    let trimmed = pattern.trim();
    if trimmed != "#" && trimmed != "##" {
        return pattern.to_string();
    }
    let others: Vec<&str> = siblings
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && *s != trimmed)
        .collect();
    format!("{}{}", trimmed, others.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn any_match(items: &[FilterItem], path: &Path) -> bool {
        items.iter().any(|i| i.matches(path))
    }

    #[test]
    fn test_extension_rule() {
        let items = compile(&Rule::file("*.txt"));
        assert_eq!(items.len(), 1);
        assert!(!items[0].is_exclude);
        assert!(any_match(&items, Path::new("/tmp/a.txt")));
        assert!(any_match(&items, Path::new("/tmp/NOTES.TXT")));
        assert!(!any_match(&items, Path::new("/tmp/a.pdf")));
        assert!(!any_match(&items, Path::new("/tmp/a.txt.bak")));
        assert!(!any_match(&items, Path::new("/tmp/txt")));
    }

    #[test]
    fn test_prefix_suffix_rule() {
        let items = compile(&Rule::file("report*.pdf"));
        assert!(any_match(&items, Path::new("report_final.pdf")));
        assert!(any_match(&items, Path::new("Report-2024.PDF")));
        assert!(!any_match(&items, Path::new("final_report.pdf")));
        assert!(!any_match(&items, Path::new("report_final.doc")));
    }

    #[test]
    fn test_contains_and_prefix_rules() {
        let items = compile(&Rule::file("*invoice*"));
        assert!(any_match(&items, Path::new("2024_Invoice_march")));
        assert!(!any_match(&items, Path::new("receipt")));

        let items = compile(&Rule::file("draft*"));
        assert!(any_match(&items, Path::new("Draft v2")));
        assert!(!any_match(&items, Path::new("final draft")));
    }

    #[test]
    fn test_include_exclude_pair() {
        let items = compile(&Rule::file("*.log/debug*"));
        assert!(any_match(&items, Path::new("server.log")));
        assert!(!any_match(&items, Path::new("debug-server.log")));
        assert!(!any_match(&items, Path::new("server.txt")));

        // 多于两段视为非法
        assert!(compile(&Rule::file("a/b/c")).is_empty());
    }

    #[test]
    fn test_multiple_clauses() {
        let items = compile(&Rule::file("*.jpg; *.png|*.gif"));
        assert_eq!(items.len(), 3);
        assert!(any_match(&items, Path::new("a.png")));
        assert!(any_match(&items, Path::new("a.GIF")));
        assert!(!any_match(&items, Path::new("a.bmp")));
    }

    #[test]
    fn test_negated_file_rule() {
        let items = compile(&Rule::file("#*.tmp&*.bak"));
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.is_exclude));
        assert!(any_match(&items, Path::new("x.tmp")));
        assert!(any_match(&items, Path::new("x.bak")));
        assert!(!any_match(&items, Path::new("x.txt")));
    }

    #[test]
    fn test_wildcard_file_rule() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"x").unwrap();

        let items = compile(&Rule::file("*"));
        assert!(any_match(&items, &file));
        assert!(!any_match(&items, dir.path()));
    }

    #[test]
    fn test_folder_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mk = |name: &str| -> PathBuf {
            let p = dir.path().join(name);
            std::fs::create_dir(&p).unwrap();
            p
        };
        let archive = mk("archive_2023");
        let docs = mk("docs");
        let my_docs = mk("my_docs_old");

        let items = compile(&Rule::folder("**/archive"));
        assert_eq!(items.len(), 1);
        assert!(items[0].is_exclude);
        assert!(items[0].matches(&archive));
        assert!(!items[0].matches(&docs));

        let items = compile(&Rule::folder("doc**"));
        assert!(items[0].matches(&docs));
        assert!(!items[0].matches(&my_docs));

        let items = compile(&Rule::folder("**docs"));
        assert!(items[0].matches(&my_docs));
        assert!(items[0].matches(&docs));

        let items = compile(&Rule::folder("docs"));
        assert!(items[0].matches(&docs));
        assert!(!items[0].matches(&my_docs));

        // 文件夹规则区分大小写，且只匹配目录
        let items = compile(&Rule::folder("Docs"));
        assert!(!items[0].matches(&docs));

        let items = compile(&Rule::folder("**"));
        assert!(items[0].matches(&archive));
        assert!(!items[0].matches(&dir.path().join("missing")));
    }

    #[test]
    fn test_group_folder_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        let video = dir.path().join("video");
        std::fs::create_dir(&music).unwrap();
        std::fs::create_dir(&video).unwrap();

        let items = compile(&Rule::folder("##music&photos"));
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.is_exclude));
        assert!(any_match(&items, &music));
        assert!(!any_match(&items, &video));
    }

    #[test]
    fn test_custom_rule_mixes_grammars() {
        let rule = Rule::new("*.txt;**/archive", RuleKind::CustomRule);
        assert!(rule.targets_folders());
        let items = compile(&rule);
        assert_eq!(items.len(), 2);
        assert!(!items[0].is_exclude);
        assert!(items[1].is_exclude);

        let rule = Rule::new("*.txt;*.md", RuleKind::CustomRule);
        assert!(!rule.targets_folders());
    }

    #[test]
    fn test_expression_rule() {
        let items = compile(&Rule::new(r"^\d{4}-\d{2}\.csv$", RuleKind::ExpressionRule));
        assert!(any_match(&items, Path::new("/data/2024-05.csv")));
        assert!(!any_match(&items, Path::new("/data/report.csv")));

        assert!(compile(&Rule::new("([", RuleKind::ExpressionRule)).is_empty());
    }

    #[test]
    fn test_empty_rule() {
        assert!(compile(&Rule::file("")).is_empty());
        assert!(compile(&Rule::file("   ")).is_empty());
        assert!(compile(&Rule::file("plain")).is_empty());
    }

    #[test]
    fn test_expand_group_rule() {
        let siblings = vec!["*.txt".to_string(), "#".to_string(), "*.pdf".to_string()];
        assert_eq!(expand_group_rule("#", &siblings), "#*.txt&*.pdf");
        assert_eq!(expand_group_rule("*.doc", &siblings), "*.doc");
    }

    #[test]
    fn test_rule_kind_parse() {
        assert_eq!(RuleKind::from("folderRule"), RuleKind::FolderRule);
        assert_eq!(RuleKind::from("regex"), RuleKind::ExpressionRule);
        assert_eq!(RuleKind::from("unknown"), RuleKind::FileRule);
        assert_eq!(RuleKind::CustomRule.to_string(), "customRule");
    }
}
