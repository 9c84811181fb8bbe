use crate::core::conflict::ConflictPolicy;
use crate::core::rule::{FilterItem, PathPredicate, Rule};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// 操作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationMode {
    #[default]
    Move,
    Copy,
    Delete,
    Rename,
    RecycleBin,
    HardLink,
    SymbolicLink,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationMode::Move => write!(f, "move"),
            OperationMode::Copy => write!(f, "copy"),
            OperationMode::Delete => write!(f, "delete"),
            OperationMode::Rename => write!(f, "rename"),
            OperationMode::RecycleBin => write!(f, "recycleBin"),
            OperationMode::HardLink => write!(f, "hardLink"),
            OperationMode::SymbolicLink => write!(f, "symbolicLink"),
        }
    }
}

impl From<&str> for OperationMode {
    fn from(s: &str) -> Self {
        match s {
            "copy" => OperationMode::Copy,
            "delete" => OperationMode::Delete,
            "rename" => OperationMode::Rename,
            "recycleBin" | "recycle" => OperationMode::RecycleBin,
            "hardLink" => OperationMode::HardLink,
            "symbolicLink" | "softLink" | "symlink" => OperationMode::SymbolicLink,
            _ => OperationMode::Move,
        }
    }
}

impl OperationMode {
    /// 是否需要预先创建目标目录
    pub fn needs_target_dir(&self) -> bool {
        matches!(
            self,
            OperationMode::Move | OperationMode::Copy | OperationMode::HardLink | OperationMode::SymbolicLink
        )
    }
}

/// 单次任务调用的参数
#[derive(Clone)]
pub struct OperationParameters {
    pub mode: OperationMode,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub conflict_policy: ConflictPolicy,
    pub handle_subfolders: bool,
    pub preserve_directory_structure: bool,
    pub filters: Vec<FilterItem>,
    pub attribute_predicate: Option<PathPredicate>,
    pub rule: Rule,
    pub rename_pattern: Option<String>,
    pub priority: i32,
    pub create_time: DateTime<Local>,
    /// 单个条目失败后的重试次数
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub cancel: CancellationToken,
}

impl OperationParameters {
    pub fn new(
        mode: OperationMode,
        source_path: impl Into<PathBuf>,
        target_path: impl Into<PathBuf>,
        rule: Rule,
        filters: Vec<FilterItem>,
    ) -> Self {
        Self {
            mode,
            source_path: source_path.into(),
            target_path: target_path.into(),
            conflict_policy: ConflictPolicy::default(),
            handle_subfolders: false,
            preserve_directory_structure: false,
            filters,
            attribute_predicate: None,
            rule,
            rename_pattern: None,
            priority: 0,
            create_time: Local::now(),
            max_retries: 0,
            retry_delay_ms: 1000,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 复制参数并替换源与目标路径
    pub fn with_paths(&self, source_path: impl Into<PathBuf>, target_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            target_path: target_path.into(),
            ..self.clone()
        }
    }

    /// 去重键：源-目标-策略
    pub fn dedup_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.source_path.display(),
            self.target_path.display(),
            self.conflict_policy
        )
    }
}

impl fmt::Debug for OperationParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationParameters")
            .field("mode", &self.mode)
            .field("source_path", &self.source_path)
            .field("target_path", &self.target_path)
            .field("conflict_policy", &self.conflict_policy)
            .field("handle_subfolders", &self.handle_subfolders)
            .field("rule", &self.rule)
            .field("filters", &self.filters.len())
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// 执行报告
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub processed: u32,
    pub skipped: u32,
    pub failed: u32,
    pub cancelled: bool,
    pub errors: Vec<String>,
}

impl ExecutionReport {
    pub fn merge(&mut self, other: ExecutionReport) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.cancelled |= other.cancelled;
        self.errors.extend(other.errors);
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.failed += 1;
        self.errors.push(error.into());
    }
}
