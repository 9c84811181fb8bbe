//! 动作执行器（文件模式与文件夹模式）

use crate::core::conflict::{
    copy_dir_all, copy_entry, hard_link_entry, move_entry, remove_entry, symlink_entry, ConflictOutcome,
    ConflictPolicy, ConflictResolver,
};
use crate::core::filter::{is_excluded, should_skip};
use crate::core::operation::{ExecutionReport, OperationMode, OperationParameters};
use crate::core::renamer::{RenameCounter, RenameTemplateEngine};
use crate::error::{Result, TidyError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// 单个条目的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Done,
    Skipped,
}

impl From<ConflictOutcome> for EntryOutcome {
    fn from(outcome: ConflictOutcome) -> Self {
        match outcome {
            ConflictOutcome::Applied(_) | ConflictOutcome::Renamed(_) => EntryOutcome::Done,
            ConflictOutcome::Skipped => EntryOutcome::Skipped,
        }
    }
}

/// 待处理的文件夹层级
struct FolderLevel {
    source: PathBuf,
    target: PathBuf,
}

/// 某一层中的子目录及其过滤结果
struct SubfolderEntry {
    path: PathBuf,
    skipped: bool,
    excluded: bool,
}

/// 动作执行器
#[derive(Clone)]
pub struct ActionExecutor {
    resolver: ConflictResolver,
    /// 全局变更锁，所有落盘操作串行执行
    lock: Arc<Mutex<()>>,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new(ConflictResolver::default())
    }
}

impl ActionExecutor {
    pub fn new(resolver: ConflictResolver) -> Self {
        Self {
            resolver,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// 文件模式
    pub async fn execute_file(&self, params: &OperationParameters) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();

        if is_shortcut(&params.source_path) || params.target_path.as_os_str().is_empty() {
            debug!("跳过快捷方式或空目标: {}", params.source_path.display());
            report.skipped += 1;
            return Ok(report);
        }

        if !params.source_path.exists() {
            error!("源路径不存在: {}", params.source_path.display());
            return Err(TidyError::PathNotFound(params.source_path.clone()));
        }

        if params.source_path.is_file() {
            let mut counter = RenameCounter::new();
            let target = params.target_path.clone();
            self.apply_file(params, &params.source_path, &target, &mut counter, &mut report)
                .await;
            return Ok(report);
        }

        if params.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        if params.mode.needs_target_dir() && !params.target_path.is_dir() {
            let target = params.target_path.clone();
            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&target).map_err(|e| TidyError::io(&target, e))
            })
            .await
            .map_err(join_error)??;
        }

        let entries = {
            let params = params.clone();
            tokio::task::spawn_blocking(move || collect_files(&params))
                .await
                .map_err(join_error)?
        };
        info!(
            "执行文件操作: {} -> {} ({}), 共 {} 个候选文件",
            params.source_path.display(),
            params.target_path.display(),
            params.mode,
            entries.len()
        );

        let mut counter = RenameCounter::new();
        for (entry, skip) in entries {
            if params.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if skip {
                debug!("不符合规则，跳过: {}", entry.display());
                report.skipped += 1;
                continue;
            }
            let target = self.entry_target(params, &entry);
            self.apply_file(params, &entry, &target, &mut counter, &mut report)
                .await;
        }
        counter.reset();
        report.cancelled |= params.is_cancelled();

        info!(
            "文件操作完成: 成功 {}, 跳过 {}, 失败 {}",
            report.processed, report.skipped, report.failed
        );
        Ok(report)
    }

    /// 文件夹模式；非文件夹规则转交文件模式
    pub async fn execute_folder(&self, params: &OperationParameters) -> Result<ExecutionReport> {
        if !params.rule.targets_folders() {
            return self.execute_file(params).await;
        }

        let mut report = ExecutionReport::default();
        if params.target_path.as_os_str().is_empty() {
            report.skipped += 1;
            return Ok(report);
        }
        if !params.source_path.is_dir() {
            error!("源文件夹不存在: {}", params.source_path.display());
            return Err(TidyError::PathNotFound(params.source_path.clone()));
        }

        info!(
            "执行文件夹操作: {} -> {} ({})",
            params.source_path.display(),
            params.target_path.display(),
            params.mode
        );

        let mut counter = RenameCounter::new();
        let mut pending = vec![FolderLevel {
            source: params.source_path.clone(),
            target: params.target_path.clone(),
        }];

        while let Some(level) = pending.pop() {
            if params.is_cancelled() {
                report.cancelled = true;
                break;
            }

            if params.mode.needs_target_dir() && !level.target.exists() {
                let target = level.target.clone();
                let created = tokio::task::spawn_blocking(move || {
                    std::fs::create_dir_all(&target).map_err(|e| TidyError::io(&target, e))
                })
                .await
                .map_err(join_error)?;
                if let Err(e) = created {
                    warn!("无法创建目标文件夹: {}", e);
                    report.record_failure(e.to_string());
                    continue;
                }
            }

            let subfolders = {
                let params = params.clone();
                let source = level.source.clone();
                tokio::task::spawn_blocking(move || list_subfolders(&params, &source))
                    .await
                    .map_err(join_error)?
            };

            let mut descend = Vec::new();
            for sub in subfolders {
                if params.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let Some(name) = sub.path.file_name() else {
                    continue;
                };
                let child_target = level.target.join(name);

                if sub.skipped {
                    report.skipped += 1;
                    if params.handle_subfolders && !sub.excluded {
                        descend.push(FolderLevel {
                            source: sub.path,
                            target: child_target,
                        });
                    }
                    continue;
                }

                let child = params.with_paths(&sub.path, &child_target);
                self.apply_folder(&child, &mut counter, &mut report).await;
            }

            // 逆序入栈，保证按名称顺序深度优先
            pending.extend(descend.into_iter().rev());
        }
        counter.reset();

        info!(
            "文件夹操作完成: 成功 {}, 跳过 {}, 失败 {}",
            report.processed, report.skipped, report.failed
        );
        Ok(report)
    }

    fn entry_target(&self, params: &OperationParameters, entry: &Path) -> PathBuf {
        if params.preserve_directory_structure {
            if let Ok(relative) = entry.strip_prefix(&params.source_path) {
                return params.target_path.join(relative);
            }
        }
        match entry.file_name() {
            Some(name) => params.target_path.join(name),
            None => params.target_path.clone(),
        }
    }

    async fn apply_file(
        &self,
        params: &OperationParameters,
        source: &Path,
        target: &Path,
        counter: &mut RenameCounter,
        report: &mut ExecutionReport,
    ) {
        let resolver = self.resolver.clone();
        let source_buf = source.to_path_buf();
        let target_buf = target.to_path_buf();
        let policy = params.conflict_policy;

        let result = match params.mode {
            OperationMode::Move | OperationMode::Copy => {
                let is_move = params.mode == OperationMode::Move;
                self.run_entry(params, source, move || {
                    let src = source_buf.clone();
                    resolver
                        .resolve(&source_buf, &target_buf, policy, false, false, |t| {
                            if is_move {
                                move_entry(&src, t)
                            } else {
                                copy_entry(&src, t)
                            }
                        })
                        .map(EntryOutcome::from)
                })
                .await
            }
            OperationMode::Delete => {
                self.run_entry(params, source, move || delete_if_present(&target_buf))
                    .await
            }
            OperationMode::Rename => {
                let template = rename_template(params, target);
                let renamed = RenameTemplateEngine::expand(source, &template, counter);
                self.run_entry(params, source, move || rename_to(&source_buf, &renamed))
                    .await
            }
            OperationMode::RecycleBin => {
                self.run_entry(params, source, move || recycle(&source_buf))
                    .await
            }
            OperationMode::HardLink | OperationMode::SymbolicLink => {
                let hard = params.mode == OperationMode::HardLink;
                self.run_entry(params, source, move || {
                    link_with_policy(&resolver, &source_buf, &target_buf, policy, hard)
                })
                .await
            }
        };
        tally(report, source, result);
    }

    async fn apply_folder(
        &self,
        params: &OperationParameters,
        counter: &mut RenameCounter,
        report: &mut ExecutionReport,
    ) {
        let source = params.source_path.clone();
        let target = params.target_path.clone();
        let resolver = self.resolver.clone();
        let policy = params.conflict_policy;

        info!(
            "执行文件夹操作 {} -> {}, 操作模式: {}",
            source.display(),
            target.display(),
            params.mode
        );

        let result = match params.mode {
            OperationMode::Move => {
                let src = source.clone();
                self.run_entry(params, &params.source_path, move || {
                    resolver
                        .resolve(&src, &target, policy, true, false, |t| move_entry(&src, t))
                        .map(EntryOutcome::from)
                })
                .await
            }
            OperationMode::Copy => {
                let src = source.clone();
                self.run_entry(params, &params.source_path, move || {
                    resolver
                        .resolve(&src, &target, policy, false, false, |t| copy_dir_all(&src, t))
                        .map(EntryOutcome::from)
                })
                .await
            }
            OperationMode::Delete => {
                let src = source.clone();
                self.run_entry(params, &params.source_path, move || delete_if_present(&src))
                    .await
            }
            OperationMode::Rename => {
                let template = rename_template(params, &params.target_path);
                let renamed = RenameTemplateEngine::expand(&source, &template, counter);
                let src = source.clone();
                self.run_entry(params, &params.source_path, move || rename_to(&src, &renamed))
                    .await
            }
            OperationMode::RecycleBin => {
                let src = source.clone();
                self.run_entry(params, &params.source_path, move || recycle(&src))
                    .await
            }
            OperationMode::HardLink | OperationMode::SymbolicLink => {
                let hard = params.mode == OperationMode::HardLink;
                let src = source.clone();
                self.run_entry(params, &params.source_path, move || {
                    link_with_policy(&resolver, &src, &target, policy, hard)
                })
                .await
            }
        };
        tally(report, &source, result);
    }

    /// 在全局锁内以阻塞任务执行单个条目，可按配置重试
    async fn run_entry<F>(&self, params: &OperationParameters, entry: &Path, op: F) -> Result<EntryOutcome>
    where
        F: Fn() -> Result<EntryOutcome> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut last_error = TidyError::Cancelled;

        for attempt in 0..=params.max_retries {
            if params.is_cancelled() {
                return Err(TidyError::Cancelled);
            }

            let result = {
                let _guard = self.lock.lock().await;
                let op = op.clone();
                tokio::task::spawn_blocking(move || op())
                    .await
                    .map_err(join_error)?
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    if attempt < params.max_retries {
                        let delay = params
                            .retry_delay_ms
                            .saturating_mul(1u64 << attempt.min(16));
                        warn!(
                            "操作失败，{}ms 后重试 ({}/{}): {}",
                            delay,
                            attempt + 1,
                            params.max_retries,
                            e
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    } else if params.max_retries > 0 {
                        error!(
                            "操作最终失败 (已重试{}次): {} ({})",
                            params.max_retries,
                            e,
                            entry.display()
                        );
                    }
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

fn tally(report: &mut ExecutionReport, entry: &Path, result: Result<EntryOutcome>) {
    match result {
        Ok(EntryOutcome::Done) => report.processed += 1,
        Ok(EntryOutcome::Skipped) => report.skipped += 1,
        Err(TidyError::Cancelled) => report.cancelled = true,
        Err(e) => {
            error!("处理失败: {}, 错误信息: {}", entry.display(), e);
            report.record_failure(format!("{}: {}", entry.display(), e));
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> TidyError {
    TidyError::io(PathBuf::new(), std::io::Error::other(e.to_string()))
}

fn is_shortcut(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("lnk"))
        .unwrap_or(false)
}

fn rename_template(params: &OperationParameters, target: &Path) -> String {
    params
        .rename_pattern
        .clone()
        .filter(|p| !p.trim().is_empty())
        .or_else(|| target.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

/// 枚举候选文件并计算是否跳过（深度优先，按名称排序）
fn collect_files(params: &OperationParameters) -> Vec<(PathBuf, bool)> {
    let max_depth = if params.handle_subfolders { usize::MAX } else { 1 };
    let target = params.target_path.clone();
    let filters = &params.filters;

    WalkDir::new(&params.source_path)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if !e.file_type().is_dir() {
                return true;
            }
            // 不进入目标目录和被显式排除的子目录
            e.path() != target.as_path() && !is_excluded(filters, e.path())
        })
        .filter_map(|e| match e {
            Ok(e) => Some(e),
            Err(err) => {
                warn!("遍历目录失败: {}", err);
                None
            }
        })
        .take_while(|_| !params.is_cancelled())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let path = e.into_path();
            let skip = should_skip(filters, &path, params.attribute_predicate.as_ref());
            (path, skip)
        })
        .collect()
}

/// 列出直接子目录并按名称排序
fn list_subfolders(params: &OperationParameters, source: &Path) -> Vec<SubfolderEntry> {
    let mut dirs: Vec<PathBuf> = match std::fs::read_dir(source) {
        Ok(read) => read
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| *p != params.target_path)
            .collect(),
        Err(e) => {
            warn!("无法读取文件夹: {}, 错误信息: {}", source.display(), e);
            return Vec::new();
        }
    };
    dirs.sort();

    dirs.into_iter()
        .map(|path| {
            let skipped = should_skip(&params.filters, &path, params.attribute_predicate.as_ref());
            let excluded = is_excluded(&params.filters, &path);
            SubfolderEntry {
                path,
                skipped,
                excluded,
            }
        })
        .collect()
}

fn delete_if_present(path: &Path) -> Result<EntryOutcome> {
    if std::fs::symlink_metadata(path).is_err() {
        debug!("待删除路径不存在: {}", path.display());
        return Ok(EntryOutcome::Skipped);
    }
    remove_entry(path)?;
    Ok(EntryOutcome::Done)
}

fn rename_to(source: &Path, renamed: &Path) -> Result<EntryOutcome> {
    if renamed == source {
        return Ok(EntryOutcome::Skipped);
    }
    if renamed.exists() {
        return Err(TidyError::io(
            renamed,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "目标名称已存在"),
        ));
    }
    std::fs::rename(source, renamed).map_err(|e| TidyError::io(source, e))?;
    debug!("已重命名: {} -> {}", source.display(), renamed.display());
    Ok(EntryOutcome::Done)
}

/// 创建链接；重命名类策略同样创建链接，只是落在新的唯一路径上
fn link_with_policy(
    resolver: &ConflictResolver,
    source: &Path,
    target: &Path,
    policy: ConflictPolicy,
    hard: bool,
) -> Result<EntryOutcome> {
    let link = if std::fs::symlink_metadata(target).is_err() {
        target.to_path_buf()
    } else {
        match policy {
            ConflictPolicy::RenameAppendSuffix => resolver.unique_path(target)?,
            ConflictPolicy::RenameAppendDate => resolver.unique_date_path(target)?,
            _ => target.to_path_buf(),
        }
    };
    resolver
        .resolve(source, &link, policy, false, false, |t| {
            if hard {
                hard_link_entry(source, t)
            } else {
                symlink_entry(source, t)
            }
        })
        .map(EntryOutcome::from)
}

fn recycle(path: &Path) -> Result<EntryOutcome> {
    match trash::delete(path) {
        Ok(()) => Ok(EntryOutcome::Done),
        Err(e) => {
            warn!("移入回收站失败，跳过: {}, 错误信息: {}", path.display(), e);
            Ok(EntryOutcome::Skipped)
        }
    }
}
