//! 文件系统监控触发器

use super::JobKey;
use crate::core::dispatcher::TaskRunner;
use crate::core::filter::should_skip;
use crate::core::operation::{ExecutionReport, OperationParameters};
use crate::error::{Result, TidyError};
use chrono::{DateTime, Local};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebouncedEvent, Debouncer, RecommendedCache};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// 监控源上注册的单个任务
#[derive(Clone)]
pub(crate) struct WatchTask {
    pub key: JobKey,
    pub priority: i32,
    pub create_time: DateTime<Local>,
    pub params: OperationParameters,
    pub paused: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

type TaskTable = Arc<Mutex<HashMap<PathBuf, Vec<WatchTask>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("监控状态锁已损坏，继续使用");
        poisoned.into_inner()
    })
}

/// 事件回调转交到运行时执行的上下文
#[derive(Clone)]
pub(crate) struct WatchDispatch {
    source: PathBuf,
    tasks: TaskTable,
    processing: Arc<Mutex<HashSet<PathBuf>>>,
    runner: Arc<dyn TaskRunner>,
}

impl WatchDispatch {
    /// 按优先级降序、创建时间升序取出未暂停的任务
    fn ordered_tasks(&self) -> Vec<WatchTask> {
        let mut tasks: Vec<WatchTask> = lock(&self.tasks)
            .get(&self.source)
            .map(|list| {
                list.iter()
                    .filter(|t| !t.paused.load(Ordering::SeqCst) && !t.cancel.is_cancelled())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.create_time.cmp(&b.create_time))
        });
        tasks
    }

    pub(crate) async fn handle_paths(&self, paths: Vec<PathBuf>) -> ExecutionReport {
        let count = paths.len();
        let mut report = ExecutionReport::default();
        for path in paths {
            report.merge(self.handle_path(path).await);
        }
        debug!(
            "监控批次处理完成: {} 个路径, 成功 {}, 跳过 {}, 失败 {}",
            count, report.processed, report.skipped, report.failed
        );
        report
    }

    async fn handle_path(&self, path: PathBuf) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        if !lock(&self.processing).insert(path.clone()) {
            debug!("路径正在处理中，忽略: {}", path.display());
            return report;
        }
        let processing = self.processing.clone();
        let cleanup = path.clone();
        scopeguard::defer! {
            lock(&processing).remove(&cleanup);
        }

        for task in self.ordered_tasks() {
            let Some(params) = self.params_for(&task, &path) else {
                continue;
            };
            info!("文件变化触发任务: {} ({})", task.key, path.display());
            match self.runner.run(params).await {
                Ok(done) => report.merge(done),
                Err(e) => {
                    error!("监控任务执行失败: {}, 错误信息: {}", task.key, e);
                    report.record_failure(format!("{}: {}", task.key, e));
                }
            }
        }
        report
    }

    /// 计算本次事件对应的任务参数；不需要执行时返回 None
    fn params_for(&self, task: &WatchTask, path: &Path) -> Option<OperationParameters> {
        let mut params = task.params.clone();
        params.cancel = task.cancel.child_token();

        if params.rule.targets_folders() {
            return Some(params);
        }

        // 目标位于源目录内时，忽略本任务写入目标产生的事件
        if params.mode.needs_target_dir()
            && params.target_path != params.source_path
            && path.starts_with(&params.target_path)
        {
            return None;
        }
        if !path.exists() {
            info!("文件已不存在，忽略: {}", path.display());
            return None;
        }
        if path.is_dir() {
            return Some(params.with_paths(path, &params.target_path));
        }
        if should_skip(&params.filters, path, params.attribute_predicate.as_ref()) {
            debug!("不符合规则，忽略: {}", path.display());
            return None;
        }
        let target = match path.file_name() {
            Some(name) => params.target_path.join(name),
            None => params.target_path.clone(),
        };
        Some(params.with_paths(path, target))
    }
}

/// 从一批去抖事件中取出去重后的路径
fn event_paths(events: &[DebouncedEvent]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    events
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
            )
        })
        .flat_map(|e| e.paths.iter().cloned())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// 监控源及其任务表
pub(crate) struct WatchRegistry {
    tasks: TaskTable,
    debouncers: Mutex<HashMap<PathBuf, Debouncer<RecommendedWatcher, RecommendedCache>>>,
    processing: Arc<Mutex<HashSet<PathBuf>>>,
    runner: Arc<dyn TaskRunner>,
    tracker: TaskTracker,
}

impl WatchRegistry {
    pub fn new(runner: Arc<dyn TaskRunner>, tracker: TaskTracker) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            debouncers: Mutex::new(HashMap::new()),
            processing: Arc::new(Mutex::new(HashSet::new())),
            runner,
            tracker,
        }
    }

    pub(crate) fn dispatch_for(&self, source: &Path) -> WatchDispatch {
        WatchDispatch {
            source: source.to_path_buf(),
            tasks: self.tasks.clone(),
            processing: self.processing.clone(),
            runner: self.runner.clone(),
        }
    }

    /// 注册监控任务；同一源只创建一个监控器
    pub fn add(&self, source: &Path, delay: Duration, task: WatchTask) -> Result<()> {
        if !source.is_dir() {
            return Err(TidyError::PathNotFound(source.to_path_buf()));
        }

        let mut debouncers = lock(&self.debouncers);
        if !debouncers.contains_key(source) {
            let handle = Handle::try_current()
                .map_err(|_| TidyError::config("文件监控需要在 tokio 运行时中注册"))?;
            let dispatch = self.dispatch_for(source);
            let tracker = self.tracker.clone();
            let watched = source.display().to_string();

            let mut debouncer = new_debouncer(
                delay,
                None,
                move |result: std::result::Result<Vec<DebouncedEvent>, Vec<notify::Error>>| {
                    match result {
                        Ok(events) => {
                            let paths = event_paths(&events);
                            if paths.is_empty() {
                                return;
                            }
                            let dispatch = dispatch.clone();
                            tracker.spawn_on(
                                async move {
                                    dispatch.handle_paths(paths).await;
                                },
                                &handle,
                            );
                        }
                        Err(errors) => {
                            for e in errors {
                                warn!("文件监控错误 ({}): {:?}", watched, e);
                            }
                        }
                    }
                },
            )
            .map_err(|e| TidyError::io(source, std::io::Error::other(e.to_string())))?;

            let mode = if task.params.handle_subfolders {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            debouncer
                .watch(source, mode)
                .map_err(|e| TidyError::io(source, std::io::Error::other(e.to_string())))?;

            info!("开始监控: {} (延迟 {}ms)", source.display(), delay.as_millis());
            debouncers.insert(source.to_path_buf(), debouncer);
        }

        lock(&self.tasks)
            .entry(source.to_path_buf())
            .or_default()
            .push(task);
        Ok(())
    }

    /// 移除满足条件的任务，没有剩余任务的源停止监控；返回移除数量
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Path, &WatchTask) -> bool,
    {
        let mut removed = 0;
        let mut emptied = Vec::new();
        {
            let mut tasks = lock(&self.tasks);
            for (source, list) in tasks.iter_mut() {
                let before = list.len();
                list.retain(|t| {
                    let hit = predicate(source, t);
                    if hit {
                        t.cancel.cancel();
                    }
                    !hit
                });
                removed += before - list.len();
                if list.is_empty() {
                    emptied.push(source.clone());
                }
            }
            for source in &emptied {
                tasks.remove(source);
            }
        }

        let mut debouncers = lock(&self.debouncers);
        for source in emptied {
            if debouncers.remove(&source).is_some() {
                info!("停止监控: {}", source.display());
            }
        }
        removed
    }

    pub fn set_priority(&self, key: &JobKey, priority: i32) {
        for list in lock(&self.tasks).values_mut() {
            for task in list.iter_mut().filter(|t| &t.key == key) {
                task.priority = priority;
            }
        }
    }

    pub fn stop_all(&self) {
        self.remove_where(|_, _| true);
    }

    pub fn watched_sources(&self) -> Vec<PathBuf> {
        let mut sources: Vec<PathBuf> = lock(&self.debouncers).keys().cloned().collect();
        sources.sort();
        sources
    }
}
