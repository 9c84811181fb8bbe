//! 触发调度：定时、cron 与文件监控

pub mod cron;
mod watch;

pub use cron::{build_cron_expression, CronSchedule};

use crate::core::dispatcher::TaskRunner;
use crate::core::operation::{ExecutionReport, OperationParameters};
use crate::error::{Result, TidyError};
use chrono::Local;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use watch::{WatchRegistry, WatchTask};

/// 默认监控去抖延迟
pub const DEFAULT_WATCH_DELAY: Duration = Duration::from_secs(5);

/// 任务键：名称 + 分组
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// 触发方式
#[derive(Debug, Clone)]
pub enum TriggerSpec {
    /// 按固定周期触发，首次在一个周期后
    Interval(Duration),
    Cron(CronSchedule),
    /// 监控源路径的文件变化，按延迟去抖
    Watch { delay: Duration },
    /// 不自动触发，只参与立即执行
    Manual,
}

impl TriggerSpec {
    pub fn cron(expression: &str) -> Result<Self> {
        Ok(TriggerSpec::Cron(CronSchedule::parse(expression)?))
    }

    fn kind(&self) -> &'static str {
        match self {
            TriggerSpec::Interval(_) => "interval",
            TriggerSpec::Cron(_) => "cron",
            TriggerSpec::Watch { .. } => "watch",
            TriggerSpec::Manual => "manual",
        }
    }
}

struct JobEntry {
    params: OperationParameters,
    priority: i32,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    /// 监控任务的源路径
    watch_source: Option<PathBuf>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("调度状态锁已损坏，继续使用");
        poisoned.into_inner()
    })
}

/// 触发调度器
pub struct TriggerScheduler {
    runner: Arc<dyn TaskRunner>,
    jobs: Arc<Mutex<HashMap<JobKey, JobEntry>>>,
    watches: WatchRegistry,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TriggerScheduler {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        let tracker = TaskTracker::new();
        Self {
            watches: WatchRegistry::new(runner.clone(), tracker.clone()),
            runner,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            tracker,
            shutdown: CancellationToken::new(),
        }
    }

    /// 注册任务；相同名称与分组已存在时返回 false
    pub fn schedule_job(
        &self,
        name: &str,
        group: &str,
        trigger: TriggerSpec,
        task: OperationParameters,
    ) -> Result<bool> {
        let key = JobKey::new(name, group);
        let mut jobs = lock(&self.jobs);
        if jobs.contains_key(&key) {
            debug!("任务已存在，忽略注册: {}", key);
            return Ok(false);
        }

        let cancel = self.shutdown.child_token();
        let paused = Arc::new(AtomicBool::new(false));
        let mut params = task;
        params.cancel = cancel.child_token();
        let priority = params.priority;
        let mut watch_source = None;

        match &trigger {
            TriggerSpec::Interval(period) => {
                if period.is_zero() {
                    return Err(TidyError::config(format!("定时周期不能为 0: {}", key)));
                }
                self.spawn_interval(key.clone(), *period, params.clone(), paused.clone(), cancel.clone());
            }
            TriggerSpec::Cron(schedule) => {
                self.spawn_cron(key.clone(), schedule.clone(), params.clone(), paused.clone(), cancel.clone());
            }
            TriggerSpec::Watch { delay } => {
                let task = WatchTask {
                    key: key.clone(),
                    priority,
                    create_time: params.create_time,
                    params: params.clone(),
                    paused: paused.clone(),
                    cancel: cancel.clone(),
                };
                self.watches.add(&params.source_path, *delay, task)?;
                watch_source = Some(params.source_path.clone());
            }
            TriggerSpec::Manual => {}
        }

        info!("已注册任务: {} ({}, 优先级 {})", key, trigger.kind(), priority);
        jobs.insert(
            key,
            JobEntry {
                params,
                priority,
                paused,
                cancel,
                watch_source,
            },
        );
        Ok(true)
    }

    fn spawn_interval(
        &self,
        key: JobKey,
        period: Duration,
        params: OperationParameters,
        paused: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        let runner = self.runner.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if paused.load(Ordering::SeqCst) {
                            debug!("任务已暂停，跳过本次触发: {}", key);
                            continue;
                        }
                        fire(&runner, &key, params.clone()).await;
                    }
                }
            }
            debug!("定时任务已停止: {}", key);
        });
    }

    fn spawn_cron(
        &self,
        key: JobKey,
        schedule: CronSchedule,
        params: OperationParameters,
        paused: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        let runner = self.runner.clone();
        self.tracker.spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) = schedule.next_after(now) else {
                    warn!("cron 表达式没有后续触发时间: {} ({})", key, schedule);
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                debug!("下次触发: {} 于 {}", key, next.format("%Y-%m-%d %H:%M:%S"));

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        if paused.load(Ordering::SeqCst) {
                            debug!("任务已暂停，跳过本次触发: {}", key);
                            continue;
                        }
                        fire(&runner, &key, params.clone()).await;
                    }
                }
            }
            debug!("cron 任务已停止: {}", key);
        });
    }

    pub fn pause_job(&self, key: &JobKey) -> bool {
        self.set_paused(key, true)
    }

    pub fn resume_job(&self, key: &JobKey) -> bool {
        self.set_paused(key, false)
    }

    fn set_paused(&self, key: &JobKey, value: bool) -> bool {
        match lock(&self.jobs).get(key) {
            Some(entry) => {
                entry.paused.store(value, Ordering::SeqCst);
                info!("任务{}: {}", if value { "已暂停" } else { "已恢复" }, key);
                true
            }
            None => false,
        }
    }

    /// 删除任务并取消其正在执行的操作
    pub fn delete_job(&self, key: &JobKey) -> bool {
        let Some(entry) = lock(&self.jobs).remove(key) else {
            return false;
        };
        entry.cancel.cancel();
        if entry.watch_source.is_some() {
            self.watches.remove_where(|_, t| &t.key == key);
        }
        info!("已删除任务: {}", key);
        true
    }

    pub fn update_priority(&self, key: &JobKey, priority: i32) -> bool {
        let mut jobs = lock(&self.jobs);
        let Some(entry) = jobs.get_mut(key) else {
            return false;
        };
        entry.priority = priority;
        entry.params.priority = priority;
        if entry.watch_source.is_some() {
            self.watches.set_priority(key, priority);
        }
        true
    }

    /// 移除某个源到目标的监控任务，源上无任务时停止监控
    pub fn stop_watch(&self, source: &Path, target: &Path) -> bool {
        let removed_keys: Vec<JobKey> = lock(&self.jobs)
            .iter()
            .filter(|(_, e)| {
                e.watch_source.as_deref() == Some(source) && e.params.target_path == target
            })
            .map(|(k, _)| k.clone())
            .collect();
        if removed_keys.is_empty() {
            return false;
        }

        self.watches
            .remove_where(|src, t| src == source && t.params.target_path == target);
        let mut jobs = lock(&self.jobs);
        for key in &removed_keys {
            if let Some(entry) = jobs.remove(key) {
                entry.cancel.cancel();
            }
        }
        info!("已停止监控任务: {} -> {}", source.display(), target.display());
        true
    }

    /// 按优先级降序立即执行所有未暂停的任务一次
    pub async fn trigger_all_once(&self) -> Vec<(JobKey, Result<ExecutionReport>)> {
        let mut pending: Vec<(JobKey, i32, OperationParameters)> = lock(&self.jobs)
            .iter()
            .filter(|(_, e)| !e.paused.load(Ordering::SeqCst))
            .map(|(k, e)| {
                let mut params = e.params.clone();
                params.cancel = e.cancel.child_token();
                (k.clone(), e.priority, params)
            })
            .collect();
        pending.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        info!("立即执行全部任务: {} 个", pending.len());
        let runs = pending.into_iter().map(|(key, _, params)| {
            let runner = self.runner.clone();
            async move {
                let result = runner.run(params).await;
                if let Err(e) = &result {
                    error!("任务执行失败: {}, 错误信息: {}", key, e);
                }
                (key, result)
            }
        });
        futures::future::join_all(runs).await
    }

    pub fn job_keys(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = lock(&self.jobs).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_paused(&self, key: &JobKey) -> Option<bool> {
        lock(&self.jobs)
            .get(key)
            .map(|e| e.paused.load(Ordering::SeqCst))
    }

    pub fn watched_sources(&self) -> Vec<PathBuf> {
        self.watches.watched_sources()
    }

    /// 停止所有任务并等待正在执行的操作结束
    pub async fn shutdown(&self) {
        info!("正在停止调度器");
        self.shutdown.cancel();
        self.watches.stop_all();
        lock(&self.jobs).clear();
        self.tracker.close();
        self.tracker.wait().await;
        info!("调度器已停止");
    }
}

async fn fire(runner: &Arc<dyn TaskRunner>, key: &JobKey, params: OperationParameters) {
    info!("触发任务: {}", key);
    match runner.run(params).await {
        Ok(report) => info!(
            "任务完成: {} 成功 {}, 跳过 {}, 失败 {}",
            key, report.processed, report.skipped, report.failed
        ),
        Err(e) => error!("任务执行失败: {}, 错误信息: {}", key, e),
    }
}
