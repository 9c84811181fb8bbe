use crate::core::executor::ActionExecutor;
use crate::core::operation::{ExecutionReport, OperationMode, OperationParameters};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// 调度层调用的任务执行接口
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, params: OperationParameters) -> Result<ExecutionReport>;
}

/// 操作分发器
#[derive(Clone, Default)]
pub struct OperationDispatcher {
    executor: ActionExecutor,
    /// 正在执行的移动/回收操作
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl OperationDispatcher {
    pub fn new(executor: ActionExecutor) -> Self {
        Self {
            executor,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// 按模式执行一次任务
    pub async fn execute(
        &self,
        mode: OperationMode,
        mut params: OperationParameters,
    ) -> Result<ExecutionReport> {
        params.mode = mode;

        let dedup = matches!(mode, OperationMode::Move | OperationMode::RecycleBin);
        let key = params.dedup_key();
        if dedup && !self.try_acquire(&key) {
            debug!("相同操作正在执行，忽略: {}", key);
            return Ok(ExecutionReport {
                skipped: 1,
                ..Default::default()
            });
        }

        let in_flight = self.in_flight.clone();
        let cleanup_key = key.clone();
        scopeguard::defer! {
            if dedup {
                in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&cleanup_key);
            }
        }

        info!("分发任务: {} ({})", key, mode);
        self.executor.execute_folder(&params).await
    }

    /// 在后台任务中执行
    pub fn spawn(&self, mode: OperationMode, params: OperationParameters) -> JoinHandle<Result<ExecutionReport>> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.execute(mode, params).await })
    }

    fn try_acquire(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string())
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

#[async_trait]
impl TaskRunner for OperationDispatcher {
    async fn run(&self, params: OperationParameters) -> Result<ExecutionReport> {
        let mode = params.mode;
        self.execute(mode, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{compile, Rule};
    use std::fs;

    fn params(source: &std::path::Path, target: &std::path::Path) -> OperationParameters {
        let rule = Rule::file("*.txt");
        let filters = compile(&rule);
        OperationParameters::new(OperationMode::Copy, source, target, rule, filters)
    }

    #[tokio::test]
    async fn test_execute_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();

        let dispatcher = OperationDispatcher::default();
        let report = dispatcher
            .execute(OperationMode::Move, params(&src, &dst))
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert!(!src.join("a.txt").exists());
        assert!(dst.join("a.txt").exists());
        // 执行结束后释放去重键
        assert!(!dispatcher.is_running(&params(&src, &dst).dedup_key()));
    }

    #[tokio::test]
    async fn test_duplicate_move_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();

        let dispatcher = OperationDispatcher::default();
        let p = params(&src, &dst);
        assert!(dispatcher.try_acquire(&p.dedup_key()));

        let report = dispatcher.execute(OperationMode::Move, p.clone()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(src.join("a.txt").exists());

        // 复制不参与去重
        let report = dispatcher.execute(OperationMode::Copy, p).await.unwrap();
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn test_spawn_and_runner() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();

        let dispatcher = OperationDispatcher::default();
        let report = dispatcher
            .spawn(OperationMode::Copy, params(&src, &dst))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.processed, 1);

        let runner: Arc<dyn TaskRunner> = Arc::new(dispatcher);
        let report = runner.run(params(&src, &dst)).await.unwrap();
        // 目标已存在，默认策略跳过
        assert_eq!(report.skipped, 1);
    }
}
