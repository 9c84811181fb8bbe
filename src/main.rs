use anyhow::Context;
use std::sync::Arc;
use tidyflow_lib::config::{GeneralConfig, TaskConfig};
use tidyflow_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use tidyflow_lib::{ActionExecutor, ConflictResolver, OperationDispatcher, TriggerScheduler, TriggerSpec};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

/// 初始化日志系统
fn init_logging() {
    let log_dir = get_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);

    let config = LogConfig::load(&log_dir);

    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into());
    if let Ok(directive) = "notify=warn".parse() {
        env_filter = env_filter.add_directive(directive);
    }

    match SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);

            // 在 debug 模式下也输出到控制台
            #[cfg(debug_assertions)]
            {
                let console_layer = tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false);

                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(console_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }

            // 在 release 模式下只输出到文件
            #[cfg(not(debug_assertions))]
            {
                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }
        }
        Err(_) => {
            // 文件日志创建失败，回退到控制台
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .try_init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let once = std::env::args().skip(1).any(|arg| arg == "--once");
    let config_dir = tidyflow_lib::ensure_data_dir()?;
    let general = GeneralConfig::load(&config_dir);
    let tasks = TaskConfig::load_all(&config_dir)
        .with_context(|| format!("加载任务配置失败: {}", config_dir.display()))?;
    info!("已加载 {} 个任务，配置目录: {}", tasks.len(), config_dir.display());

    let executor = ActionExecutor::new(ConflictResolver::new(general.max_unique_attempts));
    let dispatcher = OperationDispatcher::new(executor);
    let scheduler = TriggerScheduler::new(Arc::new(dispatcher));

    for task in tasks.iter().filter(|t| t.enabled) {
        let params = match task.to_parameters(&general, &task.group_siblings(&tasks)) {
            Ok(params) => params,
            Err(e) => {
                error!("任务配置无效，已跳过: {}, 错误信息: {:#}", task.name, e);
                continue;
            }
        };

        let registered = match task.trigger.as_ref() {
            Some(trigger) => trigger.to_trigger(&general),
            // 无触发器的任务只参与立即执行
            None => Ok(TriggerSpec::Manual),
        }
        .and_then(|spec| Ok(scheduler.schedule_job(&task.name, &task.group, spec, params)?));
        match registered {
            Ok(true) => {}
            Ok(false) => warn!("任务重复，已忽略: {}.{}", task.group, task.name),
            Err(e) => error!("注册任务失败: {}, 错误信息: {:#}", task.name, e),
        }
    }

    if once {
        for (key, result) in scheduler.trigger_all_once().await {
            match result {
                Ok(report) => info!(
                    "{}: 成功 {}, 跳过 {}, 失败 {}",
                    key, report.processed, report.skipped, report.failed
                ),
                Err(e) => error!("{}: {}", key, e),
            }
        }
        scheduler.shutdown().await;
        return Ok(());
    }

    info!("调度器已启动，按 Ctrl-C 退出");
    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    scheduler.shutdown().await;
    Ok(())
}
