use std::path::PathBuf;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod scheduler;

pub use crate::core::{
    compile_rule, should_skip, ActionExecutor, ConflictPolicy, ConflictResolver, ExecutionReport,
    OperationDispatcher, OperationMode, OperationParameters, RenameTemplateEngine, Rule, RuleKind,
};
pub use error::{Result, TidyError};
pub use scheduler::{JobKey, TriggerScheduler, TriggerSpec};

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }

    /// 默认配置目录
    pub fn default_dir() -> PathBuf {
        config_dir()
            .map(|p| p.join("tidyflow"))
            .unwrap_or_else(|| PathBuf::from(".tidyflow"))
    }

    /// 数据目录：优先使用 config.json 中的 data_path
    pub fn data_dir() -> PathBuf {
        let default_dir = default_dir();
        crate::config::read_config_value(&default_dir)
            .get("data_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .filter(|p| p.is_dir())
            .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
            .unwrap_or(default_dir)
    }
}

/// 创建并返回数据目录
pub fn ensure_data_dir() -> anyhow::Result<PathBuf> {
    let dir = dirs::data_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
