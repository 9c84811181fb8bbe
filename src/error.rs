//! 错误类型

use std::path::PathBuf;
use thiserror::Error;

/// 整理引擎错误
#[derive(Debug, Error)]
pub enum TidyError {
    /// 规则、过滤条件、cron 表达式等配置错误
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("路径不存在: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("IO 错误 ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("操作已取消")]
    Cancelled,

    /// 唯一路径探测次数耗尽
    #[error("无法为 {} 生成唯一路径 (已尝试 {attempts} 次)", path.display())]
    UniquePathExhausted { path: PathBuf, attempts: u32 },
}

impl TidyError {
    pub fn config(msg: impl Into<String>) -> Self {
        TidyError::Configuration(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TidyError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = TidyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TidyError::config("混合了包含与排除规则");
        assert!(err.to_string().contains("混合了包含与排除规则"));

        let err = TidyError::PathNotFound(PathBuf::from("/missing"));
        assert!(err.to_string().contains("/missing"));
    }
}
