//! 应用配置模块

use crate::core::filter::{AttributeFilterFactory, FilterSpec};
use crate::core::rule::{compile, expand_group_rule, Rule, RuleKind};
use crate::core::{ConflictPolicy, OperationMode, OperationParameters};
use crate::scheduler::{build_cron_expression, TriggerSpec};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

/// 读取 config.json，不存在或解析失败时返回空对象
pub(crate) fn read_config_value(config_dir: &Path) -> serde_json::Value {
    let config_file = config_dir.join(CONFIG_FILE);
    fs::read_to_string(&config_file)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .filter(|v: &serde_json::Value| v.is_object())
        .unwrap_or_else(|| serde_json::json!({}))
}

/// 更新 config.json 中的一个配置节，保留其它内容
pub(crate) fn write_config_section<T: Serialize>(
    config_dir: &Path,
    section: &str,
    value: &T,
) -> anyhow::Result<()> {
    fs::create_dir_all(config_dir)
        .with_context(|| format!("创建配置目录失败: {}", config_dir.display()))?;
    let mut config = read_config_value(config_dir);
    config[section] = serde_json::to_value(value)?;

    let config_file = config_dir.join(CONFIG_FILE);
    fs::write(&config_file, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("写入配置文件失败: {}", config_file.display()))?;
    Ok(())
}

/// 通用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralConfig {
    /// 是否处理子文件夹
    #[serde(default)]
    pub handle_subfolders: bool,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// 移动/复制时保留源目录结构
    #[serde(default)]
    pub preserve_directory_structure: bool,
    /// 文件监控去抖延迟（秒）
    #[serde(default = "default_watch_delay_secs")]
    pub watch_delay_secs: u64,
    /// 生成唯一文件名的最大尝试次数
    #[serde(default = "default_max_unique_attempts")]
    pub max_unique_attempts: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_watch_delay_secs() -> u64 {
    5
}

fn default_max_unique_attempts() -> u32 {
    crate::core::conflict::DEFAULT_MAX_UNIQUE_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            handle_subfolders: false,
            conflict_policy: ConflictPolicy::default(),
            preserve_directory_structure: false,
            watch_delay_secs: default_watch_delay_secs(),
            max_unique_attempts: default_max_unique_attempts(),
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl GeneralConfig {
    /// 从配置文件加载通用配置
    pub fn load(config_dir: &Path) -> Self {
        read_config_value(config_dir)
            .get("general")
            .and_then(|v| serde_json::from_value::<GeneralConfig>(v.clone()).ok())
            .unwrap_or_default()
    }

    /// 保存通用配置
    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        write_config_section(config_dir, "general", self)
    }

    pub fn watch_delay(&self) -> Duration {
        Duration::from_secs(self.watch_delay_secs)
    }
}

/// 触发器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TriggerConfig {
    /// 固定间隔，各字段相加
    Interval {
        #[serde(default)]
        seconds: u64,
        #[serde(default)]
        minutes: u64,
        #[serde(default)]
        hours: u64,
    },
    /// 由分、时、日、月、周组成，空字段视为 `*`
    Cron {
        #[serde(default)]
        minute: String,
        #[serde(default)]
        hour: String,
        #[serde(default)]
        day_of_month: String,
        #[serde(default)]
        month: String,
        #[serde(default)]
        day_of_week: String,
    },
    /// 完整的 6 段 cron 表达式
    Expression { expression: String },
    /// 监控源目录，未设置延迟时使用通用配置
    Watch {
        #[serde(default)]
        delay_secs: Option<u64>,
    },
}

impl TriggerConfig {
    pub fn to_trigger(&self, general: &GeneralConfig) -> anyhow::Result<TriggerSpec> {
        let trigger = match self {
            TriggerConfig::Interval {
                seconds,
                minutes,
                hours,
            } => {
                let total = seconds + minutes * 60 + hours * 3600;
                if total == 0 {
                    bail!("定时间隔必须大于 0");
                }
                TriggerSpec::Interval(Duration::from_secs(total))
            }
            TriggerConfig::Cron {
                minute,
                hour,
                day_of_month,
                month,
                day_of_week,
            } => {
                let expression = build_cron_expression(minute, hour, day_of_month, month, day_of_week);
                TriggerSpec::cron(&expression)?
            }
            TriggerConfig::Expression { expression } => TriggerSpec::cron(expression)?,
            TriggerConfig::Watch { delay_secs } => TriggerSpec::Watch {
                delay: delay_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| general.watch_delay()),
            },
        };
        Ok(trigger)
    }
}

/// 整理任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub mode: OperationMode,
    pub source: PathBuf,
    /// 删除、重命名与回收站模式可以为空
    #[serde(default)]
    pub target: PathBuf,
    pub rule: String,
    #[serde(default)]
    pub rule_kind: RuleKind,
    #[serde(default)]
    pub filter: Option<FilterSpec>,
    #[serde(default)]
    pub rename_pattern: Option<String>,
    /// 覆盖通用配置中的冲突策略
    #[serde(default)]
    pub conflict_policy: Option<ConflictPolicy>,
    #[serde(default)]
    pub handle_subfolders: Option<bool>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 未设置时只能通过立即执行触发
    #[serde(default)]
    pub trigger: Option<TriggerConfig>,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_enabled() -> bool {
    true
}

impl TaskConfig {
    /// 加载所有任务
    pub fn load_all(config_dir: &Path) -> anyhow::Result<Vec<TaskConfig>> {
        match read_config_value(config_dir).get("tasks") {
            Some(tasks) => serde_json::from_value(tasks.clone()).context("任务配置格式错误"),
            None => Ok(Vec::new()),
        }
    }

    pub fn save_all(tasks: &[TaskConfig], config_dir: &Path) -> anyhow::Result<()> {
        write_config_section(config_dir, "tasks", &tasks)
    }

    /// 同组其他任务的规则，用于展开分组规则
    pub fn group_siblings(&self, tasks: &[TaskConfig]) -> Vec<String> {
        tasks
            .iter()
            .filter(|t| t.group == self.group && t.name != self.name)
            .map(|t| t.rule.clone())
            .collect()
    }

    /// 编译为一次执行所需的操作参数
    pub fn to_parameters(
        &self,
        general: &GeneralConfig,
        siblings: &[String],
    ) -> anyhow::Result<OperationParameters> {
        if self.mode.needs_target_dir() && self.target.as_os_str().is_empty() {
            bail!("任务 {} 缺少目标路径 ({})", self.name, self.mode);
        }

        let pattern = match self.rule_kind {
            RuleKind::FileRule | RuleKind::FolderRule => expand_group_rule(&self.rule, siblings),
            _ => self.rule.clone(),
        };
        let rule = Rule {
            pattern,
            kind: self.rule_kind,
        };
        let filters = compile(&rule);

        // 删除、重命名与回收站未设置目标时作用于源路径下的匹配项
        let target = if self.target.as_os_str().is_empty() {
            &self.source
        } else {
            &self.target
        };
        let mut params = OperationParameters::new(self.mode, &self.source, target, rule, filters);
        params.conflict_policy = self.conflict_policy.unwrap_or(general.conflict_policy);
        params.handle_subfolders = self.handle_subfolders.unwrap_or(general.handle_subfolders);
        params.preserve_directory_structure = general.preserve_directory_structure;
        params.rename_pattern = self.rename_pattern.clone().filter(|p| !p.trim().is_empty());
        params.priority = self.priority;
        params.max_retries = general.max_retries;
        params.retry_delay_ms = general.retry_delay_ms;

        if let Some(spec) = self.filter.as_ref().filter(|s| !s.is_empty()) {
            params.attribute_predicate = AttributeFilterFactory::build_composite(spec)
                .with_context(|| format!("任务 {} 的属性过滤配置无效", self.name))?;
        }
        Ok(params)
    }
}
