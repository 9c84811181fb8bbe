//! 目标冲突处理
//!
//! 目标已存在时按 [`ConflictPolicy`] 决定跳过、覆盖还是另写一个唯一路径，
//! 同时提供移动、复制、链接和删除等底层文件操作。

use crate::core::filter::dir_size;
use crate::error::{Result, TidyError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// 默认唯一路径探测上限
pub const DEFAULT_MAX_UNIQUE_ATTEMPTS: u32 = 10_000;

/// 冲突解决策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    #[default]
    Skip,
    Overwrite,
    OverwriteIfNewer,
    OverwriteIfSizeDiffers,
    RenameAppendSuffix,
    RenameAppendDate,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::Skip => write!(f, "skip"),
            ConflictPolicy::Overwrite => write!(f, "overwrite"),
            ConflictPolicy::OverwriteIfNewer => write!(f, "overwriteIfNewer"),
            ConflictPolicy::OverwriteIfSizeDiffers => write!(f, "overwriteIfSizeDiffers"),
            ConflictPolicy::RenameAppendSuffix => write!(f, "renameAppendSuffix"),
            ConflictPolicy::RenameAppendDate => write!(f, "renameAppendDate"),
        }
    }
}

impl From<&str> for ConflictPolicy {
    fn from(s: &str) -> Self {
        match s {
            "overwrite" => ConflictPolicy::Overwrite,
            "overwriteIfNewer" => ConflictPolicy::OverwriteIfNewer,
            "overwriteIfSizeDiffers" => ConflictPolicy::OverwriteIfSizeDiffers,
            "renameAppendSuffix" => ConflictPolicy::RenameAppendSuffix,
            "renameAppendDate" => ConflictPolicy::RenameAppendDate,
            _ => ConflictPolicy::Skip,
        }
    }
}

/// 冲突处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// 动作已作用于目标路径
    Applied(PathBuf),
    /// 已写入新生成的唯一路径
    Renamed(PathBuf),
    Skipped,
}

/// 冲突解决器
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    max_unique_attempts: u32,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNIQUE_ATTEMPTS)
    }
}

impl ConflictResolver {
    pub fn new(max_unique_attempts: u32) -> Self {
        Self {
            max_unique_attempts: max_unique_attempts.max(1),
        }
    }

    /// 按策略处理目标已存在的情况
    ///
    /// 目标不存在时直接执行 `action`。重命名类策略自行完成移动或复制，
    /// `is_move && !in_use` 时移动，否则复制。
    pub fn resolve<F>(
        &self,
        source: &Path,
        target: &Path,
        policy: ConflictPolicy,
        is_move: bool,
        in_use: bool,
        action: F,
    ) -> Result<ConflictOutcome>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        if !target.exists() {
            action(target)?;
            return Ok(ConflictOutcome::Applied(target.to_path_buf()));
        }

        match policy {
            ConflictPolicy::Skip => {
                debug!("目标已存在，跳过: {}", target.display());
                Ok(ConflictOutcome::Skipped)
            }
            ConflictPolicy::Overwrite => {
                action(target)?;
                Ok(ConflictOutcome::Applied(target.to_path_buf()))
            }
            ConflictPolicy::OverwriteIfNewer => {
                if modified(source)? > modified(target)? {
                    action(target)?;
                    Ok(ConflictOutcome::Applied(target.to_path_buf()))
                } else {
                    debug!("源文件不比目标新，跳过: {}", source.display());
                    Ok(ConflictOutcome::Skipped)
                }
            }
            ConflictPolicy::OverwriteIfSizeDiffers => {
                if entry_len(source)? != entry_len(target)? {
                    action(target)?;
                    Ok(ConflictOutcome::Applied(target.to_path_buf()))
                } else {
                    debug!("大小一致，跳过: {}", source.display());
                    Ok(ConflictOutcome::Skipped)
                }
            }
            ConflictPolicy::RenameAppendSuffix | ConflictPolicy::RenameAppendDate => {
                let unique = if policy == ConflictPolicy::RenameAppendSuffix {
                    self.unique_path(target)?
                } else {
                    self.unique_date_path(target)?
                };
                if is_move && !in_use {
                    move_entry(source, &unique)?;
                } else {
                    copy_entry(source, &unique)?;
                }
                info!("目标已存在，写入新路径: {}", unique.display());
                Ok(ConflictOutcome::Renamed(unique))
            }
        }
    }

    /// 生成 `{stem}_{n}{ext}` 形式的唯一路径，n 从 1 开始
    pub fn unique_path(&self, target: &Path) -> Result<PathBuf> {
        let (parent, stem, ext) = split_name(target);
        for n in 1..=self.max_unique_attempts {
            let candidate = parent.join(format!("{}_{}{}", stem, n, ext));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(TidyError::UniquePathExhausted {
            path: target.to_path_buf(),
            attempts: self.max_unique_attempts,
        })
    }

    /// 生成带时间戳的唯一路径，同一秒内冲突时追加序号
    pub fn unique_date_path(&self, target: &Path) -> Result<PathBuf> {
        let (parent, stem, ext) = split_name(target);
        let stamp = chrono::Local::now().format("%Y-%m-%d-%H%M%S");
        let candidate = parent.join(format!("{}_{}{}", stem, stamp, ext));
        if !candidate.exists() {
            return Ok(candidate);
        }
        self.unique_path(&candidate)
    }
}

/// 拆分为 (父目录, 主名, 带点扩展名)；目录不拆扩展名
fn split_name(path: &Path) -> (PathBuf, String, String) {
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    if path.is_dir() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return (parent, name, String::new());
    }
    let stem = path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (parent, stem, ext)
}

fn modified(path: &Path) -> Result<std::time::SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| TidyError::io(path, e))
}

fn entry_len(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path).map_err(|e| TidyError::io(path, e))?;
    Ok(if meta.is_dir() {
        dir_size(path)
    } else {
        meta.len()
    })
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| TidyError::io(parent, e))?;
        }
    }
    Ok(())
}

/// 已存在的目标只能被同类条目替换，且不能是源本身
fn check_replaceable(source: &Path, dest: &Path) -> Result<()> {
    let Ok(dest_meta) = fs::symlink_metadata(dest) else {
        return Ok(());
    };
    let refuse = |message: &str| {
        TidyError::io(
            dest,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, message.to_string()),
        )
    };
    if dest_meta.is_dir() != source.is_dir() {
        return Err(refuse(if dest_meta.is_dir() {
            "目标是文件夹，不能被文件覆盖"
        } else {
            "目标是文件，不能被文件夹覆盖"
        }));
    }
    if let (Ok(a), Ok(b)) = (fs::canonicalize(source), fs::canonicalize(dest)) {
        if a == b {
            return Err(refuse("源与目标是同一路径"));
        }
    }
    Ok(())
}

/// 删除文件或目录树，不存在时忽略
pub fn remove_entry(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| TidyError::io(path, e))
}

/// 复制文件或目录，覆盖已有目标并保留修改时间
pub fn copy_entry(source: &Path, dest: &Path) -> Result<()> {
    check_replaceable(source, dest)?;
    if source.is_dir() {
        return copy_dir_all(source, dest);
    }
    ensure_parent(dest)?;
    fs::copy(source, dest).map_err(|e| TidyError::io(source, e))?;
    preserve_mtime(source, dest);
    Ok(())
}

/// 移动文件或目录，跨设备时退化为复制后删除
pub fn move_entry(source: &Path, dest: &Path) -> Result<()> {
    check_replaceable(source, dest)?;
    ensure_parent(dest)?;
    if dest.exists() {
        remove_entry(dest)?;
    }
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("重命名失败，改为复制后删除: {} ({})", source.display(), e);
            copy_entry(source, dest)?;
            remove_entry(source)
        }
    }
}

/// 在 `link` 处创建指向 `source` 的硬链接，已有的同类目标会被替换
pub fn hard_link_entry(source: &Path, link: &Path) -> Result<()> {
    if source.is_dir() {
        return Err(TidyError::io(
            source,
            std::io::Error::new(std::io::ErrorKind::Unsupported, "目录不支持硬链接"),
        ));
    }
    prepare_link(source, link)?;
    fs::hard_link(source, link).map_err(|e| TidyError::io(link, e))
}

/// 在 `link` 处创建指向 `source` 绝对路径的符号链接
pub fn symlink_entry(source: &Path, link: &Path) -> Result<()> {
    prepare_link(source, link)?;
    let original = std::path::absolute(source).unwrap_or_else(|_| source.to_path_buf());

    #[cfg(unix)]
    let result = std::os::unix::fs::symlink(&original, link);
    #[cfg(windows)]
    let result = if original.is_dir() {
        std::os::windows::fs::symlink_dir(&original, link)
    } else {
        std::os::windows::fs::symlink_file(&original, link)
    };

    result.map_err(|e| TidyError::io(link, e))
}

fn prepare_link(source: &Path, link: &Path) -> Result<()> {
    check_replaceable(source, link)?;
    ensure_parent(link)?;
    remove_entry(link)
}

/// 递归复制目录
pub fn copy_dir_all(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            TidyError::io(path, std::io::Error::other(e.to_string()))
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let to = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&to).map_err(|e| TidyError::io(&to, e))?;
        } else if entry.file_type().is_file() {
            ensure_parent(&to)?;
            fs::copy(entry.path(), &to).map_err(|e| TidyError::io(entry.path(), e))?;
            preserve_mtime(entry.path(), &to);
        }
    }
    Ok(())
}

fn preserve_mtime(source: &Path, dest: &Path) {
    if let Ok(meta) = fs::metadata(source) {
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        if let Err(e) = filetime::set_file_mtime(dest, mtime) {
            debug!("无法保留修改时间: {} ({})", dest.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    fn copy_action(source: &Path) -> impl FnOnce(&Path) -> Result<()> + '_ {
        move |target: &Path| copy_entry(source, target)
    }

    #[test]
    fn test_absent_target_runs_action() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, "hello").unwrap();
        let dst = dir.path().join("out").join("a.txt");

        let outcome = ConflictResolver::default()
            .resolve(&src, &dst, ConflictPolicy::Skip, false, false, copy_action(&src))
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Applied(dst.clone()));
        assert_eq!(fs::read_to_string(&dst).unwrap(), "hello");
    }

    #[test]
    fn test_skip_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("b.txt");
        fs::write(&src, "new").unwrap();
        fs::write(&dst, "old").unwrap();

        let resolver = ConflictResolver::default();
        for _ in 0..2 {
            let outcome = resolver
                .resolve(&src, &dst, ConflictPolicy::Skip, true, false, copy_action(&src))
                .unwrap();
            assert_eq!(outcome, ConflictOutcome::Skipped);
        }
        assert_eq!(fs::read_to_string(&dst).unwrap(), "old");
        assert!(src.exists());
    }

    #[test]
    fn test_overwrite_if_newer_equal_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("b.txt");
        fs::write(&src, "new").unwrap();
        fs::write(&dst, "old").unwrap();
        let t = FileTime::from_unix_time(1_700_000_000, 0);
        filetime::set_file_mtime(&src, t).unwrap();
        filetime::set_file_mtime(&dst, t).unwrap();

        let resolver = ConflictResolver::default();
        let outcome = resolver
            .resolve(&src, &dst, ConflictPolicy::OverwriteIfNewer, false, false, copy_action(&src))
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Skipped);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "old");

        filetime::set_file_mtime(&src, FileTime::from_unix_time(1_700_000_100, 0)).unwrap();
        let outcome = resolver
            .resolve(&src, &dst, ConflictPolicy::OverwriteIfNewer, false, false, copy_action(&src))
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Applied(dst.clone()));
        assert_eq!(fs::read_to_string(&dst).unwrap(), "new");
    }

    #[test]
    fn test_overwrite_if_size_differs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("b.txt");
        fs::write(&src, "abc").unwrap();
        fs::write(&dst, "xyz").unwrap();

        let resolver = ConflictResolver::default();
        let outcome = resolver
            .resolve(&src, &dst, ConflictPolicy::OverwriteIfSizeDiffers, false, false, copy_action(&src))
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Skipped);

        fs::write(&src, "abcd").unwrap();
        let outcome = resolver
            .resolve(&src, &dst, ConflictPolicy::OverwriteIfSizeDiffers, false, false, copy_action(&src))
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Applied(dst.clone()));
        assert_eq!(fs::read_to_string(&dst).unwrap(), "abcd");
    }

    #[test]
    fn test_rename_append_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = dir.path().join("src");
        let dst_dir = dir.path().join("dst");
        fs::create_dir_all(&src_dir).unwrap();
        fs::create_dir_all(&dst_dir).unwrap();
        let src = src_dir.join("a.txt");
        fs::write(&src, "new").unwrap();
        fs::write(dst_dir.join("a.txt"), "old").unwrap();
        fs::write(dst_dir.join("a_1.txt"), "older").unwrap();

        let outcome = ConflictResolver::default()
            .resolve(
                &src,
                &dst_dir.join("a.txt"),
                ConflictPolicy::RenameAppendSuffix,
                false,
                false,
                |_| panic!("重命名策略不应调用动作"),
            )
            .unwrap();
        let expected = dst_dir.join("a_2.txt");
        assert_eq!(outcome, ConflictOutcome::Renamed(expected.clone()));
        assert_eq!(fs::read_to_string(&expected).unwrap(), "new");
        // is_move = false 时保留源文件
        assert!(src.exists());
    }

    #[test]
    fn test_rename_append_suffix_moves_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("photos");
        fs::create_dir_all(src.join("2024")).unwrap();
        fs::write(src.join("2024").join("x.jpg"), "x").unwrap();
        let dst_parent = dir.path().join("dst");
        fs::create_dir_all(dst_parent.join("photos")).unwrap();

        let outcome = ConflictResolver::default()
            .resolve(
                &src,
                &dst_parent.join("photos"),
                ConflictPolicy::RenameAppendSuffix,
                true,
                false,
                |_| Ok(()),
            )
            .unwrap();
        let expected = dst_parent.join("photos_1");
        assert_eq!(outcome, ConflictOutcome::Renamed(expected.clone()));
        assert!(expected.join("2024").join("x.jpg").exists());
        assert!(!src.exists());
    }

    #[test]
    fn test_rename_append_date() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("b.txt");
        fs::write(&src, "new").unwrap();
        fs::write(&dst, "old").unwrap();

        let outcome = ConflictResolver::default()
            .resolve(&src, &dst, ConflictPolicy::RenameAppendDate, false, false, |_| Ok(()))
            .unwrap();
        let ConflictOutcome::Renamed(path) = outcome else {
            panic!("应生成带日期的新路径");
        };
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("b_"));
        assert!(name.ends_with(".txt"));
        // b_YYYY-MM-DD-HHmmss.txt
        assert_eq!(name.len(), "b_".len() + 17 + ".txt".len());
    }

    #[test]
    fn test_unique_path_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");
        fs::write(&target, "x").unwrap();
        fs::write(dir.path().join("a_1.txt"), "x").unwrap();
        fs::write(dir.path().join("a_2.txt"), "x").unwrap();

        let err = ConflictResolver::new(2).unique_path(&target).unwrap_err();
        assert!(matches!(err, TidyError::UniquePathExhausted { attempts: 2, .. }));
    }

    #[test]
    fn test_copy_dir_preserves_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        fs::create_dir_all(src.join("nested")).unwrap();
        let file = src.join("nested").join("f.txt");
        fs::write(&file, "x").unwrap();
        let t = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&file, t).unwrap();

        let dst = dir.path().join("copy");
        copy_dir_all(&src, &dst).unwrap();
        let copied = fs::metadata(dst.join("nested").join("f.txt")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&copied), t);
    }

    #[test]
    fn test_overwrite_keeps_folder_when_source_is_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("notes.txt");
        fs::write(&src, "text").unwrap();
        let dst = dir.path().join("out").join("notes.txt");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("keep.md"), "keep").unwrap();

        let err = ConflictResolver::default()
            .resolve(&src, &dst, ConflictPolicy::Overwrite, false, false, copy_action(&src))
            .unwrap_err();
        assert!(matches!(
            err,
            TidyError::Io { ref source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists
        ));
        assert!(move_entry(&src, &dst).is_err());

        assert!(dst.join("keep.md").exists());
        assert_eq!(fs::read_to_string(&src).unwrap(), "text");
    }

    #[test]
    fn test_move_onto_itself_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, "x").unwrap();

        assert!(move_entry(&src, &src).is_err());
        assert!(copy_entry(&src, &src).is_err());
        assert_eq!(fs::read_to_string(&src).unwrap(), "x");
    }

    #[test]
    #[cfg_attr(windows, ignore)]
    fn test_links_replace_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, "shared").unwrap();
        let hard = dir.path().join("links").join("hard.txt");
        let soft = dir.path().join("links").join("soft.txt");
        fs::create_dir_all(hard.parent().unwrap()).unwrap();
        fs::write(&hard, "stale").unwrap();

        hard_link_entry(&src, &hard).unwrap();
        symlink_entry(&src, &soft).unwrap();
        assert_eq!(fs::read_to_string(&hard).unwrap(), "shared");
        assert!(fs::symlink_metadata(&soft).unwrap().file_type().is_symlink());
        assert!(fs::read_link(&soft).unwrap().is_absolute());

        let folder = dir.path().join("folder");
        fs::create_dir_all(&folder).unwrap();
        assert!(hard_link_entry(&folder, &dir.path().join("folder_link")).is_err());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(ConflictPolicy::from("overwriteIfNewer"), ConflictPolicy::OverwriteIfNewer);
        assert_eq!(ConflictPolicy::from("bogus"), ConflictPolicy::Skip);
        assert_eq!(ConflictPolicy::RenameAppendDate.to_string(), "renameAppendDate");
    }
}
