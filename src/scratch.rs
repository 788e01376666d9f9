use std::path::{Path, PathBuf};
use tracing::warn;
use crate::error::ForgeResult;

/// 临时工作目录，离开作用域时整目录删除
///
/// 路径形如 `<temp>/animeforge/<prefix>-<uuid>`，每个实例独占一个目录。
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new(prefix: &str) -> ForgeResult<Self> {
        Self::new_in(std::env::temp_dir().join("animeforge"), prefix)
    }

    pub fn new_in(root: impl AsRef<Path>, prefix: &str) -> ForgeResult<Self> {
        let path = root
            .as_ref()
            .join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("⚠️  [临时目录] 清理失败: {} - {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_on_drop() {
        let scratch = ScratchDir::new("test").unwrap();
        let path = scratch.path().to_path_buf();
        std::fs::write(scratch.join("a.png"), b"x").unwrap();
        assert!(path.is_dir());
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn each_instance_is_exclusive() {
        let a = ScratchDir::new("same").unwrap();
        let b = ScratchDir::new("same").unwrap();
        assert_ne!(a.path(), b.path());
    }
}
