use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;
use crate::error::{ForgeError, ForgeResult};
use crate::pose::PoseSequence;

/// 内置姿态序列（编译进二进制）
const BUILTIN_POSES: &[(&str, &str)] = &[
    ("drinking", include_str!("../poses/drinking.json")),
    ("idle", include_str!("../poses/idle.json")),
    ("looking_window", include_str!("../poses/looking_window.json")),
    ("reading", include_str!("../poses/reading.json")),
    ("stretching", include_str!("../poses/stretching.json")),
    ("typing", include_str!("../poses/typing.json")),
];

/// 姿态序列库
///
/// 按名称加载并缓存，首次加载后只读。用户目录中的同名文件优先于内置序列。
pub struct PoseLibrary {
    /// 用户自定义姿态目录（可选）
    user_dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, Arc<PoseSequence>>>,
}

impl Default for PoseLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PoseLibrary {
    /// 只使用内置姿态
    pub fn builtin() -> Self {
        Self {
            user_dir: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 内置姿态 + 用户目录
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            user_dir: Some(dir.into()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 所有可用的姿态名称（已排序，不含扩展名）
    pub fn available(&self) -> Vec<String> {
        let mut names: BTreeSet<String> =
            BUILTIN_POSES.iter().map(|(name, _)| name.to_string()).collect();

        if let Some(dir) = &self.user_dir {
            if let Ok(rd) = std::fs::read_dir(dir) {
                for entry in rd.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("json") {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            names.insert(stem.to_string());
                        }
                    }
                }
            }
        }

        names.into_iter().collect()
    }

    /// 按名称加载姿态序列，支持 `"idle"` 和 `"idle.json"` 两种写法
    pub fn load(&self, name: &str) -> ForgeResult<Arc<PoseSequence>> {
        let key = name.strip_suffix(".json").unwrap_or(name).to_string();

        if let Some(seq) = self.lock_cache().get(&key) {
            return Ok(Arc::clone(seq));
        }

        let seq = Arc::new(self.load_uncached(&key)?);
        debug!("[姿态库] 已加载姿态序列 '{}' ({} 帧)", seq.name, seq.frames.len());

        // 并发加载同一个名称时保留先写入的那份
        let mut cache = self.lock_cache();
        let entry = cache.entry(key).or_insert(seq);
        Ok(Arc::clone(entry))
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<PoseSequence>>> {
        // 缓存里只有完整写入的值，锁中毒时数据依然可用
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_uncached(&self, key: &str) -> ForgeResult<PoseSequence> {
        if let Some(dir) = &self.user_dir {
            let path = dir.join(format!("{}.json", key));
            if path.exists() {
                let text = std::fs::read_to_string(&path)?;
                return parse_sequence(&text, &path.display().to_string());
            }
        }

        match BUILTIN_POSES.iter().find(|(builtin, _)| *builtin == key) {
            Some((_, text)) => parse_sequence(text, key),
            None => Err(ForgeError::PoseNotFound(self.describe_missing(key))),
        }
    }

    fn describe_missing(&self, key: &str) -> String {
        match &self.user_dir {
            Some(dir) => format!("{} (搜索目录: {})", key, dir.display()),
            None => key.to_string(),
        }
    }
}

/// 解析并校验姿态序列
fn parse_sequence(text: &str, origin: &str) -> ForgeResult<PoseSequence> {
    let seq: PoseSequence = serde_json::from_str(text)?;
    validate_sequence(&seq, origin)?;
    Ok(seq)
}

fn validate_sequence(seq: &PoseSequence, origin: &str) -> ForgeResult<()> {
    if seq.frames.is_empty() {
        return Err(ForgeError::invalid_input(format!(
            "姿态序列 '{}' 没有任何帧 ({})",
            seq.name, origin
        )));
    }
    for (idx, frame) in seq.frames.iter().enumerate() {
        if let Some(joint) = frame.keypoints.first_out_of_range() {
            return Err(ForgeError::invalid_input(format!(
                "姿态序列 '{}' 第 {} 帧的关节 {} 超出 [0, 1] 范围 ({})",
                seq.name,
                idx,
                joint.name(),
                origin
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("animeforge-tests")
            .join(format!("{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn builtin_catalog_loads() {
        let lib = PoseLibrary::builtin();
        for name in lib.available() {
            let seq = lib.load(&name).unwrap();
            assert_eq!(seq.name, name);
            assert!(!seq.frames.is_empty());
        }
    }

    #[test]
    fn idle_and_typing_have_expected_shape() {
        let lib = PoseLibrary::builtin();
        let idle = lib.load("idle").unwrap();
        assert!(idle.frames.len() >= 4);
        assert!(idle.looping);
        let typing = lib.load("typing").unwrap();
        assert!(typing.frames.len() >= 6);
    }

    #[test]
    fn json_suffix_is_accepted_and_cached() {
        let lib = PoseLibrary::builtin();
        let a = lib.load("idle").unwrap();
        let b = lib.load("idle.json").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unknown_name_is_not_found() {
        let lib = PoseLibrary::builtin();
        let err = lib.load("moonwalk").unwrap_err();
        assert!(matches!(err, ForgeError::PoseNotFound(_)));
    }

    #[test]
    fn user_dir_overrides_builtin() {
        let dir = scratch_dir("poses");
        std::fs::write(
            dir.join("idle.json"),
            r#"{"name": "idle", "frames": [{"keypoints": {}}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("wave.json"),
            r#"{"name": "wave", "loop": false, "frames": [{"keypoints": {}}, {"keypoints": {}}]}"#,
        )
        .unwrap();

        let lib = PoseLibrary::with_dir(&dir);
        assert_eq!(lib.load("idle").unwrap().frames.len(), 1);
        assert!(!lib.load("wave").unwrap().looping);
        assert!(lib.available().contains(&"wave".to_string()));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let dir = scratch_dir("poses-empty");
        std::fs::write(dir.join("empty.json"), r#"{"name": "empty", "frames": []}"#).unwrap();
        let lib = PoseLibrary::with_dir(&dir);
        let err = lib.load("empty").unwrap_err();
        assert!(matches!(err, ForgeError::InvalidInput(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
