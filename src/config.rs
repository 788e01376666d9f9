use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::env;
use crate::error::{ForgeError, ForgeResult};

/// 可选的生成后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    ComfyUi,
    Fal,
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ComfyUi => "comfyui",
            Self::Fal => "fal",
            Self::Mock => "mock",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "comfyui" => Ok(Self::ComfyUi),
            "fal" => Ok(Self::Fal),
            "mock" => Ok(Self::Mock),
            other => Err(ForgeError::Config(format!(
                "未知的后端: {}（可选 comfyui, fal, mock）",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 本地 ComfyUI 服务
#[derive(Debug, Clone, PartialEq)]
pub struct ComfyUiSettings {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    /// 单个任务的最长等待时间（秒）
    pub timeout_secs: u64,
    /// 轮询 /history 的间隔（毫秒）
    pub poll_interval_ms: u64,
}

impl Default for ComfyUiSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8188,
            use_ssl: false,
            timeout_secs: 600,
            poll_interval_ms: 1000,
        }
    }
}

impl ComfyUiSettings {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// fal.ai 云端队列 API
#[derive(Debug, Clone, PartialEq)]
pub struct FalSettings {
    /// 为空时回退到环境变量 FAL_KEY
    pub api_key: Option<String>,
    pub queue_url: String,
    pub storage_url: String,
    pub default_model: String,
    pub controlnet_model: String,
    pub ip_adapter_model: String,
    /// 以 base64 data URI 内联本地图片，不走存储上传
    pub inline_uploads: bool,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for FalSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            queue_url: "https://queue.fal.run".to_string(),
            storage_url: "https://rest.alpha.fal.ai".to_string(),
            default_model: "fal-ai/pony-v7".to_string(),
            controlnet_model: "fal-ai/sdxl-controlnet-union".to_string(),
            ip_adapter_model: "fal-ai/ip-adapter-face-id".to_string(),
            inline_uploads: false,
            timeout_secs: 600,
            poll_interval_ms: 1000,
        }
    }
}

/// 模型文件名
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub checkpoint: String,
    pub controlnet_openpose: String,
    pub ip_adapter: String,
    pub clip_vision: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            checkpoint: "ponyDiffusionV6XL.safetensors".to_string(),
            controlnet_openpose: "control_v11p_sd15_openpose.pth".to_string(),
            ip_adapter: "ip-adapter-plus_sd15.bin".to_string(),
            clip_vision: "CLIP-ViT-H-14-laion2B-s32B-b79K.safetensors".to_string(),
        }
    }
}

/// 默认生成参数
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    pub sampler: String,
    pub scheduler: String,
    pub batch_size: u32,
    pub seed: i64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            steps: 30,
            cfg_scale: 7.0,
            sampler: "euler_ancestral".to_string(),
            scheduler: "normal".to_string(),
            batch_size: 1,
            seed: -1,
        }
    }
}

/// 离线 Mock 后端
#[derive(Debug, Clone, PartialEq)]
pub struct MockSettings {
    /// 每个进度步之间的等待（毫秒）
    pub step_delay_ms: u64,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self { step_delay_ms: 50 }
    }
}

/// 应用配置
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub backend: BackendKind,
    pub output_dir: PathBuf,
    pub projects_dir: PathBuf,
    /// 额外的姿态 JSON 目录（可选）
    pub poses_dir: Option<PathBuf>,
    pub comfyui: ComfyUiSettings,
    pub fal: FalSettings,
    pub models: ModelSettings,
    pub generation: GenerationSettings,
    pub mock: MockSettings,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            output_dir: PathBuf::from("./output"),
            projects_dir: home_dir()
                .map(|h| h.join(".animeforge").join("projects"))
                .unwrap_or_else(|| PathBuf::from(".animeforge/projects")),
            poses_dir: None,
            comfyui: ComfyUiSettings::default(),
            fal: FalSettings::default(),
            models: ModelSettings::default(),
            generation: GenerationSettings::default(),
            mock: MockSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

/// 所有可配置项：(INI 节, 键)
const KEYS: &[(&str, &str)] = &[
    ("animeforge", "backend"),
    ("animeforge", "output_dir"),
    ("animeforge", "projects_dir"),
    ("animeforge", "poses_dir"),
    ("comfyui", "host"),
    ("comfyui", "port"),
    ("comfyui", "use_ssl"),
    ("comfyui", "timeout_secs"),
    ("comfyui", "poll_interval_ms"),
    ("fal", "api_key"),
    ("fal", "queue_url"),
    ("fal", "storage_url"),
    ("fal", "default_model"),
    ("fal", "controlnet_model"),
    ("fal", "ip_adapter_model"),
    ("fal", "inline_uploads"),
    ("fal", "timeout_secs"),
    ("fal", "poll_interval_ms"),
    ("models", "checkpoint"),
    ("models", "controlnet_openpose"),
    ("models", "ip_adapter"),
    ("models", "clip_vision"),
    ("generation", "width"),
    ("generation", "height"),
    ("generation", "steps"),
    ("generation", "cfg_scale"),
    ("generation", "sampler"),
    ("generation", "scheduler"),
    ("generation", "batch_size"),
    ("generation", "seed"),
    ("mock", "step_delay_ms"),
    ("logging", "level"),
];

fn parse<T: std::str::FromStr>(section: &str, key: &str, value: &str) -> ForgeResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ForgeError::Config(format!("[{}] {} 的值无效: {}", section, key, value)))
}

fn parse_bool(section: &str, key: &str, value: &str) -> ForgeResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ForgeError::Config(format!("[{}] {} 不是布尔值: {}", section, key, value))),
    }
}

fn non_empty(value: &str) -> Option<String> {
    let v = value.trim();
    (!v.is_empty()).then(|| v.to_string())
}

impl AppConfig {
    /// 按 (节, 键) 写入一个字符串值
    pub fn set_value(&mut self, section: &str, key: &str, value: &str) -> ForgeResult<()> {
        let s = section;
        match (section, key) {
            ("animeforge", "backend") => self.backend = value.parse()?,
            ("animeforge", "output_dir") => self.output_dir = expand_home(value.trim()),
            ("animeforge", "projects_dir") => self.projects_dir = expand_home(value.trim()),
            ("animeforge", "poses_dir") => self.poses_dir = non_empty(value).map(|v| expand_home(&v)),
            ("comfyui", "host") => self.comfyui.host = value.trim().to_string(),
            ("comfyui", "port") => self.comfyui.port = parse(s, key, value)?,
            ("comfyui", "use_ssl") => self.comfyui.use_ssl = parse_bool(s, key, value)?,
            ("comfyui", "timeout_secs") => self.comfyui.timeout_secs = parse(s, key, value)?,
            ("comfyui", "poll_interval_ms") => self.comfyui.poll_interval_ms = parse(s, key, value)?,
            ("fal", "api_key") => self.fal.api_key = non_empty(value),
            ("fal", "queue_url") => self.fal.queue_url = value.trim().trim_end_matches('/').to_string(),
            ("fal", "storage_url") => self.fal.storage_url = value.trim().trim_end_matches('/').to_string(),
            ("fal", "default_model") => self.fal.default_model = value.trim().to_string(),
            ("fal", "controlnet_model") => self.fal.controlnet_model = value.trim().to_string(),
            ("fal", "ip_adapter_model") => self.fal.ip_adapter_model = value.trim().to_string(),
            ("fal", "inline_uploads") => self.fal.inline_uploads = parse_bool(s, key, value)?,
            ("fal", "timeout_secs") => self.fal.timeout_secs = parse(s, key, value)?,
            ("fal", "poll_interval_ms") => self.fal.poll_interval_ms = parse(s, key, value)?,
            ("models", "checkpoint") => self.models.checkpoint = value.trim().to_string(),
            ("models", "controlnet_openpose") => self.models.controlnet_openpose = value.trim().to_string(),
            ("models", "ip_adapter") => self.models.ip_adapter = value.trim().to_string(),
            ("models", "clip_vision") => self.models.clip_vision = value.trim().to_string(),
            ("generation", "width") => self.generation.width = parse(s, key, value)?,
            ("generation", "height") => self.generation.height = parse(s, key, value)?,
            ("generation", "steps") => self.generation.steps = parse(s, key, value)?,
            ("generation", "cfg_scale") => self.generation.cfg_scale = parse(s, key, value)?,
            ("generation", "sampler") => self.generation.sampler = value.trim().to_string(),
            ("generation", "scheduler") => self.generation.scheduler = value.trim().to_string(),
            ("generation", "batch_size") => self.generation.batch_size = parse(s, key, value)?,
            ("generation", "seed") => self.generation.seed = parse(s, key, value)?,
            ("mock", "step_delay_ms") => self.mock.step_delay_ms = parse(s, key, value)?,
            ("logging", "level") => self.log_level = value.trim().to_lowercase(),
            _ => return Err(ForgeError::Config(format!("未知配置项: [{}] {}", section, key))),
        }
        Ok(())
    }

    /// 按 (节, 键) 读出字符串形式（写默认配置文件时使用）
    pub fn get_value(&self, section: &str, key: &str) -> Option<String> {
        let v = match (section, key) {
            ("animeforge", "backend") => self.backend.to_string(),
            ("animeforge", "output_dir") => self.output_dir.display().to_string(),
            ("animeforge", "projects_dir") => self.projects_dir.display().to_string(),
            ("animeforge", "poses_dir") => self.poses_dir.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
            ("comfyui", "host") => self.comfyui.host.clone(),
            ("comfyui", "port") => self.comfyui.port.to_string(),
            ("comfyui", "use_ssl") => self.comfyui.use_ssl.to_string(),
            ("comfyui", "timeout_secs") => self.comfyui.timeout_secs.to_string(),
            ("comfyui", "poll_interval_ms") => self.comfyui.poll_interval_ms.to_string(),
            ("fal", "api_key") => self.fal.api_key.clone().unwrap_or_default(),
            ("fal", "queue_url") => self.fal.queue_url.clone(),
            ("fal", "storage_url") => self.fal.storage_url.clone(),
            ("fal", "default_model") => self.fal.default_model.clone(),
            ("fal", "controlnet_model") => self.fal.controlnet_model.clone(),
            ("fal", "ip_adapter_model") => self.fal.ip_adapter_model.clone(),
            ("fal", "inline_uploads") => self.fal.inline_uploads.to_string(),
            ("fal", "timeout_secs") => self.fal.timeout_secs.to_string(),
            ("fal", "poll_interval_ms") => self.fal.poll_interval_ms.to_string(),
            ("models", "checkpoint") => self.models.checkpoint.clone(),
            ("models", "controlnet_openpose") => self.models.controlnet_openpose.clone(),
            ("models", "ip_adapter") => self.models.ip_adapter.clone(),
            ("models", "clip_vision") => self.models.clip_vision.clone(),
            ("generation", "width") => self.generation.width.to_string(),
            ("generation", "height") => self.generation.height.to_string(),
            ("generation", "steps") => self.generation.steps.to_string(),
            ("generation", "cfg_scale") => self.generation.cfg_scale.to_string(),
            ("generation", "sampler") => self.generation.sampler.clone(),
            ("generation", "scheduler") => self.generation.scheduler.clone(),
            ("generation", "batch_size") => self.generation.batch_size.to_string(),
            ("generation", "seed") => self.generation.seed.to_string(),
            ("mock", "step_delay_ms") => self.mock.step_delay_ms.to_string(),
            ("logging", "level") => self.log_level.clone(),
            _ => return None,
        };
        Some(v)
    }
}

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub backend: Option<BackendKind>,
    pub output_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, overrides: &CliOverrides) -> Result<AppConfig> {
        let mut config = AppConfig::default();

        // 1. 配置文件（显式指定时必须存在）
        match config_file {
            Some(path) => Self::apply_file(&mut config, path)?,
            None => {
                if let Some(path) = Self::find_default_location() {
                    Self::apply_file(&mut config, &path)?;
                }
            }
        }

        // 2. 环境变量
        Self::apply_env(&mut config, |name| env::var(name).ok())
            .context("解析环境变量失败")?;

        // 3. 命令行参数
        Self::apply_overrides(&mut config, overrides);

        Ok(config)
    }

    /// 环境变量名：`[animeforge]` 节为 ANIMEFORGE_<KEY>，`[logging] level` 为 ANIMEFORGE_LOG_LEVEL，
    /// 其余为 ANIMEFORGE_<SECTION>_<KEY>
    pub fn env_var_name(section: &str, key: &str) -> String {
        match (section, key) {
            ("animeforge", key) => format!("ANIMEFORGE_{}", key.to_uppercase()),
            ("logging", "level") => "ANIMEFORGE_LOG_LEVEL".to_string(),
            (section, key) => format!("ANIMEFORGE_{}_{}", section.to_uppercase(), key.to_uppercase()),
        }
    }

    /// 用给定的查找函数应用环境变量层
    pub fn apply_env(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) -> ForgeResult<()> {
        for (section, key) in KEYS {
            if let Some(value) = lookup(&Self::env_var_name(section, key)) {
                config.set_value(section, key, &value)?;
            }
        }
        Ok(())
    }

    pub fn apply_overrides(config: &mut AppConfig, overrides: &CliOverrides) {
        if let Some(backend) = overrides.backend {
            config.backend = backend;
        }
        if let Some(dir) = &overrides.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(level) = &overrides.log_level {
            config.log_level = level.clone();
        }
    }

    /// 从INI配置文件加载配置，未出现的键保持原值
    pub fn apply_file(config: &mut AppConfig, config_path: &Path) -> Result<()> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        for (section, key) in KEYS {
            // 空值视为未设置，api_key / poses_dir 除外（空字符串表示"不使用"）
            let Some(value) = config_parser.get(section, key) else {
                continue;
            };
            if value.trim().is_empty() && !matches!(*key, "api_key" | "poses_dir") {
                continue;
            }
            config
                .set_value(section, key, &value)
                .with_context(|| format!("配置文件 {} 中的值无效", config_path.display()))?;
        }

        tracing::debug!("[配置] 已加载配置文件: {}", config_path.display());
        Ok(())
    }

    /// 按顺序查找默认位置的配置文件
    fn find_default_location() -> Option<PathBuf> {
        // 1. 当前目录的 animeforge.ini
        // 2. 当前目录的 .animeforge.ini
        let mut candidates = vec![PathBuf::from("animeforge.ini"), PathBuf::from(".animeforge.ini")];

        // 3. 用户主目录的 ~/.animeforge/config.ini
        if let Some(home) = home_dir() {
            candidates.push(home.join(".animeforge").join("config.ini"));
        }

        // 4. /etc/animeforge.ini (Linux/macOS)
        candidates.push(PathBuf::from("/etc/animeforge.ini"));

        candidates.into_iter().find(|p| p.exists())
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = AppConfig::default();
        let mut config_parser = configparser::ini::Ini::new();
        for (section, key) in KEYS {
            config_parser.set(section, key, defaults.get_value(section, key));
        }

        crate::raster::ensure_parent(config_path)?;
        config_parser.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}

/// 展开开头的 `~/`
fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}
