use std::collections::BTreeMap;
use std::path::PathBuf;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::comfyui_backend::ComfyUiBackend;
use crate::config::{AppConfig, BackendKind};
use crate::error::{ForgeError, ForgeResult};
use crate::fal_backend::FalBackend;
use crate::mock_backend::MockBackend;

/// 生成进度回调：(当前步, 总步数, 状态文本)，总步数为 0 表示进度未知
pub type ProgressCallback = dyn Fn(u32, u32, &str) + Send + Sync;

/// 姿态引导（ControlNet）
#[derive(Debug, Clone, PartialEq)]
pub struct PoseGuide {
    pub image: PathBuf,
    pub model: String,
    pub strength: f32,
}

/// 角色一致性参考图（IP-Adapter）
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityReference {
    pub image: PathBuf,
    pub model: String,
    pub weight: f32,
}

/// 图生图
#[derive(Debug, Clone, PartialEq)]
pub struct InitImage {
    pub image: PathBuf,
    pub denoise_strength: f32,
}

/// 一次图像生成请求
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    pub sampler: String,
    pub scheduler: String,
    /// 负数表示未指定（由各后端自行决定）
    pub seed: i64,
    pub batch_size: u32,
    pub pose_guide: Option<PoseGuide>,
    pub identity: Option<IdentityReference>,
    pub init_image: Option<InitImage>,
    pub extra_params: BTreeMap<String, serde_json::Value>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            width: 1024,
            height: 1024,
            steps: 30,
            cfg_scale: 7.0,
            sampler: "euler_ancestral".to_string(),
            scheduler: "normal".to_string(),
            seed: -1,
            batch_size: 1,
            pose_guide: None,
            identity: None,
            init_image: None,
            extra_params: BTreeMap::new(),
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn has_seed(&self) -> bool {
        self.seed >= 0
    }
}

/// 一次生成的结果，图片文件归调用方所有
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub images: Vec<PathBuf>,
    pub seed: i64,
    pub prompt: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// 图像生成后端
///
/// 三种实现：本地 ComfyUI、fal.ai 云端、离线 Mock。
/// 在 `connect` 之前调用 `generate` 会返回 `NotConnected`。
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// 后端名称（用于日志和元数据）
    fn name(&self) -> &'static str;

    async fn connect(&mut self) -> ForgeResult<()>;

    async fn disconnect(&mut self) -> ForgeResult<()>;

    /// 轻量探测，网络失败时返回 false 而不是报错
    async fn is_available(&self) -> bool;

    async fn generate(
        &self,
        request: &GenerationRequest,
        progress: Option<&ProgressCallback>,
    ) -> ForgeResult<GenerationResult>;

    async fn get_models(&self) -> ForgeResult<Vec<String>>;
}

/// 按配置创建后端（未连接）
///
/// `output_dir` 为空时使用 `<config.output_dir>/<后端子目录>`。
pub fn create_backend(
    config: &AppConfig,
    kind: BackendKind,
    output_dir: Option<PathBuf>,
) -> Box<dyn GenerationBackend> {
    let dir = |sub: &str| output_dir.clone().unwrap_or_else(|| config.output_dir.join(sub));
    match kind {
        BackendKind::ComfyUi => Box::new(ComfyUiBackend::new(
            config.comfyui.clone(),
            config.models.clone(),
            dir("generated"),
        )),
        BackendKind::Fal => Box::new(FalBackend::new(config.fal.clone(), dir("fal_output"))),
        BackendKind::Mock => Box::new(MockBackend::new(&config.mock, dir("mock_output"))),
    }
}

/// 进度上报的小工具，回调为空时什么也不做
pub(crate) fn report(progress: Option<&ProgressCallback>, step: u32, total: u32, status: &str) {
    if let Some(cb) = progress {
        cb(step, total, status);
    }
}

/// 结果元数据里统一带上后端名和完成时间
pub(crate) fn base_metadata(backend: &str) -> BTreeMap<String, serde_json::Value> {
    let mut metadata = BTreeMap::new();
    metadata.insert("backend".to_string(), serde_json::Value::from(backend));
    metadata.insert(
        "finished_at".to_string(),
        serde_json::Value::from(chrono::Utc::now().to_rfc3339()),
    );
    metadata
}

/// 非 2xx 状态转为后端错误，附带响应正文
pub(crate) async fn check_status(resp: reqwest::Response, action: &str) -> ForgeResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ForgeError::backend(format!("{}失败: HTTP {} {}", action, status, body)))
}

/// 根据扩展名猜测 Content-Type
pub(crate) fn guess_content_type(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}
