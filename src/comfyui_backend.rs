use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::backend::{self, check_status, GenerationBackend, GenerationRequest, GenerationResult, ProgressCallback};
use crate::config::{ComfyUiSettings, ModelSettings};
use crate::error::{ForgeError, ForgeResult};

const DEFAULT_NEGATIVE: &str = "low quality, blurry, deformed";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 已上传到 ComfyUI 输入目录的条件图片名
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowImages {
    pub init: Option<String>,
    pub pose: Option<String>,
    pub identity: Option<String>,
}

/// 按顺序编号的节点图
struct WorkflowGraph {
    nodes: Map<String, Value>,
    next_id: u32,
}

impl WorkflowGraph {
    fn new() -> Self {
        Self {
            nodes: Map::new(),
            next_id: 1,
        }
    }

    fn add(&mut self, class_type: &str, inputs: Value) -> String {
        let id = self.next_id.to_string();
        self.next_id += 1;
        self.nodes
            .insert(id.clone(), json!({ "class_type": class_type, "inputs": inputs }));
        id
    }

    fn set_input(&mut self, node: &str, name: &str, value: Value) {
        if let Some(inputs) = self.nodes.get_mut(node).and_then(|n| n.get_mut("inputs")) {
            inputs[name] = value;
        }
    }
}

/// 本地 ComfyUI 后端
///
/// 每次生成构造一张完整的节点图，提交到 `/prompt`，
/// 轮询 `/history/{id}` 直到出现输出，再通过 `/view` 下载图片。
pub struct ComfyUiBackend {
    settings: ComfyUiSettings,
    models: ModelSettings,
    output_dir: PathBuf,
    client: Option<Client>,
    client_id: String,
}

impl ComfyUiBackend {
    pub fn new(settings: ComfyUiSettings, models: ModelSettings, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            models,
            output_dir: output_dir.into(),
            client: None,
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn ensure_client(&self) -> ForgeResult<&Client> {
        self.client.as_ref().ok_or(ForgeError::NotConnected("ComfyUI"))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url(), path)
    }

    /// 构造节点图
    ///
    /// 基础链路：模型加载 → 正/负提示词编码 → 空 latent（或图生图编码）→ KSampler → VAE 解码 → 保存。
    /// 有姿态引导时插入 ControlNet 节点并改接采样器的 positive/negative，
    /// 有参考图时插入 IP-Adapter 节点并改接采样器的 model。
    pub fn build_workflow(&self, request: &GenerationRequest, images: &WorkflowImages) -> Value {
        let mut graph = WorkflowGraph::new();

        let ckpt = graph.add("CheckpointLoaderSimple", json!({ "ckpt_name": self.models.checkpoint }));
        let positive = graph.add("CLIPTextEncode", json!({ "text": request.prompt, "clip": [ckpt, 1] }));
        let negative_text = if request.negative_prompt.is_empty() {
            DEFAULT_NEGATIVE
        } else {
            request.negative_prompt.as_str()
        };
        let negative = graph.add("CLIPTextEncode", json!({ "text": negative_text, "clip": [ckpt, 1] }));

        let (latent, denoise) = match (&request.init_image, &images.init) {
            (Some(init), Some(name)) => {
                let load = graph.add("LoadImage", json!({ "image": name }));
                let encode = graph.add("VAEEncode", json!({ "pixels": [load, 0], "vae": [ckpt, 2] }));
                (encode, init.denoise_strength)
            }
            _ => {
                let empty = graph.add(
                    "EmptyLatentImage",
                    json!({
                        "width": request.width,
                        "height": request.height,
                        "batch_size": request.batch_size,
                    }),
                );
                (empty, 1.0)
            }
        };

        let sampler = graph.add(
            "KSampler",
            json!({
                "model": [ckpt, 0],
                "positive": [positive, 0],
                "negative": [negative, 0],
                "latent_image": [latent, 0],
                "seed": effective_seed(request.seed),
                "steps": request.steps,
                "cfg": request.cfg_scale,
                "sampler_name": request.sampler,
                "scheduler": request.scheduler,
                "denoise": denoise,
            }),
        );
        let decode = graph.add("VAEDecode", json!({ "samples": [sampler, 0], "vae": [ckpt, 2] }));
        graph.add("SaveImage", json!({ "images": [decode, 0], "filename_prefix": "animeforge" }));

        if let (Some(guide), Some(name)) = (&request.pose_guide, &images.pose) {
            let loader = graph.add("ControlNetLoader", json!({ "control_net_name": guide.model }));
            let image = graph.add("LoadImage", json!({ "image": name }));
            let apply = graph.add(
                "ControlNetApplyAdvanced",
                json!({
                    "positive": [positive, 0],
                    "negative": [negative, 0],
                    "control_net": [loader, 0],
                    "image": [image, 0],
                    "strength": guide.strength,
                    "start_percent": 0.0,
                    "end_percent": 1.0,
                }),
            );
            graph.set_input(&sampler, "positive", json!([apply, 0]));
            graph.set_input(&sampler, "negative", json!([apply, 1]));
        }

        if let (Some(identity), Some(name)) = (&request.identity, &images.identity) {
            let ipa_loader = graph.add("IPAdapterModelLoader", json!({ "ipadapter_file": identity.model }));
            let clip_vision = graph.add("CLIPVisionLoader", json!({ "clip_name": self.models.clip_vision }));
            let image = graph.add("LoadImage", json!({ "image": name }));
            let apply = graph.add(
                "IPAdapterAdvanced",
                json!({
                    "model": [ckpt, 0],
                    "ipadapter": [ipa_loader, 0],
                    "image": [image, 0],
                    "clip_vision": [clip_vision, 0],
                    "weight": identity.weight,
                    "weight_type": "linear",
                    "combine_embeds": "concat",
                    "start_at": 0.0,
                    "end_at": 1.0,
                    "embeds_scaling": "V only",
                }),
            );
            graph.set_input(&sampler, "model", json!([apply, 0]));
        }

        Value::Object(graph.nodes)
    }

    /// 上传一张本地图片到 ComfyUI 的输入目录，返回节点里引用的文件名
    async fn upload_image(&self, client: &Client, path: &Path) -> ForgeResult<String> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image.png")
            .to_string();

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(backend::guess_content_type(path))?;
        let form = Form::new().part("image", part).text("overwrite", "true");

        let resp = client.post(self.url("/upload/image")).multipart(form).send().await?;
        let body: Value = check_status(resp, "上传图片").await?.json().await?;

        let name = body
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ForgeError::backend(format!("上传响应缺少 name 字段: {}", body)))?;
        let subfolder = body.get("subfolder").and_then(Value::as_str).unwrap_or("");

        debug!("[ComfyUI] 已上传 {} -> {}", path.display(), name);
        Ok(if subfolder.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", subfolder, name)
        })
    }

    async fn upload_conditioning(&self, client: &Client, request: &GenerationRequest) -> ForgeResult<WorkflowImages> {
        let mut images = WorkflowImages::default();
        if let Some(init) = &request.init_image {
            images.init = Some(self.upload_image(client, &init.image).await?);
        }
        if let Some(guide) = &request.pose_guide {
            images.pose = Some(self.upload_image(client, &guide.image).await?);
        }
        if let Some(identity) = &request.identity {
            images.identity = Some(self.upload_image(client, &identity.image).await?);
        }
        Ok(images)
    }

    /// 轮询任务历史，完成后下载所有输出图片
    async fn wait_for_result(
        &self,
        client: &Client,
        prompt_id: &str,
        progress: Option<&ProgressCallback>,
    ) -> ForgeResult<Vec<PathBuf>> {
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let timeout = Duration::from_secs(self.settings.timeout_secs);
        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms);
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() > deadline {
                return Err(ForgeError::Timeout {
                    job: prompt_id.to_string(),
                    seconds: self.settings.timeout_secs,
                });
            }

            let resp = client.get(self.url(&format!("/history/{}", prompt_id))).send().await?;
            let history: Value = check_status(resp, "查询任务历史").await?.json().await?;

            if let Some(entry) = history.get(prompt_id) {
                return self.download_outputs(client, entry).await;
            }

            backend::report(progress, 0, 0, "Generating...");
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn download_outputs(&self, client: &Client, entry: &Value) -> ForgeResult<Vec<PathBuf>> {
        let mut images = Vec::new();
        let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
            return Ok(images);
        };

        for node_output in outputs.values() {
            let Some(list) = node_output.get("images").and_then(Value::as_array) else {
                continue;
            };
            for img in list {
                let Some(filename) = img.get("filename").and_then(Value::as_str) else {
                    warn!("⚠️  [ComfyUI] 输出项缺少 filename，跳过: {}", img);
                    continue;
                };
                let subfolder = img.get("subfolder").and_then(Value::as_str).unwrap_or("");

                let resp = client
                    .get(self.url("/view"))
                    .query(&[("filename", filename), ("subfolder", subfolder), ("type", "output")])
                    .send()
                    .await?;
                let bytes = check_status(resp, "下载图片").await?.bytes().await?;

                // 只取文件名部分，防止路径穿越
                let local_name = Path::new(filename)
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| "output.png".into());
                let out_path = self.output_dir.join(local_name);
                tokio::fs::write(&out_path, &bytes).await?;
                debug!("[ComfyUI] 已下载: {}", out_path.display());
                images.push(out_path);
            }
        }
        Ok(images)
    }
}

#[async_trait]
impl GenerationBackend for ComfyUiBackend {
    fn name(&self) -> &'static str {
        "comfyui"
    }

    async fn connect(&mut self) -> ForgeResult<()> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ForgeError::Connectivity(format!("创建 HTTP 客户端失败: {}", e)))?;
        tokio::fs::create_dir_all(&self.output_dir).await?;
        self.client = Some(client);
        info!("✅ [ComfyUI] 客户端已创建: {}", self.settings.base_url());
        Ok(())
    }

    async fn disconnect(&mut self) -> ForgeResult<()> {
        self.client = None;
        Ok(())
    }

    async fn is_available(&self) -> bool {
        let Ok(client) = self.ensure_client() else {
            return false;
        };
        match client.get(self.url("/system_stats")).send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                debug!("[ComfyUI] 探测失败: {}", e);
                false
            }
        }
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        progress: Option<&ProgressCallback>,
    ) -> ForgeResult<GenerationResult> {
        let client = self.ensure_client()?;

        let uploaded = self.upload_conditioning(client, request).await?;
        let workflow = self.build_workflow(request, &uploaded);

        let resp = client
            .post(self.url("/prompt"))
            .json(&json!({ "prompt": workflow, "client_id": self.client_id }))
            .send()
            .await?;
        let queued: Value = check_status(resp, "提交任务").await?.json().await?;
        let prompt_id = queued
            .get("prompt_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ForgeError::backend(format!("提交响应缺少 prompt_id: {}", queued)))?
            .to_string();
        debug!("[ComfyUI] 任务已提交: {}", prompt_id);

        let images = self.wait_for_result(client, &prompt_id, progress).await?;

        let mut metadata = backend::base_metadata(self.name());
        metadata.insert("prompt_id".to_string(), Value::from(prompt_id));

        Ok(GenerationResult {
            images,
            seed: effective_seed(request.seed),
            prompt: request.prompt.clone(),
            metadata,
        })
    }

    async fn get_models(&self) -> ForgeResult<Vec<String>> {
        let client = self.ensure_client()?;
        let resp = client.get(self.url("/object_info/CheckpointLoaderSimple")).send().await?;
        let data: Value = check_status(resp, "查询模型列表").await?.json().await?;

        let list = data
            .pointer("/CheckpointLoaderSimple/input/required/ckpt_name/0")
            .and_then(Value::as_array)
            .ok_or_else(|| ForgeError::backend("object_info 响应中没有 ckpt_name 列表"))?;
        Ok(list.iter().filter_map(Value::as_str).map(str::to_string).collect())
    }
}

/// 未指定种子时固定发送 0
fn effective_seed(seed: i64) -> i64 {
    seed.max(0)
}
