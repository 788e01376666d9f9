use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::backend::{self, check_status, GenerationBackend, GenerationRequest, GenerationResult, ProgressCallback};
use crate::config::FalSettings;
use crate::error::{ForgeError, ForgeResult};

const TOTAL_STEPS: u32 = 10;
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// 已准备好的条件图片 URL（CDN 地址或 data URI）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageUrls {
    pub control: Option<String>,
    pub face: Option<String>,
    pub init: Option<String>,
}

/// fal.ai 云端后端
///
/// 根据请求里的条件字段选择模型端点，提交到队列后轮询状态，
/// 完成后下载返回的图片 URL。
pub struct FalBackend {
    settings: FalSettings,
    output_dir: PathBuf,
    client: Option<Client>,
    api_key: String,
}

impl FalBackend {
    pub fn new(settings: FalSettings, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            output_dir: output_dir.into(),
            client: None,
            api_key: String::new(),
        }
    }

    fn ensure_client(&self) -> ForgeResult<&Client> {
        self.client.as_ref().ok_or(ForgeError::NotConnected("fal"))
    }

    fn auth_header(&self) -> String {
        format!("Key {}", self.api_key)
    }

    /// 端点优先级：姿态引导 > 参考图 > 默认模型
    pub fn select_endpoint(&self, request: &GenerationRequest) -> &str {
        if request.pose_guide.as_ref().is_some_and(|g| !g.model.is_empty()) {
            return &self.settings.controlnet_model;
        }
        if request.identity.is_some() {
            return &self.settings.ip_adapter_model;
        }
        &self.settings.default_model
    }

    /// 请求字段映射为 fal 参数；负面提示词为空、种子未指定时不发送
    pub fn build_params(request: &GenerationRequest, images: &ImageUrls) -> Value {
        let mut params = Map::new();
        params.insert("prompt".into(), json!(request.prompt));
        params.insert(
            "image_size".into(),
            json!({ "width": request.width, "height": request.height }),
        );
        params.insert("num_inference_steps".into(), json!(request.steps));
        params.insert("guidance_scale".into(), json!(request.cfg_scale));
        params.insert("num_images".into(), json!(request.batch_size));

        if !request.negative_prompt.is_empty() {
            params.insert("negative_prompt".into(), json!(request.negative_prompt));
        }
        if request.has_seed() {
            params.insert("seed".into(), json!(request.seed));
        }

        if let (Some(guide), Some(url)) = (&request.pose_guide, &images.control) {
            params.insert("control_image".into(), json!(url));
            params.insert("controlnet_conditioning_scale".into(), json!(guide.strength));
        }
        if let (Some(identity), Some(url)) = (&request.identity, &images.face) {
            params.insert("face_image".into(), json!(url));
            params.insert("ip_adapter_scale".into(), json!(identity.weight));
        }
        if let (Some(init), Some(url)) = (&request.init_image, &images.init) {
            params.insert("image".into(), json!(url));
            params.insert("strength".into(), json!(init.denoise_strength));
        }

        for (key, value) in &request.extra_params {
            params.entry(key.clone()).or_insert_with(|| value.clone());
        }

        Value::Object(params)
    }

    async fn prepare_images(&self, client: &Client, request: &GenerationRequest) -> ForgeResult<ImageUrls> {
        let mut urls = ImageUrls::default();
        if let Some(guide) = &request.pose_guide {
            urls.control = Some(self.prepare_image_url(client, &guide.image).await?);
        }
        if let Some(identity) = &request.identity {
            urls.face = Some(self.prepare_image_url(client, &identity.image).await?);
        }
        if let Some(init) = &request.init_image {
            urls.init = Some(self.prepare_image_url(client, &init.image).await?);
        }
        Ok(urls)
    }

    /// 本地图片上传到 fal 存储（或内联为 data URI），返回可访问的 URL
    async fn prepare_image_url(&self, client: &Client, path: &Path) -> ForgeResult<String> {
        let bytes = tokio::fs::read(path).await?;
        let content_type = backend::guess_content_type(path);

        if self.settings.inline_uploads {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            return Ok(format!("data:{};base64,{}", content_type, encoded));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image.png");

        let resp = client
            .post(format!("{}/storage/upload/initiate", self.settings.storage_url))
            .header("Authorization", self.auth_header())
            .json(&json!({ "content_type": content_type, "file_name": file_name }))
            .send()
            .await?;
        let initiated: Value = check_status(resp, "申请上传地址").await?.json().await?;

        let upload_url = str_field(&initiated, "upload_url")?;
        let file_url = str_field(&initiated, "file_url")?;

        let resp = client
            .put(upload_url)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;
        check_status(resp, "上传图片").await?;

        debug!("[fal] 已上传 {} -> {}", path.display(), file_url);
        Ok(file_url.to_string())
    }

    /// 轮询队列状态直到完成，返回最终结果 JSON
    async fn wait_for_completion(
        &self,
        client: &Client,
        status_url: &str,
        response_url: &str,
        request_id: &str,
        progress: Option<&ProgressCallback>,
    ) -> ForgeResult<Value> {
        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms);
        let deadline = Instant::now() + Duration::from_secs(self.settings.timeout_secs);

        loop {
            if Instant::now() > deadline {
                return Err(ForgeError::Timeout {
                    job: request_id.to_string(),
                    seconds: self.settings.timeout_secs,
                });
            }

            let resp = client
                .get(status_url)
                .query(&[("logs", "1")])
                .header("Authorization", self.auth_header())
                .send()
                .await?;
            let status: Value = check_status(resp, "查询队列状态").await?.json().await?;

            match status.get("status").and_then(Value::as_str).unwrap_or("") {
                "COMPLETED" => break,
                "IN_QUEUE" => backend::report(progress, 2, TOTAL_STEPS, "Queued..."),
                "IN_PROGRESS" => {
                    let logs = status
                        .get("logs")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    let step = (3 + logs.len() as u32).min(8);
                    let message = logs
                        .last()
                        .and_then(|l| l.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("Generating...");
                    backend::report(progress, step, TOTAL_STEPS, message);
                }
                other => debug!("[fal] 未知的队列状态: {}", other),
            }

            tokio::time::sleep(poll_interval).await;
        }

        let resp = client
            .get(response_url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        Ok(check_status(resp, "获取生成结果").await?.json().await?)
    }

    async fn download_images(
        &self,
        client: &Client,
        result: &Value,
        request: &GenerationRequest,
        seed: i64,
    ) -> ForgeResult<Vec<PathBuf>> {
        let entries = result
            .get("images")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        if entries.is_empty() {
            warn!("⚠️  [fal] 没有返回任何图片");
            return Ok(Vec::new());
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let mut downloaded = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let url = entry.get("url").and_then(Value::as_str).unwrap_or("");
            if url.is_empty() {
                continue;
            }
            let resp = client.get(url).send().await?;
            let bytes = check_status(resp, "下载图片").await?.bytes().await?;

            let out_path = self.output_dir.join(format!(
                "fal_{}_{}x{}_{}.png",
                seed, request.width, request.height, i
            ));
            tokio::fs::write(&out_path, &bytes).await?;
            info!("✅ [fal] 已下载: {}", out_path.display());
            downloaded.push(out_path);
        }
        Ok(downloaded)
    }
}

#[async_trait]
impl GenerationBackend for FalBackend {
    fn name(&self) -> &'static str {
        "fal"
    }

    async fn connect(&mut self) -> ForgeResult<()> {
        self.api_key = self
            .settings
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("FAL_KEY").ok())
            .unwrap_or_default();

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(AVAILABILITY_TIMEOUT)
            .build()
            .map_err(|e| ForgeError::Connectivity(format!("创建 HTTP 客户端失败: {}", e)))?;
        tokio::fs::create_dir_all(&self.output_dir).await?;
        self.client = Some(client);
        info!("✅ [fal] 客户端已创建: {}", self.settings.queue_url);
        Ok(())
    }

    async fn disconnect(&mut self) -> ForgeResult<()> {
        self.client = None;
        Ok(())
    }

    async fn is_available(&self) -> bool {
        if self.api_key.is_empty() {
            warn!("⚠️  [fal] 未配置 API key（设置 FAL_KEY 或 [fal] api_key）");
            return false;
        }
        let Ok(client) = self.ensure_client() else {
            return false;
        };

        let ping = client
            .get(format!("{}/{}", self.settings.queue_url, self.settings.default_model))
            .header("Authorization", self.auth_header())
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .await;
        match ping {
            // 401 表示 key 无效；其余状态说明服务可达且 key 被接受
            Ok(resp) => resp.status() != StatusCode::UNAUTHORIZED,
            Err(e) => {
                debug!("[fal] 探测失败: {}", e);
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
        let endpoint = self.select_endpoint(request).to_string();

        let urls = self.prepare_images(client, request).await?;
        let params = Self::build_params(request, &urls);

        backend::report(progress, 1, TOTAL_STEPS, &format!("Submitting to {}", endpoint));

        let resp = client
            .post(format!("{}/{}", self.settings.queue_url, endpoint))
            .header("Authorization", self.auth_header())
            .json(&params)
            .send()
            .await?;
        let queued: Value = check_status(resp, "提交任务").await?.json().await?;

        let request_id = str_field(&queued, "request_id")?.to_string();
        let base = format!("{}/{}/requests/{}", self.settings.queue_url, endpoint, request_id);
        let status_url = queued
            .get("status_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/status", base));
        let response_url = queued
            .get("response_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(base);
        debug!("[fal] 任务已提交: {} ({})", request_id, endpoint);

        let result = self
            .wait_for_completion(client, &status_url, &response_url, &request_id, progress)
            .await?;

        backend::report(progress, 9, TOTAL_STEPS, "Downloading images...");
        let seed = result.get("seed").and_then(Value::as_i64).unwrap_or(request.seed);
        let images = self.download_images(client, &result, request, seed).await?;
        backend::report(progress, 10, TOTAL_STEPS, "Complete");

        let mut metadata = backend::base_metadata(self.name());
        metadata.insert("endpoint".to_string(), Value::from(endpoint));
        metadata.insert("request_id".to_string(), Value::from(request_id));

        Ok(GenerationResult {
            images,
            seed,
            prompt: request.prompt.clone(),
            metadata,
        })
    }

    /// 配置中的三个端点，不需要联网
    async fn get_models(&self) -> ForgeResult<Vec<String>> {
        Ok(vec![
            self.settings.default_model.clone(),
            self.settings.controlnet_model.clone(),
            self.settings.ip_adapter_model.clone(),
        ])
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> ForgeResult<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ForgeError::backend(format!("响应缺少 {} 字段: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{IdentityReference, InitImage, PoseGuide};

    fn pose_guide() -> PoseGuide {
        PoseGuide {
            image: PathBuf::from("/tmp/pose.png"),
            model: "openpose".to_string(),
            strength: 0.85,
        }
    }

    fn identity() -> IdentityReference {
        IdentityReference {
            image: PathBuf::from("/tmp/ref.png"),
            model: "ip-adapter".to_string(),
            weight: 0.75,
        }
    }

    #[test]
    fn endpoint_priority() {
        let fal = FalBackend::new(FalSettings::default(), "/tmp/animeforge-unused");
        let mut req = GenerationRequest::new("girl");
        assert_eq!(fal.select_endpoint(&req), "fal-ai/pony-v7");

        req.identity = Some(identity());
        assert_eq!(fal.select_endpoint(&req), "fal-ai/ip-adapter-face-id");

        req.pose_guide = Some(pose_guide());
        assert_eq!(fal.select_endpoint(&req), "fal-ai/sdxl-controlnet-union");
    }

    #[test]
    fn unset_seed_and_empty_negative_are_omitted() {
        let params = FalBackend::build_params(&GenerationRequest::new("girl"), &ImageUrls::default());
        assert_eq!(params["prompt"], "girl");
        assert_eq!(params["image_size"], json!({ "width": 1024, "height": 1024 }));
        assert_eq!(params["num_inference_steps"], 30);
        assert_eq!(params["num_images"], 1);
        assert!(params.get("seed").is_none());
        assert!(params.get("negative_prompt").is_none());
    }

    #[test]
    fn conditioning_fields_are_mapped() {
        let mut req = GenerationRequest::new("girl");
        req.seed = 7;
        req.negative_prompt = "blurry".to_string();
        req.pose_guide = Some(pose_guide());
        req.identity = Some(identity());
        req.init_image = Some(InitImage {
            image: PathBuf::from("/tmp/base.png"),
            denoise_strength: 0.5,
        });
        let urls = ImageUrls {
            control: Some("https://cdn/pose.png".to_string()),
            face: Some("https://cdn/ref.png".to_string()),
            init: Some("https://cdn/base.png".to_string()),
        };
        let params = FalBackend::build_params(&req, &urls);
        assert_eq!(params["seed"], 7);
        assert_eq!(params["negative_prompt"], "blurry");
        assert_eq!(params["control_image"], "https://cdn/pose.png");
        assert!((params["controlnet_conditioning_scale"].as_f64().unwrap() - 0.85).abs() < 1e-6);
        assert_eq!(params["face_image"], "https://cdn/ref.png");
        assert!((params["ip_adapter_scale"].as_f64().unwrap() - 0.75).abs() < 1e-6);
        assert_eq!(params["image"], "https://cdn/base.png");
        assert!((params["strength"].as_f64().unwrap() - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn missing_key_means_unavailable() {
        let settings = FalSettings {
            api_key: Some(String::new()),
            ..FalSettings::default()
        };
        let fal = FalBackend::new(settings, "/tmp/animeforge-unused");
        assert!(!fal.is_available().await);
    }

    #[tokio::test]
    async fn models_are_static_configuration() {
        let fal = FalBackend::new(FalSettings::default(), "/tmp/animeforge-unused");
        let models = fal.get_models().await.unwrap();
        assert_eq!(models.len(), 3);
        assert!(matches!(
            fal.generate(&GenerationRequest::new("x"), None).await,
            Err(ForgeError::NotConnected(_))
        ));
    }
}
