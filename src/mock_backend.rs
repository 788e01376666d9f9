use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use resvg::tiny_skia::Transform;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use crate::backend::{self, GenerationBackend, GenerationRequest, GenerationResult, ProgressCallback};
use crate::config::MockSettings;
use crate::error::{ForgeError, ForgeResult};
use crate::raster;

const TOTAL_STEPS: u32 = 10;
const LABEL_MAX_CHARS: usize = 80;

/// 离线 Mock 后端
///
/// 生成带提示词文字的渐变图，不需要任何网络服务。
/// 同样的提示词加同样的种子总是得到逐字节相同的 PNG。
pub struct MockBackend {
    output_dir: PathBuf,
    step_delay: Duration,
    fontdb: Option<Arc<usvg::fontdb::Database>>,
}

impl MockBackend {
    pub fn new(settings: &MockSettings, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            step_delay: Duration::from_millis(settings.step_delay_ms),
            fontdb: None,
        }
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&mut self) -> ForgeResult<()> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        if self.fontdb.is_none() {
            let mut db = usvg::fontdb::Database::new();
            db.load_system_fonts();
            debug!("[Mock] 已加载 {} 个系统字体", db.faces().count());
            self.fontdb = Some(Arc::new(db));
        }
        info!("✅ [Mock] 已就绪，输出目录: {}", self.output_dir.display());
        Ok(())
    }

    async fn disconnect(&mut self) -> ForgeResult<()> {
        self.fontdb = None;
        Ok(())
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        progress: Option<&ProgressCallback>,
    ) -> ForgeResult<GenerationResult> {
        let fontdb = self.fontdb.clone().ok_or(ForgeError::NotConnected("Mock"))?;
        if request.width == 0 || request.height == 0 {
            return Err(ForgeError::invalid_input(format!(
                "图片尺寸无效: {}x{}",
                request.width, request.height
            )));
        }

        for step in 1..=TOTAL_STEPS {
            backend::report(progress, step, TOTAL_STEPS, &format!("Mock generating step {}", step));
            tokio::time::sleep(self.step_delay).await;
        }

        let seed = if request.has_seed() {
            request.seed
        } else {
            prompt_seed(&request.prompt)
        };

        let image = render_mock_image(request.width, request.height, &request.prompt, seed, fontdb)?;

        let out_path = self
            .output_dir
            .join(format!("mock_{}_{}x{}.png", seed, request.width, request.height));
        raster::save_png(&image::DynamicImage::ImageRgb8(image), &out_path)?;
        debug!("[Mock] 已生成: {}", out_path.display());

        let mut metadata = backend::base_metadata(self.name());
        metadata.insert("model".to_string(), serde_json::Value::from("mock-v1"));

        Ok(GenerationResult {
            images: vec![out_path],
            seed,
            prompt: request.prompt.clone(),
            metadata,
        })
    }

    async fn get_models(&self) -> ForgeResult<Vec<String>> {
        if self.fontdb.is_none() {
            return Err(ForgeError::NotConnected("Mock"));
        }
        Ok(vec!["mock-v1".to_string()])
    }
}

/// 从提示词推导稳定的种子（SHA-256 的前 32 位）
pub fn prompt_seed(prompt: &str) -> i64 {
    let digest = Sha256::digest(prompt.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as i64
}

fn render_mock_image(
    width: u32,
    height: u32,
    prompt: &str,
    seed: i64,
    fontdb: Arc<usvg::fontdb::Database>,
) -> ForgeResult<RgbImage> {
    let top = [(seed >> 16) as u8, (seed >> 8) as u8, seed as u8];
    let bottom = top.map(|c| 255 - c);

    let span = height.saturating_sub(1).max(1) as f64;
    let gradient = RgbImage::from_fn(width, height, |_, y| {
        let t = y as f64 / span;
        let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t) as u8;
        Rgb([mix(top[0], bottom[0]), mix(top[1], bottom[1]), mix(top[2], bottom[2])])
    });

    let label: String = prompt.chars().take(LABEL_MAX_CHARS).collect();
    let svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}">
<text x="10" y="26" font-family="sans-serif" font-size="16" fill="rgb(255,255,255)">[MOCK] {label}</text>
<text x="10" y="46" font-family="sans-serif" font-size="16" fill="rgb(200,200,200)">seed={seed}  {w}x{h}</text>
</svg>"#,
        w = width,
        h = height,
        label = xml_escape(&label),
        seed = seed,
    );

    let options = usvg::Options {
        fontdb,
        ..Default::default()
    };
    let tree = usvg::Tree::from_str(&svg, &options)
        .map_err(|e| ForgeError::render(format!("解析文字叠加层失败: {}", e)))?;

    let rgba = image::DynamicImage::ImageRgb8(gradient).to_rgba8();
    let mut pixmap = raster::rgba_to_pixmap(&rgba)?;
    resvg::render(&tree, Transform::identity(), &mut pixmap.as_mut());

    let composed = raster::pixmap_to_rgba(&pixmap)?;
    Ok(image::DynamicImage::ImageRgba8(composed).to_rgb8())
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out
}
