use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use crate::backend::{GenerationBackend, GenerationRequest, InitImage};
use crate::config::AppConfig;
use crate::error::ForgeResult;
use crate::models::{Scene, TimeOfDay, Weather};
use crate::prompt::{build_scene_prompt, SCENE_NEGATIVE};

/// 以底层图层为底图做图生图时的重绘强度
pub const BACKGROUND_DENOISE: f32 = 0.55;

/// 为每个时段生成一张场景背景，返回 时段 → `bg_<time>.png`
///
/// z_index 最小的图层若有磁盘上存在的图片，则作为图生图的底图。
/// `times` 为空时生成全部四个时段。
pub async fn generate_scene_backgrounds(
    scene: &Scene,
    backend: &dyn GenerationBackend,
    config: &AppConfig,
    output_dir: impl AsRef<Path>,
    times: Option<&[TimeOfDay]>,
    weather: Weather,
) -> ForgeResult<BTreeMap<TimeOfDay, PathBuf>> {
    let output_dir = output_dir.as_ref();
    let times = times.unwrap_or(&TimeOfDay::ALL[..]);
    let total_start = Instant::now();

    info!("🎬 [场景背景] 开始生成场景 '{}' 的 {} 个时段背景", scene.name, times.len());
    std::fs::create_dir_all(output_dir)?;

    let base_image = scene
        .base_layer()
        .and_then(|l| l.image_path.as_ref())
        .filter(|p| p.exists())
        .cloned();

    let gen = &config.generation;
    let mut results = BTreeMap::new();

    for &time in times {
        let step_start = Instant::now();
        let mut request = GenerationRequest {
            prompt: build_scene_prompt(scene, time, weather, scene.default_season),
            negative_prompt: SCENE_NEGATIVE.to_string(),
            width: gen.width,
            height: gen.height,
            steps: gen.steps,
            cfg_scale: gen.cfg_scale,
            sampler: gen.sampler.clone(),
            scheduler: gen.scheduler.clone(),
            seed: gen.seed,
            batch_size: 1,
            ..GenerationRequest::default()
        };

        match &base_image {
            Some(path) => {
                info!("⏳ [场景背景] {}: 图生图，底图 {}", time, path.display());
                request.init_image = Some(InitImage {
                    image: path.clone(),
                    denoise_strength: BACKGROUND_DENOISE,
                });
            }
            None => info!("⏳ [场景背景] {}: 文生图（没有底图）", time),
        }

        let result = match backend.generate(&request, None).await {
            Ok(result) => result,
            Err(e) if e.is_recoverable_frame_error() => {
                warn!("⚠️  [场景背景] {} 生成失败，跳过: {}", time, e);
                continue;
            }
            Err(e) => return Err(e),
        };

        let Some(src) = result.images.first() else {
            warn!("⚠️  [场景背景] {} 没有返回图片", time);
            continue;
        };

        let dest = output_dir.join(format!("bg_{}.png", time));
        if src != &dest {
            tokio::fs::copy(src, &dest).await?;
        }
        info!("✅ [场景背景] {} -> {} (seed={})，耗时: {:.2}秒",
            time, dest.display(), result.seed, step_start.elapsed().as_secs_f64());
        results.insert(time, dest);
    }

    info!("🎉 [场景背景] 完成 {}/{} 个时段，总耗时: {:.2}秒",
        results.len(), times.len(), total_start.elapsed().as_secs_f64());
    Ok(results)
}
