use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use crate::backend::{GenerationBackend, GenerationRequest, IdentityReference, PoseGuide};
use crate::config::AppConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::models::{AnimationDef, Character, Scene};
use crate::pose_interpolator::interpolate_poses;
use crate::pose_loader::PoseLibrary;
use crate::pose_renderer::{render_pose_image, RenderOptions};
use crate::prompt::{build_character_prompt, build_negative_prompt};
use crate::scratch::ScratchDir;
use crate::sprite_assembler::{assemble_sprite_sheet, Direction};

/// 姿态引导强度
pub const POSE_GUIDE_STRENGTH: f32 = 0.85;

/// 协作式取消标志，在动画之间和帧之间检查
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 单个动画的处理结果
#[derive(Debug)]
enum AnimationOutcome {
    Sheet { path: PathBuf, frames: usize },
    /// 姿态缺失或所有帧都失败
    Skipped,
    /// 某一帧出现不可跳过的错误，丢弃该动画
    Aborted(ForgeError),
    /// 生成中途取消；已生成的帧仍会拼成精灵图
    Cancelled { partial: Option<(PathBuf, usize)> },
}

/// 角色动画流水线
///
/// 对每个动画：加载姿态序列 → 插值到目标帧数 → 逐帧渲染引导图并调用后端生成 → 拼成精灵图。
/// 单帧失败只会让精灵图少一帧，不会中断整个动画。
pub struct CharacterPipeline<'a> {
    backend: &'a dyn GenerationBackend,
    config: &'a AppConfig,
    poses: &'a PoseLibrary,
    cancel: CancelFlag,
}

impl<'a> CharacterPipeline<'a> {
    pub fn new(backend: &'a dyn GenerationBackend, config: &'a AppConfig, poses: &'a PoseLibrary) -> Self {
        Self {
            backend,
            config,
            poses,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// 为角色生成精灵图，返回 动画 id → 精灵图路径
    ///
    /// `subset` 为空时处理角色的全部动画。取消时返回已完成动画的结果，
    /// 进行到一半的动画用已生成的帧拼成较短的精灵图。
    /// 单帧的结果文件缺失或后端报出不可跳过的错误时只放弃当前动画，
    /// 只有后端未连接才会让整个调用失败。
    pub async fn generate(
        &self,
        character: &Character,
        scene: &Scene,
        output_dir: impl AsRef<Path>,
        subset: Option<&[String]>,
    ) -> ForgeResult<BTreeMap<String, PathBuf>> {
        let output_dir = output_dir.as_ref();
        let total_start = Instant::now();

        let animations: Vec<&AnimationDef> = match subset {
            Some(ids) => {
                for id in ids {
                    if character.animation(id).is_none() {
                        warn!("⚠️  [角色动画] 角色 '{}' 没有动画 '{}'，忽略", character.name, id);
                    }
                }
                character.animations.iter().filter(|a| ids.contains(&a.id)).collect()
            }
            None => character.animations.iter().collect(),
        };

        info!("🎬 [角色动画] 开始生成角色 '{}' 的 {} 个动画 (后端: {})",
            character.name, animations.len(), self.backend.name());
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        std::fs::create_dir_all(output_dir)?;

        let mut results = BTreeMap::new();
        let mut timings: Vec<(String, Duration)> = Vec::new();

        for anim in animations {
            if self.cancel.is_cancelled() {
                warn!("⚠️  [角色动画] 已取消，剩余动画不再生成");
                break;
            }

            let anim_start = Instant::now();
            let outcome = self.generate_animation(character, scene, anim, output_dir).await?;
            let elapsed = anim_start.elapsed();

            match outcome {
                AnimationOutcome::Sheet { path, frames } => {
                    info!("✅ [角色动画] '{}' 完成 ({}/{} 帧)，耗时: {:.2}秒",
                        anim.id, frames, anim.frame_count, elapsed.as_secs_f64());
                    info!("  • 精灵图: {}", path.display());
                    results.insert(anim.id.clone(), path);
                    timings.push((anim.id.clone(), elapsed));
                }
                AnimationOutcome::Skipped => {}
                AnimationOutcome::Aborted(e) => {
                    error!("❌ [角色动画] '{}' 已放弃: {}", anim.id, e);
                }
                AnimationOutcome::Cancelled { partial } => {
                    match partial {
                        Some((path, frames)) => {
                            warn!("⚠️  [角色动画] '{}' 在生成过程中被取消，保留已完成的 {}/{} 帧",
                                anim.id, frames, anim.frame_count);
                            results.insert(anim.id.clone(), path);
                            timings.push((anim.id.clone(), elapsed));
                        }
                        None => warn!("⚠️  [角色动画] '{}' 在第一帧完成前被取消", anim.id),
                    }
                    break;
                }
            }
        }

        let total = total_start.elapsed();
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("🎉 [角色动画] 处理完成！总耗时: {:.2}秒 ({:.0}ms)", total.as_secs_f64(), total.as_millis());
        if !timings.is_empty() {
            info!("📊 [角色动画] 性能统计:");
            for (id, d) in &timings {
                let percent = d.as_secs_f64() / total.as_secs_f64().max(f64::EPSILON) * 100.0;
                info!("   • {}: {:.2}秒 ({:.1}%)", id, d.as_secs_f64(), percent);
            }
        }
        info!("📁 [角色动画] 输出目录: {}", output_dir.display());
        info!("🖼️  [角色动画] 精灵图数量: {}", results.len());

        Ok(results)
    }

    async fn generate_animation(
        &self,
        character: &Character,
        scene: &Scene,
        anim: &AnimationDef,
        output_dir: &Path,
    ) -> ForgeResult<AnimationOutcome> {
        info!("⏳ [角色动画] 正在生成 '{}' ({} 帧)...", anim.id, anim.frame_count);

        let sequence = match self.poses.load(&anim.pose_sequence) {
            Ok(seq) => seq,
            Err(ForgeError::PoseNotFound(name)) => {
                warn!("⚠️  [角色动画] 找不到姿态序列 '{}'，跳过动画 '{}'", name, anim.id);
                return Ok(AnimationOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let keyframes = interpolate_poses(&sequence, anim.frame_count as usize)?;

        let zone = scene.zone(&anim.zone_id);
        let prompt = build_character_prompt(character, anim, zone);
        let negative = build_negative_prompt(character);

        let gen = &self.config.generation;
        let render_options = RenderOptions::sized(gen.width, gen.height);
        let identity = character
            .reference_images
            .first()
            .filter(|p| p.exists())
            .map(|p| IdentityReference {
                image: p.clone(),
                model: self.config.models.ip_adapter.clone(),
                weight: character.ip_adapter_weight,
            });

        // 离开作用域（包括错误返回）时自动清理
        let scratch = ScratchDir::new(&format!("frames-{}", anim.id))?;
        let mut frame_paths = Vec::with_capacity(keyframes.len());
        let mut cancelled = false;

        for (idx, keypoints) in keyframes.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let guide_path = render_pose_image(keypoints, scratch.join(format!("pose_{:03}.png", idx)), &render_options)?;

            let request = GenerationRequest {
                prompt: prompt.clone(),
                negative_prompt: negative.clone(),
                width: gen.width,
                height: gen.height,
                steps: gen.steps,
                cfg_scale: gen.cfg_scale,
                sampler: gen.sampler.clone(),
                scheduler: gen.scheduler.clone(),
                seed: gen.seed,
                batch_size: 1,
                pose_guide: Some(PoseGuide {
                    image: guide_path,
                    model: self.config.models.controlnet_openpose.clone(),
                    strength: POSE_GUIDE_STRENGTH,
                }),
                identity: identity.clone(),
                ..GenerationRequest::default()
            };

            let result = match self.backend.generate(&request, None).await {
                Ok(result) => result,
                // 后端未连接时后续所有帧都会失败
                Err(e @ ForgeError::NotConnected(_)) => return Err(e),
                Err(e) if e.is_recoverable_frame_error() => {
                    warn!("⚠️  [角色动画] '{}' 第 {} 帧生成失败，跳过: {}", anim.id, idx, e);
                    continue;
                }
                Err(e) => {
                    error!("❌ [角色动画] '{}' 第 {} 帧生成失败: {}", anim.id, idx, e);
                    return Ok(AnimationOutcome::Aborted(e));
                }
            };

            let Some(first) = result.images.first() else {
                warn!("⚠️  [角色动画] '{}' 第 {} 帧没有返回图片", anim.id, idx);
                continue;
            };

            let frame_path = scratch.join(format!("frame_{:03}.png", idx));
            if let Err(e) = tokio::fs::copy(first, &frame_path).await {
                warn!("⚠️  [角色动画] '{}' 第 {} 帧的结果文件不可用，跳过: {} - {}",
                    anim.id, idx, first.display(), e);
                continue;
            }
            debug!("[角色动画] 帧 {}/{} (seed={})", idx + 1, keyframes.len(), result.seed);
            frame_paths.push(frame_path);
        }

        if frame_paths.is_empty() {
            if cancelled {
                return Ok(AnimationOutcome::Cancelled { partial: None });
            }
            warn!("⚠️  [角色动画] '{}' 没有任何成功的帧，不生成精灵图", anim.id);
            return Ok(AnimationOutcome::Skipped);
        }

        let sheet_path = output_dir.join(format!("{}_{}.png", character.name, anim.id));
        assemble_sprite_sheet(&frame_paths, &sheet_path, (gen.width, gen.height), Direction::Horizontal, 0)?;

        let frames = frame_paths.len();
        if cancelled {
            return Ok(AnimationOutcome::Cancelled {
                partial: Some((sheet_path, frames)),
            });
        }
        Ok(AnimationOutcome::Sheet { path: sheet_path, frames })
    }
}

/// 把生成结果写回角色的动画定义，返回更新的动画数
pub fn apply_sprite_sheets(character: &mut Character, sheets: &BTreeMap<String, PathBuf>) -> usize {
    let mut updated = 0;
    for anim in &mut character.animations {
        if let Some(path) = sheets.get(&anim.id) {
            anim.sprite_sheet = Some(path.clone());
            updated += 1;
        }
    }
    updated
}
