use clap::{Parser, Subcommand};
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use animeforge::{
    apply_sprite_sheets, create_backend, generate_scene_backgrounds, AnimationDef, AppConfig, BackendKind,
    generate_effect_sprites, CancelFlag, Character, CharacterPipeline, CliOverrides, ConfigLoader, EffectKind,
    EffectOptions, GenerationBackend, GenerationRequest, PoseLibrary, Project, ProgressCallback, Scene, TimeOfDay, Weather,
};

/// AnimeForge - 生成 lo-fi 风格的循环动画场景
#[derive(Parser, Debug)]
#[command(name = "animeforge")]
#[command(about = "AnimeForge：角色动画精灵图与场景背景生成工具", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别（trace, debug, info, warn, error）
    /// 可通过环境变量 ANIMEFORGE_LOG_LEVEL 或配置文件 [logging] level 设置
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 创建新项目（默认场景 + 默认角色）
    Create {
        /// 项目名称
        name: String,

        /// 项目目录（默认为 projects_dir/<name>）
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// 生成单张图片
    Generate {
        /// 提示词
        prompt: String,

        /// 负面提示词
        #[arg(short, long, default_value = "")]
        negative: String,

        /// 图片宽度
        #[arg(short = 'W', long)]
        width: Option<u32>,

        /// 图片高度
        #[arg(short = 'H', long)]
        height: Option<u32>,

        /// 采样步数
        #[arg(short, long)]
        steps: Option<u32>,

        /// 输出目录
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 后端：comfyui, fal, mock
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },
    /// 检查后端连接并列出可用模型
    Check {
        /// 后端：comfyui, fal, mock
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },
    /// 为项目中的角色生成动画精灵图，并写回项目文件
    Animate {
        /// 项目目录或 project.json 路径
        project: PathBuf,

        /// 精灵图输出目录（默认为 output_dir/characters）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 后端：comfyui, fal, mock
        #[arg(short, long)]
        backend: Option<BackendKind>,

        /// 只生成指定的动画 id（逗号分隔）
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },
    /// 为项目场景生成各时段背景
    Backgrounds {
        /// 项目目录或 project.json 路径
        project: PathBuf,

        /// 输出目录（默认为 output_dir/backgrounds）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 后端：comfyui, fal, mock
        #[arg(short, long)]
        backend: Option<BackendKind>,

        /// 时段（逗号分隔：dawn, day, sunset, night），默认全部
        #[arg(long, value_delimiter = ',')]
        times: Vec<TimeOfDay>,

        /// 天气（默认使用场景的 default_weather）
        #[arg(long)]
        weather: Option<Weather>,
    },
    /// 生成天气粒子特效精灵条（雨、雪、落叶）
    Effects {
        /// 输出目录（默认为 output_dir/effects）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 特效（逗号分隔：rain, snow, leaves），默认全部
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<EffectKind>,

        /// 项目目录或 project.json 路径，按场景天气与季节选择特效
        #[arg(short, long, conflicts_with = "kinds")]
        project: Option<PathBuf>,

        /// 每条精灵条的帧数
        #[arg(short, long, default_value_t = 8)]
        frames: u32,

        /// 单帧边长（像素）
        #[arg(short, long, default_value_t = 128)]
        size: u32,

        /// 随机种子（默认每种特效使用固定种子）
        #[arg(long)]
        seed: Option<u64>,
    },
    /// 列出可用的姿态序列
    Poses,
    /// 写入默认配置文件
    InitConfig {
        /// 配置文件路径
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let overrides = CliOverrides {
        log_level: args.log_level.clone(),
        ..CliOverrides::default()
    };
    let config = ConfigLoader::load_config(args.config.as_deref(), &overrides)
        .context("加载配置失败")?;

    // 初始化日志：RUST_LOG 优先，其次使用配置中的级别
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Commands::Create { name, dir } => {
            let project_dir = dir.unwrap_or_else(|| config.projects_dir.join(&name));
            let mut character = Character::new("Character", "anime character");
            character.animations.push(AnimationDef::new("idle", "idle", "main", "idle"));

            let mut project = Project::new(&name, Scene::new(format!("{}-scene", name)));
            project.character = Some(character);
            project.project_dir = Some(project_dir);

            let save_path = project.save(None).context("保存项目失败")?;
            println!("已创建项目 '{}': {}", name, save_path.display());
        }
        Commands::Generate {
            prompt,
            negative,
            width,
            height,
            steps,
            output,
            backend,
        } => {
            let gen = &config.generation;
            let request = GenerationRequest {
                prompt,
                negative_prompt: negative,
                width: width.unwrap_or(gen.width),
                height: height.unwrap_or(gen.height),
                steps: steps.unwrap_or(gen.steps),
                cfg_scale: gen.cfg_scale,
                sampler: gen.sampler.clone(),
                scheduler: gen.scheduler.clone(),
                seed: gen.seed,
                batch_size: gen.batch_size,
                ..GenerationRequest::default()
            };

            let mut backend = connect_with_fallback(&config, backend.unwrap_or(config.backend), output).await?;
            let progress: &ProgressCallback = &|step, total, status| {
                if total > 0 {
                    println!("[{}/{}] {}", step, total, status);
                } else {
                    println!("[...] {}", status);
                }
            };
            let outcome = backend.generate(&request, Some(progress)).await;
            disconnect(&mut backend).await;

            let result = outcome.context("生成图片失败")?;
            println!("种子: {}", result.seed);
            for image in &result.images {
                println!("已生成: {}", image.display());
            }
        }
        Commands::Check { backend } => {
            let kind = backend.unwrap_or(config.backend);
            let mut backend = connect_backend(&config, kind, None).await?;
            let available = backend.is_available().await;
            let models = if available { Some(backend.get_models().await) } else { None };
            disconnect(&mut backend).await;

            if !available {
                anyhow::bail!("{} 后端不可用", kind);
            }
            println!("✅ {} 后端可用", kind);
            match models {
                Some(Ok(models)) => {
                    println!("可用模型 ({}):", models.len());
                    for m in models {
                        println!("  • {}", m);
                    }
                }
                Some(Err(e)) => println!("⚠️  获取模型列表失败: {}", e),
                None => {}
            }
        }
        Commands::Animate {
            project: project_path,
            output,
            backend,
            only,
        } => {
            let mut project = Project::load(&project_path)
                .with_context(|| format!("加载项目失败: {}", project_path.display()))?;
            let Some(mut character) = project.character.clone() else {
                anyhow::bail!("项目 '{}' 没有角色", project.name);
            };
            let output_dir = output.unwrap_or_else(|| config.output_dir.join("characters"));
            let poses = pose_library(&config);

            let cancel = CancelFlag::new();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("⚠️  收到 Ctrl-C，完成当前帧后停止...");
                    watcher.cancel();
                }
            });

            let mut backend = connect_with_fallback(&config, backend.unwrap_or(config.backend), None).await?;
            let subset = (!only.is_empty()).then_some(only.as_slice());
            let outcome = CharacterPipeline::new(backend.as_ref(), &config, &poses)
                .with_cancel(cancel.clone())
                .generate(&character, &project.scene, &output_dir, subset)
                .await;
            disconnect(&mut backend).await;

            let sheets = outcome.context("生成角色动画失败")?;
            let updated = apply_sprite_sheets(&mut character, &sheets);
            project.character = Some(character);
            let saved = project.save(Some(project_path.as_path())).context("保存项目失败")?;

            for (id, path) in &sheets {
                println!("{}: {}", id, path.display());
            }
            println!("已更新 {} 个动画，项目已保存: {}", updated, saved.display());
            if cancel.is_cancelled() {
                println!("⚠️  生成被中断，被中断的动画只保留了已完成的帧");
            }
        }
        Commands::Backgrounds {
            project: project_path,
            output,
            backend,
            times,
            weather,
        } => {
            let project = Project::load(&project_path)
                .with_context(|| format!("加载项目失败: {}", project_path.display()))?;
            let output_dir = output.unwrap_or_else(|| config.output_dir.join("backgrounds"));
            let weather = weather.unwrap_or(project.scene.default_weather);
            let times = (!times.is_empty()).then_some(times.as_slice());

            let mut backend = connect_with_fallback(&config, backend.unwrap_or(config.backend), None).await?;
            let outcome =
                generate_scene_backgrounds(&project.scene, backend.as_ref(), &config, &output_dir, times, weather).await;
            disconnect(&mut backend).await;

            for (time, path) in outcome.context("生成场景背景失败")? {
                println!("{}: {}", time, path.display());
            }
        }
        Commands::Effects {
            output,
            kinds,
            project,
            frames,
            size,
            seed,
        } => {
            let kinds = match project {
                Some(project_path) => {
                    let project = Project::load(&project_path)
                        .with_context(|| format!("加载项目失败: {}", project_path.display()))?;
                    EffectKind::for_conditions(project.scene.default_weather, project.scene.default_season)
                }
                None if kinds.is_empty() => EffectKind::ALL.to_vec(),
                None => kinds,
            };
            if kinds.is_empty() {
                println!("场景天气与季节不需要粒子特效");
            }
            let output_dir = output.unwrap_or_else(|| config.output_dir.join("effects"));
            let options = EffectOptions {
                frame_count: frames,
                frame_width: size,
                frame_height: size,
                seed,
            };
            for kind in kinds {
                let path = generate_effect_sprites(kind, &output_dir, &options)
                    .with_context(|| format!("生成 {} 特效失败", kind))?;
                println!("{}: {}", kind, path.display());
            }
        }
        Commands::Poses => {
            let poses = pose_library(&config);
            for name in poses.available() {
                match poses.load(&name) {
                    Ok(seq) => println!("{} ({} 帧{})", name, seq.frames.len(), if seq.looping { ", 循环" } else { "" }),
                    Err(e) => println!("{} (无效: {})", name, e),
                }
            }
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)?;
            println!("已写入默认配置: {}", path.display());
        }
    }

    Ok(())
}

fn pose_library(config: &AppConfig) -> PoseLibrary {
    match &config.poses_dir {
        Some(dir) => PoseLibrary::with_dir(dir),
        None => PoseLibrary::builtin(),
    }
}

async fn connect_backend(
    config: &AppConfig,
    kind: BackendKind,
    output_dir: Option<PathBuf>,
) -> Result<Box<dyn GenerationBackend>> {
    let mut backend = create_backend(config, kind, output_dir);
    backend
        .connect()
        .await
        .with_context(|| format!("连接 {} 后端失败", kind))?;
    Ok(backend)
}

/// 连接后端；探测不可用时断开并回退到 Mock 后端
async fn connect_with_fallback(
    config: &AppConfig,
    kind: BackendKind,
    output_dir: Option<PathBuf>,
) -> Result<Box<dyn GenerationBackend>> {
    let mut backend = connect_backend(config, kind, output_dir.clone()).await?;
    if kind == BackendKind::Mock || backend.is_available().await {
        return Ok(backend);
    }
    tracing::warn!("⚠️  {} 后端不可用，回退到 mock 后端", kind);
    disconnect(&mut backend).await;
    connect_backend(config, BackendKind::Mock, output_dir).await
}

async fn disconnect(backend: &mut Box<dyn GenerationBackend>) {
    if let Err(e) = backend.disconnect().await {
        tracing::warn!("⚠️  断开 {} 后端失败: {}", backend.name(), e);
    }
}
