mod common;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use async_trait::async_trait;
use animeforge::{
    AnimationDef, AppConfig, CancelFlag, Character, CharacterPipeline, ForgeError, ForgeResult, GenerationBackend,
    GenerationRequest, GenerationResult, PoseLibrary, ProgressCallback, Scene,
};
use common::{png_bytes, small_config, temp_dir};

/// 每次 `generate` 的预设结果
#[derive(Debug, Clone)]
enum Step {
    Image,
    Empty,
    Timeout,
    Offline,
    /// 返回一个不存在的文件路径
    MissingFile,
    /// 读取条件图片失败之类的本地 I/O 错误
    LocalIo,
}

/// 按脚本依次返回结果的后端；脚本用完后一律返回正常图片
struct ScriptedBackend {
    image: PathBuf,
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    cancel_after: Option<(usize, CancelFlag)>,
}

impl ScriptedBackend {
    fn new(dir: &std::path::Path, script: &[Step]) -> Self {
        let image = dir.join("result_frame.png");
        std::fs::write(&image, png_bytes(64, 64, [90, 160, 220])).unwrap();
        Self {
            image,
            script: Mutex::new(script.iter().cloned().collect()),
            calls: AtomicUsize::new(0),
            cancel_after: None,
        }
    }

    /// 第 `calls` 次调用返回后触发取消
    fn cancelling_after(mut self, calls: usize, flag: CancelFlag) -> Self {
        self.cancel_after = Some((calls, flag));
        self
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&mut self) -> ForgeResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> ForgeResult<()> {
        Ok(())
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _progress: Option<&ProgressCallback>,
    ) -> ForgeResult<GenerationResult> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, flag)) = &self.cancel_after {
            if calls >= *after {
                flag.cancel();
            }
        }

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Image);
        let images = match step {
            Step::Image => vec![self.image.clone()],
            Step::Empty => Vec::new(),
            Step::MissingFile => vec![PathBuf::from("/nonexistent/result_frame.png")],
            Step::Timeout => {
                return Err(ForgeError::Timeout {
                    job: format!("job-{}", calls),
                    seconds: 600,
                })
            }
            Step::Offline => return Err(ForgeError::Connectivity("connection refused".to_string())),
            Step::LocalIo => {
                return Err(ForgeError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "guide image vanished",
                )))
            }
        };
        Ok(GenerationResult {
            images,
            seed: 1,
            prompt: request.prompt.clone(),
            metadata: Default::default(),
        })
    }

    async fn get_models(&self) -> ForgeResult<Vec<String>> {
        Ok(vec!["scripted".to_string()])
    }
}

fn anim(id: &str, frames: u32) -> AnimationDef {
    let mut anim = AnimationDef::new(id, id, "desk", "idle");
    anim.frame_count = frames;
    anim
}

fn character(animations: Vec<AnimationDef>) -> Character {
    let mut character = Character::new("Mika", "");
    character.animations = animations;
    character
}

async fn run(
    backend: &ScriptedBackend,
    config: &AppConfig,
    character: &Character,
    out: &std::path::Path,
    cancel: Option<CancelFlag>,
) -> ForgeResult<std::collections::BTreeMap<String, PathBuf>> {
    let poses = PoseLibrary::builtin();
    let mut pipeline = CharacterPipeline::new(backend, config, &poses);
    if let Some(flag) = cancel {
        pipeline = pipeline.with_cancel(flag);
    }
    pipeline.generate(character, &Scene::new("room"), out.join("sheets"), None).await
}

fn sheet_width(path: &std::path::Path) -> u32 {
    image::open(path).unwrap().width()
}

fn scratch_dirs_for(anim_id: &str) -> usize {
    let prefix = format!("frames-{}", anim_id);
    std::fs::read_dir(std::env::temp_dir().join("animeforge"))
        .map(|rd| {
            rd.flatten()
                .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn empty_and_timed_out_frames_shorten_the_sheet() {
    let out = temp_dir("short-sheet");
    let config = small_config(&out);
    let backend = ScriptedBackend::new(&out, &[Step::Image, Step::Empty, Step::Timeout, Step::Image]);

    let sheets = run(&backend, &config, &character(vec![anim("walk", 4)]), &out, None).await.unwrap();

    assert_eq!(sheet_width(&sheets["walk"]), 2 * 64);
}

#[tokio::test]
async fn animation_without_any_frame_has_no_entry() {
    let out = temp_dir("all-failed");
    let config = small_config(&out);
    let anim_id = format!("lost_{}", uuid::Uuid::new_v4().simple());
    let backend = ScriptedBackend::new(&out, &[Step::Empty, Step::Offline, Step::Image]);

    let sheets = run(&backend, &config, &character(vec![anim(&anim_id, 2), anim("next", 1)]), &out, None)
        .await
        .unwrap();

    assert!(!sheets.contains_key(&anim_id));
    assert!(sheets.contains_key("next"));
    assert!(!out.join("sheets").join(format!("Mika_{}.png", anim_id)).exists());
    assert_eq!(scratch_dirs_for(&anim_id), 0);
}

#[tokio::test]
async fn missing_result_file_keeps_finished_animations() {
    let out = temp_dir("missing-file");
    let config = small_config(&out);
    let backend = ScriptedBackend::new(
        &out,
        &[Step::Image, Step::Image, Step::MissingFile, Step::MissingFile],
    );

    let sheets = run(&backend, &config, &character(vec![anim("a", 2), anim("b", 2)]), &out, None)
        .await
        .unwrap();

    assert_eq!(sheets.keys().collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(sheet_width(&sheets["a"]), 2 * 64);
}

#[tokio::test]
async fn missing_file_on_one_frame_drops_only_that_frame() {
    let out = temp_dir("missing-one");
    let config = small_config(&out);
    let backend = ScriptedBackend::new(&out, &[Step::MissingFile, Step::Image, Step::Image]);

    let sheets = run(&backend, &config, &character(vec![anim("sip", 3)]), &out, None).await.unwrap();

    assert_eq!(sheet_width(&sheets["sip"]), 2 * 64);
}

#[tokio::test]
async fn local_error_abandons_animation_and_continues() {
    let out = temp_dir("local-io");
    let config = small_config(&out);
    let failed_id = format!("broken_{}", uuid::Uuid::new_v4().simple());
    let backend = ScriptedBackend::new(&out, &[Step::Image, Step::Image, Step::Image, Step::LocalIo]);

    let sheets = run(
        &backend,
        &config,
        &character(vec![anim("a", 2), anim(&failed_id, 3), anim("c", 1)]),
        &out,
        None,
    )
    .await
    .unwrap();

    assert_eq!(sheets.keys().cloned().collect::<Vec<_>>(), vec!["a".to_string(), "c".to_string()]);
    assert_eq!(scratch_dirs_for(&failed_id), 0);
    // 第二帧出错后不再为该动画请求第三帧
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2 + 2 + 1);
}

#[tokio::test]
async fn cancel_mid_animation_keeps_frames_so_far() {
    let out = temp_dir("cancel-mid");
    let config = small_config(&out);
    let cancel = CancelFlag::new();
    let backend = ScriptedBackend::new(&out, &[]).cancelling_after(2, cancel.clone());

    let sheets = run(
        &backend,
        &config,
        &character(vec![anim("idle", 4), anim("after", 2)]),
        &out,
        Some(cancel),
    )
    .await
    .unwrap();

    assert_eq!(sheets.keys().collect::<Vec<_>>(), vec!["idle"]);
    assert_eq!(sheet_width(&sheets["idle"]), 2 * 64);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
}
