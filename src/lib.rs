pub mod error;
pub mod config;
pub mod models;
pub mod pose;
pub mod pose_loader;
pub mod pose_interpolator;
pub mod pose_renderer;
pub mod raster;
pub mod prompt;
pub mod backend;
pub mod comfyui_backend;
pub mod fal_backend;
pub mod mock_backend;
pub mod scratch;
pub mod sprite_assembler;
pub mod character_pipeline;
pub mod scene_pipeline;
pub mod effect_sprites;

pub use error::{ForgeError, ForgeResult};
pub use config::{AppConfig, BackendKind, CliOverrides, ConfigLoader};
pub use models::{AnimationDef, Character, Layer, Project, Rect, Scene, Season, TimeOfDay, Weather, Zone};
pub use pose::{Joint, Keypoint, PoseFrame, PoseKeypoints, PoseSequence};
pub use pose_loader::PoseLibrary;
pub use pose_interpolator::interpolate_poses;
pub use pose_renderer::{render_pose_image, RenderOptions};
pub use backend::{
    create_backend, GenerationBackend, GenerationRequest, GenerationResult, IdentityReference, InitImage,
    PoseGuide, ProgressCallback,
};
pub use comfyui_backend::ComfyUiBackend;
pub use fal_backend::FalBackend;
pub use mock_backend::MockBackend;
pub use sprite_assembler::{assemble_sprite_sheet, optimize_image, Direction, OutputFormat};
pub use character_pipeline::{apply_sprite_sheets, CancelFlag, CharacterPipeline};
pub use scene_pipeline::generate_scene_backgrounds;
pub use effect_sprites::{generate_effect_sprites, render_effect_strip, EffectKind, EffectOptions};
