use std::fmt;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::{ForgeError, ForgeResult};

/// 一天中的时段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Dawn,
    #[default]
    Day,
    Sunset,
    Night,
}

impl TimeOfDay {
    pub const ALL: [TimeOfDay; 4] = [Self::Dawn, Self::Day, Self::Sunset, Self::Night];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dawn => "dawn",
            Self::Day => "day",
            Self::Sunset => "sunset",
            Self::Night => "night",
        }
    }
}

/// 天气
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Weather {
    #[default]
    Clear,
    Rain,
    Snow,
    Fog,
    Sun,
}

impl Weather {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Rain => "rain",
            Self::Snow => "snow",
            Self::Fog => "fog",
            Self::Sun => "sun",
        }
    }
}

/// 季节
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    Spring,
    #[default]
    Summer,
    Fall,
    Winter,
}

impl Season {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spring => "spring",
            Self::Summer => "summer",
            Self::Fall => "fall",
            Self::Winter => "winter",
        }
    }
}

macro_rules! impl_enum_text {
    ($ty:ty, $label:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = ForgeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                serde_json::from_value(serde_json::Value::from(s.trim().to_lowercase()))
                    .map_err(|_| ForgeError::invalid_input(format!("未知的{}: {}", $label, s)))
            }
        }
    };
}

impl_enum_text!(TimeOfDay, "时段");
impl_enum_text!(Weather, "天气");
impl_enum_text!(Season, "季节");

/// 场景坐标系中的矩形
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// 场景图层（背景 / 中景 / 前景）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    pub z_index: i32,
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub parallax_factor: f64,
}

fn default_opacity() -> f64 {
    1.0
}

/// 场景中可以播放动画的区域
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub bounds: Rect,
    pub z_index: i32,
    #[serde(default)]
    pub character_animations: Vec<String>,
    #[serde(default)]
    pub ambient_animation: Option<String>,
    #[serde(default = "default_true")]
    pub interactive: bool,
}

fn default_true() -> bool {
    true
}

/// 场景定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_scene_width")]
    pub width: u32,
    #[serde(default = "default_scene_height")]
    pub height: u32,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub default_time: TimeOfDay,
    #[serde(default)]
    pub default_weather: Weather,
    #[serde(default)]
    pub default_season: Season,
}

fn default_scene_width() -> u32 {
    1920
}

fn default_scene_height() -> u32 {
    1080
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            width: default_scene_width(),
            height: default_scene_height(),
            layers: Vec::new(),
            zones: Vec::new(),
            default_time: TimeOfDay::default(),
            default_weather: Weather::default(),
            default_season: Season::default(),
        }
    }

    pub fn zone(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    /// z_index 最小的图层
    pub fn base_layer(&self) -> Option<&Layer> {
        self.layers.iter().min_by_key(|l| l.z_index)
    }
}

/// 角色的一个动画状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationDef {
    pub id: String,
    pub name: String,
    pub zone_id: String,
    /// 对应 poses/*.json 的名称
    pub pose_sequence: String,
    #[serde(default = "default_frame_count")]
    pub frame_count: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(rename = "loop", default = "default_true")]
    pub looping: bool,
    #[serde(default)]
    pub sprite_sheet: Option<PathBuf>,
}

fn default_frame_count() -> u32 {
    8
}

fn default_fps() -> u32 {
    12
}

impl AnimationDef {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        zone_id: impl Into<String>,
        pose_sequence: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            zone_id: zone_id.into(),
            pose_sequence: pose_sequence.into(),
            frame_count: default_frame_count(),
            fps: default_fps(),
            looping: true,
            sprite_sheet: None,
        }
    }

    fn validate(&self) -> ForgeResult<()> {
        if self.frame_count == 0 {
            return Err(ForgeError::invalid_input(format!("动画 '{}' 的 frame_count 必须为正数", self.id)));
        }
        if self.fps == 0 {
            return Err(ForgeError::invalid_input(format!("动画 '{}' 的 fps 必须为正数", self.id)));
        }
        Ok(())
    }
}

/// 可以放入场景的角色
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub reference_images: Vec<PathBuf>,
    #[serde(default = "default_ip_adapter_weight")]
    pub ip_adapter_weight: f32,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default)]
    pub animations: Vec<AnimationDef>,
    #[serde(default = "default_animation")]
    pub default_animation: String,
}

fn default_ip_adapter_weight() -> f32 {
    0.75
}

fn default_animation() -> String {
    "idle".to_string()
}

impl Character {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            reference_images: Vec::new(),
            ip_adapter_weight: default_ip_adapter_weight(),
            negative_prompt: String::new(),
            animations: Vec::new(),
            default_animation: default_animation(),
        }
    }

    pub fn animation(&self, id: &str) -> Option<&AnimationDef> {
        self.animations.iter().find(|a| a.id == id)
    }
}

/// 项目：场景 + 角色 + 元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub scene: Scene,
    #[serde(default)]
    pub character: Option<Character>,
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

pub const PROJECT_FILE: &str = "project.json";

impl Project {
    pub fn new(name: impl Into<String>, scene: Scene) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: default_version(),
            scene,
            character: None,
            project_dir: None,
        }
    }

    /// 保存为 JSON
    ///
    /// `path` 以 `.json` 结尾时直接写入该文件，否则写入 `<path>/project.json`。
    /// 未指定 `path` 时使用 `project_dir`。
    pub fn save(&self, path: Option<&Path>) -> ForgeResult<PathBuf> {
        let base = match path.or(self.project_dir.as_deref()) {
            Some(p) => p.to_path_buf(),
            None => {
                return Err(ForgeError::invalid_input("没有指定保存路径，且项目未设置 project_dir"));
            }
        };
        let save_path = if base.extension().and_then(|e| e.to_str()) == Some("json") {
            base
        } else {
            base.join(PROJECT_FILE)
        };

        crate::raster::ensure_parent(&save_path)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&save_path, json)?;
        Ok(save_path)
    }

    /// 从目录或 JSON 文件加载
    pub fn load(path: impl AsRef<Path>) -> ForgeResult<Self> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            path.join(PROJECT_FILE)
        } else {
            path.to_path_buf()
        };
        let text = std::fs::read_to_string(&file)?;
        let project: Project = serde_json::from_str(&text)?;
        project.validate()?;
        Ok(project)
    }

    fn validate(&self) -> ForgeResult<()> {
        if let Some(character) = &self.character {
            for anim in &character.animations {
                anim.validate()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_project() -> Project {
        let mut scene = Scene::new("Cozy Room");
        scene.description = "a cozy bedroom with a desk by the window".to_string();
        scene.layers.push(Layer {
            id: "room_back".to_string(),
            z_index: 0,
            image_path: None,
            opacity: 1.0,
            parallax_factor: 0.0,
        });
        scene.zones.push(Zone {
            id: "desk".to_string(),
            name: "desk".to_string(),
            bounds: Rect { x: 100.0, y: 200.0, width: 300.0, height: 200.0 },
            z_index: 1,
            character_animations: vec!["typing".to_string()],
            ambient_animation: None,
            interactive: true,
        });

        let mut character = Character::new("Mika", "girl with headphones and a hoodie");
        character.animations.push(AnimationDef::new("typing", "typing", "desk", "typing"));

        let mut project = Project::new("lofi", scene);
        project.character = Some(character);
        project
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir()
            .join("animeforge-tests")
            .join(format!("project-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn save_and_load_round_trip_via_directory() {
        let dir = temp_dir();
        let project = sample_project();
        let saved = project.save(Some(&dir)).unwrap();
        assert_eq!(saved, dir.join(PROJECT_FILE));

        let loaded = Project::load(&dir).unwrap();
        assert_eq!(loaded, project);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn save_requires_a_path() {
        let err = sample_project().save(None).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidInput(_)));
    }

    #[test]
    fn enums_serialize_lowercase_and_parse() {
        assert_eq!(serde_json::to_string(&TimeOfDay::Sunset).unwrap(), "\"sunset\"");
        assert_eq!("Night".parse::<TimeOfDay>().unwrap(), TimeOfDay::Night);
        assert_eq!("fog".parse::<Weather>().unwrap(), Weather::Fog);
        assert!("monsoon".parse::<Weather>().is_err());
        assert_eq!(Season::Fall.to_string(), "fall");
    }

    #[test]
    fn defaults_apply_when_fields_are_missing() {
        let anim: AnimationDef = serde_json::from_str(
            r#"{"id": "idle", "name": "idle", "zone_id": "desk", "pose_sequence": "idle"}"#,
        )
        .unwrap();
        assert_eq!((anim.frame_count, anim.fps, anim.looping), (8, 12, true));

        let character: Character = serde_json::from_str(r#"{"name": "Mika", "description": ""}"#).unwrap();
        assert_eq!(character.ip_adapter_weight, 0.75);
        assert_eq!(character.default_animation, "idle");
    }

    #[test]
    fn zero_frame_count_is_rejected_on_load() {
        let dir = temp_dir();
        let mut project = sample_project();
        if let Some(c) = project.character.as_mut() {
            c.animations[0].frame_count = 0;
        }
        let file = dir.join("broken.json");
        project.save(Some(&file)).unwrap();

        let err = Project::load(&file).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidInput(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
