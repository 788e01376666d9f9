//! 提示词构建：质量标签 + 角色/场景描述 + 时段/天气/季节修饰

use crate::models::{AnimationDef, Character, Scene, Season, TimeOfDay, Weather, Zone};

pub const QUALITY_POSITIVE: &str = "masterpiece, best quality, anime style, highly detailed, \
clean lineart, vibrant colours, professional illustration";

pub const QUALITY_NEGATIVE: &str = "worst quality, low quality, blurry, watermark, text, logo, signature, \
jpeg artifacts, deformed, bad anatomy, extra limbs, disfigured, \
3d render, photograph, realistic, poorly drawn";

/// 场景背景固定使用的负面提示词
pub const SCENE_NEGATIVE: &str = "low quality, blurry, watermark, text, logo, 3d render, photograph, realistic";

pub fn time_modifier(time: TimeOfDay) -> &'static str {
    match time {
        TimeOfDay::Dawn => "early morning, pink sky, soft light, gentle dawn glow",
        TimeOfDay::Day => "bright daylight, clear sky, vivid colours",
        TimeOfDay::Sunset => "golden hour, orange sky, warm light, long shadows",
        TimeOfDay::Night => "nighttime, moonlight, dark sky, city lights, cool tones",
    }
}

pub fn weather_modifier(weather: Weather) -> &'static str {
    match weather {
        Weather::Clear => "clear weather",
        Weather::Rain => "rainy, wet surfaces, overcast",
        Weather::Snow => "snowing, frost, cold atmosphere",
        Weather::Fog => "foggy, misty, low visibility, soft edges",
        Weather::Sun => "bright sunshine, lens flare, warm tones",
    }
}

pub fn season_modifier(season: Season) -> &'static str {
    match season {
        Season::Spring => "spring, cherry blossoms, fresh green leaves",
        Season::Summer => "summer, lush greenery, warm atmosphere",
        Season::Fall => "autumn, orange and red leaves, warm tones",
        Season::Winter => "winter, bare trees, cold blue tones, frost",
    }
}

fn join_parts(parts: Vec<String>) -> String {
    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// 场景背景提示词；图层 id 中的下划线换成空格后追加
pub fn build_scene_prompt(scene: &Scene, time: TimeOfDay, weather: Weather, season: Season) -> String {
    let desc = if scene.description.is_empty() {
        &scene.name
    } else {
        &scene.description
    };

    let mut parts = vec![
        QUALITY_POSITIVE.to_string(),
        format!("anime background, {}", desc),
        time_modifier(time).to_string(),
        weather_modifier(weather).to_string(),
        season_modifier(season).to_string(),
    ];
    parts.extend(scene.layers.iter().map(|l| l.id.replace('_', " ")));
    join_parts(parts)
}

/// 单帧角色动画的提示词
pub fn build_character_prompt(character: &Character, animation: &AnimationDef, zone: Option<&Zone>) -> String {
    let mut parts = vec![
        QUALITY_POSITIVE.to_string(),
        format!("anime character, {}", character.name),
        character.description.clone(),
        format!("{} pose", animation.name),
    ];
    if let Some(zone) = zone {
        parts.push(format!("in {}", zone.name));
    }
    parts.push("simple background, transparent background".to_string());
    join_parts(parts)
}

pub fn build_negative_prompt(character: &Character) -> String {
    join_parts(vec![QUALITY_NEGATIVE.to_string(), character.negative_prompt.clone()])
}
