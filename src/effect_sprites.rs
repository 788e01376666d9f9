use std::f32::consts::TAU;
use std::fmt;
use std::path::{Path, PathBuf};
use image::{DynamicImage, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use resvg::tiny_skia::{FillRule, LineCap, Paint, PathBuilder, Pixmap, PixmapPaint, Stroke, Transform};
use tracing::info;
use crate::error::{ForgeError, ForgeResult};
use crate::models::{Season, Weather};
use crate::raster;

const RAIN_DROPS: usize = 40;
const SNOW_FLAKES: usize = 30;
const FALLING_LEAVES: usize = 18;

/// 秋叶配色（RGBA）
const LEAF_COLOURS: [[u8; 4]; 5] = [
    [200, 80, 30, 200],
    [180, 50, 20, 190],
    [220, 160, 40, 200],
    [150, 100, 30, 180],
    [190, 60, 50, 195],
];

/// 天气 / 季节粒子特效
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Rain,
    Snow,
    Leaves,
}

impl EffectKind {
    pub const ALL: [EffectKind; 3] = [Self::Rain, Self::Snow, Self::Leaves];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rain => "rain",
            Self::Snow => "snow",
            Self::Leaves => "leaves",
        }
    }

    /// 未指定种子时使用的固定种子
    pub fn default_seed(&self) -> u64 {
        match self {
            Self::Rain => 42,
            Self::Snow => 123,
            Self::Leaves => 456,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Rain => "rain_sprites.png",
            Self::Snow => "snow_sprites.png",
            Self::Leaves => "leaf_sprites.png",
        }
    }

    /// 场景天气与季节对应的特效
    pub fn for_conditions(weather: Weather, season: Season) -> Vec<EffectKind> {
        let mut kinds = Vec::new();
        match weather {
            Weather::Rain => kinds.push(Self::Rain),
            Weather::Snow => kinds.push(Self::Snow),
            _ => {}
        }
        if season == Season::Fall {
            kinds.push(Self::Leaves);
        }
        kinds
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EffectKind {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rain" => Ok(Self::Rain),
            "snow" => Ok(Self::Snow),
            "leaf" | "leaves" => Ok(Self::Leaves),
            other => Err(ForgeError::invalid_input(format!("未知的特效: {}", other))),
        }
    }
}

/// 特效精灵条参数
#[derive(Debug, Clone, PartialEq)]
pub struct EffectOptions {
    pub frame_count: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    /// 为空时使用 `EffectKind::default_seed`
    pub seed: Option<u64>,
}

impl Default for EffectOptions {
    fn default() -> Self {
        Self {
            frame_count: 8,
            frame_width: 128,
            frame_height: 128,
            seed: None,
        }
    }
}

/// 生成特效精灵条并保存为 `<output_dir>/<kind>_sprites.png`
pub fn generate_effect_sprites(
    kind: EffectKind,
    output_dir: impl AsRef<Path>,
    options: &EffectOptions,
) -> ForgeResult<PathBuf> {
    let strip = render_effect_strip(kind, options)?;
    let out_path = output_dir.as_ref().join(kind.file_name());
    raster::save_png(&DynamicImage::ImageRgba8(strip), &out_path)?;
    info!(
        "✅ [特效] {} 精灵条: {} ({} 帧, {}x{})",
        kind,
        out_path.display(),
        options.frame_count,
        options.frame_width,
        options.frame_height
    );
    Ok(out_path)
}

/// 渲染单行透明背景的特效精灵条
///
/// 粒子位置只在开始时随机一次，之后逐帧平移，循环播放时首尾衔接。
/// 每帧单独绘制再贴入精灵条，粒子不会越过帧边界。
pub fn render_effect_strip(kind: EffectKind, options: &EffectOptions) -> ForgeResult<RgbaImage> {
    let EffectOptions {
        frame_count,
        frame_width: fw,
        frame_height: fh,
        ..
    } = *options;
    if frame_count == 0 || fw == 0 || fh == 0 {
        return Err(ForgeError::invalid_input(format!(
            "特效参数无效: {} 帧, {}x{}",
            frame_count, fw, fh
        )));
    }
    let strip_width = fw
        .checked_mul(frame_count)
        .filter(|w| i32::try_from(*w).is_ok())
        .ok_or_else(|| ForgeError::invalid_input(format!("特效精灵条过宽: {} 帧 x {} 像素", frame_count, fw)))?;

    let mut rng = StdRng::seed_from_u64(options.seed.unwrap_or_else(|| kind.default_seed()));
    let mut strip = raster::new_pixmap(strip_width, fh)?;
    let mut painter: Box<dyn FnMut(&mut Pixmap, u32, &mut StdRng)> = match kind {
        EffectKind::Rain => Box::new(rain_painter(&mut rng, fw, fh, frame_count)),
        EffectKind::Snow => Box::new(snow_painter(&mut rng, fw, fh)),
        EffectKind::Leaves => Box::new(leaf_painter(&mut rng, fw, fh)),
    };

    for idx in 0..frame_count {
        let mut frame = raster::new_pixmap(fw, fh)?;
        painter(&mut frame, idx, &mut rng);
        strip.draw_pixmap(
            (idx * fw) as i32,
            0,
            frame.as_ref(),
            &PixmapPaint::default(),
            Transform::identity(),
            None,
        );
    }

    raster::pixmap_to_rgba(&strip)
}

fn paint(rgba: [u8; 4]) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(rgba[0], rgba[1], rgba[2], rgba[3]);
    paint.anti_alias = true;
    paint
}

/// 略微向左倾斜的半透明雨线，每帧整体下移 `fh / frame_count`
fn rain_painter(rng: &mut StdRng, fw: u32, fh: u32, frame_count: u32) -> impl FnMut(&mut Pixmap, u32, &mut StdRng) {
    let drops: Vec<(u32, u32)> = (0..RAIN_DROPS)
        .map(|_| (rng.random_range(0..=fw), rng.random_range(0..=fh)))
        .collect();
    let stroke = Stroke {
        width: 1.0,
        line_cap: LineCap::Butt,
        ..Stroke::default()
    };

    move |frame, idx, rng| {
        let offset_y = idx * fh / frame_count;
        for &(x, dy) in &drops {
            let y = (dy + offset_y) % fh;
            let length = rng.random_range(8..=18u32);
            let alpha = rng.random_range(120..=220u8);

            let mut pb = PathBuilder::new();
            pb.move_to(x as f32, y as f32);
            pb.line_to(x as f32 - 2.0, (y + length) as f32);
            if let Some(path) = pb.finish() {
                frame.stroke_path(&path, &paint([200, 210, 255, alpha]), &stroke, Transform::identity(), None);
            }
        }
    }
}

struct Flake {
    x: f32,
    y: f32,
    radius: f32,
    drift: f32,
    fall_speed: f32,
}

/// 大小不一的白色雪花，缓慢飘落并左右漂移
fn snow_painter(rng: &mut StdRng, fw: u32, fh: u32) -> impl FnMut(&mut Pixmap, u32, &mut StdRng) {
    let (w, h) = (fw as f32, fh as f32);
    let flakes: Vec<Flake> = (0..SNOW_FLAKES)
        .map(|_| Flake {
            x: rng.random_range(0.0..w),
            y: rng.random_range(0.0..h),
            radius: rng.random_range(1.5..4.0),
            drift: rng.random_range(-0.5..0.5),
            fall_speed: rng.random_range(2.0..5.0),
        })
        .collect();

    move |frame, idx, rng| {
        let t = idx as f32;
        for flake in &flakes {
            let x = (flake.x + flake.drift * t).rem_euclid(w);
            let y = (flake.y + flake.fall_speed * t).rem_euclid(h);
            let alpha = (180 + rng.random_range(-30..=30i32)).clamp(0, 255) as u8;
            if let Some(circle) = PathBuilder::from_circle(x, y, flake.radius) {
                frame.fill_path(&circle, &paint([255, 255, 255, alpha]), FillRule::Winding, Transform::identity(), None);
            }
        }
    }
}

struct Leaf {
    x: f32,
    y: f32,
    colour: [u8; 4],
    size: f32,
    angle: f32,
    drift: f32,
    fall_speed: f32,
    spin: f32,
}

/// 旋转下落的菱形秋叶
fn leaf_painter(rng: &mut StdRng, fw: u32, fh: u32) -> impl FnMut(&mut Pixmap, u32, &mut StdRng) {
    let (w, h) = (fw as f32, fh as f32);
    let leaves: Vec<Leaf> = (0..FALLING_LEAVES)
        .map(|_| Leaf {
            x: rng.random_range(0.0..w),
            y: rng.random_range(0.0..h),
            colour: LEAF_COLOURS[rng.random_range(0..LEAF_COLOURS.len())],
            size: rng.random_range(3.0..7.0),
            angle: rng.random_range(0.0..TAU),
            drift: rng.random_range(-1.0..1.0),
            fall_speed: rng.random_range(1.5..4.0),
            spin: rng.random_range(0.2..0.8),
        })
        .collect();

    move |frame, idx, _rng| {
        let t = idx as f32;
        for leaf in &leaves {
            let cx = (leaf.x + leaf.drift * t).rem_euclid(w);
            let cy = (leaf.y + leaf.fall_speed * t).rem_euclid(h);
            let angle = leaf.angle + leaf.spin * t;
            let (dx, dy) = (angle.cos() * leaf.size, angle.sin() * leaf.size);
            let half = leaf.size * 0.5;

            let mut pb = PathBuilder::new();
            pb.move_to(cx - dx, cy - dy);
            pb.line_to(cx + half * (angle + 1.3).cos(), cy + half * (angle + 1.3).sin());
            pb.line_to(cx + dx, cy + dy);
            pb.line_to(cx + half * (angle - 1.3).cos(), cy + half * (angle - 1.3).sin());
            pb.close();
            if let Some(path) = pb.finish() {
                frame.fill_path(&path, &paint(leaf.colour), FillRule::Winding, Transform::identity(), None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::imageops;

    fn small(frames: u32) -> EffectOptions {
        EffectOptions {
            frame_count: frames,
            frame_width: 96,
            frame_height: 96,
            seed: None,
        }
    }

    fn alpha_counts(img: &RgbaImage) -> (usize, usize) {
        let clear = img.pixels().filter(|p| p.0[3] == 0).count();
        (clear, img.pixels().count() - clear)
    }

    #[test]
    fn strip_is_one_row_of_frames() {
        for kind in EffectKind::ALL {
            let strip = render_effect_strip(kind, &small(4)).unwrap();
            assert_eq!(strip.dimensions(), (4 * 96, 96), "{kind}");
        }
    }

    #[test]
    fn particles_sit_on_a_transparent_background() {
        for kind in EffectKind::ALL {
            let strip = render_effect_strip(kind, &small(4)).unwrap();
            let (clear, painted) = alpha_counts(&strip);
            assert!(painted > 0, "{kind} 没有绘制任何粒子");
            assert!(clear > painted, "{kind}: {clear} 透明 / {painted} 不透明");
        }
    }

    #[test]
    fn same_seed_same_pixels() {
        for kind in EffectKind::ALL {
            let a = render_effect_strip(kind, &small(3)).unwrap();
            let b = render_effect_strip(kind, &small(3)).unwrap();
            assert_eq!(a, b, "{kind}");

            let other = render_effect_strip(kind, &EffectOptions { seed: Some(7), ..small(3) }).unwrap();
            assert_ne!(a, other, "{kind}");
        }
    }

    #[test]
    fn frames_move_between_steps() {
        let strip = render_effect_strip(EffectKind::Rain, &small(4)).unwrap();
        let first = imageops::crop_imm(&strip, 0, 0, 96, 96).to_image();
        let second = imageops::crop_imm(&strip, 96, 0, 96, 96).to_image();
        assert_ne!(first, second);
    }

    #[test]
    fn rain_is_blue_white_and_leaves_are_warm() {
        let rain = render_effect_strip(EffectKind::Rain, &small(2)).unwrap();
        assert!(rain.pixels().filter(|p| p.0[3] >= 64).all(|p| p.0[2] >= p.0[0]));

        let leaves = render_effect_strip(EffectKind::Leaves, &small(2)).unwrap();
        assert!(leaves.pixels().filter(|p| p.0[3] >= 100).all(|p| p.0[0] > p.0[2]));
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        assert!(matches!(
            render_effect_strip(EffectKind::Snow, &small(0)),
            Err(ForgeError::InvalidInput(_))
        ));
        let wide = EffectOptions {
            frame_width: u32::MAX / 2,
            ..small(4)
        };
        assert!(matches!(render_effect_strip(EffectKind::Snow, &wide), Err(ForgeError::InvalidInput(_))));
    }

    #[test]
    fn writes_named_png() {
        let dir = std::env::temp_dir()
            .join("animeforge-tests")
            .join(format!("effects-{}", uuid::Uuid::new_v4()));
        let path = generate_effect_sprites(EffectKind::Leaves, &dir, &small(2)).unwrap();
        assert!(path.ends_with("leaf_sprites.png"));
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (192, 96));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn conditions_select_effects() {
        assert_eq!(EffectKind::for_conditions(Weather::Rain, Season::Fall), vec![EffectKind::Rain, EffectKind::Leaves]);
        assert_eq!(EffectKind::for_conditions(Weather::Snow, Season::Winter), vec![EffectKind::Snow]);
        assert!(EffectKind::for_conditions(Weather::Clear, Season::Summer).is_empty());
        assert_eq!("Leaf".parse::<EffectKind>().unwrap(), EffectKind::Leaves);
        assert!("fire".parse::<EffectKind>().is_err());
    }
}
