use std::path::{Path, PathBuf};
use image::DynamicImage;
use resvg::tiny_skia::{Color, FillRule, LineCap, Paint, PathBuilder, Stroke, Transform};
use crate::error::ForgeResult;
use crate::pose::{Joint, PoseKeypoints};
use crate::raster;

/// OpenPose 骨骼连线（13 段）
pub const SKELETON_CONNECTIONS: [(Joint, Joint); 13] = [
    (Joint::Nose, Joint::Neck),
    (Joint::Neck, Joint::RightShoulder),
    (Joint::Neck, Joint::LeftShoulder),
    (Joint::RightShoulder, Joint::RightElbow),
    (Joint::RightElbow, Joint::RightWrist),
    (Joint::LeftShoulder, Joint::LeftElbow),
    (Joint::LeftElbow, Joint::LeftWrist),
    (Joint::Neck, Joint::RightHip),
    (Joint::Neck, Joint::LeftHip),
    (Joint::RightHip, Joint::RightKnee),
    (Joint::RightKnee, Joint::RightAnkle),
    (Joint::LeftHip, Joint::LeftKnee),
    (Joint::LeftKnee, Joint::LeftAnkle),
];

/// 每段骨骼的颜色
pub const LIMB_COLORS: [[u8; 3]; 13] = [
    [255, 0, 0],
    [255, 85, 0],
    [255, 170, 0],
    [255, 255, 0],
    [170, 255, 0],
    [85, 255, 0],
    [0, 255, 0],
    [0, 255, 85],
    [0, 255, 170],
    [0, 255, 255],
    [0, 170, 255],
    [0, 85, 255],
    [0, 0, 255],
];

const JOINT_COLOR: [u8; 3] = [255, 255, 255];

/// 引导图渲染参数
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub width: u32,
    pub height: u32,
    pub background: [u8; 3],
    pub line_width: f32,
    pub point_radius: f32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            background: [0, 0, 0],
            line_width: 4.0,
            point_radius: 6.0,
        }
    }
}

impl RenderOptions {
    pub fn sized(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }
}

/// 将一组关键点渲染为 ControlNet OpenPose 引导图
///
/// 纯色背景上绘制彩色骨骼线，再在每个可见关节处画白色实心圆。
pub fn render_pose_image(
    keypoints: &PoseKeypoints,
    output_path: impl AsRef<Path>,
    options: &RenderOptions,
) -> ForgeResult<PathBuf> {
    let output_path = output_path.as_ref();
    let mut pixmap = raster::new_pixmap(options.width, options.height)?;
    let [br, bg, bb] = options.background;
    pixmap.fill(Color::from_rgba8(br, bg, bb, 255));

    let points = visible_pixel_points(keypoints, options.width, options.height);
    let lookup = |joint: Joint| points.iter().find(|(j, _, _)| *j == joint).map(|&(_, x, y)| (x, y));

    let stroke = Stroke {
        width: options.line_width,
        line_cap: LineCap::Round,
        ..Stroke::default()
    };

    for (idx, (a, b)) in SKELETON_CONNECTIONS.iter().enumerate() {
        let (Some((ax, ay)), Some((bx, by))) = (lookup(*a), lookup(*b)) else {
            continue;
        };
        let mut pb = PathBuilder::new();
        pb.move_to(ax, ay);
        pb.line_to(bx, by);
        let Some(path) = pb.finish() else {
            continue;
        };
        let [r, g, b] = LIMB_COLORS[idx % LIMB_COLORS.len()];
        pixmap.stroke_path(&path, &solid(r, g, b), &stroke, Transform::identity(), None);
    }

    let [jr, jg, jb] = JOINT_COLOR;
    let joint_paint = solid(jr, jg, jb);
    for &(_, x, y) in &points {
        if let Some(circle) = PathBuilder::from_circle(x, y, options.point_radius) {
            pixmap.fill_path(&circle, &joint_paint, FillRule::Winding, Transform::identity(), None);
        }
    }

    let rgba = raster::pixmap_to_rgba(&pixmap)?;
    let rgb = DynamicImage::ImageRgba8(rgba).to_rgb8();
    raster::save_png(&DynamicImage::ImageRgb8(rgb), output_path)?;
    Ok(output_path.to_path_buf())
}

/// 可见关节的像素坐标（置信度 > 0.1），按固定关节顺序
pub fn visible_pixel_points(keypoints: &PoseKeypoints, width: u32, height: u32) -> Vec<(Joint, f32, f32)> {
    Joint::ALL
        .into_iter()
        .filter_map(|joint| {
            let kp = keypoints.get(joint);
            if !kp.is_visible() {
                return None;
            }
            // 与整数像素网格对齐
            let x = (kp.x * width as f32).trunc();
            let y = (kp.y * height as f32).trunc();
            Some((joint, x, y))
        })
        .collect()
}

fn solid(r: u8, g: u8, b: u8) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(r, g, b, 255);
    paint.anti_alias = true;
    paint
}
