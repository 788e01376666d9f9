use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::{self, FilterType};
use image::{ColorType, ImageEncoder, Rgba, RgbaImage};
use tracing::info;
use crate::error::{ForgeError, ForgeResult};
use crate::raster;

/// 精灵图排列方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Horizontal,
    Vertical,
}

/// 将若干帧拼成一张单行（或单列）精灵图
///
/// 每帧按 `frame_size` 缩放（Lanczos），帧之间留 `padding` 像素透明间隔。
/// 任何一帧缺失、为空或无法解码都会返回 `Assembly` 错误。
pub fn assemble_sprite_sheet(
    frames: &[PathBuf],
    output: impl AsRef<Path>,
    frame_size: (u32, u32),
    direction: Direction,
    padding: u32,
) -> ForgeResult<PathBuf> {
    let output = output.as_ref();
    if frames.is_empty() {
        return Err(ForgeError::invalid_input("没有可用于拼接精灵图的帧"));
    }

    let (fw, fh) = frame_size;
    if fw == 0 || fh == 0 {
        return Err(ForgeError::invalid_input(format!("帧尺寸无效: {}x{}", fw, fh)));
    }

    let n = u32::try_from(frames.len())
        .map_err(|_| ForgeError::invalid_input(format!("帧数过多: {}", frames.len())))?;
    let (sheet_w, sheet_h) = sheet_dimensions(n, (fw, fh), direction, padding)?;

    let mut sheet = RgbaImage::from_pixel(sheet_w, sheet_h, Rgba([0, 0, 0, 0]));

    for (idx, frame_path) in frames.iter().enumerate() {
        let mut img = load_frame(idx, frame_path)?;
        if img.dimensions() != (fw, fh) {
            img = imageops::resize(&img, fw, fh, FilterType::Lanczos3);
        }

        let offset = idx as u32 * match direction {
            Direction::Horizontal => fw + padding,
            Direction::Vertical => fh + padding,
        };
        let (x, y) = match direction {
            Direction::Horizontal => (offset, 0),
            Direction::Vertical => (0, offset),
        };
        imageops::overlay(&mut sheet, &img, x as i64, y as i64);
    }

    raster::save_png(&image::DynamicImage::ImageRgba8(sheet), output)?;
    info!(
        "✅ [精灵图] 拼接完成: {} ({} 帧, {}x{})",
        output.display(),
        n,
        sheet_w,
        sheet_h
    );
    Ok(output.to_path_buf())
}

/// 精灵图总尺寸，溢出 u32 时返回 `InvalidInput`
fn sheet_dimensions(n: u32, (fw, fh): (u32, u32), direction: Direction, padding: u32) -> ForgeResult<(u32, u32)> {
    let along = match direction {
        Direction::Horizontal => fw,
        Direction::Vertical => fh,
    };
    let length = padding
        .checked_mul(n.saturating_sub(1))
        .and_then(|gaps| along.checked_mul(n)?.checked_add(gaps))
        .ok_or_else(|| {
            ForgeError::invalid_input(format!(
                "精灵图尺寸溢出: {} 帧 x {} 像素, 间隔 {}",
                n, along, padding
            ))
        })?;
    Ok(match direction {
        Direction::Horizontal => (length, fh),
        Direction::Vertical => (fw, length),
    })
}

fn load_frame(index: usize, path: &Path) -> ForgeResult<RgbaImage> {
    let assembly_err = |reason: String| ForgeError::Assembly {
        index,
        path: path.to_path_buf(),
        reason,
    };

    let bytes = std::fs::read(path).map_err(|e| assembly_err(format!("读取失败: {}", e)))?;
    if bytes.is_empty() {
        return Err(assembly_err("文件为空".to_string()));
    }
    let img = image::load_from_memory(&bytes).map_err(|e| assembly_err(format!("解码失败: {}", e)))?;
    Ok(img.to_rgba8())
}

/// 重新编码输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Jpeg,
}

impl std::str::FromStr for OutputFormat {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            other => Err(ForgeError::invalid_input(format!("不支持的输出格式: {}", other))),
        }
    }
}

/// 按指定格式与质量重新编码一张图片
///
/// JPEG 会丢弃 alpha 通道，PNG 使用最高压缩等级。`quality` 只对 JPEG 生效。
pub fn optimize_image(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    format: OutputFormat,
    quality: u8,
) -> ForgeResult<PathBuf> {
    let (input, output) = (input.as_ref(), output.as_ref());
    let img = image::open(input)?;
    raster::ensure_parent(output)?;
    let writer = BufWriter::new(File::create(output)?);

    match format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
            encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)?;
        }
        OutputFormat::Png => {
            let rgba = img.to_rgba8();
            PngEncoder::new_with_quality(writer, CompressionType::Best, PngFilter::Adaptive)
                .write_image(rgba.as_raw(), rgba.width(), rgba.height(), ColorType::Rgba8)?;
        }
    }

    info!(
        "✅ [图片优化] {} -> {} ({:?}, q={})",
        input.display(),
        output.display(),
        format,
        quality
    );
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work_dir() -> PathBuf {
        let dir = std::env::temp_dir()
            .join("animeforge-tests")
            .join(format!("sprites-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_frame(dir: &Path, name: &str, size: (u32, u32), color: [u8; 4]) -> PathBuf {
        let path = dir.join(name);
        RgbaImage::from_pixel(size.0, size.1, Rgba(color)).save(&path).unwrap();
        path
    }

    #[test]
    fn empty_frame_list_is_invalid_input() {
        let err = assemble_sprite_sheet(&[], "/tmp/never.png", (8, 8), Direction::Horizontal, 0).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidInput(_)));
    }

    #[test]
    fn horizontal_sheet_with_padding() {
        let dir = work_dir();
        let frames: Vec<_> = (0..3)
            .map(|i| write_frame(&dir, &format!("f{}.png", i), (10, 6), [200, 0, 0, 255]))
            .collect();
        let out = dir.join("sheet.png");
        assemble_sprite_sheet(&frames, &out, (10, 6), Direction::Horizontal, 2).unwrap();

        let sheet = image::open(&out).unwrap().to_rgba8();
        assert_eq!(sheet.dimensions(), (34, 6));
        assert_eq!(sheet.get_pixel(0, 0).0, [200, 0, 0, 255]);
        // 间隔保持透明
        assert_eq!(sheet.get_pixel(10, 3).0[3], 0);
        assert_eq!(sheet.get_pixel(12, 3).0, [200, 0, 0, 255]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn vertical_sheet_resizes_frames() {
        let dir = work_dir();
        let frames = vec![
            write_frame(&dir, "a.png", (20, 20), [0, 0, 255, 255]),
            write_frame(&dir, "b.png", (5, 5), [0, 255, 0, 255]),
        ];
        let out = dir.join("nested/sheet.png");
        assemble_sprite_sheet(&frames, &out, (8, 4), Direction::Vertical, 1).unwrap();

        let sheet = image::open(&out).unwrap().to_rgba8();
        assert_eq!(sheet.dimensions(), (8, 9));
        assert_eq!(sheet.get_pixel(4, 2).0, [0, 0, 255, 255]);
        assert_eq!(sheet.get_pixel(4, 4).0[3], 0);
        assert_eq!(sheet.get_pixel(4, 7).0, [0, 255, 0, 255]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn zero_length_frame_names_its_index() {
        let dir = work_dir();
        let good = write_frame(&dir, "good.png", (4, 4), [1, 2, 3, 255]);
        let empty = dir.join("empty.png");
        std::fs::write(&empty, b"").unwrap();

        let err = assemble_sprite_sheet(&[good, empty.clone()], dir.join("s.png"), (4, 4), Direction::Horizontal, 0)
            .unwrap_err();
        match err {
            ForgeError::Assembly { index, path, .. } => {
                assert_eq!(index, 1);
                assert_eq!(path, empty);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!dir.join("s.png").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_and_garbage_frames_are_assembly_errors() {
        let dir = work_dir();
        let garbage = dir.join("garbage.png");
        std::fs::write(&garbage, b"not an image").unwrap();
        for bad in [dir.join("missing.png"), garbage] {
            let err = assemble_sprite_sheet(&[bad], dir.join("s.png"), (4, 4), Direction::Horizontal, 0).unwrap_err();
            assert!(matches!(err, ForgeError::Assembly { index: 0, .. }));
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn oversized_sheet_is_rejected_before_loading_frames() {
        let frames = vec![PathBuf::from("/nonexistent/a.png"), PathBuf::from("/nonexistent/b.png")];
        let out = std::env::temp_dir().join("animeforge-never-written.png");

        let err = assemble_sprite_sheet(&frames, &out, (4, 4), Direction::Horizontal, u32::MAX).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidInput(_)), "{err:?}");

        let err = assemble_sprite_sheet(&frames, &out, (4, u32::MAX / 2 + 1), Direction::Vertical, 0).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidInput(_)), "{err:?}");
        assert!(!out.exists());
    }

    #[test]
    fn sheet_dimensions_include_gaps() {
        assert_eq!(sheet_dimensions(3, (10, 6), Direction::Horizontal, 2).unwrap(), (34, 6));
        assert_eq!(sheet_dimensions(3, (10, 6), Direction::Vertical, 2).unwrap(), (10, 22));
        assert_eq!(sheet_dimensions(1, (10, 6), Direction::Horizontal, u32::MAX).unwrap(), (10, 6));
    }

    #[test]
    fn optimize_to_jpeg_drops_alpha() {
        let dir = work_dir();
        let src = write_frame(&dir, "src.png", (16, 16), [10, 200, 30, 128]);
        let out = optimize_image(&src, dir.join("out.jpg"), OutputFormat::Jpeg, 85).unwrap();
        let img = image::open(&out).unwrap();
        assert_eq!(img.color(), ColorType::Rgb8);
        assert_eq!((img.width(), img.height()), (16, 16));

        let png = optimize_image(&src, dir.join("out.png"), "PNG".parse().unwrap(), 85).unwrap();
        assert_eq!(image::open(&png).unwrap().to_rgba8().get_pixel(0, 0).0, [10, 200, 30, 128]);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
