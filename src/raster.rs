use std::path::Path;
use image::{ImageFormat, RgbaImage};
use resvg::tiny_skia::Pixmap;
use crate::error::{ForgeError, ForgeResult};

/// 分配画布，尺寸为 0 时返回渲染错误
pub fn new_pixmap(width: u32, height: u32) -> ForgeResult<Pixmap> {
    Pixmap::new(width, height)
        .ok_or_else(|| ForgeError::render(format!("无法分配 {}x{} 画布", width, height)))
}

/// 预乘 RGBA 画布转为普通 RGBA 图像
pub fn pixmap_to_rgba(pixmap: &Pixmap) -> ForgeResult<RgbaImage> {
    let mut data = pixmap.data().to_vec();
    for px in data.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 0 || a == 255 {
            continue;
        }
        px[0] = ((px[0] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[1] = ((px[1] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[2] = ((px[2] as u16 * 255 + a / 2) / a).min(255) as u8;
    }
    RgbaImage::from_raw(pixmap.width(), pixmap.height(), data)
        .ok_or_else(|| ForgeError::render("画布数据长度与尺寸不符"))
}

/// 普通 RGBA 像素写入预乘画布
pub fn rgba_to_pixmap(image: &RgbaImage) -> ForgeResult<Pixmap> {
    let mut pixmap = new_pixmap(image.width(), image.height())?;
    for (dst, src) in pixmap.data_mut().chunks_exact_mut(4).zip(image.as_raw().chunks_exact(4)) {
        let a = src[3] as u16;
        dst[0] = ((src[0] as u16 * a + 127) / 255) as u8;
        dst[1] = ((src[1] as u16 * a + 127) / 255) as u8;
        dst[2] = ((src[2] as u16 * a + 127) / 255) as u8;
        dst[3] = src[3];
    }
    Ok(pixmap)
}

/// 确保父目录存在
pub fn ensure_parent(path: &Path) -> ForgeResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// 以 PNG 保存（自动创建父目录）
pub fn save_png(image: &image::DynamicImage, path: &Path) -> ForgeResult<()> {
    ensure_parent(path)?;
    image.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_round_trips_through_pixmap_for_opaque_pixels() {
        let img = RgbaImage::from_fn(4, 2, |x, y| image::Rgba([x as u8 * 40, y as u8 * 90, 7, 255]));
        let back = pixmap_to_rgba(&rgba_to_pixmap(&img).unwrap()).unwrap();
        assert_eq!(img, back);
    }

    #[test]
    fn zero_sized_pixmap_is_a_render_error() {
        assert!(matches!(new_pixmap(0, 10), Err(ForgeError::Render(_))));
    }
}
