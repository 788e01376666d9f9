#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::path::PathBuf;
use animeforge::AppConfig;

/// 每个测试独占的输出目录
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("animeforge-tests")
        .join(format!("{}-{}", name, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// 小尺寸、无等待的配置，测试跑得快
pub fn small_config(output_dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.output_dir = output_dir.to_path_buf();
    config.generation.width = 64;
    config.generation.height = 64;
    config.mock.step_delay_ms = 0;
    config
}

/// 编码一张纯色 PNG
pub fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut buf = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageOutputFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// 在随机端口上启动一个 axum 服务，返回监听地址
pub async fn spawn_server(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// 一个确定没有服务监听的本地端口
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
