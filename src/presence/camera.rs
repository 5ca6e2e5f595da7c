use std::io::Cursor;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{codecs::jpeg::JpegEncoder, DynamicImage};
use tokio::sync::watch;

use crate::settings::PresenceSettings;

/// Source of camera frames for the presence monitor.
#[async_trait]
pub trait FrameSource: Send + Sync {
    fn permission_granted(&self) -> bool;

    async fn capture(&self) -> Result<DynamicImage>;
}

/// Frame source fed by the host: the platform camera pushes encoded stills
/// (PNG/JPEG bytes) and the monitor samples the most recent one.
pub struct LatestFrameSource {
    frames: watch::Receiver<Option<Arc<Vec<u8>>>>,
    permission: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct FrameFeeder {
    frames: Arc<watch::Sender<Option<Arc<Vec<u8>>>>>,
    permission: Arc<AtomicBool>,
}

impl LatestFrameSource {
    pub fn new() -> (Self, FrameFeeder) {
        let (tx, rx) = watch::channel(None);
        let permission = Arc::new(AtomicBool::new(false));
        (
            Self {
                frames: rx,
                permission: permission.clone(),
            },
            FrameFeeder {
                frames: Arc::new(tx),
                permission,
            },
        )
    }
}

impl FrameFeeder {
    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
    }

    pub fn push(&self, encoded: Vec<u8>) {
        self.frames.send_replace(Some(Arc::new(encoded)));
    }
}

#[async_trait]
impl FrameSource for LatestFrameSource {
    fn permission_granted(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    async fn capture(&self) -> Result<DynamicImage> {
        let bytes = self
            .frames
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("no camera frame available yet"))?;

        tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .context("frame decode worker join failed")?
            .context("camera frame could not be decoded")
    }
}

/// Downscales to fit the configured frame size and returns a base64 JPEG.
pub fn encode_frame(image: &DynamicImage, settings: &PresenceSettings) -> Result<String> {
    let small = image.thumbnail(settings.frame_width.max(1), settings.frame_height.max(1));
    let rgb = small.to_rgb8();

    let mut jpeg = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, settings.jpeg_quality.clamp(1, 100));
    rgb.write_with_encoder(encoder)
        .context("failed to encode camera frame as JPEG")?;

    Ok(STANDARD.encode(jpeg.into_inner()))
}
