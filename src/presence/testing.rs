use std::io::Cursor;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{channel::mpsc, future, StreamExt};
use image::{DynamicImage, ImageFormat, RgbImage};

use crate::settings::PresenceSettings;

use super::{FrameSink, LatestFrameSource, PresenceChannel, PresenceConnector};

struct ScriptedSink {
    sent: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicUsize>,
    stalled: bool,
}

#[async_trait]
impl FrameSink for ScriptedSink {
    async fn send_frame(&mut self, payload: String) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.stalled {
            future::pending::<()>().await;
        }
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    async fn close(&mut self) {
        if self.stalled {
            future::pending::<()>().await;
        }
    }
}

/// Detector stand-in. Every `connect` opens a fresh link whose inbound side
/// is driven with [`ScriptedConnector::send`].
#[derive(Default)]
pub struct ScriptedConnector {
    links: Mutex<Vec<mpsc::UnboundedSender<Result<String>>>>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub attempts: Arc<AtomicUsize>,
    stalled: bool,
}

impl ScriptedConnector {
    /// Sends and closes never complete, like a detector that stopped reading.
    pub fn stalled() -> Self {
        Self {
            stalled: true,
            ..Self::default()
        }
    }

    pub fn connects(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub async fn wait_for_connects(&self, count: usize) -> usize {
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            while self.connects() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        self.connects()
    }

    pub async fn wait_for_send_attempts(&self, count: usize) -> usize {
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            while self.attempts.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        self.attempts.load(Ordering::SeqCst)
    }

    /// Pushes an inbound message on the most recent link.
    pub fn send(&self, message: Result<String>) {
        let links = self.links.lock().unwrap();
        links
            .last()
            .expect("no link open")
            .unbounded_send(message)
            .unwrap();
    }
}

#[async_trait]
impl PresenceConnector for ScriptedConnector {
    async fn connect(&self) -> Result<PresenceChannel> {
        let (tx, rx) = mpsc::unbounded();
        self.links.lock().unwrap().push(tx);
        Ok(PresenceChannel {
            frames: Box::new(ScriptedSink {
                sent: self.sent.clone(),
                attempts: self.attempts.clone(),
                stalled: self.stalled,
            }),
            messages: rx.boxed(),
        })
    }
}

pub fn png() -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, image::Rgb([1, 2, 3])));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Camera with permission granted and one frame ready.
pub fn ready_camera() -> Arc<LatestFrameSource> {
    let (camera, feeder) = LatestFrameSource::new();
    feeder.set_permission(true);
    feeder.push(png());
    Arc::new(camera)
}

pub fn fast_settings() -> PresenceSettings {
    PresenceSettings {
        capture_interval_ms: 10,
        ..PresenceSettings::default()
    }
}
