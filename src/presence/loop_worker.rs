use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::session::PresenceSignal;
use crate::settings::PresenceSettings;

use super::camera::{encode_frame, FrameSource};
use super::socket::PresenceConnector;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const CLOSE_TIMEOUT_MS: u64 = 500;

/// Connects, then samples one frame per interval and forwards every detector
/// message until cancelled or the socket fails. Always ends with a
/// `Disconnected` signal; reconnecting is the caller's job.
pub async fn presence_loop(
    connector: Arc<dyn PresenceConnector>,
    camera: Arc<dyn FrameSource>,
    settings: PresenceSettings,
    signals: mpsc::UnboundedSender<PresenceSignal>,
    cancel_token: CancellationToken,
) {
    let connect = tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connector.connect());
    let channel = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => {
            let _ = signals.send(PresenceSignal::Disconnected);
            return;
        }
        result = connect => match result {
            Ok(Ok(channel)) => channel,
            Ok(Err(err)) => {
                log_warn!("presence detector unavailable: {err:#}");
                let _ = signals.send(PresenceSignal::Disconnected);
                return;
            }
            Err(_) => {
                log_warn!("presence detector connect timeout (> {}s)", CONNECT_TIMEOUT_SECS);
                let _ = signals.send(PresenceSignal::Disconnected);
                return;
            }
        },
    };

    log_info!("presence detector connected");
    let _ = signals.send(PresenceSignal::Connected);

    let mut frames = channel.frames;
    let mut messages = channel.messages;
    let mut ticker = tokio::time::interval(Duration::from_millis(settings.capture_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let capture_timeout = Duration::from_millis(settings.capture_timeout_ms.max(1));

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                log_info!("presence loop shutting down");
                break;
            }
            message = messages.next() => match message {
                Some(Ok(text)) => {
                    if signals.send(PresenceSignal::Message(text)).is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    log_warn!("presence socket dropped: {err:#}");
                    break;
                }
                None => {
                    log_info!("presence socket closed by detector");
                    break;
                }
            },
            _ = ticker.tick() => {
                match tokio::time::timeout(capture_timeout, capture_payload(camera.as_ref(), &settings)).await {
                    // A detector that stops reading must not wedge the loop.
                    Ok(Ok(payload)) => match tokio::time::timeout(capture_timeout, frames.send_frame(payload)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            log_error!("presence frame send failed: {err:#}");
                            break;
                        }
                        Err(_) => {
                            log_warn!("presence frame send timeout (> {}ms)", settings.capture_timeout_ms);
                            break;
                        }
                    },
                    Ok(Err(err)) => log_warn!("camera capture failed: {err:#}"),
                    Err(_) => log_warn!("camera capture timeout (> {}ms)", settings.capture_timeout_ms),
                }
            }
        }
    }

    if tokio::time::timeout(Duration::from_millis(CLOSE_TIMEOUT_MS), frames.close())
        .await
        .is_err()
    {
        log_warn!("presence socket close timeout (> {}ms)", CLOSE_TIMEOUT_MS);
    }
    let _ = signals.send(PresenceSignal::Disconnected);
}

async fn capture_payload(camera: &dyn FrameSource, settings: &PresenceSettings) -> Result<String> {
    let image = camera.capture().await?;
    let settings = settings.clone();
    tokio::task::spawn_blocking(move || encode_frame(&image, &settings))
        .await
        .context("frame encode worker join failed")?
}
