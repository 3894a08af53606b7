//! Progress bar rendering of engine events.

use std::time::Duration;

use arrakis_core::DownloadEvent;
use arrakis_core::download::ProgressEvent;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;

/// Spawns the progress bar task when `enabled`.
///
/// The task ends once every sender of `events` is dropped.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    events: Receiver<DownloadEvent>,
) -> Option<tokio::task::JoinHandle<()>> {
    enabled.then(|| tokio::spawn(render(events)))
}

async fn render(mut events: Receiver<DownloadEvent>) {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{prefix:>9} [{bar:30}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(200));

    loop {
        match events.recv().await {
            Ok(DownloadEvent::Status(update)) => {
                if update.current < update.total {
                    bar.set_prefix(format!("[{}/{}]", update.current, update.total));
                    bar.set_position(0);
                }
                bar.set_message(update.message);
            }
            Ok(DownloadEvent::DownloadProgress(event)) => {
                bar.set_position(bar_position(event.percent));
                bar.set_message(transfer_message(&event));
            }
            Ok(DownloadEvent::Log(line)) => bar.println(line.message),
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }

    bar.finish_and_clear();
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn bar_position(percent: f64) -> u64 {
    percent.clamp(0.0, 100.0) as u64
}

fn transfer_message(event: &ProgressEvent) -> String {
    let mut message = event.filename.clone();
    if !event.speed.is_empty() {
        message.push_str("  ");
        message.push_str(&event.speed);
    }
    if !event.eta.is_empty() {
        message.push_str("  eta ");
        message.push_str(&event.eta);
    }
    message
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use arrakis_core::BroadcastSink;

    use super::*;

    #[test]
    fn test_bar_position_clamps() {
        assert_eq!(bar_position(-3.0), 0);
        assert_eq!(bar_position(45.7), 45);
        assert_eq!(bar_position(250.0), 100);
    }

    #[test]
    fn test_transfer_message_skips_empty_parts() {
        let event = ProgressEvent {
            filename: "ae.safetensors".to_string(),
            percent: 10.0,
            speed: "12MB/s".to_string(),
            eta: String::new(),
        };
        assert_eq!(transfer_message(&event), "ae.safetensors  12MB/s");
    }

    #[tokio::test]
    async fn test_disabled_ui_spawns_nothing() {
        let (_sink, events) = BroadcastSink::new(4);
        assert!(spawn_progress_ui(false, events).is_none());
    }

    #[tokio::test]
    async fn test_ui_task_ends_when_senders_drop() {
        let (sink, events) = BroadcastSink::new(4);
        let handle = spawn_progress_ui(true, events).unwrap();
        drop(sink);
        handle.await.unwrap();
    }
}
