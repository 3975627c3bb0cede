//! Single-slot download progress channel
//!
//! Producers overwrite the slot; the one subscriber only ever sees the latest
//! value. Clearing the slot on a phase change keeps stale numbers from an
//! earlier candidate off screen.

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::watch;

/// Latest known state of an in-flight transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub written_bytes: u64,
    pub total_bytes: Option<u64>,
    pub label: String,
    pub speed_bytes_per_sec: Option<f64>,
}

impl DownloadProgress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some(self.written_bytes as f64 / total as f64),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ProgressSlot {
    tx: watch::Sender<Option<DownloadProgress>>,
    rx: Mutex<Option<watch::Receiver<Option<DownloadProgress>>>>,
}

impl Default for ProgressSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSlot {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn publish(&self, progress: DownloadProgress) {
        self.tx.send_replace(Some(progress));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn current(&self) -> Option<DownloadProgress> {
        self.tx.borrow().clone()
    }

    /// Hands out the receiver; only the first caller gets one
    pub fn subscribe(&self) -> Option<watch::Receiver<Option<DownloadProgress>>> {
        match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(written: u64) -> DownloadProgress {
        DownloadProgress {
            written_bytes: written,
            total_bytes: Some(100),
            label: "model".to_string(),
            speed_bytes_per_sec: None,
        }
    }

    #[test]
    fn test_publish_overwrites() {
        let slot = ProgressSlot::new();
        slot.publish(progress(10));
        slot.publish(progress(20));
        assert_eq!(slot.current().unwrap().written_bytes, 20);
    }

    #[test]
    fn test_clear_empties_slot() {
        let slot = ProgressSlot::new();
        slot.publish(progress(10));
        slot.clear();
        assert!(slot.current().is_none());
    }

    #[test]
    fn test_single_subscriber() {
        let slot = ProgressSlot::new();
        assert!(slot.subscribe().is_some());
        assert!(slot.subscribe().is_none());
    }

    #[tokio::test]
    async fn test_subscriber_sees_latest() {
        let slot = ProgressSlot::new();
        let mut rx = slot.subscribe().unwrap();
        slot.publish(progress(30));
        slot.publish(progress(60));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().written_bytes, 60);
        assert!((rx.borrow().as_ref().unwrap().fraction().unwrap() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_camel_case_wire_format() {
        let json = serde_json::to_value(progress(1)).unwrap();
        assert_eq!(json["writtenBytes"], 1);
        assert_eq!(json["totalBytes"], 100);
        assert!(json.get("speedBytesPerSec").is_some());
    }
}
