//! Byte counters shared between a peer task and the session.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::utils::to_human_readable;

/// Exponential moving average smoothing factor for the rates.
static EMA_ALPHA: f64 = 0.3;

/// Counter of totals and rates, in the local peer's perspective.
#[derive(Debug)]
pub struct Counter {
    total_downloaded: AtomicU64,
    total_uploaded: AtomicU64,

    window_downloaded: AtomicU64,
    window_uploaded: AtomicU64,

    ema_download: AtomicU64,
    ema_upload: AtomicU64,

    last_update: AtomicU64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: AtomicU64::new(0),
            total_uploaded: AtomicU64::new(0),
            window_downloaded: AtomicU64::new(0),
            window_uploaded: AtomicU64::new(0),
            ema_download: AtomicU64::new(0.0f64.to_bits()),
            ema_upload: AtomicU64::new(0.0f64.to_bits()),
            last_update: AtomicU64::new(now_millis()),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, bytes: u64) {
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.total_uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_download(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }

    pub fn total_upload(&self) -> u64 {
        self.total_uploaded.load(Ordering::Relaxed)
    }

    pub fn download_rate_f64(&self) -> f64 {
        f64::from_bits(self.ema_download.load(Ordering::Relaxed))
    }

    pub fn upload_rate_f64(&self) -> f64 {
        f64::from_bits(self.ema_upload.load(Ordering::Relaxed))
    }

    pub fn download_rate(&self) -> String {
        let mut v = to_human_readable(self.download_rate_f64());
        v.push_str("/s");
        v
    }

    pub fn upload_rate(&self) -> String {
        let mut v = to_human_readable(self.upload_rate_f64());
        v.push_str("/s");
        v
    }

    /// Fold the current window into the EMA rates.
    pub fn update_rates(&self) {
        let now = now_millis();
        let last = self.last_update.load(Ordering::Acquire);
        let elapsed_ms = now.saturating_sub(last);

        if elapsed_ms < 1 {
            return;
        }
        self.last_update.store(now, Ordering::Release);

        let elapsed = elapsed_ms as f64 / 1000.0;
        let downloaded = self.window_downloaded.swap(0, Ordering::Relaxed);
        let uploaded = self.window_uploaded.swap(0, Ordering::Relaxed);

        self.fold(&self.ema_download, downloaded as f64 / elapsed);
        self.fold(&self.ema_upload, uploaded as f64 / elapsed);
    }

    fn fold(&self, ema: &AtomicU64, rate: f64) {
        let current = f64::from_bits(ema.load(Ordering::Relaxed));
        let new = if current == 0.0 {
            rate
        } else {
            EMA_ALPHA * rate + (1.0 - EMA_ALPHA) * current
        };
        ema.store(new.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_counters() {
        let counter = Counter::new();

        counter.record_download(1000);
        counter.record_upload(500);
        counter.record_download(2001);

        assert_eq!(counter.total_download(), 3001);
        assert_eq!(counter.total_upload(), 500);

        counter.update_rates();

        // totals survive rate folding
        assert_eq!(counter.total_download(), 3001);
        assert_eq!(counter.total_upload(), 500);
    }

    #[test]
    fn format_rate() {
        let counter = Counter::default();

        counter
            .ema_download
            .store(1500.0f64.to_bits(), Ordering::Relaxed);
        assert_eq!(counter.download_rate(), "1.5 KB/s");

        counter.ema_download.store(0.0f64.to_bits(), Ordering::Relaxed);
        assert_eq!(counter.download_rate(), "0 B/s");
    }
}
