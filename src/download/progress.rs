//! 进度上报与 CLI 进度条管理。
//!
//! 下载线程是唯一的生产者，调用方是唯一的消费者；发送永不阻塞，
//! 通道为空时消费者保留最后一次读到的值。

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_SCALE: u64 = 1000;

pub struct ProgressReporter {
    tx: Sender<f64>,
}

impl ProgressReporter {
    /// 上报 [0,1] 区间内的完成比例；接收端已关闭时静默丢弃。
    pub fn report(&self, fraction: f64) {
        let value = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let _ = self.tx.try_send(value);
    }
}

pub struct ProgressMonitor {
    rx: Receiver<f64>,
    last: f64,
}

impl ProgressMonitor {
    /// 取走通道中已有的全部值，返回最新值。
    pub fn poll(&mut self) -> f64 {
        loop {
            match self.rx.try_recv() {
                Ok(v) => self.last = v,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.last
    }

    #[cfg(test)]
    pub(crate) fn drain(&mut self) -> Vec<f64> {
        let values: Vec<f64> = self.rx.try_iter().collect();
        if let Some(v) = values.last() {
            self.last = *v;
        }
        values
    }
}

pub fn progress_channel() -> (ProgressReporter, ProgressMonitor) {
    let (tx, rx) = unbounded();
    (ProgressReporter { tx }, ProgressMonitor { rx, last: 0.0 })
}

// ── CLI 进度条 ──────────────────────────────────────────────────

pub struct CliProgressBar {
    bar: ProgressBar,
}

impl CliProgressBar {
    pub fn new(prefix: &str) -> Self {
        let bar = ProgressBar::with_draw_target(Some(BAR_SCALE), ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template("{prefix} [{elapsed_precise}] {wide_bar} {percent}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        bar.set_style(style);
        bar.set_prefix(prefix.to_string());
        Self { bar }
    }

    pub fn update(&self, fraction: f64) {
        self.bar
            .set_position((fraction.clamp(0.0, 1.0) * BAR_SCALE as f64).round() as u64);
    }

    pub fn finish(self) {
        self.bar.finish_and_clear();
    }
}
