//! 速度计算
//!
//! 进度监控每次采样时调用，按两次采样之间的字节差和时间差计算瞬时速度。
//! 时间点由调用方传入，测试时可以注入合成的时间序列。

use std::time::Instant;

/// 瞬时速度计算器
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    /// 上次采样的已接收字节数
    last_received: u64,
    /// 上次采样时间
    last_sample: Instant,
    /// 最近一次计算出的速度 (bytes/s)
    current_speed: u64,
}

impl SpeedCalculator {
    pub fn new(started_at: Instant) -> Self {
        Self {
            last_received: 0,
            last_sample: started_at,
            current_speed: 0,
        }
    }

    /// 记录一次采样，返回当前速度
    ///
    /// 两次采样间隔为 0 时保持上一次的速度不变。
    /// 字节数回退（重新开始传输）时按 0 增量计算。
    pub fn sample(&mut self, received: u64, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.last_sample).as_secs_f64();
        if elapsed > 0.0 {
            let delta = received.saturating_sub(self.last_received);
            self.current_speed = (delta as f64 / elapsed).round() as u64;
            self.last_sample = now;
        }
        self.last_received = received;
        self.current_speed
    }

    pub fn current_speed(&self) -> u64 {
        self.current_speed
    }
}
