// SPDX-License-Identifier: MIT

use std::collections::VecDeque;
use std::time::Instant;

/// Floor for the standard deviation; keeps the density finite when
/// heartbeat intervals are perfectly regular.
const MIN_STD_DEV: f64 = 1e-4;

/// Per-peer suspicion accrual over a bounded window of heartbeat
/// inter-arrival times. The first heartbeat only establishes the baseline;
/// phi stays 0 until two samples exist.
#[derive(Debug)]
pub struct PhiAccrual {
    window: VecDeque<f64>,
    max_samples: usize,
    mean: f64,
    variance: f64,
    std_dev: f64,
    last_heartbeat: Instant,
    primed: bool,
}

impl PhiAccrual {
    pub fn new(max_samples: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(max_samples),
            max_samples,
            mean: 0.0,
            variance: 0.0,
            std_dev: 0.0,
            last_heartbeat: Instant::now(),
            primed: false,
        }
    }

    pub fn heartbeat(&mut self) {
        let now = Instant::now();
        if self.primed {
            let interval = now.duration_since(self.last_heartbeat).as_secs_f64();
            if self.window.len() == self.max_samples {
                self.window.pop_front();
            }
            self.window.push_back(interval);
            self.update_statistics();
        }
        self.primed = true;
        self.last_heartbeat = now;
    }

    fn update_statistics(&mut self) {
        let n = self.window.len() as f64;
        self.mean = self.window.iter().sum::<f64>() / n;
        self.variance =
            self.window.iter().map(|x| (x - self.mean).powi(2)).sum::<f64>() / n;
        self.std_dev = self.variance.sqrt();
    }

    /// Suspicion level: -log10 of the probability density of the elapsed
    /// silence under the observed interval distribution.
    pub fn phi(&self) -> f64 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let elapsed = self.last_heartbeat.elapsed().as_secs_f64();
        let sigma = self.std_dev.max(MIN_STD_DEV);
        let exponent = -((elapsed - self.mean).powi(2)) / (2.0 * sigma * sigma);
        let p = exponent.exp() / (sigma * (2.0 * std::f64::consts::PI).sqrt());
        if p > 0.0 {
            -p.log10()
        } else {
            f64::INFINITY
        }
    }

    pub fn mean_interval(&self) -> f64 {
        self.mean
    }

    pub fn std_deviation(&self) -> f64 {
        self.std_dev
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }
}
