//! Fan hardware seam: the driver capability plus the simulated bank used
//! in dev/local mode and in tests.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FanError {
    #[error("duty cycle {0} outside 0.0..=1.0")]
    DutyRange(f64),
    #[error("channel not configured")]
    Unconfigured,
}

/// Per-channel hardware parameters, handed down at handshake time.
#[derive(Debug, Clone, PartialEq)]
pub struct FanChannelConfig {
    pub pwm_pin: u8,
    pub tach_pin: u8,
    pub pwm_freq_hz: u32,
    pub tach_pulse_count: u32,
    pub pulses_per_rev: u32,
    pub min_rpm: u32,
    pub min_duty: f64,
    pub max_timeouts: u32,
}

/// One physical fan: PWM output plus pulse-counting tachometer input.
///
/// `read` returns RPM; `0` is a legal stalled reading, a negative value
/// means no pulse has ever been captured. That sentinel exists only at
/// this layer.
pub trait FanDriver: Send {
    fn configure(&mut self, cfg: &FanChannelConfig) -> Result<(), FanError>;
    fn write(&mut self, duty: f64) -> Result<(), FanError>;
    fn read(&mut self, timeout: Duration) -> i64;
    fn duty(&self) -> f64;
}

/// Control-loop bookkeeping for one active fan. Mutated only by the
/// command processor, never by the network tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct FanState {
    pub duty: f64,
    pub chase_target: Option<u32>,
    pub last_rpm: i64,
    pub rpm_delta: i64,
    pub stall_count: u32,
}

impl Default for FanState {
    fn default() -> Self {
        Self {
            duty: 0.0,
            chase_target: None,
            last_rpm: -1,
            rpm_delta: 0,
            stall_count: 0,
        }
    }
}

// ── Simulated fan ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SimFanConfig {
    /// RPM the model reaches at duty 1.0
    pub max_rpm: f64,
    /// First-order lag factor per read, 0..1 (higher = faster spin-up)
    pub response: f64,
    /// Gaussian tachometer noise, RPM std dev
    pub noise_rpm: f64,
    /// Below this duty the simulated rotor does not turn at all
    pub stall_below: f64,
}

impl Default for SimFanConfig {
    fn default() -> Self {
        Self {
            max_rpm: 12000.0,
            response: 0.6,
            noise_rpm: 15.0,
            stall_below: 0.04,
        }
    }
}

/// First-order fan model: RPM lags toward `duty × max_rpm` on every read,
/// with Gaussian tach noise. Stands in for hardware when no PWM/tach layer
/// is present.
pub struct SimFan {
    sim: SimFanConfig,
    channel: Option<FanChannelConfig>,
    duty: f64,
    rpm: f64,
    written: bool,
    rng: StdRng,
    noise: Normal<f64>,
}

impl SimFan {
    pub fn new(sim: SimFanConfig, seed: u64) -> Self {
        let noise = Normal::new(0.0, sim.noise_rpm.abs()).expect("noise std dev is non-negative");
        Self {
            sim,
            channel: None,
            duty: 0.0,
            rpm: 0.0,
            written: false,
            rng: StdRng::seed_from_u64(seed),
            noise,
        }
    }

    /// A bank of `count` simulated fans with distinct noise streams.
    pub fn bank(sim: SimFanConfig, count: usize) -> Vec<Box<dyn FanDriver>> {
        (0..count)
            .map(|i| Box::new(SimFan::new(sim.clone(), i as u64 + 1)) as Box<dyn FanDriver>)
            .collect()
    }
}

impl FanDriver for SimFan {
    fn configure(&mut self, cfg: &FanChannelConfig) -> Result<(), FanError> {
        self.channel = Some(cfg.clone());
        Ok(())
    }

    fn write(&mut self, duty: f64) -> Result<(), FanError> {
        if !(0.0..=1.0).contains(&duty) {
            return Err(FanError::DutyRange(duty));
        }
        self.duty = duty;
        self.written = true;
        Ok(())
    }

    fn read(&mut self, _timeout: Duration) -> i64 {
        if !self.written {
            return -1;
        }
        let target = if self.duty < self.sim.stall_below {
            0.0
        } else {
            self.duty * self.sim.max_rpm
        };
        self.rpm += (target - self.rpm) * self.sim.response;
        let noisy = self.rpm + self.noise.sample(&mut self.rng);
        noisy.max(0.0).round() as i64
    }

    fn duty(&self) -> f64 {
        self.duty
    }
}
