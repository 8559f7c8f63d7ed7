//! Command processor: the producer/consumer command pipeline and the
//! closed-loop RPM controller.
//!
//! Network tasks talk to it through three synchronized entry points
//! (`configure`, `submit`, `take_status`) plus `set_status`; the fan bank
//! itself is touched only by the control loop and the `Off` safety path.
//!
//! ## Control loop, one iteration
//! 1. `Off` → pin every output low and bail (safety redundancy)
//! 2. dequeue at most one command and apply it
//! 3. per active fan: read RPM, run the chase step (stability check,
//!    stall accounting, proportional correction)
//! 4. publish a status report if the outbound slot allows it

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use fanbus_types::{Command, ConfigError, ProcessorConfig, StatusReport};
use thiserror::Error;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::fan::{FanChannelConfig, FanDriver, FanState};
use crate::mailbox::{Mailbox, MailboxPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorStatus {
    Off,
    Active,
    Chasing,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("processor must be off before reconfiguration")]
    NotOff,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("config names {wanted} fans, bank has {have}")]
    BankSize { wanted: usize, have: usize },
    #[error("fan channel {0} rejected configuration")]
    Channel(usize),
}

struct FanBank {
    drivers: Vec<Box<dyn FanDriver>>,
    states: Vec<FanState>,
}

pub struct CommandProcessor {
    status: RwLock<ProcessorStatus>,
    config: RwLock<Option<ProcessorConfig>>,
    bank: Mutex<FanBank>,
    inbound: Mailbox<Command>,
    outbound: Mailbox<StatusReport>,
    data_index: AtomicU64,
    tick_period: Duration,
    read_timeout: Duration,
}

impl CommandProcessor {
    pub fn new(
        drivers: Vec<Box<dyn FanDriver>>,
        command_policy: MailboxPolicy,
        status_policy: MailboxPolicy,
        tick_period: Duration,
        read_timeout: Duration,
    ) -> Self {
        let states = vec![FanState::default(); drivers.len()];
        Self {
            status: RwLock::new(ProcessorStatus::Off),
            config: RwLock::new(None),
            bank: Mutex::new(FanBank { drivers, states }),
            inbound: Mailbox::new(command_policy),
            outbound: Mailbox::new(status_policy),
            data_index: AtomicU64::new(0),
            tick_period,
            read_timeout,
        }
    }

    fn lock_bank(&self) -> MutexGuard<'_, FanBank> {
        self.bank.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> ProcessorStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> Option<ProcessorConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Parse, range-validate and install a handshake config record.
    /// All-or-nothing: on any failure the previous configuration and every
    /// fan state stay untouched. Legal only while `Off`.
    pub fn configure(&self, payload: &str) -> Result<(), ProcessorError> {
        if self.status() != ProcessorStatus::Off {
            return Err(ProcessorError::NotOff);
        }
        let cfg = ProcessorConfig::parse(payload)?;
        let mut bank = self.lock_bank();
        if cfg.active_fans > bank.drivers.len() {
            return Err(ProcessorError::BankSize {
                wanted: cfg.active_fans,
                have: bank.drivers.len(),
            });
        }
        for i in 0..cfg.active_fans {
            let channel = FanChannelConfig {
                pwm_pin: cfg.pwm_pins[i],
                tach_pin: cfg.tach_pins[i],
                pwm_freq_hz: cfg.pwm_freq_hz,
                tach_pulse_count: cfg.tach_pulse_count,
                pulses_per_rev: cfg.pulses_per_rev,
                min_rpm: cfg.min_rpm,
                min_duty: cfg.min_duty,
                max_timeouts: cfg.max_fan_timeouts,
            };
            bank.drivers[i]
                .configure(&channel)
                .map_err(|_| ProcessorError::Channel(i))?;
            bank.states[i] = FanState::default();
        }
        drop(bank);
        info!(
            "processor: configured {} fans, {}..{} rpm, min duty {}",
            cfg.active_fans, cfg.min_rpm, cfg.max_rpm, cfg.min_duty
        );
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Some(cfg);
        Ok(())
    }

    /// Place one command into the inbound slot. `false` means the slot is
    /// occupied under `RejectIfFull`; the Master is expected to resend.
    pub fn submit(&self, cmd: Command) -> bool {
        self.inbound.post(cmd)
    }

    /// Non-blocking drain of the outbound status slot.
    pub fn take_status(&self) -> Option<StatusReport> {
        self.outbound.take()
    }

    pub fn set_status(&self, next: ProcessorStatus) {
        {
            let mut cur = self.status.write().unwrap_or_else(|e| e.into_inner());
            if *cur == next {
                return;
            }
            info!("processor: {:?} -> {:?}", *cur, next);
            *cur = next;
        }
        if next == ProcessorStatus::Off {
            let mut bank = self.lock_bank();
            let FanBank { drivers, states } = &mut *bank;
            for (driver, state) in drivers.iter_mut().zip(states.iter_mut()) {
                if let Err(e) = driver.write(0.0) {
                    warn!("processor: failed to silence fan: {e}");
                }
                *state = FanState::default();
            }
            drop(bank);
            self.inbound.clear();
            self.outbound.clear();
            self.data_index.store(0, Ordering::Release);
        }
    }

    /// Drive the control loop forever at the configured tick period.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.tick_period);
        info!("⚙ control loop every {:?}", self.tick_period);
        loop {
            ticker.tick().await;
            self.tick();
        }
    }

    /// One control-loop iteration. Public so tests can step deterministically.
    pub fn tick(&self) {
        let status = self.status();
        let mut bank = self.lock_bank();
        if status == ProcessorStatus::Off {
            for driver in bank.drivers.iter_mut() {
                let _ = driver.write(0.0);
            }
            return;
        }
        let Some(cfg) = self.config() else { return };
        if let Some(cmd) = self.inbound.take() {
            self.apply_command(cmd, &mut bank, &cfg);
        }
        self.service_fans(&mut bank, &cfg);
        self.publish_status(&bank, &cfg);
        let active = cfg.active_fans.min(bank.states.len());
        let chasing = bank.states[..active].iter().any(|s| s.chase_target.is_some());
        drop(bank);
        self.refresh_chase_indicator(chasing);
    }

    // Active vs Chasing is indicator state only; it never gates actuation.
    fn refresh_chase_indicator(&self, chasing: bool) {
        let mut cur = self.status.write().unwrap_or_else(|e| e.into_inner());
        let next = if chasing {
            ProcessorStatus::Chasing
        } else {
            ProcessorStatus::Active
        };
        if *cur != ProcessorStatus::Off && *cur != next {
            debug!("processor: {:?} -> {:?}", *cur, next);
            *cur = next;
        }
    }

    fn apply_command(&self, cmd: Command, bank: &mut FanBank, cfg: &ProcessorConfig) {
        let FanBank { drivers, states } = bank;
        match cmd {
            Command::Write { duty, mask } => {
                for i in mask.selected().filter(|&i| i < cfg.active_fans) {
                    write_duty(&mut drivers[i], &mut states[i], duty, cfg);
                    states[i].chase_target = None;
                    states[i].stall_count = 0;
                }
            }
            Command::Chase { target_rpm, mask } => {
                let guess = chase_first_guess(target_rpm, cfg);
                for i in mask.selected().filter(|&i| i < cfg.active_fans) {
                    write_duty(&mut drivers[i], &mut states[i], guess, cfg);
                    states[i].chase_target = Some(target_rpm);
                    states[i].stall_count = 0;
                }
            }
            Command::MultiWrite { duties } => {
                // all-or-nothing: a partial vector never applies partially
                if duties.len() != cfg.active_fans {
                    warn!(
                        "processor: multi-write carries {} duties for {} fans, discarded",
                        duties.len(),
                        cfg.active_fans
                    );
                    return;
                }
                for (i, duty) in duties.into_iter().enumerate() {
                    write_duty(&mut drivers[i], &mut states[i], duty, cfg);
                    states[i].chase_target = None;
                    states[i].stall_count = 0;
                }
            }
            Command::Configure(_) => {
                // reconfiguration is a handshake concern and needs Off
                warn!("processor: configure while running, ignored");
            }
        }
    }

    fn service_fans(&self, bank: &mut FanBank, cfg: &ProcessorConfig) {
        let FanBank { drivers, states } = bank;
        let active = cfg.active_fans.min(drivers.len());
        for i in 0..active {
            let rpm = drivers[i].read(self.read_timeout);
            let state = &mut states[i];
            if rpm < 0 {
                // tach has never captured a pulse on this channel
                state.last_rpm = rpm;
                state.rpm_delta = 0;
                continue;
            }
            let delta = if state.last_rpm < 0 { 0 } else { rpm - state.last_rpm };
            state.rpm_delta = delta;
            state.last_rpm = rpm;

            let Some(target) = state.chase_target else { continue };
            let band = cfg.tolerance_band();
            let err = (rpm as f64 - target as f64).abs();
            if err <= band {
                continue;
            }
            let unstable = (delta as f64).abs() > band;
            let stalled = rpm == 0 && state.duty >= cfg.min_duty && state.duty > 0.0;
            if unstable || stalled {
                state.stall_count += 1;
                if state.stall_count >= cfg.max_fan_timeouts {
                    warn!(
                        "processor: fan {i} stalled {} ticks chasing {target} rpm, chase aborted",
                        state.stall_count
                    );
                    state.chase_target = None;
                    state.stall_count = 0;
                    if drivers[i].write(0.0).is_ok() {
                        state.duty = 0.0;
                    }
                }
            } else {
                let correction = (target as f64 - rpm as f64) / cfg.max_rpm as f64;
                let next = state.duty + correction;
                write_duty(&mut drivers[i], state, next, cfg);
                state.stall_count = 0;
            }
        }
    }

    fn publish_status(&self, bank: &FanBank, cfg: &ProcessorConfig) {
        let active = cfg.active_fans.min(bank.states.len());
        let rpm = bank.states[..active]
            .iter()
            .map(|s| s.last_rpm.max(0) as u32)
            .collect();
        let duty = bank.states[..active].iter().map(|s| s.duty).collect();
        let report = StatusReport {
            data_index: self.data_index.load(Ordering::Acquire) + 1,
            rpm,
            duty,
        };
        if self.outbound.post(report) {
            self.data_index.fetch_add(1, Ordering::AcqRel);
        } else {
            debug!("processor: status slot occupied, report skipped");
        }
    }

    // ── Test/diagnostic views ─────────────────────────────────────────────

    pub fn fan_snapshot(&self) -> Vec<FanState> {
        self.lock_bank().states.clone()
    }

    pub fn mailboxes_empty(&self) -> bool {
        self.inbound.is_empty() && self.outbound.is_empty()
    }
}

/// Linear first guess for a chase: `target / maxRPM`, with the boundary
/// rule `target < minRPM ⇒ 0` and `target ≥ maxRPM ⇒ 1`.
pub fn chase_first_guess(target_rpm: u32, cfg: &ProcessorConfig) -> f64 {
    if target_rpm < cfg.min_rpm {
        0.0
    } else if target_rpm >= cfg.max_rpm {
        1.0
    } else {
        (target_rpm as f64 / cfg.max_rpm as f64).clamp(0.0, 1.0)
    }
}

/// Clamp to `[0, 1]` and hold requests strictly between 0 and the minimum
/// duty at the minimum, so fans never run below their stall point.
fn clamp_duty(duty: f64, cfg: &ProcessorConfig) -> f64 {
    let d = duty.clamp(0.0, 1.0);
    if d > 0.0 && d < cfg.min_duty {
        cfg.min_duty
    } else {
        d
    }
}

fn write_duty(
    driver: &mut Box<dyn FanDriver>,
    state: &mut FanState,
    duty: f64,
    cfg: &ProcessorConfig,
) {
    let duty = clamp_duty(duty, cfg);
    match driver.write(duty) {
        Ok(()) => state.duty = duty,
        Err(e) => warn!("processor: duty write failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fan::{SimFan, SimFanConfig};

    const CONFIG: &str = r"1 4 5000 1 2 11500 1185 0.1 0.05 5 ABCD [\]^";

    fn sim(noise: f64, stall_below: f64) -> SimFanConfig {
        SimFanConfig {
            max_rpm: 11500.0,
            response: 0.5,
            noise_rpm: noise,
            stall_below,
        }
    }

    fn processor_with(sim_cfg: SimFanConfig) -> CommandProcessor {
        CommandProcessor::new(
            SimFan::bank(sim_cfg, 4),
            MailboxPolicy::RejectIfFull,
            MailboxPolicy::OverwriteLatest,
            Duration::from_millis(20),
            Duration::from_millis(1),
        )
    }

    fn configured() -> CommandProcessor {
        let p = processor_with(sim(0.0, 0.04));
        p.configure(CONFIG).unwrap();
        p.set_status(ProcessorStatus::Active);
        p
    }

    #[test]
    fn configure_requires_off() {
        let p = processor_with(sim(0.0, 0.04));
        p.configure(CONFIG).unwrap();
        p.set_status(ProcessorStatus::Active);
        assert!(matches!(p.configure(CONFIG), Err(ProcessorError::NotOff)));
    }

    #[test]
    fn configure_is_all_or_nothing() {
        let p = processor_with(sim(0.0, 0.04));
        p.configure(CONFIG).unwrap();
        let before = p.config().unwrap();
        // tolerance out of range: whole record rejected
        let bad = CONFIG.replace("0.1", "1.5");
        assert!(p.configure(&bad).is_err());
        assert_eq!(p.config().unwrap(), before);
    }

    #[test]
    fn configure_rejects_more_fans_than_bank() {
        let p = CommandProcessor::new(
            SimFan::bank(sim(0.0, 0.04), 2),
            MailboxPolicy::RejectIfFull,
            MailboxPolicy::OverwriteLatest,
            Duration::from_millis(20),
            Duration::from_millis(1),
        );
        assert!(matches!(
            p.configure(CONFIG),
            Err(ProcessorError::BankSize { wanted: 4, have: 2 })
        ));
    }

    #[test]
    fn write_respects_mask_and_duty_floor() {
        let p = configured();
        p.submit(Command::parse_body("D:0.5:1100").unwrap());
        p.tick();
        let fans = p.fan_snapshot();
        assert_eq!(fans[0].duty, 0.5);
        assert_eq!(fans[1].duty, 0.5);
        assert_eq!(fans[2].duty, 0.0);
        assert_eq!(fans[3].duty, 0.0);

        // a request strictly between 0 and min duty is held at min duty
        p.submit(Command::parse_body("D:0.02:1111").unwrap());
        p.tick();
        assert!(p.fan_snapshot().iter().all(|s| s.duty == 0.05));
    }

    #[test]
    fn partial_multi_write_is_discarded_whole() {
        let p = configured();
        p.submit(Command::parse_body("F:0.2:0.4:0.6").unwrap());
        p.tick();
        assert!(p.fan_snapshot().iter().all(|s| s.duty == 0.0));

        p.submit(Command::parse_body("F:0.2:0.4:0.6:0.8").unwrap());
        p.tick();
        let duties: Vec<f64> = p.fan_snapshot().iter().map(|s| s.duty).collect();
        assert_eq!(duties, vec![0.2, 0.4, 0.6, 0.8]);
    }

    #[test]
    fn chase_first_guess_matches_linear_fit() {
        let cfg = ProcessorConfig::parse(CONFIG).unwrap();
        assert!((chase_first_guess(6000, &cfg) - 0.5217).abs() < 1e-3);
        assert_eq!(chase_first_guess(1000, &cfg), 0.0); // below min rpm
        assert_eq!(chase_first_guess(11500, &cfg), 1.0);
        assert_eq!(chase_first_guess(20000, &cfg), 1.0);
    }

    #[test]
    fn chase_converges_on_a_monotonic_fan() {
        let p = configured();
        p.submit(Command::parse_body("C:6000:1111").unwrap());
        for _ in 0..60 {
            p.tick();
        }
        let cfg = p.config().unwrap();
        for state in &p.fan_snapshot() {
            assert_eq!(state.chase_target, Some(6000));
            let err = (state.last_rpm as f64 - 6000.0).abs();
            assert!(err <= cfg.tolerance_band(), "rpm {} off target", state.last_rpm);
        }
        assert_eq!(p.status(), ProcessorStatus::Chasing);
    }

    #[test]
    fn chase_aborts_after_max_stall_timeouts() {
        // rotor dead below 0.9 duty: the 0.52 first guess never spins it
        let p = processor_with(sim(0.0, 0.9));
        p.configure(CONFIG).unwrap();
        p.set_status(ProcessorStatus::Active);
        p.submit(Command::parse_body("C:6000:1000").unwrap());
        for _ in 0..10 {
            p.tick();
        }
        let fans = p.fan_snapshot();
        let fan = &fans[0];
        assert_eq!(fan.chase_target, None);
        assert_eq!(fan.duty, 0.0);
        // no chase left anywhere: indicator drops back to Active
        assert_eq!(p.status(), ProcessorStatus::Active);
    }

    #[test]
    fn off_zeroes_fans_and_clears_mailboxes() {
        let p = configured();
        p.submit(Command::parse_body("D:0.8:1111").unwrap());
        p.tick(); // applies the duty and publishes a report
        assert!(!p.mailboxes_empty());

        p.set_status(ProcessorStatus::Off);
        assert!(p.mailboxes_empty());
        assert!(p.take_status().is_none());
        assert!(p.fan_snapshot().iter().all(|s| s.duty == 0.0));
    }

    #[test]
    fn status_reports_carry_ascending_data_index() {
        let p = configured();
        p.tick();
        assert_eq!(p.take_status().unwrap().data_index, 1);
        p.tick();
        p.tick(); // overwrite-latest: second report replaces the first
        let report = p.take_status().unwrap();
        assert_eq!(report.data_index, 3);
        assert_eq!(report.rpm.len(), 4);
        assert_eq!(report.duty.len(), 4);
    }

    #[test]
    fn command_slot_rejects_when_full() {
        let p = configured();
        assert!(p.submit(Command::parse_body("D:0.5:1111").unwrap()));
        assert!(!p.submit(Command::parse_body("D:0.6:1111").unwrap()));
    }
}
