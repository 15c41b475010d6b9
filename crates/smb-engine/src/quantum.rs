//! Adaptive transfer sizing.
//!
//! A controller keeps one throughput sample per candidate size. On every recheck
//! the samples are cleared and the candidates are measured again, largest first;
//! between rechecks the best sampled size is used.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::QuantumConfig;
use crate::credits::charge_for;

/// Size and parallelism for the chunks of one bulk transfer.
///
/// `size * count` always fits the credits granted beyond the reserve, so a
/// window at or below the reserve yields a count of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantumPlan {
    pub size: u32,
    pub count: u32,
}

/// What the connection can afford when a plan is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub credits_max: u32,
    pub reserve: u16,
    pub large_mtu: bool,
    /// Negotiated max read or write size.
    pub max_io: u32,
}

impl Limits {
    /// Credits a bulk transfer may keep in flight.
    pub fn budget(&self) -> u32 {
        self.credits_max.saturating_sub(self.reserve as u32)
    }

    pub fn charge(&self, size: u32) -> u32 {
        if self.large_mtu {
            charge_for(size) as u32
        } else {
            1
        }
    }

    fn fits(&self, size: u32, count: u32) -> bool {
        size <= self.max_io && self.charge(size) * count <= self.budget()
    }
}

#[derive(Debug)]
struct QuantumState {
    samples: [Option<f64>; 3],
    unmeasured: VecDeque<usize>,
    last_recheck: Option<Instant>,
    selected: usize,
}

#[derive(Debug)]
pub struct QuantumController {
    config: QuantumConfig,
    state: Mutex<QuantumState>,
}

impl QuantumController {
    pub fn new(config: QuantumConfig) -> QuantumController {
        QuantumController {
            config,
            state: Mutex::new(QuantumState {
                samples: [None; 3],
                unmeasured: VecDeque::new(),
                last_recheck: None,
                selected: 0,
            }),
        }
    }

    pub fn config(&self) -> &QuantumConfig {
        &self.config
    }

    pub fn plan(&self, limits: Limits) -> QuantumPlan {
        self.plan_at(Instant::now(), limits)
    }

    pub fn plan_at(&self, now: Instant, limits: Limits) -> QuantumPlan {
        let mut state = self.lock();
        let due = state
            .last_recheck
            .is_none_or(|at| now.duration_since(at) >= self.config.recheck_interval);
        if due {
            log::debug!("Quantum recheck: measuring {:?}", self.config.candidate_sizes);
            state.samples = [None; 3];
            state.unmeasured = (0..self.config.candidate_sizes.len()).rev().collect();
            state.last_recheck = Some(now);
        }

        while let Some(&index) = state.unmeasured.front() {
            let size = self.config.candidate_sizes[index];
            if limits.fits(size, 1) {
                return self.clamp(size, limits);
            }
            log::warn!(
                "Skipping quantum size {size}: needs {} credits, {} available beyond the reserve",
                limits.charge(size),
                limits.budget()
            );
            state.samples[index] = Some(0.0);
            state.unmeasured.pop_front();
            self.select_best(&mut state);
        }

        // The selected size, or the largest smaller candidate the window can pay for.
        let selected = state.selected;
        let Some(index) = (0..=selected)
            .rev()
            .find(|&i| limits.fits(self.config.candidate_sizes[i], 1))
        else {
            let size = self.config.candidate_sizes[0].min(limits.max_io.max(1));
            log::warn!(
                "No quantum size fits {} credits beyond the reserve, planning no chunks in flight",
                limits.budget()
            );
            return QuantumPlan { size, count: 0 };
        };
        let size = self.config.candidate_sizes[index];
        if index != selected {
            log::warn!(
                "Quantum size {} does not fit the credit window, using {size}",
                self.config.candidate_sizes[selected]
            );
        }
        self.clamp(size, limits)
    }

    /// Bounds the count by in-flight bytes, the configured maximum and the credit budget.
    ///
    /// The count is zero when not even one chunk of `size` fits the budget.
    fn clamp(&self, size: u32, limits: Limits) -> QuantumPlan {
        let by_bytes = (self.config.max_in_flight_bytes / size as u64).max(1);
        let mut count = by_bytes.min(self.config.max_count as u64) as u32;
        let affordable = limits.budget() / limits.charge(size);
        if affordable < count {
            log::debug!("Clamping quantum count {count} to {affordable} by credits");
            count = affordable;
        }
        QuantumPlan { size, count }
    }

    /// Feeds the throughput of a finished large transfer done with chunk `size`.
    ///
    /// A transfer that lived through a reconnect measured the reconnect, not the
    /// link, and is dropped.
    pub fn record(&self, size: u32, bytes: u64, elapsed: Duration, reconnected: bool) {
        if reconnected {
            log::debug!("Discarding quantum sample for size {size}: transfer spanned a reconnect");
            return;
        }
        let Some(index) = self.config.candidate_sizes.iter().position(|s| *s == size) else {
            return;
        };
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let throughput = bytes as f64 / secs;
        let mut state = self.lock();
        state.samples[index] = Some(throughput);
        if state.unmeasured.front() == Some(&index) {
            state.unmeasured.pop_front();
        }
        self.select_best(&mut state);
    }

    fn select_best(&self, state: &mut QuantumState) {
        let best = state
            .samples
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (i, s)))
            .filter(|(_, s)| *s > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        if best != state.selected {
            log::debug!(
                "Quantum size now {}",
                self.config.candidate_sizes[best]
            );
            state.selected = best;
        }
    }

    /// The size used between rechecks.
    pub fn selected_size(&self) -> u32 {
        self.config.candidate_sizes[self.lock().selected]
    }

    pub fn is_measuring(&self) -> bool {
        !self.lock().unmeasured.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QuantumState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
