/*!
# Core particle types

This module defines the building blocks shared by the whole crate: the
[`Particle`] type pairing an opaque state-space value with a log-domain
importance weight, the [`MoveSet`] capability trait that clients implement to
drive a sampler, and the effective-sample-size diagnostic.

The state space is an arbitrary client type `S`; the engine only ever asks
for it to be cloneable (for resampling and history snapshots) and sendable
(for the parallel move and MCMC loops). Everything that touches a state value
goes through a [`MoveSet`].

## Example Usage

```rust
use mini_smc::core::Particle;

let mut p = Particle::new(1.5f64, 0.0);
p.add_to_log_weight(-0.5);
assert_eq!(p.log_weight(), -0.5);
assert!((p.weight() - (-0.5f64).exp()).abs() < 1e-12);
```
*/

use std::fmt;

use crate::rng::SmcRng;

/// A single sample point: a value drawn from the state space `S` together
/// with its unnormalised log-weight.
///
/// The log-weight is the authoritative field; [`Particle::weight`] is a
/// convenience exponentiation. A log-weight of `-inf` is legal and marks a
/// particle that contributes nothing to any weighted sum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle<S> {
    value: S,
    log_weight: f64,
}

impl<S> Particle<S> {
    /// Creates a particle from a value and an unnormalised log-weight.
    pub fn new(value: S, log_weight: f64) -> Self {
        Self { value, log_weight }
    }

    /// Returns a reference to the state-space value.
    pub fn value(&self) -> &S {
        &self.value
    }

    /// Returns a mutable reference to the state-space value, for use by move
    /// and MCMC kernels.
    pub fn value_mut(&mut self) -> &mut S {
        &mut self.value
    }

    /// Replaces the state-space value.
    pub fn set_value(&mut self, value: S) {
        self.value = value;
    }

    /// Returns the unnormalised log-weight.
    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

    /// Returns the unnormalised weight, `exp(log_weight)`.
    pub fn weight(&self) -> f64 {
        self.log_weight.exp()
    }

    /// Sets the log-weight.
    pub fn set_log_weight(&mut self, log_weight: f64) {
        self.log_weight = log_weight;
    }

    /// Adds `delta` to the log-weight without leaving the log domain.
    pub fn add_to_log_weight(&mut self, delta: f64) {
        self.log_weight += delta;
    }
}

impl<S: fmt::Display> fmt::Display for Particle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.value, self.log_weight)
    }
}

/// The capability bundle a client supplies to a sampler: initialisation,
/// propagation, and an optional MCMC refinement kernel.
///
/// `do_move` and `do_mcmc` are invoked on distinct particles concurrently
/// from rayon worker threads; each invocation receives its own independently
/// seeded [`SmcRng`] substream, so implementations need no interior
/// synchronisation of their own.
pub trait MoveSet<S>: Send + Sync {
    /// Produces one initial particle with a valid log-weight.
    fn init(&self, rng: &mut SmcRng) -> Particle<S>;

    /// Propagates a particle to time `time`, updating its value and
    /// log-weight in place.
    fn do_move(&self, time: usize, particle: &mut Particle<S>, rng: &mut SmcRng);

    /// Proposes an MCMC refinement of a particle at time `time` and returns
    /// whether the proposal was accepted.
    ///
    /// The default is the always-reject no-op kernel, which is legal.
    fn do_mcmc(&self, time: usize, particle: &mut Particle<S>, rng: &mut SmcRng) -> bool {
        let _ = (time, particle, rng);
        false
    }
}

/// Computes the effective sample size of a weighted population:
/// `(sum of weights)^2 / (sum of squared weights)`, evaluated from the
/// log-weights.
///
/// Particles with `-inf` log-weight contribute zero; a population whose
/// weights all vanish has an ESS of exactly 0.
pub fn effective_sample_size<S>(particles: &[Particle<S>]) -> f64 {
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for particle in particles {
        let lw = particle.log_weight();
        sum += lw.exp();
        sum_sq += (2.0 * lw).exp();
    }
    if sum_sq == 0.0 {
        return 0.0;
    }
    (2.0 * sum.ln() - sum_sq.ln()).exp()
}

/// A record of the ESS observed after each batch of an adaptive
/// variable-population iteration, for client diagnostics.
#[derive(Debug, Clone, Default)]
pub struct EssTrace {
    ess: Vec<f64>,
}

impl EssTrace {
    /// Creates an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards all recorded values.
    pub fn clear(&mut self) {
        self.ess.clear();
    }

    pub(crate) fn record(&mut self, ess: f64) {
        self.ess.push(ess);
    }

    /// The recorded ESS values, one per batch, oldest first.
    pub fn values(&self) -> &[f64] {
        &self.ess
    }

    pub fn len(&self) -> usize {
        self.ess.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ess.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn particle_weight_is_exp_of_log_weight() {
        let mut p = Particle::new(7u32, -1.0);
        assert!((p.weight() - (-1.0f64).exp()).abs() < 1e-15);
        p.add_to_log_weight(1.0);
        assert_eq!(p.log_weight(), 0.0);
        assert_eq!(p.weight(), 1.0);
        p.set_log_weight(f64::NEG_INFINITY);
        assert_eq!(p.weight(), 0.0);
    }

    #[test]
    fn ess_of_uniform_weights_is_population_size() {
        let particles: Vec<Particle<f64>> = (0..8).map(|i| Particle::new(i as f64, 0.0)).collect();
        let ess = effective_sample_size(&particles);
        assert!((ess - 8.0).abs() < 1e-9, "expected 8, got {ess}");
    }

    #[test]
    fn ess_of_degenerate_weights_is_near_one() {
        let mut particles: Vec<Particle<f64>> =
            (0..4).map(|i| Particle::new(i as f64, -100.0)).collect();
        particles[0].set_log_weight(0.0);
        let ess = effective_sample_size(&particles);
        assert!((ess - 1.0).abs() < 1e-9, "expected ~1, got {ess}");
    }

    #[test]
    fn ess_tolerates_all_infinite_log_weights() {
        let particles: Vec<Particle<f64>> = (0..4)
            .map(|i| Particle::new(i as f64, f64::NEG_INFINITY))
            .collect();
        assert_eq!(effective_sample_size(&particles), 0.0);
    }

    #[test]
    fn ess_ignores_single_infinite_log_weight() {
        let mut particles: Vec<Particle<f64>> =
            (0..3).map(|i| Particle::new(i as f64, 0.0)).collect();
        particles[2].set_log_weight(f64::NEG_INFINITY);
        let ess = effective_sample_size(&particles);
        assert!((ess - 2.0).abs() < 1e-9, "expected 2, got {ess}");
    }

    #[test]
    fn trace_records_and_clears() {
        let mut trace = EssTrace::new();
        assert!(trace.is_empty());
        trace.record(3.5);
        trace.record(7.0);
        assert_eq!(trace.values(), &[3.5, 7.0]);
        assert_eq!(trace.len(), 2);
        trace.clear();
        assert!(trace.is_empty());
    }
}
