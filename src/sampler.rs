/*!
# Sampler driver

This module implements the interacting-particle engine: a [`Sampler`] owns a
population of [`Particle`]s, a seedable random source, the resampling
workspace, and (optionally) the generation history and lineage graph, and
evolves the population through discrete time by applying a client
[`MoveSet`].

## Overview

Each standard iteration pushes the outgoing generation onto the history,
propagates every particle in parallel, renormalises the log-weights so their
maximum is zero, and checks the effective sample size against the configured
threshold. Below the threshold the population is resampled with the
configured scheme; the adaptive [`ResampleMode::Fribble`] scheme instead
grows the population in freshly-moved batches until the ESS recovers, then
downsamples back to size. An optional MCMC sweep restores diversity after
resampling, and the time index advances by one.

## Example Usage

```rust
use mini_smc::core::{MoveSet, Particle};
use mini_smc::history::HistoryMode;
use mini_smc::resample::ResampleMode;
use mini_smc::rng::SmcRng;
use mini_smc::sampler::Sampler;
use rand::Rng;

// A random-walk kernel over a one-dimensional state space, reweighted
// towards the origin.
struct RandomWalk;

impl MoveSet<f64> for RandomWalk {
    fn init(&self, rng: &mut SmcRng) -> Particle<f64> {
        Particle::new(rng.uniform(-1.0, 1.0), 0.0)
    }

    fn do_move(&self, _time: usize, particle: &mut Particle<f64>, rng: &mut SmcRng) {
        let step: f64 = rng.gen_range(-0.5..0.5);
        let value = *particle.value() + step;
        particle.set_value(value);
        particle.add_to_log_weight(-0.5 * value * value);
    }
}

let mut sampler = Sampler::with_seed(100, HistoryMode::Ram, 42).unwrap();
sampler.set_moveset(RandomWalk);
sampler.set_resample_params(ResampleMode::Systematic, 0.5).unwrap();
sampler.initialise();
let ess = sampler.iterate_ess();
assert!(ess > 0.0);
assert_eq!(sampler.time(), 1);
```
*/

use std::fmt;
use std::io;
use std::mem;

use rayon::prelude::*;
use rayon::ThreadPool;
use thiserror::Error;

use crate::core::{effective_sample_size, EssTrace, MoveSet, Particle};
use crate::graph::LineageGraph;
use crate::history::{History, HistoryFlags, HistoryMode};
use crate::resample::{
    counts_to_ordered_indices, sample_strata_indices, ResampleMode, ResampleWorkspace,
};
use crate::rng::SmcRng;

/// Hard ceiling on the transient population size in the adaptive
/// variable-population mode.
pub const MAX_POPULATION: usize = 100_000;

/// Failures surfaced by the sampler.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SmcError {
    /// Rollback or path sampling was requested while the history mode is
    /// [`HistoryMode::None`].
    #[error("the system history was not stored; construct the sampler with HistoryMode::Ram")]
    MissingHistory,

    /// A configuration parameter is out of range.
    #[error("invalid sampler configuration: {0}")]
    InvalidConfiguration(String),
}

/// An interacting particle system evolving a weighted population of points
/// in the state space `S` under the kernels of a [`MoveSet`] `M`.
pub struct Sampler<S, M> {
    /// Master random source; parallel loops use per-slot substreams.
    rng: SmcRng,
    /// Configured population size.
    n: usize,
    /// Current evolution time.
    time: usize,
    resample_mode: ResampleMode,
    /// ESS level below which the population is resampled.
    resample_threshold: f64,
    workspace: ResampleWorkspace,
    particles: Vec<Particle<S>>,
    moves: Option<M>,
    /// MCMC acceptances during the most recent iteration.
    accepted: usize,
    /// Whether the most recent iteration resampled.
    resampled: bool,
    history_mode: HistoryMode,
    history: History<S>,
    pool: Option<ThreadPool>,
    graph: Option<LineageGraph>,
}

impl<S, M> Sampler<S, M> {
    /// Creates a sampler for `n` particles with an entropy-seeded random
    /// source.
    pub fn new(n: usize, history_mode: HistoryMode) -> Result<Self, SmcError> {
        Self::build(n, history_mode, SmcRng::from_entropy())
    }

    /// Creates a sampler for `n` particles with an explicitly seeded random
    /// source, for reproducible runs.
    pub fn with_seed(n: usize, history_mode: HistoryMode, seed: u64) -> Result<Self, SmcError> {
        Self::build(n, history_mode, SmcRng::seeded(seed))
    }

    fn build(n: usize, history_mode: HistoryMode, rng: SmcRng) -> Result<Self, SmcError> {
        if n == 0 {
            return Err(SmcError::InvalidConfiguration(
                "particle count must be positive".into(),
            ));
        }
        Ok(Self {
            rng,
            n,
            time: 0,
            resample_mode: ResampleMode::Stratified,
            resample_threshold: 0.5 * n as f64,
            workspace: ResampleWorkspace::new(n),
            particles: Vec::with_capacity(n),
            moves: None,
            accepted: 0,
            resampled: false,
            history_mode,
            history: History::new(),
            pool: None,
            graph: None,
        })
    }

    /// Assigns the move set driving initialisation, propagation and MCMC.
    pub fn set_moveset(&mut self, moves: M) {
        self.moves = Some(moves);
    }

    /// Configures the resampling scheme and threshold.
    ///
    /// A threshold below 1 is interpreted as a fraction of the population
    /// size; otherwise it is an absolute effective sample size.
    pub fn set_resample_params(&mut self, mode: ResampleMode, threshold: f64) -> Result<(), SmcError> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(SmcError::InvalidConfiguration(format!(
                "resample threshold must be positive, got {threshold}"
            )));
        }
        self.resample_mode = mode;
        self.resample_threshold = if threshold < 1.0 {
            threshold * self.n as f64
        } else {
            threshold
        };
        Ok(())
    }

    /// Sets the worker count for the parallel move and MCMC loops. By
    /// default the loops run on the global rayon pool.
    pub fn set_num_threads(&mut self, threads: usize) -> Result<(), SmcError> {
        if threads == 0 {
            return Err(SmcError::InvalidConfiguration(
                "worker count must be positive".into(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| SmcError::InvalidConfiguration(format!("cannot build worker pool: {e}")))?;
        self.pool = Some(pool);
        Ok(())
    }

    /// Starts recording the particle lineage graph. Call before
    /// [`Sampler::initialise`] for a complete ancestry.
    pub fn enable_lineage_graph(&mut self) {
        self.graph = Some(LineageGraph::new());
    }

    /// The recorded lineage graph, if enabled.
    pub fn lineage_graph(&self) -> Option<&LineageGraph> {
        self.graph.as_ref()
    }

    /// The configured population size.
    pub fn num_particles(&self) -> usize {
        self.n
    }

    /// The current evolution time.
    pub fn time(&self) -> usize {
        self.time
    }

    /// The effective sample size of the current population.
    pub fn ess(&self) -> f64 {
        effective_sample_size(&self.particles)
    }

    /// The value of particle `i`.
    pub fn particle_value(&self, i: usize) -> &S {
        self.particles[i].value()
    }

    /// The unnormalised log-weight of particle `i`.
    pub fn particle_log_weight(&self, i: usize) -> f64 {
        self.particles[i].log_weight()
    }

    /// The unnormalised weight of particle `i`.
    pub fn particle_weight(&self, i: usize) -> f64 {
        self.particles[i].weight()
    }

    /// The number of MCMC proposals accepted during the most recent
    /// iteration.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Whether the most recent iteration resampled the population.
    pub fn resampled(&self) -> bool {
        self.resampled
    }

    /// The stored generation history.
    pub fn history(&self) -> &History<S> {
        &self.history
    }

    /// Integrates `integrand` under the empirical measure of the current
    /// population.
    pub fn integrate<A>(&self, integrand: impl Fn(&S, &A) -> f64, aux: &A) -> f64 {
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for particle in &self.particles {
            let w = particle.weight();
            weighted += w * integrand(particle.value(), aux);
            weight_sum += w;
        }
        weighted / weight_sum
    }

    /// Draws `m` parent indices from the current weighted population with a
    /// single multinomial draw.
    pub fn sample_multinomial(&mut self, m: usize) -> Vec<usize> {
        let weights: Vec<f64> = self.particles.iter().map(|p| p.weight()).collect();
        let mut counts = vec![0u32; weights.len()];
        self.rng.multinomial(m as u32, &weights, &mut counts);
        counts_to_ordered_indices(&counts, m)
    }

    /// Draws `m` parent indices from the current weighted population with
    /// the systematic rule, or the stratified rule when `stratified` is set.
    pub fn sample_systematic(&mut self, m: usize, stratified: bool) -> Vec<usize> {
        sample_strata_indices(&self.particles, m, stratified, &mut self.rng)
    }

    /// Draws `m` parent indices from the current weighted population with
    /// the stratified rule.
    pub fn sample_stratified(&mut self, m: usize) -> Vec<usize> {
        self.sample_systematic(m, true)
    }

    /// Writes particle `i` in human-readable form.
    pub fn stream_particle<W: io::Write>(&self, writer: &mut W, i: usize) -> io::Result<()>
    where
        S: fmt::Display,
    {
        writeln!(writer, "{}", self.particles[i])
    }

    /// Writes the whole population in human-readable form, one particle per
    /// line.
    pub fn stream_particles<W: io::Write>(&self, writer: &mut W) -> io::Result<()>
    where
        S: fmt::Display,
    {
        for particle in &self.particles {
            writeln!(writer, "{particle}")?;
        }
        Ok(())
    }
}

impl<S: Clone, M> Sampler<S, M> {
    /// Cancels the most recent iteration, restoring the previous generation
    /// from the history and decrementing the time index.
    ///
    /// Returns `Ok(false)` when there is no snapshot left to restore.
    pub fn iterate_back(&mut self) -> Result<bool, SmcError> {
        if self.history_mode == HistoryMode::None {
            return Err(SmcError::MissingHistory);
        }
        match self.history.pop() {
            Some(snapshot) => {
                self.n = snapshot.n;
                self.particles = snapshot.particles;
                self.accepted = snapshot.accepted;
                self.resampled = snapshot.flags.resampled();
                self.time = self.time.saturating_sub(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Estimates the path-sampling integral over the stored trajectory,
    /// including the current generation.
    pub fn integrate_path_sampling<A>(
        &mut self,
        integrand: impl Fn(usize, &Particle<S>, &A) -> f64,
        width: impl Fn(usize, &A) -> f64,
        aux: &A,
    ) -> Result<f64, SmcError> {
        if self.history_mode == HistoryMode::None {
            return Err(SmcError::MissingHistory);
        }
        self.history.push(
            self.n,
            &self.particles,
            self.accepted,
            HistoryFlags::new(self.resampled),
        );
        let result = self.history.integrate_path_sampling(integrand, width, aux);
        self.history.pop();
        Ok(result)
    }
}

impl<S, M> Sampler<S, M>
where
    S: Clone + Send,
    M: MoveSet<S>,
{
    /// Resets the evolution time to zero and draws a fresh population from
    /// the move set's initialiser. With history enabled the stack is emptied
    /// and reseeded with the generation-0 snapshot.
    ///
    /// # Panics
    ///
    /// Panics if no move set has been assigned.
    pub fn initialise(&mut self) {
        self.time = 0;
        let n = self.n;
        let Self {
            moves,
            particles,
            rng,
            ..
        } = &mut *self;
        let moves = moves.as_ref().expect("a move set must be assigned before initialise");
        particles.clear();
        particles.extend((0..n).map(|_| moves.init(rng)));
        self.accepted = 0;
        self.resampled = false;
        if self.history_mode != HistoryMode::None {
            self.history.clear();
            self.history
                .push(self.n, &self.particles, 0, HistoryFlags::new(false));
        }
        if let Some(graph) = &mut self.graph {
            *graph = LineageGraph::new();
        }
    }

    /// Performs one iteration of the simulation algorithm.
    pub fn iterate(&mut self) {
        self.iterate_ess();
    }

    /// Performs iterations until the evolution time reaches `terminate`.
    pub fn iterate_until(&mut self, terminate: usize) {
        while self.time < terminate {
            self.iterate();
        }
    }

    /// Performs one iteration and returns the effective sample size observed
    /// after the move, before any resampling.
    ///
    /// The iteration appends the outgoing generation to the history, moves
    /// every particle in parallel, shifts the log-weights so their maximum is
    /// zero, resamples if the ESS fell below the threshold, applies the MCMC
    /// kernel in parallel, and advances the time index.
    pub fn iterate_ess(&mut self) -> f64 {
        if self.history_mode != HistoryMode::None {
            self.history.push(
                self.n,
                &self.particles,
                self.accepted,
                HistoryFlags::new(self.resampled),
            );
        }
        self.accepted = 0;

        self.move_particles();

        let max_log_weight = self
            .particles
            .iter()
            .map(|p| p.log_weight())
            .fold(f64::NEG_INFINITY, f64::max);
        if max_log_weight.is_finite() {
            for particle in &mut self.particles {
                particle.add_to_log_weight(-max_log_weight);
            }
        }

        let ess = self.ess();
        if ess < self.resample_threshold {
            self.resampled = true;
            if self.resample_mode == ResampleMode::Fribble {
                log::debug!("adaptive resample triggered: ess = {ess:.3}");
                self.resample_fribble(None);
                self.accepted = self.apply_mcmc();
            } else {
                self.resample(self.resample_mode);
            }
        } else {
            self.resampled = false;
            if let Some(graph) = &mut self.graph {
                graph.record_generation(self.time, None, self.n);
            }
        }

        if self.resample_mode != ResampleMode::Fribble {
            self.accepted = self.apply_mcmc();
        }

        self.time += 1;
        ess
    }

    /// Performs one adaptive variable-population iteration: the population
    /// is rebuilt in freshly-moved batches of the starting particles until
    /// the accumulated ESS reaches the threshold (or [`MAX_POPULATION`]),
    /// then downsampled back to size with the stratified rule. Returns the
    /// final accumulated ESS; each batch's ESS is appended to `trace` when
    /// one is supplied.
    pub fn iterate_ess_variable(&mut self, trace: Option<&mut EssTrace>) -> f64 {
        debug_assert_eq!(self.particles.len(), self.n);
        if self.history_mode != HistoryMode::None {
            self.history.push(
                self.n,
                &self.particles,
                self.accepted,
                HistoryFlags::new(self.resampled),
            );
        }
        let ess = self.resample_fribble(trace);
        self.accepted = self.apply_mcmc();
        self.time += 1;
        debug_assert_eq!(self.particles.len(), self.n);
        ess
    }

    /// Moves every particle of the current population in parallel.
    fn move_particles(&mut self) {
        let mut particles = mem::take(&mut self.particles);
        self.move_batch(&mut particles);
        self.particles = particles;
    }

    /// Applies the move kernel to each particle of `batch` in parallel, each
    /// worker on its own RNG substream.
    fn move_batch(&mut self, batch: &mut [Particle<S>]) {
        let time = self.time + 1;
        let seeds: Vec<u64> = (0..batch.len()).map(|_| self.rng.substream_seed()).collect();
        let moves = self.moves.as_ref().expect("a move set must be assigned before iterating");
        let task = || {
            batch.par_iter_mut().zip(seeds).for_each(|(particle, seed)| {
                let mut rng = SmcRng::seeded(seed);
                moves.do_move(time, particle, &mut rng);
            })
        };
        match &self.pool {
            Some(pool) => pool.install(task),
            None => task(),
        }
    }

    /// Applies the MCMC kernel to every particle in parallel and returns the
    /// number of accepted proposals (a sum reduction).
    fn apply_mcmc(&mut self) -> usize {
        let time = self.time + 1;
        let seeds: Vec<u64> = (0..self.particles.len())
            .map(|_| self.rng.substream_seed())
            .collect();
        let mut particles = mem::take(&mut self.particles);
        let moves = self.moves.as_ref().expect("a move set must be assigned before iterating");
        let task = || {
            particles
                .par_iter_mut()
                .zip(seeds)
                .map(|(particle, seed)| {
                    let mut rng = SmcRng::seeded(seed);
                    usize::from(moves.do_mcmc(time, particle, &mut rng))
                })
                .sum::<usize>()
        };
        let accepted = match &self.pool {
            Some(pool) => pool.install(task),
            None => task(),
        };
        self.particles = particles;
        accepted
    }

    /// Resamples the population in place with the given fixed-size scheme
    /// and resets every log-weight to zero.
    fn resample(&mut self, mode: ResampleMode) {
        let n = self.n;
        let time = self.time;
        let Self {
            rng,
            workspace,
            particles,
            graph,
            ..
        } = &mut *self;

        for (w, particle) in workspace.weights.iter_mut().zip(particles.iter()) {
            *w = particle.weight();
        }
        match mode {
            ResampleMode::Multinomial => workspace.multinomial_counts(rng),
            ResampleMode::Residual => workspace.residual_counts(rng),
            ResampleMode::Stratified => workspace.strata_counts(true, rng),
            ResampleMode::Systematic => workspace.strata_counts(false, rng),
            ResampleMode::Fribble => unreachable!("fribble resampling uses the adaptive path"),
        }
        workspace.counts_to_indices();

        if let Some(graph) = graph {
            graph.record_generation(time, Some(&workspace.indices), n);
        }

        // Replicate the survivors. The flattening guarantees every source
        // slot still holds its original particle when it is read.
        for i in 0..n {
            let src = workspace.indices[i];
            if src != i {
                let value = particles[src].value().clone();
                particles[i].set_value(value);
            }
            particles[i].set_log_weight(0.0);
        }
    }

    /// Grows the population in freshly-moved batches of the starting
    /// particles until the accumulated ESS reaches the threshold or the
    /// population hits [`MAX_POPULATION`], then downsamples to size.
    ///
    /// The rescaling discipline keeps the maximum log-weight of the
    /// accumulated population at zero after every append, so the ESS
    /// computation cannot overflow.
    fn resample_fribble(&mut self, mut trace: Option<&mut EssTrace>) -> f64 {
        let starting = mem::take(&mut self.particles);
        let mut global_max = f64::NEG_INFINITY;
        if let Some(trace) = trace.as_deref_mut() {
            trace.clear();
        }

        let ess = loop {
            let mut batch = starting.clone();
            self.move_batch(&mut batch);

            let local_max = batch
                .iter()
                .map(|p| p.log_weight())
                .fold(f64::NEG_INFINITY, f64::max);
            if self.particles.is_empty() {
                global_max = local_max;
            }
            if local_max > global_max {
                let shift = global_max - local_max;
                for particle in &mut self.particles {
                    particle.add_to_log_weight(shift);
                }
                for particle in &mut batch {
                    particle.add_to_log_weight(-local_max);
                }
                global_max = local_max;
            } else {
                for particle in &mut batch {
                    particle.add_to_log_weight(-global_max);
                }
            }
            self.particles.extend(batch);

            let ess = effective_sample_size(&self.particles);
            log::debug!(
                "variable iteration: ess = {ess:.3}, population = {}",
                self.particles.len()
            );
            if let Some(trace) = trace.as_deref_mut() {
                trace.record(ess);
            }
            if ess >= self.resample_threshold || self.particles.len() >= MAX_POPULATION {
                break ess;
            }
        };

        if self.particles.len() > self.n {
            self.resampled = true;
            log::debug!(
                "downsampling from {} to {} particles",
                self.particles.len(),
                self.n
            );
            let indices = sample_strata_indices(&self.particles, self.n, true, &mut self.rng);
            let mut kept = Vec::with_capacity(self.n);
            for &idx in &indices {
                kept.push(Particle::new(self.particles[idx].value().clone(), 0.0));
            }
            self.particles = kept;
        } else {
            self.resampled = false;
        }
        ess
    }
}

impl<S: fmt::Display, M> fmt::Display for Sampler<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sampler Configuration:")?;
        writeln!(f, "======================")?;
        writeln!(f, "Evolution Time:    {}", self.time)?;
        writeln!(f, "Particle Set Size: {}", self.n)?;
        writeln!(f)?;
        writeln!(f, "Particle Set:")?;
        for particle in &self.particles {
            writeln!(f, "{particle}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out the slot index as the particle value and collapses the
    /// weight onto slot zero on every move.
    struct CollapseMoves {
        counter: AtomicUsize,
        accept_mcmc: bool,
    }

    impl CollapseMoves {
        fn new(accept_mcmc: bool) -> Self {
            Self {
                counter: AtomicUsize::new(0),
                accept_mcmc,
            }
        }
    }

    impl MoveSet<usize> for CollapseMoves {
        fn init(&self, _rng: &mut SmcRng) -> Particle<usize> {
            Particle::new(self.counter.fetch_add(1, Ordering::Relaxed), 0.0)
        }

        fn do_move(&self, _time: usize, particle: &mut Particle<usize>, _rng: &mut SmcRng) {
            let lw = if *particle.value() == 0 { 0.0 } else { -100.0 };
            particle.set_log_weight(lw);
        }

        fn do_mcmc(&self, _time: usize, _particle: &mut Particle<usize>, _rng: &mut SmcRng) -> bool {
            self.accept_mcmc
        }
    }

    /// Keeps weights uniform; every move shifts the value by one.
    struct DriftMoves;

    impl MoveSet<f64> for DriftMoves {
        fn init(&self, _rng: &mut SmcRng) -> Particle<f64> {
            Particle::new(0.0, 0.0)
        }

        fn do_move(&self, _time: usize, particle: &mut Particle<f64>, _rng: &mut SmcRng) {
            let value = *particle.value() + 1.0;
            particle.set_value(value);
        }
    }

    fn collapse_sampler(mode: ResampleMode) -> Sampler<usize, CollapseMoves> {
        let mut sampler = Sampler::with_seed(4, HistoryMode::Ram, 17).unwrap();
        sampler.set_moveset(CollapseMoves::new(false));
        sampler.set_resample_params(mode, 0.5).unwrap();
        sampler.initialise();
        sampler
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert!(matches!(
            Sampler::<f64, DriftMoves>::new(0, HistoryMode::None),
            Err(SmcError::InvalidConfiguration(_))
        ));
        let mut sampler = Sampler::<f64, DriftMoves>::with_seed(4, HistoryMode::None, 1).unwrap();
        assert!(sampler
            .set_resample_params(ResampleMode::Systematic, 0.0)
            .is_err());
        assert!(sampler
            .set_resample_params(ResampleMode::Systematic, -2.0)
            .is_err());
        assert!(sampler.set_num_threads(0).is_err());
    }

    #[test]
    fn fractional_threshold_scales_with_population_size() {
        let mut sampler = Sampler::<f64, DriftMoves>::with_seed(10, HistoryMode::None, 1).unwrap();
        sampler
            .set_resample_params(ResampleMode::Stratified, 0.5)
            .unwrap();
        assert_eq!(sampler.resample_threshold, 5.0);
        sampler
            .set_resample_params(ResampleMode::Stratified, 3.0)
            .unwrap();
        assert_eq!(sampler.resample_threshold, 3.0);
    }

    #[test]
    fn initialise_seeds_population_and_history() {
        let sampler = collapse_sampler(ResampleMode::Stratified);
        assert_eq!(sampler.time(), 0);
        assert_eq!(sampler.num_particles(), 4);
        assert_eq!(sampler.history().len(), 1);
        for i in 0..4 {
            assert_eq!(*sampler.particle_value(i), i);
            assert_eq!(sampler.particle_log_weight(i), 0.0);
        }
    }

    #[test]
    fn uniform_weights_do_not_trigger_resampling() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::None, 3).unwrap();
        sampler.set_moveset(DriftMoves);
        sampler
            .set_resample_params(ResampleMode::Systematic, 2.0)
            .unwrap();
        sampler.initialise();
        let ess = sampler.iterate_ess();
        assert!((ess - 4.0).abs() < 1e-9, "ess = {ess}");
        assert!(!sampler.resampled());
        assert_eq!(sampler.time(), 1);
    }

    #[test]
    fn degenerate_weights_collapse_the_population() {
        for mode in [
            ResampleMode::Multinomial,
            ResampleMode::Residual,
            ResampleMode::Stratified,
            ResampleMode::Systematic,
        ] {
            let mut sampler = collapse_sampler(mode);
            let ess = sampler.iterate_ess();
            assert!(ess < 1.0 + 1e-9, "mode {mode:?}: ess = {ess}");
            assert!(sampler.resampled());
            assert_eq!(sampler.time(), 1);
            // After replication every slot carries the heavy particle's
            // value and a zero log-weight.
            for i in 0..4 {
                assert_eq!(*sampler.particle_value(i), 0, "mode {mode:?}");
                assert_eq!(sampler.particle_log_weight(i), 0.0, "mode {mode:?}");
                assert_eq!(sampler.particle_weight(i), 1.0, "mode {mode:?}");
            }
            assert!((sampler.ess() - 4.0).abs() < 1e-9);
        }
    }

    #[test]
    fn log_weights_are_shifted_to_zero_maximum() {
        // Weights all equal but negative after the move: the subtract-max
        // normalisation must bring the maximum to exactly zero.
        struct SinkMoves;
        impl MoveSet<f64> for SinkMoves {
            fn init(&self, _rng: &mut SmcRng) -> Particle<f64> {
                Particle::new(0.0, 0.0)
            }
            fn do_move(&self, _time: usize, particle: &mut Particle<f64>, _rng: &mut SmcRng) {
                particle.add_to_log_weight(-7.5);
            }
        }
        let mut sampler = Sampler::with_seed(4, HistoryMode::None, 5).unwrap();
        sampler.set_moveset(SinkMoves);
        sampler
            .set_resample_params(ResampleMode::Systematic, 2.0)
            .unwrap();
        sampler.initialise();
        sampler.iterate();
        let max = (0..4)
            .map(|i| sampler.particle_log_weight(i))
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(max, 0.0);
    }

    #[test]
    fn mcmc_acceptances_are_counted() {
        let mut sampler = Sampler::with_seed(8, HistoryMode::None, 23).unwrap();
        sampler.set_moveset(CollapseMoves::new(true));
        sampler
            .set_resample_params(ResampleMode::Stratified, 0.5)
            .unwrap();
        sampler.initialise();
        sampler.iterate();
        assert_eq!(sampler.accepted(), 8);
    }

    #[test]
    fn iterate_until_reaches_the_target_time() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::None, 2).unwrap();
        sampler.set_moveset(DriftMoves);
        sampler
            .set_resample_params(ResampleMode::Systematic, 2.0)
            .unwrap();
        sampler.initialise();
        sampler.iterate_until(5);
        assert_eq!(sampler.time(), 5);
        assert_eq!(*sampler.particle_value(0), 5.0);
    }

    #[test]
    fn iterate_back_restores_the_previous_generation() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::Ram, 2).unwrap();
        sampler.set_moveset(DriftMoves);
        sampler
            .set_resample_params(ResampleMode::Systematic, 2.0)
            .unwrap();
        sampler.initialise();
        sampler.iterate();
        sampler.iterate();
        assert_eq!(*sampler.particle_value(0), 2.0);

        let restored = sampler.iterate_back().unwrap();
        assert!(restored);
        assert_eq!(sampler.time(), 1);
        assert_eq!(sampler.num_particles(), 4);
        for i in 0..4 {
            assert_eq!(*sampler.particle_value(i), 1.0);
            assert_eq!(sampler.particle_log_weight(i), 0.0);
        }
        assert_eq!(sampler.accepted(), 0);
    }

    #[test]
    fn iterate_back_without_history_is_an_error() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::None, 2).unwrap();
        sampler.set_moveset(DriftMoves);
        sampler.initialise();
        sampler.iterate();
        assert!(matches!(sampler.iterate_back(), Err(SmcError::MissingHistory)));
    }

    #[test]
    fn exhausted_history_pops_return_false() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::Ram, 2).unwrap();
        sampler.set_moveset(DriftMoves);
        sampler.initialise();
        sampler.iterate();
        assert!(sampler.iterate_back().unwrap());
        assert!(sampler.iterate_back().unwrap());
        assert!(!sampler.iterate_back().unwrap());
    }

    #[test]
    fn integrate_is_the_self_normalised_weighted_mean() {
        let sampler = collapse_sampler(ResampleMode::Stratified);
        // Uniform weights over values 0..4.
        let mean = sampler.integrate(|v, _: &()| *v as f64, &());
        assert!((mean - 1.5).abs() < 1e-12);
    }

    #[test]
    fn constant_path_sampling_integral_is_width_times_time() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::Ram, 9).unwrap();
        sampler.set_moveset(DriftMoves);
        sampler
            .set_resample_params(ResampleMode::Systematic, 2.0)
            .unwrap();
        sampler.initialise();
        sampler.iterate_until(3);
        let value = sampler
            .integrate_path_sampling(|_, _, _: &()| 1.0, |_, _: &()| 0.5, &())
            .unwrap();
        assert!((value - 0.5 * 3.0).abs() < 1e-12, "got {value}");
        // The temporary push was popped again.
        assert_eq!(sampler.history().len(), 4);
    }

    #[test]
    fn path_sampling_without_history_is_an_error() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::None, 9).unwrap();
        sampler.set_moveset(DriftMoves);
        sampler.initialise();
        assert!(matches!(
            sampler.integrate_path_sampling(|_, _, _: &()| 1.0, |_, _: &()| 1.0, &()),
            Err(SmcError::MissingHistory)
        ));
    }

    #[test]
    fn variable_iteration_grows_then_downsamples() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::None, 31).unwrap();
        sampler.set_moveset(DriftMoves);
        // Absolute threshold of 6: one uniform batch of 4 is not enough,
        // two are.
        sampler
            .set_resample_params(ResampleMode::Fribble, 6.0)
            .unwrap();
        sampler.initialise();
        let mut trace = EssTrace::new();
        let ess = sampler.iterate_ess_variable(Some(&mut trace));
        assert!((ess - 8.0).abs() < 1e-9, "ess = {ess}");
        assert_eq!(trace.len(), 2);
        assert!((trace.values()[0] - 4.0).abs() < 1e-9);
        assert!((trace.values()[1] - 8.0).abs() < 1e-9);
        assert_eq!(sampler.num_particles(), 4);
        assert_eq!(sampler.time(), 1);
        assert!(sampler.resampled());
        for i in 0..4 {
            assert_eq!(sampler.particle_log_weight(i), 0.0);
            assert_eq!(*sampler.particle_value(i), 1.0);
        }
    }

    #[test]
    fn variable_iteration_skips_downsampling_at_exact_size() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::None, 31).unwrap();
        sampler.set_moveset(DriftMoves);
        // One uniform batch already clears the threshold, so the population
        // is rebuilt at exactly the configured size and no resample occurs.
        sampler
            .set_resample_params(ResampleMode::Fribble, 3.0)
            .unwrap();
        sampler.initialise();
        let ess = sampler.iterate_ess_variable(None);
        assert!((ess - 4.0).abs() < 1e-9, "ess = {ess}");
        assert!(!sampler.resampled());
        assert_eq!(sampler.num_particles(), 4);
        assert_eq!(*sampler.particle_value(0), 1.0);
    }

    #[test]
    fn fribble_mode_recovers_a_degenerate_standard_iteration() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::None, 13).unwrap();
        sampler.set_moveset(CollapseMoves::new(false));
        sampler
            .set_resample_params(ResampleMode::Fribble, 2.0)
            .unwrap();
        sampler.initialise();
        let ess = sampler.iterate_ess();
        // The pre-resample ESS is reported.
        assert!(ess < 1.0 + 1e-9);
        assert!(sampler.resampled());
        assert_eq!(sampler.time(), 1);
        assert_eq!(sampler.num_particles(), 4);
        // Only the heavy lineage survives the downsample.
        for i in 0..4 {
            assert_eq!(*sampler.particle_value(i), 0);
            assert_eq!(sampler.particle_log_weight(i), 0.0);
        }
    }

    #[test]
    fn seeded_runs_reproduce_for_any_worker_count() {
        // Per-slot RNG substreams are drawn sequentially from the master
        // generator, so the worker count cannot perturb the results.
        let run = |threads: Option<usize>| {
            let mut sampler = Sampler::with_seed(16, HistoryMode::None, 77).unwrap();
            sampler.set_moveset(CollapseMoves::new(false));
            sampler
                .set_resample_params(ResampleMode::Multinomial, 0.5)
                .unwrap();
            if let Some(threads) = threads {
                sampler.set_num_threads(threads).unwrap();
            }
            sampler.initialise();
            for _ in 0..3 {
                sampler.iterate();
            }
            (0..16)
                .map(|i| (*sampler.particle_value(i), sampler.particle_log_weight(i)))
                .collect::<Vec<_>>()
        };
        let baseline = run(None);
        assert_eq!(baseline, run(None));
        assert_eq!(baseline, run(Some(1)));
        assert_eq!(baseline, run(Some(3)));
    }

    #[test]
    fn lineage_graph_tracks_identity_and_resampled_parents() {
        let mut sampler = Sampler::with_seed(4, HistoryMode::None, 41).unwrap();
        sampler.set_moveset(DriftMoves);
        sampler
            .set_resample_params(ResampleMode::Systematic, 2.0)
            .unwrap();
        sampler.enable_lineage_graph();
        sampler.initialise();
        sampler.iterate();
        sampler.iterate();
        let graph = sampler.lineage_graph().unwrap();
        assert_eq!(graph.node_count(), 8);
        assert_eq!(graph.edge_count(), 4);
        assert_eq!(graph.parents(2, 3), vec![(1, 3)]);

        // A kernel that keeps weights uniform on the first iteration and
        // collapses them onto slot zero on the second, so the resampled
        // parent mapping lands on an edge-bearing generation.
        struct TimedCollapse {
            counter: AtomicUsize,
        }
        impl MoveSet<usize> for TimedCollapse {
            fn init(&self, _rng: &mut SmcRng) -> Particle<usize> {
                Particle::new(self.counter.fetch_add(1, Ordering::Relaxed), 0.0)
            }
            fn do_move(&self, time: usize, particle: &mut Particle<usize>, _rng: &mut SmcRng) {
                let lw = if time == 2 && *particle.value() != 0 {
                    -100.0
                } else {
                    0.0
                };
                particle.set_log_weight(lw);
            }
        }

        let mut sampler = Sampler::with_seed(4, HistoryMode::None, 41).unwrap();
        sampler.set_moveset(TimedCollapse {
            counter: AtomicUsize::new(0),
        });
        sampler
            .set_resample_params(ResampleMode::Stratified, 0.5)
            .unwrap();
        sampler.enable_lineage_graph();
        sampler.initialise();
        sampler.iterate();
        sampler.iterate();
        let graph = sampler.lineage_graph().unwrap();
        assert_eq!(graph.node_count(), 8);
        assert_eq!(graph.edge_count(), 4);
        // The second generation collapses onto slot zero.
        for slot in 0..4 {
            assert_eq!(graph.parents(2, slot), vec![(1, 0)]);
        }
    }

    #[test]
    fn index_sampling_matches_population_weights() {
        // Move once so the collapse weights are in place, with a threshold
        // low enough that the driver does not resample them away.
        let mut sampler = collapse_sampler(ResampleMode::Stratified);
        sampler
            .set_resample_params(ResampleMode::Stratified, 1.0)
            .unwrap();
        sampler.iterate();
        let multinomial = sampler.sample_multinomial(6);
        let systematic = sampler.sample_systematic(6, false);
        let stratified = sampler.sample_stratified(6);
        for indices in [multinomial, systematic, stratified] {
            assert_eq!(indices.len(), 6);
            assert!(indices.iter().all(|&i| i == 0), "indices: {indices:?}");
        }
    }

    #[test]
    fn streams_render_every_particle() {
        let sampler = collapse_sampler(ResampleMode::Stratified);
        let mut out = Vec::new();
        sampler.stream_particles(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.lines().next().unwrap().starts_with('0'));

        let mut one = Vec::new();
        sampler.stream_particle(&mut one, 2).unwrap();
        assert!(String::from_utf8(one).unwrap().starts_with('2'));

        let display = format!("{sampler}");
        assert!(display.contains("Sampler Configuration:"));
        assert!(display.contains("Particle Set Size: 4"));
    }
}
