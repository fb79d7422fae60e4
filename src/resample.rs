/*!
# Resampling algorithms

Resampling replaces a degenerate weighted population with an equally-weighted
one drawn from itself. All four fixed-size schemes here produce a *child
count* per particle with the counts summing to the population size; they
differ only in variance. The counts are then flattened to an index
permutation that lets the sampler replicate survivors in place.

- **Multinomial** draws the counts in one exact multinomial.
- **Residual** assigns `floor(N w_i / W)` children deterministically and
  draws the remainder multinomially from the residuals.
- **Stratified** splits `[0, 1)` into `N` equal strata and draws one child
  per stratum with an independent uniform offset.
- **Systematic** is stratified with a single shared offset.

The stratified and systematic walks share one loop, following Kitagawa 1996
(see also p.290 of Doucet et al.): advance a cursor over the cumulative
normalised weights and assign each stratum to the particle whose cumulative
weight first exceeds the stratum boundary plus offset.
*/

use crate::core::Particle;
use crate::rng::SmcRng;

/// The resampling scheme a sampler applies when the ESS drops below its
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleMode {
    Multinomial,
    Residual,
    Stratified,
    Systematic,
    /// The adaptive variable-population scheme: grow the population in
    /// batches until the ESS recovers, then downsample to size.
    Fribble,
}

/// Fills `counts` with one child per stratum of `[0, 1)`, walking the
/// cumulative normalised weights.
///
/// `strata` is the number of children to assign; `counts` has one entry per
/// weight. With `stratified` the uniform offset is redrawn for every
/// stratum; otherwise a single draw is shared by all of them. Remaining
/// strata are force-assigned to the last particle once the cursor reaches
/// it, so the counts always sum to `strata` even under cumulative rounding.
pub(crate) fn strata_counts_into(
    weights: &[f64],
    strata: usize,
    stratified: bool,
    rng: &mut SmcRng,
    counts: &mut [u32],
) {
    debug_assert_eq!(weights.len(), counts.len());
    counts.fill(0);
    let weight_sum: f64 = weights.iter().sum();
    let strata_f = strata as f64;
    let mut offset = rng.uniform(0.0, 1.0 / strata_f);
    let mut cumulative = 0.0;
    let mut j = 0usize;
    let last = weights.len() - 1;
    for (k, &w) in weights.iter().enumerate() {
        cumulative += w / weight_sum;
        while j < strata && (cumulative - offset > j as f64 / strata_f || k == last) {
            counts[k] += 1;
            j += 1;
            if stratified {
                offset = rng.uniform(0.0, 1.0 / strata_f);
            }
        }
    }
}

/// Turns a child-count vector into an ordered parent-index vector of length
/// `total`: index `i` appears `counts[i]` times, in slot order.
pub(crate) fn counts_to_ordered_indices(counts: &[u32], total: usize) -> Vec<usize> {
    let mut indices = Vec::with_capacity(total);
    for (i, &c) in counts.iter().enumerate() {
        for _ in 0..c {
            indices.push(i);
        }
    }
    debug_assert_eq!(indices.len(), total);
    indices
}

/// Draws an ordered vector of `m` parent indices from the population using
/// the stratified (or systematic) rule.
pub(crate) fn sample_strata_indices<S>(
    particles: &[Particle<S>],
    m: usize,
    stratified: bool,
    rng: &mut SmcRng,
) -> Vec<usize> {
    let weights: Vec<f64> = particles.iter().map(|p| p.weight()).collect();
    let mut counts = vec![0u32; weights.len()];
    strata_counts_into(&weights, m, stratified, rng, &mut counts);
    counts_to_ordered_indices(&counts, m)
}

/// Scratch buffers for in-place resampling, reused across iterations and
/// owned by the sampler. Contents are undefined between calls.
#[derive(Debug, Clone)]
pub(crate) struct ResampleWorkspace {
    pub weights: Vec<f64>,
    pub counts: Vec<u32>,
    pub indices: Vec<usize>,
}

impl ResampleWorkspace {
    pub fn new(n: usize) -> Self {
        Self {
            weights: vec![0.0; n],
            counts: vec![0; n],
            indices: vec![0; n],
        }
    }

    /// Multinomial child counts from the weights buffer.
    pub fn multinomial_counts(&mut self, rng: &mut SmcRng) {
        let trials = self.weights.len() as u32;
        rng.multinomial(trials, &self.weights, &mut self.counts);
    }

    /// Residual child counts: deterministic floors plus a multinomial draw
    /// over the fractional remainders. Consumes the weights buffer; the
    /// indices buffer is borrowed as floor storage.
    pub fn residual_counts(&mut self, rng: &mut SmcRng) {
        let n = self.weights.len();
        let weight_sum: f64 = self.weights.iter().sum();
        let mut remainder = n as u32;
        for i in 0..n {
            let scaled = n as f64 * self.weights[i] / weight_sum;
            let floor = scaled.floor();
            self.indices[i] = floor as usize;
            self.weights[i] = scaled - floor;
            remainder -= floor as u32;
        }
        if remainder > 0 {
            rng.multinomial(remainder, &self.weights, &mut self.counts);
        } else {
            self.counts.fill(0);
        }
        for i in 0..n {
            self.counts[i] += self.indices[i] as u32;
        }
    }

    /// Stratified or systematic child counts from the weights buffer.
    pub fn strata_counts(&mut self, stratified: bool, rng: &mut SmcRng) {
        let strata = self.weights.len();
        strata_counts_into(&self.weights, strata, stratified, rng, &mut self.counts);
    }

    /// Flattens the counts into a parent-index permutation supporting
    /// in-place replication: any slot with at least one child keeps its own
    /// particle, and surplus children fill childless slots scanning upward.
    /// The monotone free-slot cursor guarantees that no source slot is
    /// overwritten before it has been read. Consumes the counts buffer.
    pub fn counts_to_indices(&mut self) {
        let n = self.counts.len();
        let mut j = 0usize;
        for i in 0..n {
            if self.counts[i] > 0 {
                self.indices[i] = i;
                while self.counts[i] > 1 {
                    while self.counts[j] > 0 {
                        j += 1;
                    }
                    self.indices[j] = i;
                    j += 1;
                    self.counts[i] -= 1;
                }
            }
        }
    }
}
