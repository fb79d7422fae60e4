/*!
# Random number facade

The sampler drives all of its stochastic choices through [`SmcRng`], a thin
facade over a seedable generator. The engine itself only needs two
distributions beyond raw draws: a uniform on a half-open interval (for the
stratified and systematic strata) and an exact multinomial (for the
multinomial and residual resamplers).

[`SmcRng`] also implements [`rand::RngCore`], so client move kernels can use
the whole `rand`/`rand_distr` toolbox on the handle they are given.

Parallel loops never share one generator: before each batch the sampler draws
one seed per slot from its master generator and hands every worker its own
[`SmcRng::seeded`] substream. Results therefore reproduce for a fixed master
seed regardless of the worker count.
*/

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Binomial, Distribution};

/// Seedable random source for a particle sampler.
#[derive(Debug, Clone)]
pub struct SmcRng {
    rng: SmallRng,
}

impl SmcRng {
    /// Creates a generator from an explicit seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Creates a generator seeded from the operating system.
    pub fn from_entropy() -> Self {
        Self {
            rng: SmallRng::from_entropy(),
        }
    }

    /// Draws a uniform value on the half-open interval `[lo, hi)`.
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        self.rng.gen_range(lo..hi)
    }

    /// Draws a seed for an independent child generator. The driver draws one
    /// per slot before each parallel region.
    pub fn substream_seed(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Derives an independently seeded child generator.
    pub fn substream(&mut self) -> SmcRng {
        SmcRng::seeded(self.substream_seed())
    }

    /// Fills `counts` with an exact multinomial draw of `trials` trials over
    /// categories whose probabilities are proportional to `weights`.
    ///
    /// The weights need not be normalised; they must be non-negative with a
    /// positive finite sum. On return `counts` sums to exactly `trials`.
    ///
    /// The draw is taken category by category as a chain of conditional
    /// binomials, each on the probability mass not yet consumed.
    pub fn multinomial(&mut self, trials: u32, weights: &[f64], counts: &mut [u32]) {
        assert_eq!(
            weights.len(),
            counts.len(),
            "weight and count vectors must have equal length"
        );
        let mut remaining_weight: f64 = weights.iter().sum();
        assert!(
            remaining_weight > 0.0 && remaining_weight.is_finite(),
            "multinomial draw requires a positive finite weight sum"
        );

        let last = weights.len() - 1;
        let mut remaining = u64::from(trials);
        for (i, (&w, count)) in weights.iter().zip(counts.iter_mut()).enumerate() {
            if remaining == 0 {
                *count = 0;
                continue;
            }
            let draw = if i == last || w >= remaining_weight {
                remaining
            } else {
                let p = (w / remaining_weight).clamp(0.0, 1.0);
                Binomial::new(remaining, p)
                    .expect("binomial parameters are valid by construction")
                    .sample(&mut self.rng)
            };
            *count = draw as u32;
            remaining -= draw;
            remaining_weight -= w;
        }
    }
}

impl RngCore for SmcRng {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}
