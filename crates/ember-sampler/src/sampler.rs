use crate::rng::Xorshift64Star;

/// A probability paired with its token index, for nucleus sorting.
#[derive(Debug, Clone, Copy)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: u32,
}

/// Per-session sampling state.
///
/// Owns the RNG and a reusable `vocab_size`-capacity sort buffer so sampling
/// never allocates on the step path.
pub struct Sampler {
    temperature: f32,
    topp: f32,
    rng: Xorshift64Star,
    probindex: Vec<ProbIndex>,
}

impl Sampler {
    pub fn new(vocab_size: usize, temperature: f32, topp: f32, seed: u64) -> Sampler {
        Sampler {
            temperature,
            topp,
            rng: Xorshift64Star::new(seed),
            probindex: Vec::with_capacity(vocab_size),
        }
    }

    /// Draw the next token from a logits vector. The logits are consumed
    /// in place (tempered and softmaxed) on the non-greedy path.
    pub fn sample(&mut self, logits: &mut [f32]) -> u32 {
        if self.temperature == 0.0 {
            return argmax(logits);
        }

        for l in logits.iter_mut() {
            *l /= self.temperature;
        }
        softmax(logits);

        let coin = self.rng.next_f32();
        if self.topp <= 0.0 || self.topp >= 1.0 {
            sample_mult(logits, coin)
        } else {
            self.sample_topp(logits, coin)
        }
    }

    /// Nucleus sampling: restrict to the smallest probability-sorted prefix
    /// reaching `topp` mass, then inverse-CDF over that prefix.
    ///
    /// Tokens below `(1 - topp) / (n - 1)` cannot appear in the nucleus, so
    /// they are dropped before the sort.
    fn sample_topp(&mut self, probs: &[f32], coin: f32) -> u32 {
        let cutoff = (1.0 - self.topp) / (probs.len() - 1) as f32;
        self.probindex.clear();
        for (index, &prob) in probs.iter().enumerate() {
            if prob >= cutoff {
                self.probindex.push(ProbIndex {
                    prob,
                    index: index as u32,
                });
            }
        }
        if self.probindex.is_empty() {
            // A very small topp can push the cutoff above every probability;
            // degenerate to the mode.
            return argmax(probs);
        }
        self.probindex.sort_unstable_by(|a, b| {
            b.prob
                .partial_cmp(&a.prob)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut cumulative = 0.0f32;
        let mut last_idx = self.probindex.len() - 1;
        for (i, pi) in self.probindex.iter().enumerate() {
            cumulative += pi.prob;
            if cumulative >= self.topp {
                last_idx = i;
                break;
            }
        }

        // Rescale the coin into the truncated mass and walk the CDF.
        let r = coin * cumulative;
        let mut cdf = 0.0f32;
        for pi in &self.probindex[..=last_idx] {
            cdf += pi.prob;
            if r < cdf {
                return pi.index;
            }
        }
        // Rounding left the coin past the last bucket.
        self.probindex[last_idx].index
    }
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_val = logits[0];
    for (i, &v) in logits.iter().enumerate().skip(1) {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best as u32
}

/// Inverse-CDF draw over a full probability vector.
fn sample_mult(probs: &[f32], coin: f32) -> u32 {
    let mut cdf = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cdf += p;
        if coin < cdf {
            return i as u32;
        }
    }
    probs.len() as u32 - 1
}

fn softmax(x: &mut [f32]) {
    let max_val = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}
