use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Lanes start 2^48 words apart inside a step's stream.
const LANE_WORD_OFFSET: u32 = 48;

/// Random draws keyed by the logical step index.
///
/// The generator for `(step, lane)` is ChaCha8 seeded with the run seed, using
/// the step as stream and a lane dependent word position. Draws therefore only
/// depend on the step sequence, never on how many queries the host issued
/// while processing a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRng {
    seed: u64,
}

impl StepRng {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn for_step(&self, step: u64, lane: usize) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(step);
        rng.set_word_pos((lane as u128) << LANE_WORD_OFFSET);
        rng
    }
}
