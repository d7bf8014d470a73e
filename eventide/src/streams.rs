//! Replicable random streams and their per-replication lifecycle.
//!
//! Replications are statistically independent because each one runs on a
//! fresh, deterministic section of every registered stream. The
//! [`StreamRegistry`] applies the configured policy at replication
//! boundaries: reset to the stream's start, advance to the next
//! substream, or flip into antithetic mode for variance reduction.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A random stream the replication controller can reposition.
///
/// Implementations divide their period into numbered substreams so that
/// replications can each consume a disjoint section.
pub trait RandomStream {
    /// Repositions to the very beginning of the stream.
    fn reset_start_stream(&mut self);

    /// Repositions to the beginning of the current substream.
    fn reset_start_substream(&mut self);

    /// Advances to the beginning of the next substream.
    fn advance_to_next_substream(&mut self);

    /// Turns antithetic sampling on or off. While on, uniform draws are
    /// complemented (`1 - u`).
    fn set_antithetic(&mut self, on: bool);

    /// Returns `true` if antithetic sampling is on.
    fn antithetic(&self) -> bool;
}

/// Per-stream participation in the replication-boundary policy.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Reset to the stream start before the first replication.
    pub reset_start_stream: bool,
    /// Advance to the next substream after each replication.
    pub advance_next_substream: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reset_start_stream: true,
            advance_next_substream: true,
        }
    }
}

struct Registered {
    stream: Rc<RefCell<dyn RandomStream>>,
    options: StreamOptions,
}

/// The set of streams controlled at replication boundaries.
///
/// Clones share the underlying registry, mirroring the handle pattern
/// used by the executive and the process engine.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    inner: Rc<RefCell<Vec<Registered>>>,
}

impl StreamRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream with default options.
    pub fn register(&self, stream: Rc<RefCell<dyn RandomStream>>) {
        self.register_with(stream, StreamOptions::default());
    }

    /// Registers a stream with explicit options.
    pub fn register_with(&self, stream: Rc<RefCell<dyn RandomStream>>, options: StreamOptions) {
        self.inner.borrow_mut().push(Registered { stream, options });
    }

    /// Number of registered streams.
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    /// Returns `true` if no streams are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    /// Overrides the reset-at-experiment-start option on every stream.
    pub fn set_all_reset_start_options(&self, on: bool) {
        for entry in self.inner.borrow_mut().iter_mut() {
            entry.options.reset_start_stream = on;
        }
    }

    /// Overrides the advance-after-replication option on every stream.
    pub fn set_all_advance_options(&self, on: bool) {
        for entry in self.inner.borrow_mut().iter_mut() {
            entry.options.advance_next_substream = on;
        }
    }

    /// Resets streams to their start, honoring each stream's option.
    /// Applied once at the start of an experiment.
    pub fn reset_start_streams(&self) {
        for entry in self.inner.borrow().iter() {
            if entry.options.reset_start_stream {
                entry.stream.borrow_mut().reset_start_stream();
            }
        }
    }

    /// Resets every stream to the start of its current substream,
    /// unconditionally. Used by antithetic pairing to replay the prior
    /// replication's draws complemented.
    pub fn reset_start_substreams(&self) {
        for entry in self.inner.borrow().iter() {
            entry.stream.borrow_mut().reset_start_substream();
        }
    }

    /// Advances streams to their next substream, honoring each stream's
    /// option. Applied after each replication under the default policy.
    pub fn advance_substreams(&self) {
        for entry in self.inner.borrow().iter() {
            if entry.options.advance_next_substream {
                entry.stream.borrow_mut().advance_to_next_substream();
            }
        }
    }

    /// Advances every stream to its next substream, unconditionally.
    /// Used by antithetic pairing between pairs.
    pub fn advance_all_substreams(&self) {
        for entry in self.inner.borrow().iter() {
            entry.stream.borrow_mut().advance_to_next_substream();
        }
    }

    /// Turns antithetic sampling on or off for every stream.
    pub fn set_antithetic(&self, on: bool) {
        for entry in self.inner.borrow().iter() {
            entry.stream.borrow_mut().set_antithetic(on);
        }
    }
}

impl fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("streams", &self.inner.borrow().len())
            .finish()
    }
}

/// A seeded, substream-capable stream backed by ChaCha8.
///
/// Substream `k` reseeds the generator with a value derived from the base
/// seed and `k`, giving disjoint, reproducible sections without tracking
/// draw counts.
pub struct ReplicableRng {
    seed: u64,
    substream: u64,
    antithetic: bool,
    rng: ChaCha8Rng,
}

impl ReplicableRng {
    /// Creates a stream positioned at substream zero of `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            substream: 0,
            antithetic: false,
            rng: ChaCha8Rng::seed_from_u64(Self::substream_seed(seed, 0)),
        }
    }

    fn substream_seed(seed: u64, substream: u64) -> u64 {
        seed ^ substream.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    fn reseed(&mut self) {
        self.rng = ChaCha8Rng::seed_from_u64(Self::substream_seed(self.seed, self.substream));
    }

    /// The current substream index.
    pub fn substream(&self) -> u64 {
        self.substream
    }

    /// Draws a uniform value in `[0, 1)`, complemented while antithetic
    /// sampling is on.
    pub fn random_f64(&mut self) -> f64 {
        let u: f64 = self.rng.random();
        if self.antithetic {
            1.0 - u
        } else {
            u
        }
    }

    /// Draws a raw `u64`, unaffected by antithetic mode.
    pub fn random_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }
}

impl RandomStream for ReplicableRng {
    fn reset_start_stream(&mut self) {
        self.substream = 0;
        self.reseed();
    }

    fn reset_start_substream(&mut self) {
        self.reseed();
    }

    fn advance_to_next_substream(&mut self) {
        self.substream += 1;
        self.reseed();
    }

    fn set_antithetic(&mut self, on: bool) {
        self.antithetic = on;
    }

    fn antithetic(&self) -> bool {
        self.antithetic
    }
}

impl fmt::Debug for ReplicableRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicableRng")
            .field("seed", &self.seed)
            .field("substream", &self.substream)
            .field("antithetic", &self.antithetic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_substream_same_draws() {
        let mut a = ReplicableRng::new(1234);
        let mut b = ReplicableRng::new(1234);
        let from_a: Vec<f64> = (0..8).map(|_| a.random_f64()).collect();
        let from_b: Vec<f64> = (0..8).map(|_| b.random_f64()).collect();
        assert_eq!(from_a, from_b);
    }

    #[test]
    fn substreams_are_disjoint_and_replayable() {
        let mut rng = ReplicableRng::new(99);
        let first: Vec<u64> = (0..4).map(|_| rng.random_u64()).collect();

        rng.advance_to_next_substream();
        let second: Vec<u64> = (0..4).map(|_| rng.random_u64()).collect();
        assert_ne!(first, second);

        // Replaying the substream reproduces its draws.
        rng.reset_start_substream();
        let replay: Vec<u64> = (0..4).map(|_| rng.random_u64()).collect();
        assert_eq!(second, replay);

        rng.reset_start_stream();
        let restart: Vec<u64> = (0..4).map(|_| rng.random_u64()).collect();
        assert_eq!(first, restart);
    }

    #[test]
    fn antithetic_draws_are_complements() {
        let mut plain = ReplicableRng::new(7);
        let mut anti = ReplicableRng::new(7);
        anti.set_antithetic(true);

        for _ in 0..8 {
            let u = plain.random_f64();
            let v = anti.random_f64();
            assert!((u + v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn registry_policy_respects_per_stream_options() {
        let advancing = Rc::new(RefCell::new(ReplicableRng::new(1)));
        let pinned = Rc::new(RefCell::new(ReplicableRng::new(2)));

        let registry = StreamRegistry::new();
        registry.register(Rc::clone(&advancing) as Rc<RefCell<dyn RandomStream>>);
        registry.register_with(
            Rc::clone(&pinned) as Rc<RefCell<dyn RandomStream>>,
            StreamOptions {
                reset_start_stream: true,
                advance_next_substream: false,
            },
        );
        assert_eq!(registry.len(), 2);

        registry.advance_substreams();
        assert_eq!(advancing.borrow().substream(), 1);
        assert_eq!(pinned.borrow().substream(), 0);

        // The unconditional variant moves both.
        registry.advance_all_substreams();
        assert_eq!(advancing.borrow().substream(), 2);
        assert_eq!(pinned.borrow().substream(), 1);

        registry.set_antithetic(true);
        assert!(advancing.borrow().antithetic());
        assert!(pinned.borrow().antithetic());
    }
}
