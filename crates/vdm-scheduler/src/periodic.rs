//! Periodic and sporadic activation chains
//!
//! Every activation is its own thread. It sleeps in an initial ALARM until its
//! expected start, schedules its successor, bumps the overlap counter of the
//! owning object and only then runs the operation.

use crate::cx::ThreadCx;
use crate::error::{RunError, RunResult, SchedulerError, SchedulerResult};
use crate::operation::Operation;
use crate::transaction::CellKey;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vdm_primitives::{ObjectId, Time, Value};

/// Activation parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodicSpec {
    /// Nominal distance between expected starts (periodic mode)
    pub period: Time,
    /// Upper bound of the random noise added to each activation
    pub jitter: Time,
    /// Minimum distance between activations
    pub delay: Time,
    /// Offset of the first activation
    pub offset: Time,
    /// Sporadic mode: the next activation is relative to the actual start
    pub sporadic: bool,
}

impl PeriodicSpec {
    /// Periodic chain with the given period
    pub fn periodic(period: Time) -> Self {
        Self {
            period,
            ..Self::default()
        }
    }

    /// Sporadic chain with the given minimum delay
    pub fn sporadic(delay: Time) -> Self {
        Self {
            delay,
            sporadic: true,
            ..Self::default()
        }
    }

    /// Set the jitter
    pub fn with_jitter(mut self, jitter: Time) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the minimum delay
    pub fn with_delay(mut self, delay: Time) -> Self {
        self.delay = delay;
        self
    }

    /// Set the offset
    pub fn with_offset(mut self, offset: Time) -> Self {
        self.offset = offset;
        self
    }

    /// Reject chains that would activate forever at one instant
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.sporadic && self.delay == 0 {
            return Err(SchedulerError::InvalidPeriodic(
                "sporadic activation needs a positive delay".into(),
            ));
        }
        if !self.sporadic && self.period == 0 {
            return Err(SchedulerError::InvalidPeriodic(
                "periodic activation needs a positive period".into(),
            ));
        }
        Ok(())
    }

    /// Expected start of the first activation of a chain registered at `now`
    pub fn first_expected<R: Rng>(&self, now: Time, rng: &mut R) -> Time {
        now + self.offset + noise(rng, self.jitter)
    }

    /// Expected start of the activation after one that was expected at
    /// `expected` and actually started at `started`
    pub fn next_expected<R: Rng>(&self, expected: Time, started: Time, rng: &mut R) -> Time {
        if self.sporadic {
            started + self.delay + noise(rng, self.jitter)
        } else {
            let nominal = expected + self.period + noise(rng, self.jitter + 1);
            nominal.max(expected + self.delay)
        }
    }
}

/// Uniform noise in `[0, bound)`; zero when `bound` is zero
pub fn noise<R: Rng>(rng: &mut R, bound: Time) -> Time {
    if bound == 0 {
        0
    } else {
        rng.gen_range(0..bound)
    }
}

/// One activation of a chain
#[derive(Debug, Clone)]
pub struct PeriodicWork {
    /// Object owning the operation
    pub target: ObjectId,
    /// Operation run by every activation
    pub operation: Arc<dyn Operation>,
    /// Arguments passed to every activation
    pub args: Vec<Value>,
    /// Activation parameters
    pub spec: PeriodicSpec,
    /// Expected start of this activation
    pub expected: Time,
    /// 1-based activation number
    pub activation: u64,
}

impl PeriodicWork {
    /// Instance variable counting outstanding activations of the operation
    pub fn overlap_key(&self) -> CellKey {
        CellKey::new(self.target, format!("$overlap.{}", self.operation.name()))
    }

    /// The next activation of the chain
    pub fn successor(&self, expected: Time) -> Self {
        Self {
            expected,
            activation: self.activation + 1,
            ..self.clone()
        }
    }
}

/// Body of an activation thread
pub(crate) fn activation(cx: ThreadCx, work: PeriodicWork) -> BoxFuture<'static, RunResult<Value>> {
    async move {
        cx.initial_alarm(work.expected).await?;
        cx.activate(&work)?;

        let key = work.overlap_key();
        let outstanding = cx.adjust_counter(&key, 1)?;
        let limit = cx.max_periodic_overlaps();
        if limit > 0 && outstanding > limit as i64 {
            return Err(
                RunError::periodic_overlap(work.operation.name(), outstanding, limit)
                    .at_depth(cx.depth()),
            );
        }

        let result = work.operation.invoke(cx.clone(), work.args.clone()).await;
        if result.is_ok() {
            cx.adjust_counter(&key, -1)?;
        }
        result
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_validate() {
        assert!(PeriodicSpec::periodic(10).validate().is_ok());
        assert!(PeriodicSpec::periodic(0).validate().is_err());
        assert!(PeriodicSpec::sporadic(5).validate().is_ok());
        assert!(PeriodicSpec::sporadic(0).validate().is_err());
    }

    #[test]
    fn test_no_jitter_is_deterministic() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let spec = PeriodicSpec::periodic(10).with_offset(3);
        assert_eq!(spec.first_expected(0, &mut rng), 3);
        assert_eq!(spec.next_expected(3, 7, &mut rng), 13);
    }

    #[test]
    fn test_periodic_is_relative_to_expected_start() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let spec = PeriodicSpec::periodic(10);
        // a late start does not shift the chain
        assert_eq!(spec.next_expected(20, 27, &mut rng), 30);
    }

    #[test]
    fn test_sporadic_is_relative_to_actual_start() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let spec = PeriodicSpec::sporadic(5);
        assert_eq!(spec.next_expected(20, 27, &mut rng), 32);
    }

    #[test]
    fn test_delay_clamps_short_periods() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let spec = PeriodicSpec::periodic(2).with_delay(8);
        assert_eq!(spec.next_expected(10, 10, &mut rng), 18);
    }

    #[test]
    fn test_noise_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        assert_eq!(noise(&mut rng, 0), 0);
        for _ in 0..100 {
            assert!(noise(&mut rng, 4) < 4);
        }
    }

    #[test]
    fn test_same_seed_same_chain() {
        let spec = PeriodicSpec::periodic(10).with_jitter(5);
        let chain = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut expected = spec.first_expected(0, &mut rng);
            let mut out = vec![expected];
            for _ in 0..5 {
                expected = spec.next_expected(expected, expected, &mut rng);
                out.push(expected);
            }
            out
        };
        assert_eq!(chain(7), chain(7));
    }
}
