//! Property tests for the peak limiter

use castnorm_engine::PeakLimiter;
use proptest::prelude::*;

proptest! {
    #[test]
    fn output_never_exceeds_threshold(
        samples in prop::collection::vec(-1.0f32..1.0, 1..4000),
        threshold_db in -30.0f32..0.0,
        attack_ms in 0.5f32..10.0,
        release_ms in 10.0f32..300.0,
    ) {
        let mut limiter = PeakLimiter::new(48000, 2);
        limiter.set_threshold_db(threshold_db);
        limiter.set_attack_ms(attack_ms);
        limiter.set_release_ms(release_ms);

        let even = samples.len() / 2 * 2;
        let mut out = limiter.process(&samples[..even]);
        out.extend(limiter.flush());

        let ceiling = 10f32.powf(threshold_db / 20.0) * 1.0001;
        prop_assert_eq!(out.len(), even);
        prop_assert!(out.iter().all(|s| s.abs() <= ceiling));
    }

    #[test]
    fn quiet_signal_passes_unchanged(
        samples in prop::collection::vec(-0.1f32..0.1, 1..2000),
    ) {
        let mut limiter = PeakLimiter::new(44100, 1);
        limiter.set_threshold_db(-6.0);

        let mut out = limiter.process(&samples);
        out.extend(limiter.flush());
        prop_assert_eq!(out, samples);
    }
}
