//! Score arithmetic shared by the analyzers.

use crate::domain::Issue;

/// Weight of an externally sourced score when blended with a local one.
pub const EXTERNAL_WEIGHT: f64 = 0.75;

/// Clamp into `[0, 100]`; NaN counts as 0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

/// Start from 100 and subtract each issue's severity penalty.
pub fn deduction_score(issues: &[Issue]) -> f64 {
    let penalty: f64 = issues.iter().map(|i| i.severity.penalty()).sum();
    clamp_score(100.0 - penalty)
}

/// Blend an external score with the local deduction score, favouring the
/// external source. Without one the local score stands.
pub fn blend(external: Option<f64>, local: f64) -> f64 {
    match external {
        Some(ext) => clamp_score(EXTERNAL_WEIGHT * clamp_score(ext) + (1.0 - EXTERNAL_WEIGHT) * clamp_score(local)),
        None => clamp_score(local),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Severity;
    use proptest::prelude::*;

    #[test]
    fn penalties_follow_severity() {
        let issues = vec![Issue::high("a", ""), Issue::medium("b", ""), Issue::low("c", "")];
        assert_eq!(deduction_score(&issues), 70.0);
    }

    #[test]
    fn many_issues_clamp_to_zero() {
        let issues = vec![Issue::high("a", ""); 10];
        assert_eq!(deduction_score(&issues), 0.0);
    }

    #[test]
    fn blend_favours_external() {
        assert_eq!(blend(Some(80.0), 40.0), 70.0);
        assert_eq!(blend(None, 40.0), 40.0);
        assert_eq!(blend(Some(250.0), 100.0), 100.0);
    }

    fn severity() -> impl Strategy<Value = Severity> {
        prop_oneof![Just(Severity::High), Just(Severity::Medium), Just(Severity::Low)]
    }

    proptest! {
        #[test]
        fn deduction_stays_in_range(severities in proptest::collection::vec(severity(), 0..40)) {
            let issues: Vec<Issue> = severities
                .into_iter()
                .map(|s| Issue::new("generated", s, "generated"))
                .collect();
            let score = deduction_score(&issues);
            prop_assert!((0.0..=100.0).contains(&score));
        }

        #[test]
        fn blend_stays_in_range(ext in -500.0f64..500.0, local in -500.0f64..500.0) {
            let score = blend(Some(ext), local);
            prop_assert!((0.0..=100.0).contains(&score));
        }
    }
}
