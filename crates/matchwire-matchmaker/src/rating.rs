//! Reference Elo rating update (K = 32).
//!
//! Nothing in the core persists ratings or pairs by them — this module
//! exists so a deployment that wants RANKED to mean something has the
//! arithmetic ready and tested.

/// The K-factor.
pub const K: f64 = 32.0;

/// Expected score of player A against player B:
/// `E = 1 / (1 + 10^((Rb − Ra) / 400))`.
pub fn expected(rating_a: f64, rating_b: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0))
}

/// Applies one match result and returns the updated `(Ra', Rb')`.
/// `a_won` is the outcome from A's side (no draws in a battle that
/// ends by abandonment or completion).
pub fn update(rating_a: f64, rating_b: f64, a_won: bool) -> (f64, f64) {
    let e_a = expected(rating_a, rating_b);
    let e_b = 1.0 - e_a;
    let (s_a, s_b) = if a_won { (1.0, 0.0) } else { (0.0, 1.0) };
    (rating_a + K * (s_a - e_a), rating_b + K * (s_b - e_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_ratings_expect_half() {
        assert!((expected(1200.0, 1200.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_stronger_player_expects_more() {
        let e = expected(1400.0, 1200.0);
        // 200 points ahead ≈ 0.76 expected score.
        assert!((e - 0.7597).abs() < 1e-3, "got {e}");
    }

    #[test]
    fn test_equal_ratings_winner_gains_sixteen() {
        let (ra, rb) = update(1200.0, 1200.0, true);
        assert!((ra - 1216.0).abs() < 1e-9);
        assert!((rb - 1184.0).abs() < 1e-9);
    }

    #[test]
    fn test_upset_win_gains_more() {
        // The underdog beating a +200 opponent gains > 16.
        let (ra, _) = update(1200.0, 1400.0, true);
        assert!(ra - 1200.0 > 16.0);
    }

    #[test]
    fn test_rating_points_are_conserved() {
        let (ra, rb) = update(1325.0, 1187.0, false);
        assert!(((ra + rb) - (1325.0 + 1187.0)).abs() < 1e-9);
    }
}
