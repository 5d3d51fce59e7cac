use super::Sampler;
use crate::sequence::Token;

/// Picks the highest-scoring token. Ties go to the lowest token id and empty logits
/// select token `0`.
///
/// Scores are ordered by [`f32::total_cmp`], so a positive NaN outranks every number
/// wherever it appears.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn select(&mut self, logits: &[f32], _recent: &[Token]) -> Token {
        let mut best = 0usize;
        for (index, score) in logits.iter().enumerate() {
            if score.total_cmp(&logits[best]).is_gt() {
                best = index;
            }
        }
        Token(best as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_picks_argmax() {
        let mut sampler = GreedySampler;
        assert_eq!(sampler.select(&[0.1, 0.7, 0.2], &[]), Token(1));
    }

    #[test]
    fn test_greedy_ties_go_to_lowest_id() {
        let mut sampler = GreedySampler;
        assert_eq!(sampler.select(&[0.5, 0.5, 0.1], &[]), Token(0));
        assert_eq!(sampler.select(&[], &[]), Token(0));
    }

    #[test]
    fn test_greedy_orders_nan_consistently() {
        let mut sampler = GreedySampler;
        let nan = f32::NAN.abs();
        assert_eq!(sampler.select(&[nan, 0.9, 0.2], &[]), Token(0));
        assert_eq!(sampler.select(&[0.9, nan, 0.2], &[]), Token(1));
        assert_eq!(sampler.select(&[0.9, 0.2, nan], &[]), Token(2));
    }

    #[test]
    fn test_closures_are_samplers() {
        let mut last = |_: &[f32], recent: &[Token]| recent.last().copied().unwrap_or(Token(-1));
        assert_eq!(last.select(&[1.0], &[Token(3), Token(9)]), Token(9));
        assert_eq!(last.select(&[1.0], &[]), Token(-1));
    }
}
