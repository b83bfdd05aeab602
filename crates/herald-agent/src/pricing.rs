//! Turn cost calculation from provider-reported usage.

use rust_decimal::Decimal;

use herald_core::config::{ModelSpec, CACHE_READ_MULTIPLIER, CACHE_WRITE_MULTIPLIER};
use herald_core::types::TokenUsage;

const TOKENS_PER_PRICE_UNIT: u32 = 1_000_000;

/// `input·p_in + output·p_out + cache_read·p_in·0.1 + cache_write·p_in·1.25
///  + thinking·p_out`, with prices per million tokens.
pub fn turn_cost(usage: &TokenUsage, spec: &ModelSpec) -> Decimal {
    let per = Decimal::from(TOKENS_PER_PRICE_UNIT);
    let read_mult: Decimal = CACHE_READ_MULTIPLIER.parse().expect("const multiplier");
    let write_mult: Decimal = CACHE_WRITE_MULTIPLIER.parse().expect("const multiplier");

    let input = Decimal::from(usage.input) * spec.input_price / per;
    let output = Decimal::from(usage.output) * spec.output_price / per;
    let cache_read = Decimal::from(usage.cache_read) * spec.input_price * read_mult / per;
    let cache_write = Decimal::from(usage.cache_write) * spec.input_price * write_mult / per;
    let thinking = Decimal::from(usage.thinking) * spec.output_price / per;

    input + output + cache_read + cache_write + thinking
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spec() -> ModelSpec {
        ModelSpec {
            id: "test".into(),
            context_window: 200_000,
            max_output: 8192,
            thinking_budget: 0,
            input_price: dec!(3),
            output_price: dec!(15),
            supports_thinking: true,
            supports_effort: false,
            supports_interleaved_thinking: false,
        }
    }

    #[test]
    fn plain_tokens() {
        let cost = turn_cost(
            &TokenUsage {
                input: 1000,
                output: 200,
                ..Default::default()
            },
            &spec(),
        );
        // 1000·3/1M + 200·15/1M = 0.003 + 0.003
        assert_eq!(cost, dec!(0.006));
    }

    #[test]
    fn cache_and_thinking_multipliers() {
        let cost = turn_cost(
            &TokenUsage {
                input: 0,
                output: 0,
                cache_read: 1_000_000,
                cache_write: 1_000_000,
                thinking: 1_000_000,
            },
            &spec(),
        );
        // 3·0.1 + 3·1.25 + 15 = 0.3 + 3.75 + 15
        assert_eq!(cost, dec!(19.05));
    }

    #[test]
    fn partial_turn_cost_matches_interrupt_scenario() {
        // ~200 output tokens at Sonnet pricing plus a small input.
        let cost = turn_cost(
            &TokenUsage {
                input: 500,
                output: 200,
                ..Default::default()
            },
            &spec(),
        );
        assert_eq!(cost, dec!(0.0045));
    }
}
