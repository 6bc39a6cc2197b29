use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::service::cache::types::CacheModel;

/// Prices are quoted per this many tokens.
const PRICE_TOKEN_UNIT: i128 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens: prompt_tokens.max(0),
            completion_tokens: completion_tokens.max(0),
        }
    }

    pub fn total(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Reads an OpenAI `usage` object. Returns `None` when absent or null.
    pub fn from_openai_usage(usage: &Value) -> Option<Self> {
        if !usage.is_object() {
            return None;
        }
        let prompt = usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0);
        let completion = usage
            .get("completion_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Some(Self::new(prompt, completion))
    }
}

/// Per-model prices in micro-units per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriceSheet {
    pub input_cost: i64,
    pub output_cost: i64,
    pub input_price: i64,
    pub output_price: i64,
}

impl From<&CacheModel> for PriceSheet {
    fn from(model: &CacheModel) -> Self {
        Self {
            input_cost: model.input_cost,
            output_cost: model.output_cost,
            input_price: model.input_price,
            output_price: model.output_price,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Charge {
    /// What the upstream charges us, in micro-units.
    pub cost: i64,
    /// What the caller is charged, in micro-units.
    pub revenue: i64,
}

pub fn compute_charge(usage: &TokenUsage, prices: &PriceSheet) -> Charge {
    Charge {
        cost: price_tokens(usage, prices.input_cost, prices.output_cost),
        revenue: price_tokens(usage, prices.input_price, prices.output_price),
    }
}

// Exact integer arithmetic, rounded half-up to the nearest micro-unit.
fn price_tokens(usage: &TokenUsage, input_rate: i64, output_rate: i64) -> i64 {
    let numerator = usage.prompt_tokens as i128 * input_rate as i128
        + usage.completion_tokens as i128 * output_rate as i128;
    let rounded = (numerator + PRICE_TOKEN_UNIT / 2).div_euclid(PRICE_TOKEN_UNIT);
    rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Rough token count used when an upstream omits usage: one token per four
/// characters, rounded up.
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count() as i64;
    (chars + 3) / 4
}

/// Renders micro-units with six decimal places.
pub fn format_micros(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    format!("{}{}.{:06}", sign, abs / 1_000_000, abs % 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_compute_charge_simple() {
        // $0.15 / $0.60 per 1M tokens cost, $0.30 / $1.20 sell.
        let prices = PriceSheet {
            input_cost: 150_000,
            output_cost: 600_000,
            input_price: 300_000,
            output_price: 1_200_000,
        };
        let charge = compute_charge(&TokenUsage::new(1_000, 500), &prices);
        assert_eq!(charge.cost, 450);
        assert_eq!(charge.revenue, 900);
        assert_eq!(format_micros(charge.revenue), "0.000900");
    }

    #[test]
    fn test_rounding_half_up() {
        let prices = PriceSheet {
            input_price: 1_500_000,
            ..Default::default()
        };
        // 1 token * 1.5 micro-units rounds to 2.
        assert_eq!(compute_charge(&TokenUsage::new(1, 0), &prices).revenue, 2);
        // 1 token * 0.4 micro-units rounds to 0.
        let cheap = PriceSheet {
            input_price: 400_000,
            ..Default::default()
        };
        assert_eq!(compute_charge(&TokenUsage::new(1, 0), &cheap).revenue, 0);
    }

    #[test]
    fn test_no_drift_over_random_inputs() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..10_000 {
            let usage = TokenUsage::new(rng.random_range(0..2_000_000), rng.random_range(0..500_000));
            let prices = PriceSheet {
                input_cost: rng.random_range(0..50_000_000),
                output_cost: rng.random_range(0..50_000_000),
                input_price: rng.random_range(0..80_000_000),
                output_price: rng.random_range(0..80_000_000),
            };
            let charge = compute_charge(&usage, &prices);

            let exact = usage.prompt_tokens as i128 * prices.input_price as i128
                + usage.completion_tokens as i128 * prices.output_price as i128;
            // Within half a micro-unit of the exact rational value.
            let diff = charge.revenue as i128 * PRICE_TOKEN_UNIT - exact;
            assert!(diff > -PRICE_TOKEN_UNIT / 2 - 1 && diff <= PRICE_TOKEN_UNIT / 2, "diff {}", diff);

            let rendered = format_micros(charge.revenue);
            let (whole, frac) = rendered.split_once('.').unwrap();
            assert_eq!(frac.len(), 6);
            assert_eq!(
                whole.parse::<i64>().unwrap() * 1_000_000 + frac.parse::<i64>().unwrap(),
                charge.revenue
            );
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_usage_from_openai() {
        let usage = serde_json::json!({"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42});
        let parsed = TokenUsage::from_openai_usage(&usage).unwrap();
        assert_eq!(parsed.total(), 42);
        assert!(TokenUsage::from_openai_usage(&Value::Null).is_none());
    }
}
