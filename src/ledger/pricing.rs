use serde::{Deserialize, Serialize};

/// モデルの料金表（100万トークンあたりの価格）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateCard {
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl RateCard {
    pub fn new(input_price_per_million: f64, output_price_per_million: f64) -> Self {
        Self {
            input_price_per_million,
            output_price_per_million,
            currency: default_currency(),
        }
    }
}

/// 料金の内訳
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

/// 入出力トークン数から料金を計算（料金表なしは0）
pub fn calculate_cost(
    input_tokens: u64,
    output_tokens: u64,
    rate_card: Option<&RateCard>,
) -> CostBreakdown {
    let Some(rate_card) = rate_card else {
        return CostBreakdown {
            input_tokens,
            output_tokens,
            ..Default::default()
        };
    };

    let input_cost = input_tokens as f64 / 1_000_000.0 * rate_card.input_price_per_million;
    let output_cost = output_tokens as f64 / 1_000_000.0 * rate_card.output_price_per_million;

    CostBreakdown {
        input_tokens,
        output_tokens,
        input_cost,
        output_cost,
        total_cost: input_cost + output_cost,
    }
}
