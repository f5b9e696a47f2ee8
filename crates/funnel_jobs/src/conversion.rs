//! Step-to-step conversion rates for a funnel report.

use serde::{Deserialize, Serialize};
use shared::protocol::ReportStep;

/// Rate of the first step; every funnel starts at 100%.
pub const FIRST_STEP_RATE: &str = "100";
/// Rate reported when the previous step had no users.
pub const ZERO_RATE: &str = "0.00";

const TRUNCATED_RATE_LEN: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateFormat {
    /// Two decimals cut to four characters: `42.37` becomes `42.3`, `150.00` becomes `150.`.
    /// This is what the dashboard has always rendered.
    #[default]
    Truncated,
    /// Plain two-decimal percentage (`42.37`, `150.00`).
    TwoDecimals,
}

impl std::str::FromStr for RateFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "truncated" => Ok(Self::Truncated),
            "two_decimals" | "two-decimals" => Ok(Self::TwoDecimals),
            other => Err(format!("unknown rate format '{other}'")),
        }
    }
}

pub fn conversion_rate(users: u64, previous_users: u64, format: RateFormat) -> String {
    let ratio = users as f64 / previous_users as f64;
    if !ratio.is_finite() {
        return ZERO_RATE.to_string();
    }

    let formatted = two_decimals(ratio * 100.0);
    match format {
        RateFormat::Truncated => formatted.chars().take(TRUNCATED_RATE_LEN).collect(),
        RateFormat::TwoDecimals => formatted,
    }
}

/// Formats `percent` with two decimals, rounding exact ties up (`3.125` is `3.13`).
///
/// `{:.2}` alone rounds ties to even. A tie at the third decimal needs a value
/// that is a whole multiple of 1/16, so anything else is left to the formatter,
/// which already rounds the exact binary value.
fn two_decimals(percent: f64) -> String {
    let hundredths = percent * 100.0;
    if hundredths.fract() == 0.5 && (percent * 16.0).fract() == 0.0 {
        return format!("{:.2}", hundredths.ceil() / 100.0);
    }
    format!("{percent:.2}")
}

/// Annotates each step with its conversion rate relative to the step before it.
pub fn calculate_conversions(steps: &mut [ReportStep], format: RateFormat) {
    let mut previous_users = None;
    for step in steps.iter_mut() {
        step.conversion_rate = Some(match previous_users {
            None => FIRST_STEP_RATE.to_string(),
            Some(previous) => conversion_rate(step.users, previous, format),
        });
        previous_users = Some(step.users);
    }
}
