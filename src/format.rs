//! number formatting shared by fragments and history text.

/// formats a dollar amount the en-US currency way: `$1,234.50`, `-$3.00`.
pub fn format_usd(value: f64) -> String {
    let cents = (value.abs() * 100.0).round() as u128;
    let whole = group_thousands(&(cents / 100).to_string());
    let sign = if value < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}${whole}.{:02}", cents % 100)
}

/// total cost of `shares` at `price`, currency formatted.
pub fn compute_cost(shares: u32, price: f64) -> String {
    format_usd(f64::from(shares) * price)
}

/// shortest plain rendering of a number: `180`, `180.5`, `-1`.
///
/// used for the bracketed history records, which read back to the model.
pub fn plain_number(value: f64) -> String {
    if value == 0.0 {
        // avoids "-0"
        return "0".to_string();
    }
    format!("{value}")
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cost_uses_currency_format() {
        assert_eq!(compute_cost(10, 100.0), "$1,000.00");
        assert_eq!(compute_cost(10, 180.0), "$1,800.00");
        assert_eq!(compute_cost(3, 0.5), "$1.50");
        assert_eq!(compute_cost(0, 42.0), "$0.00");
    }

    #[test]
    fn usd_groups_and_rounds() {
        assert_eq!(format_usd(1_234_567.891), "$1,234,567.89");
        assert_eq!(format_usd(999.999), "$1,000.00");
        assert_eq!(format_usd(-12.5), "-$12.50");
        assert_eq!(format_usd(-0.001), "$0.00");
        assert_eq!(format_usd(100_000.0), "$100,000.00");
    }

    #[test]
    fn plain_numbers_drop_trailing_zero_fraction() {
        assert_eq!(plain_number(180.0), "180");
        assert_eq!(plain_number(1800.0), "1800");
        assert_eq!(plain_number(180.25), "180.25");
        assert_eq!(plain_number(-1.0), "-1");
        assert_eq!(plain_number(-0.0), "0");
    }
}
