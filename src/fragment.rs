//! renderable units of conversation output.
//!
//! fragments are plain data: the view decides how they look. every fragment a
//! tool or a purchase produces is built from validated arguments only.

use serde::{Deserialize, Serialize};

use crate::format::{compute_cost, plain_number};

/// share count used when the model leaves it out.
pub const DEFAULT_SHARES: u32 = 10;
/// purchase slider bounds.
pub const MIN_SHARES: u32 = 10;
pub const MAX_SHARES: u32 = 1000;

/// a model-supplied quote. only lives inside one tool invocation's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockQuote {
    pub symbol: String,
    pub price: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
}

impl Trend {
    pub fn arrow(self) -> &'static str {
        match self {
            Trend::Up => "↑",
            Trend::Down => "↓",
        }
    }
}

impl StockQuote {
    pub fn new(symbol: impl Into<String>, price: f64, delta: f64) -> Self {
        Self { symbol: symbol.into(), price, delta }
    }

    /// flat quotes render as down, same as a loss.
    pub fn trend(&self) -> Trend {
        if self.delta > 0.0 { Trend::Up } else { Trend::Down }
    }

    /// `delta / price` as a percentage with two decimals, e.g. `1.11%`.
    pub fn percent_change(&self) -> String {
        if self.price == 0.0 {
            return "0.00%".to_string();
        }
        format!("{:.2}%", self.delta / self.price * 100.0)
    }

    /// follow-up turn sent when a quote in a list is selected.
    pub fn preview_prompt(&self) -> String {
        format!(
            "Preview the stock price of {}. The price is {} and delta is {}",
            self.symbol,
            plain_number(self.price),
            plain_number(self.delta),
        )
    }
}

/// the purchase configurator shown by `show_stock_purchase_ui`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseForm {
    pub symbol: String,
    pub price: f64,
    pub shares: u32,
}

impl PurchaseForm {
    /// a requested count is clamped to the slider range; none means the default.
    pub fn new(symbol: impl Into<String>, price: f64, shares: Option<u32>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            shares: shares.map_or(DEFAULT_SHARES, clamp_shares),
        }
    }

    /// moves the slider; out-of-range values stick to the nearest bound.
    pub fn with_shares(mut self, shares: u32) -> Self {
        self.shares = clamp_shares(shares);
        self
    }

    pub fn total(&self) -> f64 {
        f64::from(self.shares) * self.price
    }

    pub fn total_label(&self) -> String {
        compute_cost(self.shares, self.price)
    }
}

pub fn clamp_shares(shares: u32) -> u32 {
    shares.clamp(MIN_SHARES, MAX_SHARES)
}

/// progress of a purchase confirmation. strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PurchaseStage {
    Started,
    Updated,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// placeholder shown while the model has not answered yet.
    Spinner,
    /// an assistant text bubble.
    Text(String),
    /// a user-authored line in the transcript.
    UserText(String),
    StocksSkeleton,
    Stocks(Vec<StockQuote>),
    StockSkeleton,
    Stock(StockQuote),
    PurchaseSkeleton,
    Purchase(PurchaseForm),
    Purchasing {
        symbol: String,
        price: f64,
        shares: u32,
        stage: PurchaseStage,
    },
    /// an assistant-side notice about something that happened in the ui.
    Notice(String),
}

impl Fragment {
    /// placeholders are replaced later; everything else is a result.
    pub fn is_placeholder(&self) -> bool {
        matches!(
            self,
            Fragment::Spinner
                | Fragment::StocksSkeleton
                | Fragment::StockSkeleton
                | Fragment::PurchaseSkeleton
        )
    }

    /// plain-text rendering, one line per visual row.
    pub fn render_text(&self) -> String {
        match self {
            Fragment::Spinner => "...".to_string(),
            Fragment::Text(text) | Fragment::UserText(text) | Fragment::Notice(text) => text.clone(),
            Fragment::StocksSkeleton => "[loading stocks]".to_string(),
            Fragment::StockSkeleton => "[loading stock]".to_string(),
            Fragment::PurchaseSkeleton => "[loading purchase]".to_string(),
            Fragment::Stocks(quotes) => quotes
                .iter()
                .map(quote_line)
                .collect::<Vec<_>>()
                .join("\n"),
            Fragment::Stock(quote) => quote_line(quote),
            Fragment::Purchase(form) => format!(
                "{} ${} | shares to purchase: {} ({MIN_SHARES}-{MAX_SHARES}) | {} shares x ${} per share = {}",
                form.symbol,
                plain_number(form.price),
                form.shares,
                form.shares,
                plain_number(form.price),
                form.total_label(),
            ),
            Fragment::Purchasing { symbol, price, shares, stage } => {
                purchasing_text(symbol, *price, *shares, *stage)
            }
        }
    }
}

fn quote_line(quote: &StockQuote) -> String {
    format!(
        "{} {} ${} {} {}",
        quote.trend().arrow(),
        quote.symbol.to_uppercase(),
        plain_number(quote.price),
        quote.percent_change(),
        plain_number(quote.delta),
    )
}

pub(crate) fn purchasing_text(symbol: &str, price: f64, shares: u32, stage: PurchaseStage) -> String {
    match stage {
        PurchaseStage::Started => format!("Purchasing {shares} ${symbol}..."),
        PurchaseStage::Updated => format!("Purchasing {shares} ${symbol}... just a moment..."),
        PurchaseStage::Confirmed => format!(
            "You have successfully purchased {shares} ${symbol}. Total cost: {}",
            compute_cost(shares, price),
        ),
    }
}

/// the assistant-visible record of a finished purchase.
pub(crate) fn purchase_notice(symbol: &str, price: f64, shares: u32) -> String {
    format!(
        "You have purchased {shares} shares of {symbol} at ${}. Total cost = {}.",
        plain_number(price),
        compute_cost(shares, price),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn trend_follows_delta_sign() {
        assert_eq!(StockQuote::new("AAPL", 180.0, 2.0).trend(), Trend::Up);
        assert_eq!(StockQuote::new("MSFT", 300.0, -1.0).trend(), Trend::Down);
        assert_eq!(StockQuote::new("IBM", 150.0, 0.0).trend(), Trend::Down);
    }

    #[test]
    fn percent_change_is_relative_to_price() {
        assert_eq!(StockQuote::new("AAPL", 200.0, 2.0).percent_change(), "1.00%");
        assert_eq!(StockQuote::new("MSFT", 300.0, -1.0).percent_change(), "-0.33%");
        assert_eq!(StockQuote::new("ZERO", 0.0, 1.0).percent_change(), "0.00%");
    }

    #[test]
    fn preview_prompt_names_quote() {
        let quote = StockQuote::new("GOOGL", 140.0, 0.5);
        assert_eq!(
            quote.preview_prompt(),
            "Preview the stock price of GOOGL. The price is 140 and delta is 0.5"
        );
    }

    #[test]
    fn purchase_form_defaults_and_clamps() {
        let form = PurchaseForm::new("MSFT", 300.0, None);
        assert_eq!(form.shares, DEFAULT_SHARES);
        assert_eq!(form.total_label(), "$3,000.00");

        assert_eq!(form.clone().with_shares(5).shares, MIN_SHARES);
        assert_eq!(form.clone().with_shares(5000).shares, MAX_SHARES);
        assert_eq!(form.with_shares(250).total(), 75_000.0);
    }

    #[test]
    fn requested_shares_land_in_slider_range() {
        assert_eq!(PurchaseForm::new("MSFT", 300.0, Some(0)).shares, MIN_SHARES);
        assert_eq!(PurchaseForm::new("MSFT", 300.0, Some(5000)).shares, MAX_SHARES);
        assert_eq!(PurchaseForm::new("MSFT", 300.0, Some(25)).shares, 25);
    }

    #[test]
    fn purchasing_text_moves_through_stages() {
        assert_eq!(
            purchasing_text("AAPL", 180.0, 10, PurchaseStage::Started),
            "Purchasing 10 $AAPL..."
        );
        assert_eq!(
            purchasing_text("AAPL", 180.0, 10, PurchaseStage::Updated),
            "Purchasing 10 $AAPL... just a moment..."
        );
        assert_eq!(
            purchasing_text("AAPL", 180.0, 10, PurchaseStage::Confirmed),
            "You have successfully purchased 10 $AAPL. Total cost: $1,800.00"
        );
        assert_eq!(
            purchase_notice("AAPL", 180.0, 10),
            "You have purchased 10 shares of AAPL at $180. Total cost = $1,800.00."
        );
    }

    #[test]
    fn stock_list_renders_in_order() {
        let fragment = Fragment::Stocks(vec![
            StockQuote::new("AAPL", 180.0, 2.0),
            StockQuote::new("MSFT", 300.0, -1.0),
        ]);
        assert_eq!(fragment.render_text(), "↑ AAPL $180 1.11% 2\n↓ MSFT $300 -0.33% -1");
        assert!(!fragment.is_placeholder());
        assert!(Fragment::StocksSkeleton.is_placeholder());
    }
}
