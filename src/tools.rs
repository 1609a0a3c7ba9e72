//! the closed set of tools the model may call.
//!
//! - `ToolName`: every tool the model is told about. unknown names are errors.
//! - `ToolArgs`: arguments after parsing and validation, one variant per tool.
//! - `Staged`: what a handler returns. a loading fragment right away, and a
//!   future that resolves to exactly one final fragment.

use std::time::Duration;

use bevy::log::{debug, info};
use futures_lite::future::{Boxed, FutureExt};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{ConversationError, Fragment, Latency, PurchaseForm, StockQuote};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    ListStocks,
    ShowStockPrice,
    ShowStockPurchaseUi,
}

impl ToolName {
    pub const ALL: [ToolName; 3] = [
        ToolName::ListStocks,
        ToolName::ShowStockPrice,
        ToolName::ShowStockPurchaseUi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ListStocks => "list_stocks",
            ToolName::ShowStockPrice => "show_stock_price",
            ToolName::ShowStockPurchaseUi => "show_stock_purchase_ui",
        }
    }

    pub fn parse(name: &str) -> Result<Self, ConversationError> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str() == name)
            .ok_or_else(|| ConversationError::UnknownTool(name.to_string()))
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolName::ListStocks => "List three stocks from the fortune 500 companies",
            ToolName::ShowStockPrice => {
                "Get the current price of a given stock. Use this to show the price to the user."
            }
            ToolName::ShowStockPurchaseUi => {
                "Show price and the UI to purchase a stock. Use this if the user wants to purchase a stock."
            }
        }
    }

    /// json schema of the arguments, as sent to the model.
    pub fn parameters(self) -> Value {
        match self {
            ToolName::ListStocks => json!({
                "type": "object",
                "properties": {
                    "stocks": {
                        "type": "array",
                        "items": quote_schema("The symbol of the stock"),
                    }
                },
                "required": ["stocks"],
            }),
            ToolName::ShowStockPrice => quote_schema("The symbol of the stock. e.g. TSLA/AAPL/GOOGL."),
            ToolName::ShowStockPurchaseUi => json!({
                "type": "object",
                "properties": {
                    "symbol": {
                        "type": "string",
                        "description": "The symbol of the stock. e.g. TSLA/AAPL/GOOGL.",
                    },
                    "price": { "type": "number", "description": "The price of the stock" },
                    "numberOfShares": {
                        "type": "number",
                        "description": "The **number of shares** for a stock to purchase. Can be optional if the user did not specify it.",
                    },
                },
                "required": ["symbol", "price"],
            }),
        }
    }

    pub fn latency(self, latency: &Latency) -> Duration {
        match self {
            ToolName::ListStocks => latency.list_stocks,
            ToolName::ShowStockPrice => latency.show_stock_price,
            ToolName::ShowStockPurchaseUi => latency.show_stock_purchase_ui,
        }
    }

    pub fn loading_fragment(self) -> Fragment {
        match self {
            ToolName::ListStocks => Fragment::StocksSkeleton,
            ToolName::ShowStockPrice => Fragment::StockSkeleton,
            ToolName::ShowStockPurchaseUi => Fragment::PurchaseSkeleton,
        }
    }
}

fn quote_schema(symbol_description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "symbol": { "type": "string", "description": symbol_description },
            "price": { "type": "number", "description": "The price of the stock" },
            "delta": { "type": "number", "description": "The change in price of the stock" },
        },
        "required": ["symbol", "price", "delta"],
    })
}

/// name + description + schema for one tool, the part the model sees.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: ToolName,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ListStocksArgs {
    stocks: Vec<StockQuote>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurchaseUiArgs {
    symbol: String,
    price: f64,
    #[serde(default)]
    number_of_shares: Option<f64>,
}

/// validated arguments, one variant per tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArgs {
    ListStocks { stocks: Vec<StockQuote> },
    ShowStockPrice(StockQuote),
    ShowStockPurchaseUi { symbol: String, price: f64, number_of_shares: Option<u32> },
}

impl ToolArgs {
    /// parses `raw` against the tool's schema. an empty string means `{}`.
    pub fn parse(tool: ToolName, raw: &str) -> Result<Self, ConversationError> {
        let raw = if raw.trim().is_empty() { "{}" } else { raw };
        let invalid = |err: serde_json::Error| ConversationError::invalid_arguments(tool.as_str(), err);
        let args = match tool {
            ToolName::ListStocks => {
                let ListStocksArgs { stocks } = serde_json::from_str(raw).map_err(invalid)?;
                for quote in &stocks {
                    check_quote(tool, quote)?;
                }
                ToolArgs::ListStocks { stocks }
            }
            ToolName::ShowStockPrice => {
                let quote: StockQuote = serde_json::from_str(raw).map_err(invalid)?;
                check_quote(tool, &quote)?;
                ToolArgs::ShowStockPrice(quote)
            }
            ToolName::ShowStockPurchaseUi => {
                let PurchaseUiArgs { symbol, price, number_of_shares } =
                    serde_json::from_str(raw).map_err(invalid)?;
                check_symbol(tool, &symbol)?;
                check_price(tool, price)?;
                let number_of_shares = number_of_shares.map(|n| whole_shares(tool, n)).transpose()?;
                ToolArgs::ShowStockPurchaseUi { symbol, price, number_of_shares }
            }
        };
        Ok(args)
    }

    pub fn tool(&self) -> ToolName {
        match self {
            ToolArgs::ListStocks { .. } => ToolName::ListStocks,
            ToolArgs::ShowStockPrice(_) => ToolName::ShowStockPrice,
            ToolArgs::ShowStockPurchaseUi { .. } => ToolName::ShowStockPurchaseUi,
        }
    }

    /// the final fragment, built from the arguments alone.
    pub fn final_fragment(self) -> Fragment {
        match self {
            ToolArgs::ListStocks { stocks } => Fragment::Stocks(stocks),
            ToolArgs::ShowStockPrice(quote) => Fragment::Stock(quote),
            ToolArgs::ShowStockPurchaseUi { symbol, price, number_of_shares } => {
                Fragment::Purchase(PurchaseForm::new(symbol, price, number_of_shares))
            }
        }
    }
}

fn check_quote(tool: ToolName, quote: &StockQuote) -> Result<(), ConversationError> {
    check_symbol(tool, &quote.symbol)?;
    check_price(tool, quote.price)?;
    if !quote.delta.is_finite() {
        return Err(ConversationError::invalid_arguments(tool.as_str(), "delta must be finite"));
    }
    Ok(())
}

fn check_symbol(tool: ToolName, symbol: &str) -> Result<(), ConversationError> {
    if symbol.trim().is_empty() {
        return Err(ConversationError::invalid_arguments(tool.as_str(), "symbol must not be empty"));
    }
    Ok(())
}

fn check_price(tool: ToolName, price: f64) -> Result<(), ConversationError> {
    if !price.is_finite() || price < 0.0 {
        return Err(ConversationError::invalid_arguments(
            tool.as_str(),
            format!("price must be a non-negative number, got {price}"),
        ));
    }
    Ok(())
}

/// the schema types share counts as json numbers. fractions round to the
/// nearest whole share, huge counts saturate; the form clamps afterwards.
fn whole_shares(tool: ToolName, shares: f64) -> Result<u32, ConversationError> {
    if !shares.is_finite() || shares < 0.0 {
        return Err(ConversationError::invalid_arguments(
            tool.as_str(),
            format!("numberOfShares must be a non-negative number, got {shares}"),
        ));
    }
    Ok(shares.round().min(f64::from(u32::MAX)) as u32)
}

/// two-stage handler output: `loading` now, then exactly one final fragment.
pub struct Staged {
    pub loading: Fragment,
    pending: Boxed<Fragment>,
}

impl Staged {
    pub fn new(loading: Fragment, pending: Boxed<Fragment>) -> Self {
        Self { loading, pending }
    }

    /// waits out the simulated work and yields the final fragment.
    pub async fn finish(self) -> Fragment {
        self.pending.await
    }
}

/// static tool table. handlers never touch history and never call each other.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    latency: Latency,
}

impl ToolRegistry {
    pub fn new(latency: Latency) -> Self {
        Self { latency }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        ToolName::ALL
            .into_iter()
            .map(|name| ToolSpec {
                name,
                description: name.description(),
                parameters: name.parameters(),
            })
            .collect()
    }

    /// looks up `name`, validates `raw` and starts the handler.
    pub fn dispatch(&self, name: &str, raw: &str) -> Result<Staged, ConversationError> {
        let tool = ToolName::parse(name)?;
        let args = ToolArgs::parse(tool, raw)?;
        Ok(self.run(args))
    }

    pub fn run(&self, args: ToolArgs) -> Staged {
        let tool = args.tool();
        let delay = tool.latency(&self.latency);
        info!(target: "bevy_stockbot", "tool dispatch: {} (latency={:?})", tool.as_str(), delay);
        let pending = async move {
            tokio::time::sleep(delay).await;
            debug!(target: "bevy_stockbot", "tool finished: {}", tool.as_str());
            args.final_fragment()
        }
        .boxed();
        Staged::new(tool.loading_fragment(), pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn trending() -> Vec<StockQuote> {
        vec![
            StockQuote::new("AAPL", 180.0, 2.0),
            StockQuote::new("MSFT", 300.0, -1.0),
            StockQuote::new("GOOGL", 140.0, 0.5),
        ]
    }

    #[test]
    fn names_round_trip_and_unknown_is_rejected() {
        for tool in ToolName::ALL {
            assert_eq!(ToolName::parse(tool.as_str()), Ok(tool));
        }
        assert_eq!(
            ToolName::parse("sell_stock"),
            Err(ConversationError::UnknownTool("sell_stock".into()))
        );
    }

    #[test]
    fn specs_cover_every_tool_with_object_schema() {
        let specs = ToolRegistry::default().specs();
        assert_eq!(specs.len(), 3);
        for spec in specs {
            assert_eq!(spec.parameters["type"], "object");
            assert!(!spec.description.is_empty());
        }
        let purchase = ToolName::ShowStockPurchaseUi.parameters();
        assert_eq!(purchase["required"], json!(["symbol", "price"]));
    }

    #[test]
    fn purchase_args_accept_camel_case_and_optional_shares() {
        let args = ToolArgs::parse(
            ToolName::ShowStockPurchaseUi,
            r#"{"symbol":"MSFT","price":300,"numberOfShares":25}"#,
        )
        .unwrap();
        assert_eq!(
            args.clone().final_fragment(),
            Fragment::Purchase(PurchaseForm { symbol: "MSFT".into(), price: 300.0, shares: 25 })
        );

        let args = ToolArgs::parse(ToolName::ShowStockPurchaseUi, r#"{"symbol":"MSFT","price":300}"#).unwrap();
        assert_eq!(
            args.final_fragment(),
            Fragment::Purchase(PurchaseForm { symbol: "MSFT".into(), price: 300.0, shares: 10 })
        );
    }

    #[test]
    fn purchase_shares_accept_any_json_number() {
        let shares = |raw: &str| match ToolArgs::parse(ToolName::ShowStockPurchaseUi, raw).unwrap() {
            ToolArgs::ShowStockPurchaseUi { number_of_shares, .. } => number_of_shares,
            other => panic!("unexpected args {other:?}"),
        };
        assert_eq!(shares(r#"{"symbol":"MSFT","price":300,"numberOfShares":25.0}"#), Some(25));
        assert_eq!(shares(r#"{"symbol":"MSFT","price":300,"numberOfShares":24.6}"#), Some(25));
        assert_eq!(shares(r#"{"symbol":"MSFT","price":300,"numberOfShares":1e12}"#), Some(u32::MAX));

        let err = ToolArgs::parse(
            ToolName::ShowStockPurchaseUi,
            r#"{"symbol":"MSFT","price":300,"numberOfShares":-3}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConversationError::InvalidArguments { .. }));

        let args = ToolArgs::parse(
            ToolName::ShowStockPurchaseUi,
            r#"{"symbol":"MSFT","price":300,"numberOfShares":5000.0}"#,
        )
        .unwrap();
        assert_eq!(
            args.final_fragment(),
            Fragment::Purchase(PurchaseForm { symbol: "MSFT".into(), price: 300.0, shares: 1000 })
        );
    }

    #[test]
    fn invalid_arguments_are_typed_errors() {
        let err = ToolArgs::parse(ToolName::ShowStockPrice, r#"{"symbol":"AAPL"}"#).unwrap_err();
        assert!(matches!(err, ConversationError::InvalidArguments { ref tool, .. } if tool == "show_stock_price"));

        let err = ToolArgs::parse(ToolName::ShowStockPrice, r#"{"symbol":"AAPL","price":-5,"delta":1}"#)
            .unwrap_err();
        assert!(matches!(err, ConversationError::InvalidArguments { .. }));

        let err = ToolArgs::parse(ToolName::ListStocks, "").unwrap_err();
        assert!(matches!(err, ConversationError::InvalidArguments { .. }));

        let err = ToolArgs::parse(ToolName::ShowStockPurchaseUi, r#"{"symbol":" ","price":1}"#).unwrap_err();
        assert!(matches!(err, ConversationError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn dispatch_emits_loading_then_final() {
        let registry = ToolRegistry::new(Latency::instant());
        let raw = serde_json::to_string(&json!({ "stocks": trending() })).unwrap();
        let staged = registry.dispatch("list_stocks", &raw).unwrap();

        let mut fragments = vec![staged.loading.clone()];
        fragments.push(staged.finish().await);

        assert_eq!(fragments, vec![Fragment::StocksSkeleton, Fragment::Stocks(trending())]);
    }

    #[tokio::test(start_paused = true)]
    async fn handlers_wait_their_latency() {
        let registry = ToolRegistry::default();
        let started = tokio::time::Instant::now();
        let staged = registry
            .dispatch("show_stock_purchase_ui", r#"{"symbol":"AAPL","price":180}"#)
            .unwrap();
        assert_eq!(staged.loading, Fragment::PurchaseSkeleton);
        let fragment = staged.finish().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(fragment, Fragment::Purchase(PurchaseForm::new("AAPL", 180.0, None)));
    }
}
