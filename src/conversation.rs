//! one chat session: history, turn queue, tool dispatch, purchases.

use std::fmt;
use std::sync::Arc;

use bevy::log::{error, info, warn};
use futures_lite::StreamExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::fragment::{purchase_notice, purchasing_text};
use crate::format::plain_number;
use crate::model::{LlmChatModel, ModelRequest, ModelResponse, TextStream};
use crate::{
    ChatModel, ConversationError, Fragment, History, Latency, PurchaseStage, Role, ServerMessage,
    Staged, StockbotConfig, StreamableUi, ToolRegistry, UiValue, clamp_shares,
};

pub const SYSTEM_PROMPT: &str = "\
You are a stock trading conversation bot and you can help users buy stocks, step by step.
You and the user can discuss stock prices and the user can adjust the amount of stocks they want to buy, or place an order, in the UI.

Messages inside [] means that it's a UI element or a user event. For example:
- \"[Price of AAPL = 100]\" means that an interface of the stock price of AAPL is shown to the user.
- \"[User has changed the amount of AAPL to 10]\" means that the user has changed the amount of AAPL to 10 in the UI.

If you want to show trending stocks, call `list_stocks`.
If the user just wants the price, call `show_stock_price` to show the price.
If the user requests purchasing a stock, call `show_stock_purchase_ui` to show the purchase UI.
If the user wants to sell stock, or complete another impossible task, respond that you are a demo and cannot do that.

Besides that, you can also chat with users and do some calculations if needed.";

/// starter prompts shown on an empty transcript.
pub const EXAMPLE_PROMPTS: [&str; 3] = [
    "What are the trending stocks?",
    "What's the stock price of AAPL?",
    "I'd like to buy 10 shares of MSFT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// what a turn hands back to the client. `display` keeps updating after the
/// call returns.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    pub id: MessageId,
    pub role: Role,
    pub display: UiValue,
}

/// handles returned by `confirm_purchase` before any delay has elapsed.
#[derive(Debug)]
pub struct PurchaseConfirmation {
    /// "purchasing..." -> "just a moment..." -> confirmed
    pub purchasing_ui: UiValue,
    /// empty until the purchase is confirmed, then the notice
    pub new_message: ClientMessage,
    pub task: JoinHandle<Result<(), ConversationError>>,
}

impl PurchaseConfirmation {
    /// waits for the background sequence, history write included.
    pub async fn join(self) -> Result<(), ConversationError> {
        self.task.await.map_err(|_| ConversationError::Abandoned)?
    }
}

/// the history record the model reads back after a purchase.
pub fn purchase_record(symbol: &str, price: f64, shares: u32) -> String {
    format!(
        "[User has purchased {shares} shares of {symbol} at {}. Total cost = {}]",
        plain_number(price),
        plain_number(f64::from(shares) * price),
    )
}

pub fn share_change_record(symbol: &str, shares: u32) -> String {
    format!("[User has changed the amount of {symbol} to {shares}]")
}

struct Inner {
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    history: History,
    /// one turn at a time per session; waiters queue in fifo order.
    turns: Arc<Mutex<()>>,
    temperature: f32,
    latency: Latency,
}

/// a chat session. clones share the same history and turn queue.
#[derive(Clone)]
pub struct Stockbot {
    inner: Arc<Inner>,
}

impl Stockbot {
    pub fn new(model: Arc<dyn ChatModel>, config: &StockbotConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                model,
                tools: ToolRegistry::new(config.latency),
                history: History::new(),
                turns: Arc::new(Mutex::new(())),
                temperature: config.temperature,
                latency: config.latency,
            }),
        }
    }

    /// session over an openai-compatible provider built from `config`.
    pub fn from_config(config: &StockbotConfig) -> Result<Self, ConversationError> {
        let specs = ToolRegistry::new(config.latency).specs();
        let model = LlmChatModel::from_config(config, SYSTEM_PROMPT, &specs)?;
        Ok(Self::new(Arc::new(model), config))
    }

    pub fn history(&self) -> Vec<ServerMessage> {
        self.inner.history.get()
    }

    pub fn history_store(&self) -> &History {
        &self.inner.history
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    /// runs one turn. returns once the model has picked text or a tool; the
    /// returned display then streams to its final fragment.
    ///
    /// turns on one session run strictly one after another: a second call
    /// waits here until the previous turn has settled.
    pub async fn continue_conversation(
        &self,
        input: impl Into<String>,
    ) -> Result<ClientMessage, ConversationError> {
        let input = input.into();
        let guard = self.inner.turns.clone().lock_owned().await;

        let user = ServerMessage::user(input);
        let user_index = self.inner.history.append(user.clone());
        let turn = PendingTurn {
            history: self.inner.history.clone(),
            user_index,
            user,
            _guard: guard,
        };

        let request = ModelRequest {
            system: SYSTEM_PROMPT.to_string(),
            temperature: self.inner.temperature,
            messages: self.inner.history.get(),
            tools: self.inner.tools.specs(),
        };
        info!(
            target: "bevy_stockbot",
            "continue_conversation: msgs={} tools={} temperature={}",
            request.messages.len(), request.tools.len(), request.temperature
        );

        let display = StreamableUi::new(Some(Fragment::Spinner));
        let response = match self.inner.model.respond(request).await {
            Ok(response) => response,
            Err(err) => {
                turn.abort(&err);
                return Err(err);
            }
        };

        match response {
            ModelResponse::Text(s) => {
                info!(target: "bevy_stockbot", "model answered with text");
                let value = display.value();
                tokio::spawn(stream_text(s, display, turn));
                Ok(self.assistant_message(value))
            }
            ModelResponse::ToolCall(call) => {
                info!(target: "bevy_stockbot", "model called tool `{}`", call.name);
                let staged = match self.inner.tools.dispatch(&call.name, &call.arguments) {
                    Ok(staged) => staged,
                    Err(err) => {
                        turn.abort(&err);
                        return Err(err);
                    }
                };
                display.update(staged.loading.clone())?;
                let value = display.value();
                tokio::spawn(finish_tool(staged, display, turn));
                Ok(self.assistant_message(value))
            }
        }
    }

    fn assistant_message(&self, display: UiValue) -> ClientMessage {
        ClientMessage {
            id: MessageId::new(),
            role: Role::Assistant,
            display,
        }
    }

    /// starts the simulated purchase in the background and returns at once.
    ///
    /// the history gains exactly one system record, after both delays.
    pub async fn confirm_purchase(
        &self,
        symbol: impl Into<String>,
        price: f64,
        shares: u32,
    ) -> Result<PurchaseConfirmation, ConversationError> {
        let symbol = symbol.into();
        if symbol.trim().is_empty() {
            return Err(ConversationError::InvalidPurchase("symbol must not be empty".into()));
        }
        if !price.is_finite() || price < 0.0 {
            return Err(ConversationError::InvalidPurchase(format!(
                "price must be a non-negative number, got {price}"
            )));
        }
        if shares == 0 {
            return Err(ConversationError::InvalidPurchase("shares must be positive".into()));
        }

        info!(target: "bevy_stockbot", "confirm_purchase: {} x {} @ {}", shares, symbol, price);
        let stage = |stage| Fragment::Purchasing { symbol: symbol.clone(), price, shares, stage };
        let purchasing = StreamableUi::new(Some(stage(PurchaseStage::Started)));
        let notice = StreamableUi::new(None);
        let purchasing_ui = purchasing.value();
        let notice_ui = notice.value();

        let history = self.inner.history.clone();
        let latency = self.inner.latency;
        let updated = stage(PurchaseStage::Updated);
        let confirmed = stage(PurchaseStage::Confirmed);
        let task = tokio::spawn(async move {
            tokio::time::sleep(latency.purchase_update).await;
            purchasing.update(updated)?;
            info!(target: "bevy_stockbot", "{}", purchasing_text(&symbol, price, shares, PurchaseStage::Updated));

            tokio::time::sleep(latency.purchase_confirm).await;
            history.record(ServerMessage::system(purchase_record(&symbol, price, shares)));
            purchasing.done(confirmed)?;
            notice.done(Fragment::Notice(purchase_notice(&symbol, price, shares)))?;
            info!(target: "bevy_stockbot", "purchase confirmed: {} x {}", shares, symbol);
            Ok(())
        });

        Ok(PurchaseConfirmation {
            purchasing_ui,
            new_message: self.assistant_message(notice_ui),
            task,
        })
    }

    /// records a slider move so the model sees the new amount. returns the
    /// clamped share count.
    pub fn adjust_shares(&self, symbol: &str, shares: u32) -> u32 {
        let shares = clamp_shares(shares);
        self.inner
            .history
            .record(ServerMessage::system(share_change_record(symbol, shares)));
        shares
    }
}

/// a turn between the user append and its commit. dropping it frees the
/// session for the next turn.
struct PendingTurn {
    history: History,
    user_index: usize,
    user: ServerMessage,
    _guard: OwnedMutexGuard<()>,
}

impl PendingTurn {
    fn commit(self, reply: Option<ServerMessage>) -> Result<(), ConversationError> {
        self.history.finalize(|mut messages| {
            messages.extend(reply);
            messages
        })
    }

    fn abort(self, err: &ConversationError) {
        warn!(target: "bevy_stockbot", "turn failed: {err}");
        if !self.history.retract(self.user_index, &self.user) {
            warn!(target: "bevy_stockbot", "turn failed after its user message became durable");
        }
    }
}

async fn stream_text(mut s: TextStream, display: StreamableUi, turn: PendingTurn) {
    let mut content = String::new();
    while let Some(chunk) = s.next().await {
        match chunk {
            Ok(delta) => {
                content.push_str(&delta);
                let _ = display.update(Fragment::Text(content.clone()));
            }
            Err(err) => {
                error!(target: "bevy_stockbot", "streaming error: {}", err);
                turn.abort(&err);
                let _ = display.fail(err);
                return;
            }
        }
    }
    info!(target: "bevy_stockbot", "stream completed: final_len={}", content.len());
    match turn.commit(Some(ServerMessage::assistant(content.clone()))) {
        Ok(()) => {
            let _ = display.done(Fragment::Text(content));
        }
        Err(err) => {
            let _ = display.fail(err);
        }
    }
}

async fn finish_tool(staged: Staged, display: StreamableUi, turn: PendingTurn) {
    let fragment = staged.finish().await;
    match turn.commit(None) {
        Ok(()) => {
            let _ = display.done(fragment);
        }
        Err(err) => {
            let _ = display.fail(err);
        }
    }
}
