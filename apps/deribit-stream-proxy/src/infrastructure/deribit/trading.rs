//! Trading Commands
//!
//! Thin request builders over [`UpstreamLink::request`]. Every command is one
//! correlated request on the shared session; the venue's result is returned
//! untouched as JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::correlator::RequestError;
use super::link::UpstreamLink;

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    /// `private/buy`.
    Buy,
    /// `private/sell`.
    Sell,
}

impl OrderSide {
    /// Venue method for this side.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Buy => "private/buy",
            Self::Sell => "private/sell",
        }
    }
}

/// Venue order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Limit order.
    #[default]
    Limit,
    /// Market order.
    Market,
    /// Stop-limit order.
    StopLimit,
    /// Stop-market order.
    StopMarket,
    /// Take-limit order.
    TakeLimit,
    /// Take-market order.
    TakeMarket,
    /// Market-limit order.
    MarketLimit,
    /// Trailing stop order.
    TrailingStop,
}

/// Parameters of `private/buy` and `private/sell`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Instrument to trade.
    pub instrument_name: String,
    /// Order size.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    /// Order type.
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Limit price; omitted for market orders.
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub price: Option<Decimal>,
    /// Only reduce an existing position.
    #[serde(default)]
    pub reduce_only: bool,
    /// Reject instead of taking liquidity.
    #[serde(default)]
    pub post_only: bool,
    /// User label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl OrderRequest {
    /// Limit order at `price`.
    #[must_use]
    pub fn limit(instrument: impl Into<String>, amount: Decimal, price: Decimal) -> Self {
        Self {
            instrument_name: instrument.into(),
            amount,
            order_type: OrderType::Limit,
            price: Some(price),
            reduce_only: false,
            post_only: false,
            label: None,
        }
    }

    /// Market order.
    #[must_use]
    pub fn market(instrument: impl Into<String>, amount: Decimal) -> Self {
        Self {
            instrument_name: instrument.into(),
            amount,
            order_type: OrderType::Market,
            price: None,
            reduce_only: false,
            post_only: false,
            label: None,
        }
    }

    /// Set `reduce_only`.
    #[must_use]
    pub const fn reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    /// Set `post_only`.
    #[must_use]
    pub const fn post_only(mut self, post_only: bool) -> Self {
        self.post_only = post_only;
        self
    }

    /// Attach a label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Serialize)]
struct EditParams<'a> {
    order_id: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    price: Decimal,
}

fn to_params<T: Serialize>(params: &T) -> Result<Value, RequestError> {
    serde_json::to_value(params).map_err(|e| RequestError::Encode(e.to_string()))
}

/// Trading and account commands on the shared session.
#[derive(Debug, Clone)]
pub struct TradingApi {
    link: UpstreamLink,
}

impl TradingApi {
    /// Create the API over a link.
    #[must_use]
    pub const fn new(link: UpstreamLink) -> Self {
        Self { link }
    }

    /// Place an order on `side`.
    ///
    /// # Errors
    ///
    /// Returns the link's [`RequestError`].
    pub async fn place(&self, side: OrderSide, order: &OrderRequest) -> Result<Value, RequestError> {
        tracing::info!(
            side = ?side,
            instrument = %order.instrument_name,
            amount = %order.amount,
            order_type = ?order.order_type,
            "Placing order"
        );
        self.link.request(side.method(), to_params(order)?).await
    }

    /// `private/buy`.
    ///
    /// # Errors
    ///
    /// Returns the link's [`RequestError`].
    pub async fn buy(&self, order: &OrderRequest) -> Result<Value, RequestError> {
        self.place(OrderSide::Buy, order).await
    }

    /// `private/sell`.
    ///
    /// # Errors
    ///
    /// Returns the link's [`RequestError`].
    pub async fn sell(&self, order: &OrderRequest) -> Result<Value, RequestError> {
        self.place(OrderSide::Sell, order).await
    }

    /// `private/edit`: change amount and price of an open order.
    ///
    /// # Errors
    ///
    /// Returns the link's [`RequestError`].
    pub async fn edit(
        &self,
        order_id: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<Value, RequestError> {
        let params = to_params(&EditParams {
            order_id,
            amount,
            price,
        })?;
        self.link.request("private/edit", params).await
    }

    /// `private/cancel`.
    ///
    /// # Errors
    ///
    /// Returns the link's [`RequestError`].
    pub async fn cancel(&self, order_id: &str) -> Result<Value, RequestError> {
        self.link
            .request("private/cancel", json!({ "order_id": order_id }))
            .await
    }

    /// `private/cancel_all`.
    ///
    /// # Errors
    ///
    /// Returns the link's [`RequestError`].
    pub async fn cancel_all(&self) -> Result<Value, RequestError> {
        self.link.request("private/cancel_all", json!({})).await
    }

    /// `private/get_account_summary` for one currency.
    ///
    /// # Errors
    ///
    /// Returns the link's [`RequestError`].
    pub async fn account_summary(&self, currency: &str) -> Result<Value, RequestError> {
        self.link
            .request(
                "private/get_account_summary",
                json!({ "currency": currency, "extended": true }),
            )
            .await
    }

    /// `public/ticker`.
    ///
    /// # Errors
    ///
    /// Returns the link's [`RequestError`].
    pub async fn ticker(&self, instrument: &str) -> Result<Value, RequestError> {
        self.link
            .request("public/ticker", json!({ "instrument_name": instrument }))
            .await
    }
}
