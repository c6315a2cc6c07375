//! Wire codec for request and response stream entries.
//!
//! A request entry carries `type` (the operation tag), `reqId` (caller correlation id) and
//! `data` (a JSON document). Responses carry `type`, `reqId`, `status` (`ok` / `error`),
//! `data`, optionally `orderId`, and on failure an `error` JSON object `{code, message}`.
//! Publishers stamp every entry with a `timestamp` field (epoch millis).
//!
//! Decoding happens once, at the boundary. Everything past it works with the typed
//! `EngineRequest`.

use crate::broker::{Fields, StreamEntry};
use crate::types::{OrderId, PositionId, Quote, Side, Symbol, Timestamp, UserId};
use crate::order::OrderType;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FIELD_TYPE: &str = "type";
pub const FIELD_REQ_ID: &str = "reqId";
pub const FIELD_DATA: &str = "data";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_ORDER_ID: &str = "orderId";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_TIMESTAMP: &str = "timestamp";

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    #[serde(alias = "emailId")]
    pub user_id: UserId,
    pub amount: Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrderRequest {
    pub order_id: OrderId,
    #[serde(alias = "emailId")]
    pub user_id: UserId,
    #[serde(alias = "asset")]
    pub symbol: Symbol,
    pub side: Side,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    pub size: Decimal,
    pub leverage: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    #[serde(alias = "emailId")]
    pub user_id: UserId,
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePositionRequest {
    #[serde(alias = "emailId")]
    pub user_id: UserId,
    pub position_id: PositionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdateRequest {
    #[serde(alias = "asset")]
    pub symbol: Symbol,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    #[serde(alias = "emailId")]
    pub user_id: UserId,
}

/// Decoded request. Unrecognized tags decode to `Unknown` rather than failing.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineRequest {
    Deposit(DepositRequest),
    OpenOrder(OpenOrderRequest),
    CancelOrder(CancelOrderRequest),
    ClosePosition(ClosePositionRequest),
    PriceUpdate(PriceUpdateRequest),
    GetBalance(UserQuery),
    GetPositions(UserQuery),
    GetOrders(UserQuery),
    Unknown { tag: String },
}

impl EngineRequest {
    /// Canonical wire tag.
    pub fn tag(&self) -> &str {
        match self {
            EngineRequest::Deposit(_) => "deposit",
            EngineRequest::OpenOrder(_) => "open-order",
            EngineRequest::CancelOrder(_) => "cancel-order",
            EngineRequest::ClosePosition(_) => "close-position",
            EngineRequest::PriceUpdate(_) => "price-update",
            EngineRequest::GetBalance(_) => "get-balance",
            EngineRequest::GetPositions(_) => "get-positions",
            EngineRequest::GetOrders(_) => "get-orders",
            EngineRequest::Unknown { tag } => tag,
        }
    }

    /// Data document for the request, as published by clients.
    pub fn data(&self) -> Result<Value, serde_json::Error> {
        match self {
            EngineRequest::Deposit(d) => serde_json::to_value(d),
            EngineRequest::OpenOrder(d) => serde_json::to_value(d),
            EngineRequest::CancelOrder(d) => serde_json::to_value(d),
            EngineRequest::ClosePosition(d) => serde_json::to_value(d),
            EngineRequest::PriceUpdate(d) => serde_json::to_value(d),
            EngineRequest::GetBalance(d) | EngineRequest::GetPositions(d) | EngineRequest::GetOrders(d) => {
                serde_json::to_value(d)
            }
            EngineRequest::Unknown { .. } => Ok(Value::Null),
        }
    }

    /// Encodes as request entry fields, stamped with `timestamp`.
    pub fn to_fields(&self, req_id: &str, timestamp: Timestamp) -> Result<Fields, serde_json::Error> {
        Ok(vec![
            (FIELD_TYPE.to_string(), self.tag().to_string()),
            (FIELD_REQ_ID.to_string(), req_id.to_string()),
            (FIELD_DATA.to_string(), serde_json::to_string(&self.data()?)?),
            (FIELD_TIMESTAMP.to_string(), timestamp.as_millis().to_string()),
        ])
    }

    /// Whether the engine answers this request on the response stream.
    pub fn expects_response(&self) -> bool {
        !matches!(self, EngineRequest::PriceUpdate(_))
    }
}

/// A decoded request entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub req_id: String,
    pub request: EngineRequest,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid `{tag}` payload: {source}")]
    InvalidPayload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid `{field}` value: {value}")]
    InvalidValue { field: &'static str, value: String },
}

fn payload<T: DeserializeOwned>(tag: &str, data: Option<&str>) -> Result<T, DecodeError> {
    let raw = data.ok_or(DecodeError::MissingField(FIELD_DATA))?;
    serde_json::from_str(raw).map_err(|source| DecodeError::InvalidPayload {
        tag: tag.to_string(),
        source,
    })
}

/// Decodes a request entry. Tag aliases from older publishers are accepted.
pub fn decode_request(entry: &StreamEntry) -> Result<Envelope, DecodeError> {
    let tag = entry.field(FIELD_TYPE).ok_or(DecodeError::MissingField(FIELD_TYPE))?;
    let req_id = entry.field(FIELD_REQ_ID).ok_or(DecodeError::MissingField(FIELD_REQ_ID))?;
    let data = entry.field(FIELD_DATA);

    let request = match tag {
        "deposit" => EngineRequest::Deposit(payload(tag, data)?),
        "open-order" | "trade-open" => EngineRequest::OpenOrder(payload(tag, data)?),
        "cancel-order" | "order-cancel" => EngineRequest::CancelOrder(payload(tag, data)?),
        "close-position" | "position-close" => EngineRequest::ClosePosition(payload(tag, data)?),
        "price-update" => EngineRequest::PriceUpdate(payload(tag, data)?),
        "get-balance" | "get-user-bal" => EngineRequest::GetBalance(payload(tag, data)?),
        "get-positions" => EngineRequest::GetPositions(payload(tag, data)?),
        "get-orders" => EngineRequest::GetOrders(payload(tag, data)?),
        other => EngineRequest::Unknown { tag: other.to_string() },
    };

    Ok(Envelope {
        req_id: req_id.to_string(),
        request,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Response published on the response stream, keyed by the request's `reqId`.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    pub kind: String,
    pub req_id: String,
    pub order_id: Option<OrderId>,
    pub outcome: Result<Value, ErrorBody>,
}

impl EngineResponse {
    pub fn ok(kind: impl Into<String>, req_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            req_id: req_id.into(),
            order_id: None,
            outcome: Ok(data),
        }
    }

    pub fn error(kind: impl Into<String>, req_id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            req_id: req_id.into(),
            order_id: None,
            outcome: Err(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn with_order_id(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn data(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error_body(&self) -> Option<&ErrorBody> {
        self.outcome.as_ref().err()
    }

    pub fn to_fields(&self, timestamp: Timestamp) -> Fields {
        let mut fields = vec![
            (FIELD_TYPE.to_string(), self.kind.clone()),
            (FIELD_REQ_ID.to_string(), self.req_id.clone()),
        ];
        match &self.outcome {
            Ok(data) => {
                fields.push((FIELD_STATUS.to_string(), STATUS_OK.to_string()));
                fields.push((FIELD_DATA.to_string(), data.to_string()));
            }
            Err(body) => {
                fields.push((FIELD_STATUS.to_string(), STATUS_ERROR.to_string()));
                fields.push((FIELD_DATA.to_string(), Value::Null.to_string()));
                // ErrorBody is two strings, serialization cannot fail
                let error = serde_json::to_string(body).unwrap_or_default();
                fields.push((FIELD_ERROR.to_string(), error));
            }
        }
        if let Some(order_id) = &self.order_id {
            fields.push((FIELD_ORDER_ID.to_string(), order_id.to_string()));
        }
        fields.push((FIELD_TIMESTAMP.to_string(), timestamp.as_millis().to_string()));
        fields
    }

    pub fn from_entry(entry: &StreamEntry) -> Result<Self, DecodeError> {
        let kind = entry.field(FIELD_TYPE).ok_or(DecodeError::MissingField(FIELD_TYPE))?;
        let req_id = entry.field(FIELD_REQ_ID).ok_or(DecodeError::MissingField(FIELD_REQ_ID))?;
        let status = entry.field(FIELD_STATUS).ok_or(DecodeError::MissingField(FIELD_STATUS))?;

        let outcome = match status {
            STATUS_OK => {
                let data = entry.field(FIELD_DATA).unwrap_or("null");
                Ok(serde_json::from_str(data).map_err(|source| DecodeError::InvalidPayload {
                    tag: kind.to_string(),
                    source,
                })?)
            }
            STATUS_ERROR => Err(payload::<ErrorBody>(kind, entry.field(FIELD_ERROR))?),
            other => {
                return Err(DecodeError::InvalidValue {
                    field: FIELD_STATUS,
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            kind: kind.to_string(),
            req_id: req_id.to_string(),
            order_id: entry.field(FIELD_ORDER_ID).map(OrderId::from),
            outcome,
        })
    }
}
