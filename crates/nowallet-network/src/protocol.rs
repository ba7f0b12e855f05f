//! Wire messages of the Electrum-style JSON-RPC protocol.
//!
//! Every message is one JSON object on one line. Requests carry a numeric
//! `id` that the server echoes in its response; notifications carry a
//! `method` and no `id`.

use nowallet_core::error::LinkError;
use nowallet_core::types::AddressNotification;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

/// Encode a request as a single line (without the trailing newline, which
/// the line codec appends).
pub fn encode_request(id: u64, method: &str, params: &[Value]) -> Result<String, LinkError> {
    let req = Request {
        jsonrpc: "2.0",
        id,
        method,
        params,
    };
    Ok(serde_json::to_string(&req)?)
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// A decoded line received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// The answer to the request with the same `id`.
    Response {
        id: u64,
        result: Result<Value, LinkError>,
    },
    /// A server push, such as a subscription update.
    Notification { method: String, params: Vec<Value> },
}

impl Incoming {
    /// Decode one line.
    pub fn parse(line: &str) -> Result<Self, LinkError> {
        let raw: RawMessage = serde_json::from_str(line)?;

        match (raw.id, raw.method) {
            (Some(id), _) if !id.is_null() => {
                let id = id
                    .as_u64()
                    .ok_or_else(|| LinkError::Protocol(format!("non-numeric response id {id}")))?;
                let result = match raw.error {
                    Some(err) => Err(rpc_error(err)),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Incoming::Response { id, result })
            }
            (_, Some(method)) => {
                let params = match raw.params {
                    Some(Value::Array(params)) => params,
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => vec![other],
                };
                Ok(Incoming::Notification { method, params })
            }
            _ => Err(LinkError::Protocol("message has neither id nor method".into())),
        }
    }
}

fn rpc_error(err: Value) -> LinkError {
    match err {
        Value::Object(ref obj) => LinkError::Rpc {
            code: obj.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string()),
        },
        Value::String(message) => LinkError::Rpc { code: 0, message },
        other => LinkError::Rpc {
            code: 0,
            message: other.to_string(),
        },
    }
}

/// Decode the parameters of a `blockchain.address.subscribe` notification:
/// `[address, status]` where status is a hash string or null.
pub fn address_notification(params: &[Value]) -> Result<AddressNotification, LinkError> {
    let address = params
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| LinkError::Protocol("address notification without address".into()))?;
    let status = params.get(1).and_then(Value::as_str).map(str::to_string);
    Ok(AddressNotification {
        address: address.to_string(),
        status,
    })
}
