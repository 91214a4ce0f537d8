use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Standard and application error codes.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const SERVER_NOT_INITIALIZED: i32 = -32002;
    pub const REQUEST_CANCELLED: i32 = -32800;
}

/// Opaque request id. Numbers and strings are both valid and are never reinterpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    /// Ids above `i64::MAX`; smaller numbers always decode as [`RequestId::Number`].
    Unsigned(u64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Unsigned(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(n), _) => Some(RequestId::Number(n)),
                (None, Some(n)) => Some(RequestId::Unsigned(n)),
                // Fractional and negative-overflow ids are not valid request ids.
                (None, None) => None,
            },
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::from(*n),
            RequestId::Unsigned(n) => Value::from(*n),
            RequestId::String(s) => Value::from(s.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl ResponseError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    pub fn server_not_initialized() -> Self {
        Self::new(codes::SERVER_NOT_INITIALIZED, "server must be initialized")
    }

    pub fn request_cancelled() -> Self {
        Self::new(codes::REQUEST_CANCELLED, "request cancelled")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// A response. `id` is `None` only for errors about messages whose id could not be read.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub result: Result<Value, ResponseError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("invalid message: {0}")]
    Shape(String),
}

impl DecodeError {
    /// The error to send back to the peer for an undecodable message.
    pub fn to_response_error(&self) -> ResponseError {
        match self {
            DecodeError::Json(message) => ResponseError::parse_error(message.clone()),
            DecodeError::Shape(message) => ResponseError::invalid_request(message.clone()),
        }
    }
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Result<Value, ResponseError>) -> Self {
        Message::Response(Response {
            id: Some(id),
            result,
        })
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(not) => Some(&not.method),
            Message::Response(_) => None,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|err| DecodeError::Json(err.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::Shape("message is not an object".into()));
        };

        let params = obj.remove("params").unwrap_or(Value::Null);
        let id = obj.remove("id");

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(DecodeError::Shape("`method` must be a string".into()));
            };
            return match id {
                None | Some(Value::Null) => Ok(Message::Notification(Notification { method, params })),
                Some(id) => {
                    let id = RequestId::from_value(&id)
                        .ok_or_else(|| DecodeError::Shape(format!("invalid request id {id}")))?;
                    Ok(Message::Request(Request { id, method, params }))
                }
            };
        }

        let id = match id {
            None | Some(Value::Null) => None,
            Some(id) => Some(
                RequestId::from_value(&id)
                    .ok_or_else(|| DecodeError::Shape(format!("invalid response id {id}")))?,
            ),
        };

        let result = match (obj.remove("result"), obj.remove("error")) {
            (_, Some(error)) if !error.is_null() => {
                let error: ResponseError = serde_json::from_value(error)
                    .map_err(|err| DecodeError::Shape(format!("invalid error object: {err}")))?;
                Err(error)
            }
            (Some(result), _) => Ok(result),
            (None, _) => {
                return Err(DecodeError::Shape(
                    "response carries neither `result` nor `error`".into(),
                ))
            }
        };

        Ok(Message::Response(Response { id, result }))
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), json!("2.0"));
        match self {
            Message::Request(req) => {
                obj.insert("id".into(), req.id.to_value());
                obj.insert("method".into(), Value::from(req.method.as_str()));
                if !req.params.is_null() {
                    obj.insert("params".into(), req.params.clone());
                }
            }
            Message::Notification(not) => {
                obj.insert("method".into(), Value::from(not.method.as_str()));
                if !not.params.is_null() {
                    obj.insert("params".into(), not.params.clone());
                }
            }
            Message::Response(resp) => {
                obj.insert(
                    "id".into(),
                    resp.id.as_ref().map(RequestId::to_value).unwrap_or(Value::Null),
                );
                match &resp.result {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        obj.insert("error".into(), json!(error));
                    }
                }
            }
        }
        Value::Object(obj)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_value())
    }
}
