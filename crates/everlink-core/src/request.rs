//! Wire types exchanged with the wallet provider.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConnectorError;
use crate::types::{Address, CorrelationToken, NetworkKey, SubscriptionId};

/// Methods the provider understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestMethod {
    Connect,
    Disconnect,
    CheckConnect,
    SubscribeToBalance,
    UnsubscribeFromBalance,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::CheckConnect => "checkConnect",
            Self::SubscribeToBalance => "subscribeToBalance",
            Self::UnsubscribeFromBalance => "unsubscribeFromBalance",
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to the provider, one variant per method with its own payload.
///
/// Serialized adjacently tagged: `{"method": "...", "params": {...}}`.
/// Parameterless methods omit `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Request {
    Connect {
        network: NetworkKey,
    },
    Disconnect,
    CheckConnect,
    SubscribeToBalance {
        address: Address,
    },
    UnsubscribeFromBalance {
        #[serde(rename = "subscriptionId")]
        subscription_id: SubscriptionId,
    },
}

impl Request {
    pub fn method(&self) -> RequestMethod {
        match self {
            Self::Connect { .. } => RequestMethod::Connect,
            Self::Disconnect => RequestMethod::Disconnect,
            Self::CheckConnect => RequestMethod::CheckConnect,
            Self::SubscribeToBalance { .. } => RequestMethod::SubscribeToBalance,
            Self::UnsubscribeFromBalance { .. } => RequestMethod::UnsubscribeFromBalance,
        }
    }
}

/// A request stamped with its correlation token, as handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(flatten)]
    pub request: Request,
    pub correlation_token: CorrelationToken,
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, ConnectorError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error object returned by the provider in place of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error {}: {}", self.code, self.message)
    }
}

/// A response correlated to an earlier request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub correlation_token: CorrelationToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
}

impl ProviderResponse {
    pub fn ok(token: CorrelationToken, result: Value) -> Self {
        Self {
            correlation_token: token,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(token: CorrelationToken, error: ProviderError) -> Self {
        Self {
            correlation_token: token,
            result: None,
            error: Some(error),
        }
    }

    /// Unwrap the result value or return the provider error.
    pub fn into_result(self) -> Result<Value, ProviderError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// Unsolicited balance update for a provider subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceNotification {
    pub subscription_id: SubscriptionId,
    pub balance: String,
}

/// Anything the provider can send to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Response(ProviderResponse),
    Notification(BalanceNotification),
}

impl InboundMessage {
    pub fn from_json(text: &str) -> Result<Self, ConnectorError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl From<ProviderResponse> for InboundMessage {
    fn from(r: ProviderResponse) -> Self {
        Self::Response(r)
    }
}

impl From<BalanceNotification> for InboundMessage {
    fn from(n: BalanceNotification) -> Self {
        Self::Notification(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_subscribe_shape() {
        let msg = OutboundMessage {
            request: Request::SubscribeToBalance {
                address: Address::new("0xA").unwrap(),
            },
            correlation_token: CorrelationToken(7),
        };
        let val: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            val,
            json!({
                "method": "subscribeToBalance",
                "params": { "address": "0xA" },
                "correlationToken": 7
            })
        );
    }

    #[test]
    fn outbound_disconnect_omits_params() {
        let msg = OutboundMessage {
            request: Request::Disconnect,
            correlation_token: CorrelationToken(3),
        };
        let val = serde_json::to_value(&msg).unwrap();
        assert_eq!(val, json!({ "method": "disconnect", "correlationToken": 3 }));
    }

    #[test]
    fn outbound_parses_back() {
        let text = r#"{"method":"unsubscribeFromBalance","params":{"subscriptionId":"s1"},"correlationToken":9}"#;
        let msg: OutboundMessage = serde_json::from_str(text).unwrap();
        assert_eq!(msg.correlation_token, CorrelationToken(9));
        assert_eq!(msg.request.method(), RequestMethod::UnsubscribeFromBalance);
    }

    #[test]
    fn inbound_distinguishes_response_and_notification() {
        let resp = InboundMessage::from_json(r#"{"correlationToken":1,"result":{"isConnected":false}}"#)
            .unwrap();
        assert!(matches!(resp, InboundMessage::Response(ref r) if r.correlation_token == CorrelationToken(1)));

        let note = InboundMessage::from_json(r#"{"subscriptionId":"s1","balance":"100"}"#).unwrap();
        assert_eq!(
            note,
            InboundMessage::Notification(BalanceNotification {
                subscription_id: "s1".into(),
                balance: "100".into(),
            })
        );

        assert!(InboundMessage::from_json(r#"{"hello":"world"}"#).is_err());
    }

    #[test]
    fn response_into_result() {
        let ok = ProviderResponse::ok(CorrelationToken(1), json!("x"));
        assert_eq!(ok.into_result().unwrap(), json!("x"));

        let missing = ProviderResponse {
            correlation_token: CorrelationToken(2),
            result: None,
            error: None,
        };
        assert_eq!(missing.into_result().unwrap(), Value::Null);

        let err = ProviderResponse::err(
            CorrelationToken(3),
            ProviderError { code: -1, message: "nope".into(), data: None },
        );
        assert_eq!(err.into_result().unwrap_err().code, -1);
    }
}
