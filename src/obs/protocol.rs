//! obs-websocket v5 framing
//!
//! Op codes, handshake message shapes, the authentication challenge, and the
//! event-subscription mask. The protocol is built into OBS Studio 28+ and
//! listens on ws://{host}:{port} (default port 4455).

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Result, SyncError};

/// obs-websocket op codes
pub mod op {
    pub const HELLO: u64 = 0;
    pub const IDENTIFY: u64 = 1;
    pub const IDENTIFIED: u64 = 2;
    pub const EVENT: u64 = 5;
    pub const REQUEST: u64 = 6;
    pub const REQUEST_RESPONSE: u64 = 7;
}

/// EventSubscription bits (obs-websocket `EventSubscription` enum)
pub mod subscription {
    pub const SCENES: u64 = 1 << 2;
    pub const INPUTS: u64 = 1 << 3;
    pub const FILTERS: u64 = 1 << 5;
    pub const SCENE_ITEMS: u64 = 1 << 7;
}

/// Everything the sync engine listens for: scene switches, scene-item
/// transforms, input settings, and filter settings.
pub fn event_subscriptions() -> u64 {
    subscription::SCENES | subscription::INPUTS | subscription::FILTERS | subscription::SCENE_ITEMS
}

/// Close code OBS uses to reject bad credentials
pub const CLOSE_AUTH_FAILED: u16 = 4009;

/// Envelope of every obs-websocket frame
#[derive(Debug, Deserialize)]
pub struct ServerMessage {
    pub op: u64,
    pub d: Value,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::protocol(format!("bad obs-websocket frame: {e}")))
    }
}

/// Hello (op 0) payload
#[derive(Debug, Deserialize)]
pub struct Hello {
    #[serde(rename = "obsWebSocketVersion")]
    pub obs_websocket_version: String,
    pub authentication: Option<AuthChallenge>,
}

#[derive(Debug, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

/// Identified (op 2) payload
#[derive(Debug, Deserialize)]
pub struct Identified {
    #[serde(rename = "negotiatedRpcVersion")]
    pub negotiated_rpc_version: u64,
}

/// Status block of a request response
#[derive(Debug, Deserialize)]
pub struct RequestStatus {
    pub result: bool,
    pub code: u64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Derive the auth string per the obs-websocket protocol:
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn auth_response(password: &str, challenge: &str, salt: &str) -> String {
    use sha2::{Digest, Sha256};

    let secret = Sha256::digest(format!("{password}{salt}").as_bytes());
    let secret_b64 = base64::engine::general_purpose::STANDARD.encode(secret);

    let auth = Sha256::digest(format!("{secret_b64}{challenge}").as_bytes());
    base64::engine::general_purpose::STANDARD.encode(auth)
}

/// Build the Identify (op 1) frame
pub fn identify_frame(authentication: Option<String>) -> String {
    let mut d = json!({
        "rpcVersion": 1,
        "eventSubscriptions": event_subscriptions(),
    });
    if let Some(auth) = authentication {
        d["authentication"] = Value::String(auth);
    }
    json!({ "op": op::IDENTIFY, "d": d }).to_string()
}

/// Build a Request (op 6) frame
pub fn request_frame(request_id: &str, request_type: &str, request_data: Option<&Value>) -> String {
    let mut d = json!({
        "requestType": request_type,
        "requestId": request_id,
    });
    if let Some(data) = request_data {
        d["requestData"] = data.clone();
    }
    json!({ "op": op::REQUEST, "d": d }).to_string()
}

/// Check a response's `requestStatus` block, surfacing OBS's comment on
/// failure
pub fn check_request_status(request_type: &str, response: &Value) -> Result<()> {
    let Some(status) = response.get("requestStatus") else {
        return Err(SyncError::protocol(format!(
            "{request_type}: response without requestStatus"
        )));
    };
    let status: RequestStatus = serde_json::from_value(status.clone())
        .map_err(|e| SyncError::protocol(format!("{request_type}: bad requestStatus: {e}")))?;

    if !status.result {
        let detail = status
            .comment
            .unwrap_or_else(|| format!("error code {}", status.code));
        return Err(SyncError::apply(format!("{request_type}: {detail}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_response_is_deterministic_base64() {
        let auth = auth_response(
            "supersecretpassword",
            "ztTBnnuqrqaKDzRM3xcVdbYm",
            "PZVbYpvAnZut2SS6JNJytDm9",
        );

        // SHA256 -> 32 bytes -> 44 chars of standard Base64
        assert_eq!(auth.len(), 44);
        assert!(base64::engine::general_purpose::STANDARD
            .decode(&auth)
            .is_ok());
        assert_eq!(
            auth,
            auth_response(
                "supersecretpassword",
                "ztTBnnuqrqaKDzRM3xcVdbYm",
                "PZVbYpvAnZut2SS6JNJytDm9",
            )
        );
    }

    #[test]
    fn test_event_subscription_mask() {
        // Scenes | Inputs | Filters | SceneItems
        assert_eq!(event_subscriptions(), 4 + 8 + 32 + 128);
    }

    #[test]
    fn test_identify_frame_shape() {
        let frame = identify_frame(Some("authstring".into()));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["op"], op::IDENTIFY);
        assert_eq!(value["d"]["rpcVersion"], 1);
        assert_eq!(value["d"]["authentication"], "authstring");

        let frame = identify_frame(None);
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert!(value["d"].get("authentication").is_none());
    }

    #[test]
    fn test_check_request_status() {
        let ok = serde_json::json!({ "requestStatus": { "result": true, "code": 100 } });
        assert!(check_request_status("GetVersion", &ok).is_ok());

        let failed = serde_json::json!({
            "requestStatus": { "result": false, "code": 600, "comment": "No source was found" }
        });
        let err = check_request_status("GetSceneItemId", &failed).unwrap_err();
        assert!(err.to_string().contains("No source was found"));

        let missing = serde_json::json!({ "responseData": {} });
        assert!(check_request_status("GetVersion", &missing).is_err());
    }
}
