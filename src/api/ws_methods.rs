use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::indexer::build_tree;
use crate::session::Session;

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// Incoming request envelope.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Action name (e.g. "reqClientId").
    #[serde(default)]
    pub action: String,
    /// Action parameters. Required, even when empty.
    pub payload: Option<Map<String, Value>>,
}

/// Outgoing response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub action: String,
    pub success: bool,
    pub payload: Value,
}

impl Response {
    /// Build a successful response.
    pub fn success(action: &str, payload: Value) -> Self {
        Self {
            action: action.to_owned(),
            success: true,
            payload,
        }
    }

    /// Build a failed response carrying a human-readable reason.
    pub fn failure(action: &str, reason: impl Into<String>) -> Self {
        Self {
            action: action.to_owned(),
            success: false,
            payload: json!({ "reason": reason.into() }),
        }
    }
}

// ---------------------------------------------------------------------------
// Action names
// ---------------------------------------------------------------------------

pub const REQ_CLIENT_ID: &str = "reqClientId";
pub const REQ_PREVIEW_URL: &str = "reqPreviewUrl";
pub const REQ_START_HUGO: &str = "reqStartHugo";
pub const REQ_STOP_HUGO: &str = "reqStopHugo";
pub const REQ_ALL_FILES: &str = "reqAllFiles";

pub const RES_CLIENT_ID: &str = "resClientId";
pub const RES_PREVIEW_URL: &str = "resPreviewUrl";
pub const RES_START_HUGO: &str = "resStartHugo";
pub const RES_STOP_HUGO: &str = "resStopHugo";
pub const RES_ALL_FILES: &str = "resAllFiles";

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Parse one inbound frame and run it against `session`.
///
/// Returns `None` when nothing should be sent back: malformed frames,
/// envelopes missing `action` or `payload`, and unknown actions. None of
/// these close the connection.
pub async fn dispatch(raw: &[u8], session: &Session) -> Option<Response> {
    let request: Request = match serde_json::from_slice(raw) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(id = %session.id, error = %e, "ignoring malformed frame");
            return None;
        }
    };
    if request.action.is_empty() || request.payload.is_none() {
        tracing::warn!(id = %session.id, action = %request.action, "ignoring request without action or payload");
        return None;
    }

    tracing::debug!(id = %session.id, action = %request.action, "dispatching request");
    match request.action.as_str() {
        REQ_CLIENT_ID => Some(Response::success(RES_CLIENT_ID, json!({ "id": session.id }))),
        REQ_PREVIEW_URL => Some(Response::success(
            RES_PREVIEW_URL,
            json!({ "previewUrl": session.preview_url }),
        )),
        REQ_START_HUGO => {
            // Reply right away; the process comes up in the background.
            if !session.preview.is_running() {
                session.preview.start();
            }
            Some(Response::success(
                RES_START_HUGO,
                json!({ "previewUrl": session.preview_url }),
            ))
        }
        REQ_STOP_HUGO => {
            session.preview.stop();
            Some(Response::success(RES_STOP_HUGO, json!({})))
        }
        REQ_ALL_FILES => Some(all_files(session).await),
        other => {
            tracing::info!(id = %session.id, action = other, "unknown action");
            None
        }
    }
}

async fn all_files(session: &Session) -> Response {
    let root = session.content_root.clone();
    let tree = match tokio::task::spawn_blocking(move || build_tree(&root)).await {
        Ok(Ok(tree)) => tree,
        Ok(Err(e)) => {
            tracing::warn!(id = %session.id, error = %e, "file listing failed");
            return Response::failure(RES_ALL_FILES, e.to_string());
        }
        Err(e) => {
            tracing::error!(id = %session.id, error = %e, "file listing task panicked");
            return Response::failure(RES_ALL_FILES, "file listing failed");
        }
    };
    match serde_json::to_value(&tree) {
        Ok(files) => Response::success(RES_ALL_FILES, json!({ "files": files })),
        Err(e) => {
            tracing::warn!(id = %session.id, error = %e, "file listing is not representable as JSON");
            Response::failure(RES_ALL_FILES, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::preview::PreviewCommand;
    use crate::registry::{ConnectionRegistry, RegistryOptions};
    use crate::session::{outbox, OutboxReceiver, OUTBOX_CAPACITY};
    use std::time::Duration;

    // -- Envelope serde tests ------------------------------------------------

    #[test]
    fn deserialize_request() {
        let req: Request =
            serde_json::from_str(r#"{"action":"reqClientId","payload":{}}"#).unwrap();
        assert_eq!(req.action, "reqClientId");
        assert!(req.payload.unwrap().is_empty());
    }

    #[test]
    fn deserialize_request_without_payload() {
        let req: Request = serde_json::from_str(r#"{"action":"reqClientId"}"#).unwrap();
        assert!(req.payload.is_none());
    }

    #[test]
    fn serialize_success_response() {
        let resp = Response::success(RES_CLIENT_ID, json!({ "id": "2000" }));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            json!({ "action": "resClientId", "success": true, "payload": { "id": "2000" } })
        );
    }

    #[test]
    fn response_survives_encoding() {
        let resp = Response::success(RES_PREVIEW_URL, json!({ "previewUrl": "http://p/2000/preview/" }));
        let decoded: Response = serde_json::from_str(&serde_json::to_string(&resp).unwrap()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn serialize_failure_response() {
        let resp = Response::failure(RES_ALL_FILES, "cannot stat /nope");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["payload"]["reason"], "cannot stat /nope");
    }

    // -- Dispatch tests ------------------------------------------------------

    struct Fixture {
        session: Session,
        _rx: OutboxReceiver,
        _content: tempfile::TempDir,
    }

    async fn create_test_session(command: PreviewCommand) -> Fixture {
        let content = tempfile::tempdir().unwrap();
        std::fs::write(content.path().join("index.md"), "# hi").unwrap();

        let mut settings = Settings::for_base_url("http://preview.test/");
        settings.content_root = content.path().to_path_buf();
        settings.preview_source = content.path().to_path_buf();
        settings.preview_command = command;

        let registry = ConnectionRegistry::spawn(RegistryOptions::new("http://preview.test/"));
        let (tx, rx) = outbox(OUTBOX_CAPACITY);
        let admission = registry.admit(tx.clone()).await.unwrap();
        Fixture {
            session: Session::new(admission, tx, registry, &settings),
            _rx: rx,
            _content: content,
        }
    }

    fn sleeper() -> PreviewCommand {
        PreviewCommand {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
        }
    }

    #[tokio::test]
    async fn dispatch_client_id() {
        let f = create_test_session(sleeper()).await;
        let resp = dispatch(br#"{"action":"reqClientId","payload":{}}"#, &f.session)
            .await
            .unwrap();
        assert_eq!(resp.action, "resClientId");
        assert!(resp.success);
        assert_eq!(resp.payload, json!({ "id": f.session.id }));
    }

    #[tokio::test]
    async fn dispatch_preview_url() {
        let f = create_test_session(sleeper()).await;
        let resp = dispatch(br#"{"action":"reqPreviewUrl","payload":{}}"#, &f.session)
            .await
            .unwrap();
        assert_eq!(resp.action, "resPreviewUrl");
        assert_eq!(
            resp.payload["previewUrl"],
            format!("http://preview.test/{}/preview/", f.session.id)
        );
    }

    #[tokio::test]
    async fn dispatch_malformed_frame() {
        let f = create_test_session(sleeper()).await;
        assert!(dispatch(b"not-json", &f.session).await.is_none());
    }

    #[tokio::test]
    async fn dispatch_missing_fields() {
        let f = create_test_session(sleeper()).await;
        assert!(dispatch(br#"{"action":"reqClientId"}"#, &f.session).await.is_none());
        assert!(dispatch(br#"{"action":"reqClientId","payload":null}"#, &f.session).await.is_none());
        assert!(dispatch(br#"{"action":"","payload":{}}"#, &f.session).await.is_none());
        assert!(dispatch(br#"{"payload":{}}"#, &f.session).await.is_none());
        assert!(dispatch(br#"{"action":"reqClientId","payload":[]}"#, &f.session).await.is_none());
    }

    #[tokio::test]
    async fn dispatch_unknown_action() {
        let f = create_test_session(sleeper()).await;
        assert!(dispatch(br#"{"action":"reqNothing","payload":{}}"#, &f.session).await.is_none());
    }

    #[tokio::test]
    async fn dispatch_start_and_stop() {
        let f = create_test_session(sleeper()).await;
        let first = dispatch(br#"{"action":"reqStartHugo","payload":{}}"#, &f.session)
            .await
            .unwrap();
        let second = dispatch(br#"{"action":"reqStartHugo","payload":{}}"#, &f.session)
            .await
            .unwrap();
        assert_eq!(first.action, "resStartHugo");
        assert_eq!(first.payload, second.payload);
        assert!(f.session.preview.is_running());

        let stop = dispatch(br#"{"action":"reqStopHugo","payload":{}}"#, &f.session)
            .await
            .unwrap();
        assert_eq!(stop.action, "resStopHugo");
        assert_eq!(stop.payload, json!({}));
        assert!(!f.session.preview.is_running());

        // Stopping again still answers.
        let again = dispatch(br#"{"action":"reqStopHugo","payload":{}}"#, &f.session)
            .await
            .unwrap();
        assert!(again.success);
        tokio::time::timeout(Duration::from_secs(5), f.session.preview.wait_stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispatch_all_files() {
        let f = create_test_session(sleeper()).await;
        let resp = dispatch(br#"{"action":"reqAllFiles","payload":{}}"#, &f.session)
            .await
            .unwrap();
        assert_eq!(resp.action, "resAllFiles");
        assert!(resp.success);
        let files = &resp.payload["files"];
        assert_eq!(files["IsDir"], true);
        assert_eq!(files["Children"][0]["Name"], "index.md");
    }

    #[tokio::test]
    async fn dispatch_all_files_missing_root() {
        let mut f = create_test_session(sleeper()).await;
        f.session.content_root = "/nonexistent/content".into();
        let resp = dispatch(br#"{"action":"reqAllFiles","payload":{}}"#, &f.session)
            .await
            .unwrap();
        assert_eq!(resp.action, "resAllFiles");
        assert!(!resp.success);
        assert!(resp.payload["reason"].as_str().unwrap().contains("/nonexistent/content"));
    }
}
