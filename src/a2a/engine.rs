//! JSON-RPC dispatch engine for A2A server bridges.
//!
//! Incoming transport messages route directly into the engine, bypassing any
//! HTTP stack: parse, validate, dispatch by method to the user-supplied
//! [`A2aRequestHandler`], and serialize the response. Handler failures become
//! JSON-RPC error responses; they never crash the receive loop.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::*;
use crate::error::Result;
use crate::message::Message as TransportMessage;

/// The server-side agent implementation supplied by the user.
///
/// `on_message_stream` receives a bounded event sender; events are forwarded
/// to the client in the order they are sent and the sender exerts
/// backpressure when the transport cannot keep up.
#[async_trait]
pub trait A2aRequestHandler: Send + Sync {
    async fn on_message_send(
        &self,
        params: MessageSendParams,
    ) -> std::result::Result<SendMessageResponse, JsonRpcError>;

    async fn on_message_stream(
        &self,
        params: MessageSendParams,
        events: mpsc::Sender<StreamEvent>,
    ) -> std::result::Result<(), JsonRpcError> {
        // Default: degrade to unary and emit the response as one event.
        let response = self.on_message_send(params).await?;
        let event = match response {
            SendMessageResponse::Message(message) => StreamEvent::Message(message),
            SendMessageResponse::Task(task) => StreamEvent::StatusUpdate(TaskStatusUpdateEvent {
                id: task.id.clone(),
                status: task.status,
                is_final: true,
            }),
        };
        events
            .send(event)
            .await
            .map_err(|_| JsonRpcError::internal_error("event stream closed"))?;
        Ok(())
    }

    async fn on_tasks_get(
        &self,
        params: TaskQueryParams,
    ) -> std::result::Result<Task, JsonRpcError> {
        Err(JsonRpcError {
            code: TASK_NOT_FOUND,
            message: format!("Task not found: {}", params.id),
            data: None,
        })
    }

    async fn on_tasks_cancel(
        &self,
        params: TaskQueryParams,
    ) -> std::result::Result<Task, JsonRpcError> {
        Err(JsonRpcError {
            code: TASK_NOT_CANCELABLE,
            message: format!("Task not cancelable: {}", params.id),
            data: None,
        })
    }
}

/// Pluggable credential check for inbound requests.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, bearer_token: &str) -> Result<()>;
}

/// Whether the environment asks for identity-based access control.
pub fn identity_auth_enabled() -> bool {
    std::env::var("IDENTITY_AUTH_ENABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// API key for the external identity service, when configured.
pub fn identity_service_api_key() -> Option<String> {
    std::env::var("IDENTITY_SERVICE_API_KEY").ok()
}

/// Dispatches JSON-RPC payloads to an [`A2aRequestHandler`].
pub struct JsonRpcDispatcher {
    handler: Arc<dyn A2aRequestHandler>,
    verifier: Option<Arc<dyn IdentityVerifier>>,
}

impl JsonRpcDispatcher {
    pub fn new(handler: Arc<dyn A2aRequestHandler>) -> Self {
        Self {
            handler,
            verifier: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Handle one inbound transport message and produce the response
    /// envelope.
    pub async fn handle_message(&self, message: TransportMessage) -> TransportMessage {
        let payload = self.dispatch(&message).await;
        TransportMessage::new("A2AResponse", payload).propagate_routing(&message)
    }

    /// Dispatch raw JSON-RPC bytes, returning serialized response bytes.
    pub async fn dispatch_bytes(
        &self,
        body: &[u8],
        authorization: Option<&str>,
    ) -> Vec<u8> {
        if let Err(error) = self.authorize(authorization).await {
            return error_payload(serde_json::Value::Null, error);
        }

        let body = relay_preserved(body);

        let request: JsonRpcRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                // Distinguish unparseable bytes from a parseable non-request.
                return match serde_json::from_slice::<serde_json::Value>(&body) {
                    Ok(value) => error_payload(
                        value.get("id").cloned().unwrap_or(serde_json::Value::Null),
                        JsonRpcError::invalid_request(e.to_string()),
                    ),
                    Err(e) => error_payload(
                        serde_json::Value::Null,
                        JsonRpcError::parse_error(e.to_string()),
                    ),
                };
            }
        };

        let id = request.id.clone();
        let response = match self.route(request).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        };
        serde_json::to_vec(&response).unwrap_or_default()
    }

    async fn dispatch(&self, message: &TransportMessage) -> Vec<u8> {
        debug!(kind = %message.kind, "dispatching A2A message");
        let authorization = message
            .header("Authorization")
            .or_else(|| message.header("authorization"));
        self.dispatch_bytes(&message.payload, authorization).await
    }

    async fn authorize(&self, authorization: Option<&str>) -> std::result::Result<(), JsonRpcError> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };
        let Some(header) = authorization else {
            return Err(JsonRpcError::internal_error(
                "missing Authorization header",
            ));
        };
        let token = header
            .strip_prefix("Bearer ")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| JsonRpcError::internal_error("malformed Authorization header"))?;
        verifier
            .verify(token)
            .await
            .map_err(|e| JsonRpcError::internal_error(format!("authentication failed: {e}")))
    }

    async fn route(
        &self,
        request: JsonRpcRequest,
    ) -> std::result::Result<serde_json::Value, JsonRpcError> {
        match request.method.as_str() {
            "message/send" => {
                let params: MessageSendParams = parse_params(request.params)?;
                let response = self.handler.on_message_send(params).await?;
                to_value(response)
            }
            "message/stream" => {
                // Transports without native streams drain the events and
                // return the final one.
                let params: MessageSendParams = parse_params(request.params)?;
                let (tx, mut rx) = mpsc::channel::<StreamEvent>(STREAM_EVENT_QUEUE);
                let handler = Arc::clone(&self.handler);
                let producer =
                    tokio::spawn(async move { handler.on_message_stream(params, tx).await });

                let mut last = None;
                while let Some(event) = rx.recv().await {
                    last = Some(event);
                }
                match producer.await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => return Err(error),
                    Err(e) => return Err(JsonRpcError::internal_error(e.to_string())),
                }
                let last = last.ok_or_else(|| {
                    JsonRpcError::internal_error("streaming handler produced no events")
                })?;
                to_value(last)
            }
            "tasks/get" => {
                let params: TaskQueryParams = parse_params(request.params)?;
                to_value(self.handler.on_tasks_get(params).await?)
            }
            "tasks/cancel" => {
                let params: TaskQueryParams = parse_params(request.params)?;
                to_value(self.handler.on_tasks_cancel(params).await?)
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    /// The user handler behind this dispatcher, for bridges that stream.
    pub fn handler(&self) -> Arc<dyn A2aRequestHandler> {
        Arc::clone(&self.handler)
    }
}

const STREAM_EVENT_QUEUE: usize = 64;

fn parse_params<T: serde::de::DeserializeOwned>(
    params: serde_json::Value,
) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn to_value<T: serde::Serialize>(
    value: T,
) -> std::result::Result<serde_json::Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}

fn error_payload(id: serde_json::Value, error: JsonRpcError) -> Vec<u8> {
    serde_json::to_vec(&JsonRpcResponse::failure(id, error)).unwrap_or_default()
}

/// Group-chat relay preservation: when a participant receives another
/// participant's *response* envelope, re-wrap its result message as a fresh
/// `message/send` request so the handler chain continues.
fn relay_preserved(body: &[u8]) -> Vec<u8> {
    let Ok(response) = serde_json::from_slice::<JsonRpcResponse>(body) else {
        return body.to_vec();
    };
    let Some(result) = response.result else {
        return body.to_vec();
    };
    let Ok(message) = serde_json::from_value::<Message>(result) else {
        return body.to_vec();
    };
    debug!("re-wrapping relayed response as message/send");
    let request = JsonRpcRequest::new(
        "message/send",
        serde_json::json!({ "message": message }),
    );
    serde_json::to_vec(&request).unwrap_or_else(|e| {
        warn!(error = %e, "failed to re-wrap relayed message");
        body.to_vec()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl A2aRequestHandler for EchoHandler {
        async fn on_message_send(
            &self,
            params: MessageSendParams,
        ) -> std::result::Result<SendMessageResponse, JsonRpcError> {
            Ok(SendMessageResponse::Message(Message::agent_text(format!(
                "echo: {}",
                params.message.text()
            ))))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl A2aRequestHandler for FailingHandler {
        async fn on_message_send(
            &self,
            _params: MessageSendParams,
        ) -> std::result::Result<SendMessageResponse, JsonRpcError> {
            Err(JsonRpcError::internal_error("boom"))
        }
    }

    fn send_request(text: &str) -> Vec<u8> {
        let request = JsonRpcRequest::new(
            "message/send",
            serde_json::json!({ "message": Message::user_text(text) }),
        );
        serde_json::to_vec(&request).unwrap()
    }

    #[tokio::test]
    async fn dispatches_message_send() {
        let dispatcher = JsonRpcDispatcher::new(Arc::new(EchoHandler));
        let response = dispatcher.dispatch_bytes(&send_request("hi"), None).await;
        let response: JsonRpcResponse = serde_json::from_slice(&response).unwrap();
        let result: SendMessageResponse = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.text(), "echo: hi");
    }

    #[tokio::test]
    async fn handler_error_becomes_jsonrpc_error() {
        let dispatcher = JsonRpcDispatcher::new(Arc::new(FailingHandler));
        let response = dispatcher.dispatch_bytes(&send_request("hi"), None).await;
        let response: JsonRpcResponse = serde_json::from_slice(&response).unwrap();
        assert_eq!(response.error.unwrap().code, INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let dispatcher = JsonRpcDispatcher::new(Arc::new(EchoHandler));
        let request = JsonRpcRequest::new("tasks/unknown", serde_json::Value::Null);
        let response = dispatcher
            .dispatch_bytes(&serde_json::to_vec(&request).unwrap(), None)
            .await;
        let response: JsonRpcResponse = serde_json::from_slice(&response).unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn garbage_is_parse_error() {
        let dispatcher = JsonRpcDispatcher::new(Arc::new(EchoHandler));
        let response = dispatcher.dispatch_bytes(b"{nope", None).await;
        let response: JsonRpcResponse = serde_json::from_slice(&response).unwrap();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn message_stream_returns_final_event() {
        struct StreamingHandler;

        #[async_trait]
        impl A2aRequestHandler for StreamingHandler {
            async fn on_message_send(
                &self,
                _params: MessageSendParams,
            ) -> std::result::Result<SendMessageResponse, JsonRpcError> {
                Err(JsonRpcError::internal_error("unary not supported"))
            }

            async fn on_message_stream(
                &self,
                _params: MessageSendParams,
                events: mpsc::Sender<StreamEvent>,
            ) -> std::result::Result<(), JsonRpcError> {
                for i in 0..3 {
                    events
                        .send(StreamEvent::Message(Message::agent_text(format!(
                            "chunk-{i}"
                        ))))
                        .await
                        .map_err(|_| JsonRpcError::internal_error("closed"))?;
                }
                Ok(())
            }
        }

        let dispatcher = JsonRpcDispatcher::new(Arc::new(StreamingHandler));
        let request = JsonRpcRequest::new(
            "message/stream",
            serde_json::json!({ "message": Message::user_text("go") }),
        );
        let response = dispatcher
            .dispatch_bytes(&serde_json::to_vec(&request).unwrap(), None)
            .await;
        let response: JsonRpcResponse = serde_json::from_slice(&response).unwrap();
        let event: StreamEvent = serde_json::from_value(response.result.unwrap()).unwrap();
        match event {
            StreamEvent::Message(message) => assert_eq!(message.text(), "chunk-2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn relayed_response_is_rewrapped() {
        let dispatcher = JsonRpcDispatcher::new(Arc::new(EchoHandler));
        let relayed = JsonRpcResponse::success(
            serde_json::json!(1),
            serde_json::to_value(Message::agent_text("from-peer")).unwrap(),
        );
        let response = dispatcher
            .dispatch_bytes(&serde_json::to_vec(&relayed).unwrap(), None)
            .await;
        let response: JsonRpcResponse = serde_json::from_slice(&response).unwrap();
        let result: SendMessageResponse = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.text(), "echo: from-peer");
    }
}
