mod http;
mod kv;

pub use self::http::{
    CancelHandle, CancelToken, HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse,
    HttpResult, HttpShell, ValidatedUrl, DEFAULT_TIMEOUT_MS, IDEMPOTENCY_KEY_HEADER,
    MAX_TIMEOUT_MS,
};
pub use self::kv::{KeyNamespace, KvBackend, KvError, KvKey, MemoryKv, StorageErrorCode, TypedSlot};

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKv;

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One canned answer for [`ScriptedShell`].
    #[derive(Debug, Clone)]
    pub enum Reply {
        Json(u16, serde_json::Value),
        Raw(u16, Vec<u8>),
        Fail(HttpError),
        /// Never completes; only a timeout or cancel ends the call.
        Hang,
    }

    impl Reply {
        pub fn ok(message: &str) -> Self {
            Reply::Json(200, serde_json::json!({ "success": true, "message": message }))
        }

        pub fn ok_data(data: serde_json::Value) -> Self {
            Reply::Json(200, serde_json::json!({ "success": true, "data": data }))
        }

        pub fn rejected(message: &str) -> Self {
            Reply::Json(200, serde_json::json!({ "success": false, "message": message }))
        }

        pub fn offline() -> Self {
            Reply::Fail(HttpError::ConnectionError {
                host: "192.168.1.100".to_string(),
                message: "network unreachable".to_string(),
            })
        }
    }

    /// Plays back replies in order and records every request it saw.
    /// Falls back to an offline failure once the script runs out.
    #[derive(Debug, Default)]
    pub struct ScriptedShell {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedShell {
        pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn push(&self, reply: Reply) {
            if let Ok(mut replies) = self.replies.lock() {
                replies.push_back(reply);
            }
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().map(|r| r.clone()).unwrap_or_default()
        }

        pub fn paths(&self) -> Vec<String> {
            self.requests()
                .iter()
                .map(|r| r.url().path().to_string())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl HttpShell for ScriptedShell {
        async fn execute(&self, request: HttpRequest) -> HttpResult {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            let reply = self
                .replies
                .lock()
                .ok()
                .and_then(|mut r| r.pop_front())
                .unwrap_or_else(Reply::offline);

            match reply {
                Reply::Json(status, value) => Ok(HttpResponse::json_body(status, &value)),
                Reply::Raw(status, body) => Ok(HttpResponse::new(status, HttpHeaders::new(), body)),
                Reply::Fail(err) => Err(err),
                Reply::Hang => {
                    std::future::pending::<()>().await;
                    Err(HttpError::Cancelled {
                        request_id: request.request_id().to_string(),
                    })
                }
            }
        }
    }
}
