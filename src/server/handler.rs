use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::protocol::RpcFault;
use crate::Delivery;

/// Type-erased async request handler.
///
/// Takes the raw delivery and settles with either the result value or a
/// transmissible fault — never a panic or an unwound error; the consume loop
/// relies on every outcome being an explicit two-case result.
///
/// Wrapped in Arc for cheap cloning into the consume task.
pub(super) type BoxedHandler = Arc<
    dyn Fn(Delivery) -> Pin<Box<dyn Future<Output = std::result::Result<Value, RpcFault>> + Send>>
        + Send
        + Sync,
>;

/// Wrap a typed application callback into a type-erased handler.
///
/// The wrapper parses the request body as `Req`, invokes the callback with
/// the parsed value and the raw delivery, and serializes the response.
/// Every failure on that path — parse error, callback error, response
/// serialization error — becomes a fault destined for an `{err}` reply.
pub(super) fn wrap_handler<F, Fut, Req, Resp>(callback: F) -> BoxedHandler
where
    F: Fn(Req, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    // ---
    Arc::new(move |delivery: Delivery| {
        // ---
        let request: Result<Req, serde_json::Error> = serde_json::from_slice(&delivery.payload);

        let fut: Pin<Box<dyn Future<Output = std::result::Result<Value, RpcFault>> + Send>> =
            match request {
                Ok(request) => {
                    let fut = callback(request, delivery);
                    Box::pin(async move {
                        // ---
                        match fut.await {
                            Ok(response) => serde_json::to_value(response).map_err(|err| {
                                RpcFault::new(format!("reply serialization failed: {err}"))
                            }),
                            Err(err) => Err(RpcFault::from_error(&err, true)),
                        }
                    })
                }
                Err(err) => {
                    let fault = RpcFault::new(format!("request parse failed: {err}"));
                    Box::pin(async move { Err(fault) })
                }
            };

        fut
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Error, MessageProperties};
    use bytes::Bytes;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Incr {
        a: i64,
    }

    #[derive(Debug, Serialize)]
    struct Done {
        a: i64,
    }

    fn delivery(body: &str) -> Delivery {
        Delivery {
            payload: Bytes::copy_from_slice(body.as_bytes()),
            properties: MessageProperties::default(),
            delivery_tag: 1,
        }
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        // ---
        let handler = wrap_handler(|req: Incr, _raw| async move { Ok(Done { a: req.a + 1 }) });

        let value = handler(delivery(r#"{"a": 1}"#)).await.unwrap();
        assert_eq!(value, json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_callback_error_becomes_fault() {
        // ---
        let handler = wrap_handler(|_req: Incr, _raw| async move {
            Err::<Done, _>(Error::Remote(RpcFault::new("B is not set")))
        });

        let fault = handler(delivery(r#"{"a": 1}"#)).await.unwrap_err();
        assert_eq!(fault.message, "B is not set");
    }

    #[tokio::test]
    async fn test_parse_failure_becomes_fault() {
        // ---
        let handler = wrap_handler(|req: Incr, _raw| async move { Ok(Done { a: req.a }) });

        let fault = handler(delivery("not json")).await.unwrap_err();
        assert!(fault.message.contains("request parse failed"));
    }
}
