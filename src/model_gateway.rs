use std::future::Future;
use std::pin::Pin;

use crate::model::Message;
use crate::transport::{ChatStream, ChatTransport, TransportError};

pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + 'a>>;

/// The chat calls the shell and the file loop depend on. `ChatTransport` is
/// the production implementation; tests substitute canned backends.
pub trait ChatGateway {
    fn stream_chat<'a>(&'a self, messages: &'a [Message]) -> GatewayFuture<'a, ChatStream>;

    /// Non-streamed call returning the raw content of the first choice.
    fn complete_chat<'a>(&'a self, messages: &'a [Message]) -> GatewayFuture<'a, String>;
}

impl ChatGateway for ChatTransport {
    fn stream_chat<'a>(&'a self, messages: &'a [Message]) -> GatewayFuture<'a, ChatStream> {
        Box::pin(self.stream(messages))
    }

    fn complete_chat<'a>(&'a self, messages: &'a [Message]) -> GatewayFuture<'a, String> {
        Box::pin(async move {
            let response = self.complete(messages).await?;
            response
                .first_content()
                .map(str::to_string)
                .ok_or(TransportError::EmptyResponse)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ChatGateway;
    use crate::model::Message;
    use crate::test_support::{closed_port, serve_once, test_config};
    use crate::transport::ChatTransport;

    #[tokio::test]
    async fn complete_chat_returns_first_choice_content() {
        let (port, _requests) = serve_once(
            "200 OK",
            "application/json",
            r#"{"choices":[{"message":{"role":"assistant","content":"first"}},{"message":{"role":"assistant","content":"second"}}]}"#,
        );
        let transport =
            ChatTransport::new(&test_config(port), None).expect("transport should build");

        let content = transport
            .complete_chat(&[Message::user("hi")])
            .await
            .expect("completion should succeed");
        assert_eq!(content, "first");
    }

    #[tokio::test]
    async fn gateway_errors_carry_actionable_message() {
        let transport =
            ChatTransport::new(&test_config(closed_port()), None).expect("transport should build");

        let err = match transport.stream_chat(&[Message::user("ping")]).await {
            Ok(_) => panic!("stream against a closed port should fail"),
            Err(err) => err,
        };
        let msg = err.to_string();
        assert!(
            msg.contains("Connection refused by llamafile"),
            "unexpected error message: {msg}"
        );
    }
}
