use std::error::Error as StdError;
use std::io::ErrorKind;

use super::TransportError;

/// Walks the source chain looking for an io error of `kind` or a message
/// containing `needle` (hyper does not always expose the io error).
fn error_chain_matches(err: &(dyn StdError + 'static), kind: ErrorKind, needle: &str) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(source) = current {
        let io_match = source
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io_err| io_err.kind() == kind);
        if io_match || source.to_string().to_ascii_lowercase().contains(needle) {
            return true;
        }
        current = source.source();
    }
    false
}

fn error_chain_has_connection_refused(err: &(dyn StdError + 'static)) -> bool {
    error_chain_matches(err, ErrorKind::ConnectionRefused, "connection refused")
}

fn error_chain_has_timeout(err: &(dyn StdError + 'static)) -> bool {
    error_chain_matches(err, ErrorKind::TimedOut, "timed out")
}

pub(crate) fn chat_request_error(
    err: reqwest::Error,
    api_url: &str,
    timeout_secs: u64,
) -> TransportError {
    let message = if err.is_timeout() || error_chain_has_timeout(&err) {
        format!(
            "Chat request timed out after {timeout_secs}s while calling '{api_url}'. \
             Increase MODEL_TIMEOUT_SECS or check llamafile responsiveness."
        )
    } else if err.is_connect() && error_chain_has_connection_refused(&err) {
        format!(
            "Connection refused by llamafile at '{api_url}'. \
             Ensure the server is running and LLAMAFILE_HOST/LLAMAFILE_PORT are correct."
        )
    } else if err.is_connect() {
        format!(
            "Failed to connect to llamafile at '{api_url}'. \
             Check LLAMAFILE_HOST/LLAMAFILE_PORT and network connectivity."
        )
    } else {
        format!("Failed to call llamafile at '{api_url}'")
    };

    TransportError::Request {
        message,
        source: err,
    }
}

#[cfg(test)]
mod tests {
    use super::{chat_request_error, error_chain_has_timeout};
    use reqwest::Client;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn free_local_addr() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind should succeed");
        let addr = listener.local_addr().expect("address should be available");
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn maps_connection_refused_errors_to_actionable_message() {
        let addr = free_local_addr();
        let api_url = format!("http://{}/v1/chat/completions", addr);
        let client = Client::builder()
            .timeout(Duration::from_millis(300))
            .build()
            .expect("client should build");

        let req_err = client
            .post(&api_url)
            .send()
            .await
            .expect_err("request should fail with connection-refused");
        let mapped = chat_request_error(req_err, &api_url, 1);
        let msg = mapped.to_string();

        assert!(
            msg.contains("Connection refused by llamafile"),
            "unexpected message: {msg}"
        );
        assert!(msg.contains("LLAMAFILE_PORT"), "unexpected message: {msg}");
    }

    #[tokio::test]
    async fn maps_timeout_errors_to_actionable_message() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind should succeed");
        let addr = listener.local_addr().expect("address should be available");
        let server = thread::spawn(move || {
            let (_stream, _) = listener.accept().expect("accept should succeed");
            thread::sleep(Duration::from_secs(1));
        });

        let api_url = format!("http://{}/v1/chat/completions", addr);
        let client = Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("client should build");

        let req_err = client
            .post(&api_url)
            .send()
            .await
            .expect_err("request should fail with timeout");
        let mapped = chat_request_error(req_err, &api_url, 2);
        let msg = mapped.to_string();

        assert!(
            msg.contains("Chat request timed out after 2s"),
            "unexpected message: {msg}"
        );
        assert!(
            msg.contains("MODEL_TIMEOUT_SECS"),
            "unexpected message: {msg}"
        );

        server.join().expect("server thread should join");
    }

    #[test]
    fn detects_timeout_from_error_kind() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert!(error_chain_has_timeout(&err));
    }
}
