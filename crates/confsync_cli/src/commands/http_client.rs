//! Blocking HTTP client backed by `ureq`.

use confsync_client::{HttpClient, HttpError};
use std::io::{self, Read};
use std::time::Duration;

/// Posts JSON bodies with a per-request deadline.
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    /// Creates a client with its own connection pool.
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .user_agent(concat!("confsync/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Default for UreqClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for UreqClient {
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, HttpError> {
        let response = match self
            .agent
            .post(url)
            .timeout(timeout)
            .set("Content-Type", "application/json")
            .send_bytes(&body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                return Err(HttpError::Failed(format!(
                    "{url} returned HTTP {code} {}",
                    response.status_text()
                )));
            }
            Err(ureq::Error::Transport(transport)) => {
                let message = transport.to_string();
                let timed_out = std::error::Error::source(&transport)
                    .and_then(|source| source.downcast_ref::<io::Error>())
                    .is_some_and(is_timeout);
                return Err(if timed_out {
                    HttpError::TimedOut(message)
                } else {
                    HttpError::Failed(message)
                });
            }
        };

        let mut buffer = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut buffer)
            .map_err(|e| {
                let message = format!("failed to read the response body: {e}");
                if is_timeout(&e) {
                    HttpError::TimedOut(message)
                } else {
                    HttpError::Failed(message)
                }
            })?;
        Ok(buffer)
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn unanswered_request_times_out() {
        // Accepts the connection but never replies
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let err = UreqClient::new()
            .post(
                &format!("http://{addr}/config/fetch"),
                b"{}".to_vec(),
                Duration::from_millis(100),
            )
            .unwrap_err();
        assert!(matches!(err, HttpError::TimedOut(_)), "{err:?}");
        holder.join().unwrap();
    }

    #[test]
    fn refused_connection_is_a_failure() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let err = UreqClient::new()
            .post(
                &format!("http://{addr}/config/fetch"),
                b"{}".to_vec(),
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(err, HttpError::Failed(_)), "{err:?}");
    }
}
