use std::future::Future;
use std::pin::Pin;
use std::process::ExitStatus;
use std::time::Duration;

use reqwest::Client;
use tokio::time::{Instant, sleep};
use tracing::debug;

use super::SupervisorError;
use crate::config::ReadinessPolicy;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// A single readiness check against the server.
pub trait ReadinessProbe {
    fn probe<'a>(&'a self) -> ProbeFuture<'a>;
}

/// `GET /v1/models`, ready on any 2xx.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpProbe {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self, SupervisorError> {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(SupervisorError::ProbeClient)?;
        Ok(Self {
            client,
            url: format!("{}/v1/models", base_url.trim_end_matches('/')),
            api_key: api_key.map(str::to_string),
        })
    }
}

impl ReadinessProbe for HttpProbe {
    fn probe<'a>(&'a self) -> ProbeFuture<'a> {
        Box::pin(async move {
            let mut request = self.client.get(&self.url);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            match request.send().await {
                Ok(response) => response.status().is_success(),
                Err(err) => {
                    debug!(url = %self.url, error = %err, "readiness probe failed");
                    false
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    Exited(Option<ExitStatus>),
}

/// Polls `probe` every `policy.interval` until it succeeds, the child exits,
/// or `policy.timeout` has elapsed.
pub async fn wait_until_ready<P>(
    probe: &P,
    mut child_state: impl FnMut() -> ChildState,
    policy: &ReadinessPolicy,
) -> Result<(), SupervisorError>
where
    P: ReadinessProbe + ?Sized,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if probe.probe().await {
            debug!(
                attempts,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "server is ready"
            );
            return Ok(());
        }

        if let ChildState::Exited(status) = child_state() {
            return Err(SupervisorError::ProcessExited { status });
        }

        if started.elapsed() >= policy.timeout {
            return Err(SupervisorError::ReadinessTimeout {
                timeout: policy.timeout,
            });
        }

        sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{ChildState, ProbeFuture, ReadinessProbe, wait_until_ready};
    use crate::config::ReadinessPolicy;
    use crate::supervisor::SupervisorError;

    struct StubProbe {
        calls: AtomicU32,
        ready_on: Option<u32>,
    }

    impl StubProbe {
        fn never() -> Self {
            Self {
                calls: AtomicU32::new(0),
                ready_on: None,
            }
        }

        fn ready_on(call: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                ready_on: Some(call),
            }
        }
    }

    impl ReadinessProbe for StubProbe {
        fn probe<'a>(&'a self) -> ProbeFuture<'a> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let ready = self.ready_on.is_some_and(|target| call >= target);
            Box::pin(async move { ready })
        }
    }

    fn policy(interval_ms: u64, timeout_secs: u64) -> ReadinessPolicy {
        ReadinessPolicy {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_times_out_only_after_the_timeout() {
        let probe = StubProbe::never();
        let started = Instant::now();

        let err = wait_until_ready(&probe, || ChildState::Running, &policy(1000, 5))
            .await
            .expect_err("stub never becomes ready");

        assert!(
            matches!(err, SupervisorError::ReadinessTimeout { timeout } if timeout == Duration::from_secs(5)),
            "unexpected error: {err}"
        );
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(7));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_the_server_answers() {
        let probe = StubProbe::ready_on(3);
        let started = Instant::now();

        wait_until_ready(&probe, || ChildState::Running, &policy(1000, 60))
            .await
            .expect("third probe succeeds");

        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exited_child_fails_fast() {
        let probe = StubProbe::never();
        let started = Instant::now();
        let mut checks = 0;

        let err = wait_until_ready(
            &probe,
            || {
                checks += 1;
                if checks >= 2 {
                    ChildState::Exited(Some(ExitStatus::from_raw(3 << 8)))
                } else {
                    ChildState::Running
                }
            },
            &policy(1000, 60),
        )
        .await
        .expect_err("child exit should abort the wait");

        match err {
            SupervisorError::ProcessExited { status } => {
                assert_eq!(status.and_then(|s| s.code()), Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
