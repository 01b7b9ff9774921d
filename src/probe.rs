use crate::error::ProbeTimeout;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// Decides whether a server is ready to take traffic.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// One bounded check. Errors count as "not ready".
    async fn check_once(&self, port: u16) -> bool;
}

/// `GET http://127.0.0.1:{port}{path}`, ready on `200 OK` only.
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    /// Like [`HttpProbe::try_new`], but falls back to a client without a
    /// request timeout if the configured one cannot be built.
    pub fn new(path: impl Into<String>, request_timeout: Duration) -> Self {
        let path = path.into();
        match Self::try_new(path.clone(), request_timeout) {
            Ok(probe) => probe,
            Err(err) => {
                warn!(
                    %err,
                    ?request_timeout,
                    "Failed to build probe client, requests are unbounded"
                );
                Self::with_client(reqwest::Client::default(), path)
            }
        }
    }

    pub fn try_new(path: impl Into<String>, request_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self::with_client(client, path.into()))
    }

    fn with_client(client: reqwest::Client, mut path: String) -> Self {
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self { client, path }
    }

    fn url(&self, port: u16) -> String {
        format!("http://127.0.0.1:{}{}", port, self.path)
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn check_once(&self, port: u16) -> bool {
        match self.client.get(self.url(port)).send().await {
            Ok(response) => {
                trace!(status = %response.status(), "Probe response");
                response.status() == StatusCode::OK
            }
            Err(err) => {
                trace!(%err, "Probe failed");
                false
            }
        }
    }
}

/// Poll `probe` every `interval` until it succeeds or `timeout` has elapsed.
#[instrument(skip(probe))]
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    port: u16,
    interval: Duration,
    timeout: Duration,
) -> Result<(), ProbeTimeout> {
    let started = Instant::now();
    let mut attempts = 0;
    loop {
        attempts += 1;
        if probe.check_once(port).await {
            debug!(attempts, elapsed = ?started.elapsed(), "Ready");
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(ProbeTimeout {
                port,
                timeout,
                attempts,
            });
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct ScriptedProbe {
        answers: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedProbe {
        fn new(answers: &[bool]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReadinessProbe for ScriptedProbe {
        async fn check_once(&self, _port: u16) -> bool {
            self.calls.lock().push(Instant::now());
            self.answers.lock().pop_front().unwrap_or(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_check() {
        let probe = ScriptedProbe::new(&[false, false, true]);
        let interval = Duration::from_millis(100);

        wait_until_ready(&probe, 1, interval, Duration::from_secs(5))
            .await
            .unwrap();

        let calls = probe.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_ready() {
        let probe = ScriptedProbe::new(&[]);
        let started = Instant::now();

        let err = wait_until_ready(
            &probe,
            7,
            Duration::from_millis(100),
            Duration::from_millis(1000),
        )
        .await
        .unwrap_err();

        assert_eq!(err.port, 7);
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(err.attempts >= 10);
        assert_eq!(probe.calls.lock().len() as u32, err.attempts);
    }

    async fn serve_once(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response =
                format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            let _ = stream.write_all(response.as_bytes()).await;
        });
        port
    }

    #[tokio::test]
    async fn http_probe_accepts_200() {
        let port = serve_once("HTTP/1.1 200 OK").await;
        let probe = HttpProbe::new("/healthz", Duration::from_secs(1));
        assert!(probe.check_once(port).await);
    }

    #[tokio::test]
    async fn http_probe_rejects_other_statuses() {
        let port = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let probe = HttpProbe::new("healthz", Duration::from_secs(1));
        assert!(!probe.check_once(port).await);
    }

    #[tokio::test]
    async fn http_probe_gives_up_on_a_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let probe = HttpProbe::try_new("/healthz", Duration::from_millis(200)).unwrap();

        let started = Instant::now();
        assert!(!probe.check_once(port).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn http_probe_rejects_closed_port() {
        let port = crate::port::find_free_port().await.unwrap();
        let probe = HttpProbe::new("/healthz", Duration::from_millis(500));
        assert!(!probe.check_once(port).await);
    }
}
