//! Startup health gate: polls the backend until it answers or time runs out.

use std::time::{Duration, Instant};

use super::SupervisorError;

/// Per-probe timeout; a hung probe must not eat the whole gate budget.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1200);

#[derive(Debug, Clone)]
pub struct HealthGateOptions {
    /// Grace period before the first probe.
    pub initial_delay: Duration,
    /// Pause between probes.
    pub interval: Duration,
    /// Wall-clock budget for the whole gate, measured from the first call.
    pub timeout: Duration,
}

impl Default for HealthGateOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(30_000),
        }
    }
}

/// Poll `probe_url` until it returns an HTTP success status.
///
/// This is the sole admission control for "the backend is usable";
/// nothing else may declare readiness. The caller must pass a loopback
/// literal (`127.0.0.1`) URL so no name resolution is involved.
pub async fn await_ready(
    client: &reqwest::Client,
    probe_url: &str,
    opts: &HealthGateOptions,
) -> Result<(), SupervisorError> {
    let started = Instant::now();
    let mut last_error = String::from("no probe attempted");

    tokio::time::sleep(opts.initial_delay).await;

    loop {
        match client
            .get(probe_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                log::info!(
                    "Backend healthy after {:.1}s",
                    started.elapsed().as_secs_f64()
                );
                return Ok(());
            }
            Ok(resp) => {
                last_error = format!("probe returned status {}", resp.status());
            }
            Err(e) => {
                last_error = e.to_string();
            }
        }

        if started.elapsed() >= opts.timeout {
            return Err(SupervisorError::HealthCheckTimeout {
                waited: started.elapsed(),
                last_error,
            });
        }

        tokio::time::sleep(opts.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    /// Minimal HTTP server that answers every request with 200 OK.
    fn spawn_ok_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok");
            }
        });
        format!("http://127.0.0.1:{port}/api/health")
    }

    #[tokio::test]
    async fn resolves_no_earlier_than_the_initial_delay() {
        let url = spawn_ok_server();
        let client = reqwest::Client::new();
        let opts = HealthGateOptions {
            initial_delay: Duration::from_millis(150),
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(5000),
        };

        let started = Instant::now();
        await_ready(&client, &url, &opts).await.expect("ready");
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn times_out_no_earlier_than_the_budget() {
        // Nothing listens on this port (bound but never accepted-from,
        // dropped before probing starts).
        let url = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            let port = listener.local_addr().expect("addr").port();
            format!("http://127.0.0.1:{port}/api/health")
        };
        let client = reqwest::Client::new();
        let opts = HealthGateOptions {
            initial_delay: Duration::from_millis(10),
            interval: Duration::from_millis(25),
            timeout: Duration::from_millis(300),
        };

        let started = Instant::now();
        let err = await_ready(&client, &url, &opts)
            .await
            .expect_err("must time out");
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(matches!(err, SupervisorError::HealthCheckTimeout { .. }));
        let msg = err.to_string();
        assert!(msg.contains("healthy"), "unexpected message: {msg}");
    }
}
