//! Readiness Prober (C11): waits for a DHCP lease, then for an HTTP
//! 2xx/3xx response on the guest's declared port.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::cancel;
use crate::error::DockvmError;
use crate::hypervisor::subprocess::Runner;
use crate::hypervisor::{Context, Hypervisor};

const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(180);

/// The domain's leased IPv4 address, once it has also answered HTTP with
/// a 2xx/3xx status for the declared `Host`.
///
/// An HTTP timeout is returned as `Err(HTTPTimeout)`, not `Ok` with a
/// false flag: the domain itself stays `Running` (the caller does not
/// roll it back for this), but `up` must still exit nonzero so a guest
/// that leased but never answered HTTP is reported as a failure.
pub async fn wait_ready(
    runner: &dyn Runner,
    hv_context: Context,
    token: &CancellationToken,
    name: &str,
    domain: &str,
    port: u16,
) -> Result<String, DockvmError> {
    let hv = Hypervisor::new(runner, hv_context);
    let name_owned = name.to_string();
    let lease_attempt = async move {
        tokio::task::spawn_blocking(move || hv.lease(&name_owned, DEFAULT_LEASE_TIMEOUT))
            .await
            .unwrap_or_else(|e| Err(DockvmError::lease_timeout(format!("lease task panicked: {e}"))))
    };
    let ip = cancel::race(
        token,
        DEFAULT_LEASE_TIMEOUT,
        "lease",
        lease_attempt,
        || DockvmError::lease_timeout(name.to_string()),
    )
    .await??;

    wait_http_ready(token, &ip, domain, port).await?;
    Ok(ip)
}

async fn wait_http_ready(
    token: &CancellationToken,
    ip: &str,
    domain: &str,
    port: u16,
) -> Result<(), DockvmError> {
    let url = format!("http://{ip}:{port}/");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| DockvmError::http_timeout(url.clone()).with_hint(e.to_string()))?;

    let domain = domain.to_string();
    let probe_url = url.clone();
    let probe = async move {
        loop {
            let ready = client
                .get(&probe_url)
                .header("Host", &domain)
                .send()
                .await
                .ok()
                .map(|resp| resp.status().is_success() || resp.status().is_redirection())
                .unwrap_or(false);
            if ready {
                return;
            }
            let jitter_ms = rand::thread_rng().gen_range(900..1100);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }
    };

    cancel::race(
        token,
        DEFAULT_HTTP_TIMEOUT,
        "http-ready",
        probe,
        || DockvmError::http_timeout(url.clone()),
    )
    .await
}
