//! Bounded-concurrency dispatch of rule blocks against one target

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use servprobe_common::FingerprintError;
use servprobe_probe::ProbeClient;

use crate::config::Config;
use crate::probing::{probe_block, ProbeOutcome, ProbeTarget};
use crate::selector::RuleBlock;

/// Run every block, at most `probes_concurrent_max` at a time.
///
/// Outcomes come back in dispatch order. Blocks not yet started when `cancel`
/// fires are skipped entirely; running ones finish as cancelled.
pub async fn run_blocks(
    target: &ProbeTarget,
    blocks: Vec<RuleBlock>,
    config: Arc<Config>,
    client: Arc<ProbeClient>,
    cancel: &CancellationToken,
) -> Vec<ProbeOutcome> {
    let permits = Arc::new(Semaphore::new(config.probes_concurrent_max.max(1)));
    let outcomes: Arc<Mutex<Vec<(usize, ProbeOutcome)>>> =
        Arc::new(Mutex::new(Vec::with_capacity(blocks.len())));
    let mut tasks = JoinSet::new();

    for (slot, block) in blocks.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(slot, "cancelled before dispatch");
                break;
            }
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let target = target.clone();
        let config = Arc::clone(&config);
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        let outcomes = Arc::clone(&outcomes);
        tasks.spawn(async move {
            let outcome = probe_block(&target, &block, &client, &config, &cancel).await;
            drop(permit);
            outcomes.lock().push((slot, outcome));
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "probe task aborted");
            let mut guard = outcomes.lock();
            guard.push((usize::MAX, ProbeOutcome::failed(FingerprintError::Probe(e.to_string()))));
        }
    }

    let mut collected = std::mem::take(&mut *outcomes.lock());
    collected.sort_by_key(|(slot, _)| *slot);
    collected.into_iter().map(|(_, outcome)| outcome).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use servprobe_common::PortState;
    use servprobe_rules::RuleDatabase;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const RULES: &str = r"
Probe TCP One q|one\r\n|
match one m|^ONE| p/one/
Probe TCP Two q|two\r\n|
match two m|^TWO| p/two/
Probe TCP Three q|three\r\n|
match three m|^THREE| p/three/
";

    fn blocks() -> Vec<RuleBlock> {
        let db = RuleDatabase::parse(RULES.as_bytes());
        db.iter()
            .map(|e| RuleBlock {
                probe: Arc::clone(&e.probe),
                matches: e.matches.clone(),
            })
            .collect()
    }

    /// Echoes the probe word back upper-cased and tracks the peak of open connections.
    async fn echo_server(peak: Arc<AtomicUsize>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let live = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                let live = Arc::clone(&live);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let mut buf = [0u8; 16];
                    let n = sock.read(&mut buf).await.unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    let word = String::from_utf8_lossy(&buf[..n]).trim().to_ascii_uppercase();
                    let _ = sock.write_all(word.as_bytes()).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        port
    }

    fn parts(concurrency: usize) -> (Arc<Config>, Arc<ProbeClient>) {
        let config = Config::default()
            .with_probe_timeout(Duration::from_secs(1))
            .with_probes_concurrent_max(concurrency);
        let client = config
            .probe_client()
            .unwrap()
            .with_poll_interval(Duration::from_millis(50));
        (Arc::new(config), Arc::new(client))
    }

    #[tokio::test]
    async fn outcomes_follow_dispatch_order() {
        let peak = Arc::new(AtomicUsize::new(0));
        let port = echo_server(Arc::clone(&peak)).await;
        let (config, client) = parts(3);

        let out = run_blocks(
            &ProbeTarget::new("127.0.0.1", port),
            blocks(),
            config,
            client,
            &CancellationToken::new(),
        )
        .await;

        let products: Vec<_> = out
            .iter()
            .map(|o| o.info.as_ref().unwrap().product_verbose.clone())
            .collect();
        assert_eq!(products, vec!["one", "two", "three"]);
        assert!(out.iter().all(|o| o.state == PortState::Open));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let peak = Arc::new(AtomicUsize::new(0));
        let port = echo_server(Arc::clone(&peak)).await;
        let (config, client) = parts(1);

        let out = run_blocks(
            &ProbeTarget::new("127.0.0.1", port),
            blocks(),
            config,
            client,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(out.len(), 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_dispatch_runs_nothing() {
        let (config, client) = parts(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = run_blocks(&ProbeTarget::new("127.0.0.1", 9), blocks(), config, client, &cancel).await;
        assert!(out.is_empty());
    }
}
