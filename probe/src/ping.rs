//! ICMP echo strategy.
//!
//! Sends a burst of echoes and reports mean round-trip plus packet loss.
//! A single reply is enough for `up`. Raw-socket permission errors are
//! ordinary probe failures, not crashes.

use std::net::IpAddr;
use std::time::Duration;

use guardant_core::{ErrorKind, PingConfig, ProbeFailure, ProbeTask};
use rand::random;
use surge_ping::{Client, Config, PingIdentifier, PingSequence};
use tokio::net::lookup_host;

use crate::Outcome;

/// Fold raw echo outcomes into `(mean_rtt_ms, loss_pct, received)`.
pub fn summarise_pings(rtts: &[Option<Duration>]) -> (Option<f64>, f64, usize) {
    let received: Vec<f64> = rtts
        .iter()
        .flatten()
        .map(|d| d.as_secs_f64() * 1000.0)
        .collect();
    let loss_pct = if rtts.is_empty() {
        100.0
    } else {
        (rtts.len() - received.len()) as f64 / rtts.len() as f64 * 100.0
    };
    let mean = if received.is_empty() {
        None
    } else {
        Some(received.iter().sum::<f64>() / received.len() as f64)
    };
    (mean, loss_pct, received.len())
}

async fn resolve(target: &str, deadline: Duration) -> Result<IpAddr, Outcome> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }
    // lookup_host wants a port; the target itself carries none for ping.
    let lookup = format!("{target}:0");
    match tokio::time::timeout(deadline, lookup_host(lookup)).await {
        Ok(Ok(mut addrs)) => addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| {
                Outcome::down(ProbeFailure::with_detail(
                    ErrorKind::Dns,
                    format!("no addresses for {target}"),
                ))
            }),
        Ok(Err(err)) => Err(Outcome::down(ProbeFailure::with_detail(
            ErrorKind::Dns,
            err.to_string(),
        ))),
        Err(_) => Err(Outcome::down(ProbeFailure::new(ErrorKind::Timeout))),
    }
}

pub(crate) async fn probe_ping(
    task: &ProbeTask,
    config: &PingConfig,
    deadline: Duration,
) -> Outcome {
    let ip = match resolve(&task.target, deadline).await {
        Ok(ip) => ip,
        Err(outcome) => return outcome,
    };

    let client = match Client::new(&Config::default()) {
        Ok(client) => client,
        Err(err) => {
            // Typically EPERM: the worker lacks raw-socket capability.
            return Outcome::down(ProbeFailure::with_detail(
                ErrorKind::Protocol,
                format!("icmp socket unavailable: {err}"),
            ));
        }
    };

    let count = config.count.max(1) as usize;
    let payload = vec![0u8; config.packet_size as usize];
    let per_echo = deadline / count as u32;

    let mut pinger = client.pinger(ip, PingIdentifier(random())).await;
    pinger.timeout(per_echo);

    let mut rtts: Vec<Option<Duration>> = Vec::with_capacity(count);
    for seq in 0..count {
        match pinger.ping(PingSequence(seq as u16), &payload).await {
            Ok((_packet, rtt)) => rtts.push(Some(rtt)),
            Err(_) => rtts.push(None),
        }
    }

    let (mean, loss_pct, received) = summarise_pings(&rtts);
    if received == 0 {
        let mut outcome = Outcome::down(ProbeFailure::with_detail(
            ErrorKind::Timeout,
            "all echoes lost",
        ));
        outcome.sample.packet_loss_pct = Some(loss_pct);
        return outcome;
    }

    let mut outcome = Outcome::up(mean);
    outcome.sample.packet_loss_pct = Some(loss_pct);
    outcome
}
