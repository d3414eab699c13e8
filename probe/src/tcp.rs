//! TCP-family strategies: handshake + optional send/expect, and the
//! connection-only port variant.

use std::time::{Duration, Instant};

use guardant_core::{ErrorKind, ProbeFailure, ProbeTask, TcpConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

use crate::{degraded_threshold_ms, Outcome};

fn classify_io(err: &std::io::Error) -> ProbeFailure {
    let kind = match err.kind() {
        std::io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
            ErrorKind::ConnectionReset
        }
        std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
        _ => ErrorKind::Protocol,
    };
    ProbeFailure::with_detail(kind, err.to_string())
}

/// Resolve and connect within the deadline. DNS counts against the probe
/// budget like everything else.
async fn connect(target: &str, deadline: Duration) -> Result<(TcpStream, Instant), Outcome> {
    let start = Instant::now();
    let addrs = match tokio::time::timeout(deadline, lookup_host(target)).await {
        Ok(Ok(addrs)) => addrs.collect::<Vec<_>>(),
        Ok(Err(err)) => {
            return Err(Outcome::down(ProbeFailure::with_detail(
                ErrorKind::Dns,
                err.to_string(),
            )))
        }
        Err(_) => return Err(Outcome::down(ProbeFailure::new(ErrorKind::Timeout))),
    };
    let Some(addr) = addrs.first().copied() else {
        return Err(Outcome::down(ProbeFailure::with_detail(
            ErrorKind::Dns,
            format!("no addresses for {target}"),
        )));
    };

    let remaining = deadline.saturating_sub(start.elapsed());
    match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok((stream, start)),
        Ok(Err(err)) => Err(Outcome::down(classify_io(&err))),
        Err(_) => Err(Outcome::down(ProbeFailure::new(ErrorKind::Timeout))),
    }
}

pub(crate) async fn probe_tcp(
    task: &ProbeTask,
    config: &TcpConfig,
    deadline: Duration,
) -> Outcome {
    let (mut stream, start) = match connect(&task.target, deadline).await {
        Ok(connected) => connected,
        Err(outcome) => return outcome,
    };

    if let Some(probe_bytes) = &config.probe_bytes {
        let remaining = deadline.saturating_sub(start.elapsed());
        match tokio::time::timeout(remaining, stream.write_all(probe_bytes.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Outcome::down(classify_io(&err)),
            Err(_) => return Outcome::down(ProbeFailure::new(ErrorKind::Timeout)),
        }
    }

    if let Some(expected) = &config.expected_prefix {
        let mut buf = vec![0u8; expected.len().max(64)];
        let remaining = deadline.saturating_sub(start.elapsed());
        let read = match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(read)) => read,
            Ok(Err(err)) => return Outcome::down(classify_io(&err)),
            Err(_) => return Outcome::down(ProbeFailure::new(ErrorKind::Timeout)),
        };
        let rtt_ms = start.elapsed().as_secs_f64() * 1000.0;
        if !buf[..read].starts_with(expected.as_bytes()) {
            let observed = String::from_utf8_lossy(&buf[..read.min(64)]).into_owned();
            let mut outcome = Outcome::down(ProbeFailure::with_detail(
                ErrorKind::Protocol,
                format!("expected prefix {expected:?}, got {observed:?}"),
            ));
            outcome.rtt_ms = Some(rtt_ms);
            return outcome;
        }
        return finish(rtt_ms, task);
    }

    finish(start.elapsed().as_secs_f64() * 1000.0, task)
}

pub(crate) async fn probe_port(task: &ProbeTask, deadline: Duration) -> Outcome {
    match connect(&task.target, deadline).await {
        Ok((_stream, start)) => finish(start.elapsed().as_secs_f64() * 1000.0, task),
        Err(outcome) => outcome,
    }
}

fn finish(rtt_ms: f64, task: &ProbeTask) -> Outcome {
    if rtt_ms > degraded_threshold_ms(task.interval_seconds) {
        Outcome::degraded(Some(rtt_ms), None)
    } else {
        Outcome::up(Some(rtt_ms))
    }
}
