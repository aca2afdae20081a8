mod cli;
mod dns;
mod stats;

use muxping::utils;
use muxping::{DispatchPolicy, ExhaustionPolicy, Multiplexer, MuxConfig, PingConn, PingError, Probe};
use stats::PingStatistics;
use std::time::Duration;
use tokio::sync::mpsc;

type Outcome = (usize, Probe, Result<(), PingError>);

#[tokio::main]
async fn main() {
    // Enable debug logging if RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }

    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            utils::exit_with_error(&e.to_string(), 2);
        }
    };

    if let Err(e) = utils::validate_ping_params(args.size, args.count, args.timeout, args.interval) {
        utils::exit_with_error(&e.to_string(), 2);
    }

    let targets = match dns::resolve_targets(&args.targets, args.force_ipv4, args.force_ipv6).await {
        Ok(targets) => targets,
        Err(e) => {
            utils::exit_with_error(&e.to_string(), 2);
        }
    };

    let payload_size = args.size.map(|size| size as usize).unwrap_or(muxping::icmp::DEFAULT_PAYLOAD_SIZE);
    let timeout = Duration::from_millis(args.timeout.unwrap_or(4000) as u64);
    let interval = Duration::from_millis(args.interval.unwrap_or(1000) as u64);
    let count = args.count.unwrap_or(u32::MAX);

    let dispatch = DispatchPolicy::from_value(args.workers, args.queue);
    let config = MuxConfig {
        payload_size,
        exhaustion: if args.evict {
            ExhaustionPolicy::Evict
        } else {
            ExhaustionPolicy::Block
        },
        dispatch_v4: dispatch,
        dispatch_v6: dispatch,
    };
    let mux = Multiplexer::new(config);

    let (tx, mut rx) = mpsc::unbounded_channel::<Outcome>();
    let mut conns: Vec<PingConn> = Vec::with_capacity(targets.len());
    let mut stats: Vec<PingStatistics> = Vec::with_capacity(targets.len());

    for (slot, (name, ip)) in targets.iter().enumerate() {
        let tx = tx.clone();
        let handler = move |probe: Probe, result: Result<(), PingError>| {
            let _ = tx.send((slot, probe, result));
        };

        let conn = match mux.new_conn(*ip, handler, timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                utils::exit_with_error(&format!("{}: {}", name, e), 1);
            }
        };

        let target_stats = PingStatistics::new();
        println!("{}", target_stats.format_header(name, *ip, payload_size));
        conns.push(conn);
        stats.push(target_stats);
    }
    drop(tx);

    let mut shutdown = utils::setup_signal_handler();
    let mut ticker = tokio::time::interval(interval);
    let mut rounds = 0u32;
    let mut outstanding = 0usize;

    loop {
        tokio::select! {
            Ok(()) = shutdown.changed() => break,
            Some((slot, probe, result)) = rx.recv() => {
                outstanding = outstanding.saturating_sub(1);
                match &result {
                    Ok(()) => println!("{}", stats[slot].format_response(&probe)),
                    Err(e) => println!("{}", stats[slot].format_failure(&probe, e)),
                }
                stats[slot].record(&probe, &result);

                if rounds >= count && outstanding == 0 {
                    break;
                }
            }
            _ = ticker.tick(), if rounds < count => {
                rounds += 1;
                for (slot, conn) in conns.iter().enumerate() {
                    match mux.send_ping(conn).await {
                        Ok(_) => {
                            stats[slot].record_sent();
                            outstanding += 1;
                        }
                        Err(e) => eprintln!("{}: {}", targets[slot].0, e),
                    }
                }
            }
        }
    }

    for conn in &conns {
        if let Err(e) = mux.close(conn).await {
            log::debug!("closing {}: {}", conn.addr(), e);
        }
    }
    // Probes cut short by the shutdown
    while let Ok((slot, probe, result)) = rx.try_recv() {
        stats[slot].record(&probe, &result);
    }

    let mut any_received = false;
    for ((name, _), target_stats) in targets.iter().zip(&stats) {
        print!("{}", target_stats.format_summary(name));
        any_received |= target_stats.packets_received > 0;
    }

    if !any_received {
        std::process::exit(1);
    }
}
