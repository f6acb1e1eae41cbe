//! traceroute command - hop-by-hop path discovery.

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use clap::Parser;
use pathprobe::engine::{Engine, Event, Options};
use pathprobe::output::{TraceOutcome, TraceReport};
use pathprobe::sniffer::IcmpSniffer;
use pathprobe::trace::{self, TraceNotice};
use tokio_stream::StreamExt;

#[derive(Parser)]
#[command(name = "traceroute", version, about = "Trace the path packets take to a host")]
struct Cli {
    /// Target IPv4 address.
    dst_ip: Ipv4Addr,

    /// First TTL probed.
    #[arg(short = 'f', long, default_value_t = 1)]
    min_ttl: u8,

    /// Largest TTL probed.
    #[arg(short = 'm', long, default_value_t = 30)]
    max_ttl: u8,

    /// Probes sent per hop.
    #[arg(short = 'q', long, default_value_t = 3)]
    num_probes: u8,

    /// Per-probe timeout in seconds.
    #[arg(short = 'w', long, default_value_t = 3.0)]
    wait: f64,

    /// Output JSON.
    #[arg(short = 'j', long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    // clap exits 2 on bad usage by default; this tool reserves 2 for
    // runtime failures, so map usage errors to 1 ourselves.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let is_usage = e.use_stderr();
            let _ = e.print();
            std::process::exit(if is_usage { 1 } else { 0 });
        }
    };

    match run(cli).await {
        Ok(outcome) => std::process::exit(outcome_code(outcome)),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(error_code(&e));
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<Option<TraceOutcome>> {
    let mut engine = Engine::new();
    engine.set_timeout(Duration::from_secs_f64(cli.wait));
    trace::register(&mut engine);

    let options = Options::new()
        .set_str("dst-ip", cli.dst_ip.to_string())
        .set_int("min-ttl", i64::from(cli.min_ttl))
        .set_int("max-ttl", i64::from(cli.max_ttl))
        .set_int("num-probes", i64::from(cli.num_probes));

    // Validate before touching the network, so bad flags never need
    // privileges to be reported.
    engine.run_instance("traceroute", options, None)?;
    engine.attach_sniffer(Box::new(IcmpSniffer::new()))?;

    let mut events = engine.events();
    let handle = engine.handle();
    let runner = tokio::spawn(async move { engine.run().await });

    if !cli.json {
        println!("traceroute to {}, {} hops max", cli.dst_ip, cli.max_ttl);
    }

    let mut report = TraceReport::new(IpAddr::V4(cli.dst_ip));
    let mut printer = LinePrinter::new(cli.json);
    let mut outcome = None;

    while let Some(event) = events.next().await {
        match event {
            Event::ProbeReply { probe, reply } => {
                let ttl = probe.fields().ttl;
                let rtt = probe.rtt(&reply);
                printer.probe(ttl, Some((reply.from(), rtt.unwrap_or_default())))?;
                report.record(ttl, Some(reply.from()), rtt);
            }
            Event::ProbeTimeout { probe } => {
                let ttl = probe.fields().ttl;
                printer.probe(ttl, None)?;
                report.record(ttl, None, None);
            }
            Event::Notice(notice) => {
                if let Some(n) = notice.downcast_ref::<TraceNotice>() {
                    outcome = Some(match n {
                        TraceNotice::DestinationReached { .. } => TraceOutcome::DestinationReached,
                        TraceNotice::MaxTtlReached { .. } => TraceOutcome::MaxTtlReached,
                        TraceNotice::GapStop { .. } => TraceOutcome::GapStop,
                    });
                    break;
                }
            }
            _ => {}
        }
    }
    printer.finish()?;

    handle.stop();
    runner.await??;

    if let Some(outcome) = outcome {
        report.conclude(outcome);
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(outcome)
}

/// Accumulates probe results into one text line per hop.
struct LinePrinter {
    quiet: bool,
    current: Option<u8>,
}

impl LinePrinter {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            current: None,
        }
    }

    fn probe(&mut self, ttl: u8, result: Option<(IpAddr, Duration)>) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        if self.current != Some(ttl) {
            if self.current.is_some() {
                println!();
            }
            print!("{ttl:3}  ");
            self.current = Some(ttl);
        }
        match result {
            Some((from, rtt)) => print!("{from}  {:.3} ms  ", rtt.as_secs_f64() * 1000.0),
            None => print!("*  "),
        }
        io::stdout().flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        if !self.quiet && self.current.take().is_some() {
            println!();
        }
        Ok(())
    }
}

fn outcome_code(outcome: Option<TraceOutcome>) -> i32 {
    match outcome {
        Some(TraceOutcome::DestinationReached) => 0,
        // The target never answered: unreachable for our purposes.
        Some(TraceOutcome::MaxTtlReached) | Some(TraceOutcome::GapStop) => 3,
        Some(TraceOutcome::Stopped) | None => 2,
    }
}

fn error_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<pathprobe::Error>() {
        Some(pathprobe::Error::InvalidArgument(_)) | Some(pathprobe::Error::UnknownAlgorithm(_)) => {
            1
        }
        _ => 2,
    }
}
