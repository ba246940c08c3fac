//! Closed-loop benchmark client executable: `-t` concurrent clients each
//! invoke key-value ops against the fleet for `-d` seconds of wall time.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use clap::Parser;

use env_logger::Env;

use rand::Rng;

use tokio::runtime::Builder;

use replicore::protocols::unreplicated::Unreplicated;
use replicore::protocols::vr::Vr;
use replicore::protocols::Protocol;
use replicore::server::Command;
use replicore::{
    pf_error, pf_warn, BasicClient, Data, FleetConfig, GenericClient,
    ReplicoreError, SmrProtocol, UdpTransport,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Name of SMR protocol the fleet runs.
    #[arg(short = 'm', long, default_value_t = String::from("vr"))]
    mode: String,

    /// Path prefix of the fleet config file (at '<prefix>.config').
    #[arg(short = 'c', long)]
    config_prefix: String,

    /// Number of concurrent closed-loop clients.
    #[arg(short = 't', long, default_value_t = 1)]
    threads: usize,

    /// Send duration in seconds.
    #[arg(short = 'd', long, default_value_t = 10)]
    duration: u64,
}

impl CliArgs {
    fn sanitize(&self) -> Result<SmrProtocol, ReplicoreError> {
        if self.threads == 0 {
            return Err(ReplicoreError(format!(
                "invalid number of client threads {}",
                self.threads
            )));
        }
        if self.duration == 0 {
            return Err(ReplicoreError(format!(
                "invalid send duration {}",
                self.duration
            )));
        }

        let protocol =
            SmrProtocol::parse_name(&self.mode).ok_or_else(|| {
                ReplicoreError(format!(
                    "protocol name '{}' unrecognized",
                    self.mode
                ))
            })?;
        if !protocol.implemented() {
            return Err(ReplicoreError(format!(
                "protocol '{}' only has scaffolding in this build",
                self.mode
            )));
        }
        Ok(protocol)
    }
}

/// One random Put-or-Get op over a small key space, wire-encoded.
fn random_op(rng: &mut impl Rng) -> Data {
    let key = format!("k{}", rng.gen_range(0..100));
    let command = if rng.gen_bool(0.5) {
        Command::Put {
            key,
            value: format!("v{}", rng.gen_range(0..1_000_000)),
        }
    } else {
        Command::Get { key }
    };
    Data::from_vec(rmp_serde::to_vec(&command).expect("command encodable"))
}

/// Runs one closed-loop client until the deadline; returns its completed
/// op count and summed latency.
fn closed_loop<P: Protocol>(
    transport: UdpTransport,
    deadline: Instant,
) -> (u64, Duration) {
    let client = BasicClient::<_, P>::new_and_setup(transport);
    let mut rng = rand::thread_rng();
    let mut completed = 0u64;
    let mut latency_sum = Duration::ZERO;

    while Instant::now() < deadline {
        let (reply_tx, reply_rx) = mpsc::channel();
        let started = Instant::now();
        let invoked = client.lock().unwrap().invoke(
            random_op(&mut rng),
            Box::new(move |result| {
                let _ = reply_tx.send(result);
            }),
        );
        if let Err(e) = invoked {
            pf_error!("client"; "invoke failed: {}", e);
            break;
        }
        // loss is indistinguishable from latency; the client's resend
        // loop makes every invocation finish eventually
        match reply_rx.recv() {
            Ok(_result) => {
                completed += 1;
                latency_sum += started.elapsed();
            }
            Err(e) => {
                pf_warn!("client"; "reply channel closed: {}", e);
                break;
            }
        }
    }
    (completed, latency_sum)
}

// Client executable main entrance.
fn client_main() -> Result<(), ReplicoreError> {
    let args = CliArgs::parse();
    let config_path = format!("{}.config", args.config_prefix);
    let config_text = std::fs::read_to_string(&config_path)?;
    let config = FleetConfig::<SocketAddr>::from_config_text(&config_text)?;
    let protocol = args.sanitize()?;

    // a panic anywhere (worker thread or transport task) must take the
    // whole process down with a nonzero status
    std::panic::set_hook(Box::new(|info| {
        eprintln!("{}", info);
        std::process::exit(1);
    }));

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("replicore-client")
        .build()?;
    let _enter = runtime.enter();
    let transport = UdpTransport::new_and_setup(config, 0)?;

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut workers = Vec::new();
    for _ in 0..args.threads {
        let transport = transport.clone();
        workers.push(std::thread::spawn(move || match protocol {
            SmrProtocol::Unreplicated => {
                closed_loop::<Unreplicated>(transport, deadline)
            }
            SmrProtocol::Vr => closed_loop::<Vr>(transport, deadline),
            _ => unreachable!("rejected by sanitize"),
        }));
    }

    let mut completed = 0u64;
    let mut latency_sum = Duration::ZERO;
    for worker in workers {
        let (worker_ops, worker_latency) = worker
            .join()
            .map_err(|_| ReplicoreError("client worker panicked".into()))?;
        completed += worker_ops;
        latency_sum += worker_latency;
    }

    println!(
        "{} clients x {} secs: {} ops completed, {:.1} ops/sec, {:?} mean latency",
        args.threads,
        args.duration,
        completed,
        completed as f64 / args.duration as f64,
        latency_sum
            .checked_div(completed.max(1) as u32)
            .unwrap_or_default(),
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = client_main() {
        pf_error!("client"; "exitting due to: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
