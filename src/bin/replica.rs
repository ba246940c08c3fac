//! Replica node executable, running the chosen protocol over the UDP
//! transport with the key-value state machine.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

use replicore::protocols::unreplicated::UnreplicatedReplica;
use replicore::protocols::vr::{VrReplica, VrReplicaConfig};
use replicore::server::{KvStore, ListLog};
use replicore::{
    logged_err, parsed_config, pf_error, pf_info, pf_warn, FleetConfig,
    ReplicaId, ReplicoreError, SmrProtocol, UdpTransport,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Name of SMR protocol to run.
    #[arg(short = 'm', long, default_value_t = String::from("vr"))]
    mode: String,

    /// Path prefix of the fleet config file (at '<prefix>.config').
    #[arg(short = 'c', long)]
    config_prefix: String,

    /// Replica ID of myself.
    #[arg(short = 'i', long, default_value_t = 0)]
    replica_id: ReplicaId,

    /// Protocol-specific tunables as a TOML string,
    /// e.g. -o 'batch_size = 10'.
    #[arg(short = 'o', long)]
    options: Option<String>,

    /// Number of concurrent worker channels.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments against the parsed fleet config.
    fn sanitize(
        &self,
        config: &FleetConfig<SocketAddr>,
    ) -> Result<SmrProtocol, ReplicoreError> {
        if self.replica_id < 0
            || (self.replica_id as usize) >= config.n_replicas()
        {
            return Err(ReplicoreError(format!(
                "invalid replica ID {} / {}",
                self.replica_id,
                config.n_replicas()
            )));
        }
        if self.threads == 0 {
            return Err(ReplicoreError(format!(
                "invalid number of threads {}",
                self.threads
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

async fn run_until_interrupted(
    replica_id: ReplicaId,
) -> Result<(), ReplicoreError> {
    pf_info!(replica_id; "replica up; ctrl-c to shut down");
    tokio::signal::ctrl_c().await?;
    pf_warn!(replica_id; "caught termination signal");
    Ok(())
}

// Replica node executable main entrance.
fn replica_main() -> Result<(), ReplicoreError> {
    // read in and parse command line arguments and the fleet config file
    let args = CliArgs::parse();
    let config_path = format!("{}.config", args.config_prefix);
    let config_text = std::fs::read_to_string(&config_path)?;
    let config = FleetConfig::<SocketAddr>::from_config_text(&config_text)?;
    let protocol = args.sanitize(&config)?;

    // fatal protocol violations inside worker tasks must take the whole
    // process down with a nonzero status
    std::panic::set_hook(Box::new(|info| {
        eprintln!("{}", info);
        std::process::exit(1);
    }));

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads + 2)
        .thread_name("replicore-replica")
        .build()?;

    runtime.block_on(async {
        let transport = UdpTransport::new_and_setup(config, args.threads)?;
        let log = ListLog::new(KvStore::new());

        match protocol {
            SmrProtocol::Unreplicated => {
                if args.replica_id != 0 {
                    return logged_err!(args.replica_id;
                                       "unreplicated mode runs replica 0 only");
                }
                let _replica =
                    UnreplicatedReplica::new_and_setup(transport, log);
                run_until_interrupted(args.replica_id).await
            }
            SmrProtocol::Vr => {
                let vr_config = parsed_config!(
                    args.options.as_deref() => VrReplicaConfig;
                    batch_size, idle_commit_interval_ms,
                    view_change_interval_ms)?;
                let _replica = VrReplica::new_and_setup(
                    transport,
                    log,
                    args.replica_id,
                    vr_config,
                )?;
                run_until_interrupted(args.replica_id).await
            }
            _ => unreachable!("rejected by sanitize"),
        }
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = replica_main() {
        pf_error!("replica"; "exitting due to: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
