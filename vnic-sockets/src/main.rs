//! Entry point for `vnic-sockets`.
//!
//! `serve` runs a control server in front of a loopback device.  The other
//! subcommands are clients of such a server.  All protocol work is delegated
//! to the library; `main.rs` owns only process setup (logging, argument
//! parsing).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use vnic_sockets::{
    open_socket, query_promiscuous_level, CallbackListener, Config, ControlServer, FlowChannel,
    LoopbackDevice, OpenIntent, SpawnFailurePolicy,
};

/// Connect/listen sockets over a virtual NIC, carried by reverse TCP tunnels.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run a control server over an in-process loopback device.
    Serve {
        /// Local address to bind (e.g. 127.0.0.1:7000).
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        bind: String,
        /// Virtual address of the loopback device.
        #[arg(long, default_value = vnic_sockets::loopback::DEFAULT_ADDRESS)]
        address: String,
        /// Highest promiscuous level the device accepts.
        #[arg(long, default_value_t = vnic_sockets::loopback::DEFAULT_MAX_PROMISCUOUS_LEVEL)]
        max_level: u8,
        /// What to close when a reverse connection fails: close-socket or drop-flow.
        #[arg(long, default_value = "close-socket")]
        spawn_failure: SpawnFailurePolicy,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Query the device's promiscuous level, optionally setting it first.
    Promisc {
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        control: String,
        #[arg(long)]
        set: Option<u8>,
    },
    /// Listen on a virtual port and echo every flow back to its sender.
    Listen {
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        control: String,
        /// Virtual port to listen on.
        #[arg(short, long)]
        port: u16,
        /// Local address for reverse connections.
        #[arg(long, default_value = "127.0.0.1:0")]
        callback: String,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Connect to a virtual address, send a message and print the reply.
    Send {
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        control: String,
        /// Virtual destination address.
        #[arg(short, long, default_value = vnic_sockets::loopback::DEFAULT_ADDRESS)]
        destination: String,
        /// Virtual destination port.
        #[arg(short, long)]
        port: u16,
        #[arg(long, default_value = "127.0.0.1:0")]
        callback: String,
        message: String,
        #[command(flatten)]
        tuning: Tuning,
    },
}

#[derive(Args)]
struct Tuning {
    /// Seconds allowed for a reverse connection to be established.
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,
    /// Read buffer size in bytes.
    #[arg(
        long,
        default_value_t = 16 * 1024,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    read_chunk: usize,
}

impl Tuning {
    fn config(&self) -> Config {
        Config {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            read_chunk: self.read_chunk,
            ..Config::default()
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Serve {
            bind,
            address,
            max_level,
            spawn_failure,
            tuning,
        } => {
            let config = Config {
                spawn_failure,
                ..tuning.config()
            };
            let device = Arc::new(LoopbackDevice::new(address, max_level));
            let server = ControlServer::bind(&bind, device, config)
                .await
                .with_context(|| format!("binding control server on {bind}"))?;
            log::info!("Serving loopback device on {}", server.local_addr()?);
            server.run().await?;
        }
        Mode::Promisc { control, set } => {
            let level = query_promiscuous_level(&control, set, &Config::default()).await?;
            println!("{level}");
        }
        Mode::Listen {
            control,
            port,
            callback,
            tuning,
        } => {
            let config = tuning.config();
            let listener = CallbackListener::bind(&callback, &config).await?;
            let registry = listener.registry();
            tokio::spawn(listener.run());

            let (factory, mut flows) = FlowChannel::factory();
            let socket = open_socket(
                &control,
                OpenIntent::Listen { source_port: port },
                registry,
                factory,
                &config,
            )
            .await?;
            log::info!("Listening on virtual port {}", socket.port());

            while let Some(mut flow) = flows.recv().await {
                log::info!("Accepted {}", flow.flow());
                tokio::spawn(async move {
                    while let Some(data) = flow.recv().await {
                        if !flow.write(&data) {
                            break;
                        }
                    }
                });
            }
        }
        Mode::Send {
            control,
            destination,
            port,
            callback,
            message,
            tuning,
        } => {
            let config = tuning.config();
            let listener = CallbackListener::bind(&callback, &config).await?;
            let registry = listener.registry();
            tokio::spawn(listener.run());

            let (factory, mut flows) = FlowChannel::factory();
            let socket = open_socket(
                &control,
                OpenIntent::Connect {
                    destination,
                    destination_port: port,
                },
                registry,
                factory,
                &config,
            )
            .await?;
            log::info!("Connected from virtual port {}", socket.port());

            let Some(mut flow) = flows.recv().await else {
                bail!("no flow was spawned");
            };
            flow.write(message.as_bytes());
            match tokio::time::timeout(config.connect_timeout, flow.recv()).await {
                Ok(Some(reply)) => println!("{}", String::from_utf8_lossy(&reply)),
                Ok(None) => bail!("flow closed without a reply"),
                Err(_) => bail!("timed out waiting for a reply"),
            }
            socket.close().await?;
        }
    }

    Ok(())
}
