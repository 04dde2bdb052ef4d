//! Vesper extension-host daemon.
//!
//! Runs the IDE-side host runtime standalone: listens for a guest
//! connection over TCP loopback or a Unix domain socket, optionally spawns
//! the guest runtime, and drives the handshake and RPC wiring until
//! interrupted.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use vesper_exthost::config::{HostConfig, ProductConfig};
use vesper_exthost::guest::{GuestConfig, GuestProcess, GuestTransport};
use vesper_exthost::manager::{HostContext, HostSupervisor};
use vesper_exthost::server::{TcpTransportServer, TransportBinding, UdsTransportServer};

/// Transport the guest connects over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
	/// Loopback TCP with an OS-assigned port.
	Tcp,
	/// Unix domain socket in the runtime directory.
	Uds,
}

/// Extension-host daemon command line arguments.
#[derive(Parser, Debug)]
#[command(name = "vesper-exthost")]
#[command(about = "Vesper out-of-process extension host runtime")]
struct Args {
	/// Project directory served to the guest
	#[arg(short, long, value_name = "DIR", default_value = ".")]
	project: PathBuf,

	/// Transport for the guest connection
	#[arg(long, value_enum, default_value = "uds")]
	transport: TransportKind,

	/// Extension-host entry script; without it, no guest is spawned
	#[arg(long, value_name = "FILE")]
	entry: Option<PathBuf>,

	/// Explicit runtime executable, overriding discovery
	#[arg(long, value_name = "FILE")]
	runtime: Option<PathBuf>,

	/// Listen only; the guest is launched separately
	#[arg(long)]
	no_spawn: bool,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

enum ServerHandle {
	Tcp(TcpTransportServer),
	Uds(UdsTransportServer),
}

impl ServerHandle {
	fn stop(&self) {
		match self {
			Self::Tcp(server) => server.stop(),
			Self::Uds(server) => server.stop(),
		}
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	setup_tracing(args.verbose);

	info!("starting vesper-exthost");

	let product = ProductConfig::load(&vesper_exthost_proto::paths::main_config_path()).await?;
	let host_config = HostConfig::from_product(&product);
	let proxy = host_config.proxy.clone();
	let context = HostContext::new(host_config);
	let supervisor = HostSupervisor::new(context, args.project.clone());

	let (server, binding) = match args.transport {
		TransportKind::Tcp => {
			let server = TcpTransportServer::new(supervisor.connection_sink());
			let binding = server.start(&args.project).await?;
			(ServerHandle::Tcp(server), binding)
		}
		TransportKind::Uds => {
			let server = UdsTransportServer::new(supervisor.connection_sink());
			let binding = server.start(&args.project).await?;
			(ServerHandle::Uds(server), binding)
		}
	};

	let guest = match (&args.entry, args.no_spawn) {
		(Some(entry), false) => {
			let transport = match &binding {
				TransportBinding::Tcp { host, port } => GuestTransport::Tcp {
					host: host.clone(),
					port: *port,
				},
				TransportBinding::Uds(path) => GuestTransport::Uds(path.clone()),
			};
			let guest_config = GuestConfig {
				entry_script: entry.clone(),
				runtime: args.runtime.clone(),
				bundled_dir: None,
				transport,
				proxy,
			};
			Some(GuestProcess::spawn(&guest_config).await?)
		}
		_ => {
			info!("no entry script given, waiting for an external guest");
			None
		}
	};

	tokio::signal::ctrl_c().await?;
	info!("shutting down");

	supervisor.shutdown();
	if let Some(guest) = &guest {
		guest.stop().await;
	}
	server.stop();

	Ok(())
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::prelude::*;

	// Support VESPER_LOG_DIR for headless debugging
	if let Some(log_dir) = std::env::var("VESPER_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let pid = std::process::id();
		let log_path = log_dir.join(format!("vesper-exthost.{}.log", pid));

		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
				if verbose {
					EnvFilter::new("vesper_exthost=trace,debug")
				} else {
					EnvFilter::new("vesper_exthost=debug,info")
				}
			});

			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_target(true);

			tracing_subscriber::registry()
				.with(filter)
				.with(file_layer)
				.init();

			tracing::info!(path = ?log_path, "exthost tracing initialized");
			return;
		}
	}

	tracing_subscriber::fmt()
		.with_max_level(if verbose {
			tracing::Level::DEBUG
		} else {
			tracing::Level::INFO
		})
		.init();
}
