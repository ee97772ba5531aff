// Copyright 2018-2025 the Deno authors. MIT license.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Error;
use clap::ArgMatches;
use clap::builder::Arg;
use clap::builder::ArgAction;
use clap::builder::Command;
use uv_transport::ConnectionHandler;
use uv_transport::LibuvConnection;
use uv_transport::LibuvThread;
use uv_transport::LibuvTransportOptions;
use uv_transport::Listener;
use uv_transport::UvError;
use uv_transport::UvFunctions;
use uv_transport::bytes::Bytes;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Echo;

impl ConnectionHandler for Echo {
  fn on_connection(&self, connection: &LibuvConnection) {
    log::debug!(
      "Connection {} from {:?}",
      connection.id(),
      connection.remote_endpoint()
    );
  }

  fn on_read(&self, connection: &LibuvConnection, data: &[u8]) {
    if let Err(err) = connection.write(Bytes::copy_from_slice(data)) {
      log::debug!("Connection {} dropped a write: {err}", connection.id());
    }
  }

  fn on_read_fin(&self, connection: &LibuvConnection) {
    if connection.shutdown().is_err() {
      connection.close();
    }
  }

  fn on_error(&self, connection: &LibuvConnection, error: &UvError) {
    log::debug!("Connection {} failed: {error}", connection.id());
  }
}

fn main() -> Result<(), Error> {
  env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or("info"),
  )
  .init();

  let matches = build_cli().get_matches();
  let functions = load_functions(&matches)?;
  let options = transport_options(&matches);
  let host = matches
    .get_one::<String>("host")
    .map(String::as_str)
    .unwrap_or("127.0.0.1");
  let port = matches.get_one::<u16>("port").copied().unwrap_or(5000);
  let endpoint = functions
    .ip_addr(host, port)
    .with_context(|| format!("Invalid listen address {host}:{port}"))?;

  let threads = (0..options.thread_count)
    .map(|i| {
      LibuvThread::start(
        format!("uvecho-{i}"),
        functions.clone(),
        options.clone(),
      )
    })
    .collect::<Result<Vec<_>, _>>()
    .context("Unable to start libuv threads")?;

  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()?;
  let served = runtime.block_on(serve(endpoint, threads.clone()));

  for thread in threads {
    if let Err(err) = thread.stop(STOP_TIMEOUT) {
      log::error!("Failed to stop {}: {err}", thread.name());
    }
  }
  served
}

async fn serve(
  endpoint: std::net::SocketAddr,
  threads: Vec<LibuvThread>,
) -> Result<(), Error> {
  let thread_count = threads.len();
  let listener = Listener::start(endpoint, threads, Arc::new(Echo))
    .await
    .with_context(|| format!("Unable to listen on {endpoint}"))?;
  println!(
    "Echoing on {} with {thread_count} thread(s). Press Ctrl+C to stop.",
    listener.endpoint()
  );
  tokio::signal::ctrl_c().await?;
  log::info!("Shutting down");
  listener.dispose().await?;
  Ok(())
}

fn load_functions(matches: &ArgMatches) -> Result<Arc<UvFunctions>, Error> {
  let Some(path) = matches.get_one::<String>("library") else {
    return Ok(UvFunctions::builtin());
  };
  // SAFETY: the library is trusted to be a libuv build matching the
  // declared entry points.
  let functions = unsafe { UvFunctions::load(path) }
    .with_context(|| format!("Unable to load libuv from {path}"))?;
  log::info!("Using libuv from {path}");
  Ok(Arc::new(functions))
}

fn transport_options(matches: &ArgMatches) -> Arc<LibuvTransportOptions> {
  let mut options = LibuvTransportOptions::default();
  if let Some(threads) = matches.get_one::<usize>("threads") {
    options.thread_count = (*threads).max(1);
  }
  if let Some(backlog) = matches.get_one::<i32>("backlog") {
    options.listen_backlog = *backlog;
  }
  if let Some(no_delay) = matches.get_one::<bool>("no-delay") {
    options.no_delay = *no_delay;
  }
  Arc::new(options)
}

fn build_cli() -> Command {
  Command::new("uvecho")
    .arg(
      Arg::new("host")
        .long("host")
        .value_name("ADDRESS")
        .help("IPv4 or IPv6 address to listen on")
        .default_value("127.0.0.1")
        .value_parser(clap::value_parser!(String)),
    )
    .arg(
      Arg::new("port")
        .long("port")
        .short('p')
        .value_name("PORT")
        .help("Port to listen on, 0 picks a free one")
        .default_value("5000")
        .value_parser(clap::value_parser!(u16)),
    )
    .arg(
      Arg::new("threads")
        .long("threads")
        .value_name("COUNT")
        .help("Number of libuv threads (default: available parallelism, at most 16)")
        .value_parser(clap::value_parser!(usize)),
    )
    .arg(
      Arg::new("backlog")
        .long("backlog")
        .value_name("COUNT")
        .help("Listen backlog")
        .value_parser(clap::value_parser!(i32)),
    )
    .arg(
      Arg::new("no-delay")
        .long("no-delay")
        .value_name("BOOL")
        .help("Set TCP_NODELAY on accepted connections")
        .num_args(0..=1)
        .default_missing_value("true")
        .action(ArgAction::Set)
        .value_parser(clap::value_parser!(bool)),
    )
    .arg(
      Arg::new("library")
        .long("library")
        .value_name("PATH")
        .help("Load libuv from this shared library instead of the built-in loop")
        .value_hint(clap::ValueHint::FilePath)
        .value_parser(clap::value_parser!(String)),
    )
}
