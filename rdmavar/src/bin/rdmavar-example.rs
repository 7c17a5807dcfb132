//! rdmavar-example: remote array and counter demo.
//!
//! The server exposes ten `i32`s followed by a counter in its working buffer
//! and logs the counter every second. The client connects, updates both
//! through proxies and prints what it reads back.
//!
//! ```text
//! rdmavar-example server
//! rdmavar-example client <peer>
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use zerocopy::IntoBytes;

use rdmavar::{ConnectionBuilder, DEFAULT_PORT, Mode, RemoteVar, RemoteVec};

type BoxError = Box<dyn std::error::Error>;

/// Elements in the shared array.
const ARRAY_LEN: usize = 10;
/// Byte offset of the counter, right after the array.
const COUNTER_OFFSET: usize = ARRAY_LEN * size_of::<i32>();
const COUNTER_INITIAL: i32 = 42;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "rdmavar-example", about = "Remote variables over RDMA")]
struct Cli {
    /// TCP port to listen on or connect to.
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// What the peer may do to this side's working buffer.
    #[arg(long, global = true, value_enum, default_value_t = ModeArg::Write)]
    mode: ModeArg,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expose the array and counter and wait for one client.
    Server,
    /// Connect to a server and update its values.
    Client {
        /// Server host name or address, optionally with `:port`.
        peer: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Read,
    Write,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Read => Mode::Read,
            ModeArg::Write => Mode::Write,
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Initial working buffer: `0, 10, ..., 90` then the counter.
fn seed_bytes() -> Vec<u8> {
    let mut values = [0i32; ARRAY_LEN + 1];
    for (i, v) in values.iter_mut().take(ARRAY_LEN).enumerate() {
        *v = i as i32 * 10;
    }
    values[ARRAY_LEN] = COUNTER_INITIAL;
    values.as_bytes().to_vec()
}

/// Block SIGINT/SIGTERM in the calling thread (and every thread spawned
/// after it) and wait for them on a dedicated thread. The first signal sets
/// `shutdown`; a second one exits immediately.
fn spawn_signal_waiter(shutdown: Arc<AtomicBool>) -> io::Result<()> {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
    }
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }

    thread::Builder::new()
        .name("signal-waiter".into())
        .spawn(move || {
            loop {
                let mut signal: libc::c_int = 0;
                let ret = unsafe { libc::sigwait(&set, &mut signal) };
                if ret != 0 {
                    let err = io::Error::from_raw_os_error(ret);
                    tracing::warn!(error = %err, "sigwait failed");
                    return;
                }
                if shutdown.swap(true, Ordering::SeqCst) {
                    tracing::warn!(signal, "second signal, exiting");
                    std::process::exit(130);
                }
                tracing::info!(signal, "caught signal, shutting down");
            }
        })?;
    Ok(())
}

fn run_server(cli: &Cli) -> Result<(), BoxError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_waiter(Arc::clone(&shutdown))?;

    tracing::info!(port = cli.port, mode = ?cli.mode, "starting server");
    let conn = ConnectionBuilder::new()
        .mode(cli.mode.into())
        .port(cli.port)
        .seed(seed_bytes())
        .accept()?;

    let local = conn.local_credential();
    tracing::info!(
        array_addr = local.addr,
        counter_addr = local.addr + COUNTER_OFFSET as u64,
        rkey = local.rkey,
        "array and counter exposed"
    );
    tracing::info!(remote = %conn.remote_credential(), "peer region");
    tracing::info!("server waiting, press Ctrl+C to exit");

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        let mut raw = [0u8; size_of::<i32>()];
        conn.read_local(&mut raw, COUNTER_OFFSET)?;
        let counter = i32::from_ne_bytes(raw);
        tracing::info!(counter, "current counter value");
    }

    tracing::info!("cleaning up");
    conn.close();
    Ok(())
}

// =============================================================================
// Client
// =============================================================================

fn run_client(cli: &Cli, peer: &str) -> Result<(), BoxError> {
    tracing::info!(peer, port = cli.port, "connecting");
    let conn = ConnectionBuilder::new()
        .mode(cli.mode.into())
        .port(cli.port)
        .connect(peer)?;

    let remote = conn.remote_credential();
    tracing::info!(%remote, "connected");

    let array = RemoteVec::<i32>::from_credential(&conn, remote, ARRAY_LEN)?;
    let counter = RemoteVar::<i32>::from_credential(&conn, remote, COUNTER_OFFSET as u64)?;

    let (value, values) = (counter.get()?, array.to_vec()?);
    tracing::info!(counter = value, array = ?values, "initial values");

    let old = counter.post_increment()?;
    let now = counter.get()?;
    tracing::info!(old, now, "counter incremented by 1");

    counter.add_assign(10)?;
    let now = counter.get()?;
    tracing::info!(now, "counter incremented by 10");

    array.set(3, 999)?;
    tracing::info!("array[3] = 999");

    // Evaluated left to right: element 2 is read before element 5 is written.
    let doubled = array.get(2)?.wrapping_mul(2);
    array.set(5, doubled)?;
    tracing::info!(value = doubled, "array[5] = array[2] * 2");

    let (value, values) = (counter.get()?, array.to_vec()?);
    tracing::info!(counter = value, array = ?values, "updated values");
    conn.close();
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = rdmavar::logging::init_logging(cli.verbose) {
        eprintln!("{e}");
    }

    match &cli.command {
        Command::Server => {
            if let Err(e) = run_server(&cli) {
                tracing::error!(error = %e, "server error");
            }
        }
        Command::Client { peer } => {
            if let Err(e) = run_client(&cli, peer) {
                tracing::error!(error = %e, "client error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_client_with_flags() {
        let cli = Cli::try_parse_from(["rdmavar-example", "client", "10.0.0.1", "--port", "9000", "--mode", "read"])
            .unwrap();
        assert_eq!(cli.port, 9000);
        assert!(matches!(cli.mode, ModeArg::Read));
        assert!(matches!(cli.command, Command::Client { ref peer } if peer == "10.0.0.1"));
    }

    #[test]
    fn bad_arguments_are_errors() {
        assert!(Cli::try_parse_from(["rdmavar-example"]).is_err());
        assert!(Cli::try_parse_from(["rdmavar-example", "client"]).is_err());
        assert!(Cli::try_parse_from(["rdmavar-example", "bogus"]).is_err());
        assert!(Cli::try_parse_from(["rdmavar-example", "server", "--mode", "rw"]).is_err());
    }

    #[test]
    fn seed_layout() {
        let seed = seed_bytes();
        assert_eq!(seed.len(), COUNTER_OFFSET + 4);
        assert_eq!(&seed[12..16], &30i32.to_ne_bytes());
        assert_eq!(&seed[COUNTER_OFFSET..], &COUNTER_INITIAL.to_ne_bytes());
    }
}
