use std::{
    error::Error,
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use iproto::{Client, ClientConfig, Command, CommandError, prompt};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Connection string, `[user[:password]@]host:port`
    uri: Option<String>,
    /// TOML configuration file; takes precedence over the connection string
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Ping the server until interrupted instead of opening a prompt
    #[arg(short, long)]
    monitor: bool,
    /// Milliseconds between pings in monitor mode
    #[arg(long, default_value_t = 1000)]
    interval: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let config = match (&cli.config, &cli.uri) {
        (Some(path), _) => ClientConfig::from_file(path)?,
        (None, Some(uri)) => uri.parse()?,
        (None, None) => return Err("either a connection string or --config is required".into()),
    };

    if cli.monitor {
        monitor(Client::new(config)?, Duration::from_millis(cli.interval))
    } else {
        repl(Client::connect(config)?)
    }
}

fn monitor(client: Client, interval: Duration) -> Result<(), Box<dyn Error>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    let mut sent = 0u64;
    let mut failed = 0u64;
    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        sent += 1;
        match client.ping() {
            Ok(()) => println!("ping {sent}: {:?}", started.elapsed()),
            Err(e) => {
                failed += 1;
                eprintln!("ping {sent}: {e}");
            }
        }
        thread::sleep(interval);
    }

    println!("{sent} pings, {failed} failed");
    client.dispose();
    Ok(())
}

fn repl(client: Client) -> Result<(), Box<dyn Error>> {
    let stdin = io::stdin();
    let stdout = io::stdout();

    loop {
        let reader = stdin.lock();
        let writer = StdOut {
            inner: stdout.lock(),
        };

        let cmd = match prompt(reader, writer) {
            Ok(c) => c,
            Err(CommandError::Empty) => continue,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        if let Command::Exit = cmd {
            break;
        }

        match cmd.run(&client) {
            Ok(None) => {}
            Ok(Some(out)) => println!("{out}"),
            Err(e) => eprintln!("error: {e}"),
        }
    }

    client.dispose();
    Ok(())
}

/// Stdout for the REPL. The `> ` marker has no newline, so each write is flushed
/// before the shell blocks reading the next command.
struct StdOut<W: io::Write> {
    inner: W,
}

impl<W: io::Write> io::Write for StdOut<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.inner.write(buf);
        if res.is_ok() {
            self.inner.flush()?
        }
        res
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
