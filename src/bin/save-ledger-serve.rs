use std::{
    io::{BufRead, BufReader, BufWriter, Write},
    net::{TcpListener, TcpStream},
    path::PathBuf,
    process,
    sync::Arc,
    thread,
};

use clap::Parser;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use save_ledger::{
    config::{init_tracing, Config},
    rpc,
    store::StateFile,
    InMemoryToken, Ledger,
};

/// Serves one ledger over line-delimited JSON on TCP.
///
/// Each line is a request such as `{"op":"deposit","caller":"alice","amount":10}`;
/// each reply is one JSON line tagged by `status`.
#[derive(Parser)]
#[command(name = "save-ledger-serve", version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7878")]
    bind: String,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Persist state after every successful mutation
    #[arg(long)]
    persist: bool,
}

struct Shared {
    ledger: Ledger<InMemoryToken>,
    state_path: Option<PathBuf>,
    save_lock: Mutex<()>,
}

impl Shared {
    fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let _guard = self.save_lock.lock();
        if let Err(err) = StateFile::capture(&self.ledger).save(path) {
            error!(error = %err, "could not persist state");
        }
    }
}

fn serve_connection(shared: &Shared, stream: TcpStream) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    debug!(%peer, "connection opened");

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (reply, changed) = rpc::handle_line(&shared.ledger, &line);
        if changed {
            shared.persist();
        }
        writer.write_all(reply.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }

    debug!(%peer, "connection closed");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(2);
        }
    };
    init_tracing(&config.log_filter);

    let state = match StateFile::load_or_empty(&config.state_path, &config.custody_account) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(2);
        }
    };
    let ledger = match state.into_ledger() {
        Ok(ledger) => ledger,
        Err(err) => {
            eprintln!("error[{}]: {err}", err.code());
            process::exit(2);
        }
    };

    let listener = match TcpListener::bind(&cli.bind) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("error: cannot bind {}: {err}", cli.bind);
            process::exit(2);
        }
    };
    info!(
        bind = %cli.bind,
        custody = %ledger.custody(),
        persist = cli.persist,
        "serving ledger"
    );

    let shared = Arc::new(Shared {
        ledger,
        state_path: cli.persist.then(|| config.state_path.clone()),
        save_lock: Mutex::new(()),
    });

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            if let Err(err) = serve_connection(&shared, stream) {
                debug!(error = %err, "connection dropped");
            }
        });
    }
}
