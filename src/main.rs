use std::{path::PathBuf, process};

use clap::{Args, Parser, Subcommand};

use save_ledger::{
    config::{init_tracing, Config, ConfigError},
    rpc::{self, Request, Response, RpcError},
    sim::{self, SimError, SimParams},
    store::{StateFile, StoreError},
    AccountId, Amount,
};

//==================== arguments ====================//

#[derive(Parser)]
#[command(
    name = "save-ledger",
    version,
    about = "Custodial savings ledger: deposit a token, withdraw up to your balance"
)]
struct Cli {
    /// JSON config file (state_path, custody_account, log_filter)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State file; wins over the config file and SAVE_LEDGER_STATE
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Ledger(LedgerCommand),
    /// Seeded random workload against a fresh in-memory ledger
    Simulate {
        #[arg(long, default_value_t = SimParams::default().seed)]
        seed: u64,
        #[arg(long, default_value_t = SimParams::default().accounts)]
        accounts: usize,
        #[arg(long, default_value_t = SimParams::default().steps)]
        steps: usize,
        #[arg(long, default_value_t = SimParams::default().float)]
        float: Amount,
    },
}

#[derive(Subcommand)]
enum LedgerCommand {
    /// Mint tokens to an account (in-memory token faucet)
    Mint {
        #[arg(long)]
        to: AccountId,
        #[arg(long)]
        amount: Amount,
    },
    /// Allow the ledger to pull up to AMOUNT from the caller
    Approve(CallerAmount),
    /// Save tokens into the ledger
    Deposit(CallerAmount),
    /// Take saved tokens back out
    Withdraw(CallerAmount),
    /// Saved balance of an account
    Balance {
        #[arg(long)]
        account: AccountId,
    },
    /// Tokens held in custody by the ledger
    ContractBalance,
    /// Event log as JSON
    Events {
        #[arg(long, default_value_t = 0)]
        since: usize,
    },
    /// Full ledger snapshot as JSON
    Snapshot,
}

#[derive(Args)]
struct CallerAmount {
    /// Identity the request is made as
    #[arg(long)]
    caller: AccountId,
    #[arg(long)]
    amount: Amount,
}

//==================== errors ====================//

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error("cannot encode output: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Rpc(_) => 1,
            CliError::Sim(_) => 3,
            _ => 2,
        }
    }
}

//==================== commands ====================//

fn into_request(command: LedgerCommand) -> Request {
    match command {
        LedgerCommand::Mint { to, amount } => Request::Mint { to, amount },
        LedgerCommand::Approve(CallerAmount { caller, amount }) => Request::Approve { caller, amount },
        LedgerCommand::Deposit(CallerAmount { caller, amount }) => Request::Deposit { caller, amount },
        LedgerCommand::Withdraw(CallerAmount { caller, amount }) => Request::Withdraw { caller, amount },
        LedgerCommand::Balance { account } => Request::Balance { account },
        LedgerCommand::ContractBalance => Request::ContractBalance,
        LedgerCommand::Events { since } => Request::Events { since },
        LedgerCommand::Snapshot => Request::Snapshot,
    }
}

fn print_response(response: &Response) -> Result<(), CliError> {
    match response {
        Response::Done => println!("ok"),
        Response::Balance { balance, .. } => println!("{balance}"),
        Response::ContractBalance { balance, .. } => println!("{balance}"),
        Response::Events { events, .. } => println!("{}", serde_json::to_string_pretty(events)?),
        Response::Snapshot { snapshot } => println!("{}", serde_json::to_string_pretty(snapshot)?),
    }
    Ok(())
}

fn run(cli: Cli, mut config: Config) -> Result<(), CliError> {
    if let Some(state) = cli.state {
        config.state_path = state;
    }

    let command = match cli.command {
        Command::Ledger(command) => command,
        Command::Simulate {
            seed,
            accounts,
            steps,
            float,
        } => {
            let report = sim::run(SimParams {
                seed,
                accounts,
                steps,
                float,
            })?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
    };

    let request = into_request(command);
    let mutating = request.is_mutating();
    let response = StateFile::transact(
        &config.state_path,
        &config.custody_account,
        mutating,
        |ledger| rpc::dispatch(ledger, request).map_err(CliError::from),
    )?;
    print_response(&response)
}

//==================== main ====================//

fn main() {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            let err = CliError::from(err);
            eprintln!("error: {err}");
            process::exit(err.exit_code());
        }
    };
    init_tracing(&config.log_filter);

    if let Err(err) = run(cli, config) {
        match &err {
            CliError::Rpc(inner) => eprintln!("error[{}]: {inner}", inner.code()),
            other => eprintln!("error: {other}"),
        }
        process::exit(err.exit_code());
    }
}
