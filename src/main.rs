//! CLI entry point (spec §6): `serve` runs the server in the foreground;
//! every other subcommand is a one-shot client against an already-running
//! one.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use prise::config::Config;
use prise::error::{Error, Result};
use prise::ipc::{Client, Request, Response};
use prise::session::PtyId;

#[derive(Parser)]
#[command(name = "prise", version, about = "A terminal multiplexer server.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server in the foreground until SIGINT/SIGTERM.
    Serve,
    #[command(subcommand)]
    Pty(PtyCommand),
    #[command(subcommand)]
    Session(SessionCommand),
}

#[derive(Subcommand)]
enum PtyCommand {
    /// List every live PTY across all sessions.
    List,
    /// Terminate a PTY's shell process by id.
    Kill { id: u32 },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// List all persisted session names.
    List,
    /// Permanently delete a session and its persisted state.
    Delete { name: String },
    /// Rename a session.
    Rename { old: String, new: String },
    /// Attach to a session, creating it if it doesn't exist.
    Attach { name: Option<String> },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Serve => {
            let config = Config::load()?;
            prise::logging::init(&config.log_path, true)?;
            prise::server::run(config).await
        }
        Command::Pty(cmd) => run_pty_command(cmd).await,
        Command::Session(cmd) => run_session_command(cmd).await,
    }
}

async fn connect() -> Result<Client> {
    let config = Config::load()?;
    Client::connect(&config.socket_path).await
}

async fn run_pty_command(cmd: PtyCommand) -> Result<()> {
    let mut client = connect().await?;
    match cmd {
        PtyCommand::List => {
            match client.call(Request::ListPtys).await? {
                Response::PtyList { ptys } => {
                    for p in ptys {
                        println!("{}\tsession={}\tpane={}\tpid={}", p.pty.0, p.session, p.pane.0, p.child_pid);
                    }
                    Ok(())
                }
                other => unexpected_response(other),
            }
        }
        PtyCommand::Kill { id } => {
            ack_or_error(client.call(Request::KillPty { pty: PtyId::from_raw(id) }).await?)
        }
    }
}

async fn run_session_command(cmd: SessionCommand) -> Result<()> {
    let mut client = connect().await?;
    match cmd {
        SessionCommand::List => match client.call(Request::ListSessions).await? {
            Response::SessionList { names } => {
                for name in names {
                    println!("{name}");
                }
                Ok(())
            }
            other => unexpected_response(other),
        },
        SessionCommand::Delete { name } => ack_or_error(client.call(Request::DeleteSession { name }).await?),
        SessionCommand::Rename { old, new } => {
            ack_or_error(client.call(Request::RenameSession { name: old, new_name: new }).await?)
        }
        SessionCommand::Attach { name } => match client.call(Request::Attach { session: name }).await? {
            Response::Hello { session, .. } => {
                println!("attached to {}", session.name);
                Ok(())
            }
            other => unexpected_response(other),
        },
    }
}

fn ack_or_error(response: Response) -> Result<()> {
    match response {
        Response::Ack => Ok(()),
        other => unexpected_response(other),
    }
}

fn unexpected_response(response: Response) -> Result<()> {
    match response {
        Response::Error { kind, message } => Err(prise::error::Error { kind, message, lock_held: false }),
        other => Err(Error::protocol_violation(format!("unexpected response: {other:?}"))),
    }
}
