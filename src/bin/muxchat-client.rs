//! Interactive client for the muxchat server.
//!
//! Lines typed on stdin are sent to the server; lines the server
//! forwards are printed as they arrive. Sending the quit token (or
//! closing stdin) ends the session.

use chrono::{DateTime, Local};
use clap::Parser;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the chat client
#[derive(Parser, Debug)]
#[command(name = "muxchat-client")]
#[command(version = "0.1.0")]
#[command(about = "Interactive client for a muxchat server", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8888")]
    connect: String,

    /// Prefix received lines with the local time
    #[arg(short, long)]
    timestamps: bool,

    /// Line that ends the session
    #[arg(long, default_value = "quit")]
    quit_token: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Clone)]
struct Options {
    timestamps: bool,
    quit_token: String,
}

/// How a client session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The user sent the quit token.
    Quit,
    /// The server closed the connection.
    ServerClosed,
    /// Stdin reached end of file.
    InputClosed,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let stream = TcpStream::connect(&args.connect).await?;
    info!(server = %args.connect, local = %stream.local_addr()?, "Connected");

    let options = Options {
        timestamps: args.timestamps,
        quit_token: args.quit_token,
    };
    let (server_rd, server_wr) = stream.into_split();
    let end = run_session(
        server_rd,
        server_wr,
        tokio::io::stdin(),
        tokio::io::stdout(),
        &options,
    )
    .await?;

    info!(?end, "Session ended");
    Ok(())
}

/// Pump lines between the user and the server until one side ends.
async fn run_session<R, W, I, O>(
    server_rd: R,
    mut server_wr: W,
    input: I,
    mut output: O,
    options: &Options,
) -> io::Result<SessionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut server_lines = BufReader::new(server_rd).lines();
    let mut input_lines = BufReader::new(input).lines();

    loop {
        tokio::select! {
            biased;

            line = server_lines.next_line() => match line? {
                Some(line) => {
                    let stamp = options.timestamps.then(Local::now);
                    output.write_all(format_incoming(&line, stamp).as_bytes()).await?;
                    output.flush().await?;
                }
                None => return Ok(SessionEnd::ServerClosed),
            },

            line = input_lines.next_line() => match line? {
                Some(line) => {
                    server_wr.write_all(format!("{line}\n").as_bytes()).await?;
                    server_wr.flush().await?;
                    debug!(bytes = line.len(), "Sent line");
                    if line == options.quit_token {
                        server_wr.shutdown().await?;
                        return Ok(SessionEnd::Quit);
                    }
                }
                None => {
                    server_wr.shutdown().await?;
                    return Ok(SessionEnd::InputClosed);
                }
            },
        }
    }
}

fn format_incoming(line: &str, stamp: Option<DateTime<Local>>) -> String {
    match stamp {
        Some(at) => format!("[{}] {line}\n", at.format("%H:%M:%S")),
        None => format!("{line}\n"),
    }
}
