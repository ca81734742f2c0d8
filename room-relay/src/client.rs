use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{ClientFrame, ServerFrame, read_frame_resumable, write_frame},
    room::SYSTEM_OWNER,
};

const HELP: &str = "\
/help                 show this message
/change_room <name>   move to another room, creating it if needed
/change_name <name>   change your display name
/leave_room           go back to the waiting room
/quit                 disconnect from the server
anything else is sent to your current room";

/// A line typed at the client prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Say(String),
    ChangeRoom(String),
    ChangeName(String),
    LeaveRoom,
    Help,
    Quit,
}

impl ShellCommand {
    /// Parses one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if !trimmed.starts_with('/') {
            return Ok(Some(ShellCommand::Say(trimmed.to_string())));
        }

        let (command, argument) = match trimmed.split_once(char::is_whitespace) {
            Some((command, argument)) => (command, argument.trim()),
            None => (trimmed, ""),
        };

        let parsed = match (command.to_lowercase().as_str(), argument.is_empty()) {
            ("/help", _) => ShellCommand::Help,
            ("/quit", _) => ShellCommand::Quit,
            ("/leave_room", _) => ShellCommand::LeaveRoom,
            ("/change_room", false) => ShellCommand::ChangeRoom(argument.to_string()),
            ("/change_name", false) => ShellCommand::ChangeName(argument.to_string()),
            ("/change_room", true) => return Err(anyhow!("usage: /change_room <name>")),
            ("/change_name", true) => return Err(anyhow!("usage: /change_name <name>")),
            _ => return Err(anyhow!("unknown command {command}; try /help")),
        };
        Ok(Some(parsed))
    }

    /// The frame this command puts on the wire, if any.
    pub fn to_frame(&self) -> Option<ClientFrame> {
        match self {
            ShellCommand::Say(text) => Some(ClientFrame::Message { text: text.clone() }),
            ShellCommand::ChangeRoom(room) => Some(ClientFrame::JoinRoom { room: room.clone() }),
            ShellCommand::ChangeName(name) => Some(ClientFrame::ChangeName { name: name.clone() }),
            ShellCommand::LeaveRoom => Some(ClientFrame::QuitRoom),
            ShellCommand::Quit => Some(ClientFrame::Disconnect),
            ShellCommand::Help => None,
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());

    run_client_loop(&mut reader, &mut writer, &mut stdin).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
) -> Result<()> {
    // Unfinished lines from either side wait here while the other side is served.
    let mut server_pending = Vec::new();
    let mut input_pending = Vec::new();

    loop {
        select! {
            server_line = read_frame_resumable(reader, &mut server_pending) => {
                if !handle_server_line(server_line).await? {
                    break;
                }
            }
            input = read_frame_resumable(stdin, &mut input_pending) => {
                if !handle_stdin_input(input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                write_frame(writer, &ClientFrame::Disconnect).await?;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(line: io::Result<Option<String>>) -> Result<bool> {
    let Some(line) = line? else {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    };

    match ServerFrame::decode(&line) {
        Ok(frame) => render_server_frame(frame).await?,
        Err(error) => warn!(%error, %line, "ignoring unreadable server frame"),
    }
    Ok(true)
}

async fn handle_stdin_input(
    input: io::Result<Option<String>>,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let Some(input) = input? else {
        write_frame(writer, &ClientFrame::Disconnect).await?;
        return Ok(false);
    };

    let command = match ShellCommand::parse(&input) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(true),
        Err(error) => {
            write_stderr(&format!("!!! {error}")).await?;
            return Ok(true);
        }
    };

    if command == ShellCommand::Help {
        write_stdout(HELP).await?;
    }
    if let Some(frame) = command.to_frame() {
        write_frame(writer, &frame).await?;
    }
    if command == ShellCommand::Quit {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_server_frame(frame: ServerFrame) -> io::Result<()> {
    match frame {
        ServerFrame::Connected { name } => write_stdout(&format!("*** connected as {name}")).await,
        ServerFrame::Message { owner, body } if owner == SYSTEM_OWNER => {
            write_stdout(&format!("*** {body}")).await
        }
        ServerFrame::Message { owner, body } => write_stdout(&format!("<{owner}> {body}")).await,
        ServerFrame::Error { reason } => write_stderr(&format!("!!! {reason}")).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
