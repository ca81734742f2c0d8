use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_client_chats_with_raw_peer() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("room_relay");

    let (mut server_child, mut server_stdout) = spawn_server(&binary, 2).await?;
    let addr = read_server_addr(&mut server_stdout).await?;

    // Drain additional server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let mut alice = spawn_client(&binary, &addr).await?;
    let welcome = read_line_expect(&mut alice.stdout, "waiting for alice welcome").await?;
    assert_eq!(welcome, "*** connected as Client-0");

    // A raw protocol peer joins the same room.
    let (mut bob_reader, mut bob_writer) = connect_raw(&addr).await?;
    assert_eq!(
        read_line_expect(&mut bob_reader, "waiting for bob welcome").await?,
        "CONNECTED;Client-1"
    );
    let alice_sees_bob =
        read_line_expect(&mut alice.stdout, "waiting for alice join notice").await?;
    assert_eq!(
        alice_sees_bob,
        "*** Client `Client-1` has joined the room `waiting room`"
    );

    // Typed text becomes a MESSAGE frame owned by the client's name.
    alice.send_line("Hello from Alice").await?;
    assert_eq!(
        read_line_expect(&mut bob_reader, "waiting for bob to hear alice").await?,
        "MESSAGE;Client-0|Hello from Alice"
    );

    send_raw(&mut bob_writer, "MESSAGE;Hi Alice!").await?;
    assert_eq!(
        read_line_expect(&mut alice.stdout, "waiting for alice to hear bob").await?,
        "<Client-1> Hi Alice!"
    );

    // Renaming through the shell changes what the raw peer sees.
    alice.send_line("/change_name Alice").await?;
    assert_eq!(
        read_line_expect(&mut bob_reader, "waiting for rename notice").await?,
        "MESSAGE;Server|User Client-0 changed their name to Alice"
    );

    // A third connection does not fit.
    let (mut carol_reader, _carol_writer) = connect_raw(&addr).await?;
    assert_eq!(
        read_line_expect(&mut carol_reader, "waiting for carol rejection").await?,
        "ERROR;Server is full"
    );

    alice.send_line("/quit").await?;
    assert_eq!(
        read_line_expect(&mut alice.stdout, "waiting for alice quit confirmation").await?,
        "*** leaving chat"
    );
    assert_eq!(
        read_line_expect(&mut bob_reader, "waiting for bob to see alice leave").await?,
        "MESSAGE;Server|Client `Alice` has left the room `waiting room`"
    );

    ensure_success(&mut alice.child, "alice client").await?;

    // The server stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_server(binary: &Path, capacity: usize) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--capacity")
        .arg(capacity.to_string())
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("server did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("server banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--server")
        .arg(addr)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn client")?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    Ok(ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn connect_raw(addr: &str) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn send_raw(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_line_expect<R>(reader: &mut R, description: &str) -> Result<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .map_err(|_| anyhow!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
