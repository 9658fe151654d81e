//! Receives a message from an SMTP client into a temp file.
//!
//! The dialog is deliberately lenient: it tracks only enough state to
//! know the envelope and where the message data starts and ends. The
//! reply to DATA is left to the session, which answers once it knows
//! whether the message was rejected or what the upstream said.
use crate::dispatcher::MAX_LINE_LEN;
use crate::task::TempStaging;
use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Message data is read in pieces of at most this size
const DATA_CHUNK: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub hostname: String,
    pub temp_dir: PathBuf,
    pub max_message_size: u64,
    pub timeout: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub helo: Option<String>,
    /// Empty for the null reverse-path
    pub sender: String,
    pub recipients: Vec<String>,
}

#[derive(Debug)]
pub struct CapturedMessage {
    pub envelope: Envelope,
    pub staging: TempStaging,
}

/// Runs the inbound dialog up to the end of the message data.
/// Returns the stream along with the captured message, or None if the
/// client quit or disconnected first.
pub async fn receive_message<S>(
    stream: S,
    config: &CaptureConfig,
) -> anyhow::Result<(S, Option<CapturedMessage>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut helo: Option<String> = None;
    let mut sender: Option<String> = None;
    let mut recipients: Vec<String> = vec![];

    reply(
        &mut reader,
        &format!("220 {} ESMTP smtp-relay", config.hostname),
    )
    .await?;

    loop {
        let Some(line) = read_command(&mut reader, config.timeout).await? else {
            return Ok((reader.into_inner(), None));
        };
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "HELO" | "EHLO" => {
                helo.replace(args.to_string());
                sender = None;
                recipients.clear();
                if verb == "EHLO" {
                    reply(
                        &mut reader,
                        &format!(
                            "250-{}\r\n250 SIZE {}",
                            config.hostname, config.max_message_size
                        ),
                    )
                    .await?;
                } else {
                    reply(&mut reader, &format!("250 {}", config.hostname)).await?;
                }
            }
            "MAIL" => {
                if sender.is_some() {
                    reply(&mut reader, "503 5.5.1 Nested MAIL command").await?;
                    continue;
                }
                match path_argument(args, "FROM:") {
                    Some(path) => {
                        sender.replace(path);
                        reply(&mut reader, "250 2.1.0 OK").await?;
                    }
                    None => reply(&mut reader, "501 5.5.4 Syntax: MAIL FROM:<address>").await?,
                }
            }
            "RCPT" => {
                if sender.is_none() {
                    reply(&mut reader, "503 5.5.1 Need MAIL command first").await?;
                    continue;
                }
                match path_argument(args, "TO:") {
                    Some(path) if !path.is_empty() => {
                        recipients.push(path);
                        reply(&mut reader, "250 2.1.5 OK").await?;
                    }
                    _ => reply(&mut reader, "501 5.5.4 Syntax: RCPT TO:<address>").await?,
                }
            }
            "DATA" => {
                if recipients.is_empty() {
                    reply(&mut reader, "503 5.5.1 Need RCPT command first").await?;
                    continue;
                }
                reply(&mut reader, "354 End data with <CR><LF>.<CR><LF>").await?;

                let mut staging = TempStaging::create(&config.temp_dir)?;
                let complete = read_data(&mut reader, &mut staging, config).await?;
                if !complete {
                    tracing::debug!("message exceeded {} bytes", config.max_message_size);
                    reply(&mut reader, "552 5.3.4 Message size exceeds fixed limit").await?;
                    sender = None;
                    recipients.clear();
                    continue;
                }
                staging.finish()?;

                let envelope = Envelope {
                    helo,
                    sender: sender.unwrap_or_default(),
                    recipients,
                };
                return Ok((
                    reader.into_inner(),
                    Some(CapturedMessage { envelope, staging }),
                ));
            }
            "RSET" => {
                sender = None;
                recipients.clear();
                reply(&mut reader, "250 2.0.0 OK").await?;
            }
            "NOOP" => reply(&mut reader, "250 2.0.0 OK").await?,
            "QUIT" => {
                reply(&mut reader, "221 2.0.0 Bye").await?;
                return Ok((reader.into_inner(), None));
            }
            _ => reply(&mut reader, "502 5.5.2 Command not recognized").await?,
        }
    }
}

async fn reply<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &mut BufReader<S>,
    text: &str,
) -> anyhow::Result<()> {
    let stream = reader.get_mut();
    stream
        .write_all(format!("{text}\r\n").as_bytes())
        .await
        .context("writing reply to client")?;
    stream.flush().await.context("flushing reply to client")
}

/// Reads one command line without its line ending.
/// Returns None at end of stream.
async fn read_command<S: AsyncRead + Unpin>(
    reader: &mut BufReader<S>,
    timeout: Duration,
) -> anyhow::Result<Option<String>> {
    let mut line = vec![];
    let mut limited = (&mut *reader).take(MAX_LINE_LEN as u64);
    let read = limited.read_until(b'\n', &mut line);
    let n = tokio::time::timeout(timeout, read)
        .await
        .with_context(|| format!("client timed out after {timeout:?}"))?
        .context("reading command from client")?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with(b"\n") {
        anyhow::bail!("command line exceeds {MAX_LINE_LEN} bytes");
    }
    let line = String::from_utf8_lossy(&line);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Copies message data verbatim into `staging` up to the lone `.`
/// terminator line, which is not copied.
/// Returns false if the size limit was exceeded; in that case the
/// remaining data was read and discarded.
async fn read_data<S: AsyncRead + Unpin>(
    reader: &mut BufReader<S>,
    staging: &mut TempStaging,
    config: &CaptureConfig,
) -> anyhow::Result<bool> {
    let mut at_line_start = true;
    let mut overflow = false;
    let mut chunk = vec![];

    loop {
        chunk.clear();
        let mut limited = (&mut *reader).take(DATA_CHUNK);
        let read = limited.read_until(b'\n', &mut chunk);
        let n = tokio::time::timeout(config.timeout, read)
            .await
            .with_context(|| format!("client timed out after {:?} in DATA", config.timeout))?
            .context("reading message data from client")?;
        if n == 0 {
            anyhow::bail!("client disconnected during DATA");
        }

        if at_line_start && (chunk == b".\r\n" || chunk == b".\n") {
            return Ok(!overflow);
        }
        at_line_start = chunk.ends_with(b"\n");

        if overflow {
            continue;
        }
        if staging.size + chunk.len() as u64 > config.max_message_size {
            overflow = true;
            continue;
        }
        staging.append(&chunk)?;
    }
}

/// Extracts the address from `FROM:<addr> params` style arguments
fn path_argument(args: &str, prefix: &str) -> Option<String> {
    let head = args.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = args[prefix.len()..].trim_start();
    if let Some(rest) = rest.strip_prefix('<') {
        let end = rest.find('>')?;
        return Some(rest[..end].to_string());
    }
    rest.split_whitespace().next().map(|s| s.to_string())
}
