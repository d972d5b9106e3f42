// src/transport.rs - framed line protocol over any byte stream
//
// Newline-terminated UTF-8 lines, with a binary control channel: a line
// whose first byte is `!` carries a fixed-length binary frame instead of
// text. Outbound frames are `!` + payload + newline.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::pipeline::{Message, Port, Rx, StageError, Tx};

pub const CONTROL_CHAR: u8 = b'!';

/// Fixed length of an inbound binary control frame (device status).
pub const CONTROL_LINE_LENGTH: usize = 5;

/// Bridge a byte stream and a pipeline port: inbound bytes become `Line`
/// and `Frame` messages, outbound messages are framed back onto the wire.
/// Returns when the stream hits EOF or the pipeline side closes.
pub async fn line_pipe<R, W>(reader: R, writer: W, port: Port) -> Result<(), StageError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (rx, tx) = port.split();
    tokio::select! {
        res = read_loop(BufReader::new(reader), tx) => res,
        res = write_loop(writer, rx) => res,
    }
}

async fn read_loop<R>(mut reader: BufReader<R>, tx: Tx) -> Result<(), StageError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut first = [0u8; 1];
        match reader.read_exact(&mut first).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if first[0] == CONTROL_CHAR {
            let mut frame = vec![0u8; CONTROL_LINE_LENGTH];
            reader.read_exact(&mut frame).await?;
            tx.send(Message::Frame(frame)).await?;
        } else {
            let mut buf = vec![first[0]];
            if first[0] != b'\n' {
                reader.read_until(b'\n', &mut buf).await?;
            }
            let line = String::from_utf8_lossy(&buf).trim().to_string();
            if !line.is_empty() {
                tx.send(Message::Line(line)).await?;
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: Rx) -> Result<(), StageError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        match msg {
            Message::Frame(bytes) => {
                let mut out = Vec::with_capacity(bytes.len() + 2);
                out.push(CONTROL_CHAR);
                out.extend_from_slice(&bytes);
                out.push(b'\n');
                writer.write_all(&out).await?;
            }
            Message::Line(line) => {
                writer.write_all(line.trim().as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            other => {
                return Err(StageError::Fatal(format!(
                    "unsupported message at transport: {other:?}"
                )));
            }
        }
        writer.flush().await?;
    }
    Ok(())
}
