use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

pub mod lrcp;

pub use lrcp::Listener;

/// Accepts sessions forever, reversing every completed line each one
/// delivers.
pub async fn run(mut listener: Listener) -> tokio::io::Result<()> {
    loop {
        let session = listener.accept().await?;
        tokio::spawn(reverse_lines(session));
    }
}

/// Reverses every completed line arriving on the session; an
/// unterminated tail is never echoed back.
async fn reverse_lines(session: DuplexStream) -> tokio::io::Result<()> {
    let (reader, mut writer) = tokio::io::split(session);
    let mut reader = BufReader::new(reader);

    let mut line = Vec::new();
    loop {
        line.clear();
        let rcount = reader.read_until(b'\n', &mut line).await?;
        if rcount == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            break;
        }

        line.pop();
        line.reverse();
        line.push(b'\n');

        writer.write_all(&line).await?;
    }

    Ok(())
}
