//! Just enough RESP to play Sentinel and redis in tests.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Read one command. Returns `None` at end of stream.
///
/// Accepts multibulk requests (`*N` followed by bulk strings) as sent by
/// client libraries, and inline commands as typed into a terminal.
pub async fn read_command<R>(reader: &mut R) -> io::Result<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }

    let line = line.trim_end();
    let Some(count) = line.strip_prefix('*') else {
        return Ok(Some(line.split_whitespace().map(str::to_string).collect()));
    };

    let count: usize = count.parse().map_err(|_| invalid("bad multibulk length"))?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut header = String::new();
        reader.read_line(&mut header).await?;
        let len: usize = header
            .trim_end()
            .strip_prefix('$')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| invalid("bad bulk length"))?;

        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        data.truncate(len);
        args.push(String::from_utf8(data).map_err(|_| invalid("non-utf8 argument"))?);
    }

    Ok(Some(args))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

pub fn simple(s: &str) -> Vec<u8> {
    format!("+{}\r\n", s).into_bytes()
}

pub fn error(s: &str) -> Vec<u8> {
    format!("-{}\r\n", s).into_bytes()
}

pub fn bulk(s: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", s.len(), s).into_bytes()
}

pub fn array(items: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend_from_slice(&bulk(item));
    }
    out
}

pub fn nil_array() -> Vec<u8> {
    b"*-1\r\n".to_vec()
}

/// Encode a command the way client libraries do.
pub fn command(args: &[&str]) -> Vec<u8> {
    array(args)
}
