//! `fa-capture`: a thin wire-protocol client. Connects to a running
//! `fa-archiver`, queries its server-info line to learn N, then issues a
//! read request and streams the raw response bytes to stdout.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;

use anyhow::{bail, Context, Result};
use clap::Parser;

/// Stream data out of a running `fa-archiver`.
#[derive(Parser, Debug)]
#[command(name = "fa-capture")]
struct Cli {
    /// Server address, host:port.
    server: String,

    /// Ids to read, in mask grammar.
    mask: String,

    /// Data class: F (raw), D (first-decimation), DD (double-decimation).
    #[arg(short = 'c', long, default_value = "F")]
    class: String,

    /// Flags: '-' or any of T (timestamps), Z (sample counts), A (allow
    /// gaps), G (check id_zero).
    #[arg(short = 'f', long, default_value = "-")]
    flags: String,

    /// Inclusive start timestamp, microseconds since epoch.
    #[arg(long, default_value_t = 0)]
    start: u64,

    /// Inclusive end timestamp, microseconds since epoch. Defaults to the
    /// server's reported last timestamp when omitted.
    #[arg(long)]
    end: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let stream = TcpStream::connect(&cli.server)
        .with_context(|| format!("connecting to {}", cli.server))?;

    let mut writer = stream.try_clone().context("cloning socket for writing")?;
    let mut lines = BufReader::new(stream.try_clone().context("cloning socket for reading")?).lines();

    writer.write_all(b"S\n").context("sending server-info request")?;
    let info_line = lines
        .next()
        .context("connection closed before server-info response")?
        .context("reading server-info response")?;
    let last = parse_field(&info_line, "last").unwrap_or(0);

    let end = cli.end.unwrap_or(last);
    let request = format!(
        "R {} {} {} {} {}\n",
        cli.class, cli.mask, cli.flags, cli.start, end
    );
    writer
        .write_all(request.as_bytes())
        .context("sending read request")?;

    let mut reader = lines.into_inner();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).context("reading from server")?;
        if n == 0 {
            break;
        }
        if buf[0] == b'!' {
            let mut message = String::from_utf8_lossy(&buf[1..n]).into_owned();
            while !message.ends_with('\n') {
                let more = reader.read(&mut buf).context("reading error message")?;
                if more == 0 {
                    break;
                }
                message.push_str(&String::from_utf8_lossy(&buf[..more]));
            }
            bail!("server error: {}", message.trim_end());
        }
        out.write_all(&buf[..n]).context("writing to stdout")?;
    }
    Ok(())
}

fn parse_field(line: &str, key: &str) -> Option<u64> {
    line.split_whitespace()
        .find_map(|tok| tok.strip_prefix(&format!("{key}=")))
        .and_then(|v| v.parse().ok())
}
