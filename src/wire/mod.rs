//! Wire Protocol Frontend (spec 6): maps line-oriented textual client
//! requests into [`Reader`] operations and writes framed responses back
//! over the connection.
//!
//! One worker thread per connection (spec 5) — there is no dedicated
//! async runtime in this pipeline, so the listener just spawns a
//! `std::thread` per accepted socket, the same way the sniffer and disk
//! writer are each a dedicated blocking thread.
//!
//! Request grammar implemented here (the distilled protocol left the
//! exact token boundaries unspecified beyond "line-oriented request,
//! binary response"): a request is one line, space-separated fields,
//! first character selects the command:
//!
//! ```text
//! S
//! R <class> <mask> <flags> <start> <end>
//! M <mask>
//! ```
//!
//! `<class>` is `F` (raw), `D` (first-decimation) or `DD`
//! (double-decimation). `<flags>` is `-` or any combination of `T`
//! (prefix timestamp), `Z` (prefix sample count), `A` (allow gaps), `G`
//! (check id_zero). `<start>`/`<end>` are microsecond timestamps,
//! inclusive. Error responses are a single line starting with `!`.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::archive::ArchiveState;
use crate::error::{FaError, Result};
use crate::mask::Mask;
use crate::reader::{sample_offset, DataClass, Reader};
use crate::ring_buffer::Entry;
use crate::transform::variance::DecimatedSlot;

#[derive(Debug, Clone, Copy, Default)]
struct ReadFlags {
    timestamps: bool,
    sample_count: bool,
    allow_gaps: bool,
    check_id0: bool,
}

impl ReadFlags {
    fn parse(text: &str) -> Self {
        let mut flags = ReadFlags::default();
        if text == "-" {
            return flags;
        }
        for c in text.chars() {
            match c {
                'T' => flags.timestamps = true,
                'Z' => flags.sample_count = true,
                'A' => flags.allow_gaps = true,
                'G' => flags.check_id0 = true,
                _ => {}
            }
        }
        flags
    }
}

struct ReadRequest {
    class: DataClass,
    mask: Mask,
    flags: ReadFlags,
    start: u64,
    end: u64,
}

enum Request {
    ServerInfo,
    Read(ReadRequest),
    ModifyMask(Mask),
}

fn parse_request(line: &str, archive_n: usize) -> Result<Request> {
    let line = line.trim();
    let mut fields = line.split_whitespace();
    let command = fields
        .next()
        .ok_or_else(|| FaError::protocol("empty request"))?;

    match command {
        "S" => Ok(Request::ServerInfo),
        "M" => {
            let mask_text = fields
                .next()
                .ok_or_else(|| FaError::protocol("M requires a mask"))?;
            Ok(Request::ModifyMask(Mask::parse(mask_text, archive_n)?))
        }
        "R" => {
            let class_text = fields
                .next()
                .ok_or_else(|| FaError::protocol("R requires a data class"))?;
            let class = match class_text {
                "F" => DataClass::Raw,
                "D" => DataClass::FirstDecimation,
                "DD" => DataClass::DoubleDecimation,
                other => {
                    return Err(FaError::protocol(format!("unknown data class '{other}'")))
                }
            };
            let mask_text = fields
                .next()
                .ok_or_else(|| FaError::protocol("R requires a mask"))?;
            let mask = Mask::parse(mask_text, archive_n)?;
            let flags_text = fields
                .next()
                .ok_or_else(|| FaError::protocol("R requires flags (or '-')"))?;
            let flags = ReadFlags::parse(flags_text);
            let start: u64 = fields
                .next()
                .ok_or_else(|| FaError::protocol("R requires a start timestamp"))?
                .parse()
                .map_err(|_| FaError::protocol("malformed start timestamp"))?;
            let end: u64 = fields
                .next()
                .ok_or_else(|| FaError::protocol("R requires an end timestamp"))?
                .parse()
                .map_err(|_| FaError::protocol("malformed end timestamp"))?;
            if end < start {
                return Err(FaError::protocol("end precedes start"));
            }
            Ok(Request::Read(ReadRequest {
                class,
                mask,
                flags,
                start,
                end,
            }))
        }
        other => Err(FaError::protocol(format!("unknown command '{other}'"))),
    }
}

/// Accept connections on `addr` until `shutdown` is set, spawning one
/// worker thread per client (spec 5).
pub fn serve(addr: &str, archive: Arc<ArchiveState>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let listener = TcpListener::bind(addr)?;
    info!(addr, "wire protocol server listening");

    for incoming in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        match incoming {
            Ok(stream) => {
                let archive = Arc::clone(&archive);
                std::thread::spawn(move || {
                    if let Err(err) = handle_client(stream, &archive) {
                        warn!(%err, "wire client connection ended with an error");
                    }
                });
            }
            Err(err) => warn!(%err, "failed to accept wire protocol connection"),
        }
    }
    Ok(())
}

fn handle_client(stream: TcpStream, archive: &ArchiveState) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let mut writer = stream.try_clone()?;
    let mut lines = BufReader::new(stream).lines();

    while let Some(line) = lines.next() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let archive_n = archive.header.header().n as usize;
        match parse_request(&line, archive_n) {
            Ok(request) => {
                if let Err(err) = dispatch(request, archive, &mut writer) {
                    write_error(&mut writer, &err)?;
                    // Index misses are reported inline and the connection
                    // stays open; anything else (protocol violations, I/O
                    // failures) ends it.
                    if !err.is_index_miss() {
                        break;
                    }
                }
            }
            Err(err) => {
                write_error(&mut writer, &err)?;
                break;
            }
        }
    }
    if let Some(peer) = peer {
        info!(%peer, "wire client disconnected");
    }
    Ok(())
}

fn write_error(writer: &mut impl Write, err: &FaError) -> Result<()> {
    writer.write_all(b"!")?;
    writer.write_all(err.to_string().as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn dispatch(request: Request, archive: &ArchiveState, writer: &mut impl Write) -> Result<()> {
    match request {
        Request::ServerInfo => write_server_info(archive, writer),
        Request::ModifyMask(_) => Err(FaError::protocol(
            "modifying the archive mask after formatting is not supported",
        )),
        Request::Read(req) => serve_read(req, archive, writer),
    }
}

fn write_server_info(archive: &ArchiveState, writer: &mut impl Write) -> Result<()> {
    let reader = Reader::new(archive);
    let header = archive.header.header();
    let first = reader.binary_search(0).map(|b| archive.header.read_data_index(b).timestamp);
    let current = archive.header.current_major_block();
    let last_block = (current + header.major_block_count - 1) % header.major_block_count;
    let last_entry = archive.header.read_data_index(last_block);
    let last = if last_entry.is_initialized() {
        Some(last_entry.end_timestamp())
    } else {
        None
    };
    writeln!(
        writer,
        "N={} D1={} D2={} first={} last={}",
        header.n,
        1u32 << header.d1_log2,
        1u32 << header.d2_log2,
        first.unwrap_or(0),
        last.unwrap_or(0),
    )?;
    Ok(())
}

fn serve_read(req: ReadRequest, archive: &ArchiveState, writer: &mut impl Write) -> Result<()> {
    let reader = Reader::new(archive);
    let ids: Vec<usize> = req.mask.iter_ids().collect();

    if req.class == DataClass::DoubleDecimation {
        return serve_double_decimation_read(&req, &reader, &ids, writer);
    }

    let header = archive.header.header();
    let d1 = 1u32 << header.d1_log2;
    let samples_per_block = match req.class {
        DataClass::Raw => header.major_sample_count,
        DataClass::FirstDecimation => header.major_sample_count / d1,
        DataClass::DoubleDecimation => unreachable!(),
    };

    let start_pos = reader.timestamp_to_block(req.start, req.flags.allow_gaps, samples_per_block)?;
    let mut block = start_pos.block;
    let mut start_offset = start_pos.offset;

    loop {
        let entry = archive.header.read_data_index(block);
        if entry.timestamp > req.end {
            break;
        }

        let end_offset = if req.end < entry.end_timestamp() {
            sample_offset(&entry, req.end, samples_per_block)
                .saturating_add(1)
                .min(samples_per_block)
        } else {
            samples_per_block
        };
        if end_offset <= start_offset {
            break;
        }
        let count = end_offset - start_offset;

        if req.flags.timestamps {
            writer.write_all(&entry.timestamp.to_ne_bytes())?;
        }
        if req.flags.sample_count {
            writer.write_all(&count.to_ne_bytes())?;
        }

        match req.class {
            DataClass::Raw => {
                let columns = reader.read_raw(block, start_offset, count, &ids)?;
                write_columns(writer, &columns)?;
            }
            DataClass::FirstDecimation => {
                let columns = reader.read_first_decimation(block, start_offset, count, &ids, d1)?;
                write_columns(writer, &columns)?;
            }
            DataClass::DoubleDecimation => unreachable!(),
        }
        start_offset = 0;

        if entry.end_timestamp() > req.end {
            break;
        }

        if let Some(gap_block) = reader.find_gap(block, 1, req.flags.check_id0) {
            if !req.flags.allow_gaps {
                return Err(FaError::index("End timestamp too late"));
            }
            block = gap_block;
        } else {
            let count = header.major_block_count;
            let next = (block + 1) % count;
            if next == archive.header.current_major_block() {
                break;
            }
            block = next;
        }
    }
    Ok(())
}

fn serve_double_decimation_read(
    req: &ReadRequest,
    reader: &Reader,
    ids: &[usize],
    writer: &mut impl Write,
) -> Result<()> {
    // DD rows aren't major-block-indexed, so the offset this resolves is
    // meaningless here; only the block index is used as the DD row start.
    let start_pos = reader.timestamp_to_block(req.start, req.flags.allow_gaps, 1)?;
    let rows = reader.read_double_decimation(start_pos.block, 1, ids);
    for index in 0..ids.len() {
        if req.flags.sample_count {
            writer.write_all(&(rows[index].len() as u32).to_ne_bytes())?;
        }
        for slot in &rows[index] {
            write_slot(writer, *slot)?;
        }
    }
    Ok(())
}

fn write_columns<T: AsBytes>(writer: &mut impl Write, columns: &[Vec<T>]) -> Result<()> {
    for column in columns {
        for item in column {
            writer.write_all(item.as_bytes())?;
        }
    }
    Ok(())
}

fn write_slot(writer: &mut impl Write, slot: DecimatedSlot) -> Result<()> {
    writer.write_all(slot.as_bytes())?;
    Ok(())
}

trait AsBytes {
    fn as_bytes(&self) -> &[u8];
}

impl AsBytes for Entry {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: Entry is repr(C), two i32 fields, no padding.
        unsafe {
            std::slice::from_raw_parts(self as *const Entry as *const u8, std::mem::size_of::<Entry>())
        }
    }
}

impl AsBytes for DecimatedSlot {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: DecimatedSlot is repr(C), exactly 32 bytes, no padding.
        unsafe {
            std::slice::from_raw_parts(
                self as *const DecimatedSlot as *const u8,
                std::mem::size_of::<DecimatedSlot>(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_info_request() {
        assert!(matches!(
            parse_request("S", 16).unwrap(),
            Request::ServerInfo
        ));
    }

    #[test]
    fn parses_read_request_with_flags() {
        let req = match parse_request("R F 0-3 TZA 1000 2000", 16).unwrap() {
            Request::Read(r) => r,
            _ => panic!("expected a read request"),
        };
        assert_eq!(req.class, DataClass::Raw);
        assert!(req.flags.timestamps);
        assert!(req.flags.sample_count);
        assert!(req.flags.allow_gaps);
        assert!(!req.flags.check_id0);
        assert_eq!(req.start, 1000);
        assert_eq!(req.end, 2000);
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(parse_request("X", 16).is_err());
    }

    #[test]
    fn rejects_end_before_start() {
        assert!(parse_request("R F 0-3 - 2000 1000", 16).is_err());
    }

    #[test]
    fn modify_mask_request_parses_but_is_rejected_at_dispatch() {
        assert!(matches!(
            parse_request("M 0-3", 16).unwrap(),
            Request::ModifyMask(_)
        ));
    }
}
