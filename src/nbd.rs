//! Minimal NBD client
//!
//! Speaks the fixed-newstyle handshake over a unix socket, enough to drive
//! a local read-only qemu-nbd export: GO, structured replies,
//! base:allocation meta context, and the READ / BLOCK_STATUS commands.
//! This is the seam through which qcow2 images expose their logical byte
//! stream and allocation map.

use crate::error::{Error, Result};
use crate::extent::Extent;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

const NBD_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
const IHAVEOPT: u64 = 0x49484156454f5054; // "IHAVEOPT"
const REP_MAGIC: u64 = 0x0003e889045565a9;
const REQUEST_MAGIC: u32 = 0x25609513;
const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

const FLAG_FIXED_NEWSTYLE: u16 = 1;
const FLAG_NO_ZEROES: u16 = 2;

const OPT_GO: u32 = 7;
const OPT_STRUCTURED_REPLY: u32 = 8;
const OPT_SET_META_CONTEXT: u32 = 10;

const REP_ACK: u32 = 1;
const REP_INFO: u32 = 3;
const REP_META_CONTEXT: u32 = 4;
const REP_ERR_BIT: u32 = 1 << 31;

const INFO_EXPORT: u16 = 0;

const CMD_READ: u16 = 0;
const CMD_BLOCK_STATUS: u16 = 7;

const REPLY_TYPE_NONE: u16 = 0;
const REPLY_TYPE_OFFSET_DATA: u16 = 1;
const REPLY_TYPE_OFFSET_HOLE: u16 = 2;
const REPLY_TYPE_BLOCK_STATUS: u16 = 5;
const REPLY_FLAG_DONE: u16 = 1;
const REPLY_TYPE_ERR_BIT: u16 = 1 << 15;

const STATE_HOLE: u32 = 1;
const STATE_ZERO: u32 = 2;

const BASE_ALLOCATION: &str = "base:allocation";

pub struct NbdClient {
    stream: UnixStream,
    export_size: u64,
    structured: bool,
    meta_context: Option<u32>,
    next_handle: u64,
}

impl NbdClient {
    /// Connect and negotiate the default export.
    pub fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).map_err(|source| Error::SourceUnavailable {
            path: socket.to_path_buf(),
            source,
        })?;
        let mut client = NbdClient {
            stream,
            export_size: 0,
            structured: false,
            meta_context: None,
            next_handle: 1,
        };
        client.handshake()?;
        Ok(client)
    }

    pub fn export_size(&self) -> u64 {
        self.export_size
    }

    pub fn has_block_status(&self) -> bool {
        self.structured && self.meta_context.is_some()
    }

    fn handshake(&mut self) -> Result<()> {
        let magic = self.read_u64()?;
        if magic != NBD_MAGIC {
            return Err(Error::protocol("bad NBD server magic"));
        }
        let opt_magic = self.read_u64()?;
        if opt_magic != IHAVEOPT {
            return Err(Error::protocol("server does not speak newstyle NBD"));
        }
        let server_flags = self.read_u16()?;
        if server_flags & FLAG_FIXED_NEWSTYLE == 0 {
            return Err(Error::protocol("server lacks fixed newstyle handshake"));
        }
        let client_flags = (FLAG_FIXED_NEWSTYLE | (server_flags & FLAG_NO_ZEROES)) as u32;
        self.stream.write_all(&client_flags.to_be_bytes())?;

        // Structured replies and the allocation context are both optional;
        // without them we degrade to full-copy extent reporting.
        self.structured = self.negotiate_structured()?;
        if self.structured {
            self.meta_context = self.negotiate_meta_context()?;
        }
        self.negotiate_go()?;
        Ok(())
    }

    fn send_option(&mut self, option: u32, data: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(16 + data.len());
        buf.extend_from_slice(&IHAVEOPT.to_be_bytes());
        buf.extend_from_slice(&option.to_be_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(data);
        self.stream.write_all(&buf)?;
        Ok(())
    }

    /// Read one option reply: (reply type, payload).
    fn read_option_reply(&mut self, option: u32) -> Result<(u32, Vec<u8>)> {
        let magic = self.read_u64()?;
        if magic != REP_MAGIC {
            return Err(Error::protocol("bad option reply magic"));
        }
        let echoed = self.read_u32()?;
        if echoed != option {
            return Err(Error::protocol("option reply for wrong option"));
        }
        let reply_type = self.read_u32()?;
        let length = self.read_u32()? as usize;
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload)?;
        Ok((reply_type, payload))
    }

    fn negotiate_structured(&mut self) -> Result<bool> {
        self.send_option(OPT_STRUCTURED_REPLY, &[])?;
        let (reply, _) = self.read_option_reply(OPT_STRUCTURED_REPLY)?;
        Ok(reply == REP_ACK)
    }

    fn negotiate_meta_context(&mut self) -> Result<Option<u32>> {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes()); // default export name
        data.extend_from_slice(&1u32.to_be_bytes()); // one query
        data.extend_from_slice(&(BASE_ALLOCATION.len() as u32).to_be_bytes());
        data.extend_from_slice(BASE_ALLOCATION.as_bytes());
        self.send_option(OPT_SET_META_CONTEXT, &data)?;

        let mut context = None;
        loop {
            let (reply, payload) = self.read_option_reply(OPT_SET_META_CONTEXT)?;
            if reply == REP_ACK {
                return Ok(context);
            }
            if reply == REP_META_CONTEXT {
                if payload.len() < 4 {
                    return Err(Error::protocol("short meta context reply"));
                }
                context = Some(u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]));
            } else if reply & REP_ERR_BIT != 0 {
                // Server refuses the context; proceed without block status.
                return Ok(None);
            }
        }
    }

    fn negotiate_go(&mut self) -> Result<()> {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes()); // default export name
        data.extend_from_slice(&0u16.to_be_bytes()); // no info requests
        self.send_option(OPT_GO, &data)?;

        loop {
            let (reply, payload) = self.read_option_reply(OPT_GO)?;
            if reply == REP_ACK {
                if self.export_size == 0 {
                    return Err(Error::protocol("server sent no export info"));
                }
                return Ok(());
            }
            if reply & REP_ERR_BIT != 0 {
                return Err(Error::Protocol(format!(
                    "export refused: {}",
                    String::from_utf8_lossy(&payload)
                )));
            }
            if reply == REP_INFO && payload.len() >= 12 {
                let info_type = u16::from_be_bytes([payload[0], payload[1]]);
                if info_type == INFO_EXPORT {
                    self.export_size = u64::from_be_bytes([
                        payload[2], payload[3], payload[4], payload[5], payload[6], payload[7],
                        payload[8], payload[9],
                    ]);
                }
            }
        }
    }

    fn send_request(&mut self, cmd: u16, offset: u64, length: u32) -> Result<u64> {
        let handle = self.next_handle;
        self.next_handle += 1;
        let mut buf = Vec::with_capacity(28);
        buf.extend_from_slice(&REQUEST_MAGIC.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes()); // command flags
        buf.extend_from_slice(&cmd.to_be_bytes());
        buf.extend_from_slice(&handle.to_be_bytes());
        buf.extend_from_slice(&offset.to_be_bytes());
        buf.extend_from_slice(&length.to_be_bytes());
        self.stream.write_all(&buf)?;
        Ok(handle)
    }

    /// Read a simple reply header and check its error field.
    fn read_simple_reply(&mut self, handle: u64) -> Result<()> {
        let magic = self.read_u32()?;
        if magic != SIMPLE_REPLY_MAGIC {
            return Err(Error::protocol("bad simple reply magic"));
        }
        let errno = self.read_u32()?;
        let echoed = self.read_u64()?;
        if echoed != handle {
            return Err(Error::protocol("reply for wrong handle"));
        }
        if errno != 0 {
            return Err(Error::Protocol(format!("NBD error {errno}")));
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let handle = self.send_request(CMD_READ, offset, buf.len() as u32)?;
        if !self.structured {
            self.read_simple_reply(handle)?;
            self.stream.read_exact(buf)?;
            return Ok(());
        }

        // Structured read: offset-data and offset-hole chunks until done.
        loop {
            let (flags, reply_type, echoed, mut payload) = self.read_chunk()?;
            if echoed != handle {
                return Err(Error::protocol("reply for wrong handle"));
            }
            if reply_type & REPLY_TYPE_ERR_BIT != 0 {
                return Err(Error::Protocol(format!(
                    "structured read error chunk {reply_type:#x}"
                )));
            }
            match reply_type {
                REPLY_TYPE_NONE => {}
                REPLY_TYPE_OFFSET_DATA => {
                    if payload.len() < 8 {
                        return Err(Error::protocol("short offset-data chunk"));
                    }
                    let at = u64::from_be_bytes(payload[..8].try_into().unwrap());
                    let data = payload.split_off(8);
                    let rel = at
                        .checked_sub(offset)
                        .ok_or_else(|| Error::protocol("offset-data chunk out of range"))?
                        as usize;
                    if rel + data.len() > buf.len() {
                        return Err(Error::protocol("offset-data chunk out of range"));
                    }
                    buf[rel..rel + data.len()].copy_from_slice(&data);
                }
                REPLY_TYPE_OFFSET_HOLE => {
                    if payload.len() < 12 {
                        return Err(Error::protocol("short offset-hole chunk"));
                    }
                    let at = u64::from_be_bytes(payload[..8].try_into().unwrap());
                    let len = u32::from_be_bytes(payload[8..12].try_into().unwrap()) as usize;
                    let rel = at
                        .checked_sub(offset)
                        .ok_or_else(|| Error::protocol("offset-hole chunk out of range"))?
                        as usize;
                    if rel + len > buf.len() {
                        return Err(Error::protocol("offset-hole chunk out of range"));
                    }
                    buf[rel..rel + len].fill(0);
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected read chunk type {other}"
                    )))
                }
            }
            if flags & REPLY_FLAG_DONE != 0 {
                return Ok(());
            }
        }
    }

    /// Allocation map for `[start, start+length)`. Loops because the
    /// server may answer with fewer extents than the range needs.
    pub fn block_status(&mut self, start: u64, length: u64) -> Result<Vec<Extent>> {
        let end = start + length;
        let mut out = Vec::new();
        let mut pos = start;
        while pos < end {
            let chunk = (end - pos).min(u32::MAX as u64 / 2) as u32;
            let covered = self.block_status_once(pos, chunk, end, &mut out)?;
            if covered == 0 {
                return Err(Error::protocol("block status made no progress"));
            }
            pos += covered;
        }
        Ok(out)
    }

    fn block_status_once(
        &mut self,
        offset: u64,
        length: u32,
        end: u64,
        out: &mut Vec<Extent>,
    ) -> Result<u64> {
        let context = self
            .meta_context
            .ok_or_else(|| Error::protocol("block status without meta context"))?;
        let handle = self.send_request(CMD_BLOCK_STATUS, offset, length)?;

        let mut covered = 0u64;
        loop {
            let (flags, reply_type, echoed, payload) = self.read_chunk()?;
            if echoed != handle {
                return Err(Error::protocol("reply for wrong handle"));
            }
            if reply_type & REPLY_TYPE_ERR_BIT != 0 {
                return Err(Error::Protocol(format!(
                    "block status error chunk {reply_type:#x}"
                )));
            }
            if reply_type == REPLY_TYPE_BLOCK_STATUS {
                if payload.len() < 4 || (payload.len() - 4) % 8 != 0 {
                    return Err(Error::protocol("malformed block status chunk"));
                }
                let ctx = u32::from_be_bytes(payload[..4].try_into().unwrap());
                if ctx == context {
                    let mut pos = offset + covered;
                    for pair in payload[4..].chunks_exact(8) {
                        let len = u32::from_be_bytes(pair[..4].try_into().unwrap()) as u64;
                        let state = u32::from_be_bytes(pair[4..].try_into().unwrap());
                        // The final extent may run past the queried range.
                        let len = len.min(end.saturating_sub(pos));
                        if len == 0 {
                            break;
                        }
                        let zero = state & (STATE_HOLE | STATE_ZERO) != 0;
                        out.push(Extent {
                            start: pos,
                            length: len,
                            zero,
                        });
                        pos += len;
                        covered += len;
                    }
                }
            }
            if flags & REPLY_FLAG_DONE != 0 {
                return Ok(covered);
            }
        }
    }

    /// Read one structured reply chunk: (flags, type, handle, payload).
    fn read_chunk(&mut self) -> Result<(u16, u16, u64, Vec<u8>)> {
        let magic = self.read_u32()?;
        if magic == SIMPLE_REPLY_MAGIC {
            // Simple error reply in structured mode.
            let errno = self.read_u32()?;
            let handle = self.read_u64()?;
            if errno != 0 {
                return Err(Error::Protocol(format!("NBD error {errno}")));
            }
            return Ok((REPLY_FLAG_DONE, REPLY_TYPE_NONE, handle, Vec::new()));
        }
        if magic != STRUCTURED_REPLY_MAGIC {
            return Err(Error::protocol("bad structured reply magic"));
        }
        let flags = self.read_u16()?;
        let reply_type = self.read_u16()?;
        let handle = self.read_u64()?;
        let length = self.read_u32()? as usize;
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload)?;
        Ok((flags, reply_type, handle, payload))
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.stream.read_exact(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.stream.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.stream.read_exact(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }
}
