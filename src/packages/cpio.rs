// src/packages/cpio.rs

//! Streaming reader for newc cpio payloads

use std::io::{self, Read};

/// CPIO New ASCII Format (newc) header size
const HEADER_SIZE: usize = 110;
/// Magic string for newc format
const MAGIC_NEWC: &[u8] = b"070701";
/// Magic string for CRC format
const MAGIC_CRC: &[u8] = b"070702";

const S_IFMT: u32 = 0o170000;

/// Extracted CPIO entry metadata
#[derive(Debug, Clone)]
pub struct CpioEntry {
    /// Path without any leading `./` or `/`
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
    pub uid: u32,
    pub gid: u32,
    pub ino: u32,
    pub nlink: u32,
}

impl CpioEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == 0o040000
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == 0o100000
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == 0o120000
    }

    /// A hardlinked regular file whose data is carried by a later entry
    pub fn is_hardlink_placeholder(&self) -> bool {
        self.is_regular() && self.nlink > 1 && self.size == 0
    }
}

/// A reader for CPIO (New ASCII) archives
///
/// Entry data is not buffered: after [`CpioReader::next_entry`] the reader
/// itself yields the data of that entry through [`Read`], and whatever is
/// left unread is skipped when the next entry is requested.
pub struct CpioReader<R: Read> {
    reader: R,
    /// Unread data bytes of the current entry
    remaining: u64,
    /// Padding after the current entry's data
    pad: usize,
}

impl<R: Read> CpioReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            remaining: 0,
            pad: 0,
        }
    }

    fn skip_rest(&mut self) -> io::Result<()> {
        if self.remaining > 0 {
            let skipped = io::copy(&mut (&mut self.reader).take(self.remaining), &mut io::sink())?;
            if skipped < self.remaining {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated CPIO entry"));
            }
            self.remaining = 0;
        }
        if self.pad > 0 {
            let mut skip = [0u8; 3];
            self.reader.read_exact(&mut skip[..self.pad])?;
            self.pad = 0;
        }
        Ok(())
    }

    /// Read the next entry header from the CPIO archive
    /// Returns Ok(None) if end of archive (TRAILER!!!)
    pub fn next_entry(&mut self) -> io::Result<Option<CpioEntry>> {
        self.skip_rest()?;

        let mut header_buf = [0u8; HEADER_SIZE];
        if let Err(e) = self.reader.read_exact(&mut header_buf) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e);
        }

        let magic = &header_buf[0..6];
        if magic != MAGIC_NEWC && magic != MAGIC_CRC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid CPIO magic: {:?}", String::from_utf8_lossy(magic)),
            ));
        }

        let parse_hex = |start: usize, len: usize| -> io::Result<u32> {
            let s = std::str::from_utf8(&header_buf[start..start + len])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            u32::from_str_radix(s, 16).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        };

        let ino = parse_hex(6, 8)?;
        let mode = parse_hex(14, 8)?;
        let uid = parse_hex(22, 8)?;
        let gid = parse_hex(30, 8)?;
        let nlink = parse_hex(38, 8)?;
        let mtime = parse_hex(46, 8)? as u64;
        let filesize = parse_hex(54, 8)? as u64;
        let namesize = parse_hex(94, 8)? as usize;

        let mut name_buf = vec![0u8; namesize];
        self.reader.read_exact(&mut name_buf)?;
        if name_buf.last() == Some(&0) {
            name_buf.pop();
        }
        let raw_name = String::from_utf8_lossy(&name_buf).to_string();

        if raw_name == "TRAILER!!!" {
            return Ok(None);
        }

        // Name is padded so header + name is 4-byte aligned
        let pad = (4 - ((HEADER_SIZE + namesize) % 4)) % 4;
        if pad > 0 {
            let mut skip = [0u8; 3];
            self.reader.read_exact(&mut skip[..pad])?;
        }

        self.remaining = filesize;
        self.pad = ((4 - (filesize % 4)) % 4) as usize;

        let name = raw_name
            .trim_start_matches("./")
            .trim_start_matches('/')
            .to_string();

        Ok(Some(CpioEntry {
            name,
            size: filesize,
            mode,
            mtime,
            uid,
            gid,
            ino,
            nlink,
        }))
    }

    /// Read the rest of the current entry's data into memory
    ///
    /// Meant for small entries such as symlink targets.
    pub fn read_data(&mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.remaining.min(64 * 1024) as usize);
        self.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl<R: Read> Read for CpioReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.reader.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated CPIO entry"));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
