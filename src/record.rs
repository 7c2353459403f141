//! Text records stored in an archive
//!
//! Two formats live here:
//!
//! - **List records**, one line per archived path in the `List` file:
//!   `<name><SEP>mode>.. uid>.. gid>.. size>.. mtime>..[ acl>..][ U>n| C>n][<SEP>slink>target]`.
//!   Mode, uid, gid and mtime (nanoseconds) are hex, size is decimal.
//! - **Chunk descriptors**, one line per chunk inside a descriptor block:
//!   `<U|C>-<block> <hash>`.
//!
//! `SEP` is an unlikely-in-a-filename byte sequence, [`LIST_SEP`].

use crate::block_list::BlockIndex;
use crate::compression::CompFlag;
use crate::error::{PhatError, Result};
use nix::sys::stat::SFlag;
use serde::Serialize;
use std::fmt::Write as _;

/// Separator between the name, attribute and symlink fields of a list record
pub const LIST_SEP: &str = " \\'%;#\"\\ ";

/// File type encoded in a mode word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Named pipe
    Fifo,
    /// Unix domain socket
    Socket,
    /// Character device
    CharDevice,
    /// Block device
    BlockDevice,
    /// Anything else
    Unknown,
}

impl FileKind {
    /// Decode the `S_IFMT` bits of `mode`
    pub fn from_mode(mode: u32) -> Self {
        let fmt = mode & SFlag::S_IFMT.bits() as u32;
        let is = |flag: SFlag| fmt == flag.bits() as u32;
        if is(SFlag::S_IFREG) {
            FileKind::Regular
        } else if is(SFlag::S_IFDIR) {
            FileKind::Directory
        } else if is(SFlag::S_IFLNK) {
            FileKind::Symlink
        } else if is(SFlag::S_IFIFO) {
            FileKind::Fifo
        } else if is(SFlag::S_IFSOCK) {
            FileKind::Socket
        } else if is(SFlag::S_IFCHR) {
            FileKind::CharDevice
        } else if is(SFlag::S_IFBLK) {
            FileKind::BlockDevice
        } else {
            FileKind::Unknown
        }
    }
}

/// Reference from a list record to its descriptor block
///
/// Non-negative ids are descriptor block indices. Negative ids are
/// synthetic and only group hardlinked zero-length entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DescriptorRef {
    /// How the descriptor block was stored
    pub flag: CompFlag,
    /// Block index, or a negative grouping id
    pub id: i64,
}

impl DescriptorRef {
    /// Reference to a real descriptor block
    pub fn block(flag: CompFlag, idx: BlockIndex) -> Self {
        Self { flag, id: idx as i64 }
    }

    /// Synthetic reference for a zero-length entry
    pub fn synthetic(id: i64) -> Self {
        Self {
            flag: CompFlag::Uncompressed,
            id,
        }
    }

    /// Descriptor block index, if this reference has one
    pub fn block_index(&self) -> Option<BlockIndex> {
        u64::try_from(self.id).ok()
    }
}

/// One archived path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListRecord {
    /// Absolute path of the live file
    pub name: String,
    /// Full `st_mode`
    pub mode: u32,
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Modify time in nanoseconds since the epoch
    pub mtime_ns: i64,
    /// ACL text, when the file has one
    pub acl: Option<String>,
    /// Descriptor reference, for entries that have content or a grouping id
    pub content: Option<DescriptorRef>,
    /// Symlink target
    pub link_target: Option<String>,
}

impl ListRecord {
    /// File type of this record
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Permission bits including setuid/setgid/sticky
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Copy of this record under another name
    pub fn renamed(&self, name: &str) -> ListRecord {
        ListRecord {
            name: name.to_string(),
            ..self.clone()
        }
    }

    /// Render as one `List` line, without the trailing newline
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(self.name.len() + 96);
        line.push_str(&self.name);
        line.push_str(LIST_SEP);
        let _ = write!(
            line,
            "mode>{:x} uid>{:x} gid>{:x} size>{} mtime>{:x}",
            self.mode, self.uid, self.gid, self.size, self.mtime_ns
        );
        if let Some(acl) = &self.acl {
            let _ = write!(line, " acl>{acl}");
        }
        if let Some(r) = &self.content {
            let _ = write!(line, " {}>{}", r.flag.as_char(), r.id);
        }
        if let Some(target) = &self.link_target {
            line.push_str(LIST_SEP);
            line.push_str("slink>");
            line.push_str(target);
        }
        line
    }

    /// Parse one `List` line; `origin` and `line_no` are for errors
    pub fn parse(line: &str, origin: &str, line_no: usize) -> Result<ListRecord> {
        let bad = |detail: String| PhatError::format(origin, Some(line_no), detail);

        let fields: Vec<&str> = line.split(LIST_SEP).collect();
        if fields.len() != 2 && fields.len() != 3 {
            return Err(bad(format!("expected 2 or 3 fields, found {}", fields.len())));
        }

        let mut rec = ListRecord {
            name: fields[0].to_string(),
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            mtime_ns: 0,
            acl: None,
            content: None,
            link_target: None,
        };

        for token in fields[1].split(' ').filter(|t| !t.is_empty()) {
            let Some((key, value)) = token.split_once('>') else {
                return Err(bad(format!("attribute without value: {token}")));
            };
            let hex32 = || u32::from_str_radix(value, 16).map_err(|_| bad(format!("bad {key}: {value}")));
            match key {
                "mode" => rec.mode = hex32()?,
                "uid" => rec.uid = hex32()?,
                "gid" => rec.gid = hex32()?,
                "size" => rec.size = value.parse().map_err(|_| bad(format!("bad size: {value}")))?,
                "mtime" => {
                    rec.mtime_ns = u64::from_str_radix(value, 16)
                        .map_err(|_| bad(format!("bad mtime: {value}")))? as i64
                }
                "acl" => rec.acl = Some(value.to_string()),
                "U" | "C" => {
                    let flag = if key == "C" { CompFlag::Compressed } else { CompFlag::Uncompressed };
                    let id = value.parse().map_err(|_| bad(format!("bad descriptor id: {value}")))?;
                    rec.content = Some(DescriptorRef { flag, id });
                }
                _ => return Err(bad(format!("unknown attribute: {token}"))),
            }
        }

        if let Some(extra) = fields.get(2) {
            let Some(target) = extra.strip_prefix("slink>") else {
                return Err(bad(format!("unexpected third field: {extra}")));
            };
            rec.link_target = Some(target.to_string());
        }
        Ok(rec)
    }
}

/// One chunk of a file as listed in its descriptor block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkDescriptor {
    /// How the chunk block was stored
    pub flag: CompFlag,
    /// Chunk block index
    pub block: BlockIndex,
    /// Hex digest of the raw chunk bytes
    pub hash: String,
}

impl ChunkDescriptor {
    /// Append this descriptor's line (with newline) to `out`
    pub fn write_line(&self, out: &mut String) {
        let _ = writeln!(out, "{}-{} {}", self.flag.as_char(), self.block, self.hash);
    }
}

/// Render a full descriptor block
pub fn render_descriptors(chunks: &[ChunkDescriptor]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        chunk.write_line(&mut out);
    }
    out
}

/// Parse a descriptor block's text
pub fn parse_descriptors(text: &str, origin: &str) -> Result<Vec<ChunkDescriptor>> {
    let mut chunks = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let bad = || PhatError::format(origin, Some(idx + 1), format!("illegal descriptor line: {line}"));
        let mut chars = line.chars();
        let flag = chars.next().and_then(CompFlag::from_char).ok_or_else(bad)?;
        if line.len() < 3 || chars.next() != Some('-') {
            return Err(bad());
        }
        let parts: Vec<&str> = line[2..].split(' ').collect();
        if parts.len() != 2 {
            return Err(bad());
        }
        let block = parts[0].parse().map_err(|_| bad())?;
        chunks.push(ChunkDescriptor {
            flag,
            block,
            hash: parts[1].to_string(),
        });
    }
    Ok(chunks)
}
