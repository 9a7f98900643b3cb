//! Wire protocol: length-prefixed frames of `[group][id][payload]` with
//! 4-char group and message ids under the `FSRV` namespace

use std::io::{Read, Write};
use std::time::SystemTime;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::{FileserveError, FileserveResult};

pub const GROUP_FSRV: [u8; 4] = *b"FSRV";

pub const MSG_HELO: [u8; 4] = *b"HELO";
pub const MSG_ARE_YOU_THERE: [u8; 4] = *b"RUTR";
pub const MSG_YES: [u8; 4] = *b" YES";
pub const MSG_MOUNT: [u8; 4] = *b" MNT";
pub const MSG_UNMOUNT: [u8; 4] = *b"UMNT";
pub const MSG_READ: [u8; 4] = *b"READ";
pub const MSG_DOWNLOAD: [u8; 4] = *b"DWNL";
pub const MSG_DOWNLOAD_FINISHED: [u8; 4] = *b"DWNF";
pub const MSG_UPLOAD_HEADER: [u8; 4] = *b"UPLH";
pub const MSG_UPLOAD_DATA: [u8; 4] = *b"UPLD";
pub const MSG_UPLOAD_FINISHED: [u8; 4] = *b"UPLF";
pub const MSG_UPLOAD_ACK: [u8; 4] = *b"UACK";
pub const MSG_DELETE_FILE: [u8; 4] = *b"DELF";
pub const MSG_RELOAD_RESOURCES: [u8; 4] = *b"RLDR";

/// Discovery beacon on the secondary endpoint
pub const GROUP_NSIP: [u8; 4] = *b"NSIP";
pub const MSG_MY_IP: [u8; 4] = *b"MYIP";

/// Downloads and uploads travel in chunks of this many bytes
pub const CHUNK_SIZE: usize = 1024;

/// The server's answer to a READ, relative to the client's cached copy
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i8)]
pub enum FileState {
    SameTimestamp = 0,
    SameHash = 1,
    Different = 2,
    NonExistant = 3,
    NonExistantEither = 4,
}

impl FileState {
    pub fn from_i8(v: i8) -> FileserveResult<Self> {
        Ok(match v {
            0 => FileState::SameTimestamp,
            1 => FileState::SameHash,
            2 => FileState::Different,
            3 => FileState::NonExistant,
            4 => FileState::NonExistantEither,
            _ => return Err(FileserveError::Protocol("unknown file state")),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub group: [u8; 4],
    pub id: [u8; 4],
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(group: [u8; 4], id: [u8; 4]) -> Self {
        Self {
            group,
            id,
            payload: Vec::new(),
        }
    }

    pub fn write_to(&self, out: &mut dyn Write) -> FileserveResult<()> {
        out.write_u32::<LittleEndian>(self.payload.len() as u32)?;
        out.write_all(&self.group)?;
        out.write_all(&self.id)?;
        out.write_all(&self.payload)?;
        out.flush()?;
        Ok(())
    }

    pub fn read_from(input: &mut dyn Read) -> FileserveResult<Frame> {
        let len = input.read_u32::<LittleEndian>()? as usize;
        let mut group = [0u8; 4];
        input.read_exact(&mut group)?;
        let mut id = [0u8; 4];
        input.read_exact(&mut id)?;
        let mut payload = vec![0u8; len];
        input.read_exact(&mut payload)?;
        Ok(Frame { group, id, payload })
    }

    pub fn reader(&self) -> PayloadReader {
        PayloadReader {
            bytes: &self.payload,
        }
    }

    // payload writers, in wire order

    pub fn push_u8(&mut self, v: u8) -> &mut Self {
        self.payload.push(v);
        self
    }

    pub fn push_i8(&mut self, v: i8) -> &mut Self {
        self.payload.push(v as u8);
        self
    }

    pub fn push_u16(&mut self, v: u16) -> &mut Self {
        self.payload.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.payload.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn push_i64(&mut self, v: i64) -> &mut Self {
        self.payload.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn push_u64(&mut self, v: u64) -> &mut Self {
        self.payload.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_u32(s.len() as u32);
        self.payload.extend_from_slice(s.as_bytes());
        self
    }

    pub fn push_uuid(&mut self, uuid: &Uuid) -> &mut Self {
        self.payload.extend_from_slice(uuid.as_bytes());
        self
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(bytes);
        self
    }
}

pub struct PayloadReader<'a> {
    bytes: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn take(&mut self, n: usize) -> FileserveResult<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(FileserveError::Protocol("truncated payload"));
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Ok(head)
    }

    pub fn u8(&mut self) -> FileserveResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> FileserveResult<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn u16(&mut self) -> FileserveResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> FileserveResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> FileserveResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> FileserveResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn str(&mut self) -> FileserveResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| FileserveError::Protocol("payload string utf8"))
    }

    pub fn uuid(&mut self) -> FileserveResult<Uuid> {
        let bytes: [u8; 16] = self.take(16)?.try_into().unwrap();
        Ok(Uuid::from_bytes(bytes))
    }

    pub fn bytes(&mut self, n: usize) -> FileserveResult<&'a [u8]> {
        self.take(n)
    }
}

/// Content hash both sides agree on
pub fn content_hash(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        // an existing-but-empty file must not collide with "no file"
        return 1;
    }
    xxhash_rust::xxh64::xxh64(bytes, 1)
}

pub fn mount_point_hash(data_dir: &str) -> String {
    format!("{:08x}", xxhash_rust::xxh32::xxh32(data_dir.as_bytes(), 0))
}

pub fn unix_timestamp(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let uuid = Uuid::new_v4();
        let mut frame = Frame::new(GROUP_FSRV, MSG_READ);
        frame
            .push_u16(3)
            .push_u8(1)
            .push_str("textures/rock.dds")
            .push_uuid(&uuid)
            .push_i64(-5)
            .push_u64(0xdead_beef);

        let mut wire = Vec::new();
        frame.write_to(&mut wire).unwrap();

        let parsed = Frame::read_from(&mut wire.as_slice()).unwrap();
        assert_eq!(parsed.group, GROUP_FSRV);
        assert_eq!(parsed.id, MSG_READ);

        let mut reader = parsed.reader();
        assert_eq!(reader.u16().unwrap(), 3);
        assert_eq!(reader.u8().unwrap(), 1);
        assert_eq!(reader.str().unwrap(), "textures/rock.dds");
        assert_eq!(reader.uuid().unwrap(), uuid);
        assert_eq!(reader.i64().unwrap(), -5);
        assert_eq!(reader.u64().unwrap(), 0xdead_beef);
    }

    #[test]
    fn truncated_payloads_error_cleanly() {
        let mut frame = Frame::new(GROUP_FSRV, MSG_HELO);
        frame.push_u16(1);
        let mut reader = frame.reader();
        assert!(reader.u16().is_ok());
        assert!(matches!(
            reader.u32(),
            Err(FileserveError::Protocol(_))
        ));
    }

    #[test]
    fn hashes_are_stable_and_distinguish_empty() {
        let a = content_hash(b"hello");
        assert_eq!(a, content_hash(b"hello"));
        assert_ne!(a, content_hash(b"world"));
        assert_ne!(content_hash(b""), 0);

        assert_eq!(mount_point_hash("/data/"), mount_point_hash("/data/"));
        assert_eq!(mount_point_hash("/data/").len(), 8);
    }
}
