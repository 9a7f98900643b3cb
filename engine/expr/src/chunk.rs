//! Chunked, versioned stream format: a stream header followed by
//! `[name, version, byte-size, payload]` chunks. Readers can skip chunks they
//! do not understand, which is what keeps old binaries loadable

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{ExprError, ExprResult};

const STREAM_MAGIC: &[u8; 4] = b"CHNK";
const STREAM_VERSION: u32 = 1;

pub struct ChunkWriter<W: Write> {
    out: W,
    current: Option<(String, u32, Vec<u8>)>,
}

impl<W: Write> ChunkWriter<W> {
    pub fn begin_stream(mut out: W) -> ExprResult<Self> {
        out.write_all(STREAM_MAGIC)?;
        out.write_u32::<LittleEndian>(STREAM_VERSION)?;
        Ok(Self { out, current: None })
    }

    pub fn begin_chunk(&mut self, name: &str, version: u32) {
        debug_assert!(self.current.is_none(), "chunk already open");
        self.current = Some((name.to_owned(), version, Vec::new()));
    }

    pub fn end_chunk(&mut self) -> ExprResult<()> {
        let (name, version, payload) = self
            .current
            .take()
            .ok_or(ExprError::MalformedStream("no chunk open"))?;

        self.out.write_u32::<LittleEndian>(name.len() as u32)?;
        self.out.write_all(name.as_bytes())?;
        self.out.write_u32::<LittleEndian>(version)?;
        self.out.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.out.write_all(&payload)?;
        Ok(())
    }

    pub fn end_stream(mut self) -> ExprResult<W> {
        debug_assert!(self.current.is_none(), "chunk left open");
        // zero length name terminates the chunk list
        self.out.write_u32::<LittleEndian>(0)?;
        Ok(self.out)
    }

    fn buf(&mut self) -> &mut Vec<u8> {
        &mut self
            .current
            .as_mut()
            .expect("no chunk open for writing")
            .2
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf().push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf().extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf().extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf().extend_from_slice(s.as_bytes());
    }
}

pub struct ChunkInfo {
    pub name: String,
    pub version: u32,
}

pub struct ChunkReader<R: Read> {
    input: R,
    current: Option<ChunkInfo>,
    payload: Vec<u8>,
    cursor: usize,
}

impl<R: Read> ChunkReader<R> {
    pub fn begin_stream(mut input: R) -> ExprResult<Self> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != STREAM_MAGIC {
            return Err(ExprError::MalformedStream("bad stream magic"));
        }

        let version = input.read_u32::<LittleEndian>()?;
        if version > STREAM_VERSION {
            return Err(ExprError::MalformedStream("stream version too new"));
        }

        let mut reader = Self {
            input,
            current: None,
            payload: Vec::new(),
            cursor: 0,
        };
        reader.next_chunk()?;
        Ok(reader)
    }

    pub fn current_chunk(&self) -> Option<&ChunkInfo> {
        self.current.as_ref()
    }

    /// Discards the rest of the current chunk and reads the next header
    pub fn next_chunk(&mut self) -> ExprResult<()> {
        let name_len = self.input.read_u32::<LittleEndian>()?;
        if name_len == 0 {
            self.current = None;
            self.payload.clear();
            self.cursor = 0;
            return Ok(());
        }

        let mut name = vec![0u8; name_len as usize];
        self.input.read_exact(&mut name)?;
        let name =
            String::from_utf8(name).map_err(|_| ExprError::MalformedStream("chunk name utf8"))?;

        let version = self.input.read_u32::<LittleEndian>()?;
        let size = self.input.read_u32::<LittleEndian>()?;

        self.payload.resize(size as usize, 0);
        self.input.read_exact(&mut self.payload)?;
        self.cursor = 0;
        self.current = Some(ChunkInfo { name, version });
        Ok(())
    }

    fn take(&mut self, n: usize) -> ExprResult<&[u8]> {
        if self.cursor + n > self.payload.len() {
            return Err(ExprError::MalformedStream("read past chunk end"));
        }
        let slice = &self.payload[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> ExprResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> ExprResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, out: &mut [u8]) -> ExprResult<()> {
        let bytes = self.take(out.len())?;
        out.copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_str(&mut self) -> ExprResult<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ExprError::MalformedStream("string utf8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_round_trip_and_skip() {
        let mut writer = ChunkWriter::begin_stream(Vec::new()).unwrap();
        writer.begin_chunk("First", 3);
        writer.write_u32(42);
        writer.write_str("hello");
        writer.end_chunk().unwrap();
        writer.begin_chunk("Second", 7);
        writer.write_u8(9);
        writer.end_chunk().unwrap();
        let bytes = writer.end_stream().unwrap();

        let mut reader = ChunkReader::begin_stream(&bytes[..]).unwrap();
        assert_eq!(reader.current_chunk().unwrap().name, "First");
        assert_eq!(reader.current_chunk().unwrap().version, 3);
        assert_eq!(reader.read_u32().unwrap(), 42);

        // skip the rest of First entirely
        reader.next_chunk().unwrap();
        assert_eq!(reader.current_chunk().unwrap().name, "Second");
        assert_eq!(reader.read_u8().unwrap(), 9);

        reader.next_chunk().unwrap();
        assert!(reader.current_chunk().is_none());
    }
}
