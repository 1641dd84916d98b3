use crate::error::ParseResult;
use crate::mutf8;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{self, Read, Seek, SeekFrom};

/// Byte source the parser pulls from. The source is borrowed, never closed;
/// seeking is only used to re-read the already-consumed window of an
/// exception frame.
pub trait Source: Read + Seek {}

impl<T: Read + Seek + ?Sized> Source for T {}

/// Big-endian primitive reads over a borrowed source.
pub struct StreamReader<'a> {
    src: &'a mut dyn Source,
}

impl<'a> StreamReader<'a> {
    pub fn new(src: &'a mut dyn Source) -> StreamReader<'a> {
        StreamReader { src }
    }

    #[inline]
    pub fn read_byte(&mut self) -> ParseResult<u8> {
        Ok(self.src.read_u8()?)
    }

    #[inline]
    pub fn read_i8(&mut self) -> ParseResult<i8> {
        Ok(self.src.read_i8()?)
    }

    #[inline]
    pub fn read_ushort(&mut self) -> ParseResult<u16> {
        Ok(self.src.read_u16::<BigEndian>()?)
    }

    #[inline]
    pub fn read_short(&mut self) -> ParseResult<i16> {
        Ok(self.src.read_i16::<BigEndian>()?)
    }

    #[inline]
    pub fn read_int(&mut self) -> ParseResult<i32> {
        Ok(self.src.read_i32::<BigEndian>()?)
    }

    #[inline]
    pub fn read_uint(&mut self) -> ParseResult<u32> {
        Ok(self.src.read_u32::<BigEndian>()?)
    }

    #[inline]
    pub fn read_long(&mut self) -> ParseResult<i64> {
        Ok(self.src.read_i64::<BigEndian>()?)
    }

    #[inline]
    pub fn read_float(&mut self) -> ParseResult<f32> {
        Ok(self.src.read_f32::<BigEndian>()?)
    }

    #[inline]
    pub fn read_double(&mut self) -> ParseResult<f64> {
        Ok(self.src.read_f64::<BigEndian>()?)
    }

    #[inline]
    pub fn read_bool(&mut self) -> ParseResult<bool> {
        Ok(self.read_byte()? != 0)
    }

    /// A `char` field value is one UTF-16 code unit.
    #[inline]
    pub fn read_char(&mut self) -> ParseResult<u16> {
        self.read_ushort()
    }

    pub fn read_bytes(&mut self, count: usize) -> ParseResult<Vec<u8>> {
        let mut data = vec![0u8; count];
        self.src.read_exact(&mut data)?;
        Ok(data)
    }

    /// Reads a 16-bit-length-prefixed modified UTF-8 string.
    pub fn read_utf(&mut self) -> ParseResult<String> {
        let length = self.read_ushort()?;
        let data = self.read_bytes(usize::from(length))?;
        mutf8::decode(&data)
    }

    /// Next tag byte, or `None` on a clean end of stream. End-of-stream is
    /// only legal at a tag boundary; everywhere else an underflow is an
    /// `UnexpectedEndOfStream` error.
    pub fn read_tag_or_eof(&mut self) -> ParseResult<Option<u8>> {
        let mut buf = [0u8; 1];
        loop {
            match self.src.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) => {
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    #[inline]
    pub fn position(&mut self) -> ParseResult<u64> {
        Ok(self.src.seek(SeekFrom::Current(0))?)
    }

    /// Re-reads the already-consumed window `[start, end)`. The source is
    /// left positioned at `end`.
    pub fn read_window(&mut self, start: u64, end: u64) -> ParseResult<Vec<u8>> {
        self.src.seek(SeekFrom::Start(start))?;
        self.read_bytes((end - start) as usize)
    }
}
