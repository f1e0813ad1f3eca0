use std::io;

/// Bounds-checked cursor over a byte slice, for reading fixed-layout handshake fields.
pub struct BufReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

fn past_end() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "Read past end of buffer")
}

impl<'a> BufReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let value = *self.buf.get(self.pos).ok_or_else(past_end)?;
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16_be(&mut self) -> io::Result<u16> {
        let bytes = self.read_slice(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_slice(&mut self, len: usize) -> io::Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(past_end)?;
        if end > self.buf.len() {
            return Err(past_end());
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn skip(&mut self, amount: usize) -> io::Result<()> {
        self.read_slice(amount).map(|_| ())
    }
}
