use std::io::{self, Cursor, Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Eof,
    Error,
}

/// A server that plays back a fixed response script and records what the client wrote.
#[derive(Debug, Default)]
pub struct MockStream {
    script: Cursor<Vec<u8>>,
    written: Vec<u8>,
    failure: Option<Failure>,
    /// Largest read to hand out at once.
    chunk: Option<usize>,
}

impl MockStream {
    pub fn new(script: Vec<u8>) -> MockStream {
        MockStream {
            script: Cursor::new(script),
            ..MockStream::default()
        }
    }

    /// Every read reports end of stream.
    pub fn with_eof(mut self) -> MockStream {
        self.failure = Some(Failure::Eof);
        self
    }

    /// Every read fails.
    pub fn with_err(mut self) -> MockStream {
        self.failure = Some(Failure::Error);
        self
    }

    /// Hand out at most `n` bytes per read.
    pub fn chunked(mut self, n: usize) -> MockStream {
        self.chunk = Some(n.max(1));
        self
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.failure {
            Some(Failure::Eof) => return Ok(0),
            Some(Failure::Error) => return Err(io::Error::other("scripted failure")),
            None => {}
        }
        if self.script.position() as usize >= self.script.get_ref().len() {
            // the script is exhausted but the client still expects a reply
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of response script",
            ));
        }
        let limit = self.chunk.unwrap_or(buf.len()).min(buf.len());
        self.script.read(&mut buf[..limit])
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
