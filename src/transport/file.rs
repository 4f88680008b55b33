//! File transport: newline-delimited records to a file or stdout.

use std::io::{BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::transport::{Transport, TransportError};

enum Sink {
    Open(BufWriter<Box<dyn Write + Send>>),
    Closed,
}

pub struct FileTransport {
    sink: Mutex<Sink>,
}

impl FileTransport {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(Sink::Open(BufWriter::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn create(path: &Path) -> Result<Self, TransportError> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(Box::new(file)))
    }
}

impl Transport for FileTransport {
    fn send(&self, _key: &[u8], payload: &[u8]) -> Result<(), TransportError> {
        let mut sink = self.sink.lock();
        match &mut *sink {
            Sink::Open(writer) => {
                writer.write_all(payload)?;
                writer.write_all(b"\n")?;
                Ok(())
            }
            Sink::Closed => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        let mut sink = self.sink.lock();
        if let Sink::Open(writer) = &mut *sink {
            let _ = writer.flush();
        }
        *sink = Sink::Closed;
    }
}
