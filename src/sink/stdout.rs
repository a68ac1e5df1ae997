//! Line protocol on standard output, for piping into Telegraf or a shell.

use super::{Sink, SinkError};
use crate::sink::line_protocol::DataPoint;
use futures::future::BoxFuture;
use std::io::{self, Write};

pub struct StdoutSink {
    out: Option<Box<dyn Write + Send>>,
}

impl StdoutSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out: Some(out) }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }
}

impl Sink for StdoutSink {
    fn write<'a>(&'a mut self, point: &'a DataPoint) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let out = self.out.as_mut().ok_or(SinkError::Closed)?;
            point.check_writable()?;
            writeln!(out, "{point}")?;
            out.flush()?;
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut out) = self.out.take() {
                let _ = out.flush();
            }
        })
    }
}
