use std::io::Write;

use tracing::warn;

use crate::analyzer::Analyzer;
use crate::packet2::Packet;

pub struct PacketDumpBuilder {
    pretty: bool,
}

impl Default for PacketDumpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDumpBuilder {
    pub fn new() -> Self {
        Self { pretty: false }
    }

    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Writes one JSON document per decoded packet to `out`.
    pub fn build<W: Write + 'static>(self, out: W) -> Box<dyn Analyzer> {
        Box::new(PacketDump {
            out,
            pretty: self.pretty,
            failed: false,
        })
    }
}

struct PacketDump<W> {
    out: W,
    pretty: bool,
    failed: bool,
}

impl<W: Write> Analyzer for PacketDump<W> {
    fn process(&mut self, packet: &Packet<'_>) {
        if self.failed {
            return;
        }
        let written = if self.pretty {
            serde_json::to_writer_pretty(&mut self.out, packet)
        } else {
            serde_json::to_writer(&mut self.out, packet)
        }
        .map_err(std::io::Error::from)
        .and_then(|_| self.out.write_all(b"\n"));

        if let Err(err) = written {
            warn!("packet dump stopped: {}", err);
            self.failed = true;
        }
    }

    fn finish(&mut self) {
        if let Err(err) = self.out.flush() {
            warn!("failed to flush packet dump: {}", err);
        }
    }
}
