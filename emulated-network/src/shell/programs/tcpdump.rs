use crate::pcap_exporter::{Capture, CaptureSink, CaptureTaps, PcapExporter, SNAPSHOT_LENGTH};
use crate::shell::io::Sink;
use crate::shell::programs::{Invocation, ProgramFuture};
use clap::Parser;
use futures::FutureExt;
use std::fs::File;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "tcpdump", about = "Dumps traffic on an interface")]
struct Args {
    /// Interface to listen on (defaults to the first one)
    #[arg(short = 'i', value_name = "INTERFACE")]
    interface: Option<String>,
    /// Write the raw packets to a pcapng file instead of printing them
    #[arg(short = 'w', value_name = "FILE")]
    write: Option<String>,
    /// Exit after receiving COUNT packets
    #[arg(short = 'c', value_name = "COUNT")]
    count: Option<u64>,
    /// Don't convert addresses to names (names are never resolved)
    #[arg(short = 'n')]
    _numeric: bool,
    expression: Vec<String>,
}

/// Detaches the capture when tcpdump exits or is killed, then prints its statistics
struct CaptureGuard {
    taps: Arc<CaptureTaps>,
    capture: Arc<Capture>,
    stderr: Sink,
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.taps.detach(&self.capture);
        if let Err(e) = self.capture.flush() {
            tracing::warn!("failed to flush capture: {e:#}");
        }

        let captured = self.capture.captured();
        self.stderr.write(&format!(
            "{captured} packets captured\n{captured} packets received by filter\n0 packets dropped by kernel\n"
        ));
    }
}

pub fn main(invocation: Invocation) -> ProgramFuture {
    async move {
        let args: Args = match invocation.parse_args() {
            Ok(args) => args,
            Err(status) => return status,
        };

        let io = &invocation.io;
        if !args.expression.is_empty() {
            io.errln("tcpdump: filter expressions are not supported");
            return 1;
        }

        let node = &invocation.node;
        let interface = match args.interface {
            Some(interface) => interface,
            None => match node.interfaces().first() {
                Some(interface) => interface.name.to_string(),
                None => {
                    io.errln("tcpdump: no suitable device found");
                    return 1;
                }
            },
        };

        let Some(taps) = node.interface_taps(&interface) else {
            io.errln(&format!("tcpdump: {interface}: No such device exists"));
            io.errln("(SIOCGIFHWADDR: No such device)");
            return 1;
        };

        let network_start = node.ctx.start;
        let (sink, mut lines) = match &args.write {
            Some(path) => {
                let exporter = File::create(invocation.env.path(path))
                    .map_err(anyhow::Error::from)
                    .and_then(|file| PcapExporter::new(file, network_start));
                match exporter {
                    Ok(exporter) => (CaptureSink::File(exporter), None),
                    Err(e) => {
                        io.errln(&format!("tcpdump: {path}: {e:#}"));
                        return 1;
                    }
                }
            }
            None => {
                io.errln(
                    "tcpdump: verbose output suppressed, use -v[v]... for full protocol decode",
                );
                let (tx, rx) = mpsc::unbounded_channel();
                (CaptureSink::Lines(tx), Some(rx))
            }
        };

        let prefix = if args.write.is_some() { "tcpdump: " } else { "" };
        io.errln(&format!(
            "{prefix}listening on {interface}, link-type EN10MB (Ethernet), snapshot length {SNAPSHOT_LENGTH} bytes"
        ));

        let capture = Arc::new(Capture::new(sink, network_start, args.count));
        taps.attach(capture.clone());
        tracing::debug!(node = %node.name(), %interface, "capture started");
        let _guard = CaptureGuard {
            taps,
            capture: capture.clone(),
            stderr: io.stderr.clone(),
        };

        match &mut lines {
            Some(lines) => loop {
                tokio::select! {
                    biased;
                    Some(line) = lines.recv() => io.outln(&line),
                    _ = capture.finished() => {
                        while let Ok(line) = lines.try_recv() {
                            io.outln(&line);
                        }
                        break;
                    }
                }
            },
            None => capture.finished().await,
        }

        0
    }
    .boxed()
}
