//! Packet captures attached to emulated interfaces

use crate::network::frame::Frame;
use anyhow::Context;
use parking_lot::Mutex;
use pcap_file::pcapng::PcapNgWriter;
use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionBlock;
use pcap_file::pcapng::blocks::section_header::SectionHeaderBlock;
use pcap_file::{DataLink, Endianness};
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

pub const SNAPSHOT_LENGTH: u32 = 262144;

/// Writes frames to a pcapng stream with an Ethernet link type
pub struct PcapExporter {
    capture_start: Instant,
    captured_frames: AtomicU64,
    writer: Mutex<PcapNgWriter<BufWriter<Box<dyn Write + Send + Sync + 'static>>>>,
}

impl PcapExporter {
    /// Creates an exporter whose timestamps are relative to `capture_start`
    pub fn new(
        writer: impl Write + Send + Sync + 'static,
        capture_start: Instant,
    ) -> anyhow::Result<Self> {
        let writer: Box<dyn Write + Send + Sync + 'static> = Box::new(writer);
        let mut writer = PcapNgWriter::with_section_header(
            BufWriter::new(writer),
            SectionHeaderBlock {
                endianness: Endianness::Big,
                major_version: 1,
                minor_version: 0,
                section_length: 0,
                options: vec![],
            },
        )
        .context("failed to write pcapng section header")?;

        writer
            .write_pcapng_block(InterfaceDescriptionBlock {
                linktype: DataLink::ETHERNET,
                snaplen: SNAPSHOT_LENGTH,
                options: vec![],
            })
            .context("failed to write pcapng interface description")?;

        Ok(Self {
            capture_start,
            writer: Mutex::new(writer),
            captured_frames: AtomicU64::new(0),
        })
    }

    pub fn captured_frames(&self) -> u64 {
        self.captured_frames.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.writer
            .lock()
            .get_mut()
            .flush()
            .context("failed to flush pcap writer")
    }

    pub fn track_frame(&self, at: Instant, frame: &Frame) -> anyhow::Result<()> {
        let data = frame.to_bytes();
        self.captured_frames.fetch_add(1, Ordering::Relaxed);

        self.writer
            .lock()
            .write_pcapng_block(EnhancedPacketBlock {
                interface_id: 0,
                timestamp: correct_timestamp(at.saturating_duration_since(self.capture_start)),
                original_len: data.len() as u32,
                data: data.into(),
                options: Vec::new(),
            })
            .context("failed to write captured frame")?;
        Ok(())
    }
}

fn correct_timestamp(d: Duration) -> Duration {
    // The library writes the duration in nanoseconds, but the interface uses the default resolution
    // of microseconds, so we hand it a value that is three orders of magnitude smaller
    Duration::from_nanos(d.as_micros() as u64)
}

/// Formats a capture timestamp the way tcpdump does (`HH:MM:SS.uuuuuu`)
pub fn format_timestamp(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{:06}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        elapsed.subsec_micros()
    )
}

pub enum CaptureSink {
    File(PcapExporter),
    /// One summary line per frame
    Lines(mpsc::UnboundedSender<String>),
}

/// A running capture session, possibly attached to several interfaces
pub struct Capture {
    sink: CaptureSink,
    network_start: Instant,
    max_packets: Option<u64>,
    captured: AtomicU64,
    done: Notify,
}

impl Capture {
    pub fn new(sink: CaptureSink, network_start: Instant, max_packets: Option<u64>) -> Self {
        Self {
            sink,
            network_start,
            max_packets,
            captured: AtomicU64::new(0),
            done: Notify::new(),
        }
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Resolves once the capture has seen as many frames as requested
    pub async fn finished(&self) {
        if self.max_packets.is_none() {
            return std::future::pending().await;
        }

        loop {
            let notified = self.done.notified();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        match &self.sink {
            CaptureSink::File(exporter) => exporter.flush(),
            CaptureSink::Lines(_) => Ok(()),
        }
    }

    fn is_finished(&self) -> bool {
        self.max_packets
            .is_some_and(|max| self.captured.load(Ordering::Relaxed) >= max)
    }

    fn record(&self, at: Instant, frame: &Frame) {
        if self.is_finished() {
            return;
        }

        match &self.sink {
            CaptureSink::File(exporter) => {
                if let Err(e) = exporter.track_frame(at, frame) {
                    tracing::warn!("capture failed: {e:#}");
                }
            }
            CaptureSink::Lines(lines) => {
                let elapsed = at.saturating_duration_since(self.network_start);
                lines
                    .send(format!("{} {frame}", format_timestamp(elapsed)))
                    .ok();
            }
        }

        self.captured.fetch_add(1, Ordering::Relaxed);
        if self.is_finished() {
            self.done.notify_waiters();
        }
    }
}

/// The captures attached to an interface
#[derive(Default)]
pub struct CaptureTaps {
    captures: Mutex<Vec<Arc<Capture>>>,
}

impl CaptureTaps {
    pub fn attach(&self, capture: Arc<Capture>) {
        self.captures.lock().push(capture);
    }

    pub fn detach(&self, capture: &Arc<Capture>) {
        self.captures.lock().retain(|c| !Arc::ptr_eq(c, capture));
    }

    pub(crate) fn record(&self, at: Instant, frame: &Frame) {
        for capture in self.captures.lock().iter() {
            capture.record(at, frame);
        }
    }
}
