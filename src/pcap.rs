//! Classic pcap file source.
//!
//! Implements the producer side of the packet-input contract: read frames
//! off a capture file with `pcap_parser`, load them into pool-recycled
//! [`Packet`]s, and push them down the [`Channel`]. The channel is closed
//! when the file ends, which is what terminates the kernel's run loop.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError as ParserError};
use tracing::warn;

use crate::channel::Channel;
use crate::error::{Error, PcapError, Result};
use crate::packet::Packet;

const BUFFER_SIZE: usize = 262144;

/// Magic of the nanosecond-resolution legacy format.
const MAGIC_NANO: u32 = 0xa1b2_3c4d;

/// Reader over any legacy-pcap byte source.
pub struct PcapSource<R: Read> {
    reader: LegacyPcapReader<R>,
    link_type: u32,
    nano: bool,
    frames: u64,
}

impl<R: Read> std::fmt::Debug for PcapSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcapSource")
            .field("link_type", &self.link_type)
            .field("nano", &self.nano)
            .field("frames", &self.frames)
            .finish()
    }
}

/// Pcap source backed by a file.
pub type PcapFileSource = PcapSource<File>;

impl PcapFileSource {
    /// Open a classic pcap file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::Pcap(PcapError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                Error::Io(e)
            }
        })?;
        Self::new(file)
    }
}

impl<R: Read> PcapSource<R> {
    /// Wrap any byte source carrying a legacy pcap stream.
    pub fn new(input: R) -> Result<Self> {
        let reader = LegacyPcapReader::new(BUFFER_SIZE, input).map_err(|e| {
            Error::Pcap(PcapError::InvalidFormat {
                reason: format!("not a legacy pcap stream: {e}"),
            })
        })?;
        let mut source = Self {
            reader,
            link_type: 0,
            nano: false,
            frames: 0,
        };
        source.read_header()?;
        Ok(source)
    }

    /// Link-layer type declared by the file header (1 = Ethernet).
    pub fn link_type(&self) -> u32 {
        self.link_type
    }

    /// Frames pushed so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Read the whole file into the channel, then close it. Returns the
    /// number of frames pushed. Blocks on channel backpressure.
    pub fn feed(&mut self, channel: &Channel<Packet>) -> Result<u64> {
        let result = self.feed_inner(channel);
        // Close regardless of outcome so the consumer unwinds cleanly.
        channel.close();
        result?;
        Ok(self.frames)
    }

    fn read_header(&mut self) -> Result<()> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    if let PcapBlockOwned::LegacyHeader(hdr) = &block {
                        self.link_type = hdr.network.0 as u32;
                        self.nano = hdr.magic_number == MAGIC_NANO;
                        self.reader.consume(offset);
                        return Ok(());
                    }
                    self.reader.consume(offset);
                }
                Err(ParserError::Incomplete(_)) => self.refill()?,
                Err(e) => {
                    return Err(Error::Pcap(PcapError::InvalidFormat {
                        reason: format!("bad pcap header: {e}"),
                    }))
                }
            }
        }
    }

    fn feed_inner(&mut self, channel: &Channel<Packet>) -> Result<()> {
        // Two Incomplete results in a row mean the refill made no
        // progress: the file ends inside a record.
        let mut stalled = false;
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    stalled = false;
                    match &block {
                        PcapBlockOwned::Legacy(rec) => {
                            let sub_us = if self.nano {
                                rec.ts_usec as i64 / 1_000
                            } else {
                                rec.ts_usec as i64
                            };
                            let ts_us = rec.ts_sec as i64 * 1_000_000 + sub_us;

                            let mut pkt = channel.retain();
                            pkt.fill(rec.data, rec.origlen as usize, ts_us);
                            channel.push(pkt);
                            self.frames += 1;
                        }
                        PcapBlockOwned::LegacyHeader(_) => {}
                        PcapBlockOwned::NG(_) => {
                            warn!("pcapng block in legacy stream; skipped");
                        }
                    }
                    self.reader.consume(offset);
                }
                Err(ParserError::Eof) => return Ok(()),
                Err(ParserError::Incomplete(_)) => {
                    if stalled {
                        return Err(Error::Pcap(PcapError::Truncated {
                            frame: self.frames + 1,
                        }));
                    }
                    stalled = true;
                    self.refill()?;
                }
                Err(e) => {
                    return Err(Error::Pcap(PcapError::InvalidFormat {
                        reason: format!("bad pcap record: {e}"),
                    }))
                }
            }
        }
    }

    fn refill(&mut self) -> Result<()> {
        self.reader.refill().map_err(|_| {
            Error::Pcap(PcapError::Truncated {
                frame: self.frames + 1,
            })
        })
    }
}
