//! Extracts JPEG images from the raw MJPEG byte stream written by the transcoder.
//!
//! The transcoder's stdout has no framing of its own: JPEG images simply follow
//! each other and chunk boundaries fall anywhere, including in the middle of a
//! marker. [`FrameDemuxer`] accumulates chunks and hands out every complete
//! `FF D8 .. FF D9` range, keeping at most one partial frame between calls.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{trace, warn};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// One complete JPEG image, SOI through EOI inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false for frames produced by the demuxer.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub struct FrameDemuxer {
    buffer: BytesMut,
    // Offset from which the EOI search resumes. Only meaningful while the
    // buffer starts with SOI.
    eoi_scan_from: usize,
    max_frame_bytes: usize,
    discarded_bytes: u64,
    frames_extracted: u64,
}

impl FrameDemuxer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            eoi_scan_from: 0,
            max_frame_bytes,
            discarded_bytes: 0,
            frames_extracted: 0,
        }
    }

    /// Append a chunk and iterate the frames that became complete.
    ///
    /// Frames come out in stream order. Anything left unconsumed when the
    /// iterator is dropped stays buffered and is returned by the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Frames<'_> {
        if !chunk.is_empty() {
            self.buffer.extend_from_slice(chunk);
        }
        Frames { demuxer: self }
    }

    /// Bytes thrown away because they were outside any SOI..EOI pair.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    pub fn frames_extracted(&self) -> u64 {
        self.frames_extracted
    }

    #[cfg(test)]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame and release the buffer's memory.
    pub fn reset(&mut self) {
        self.buffer = BytesMut::new();
        self.eoi_scan_from = 0;
    }

    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let Some(soi) = find(&self.buffer, &SOI, 0) else {
                self.drop_garbage();
                return None;
            };

            if soi > 0 {
                trace!("Skipping {} bytes before SOI", soi);
                self.discard(soi);
            }

            // Never match the EOI against the SOI's own bytes.
            let scan_from = self.eoi_scan_from.max(SOI.len());
            match find(&self.buffer, &EOI, scan_from) {
                Some(eoi) => {
                    let end = eoi + EOI.len();
                    self.eoi_scan_from = 0;
                    self.frames_extracted += 1;
                    return Some(Frame { data: self.buffer.split_to(end).freeze() });
                }
                None => {
                    if self.buffer.len() > self.max_frame_bytes {
                        warn!(
                            "Discarding {} byte partial frame without EOI (limit {} bytes)",
                            self.buffer.len(), self.max_frame_bytes
                        );
                        let len = self.buffer.len();
                        self.discard(len);
                        return None;
                    }
                    // The last byte may be the 0xFF half of an EOI.
                    self.eoi_scan_from = self.buffer.len().saturating_sub(1).max(SOI.len());
                    return None;
                }
            }
        }
    }

    /// No SOI anywhere: keep only a trailing 0xFF that may start one.
    fn drop_garbage(&mut self) {
        let keep = usize::from(self.buffer.last() == Some(&SOI[0]));
        let drop = self.buffer.len() - keep;
        if drop > 0 {
            self.discard(drop);
        }
    }

    fn discard(&mut self, n: usize) {
        self.buffer.advance(n);
        self.discarded_bytes += n as u64;
        self.eoi_scan_from = 0;
    }
}

/// Iterator returned by [`FrameDemuxer::push`].
pub struct Frames<'a> {
    demuxer: &'a mut FrameDemuxer,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.demuxer.next_frame()
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == needle)
        .map(|pos| pos + from)
}
