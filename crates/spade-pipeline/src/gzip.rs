// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Gzip files written through pooled raw DEFLATE contexts.
//!
//! A gzip member is a fixed 10-byte header, a raw DEFLATE stream and an
//! 8-byte trailer holding the CRC-32 and length of the uncompressed data.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use flate2::Crc;

use crate::compressor_pool::PooledCompressor;

/// Magic, CM=deflate, no flags, zero mtime, no extra flags, unknown OS.
const HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0xff];

/// Compressed bytes buffered before they are written to the file.
const FLUSH_THRESHOLD: usize = 64 * 1024;

pub struct GzipLineEncoder {
    file: File,
    compressor: PooledCompressor,
    crc: Crc,
    buffer: Vec<u8>,
}

impl GzipLineEncoder {
    pub fn new(file: File, compressor: PooledCompressor) -> Self {
        let mut buffer = Vec::with_capacity(FLUSH_THRESHOLD);
        buffer.extend_from_slice(&HEADER);
        Self {
            file,
            compressor,
            crc: Crc::new(),
            buffer,
        }
    }

    /// Appends `line` and a trailing newline.
    pub fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.crc.update(line);
        self.crc.update(b"\n");
        self.compressor.write(line, &mut self.buffer)?;
        self.compressor.write(b"\n", &mut self.buffer)?;
        if self.buffer.len() >= FLUSH_THRESHOLD {
            self.file.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Uncompressed bytes written so far.
    pub fn bytes_in(&self) -> u64 {
        u64::from(self.crc.amount())
    }

    /// Compressed bytes not yet written to the file. Output still held inside
    /// the deflate context is not included.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Terminates the member and flushes everything to the file.
    pub fn finish(mut self) -> io::Result<File> {
        self.compressor.finish(&mut self.buffer)?;
        self.buffer.extend_from_slice(&self.crc.sum().to_le_bytes());
        self.buffer.extend_from_slice(&self.crc.amount().to_le_bytes());
        self.file.write_all(&self.buffer)?;
        self.file.flush()?;
        Ok(self.file)
    }
}

/// Whether `path` decodes as complete gzip data, CRC included.
pub fn is_valid_gzip(path: &Path) -> bool {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!("Failed to open {}: {}", path.display(), e);
            return false;
        }
    };
    if file.metadata().map(|m| m.len() == 0).unwrap_or(true) {
        tracing::warn!("Empty or unreadable gzip file {}", path.display());
        return false;
    }
    let mut decoder = flate2::read::MultiGzDecoder::new(io::BufReader::new(file));
    match io::copy(&mut decoder, &mut io::sink()) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("Invalid gzip data in {}: {}", path.display(), e);
            false
        }
    }
}

/// Decompresses a whole gzip file.
pub fn read_gzip(path: &Path) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::MultiGzDecoder::new(File::open(path)?).read_to_end(&mut out)?;
    Ok(out)
}

/// Rewrites a corrupt gzip file in place with every complete line that can
/// still be decoded from it. A trailing partial line is dropped. Returns
/// `false`, leaving the file untouched, when no complete line survives.
pub fn salvage_gzip(path: &Path) -> io::Result<bool> {
    let mut decoder = flate2::read::MultiGzDecoder::new(io::BufReader::new(File::open(path)?));
    let mut recovered = Vec::new();
    let mut chunk = [0u8; 8 * 1024];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => recovered.extend_from_slice(&chunk[..n]),
            Err(e) => {
                tracing::debug!(
                    "Stopped decoding {} after {} bytes: {}",
                    path.display(),
                    recovered.len(),
                    e
                );
                break;
            }
        }
    }
    let Some(end) = recovered.iter().rposition(|&b| b == b'\n') else {
        return Ok(false);
    };

    let mut encoder =
        flate2::write::GzEncoder::new(File::create(path)?, flate2::Compression::default());
    encoder.write_all(&recovered[..=end])?;
    encoder.finish()?.sync_all()?;
    Ok(true)
}
