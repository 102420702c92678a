//! DMA proxy character devices: one for the outbound (to fabric) channel, one for inbound.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use vox_core::{Accelerator, DeviceError, DmaBuffer};

const WORD_BYTES: usize = 4;

/// Accelerator reached through a pair of DMA proxy devices. Words travel little-endian.
pub struct DmaProxyDevice {
    tx: File,
    rx: File,
    tx_path: PathBuf,
    rx_path: PathBuf,
}

impl DmaProxyDevice {
    pub fn open(tx_path: &Path, rx_path: &Path) -> Result<Self, DeviceError> {
        let tx = OpenOptions::new().write(true).open(tx_path)?;
        let rx = OpenOptions::new().read(true).open(rx_path)?;
        info!(tx = %tx_path.display(), rx = %rx_path.display(), "accelerator channels opened");
        Ok(Self {
            tx,
            rx,
            tx_path: tx_path.to_path_buf(),
            rx_path: rx_path.to_path_buf(),
        })
    }
}

impl std::fmt::Debug for DmaProxyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaProxyDevice")
            .field("tx", &self.tx_path)
            .field("rx", &self.rx_path)
            .finish()
    }
}

impl Accelerator for DmaProxyDevice {
    /// Outbound write on a scoped thread while this thread reads the inbound channel; returns
    /// once both sides are done.
    fn transfer(&mut self, input: &DmaBuffer, output: &mut DmaBuffer) -> Result<(), DeviceError> {
        let outbound = words_to_bytes(input.as_slice());
        let mut inbound = vec![0u8; output.len() * WORD_BYTES];
        let tx = &mut self.tx;
        let rx = &mut self.rx;

        let (sent, received) = std::thread::scope(|s| {
            let writer = s.spawn(move || -> std::io::Result<()> {
                tx.write_all(&outbound)?;
                tx.flush()
            });
            let received = rx.read_exact(&mut inbound);
            (writer.join(), received)
        });

        sent.map_err(|_| DeviceError::Transfer("outbound channel thread panicked".into()))??;
        received?;
        debug!(sent = input.len(), received = output.len(), "dma transfer complete");
        output.copy_from(&bytes_to_words(&inbound))
    }
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(WORD_BYTES)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
