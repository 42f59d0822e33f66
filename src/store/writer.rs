//! # Batched Writer
//!
//! Two independent single-producer/single-consumer stream buffers, one for
//! gateway packets and one for application packets. A buffer flushes when it
//! reaches the batch size or when its oldest row has waited out the flush
//! interval. A failed flush re-queues the whole batch at the head, so rows
//! are never dropped while the process lives and insert order is preserved
//! across retries.
//!
//! Metadata upserts ride a third channel, are applied immediately and
//! refresh the broadcaster caches.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use super::Store;
use crate::live::{Broadcaster, CsDeviceMeta};
use crate::model::{CsPacket, GatewayUpsert, ParsedPacket};

/// Default rows per flush.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Default maximum row age before a time-based flush.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Device metadata upsert payload from the application pipeline.
#[derive(Debug, Clone)]
pub struct CsDeviceUpsert {
    pub dev_eui: String,
    pub dev_addr: Option<String>,
    pub device_name: String,
    pub application_id: String,
    pub application_name: Option<String>,
}

/// Metadata operations executed alongside the stream inserts.
#[derive(Debug, Clone)]
pub enum MetaUpsert {
    Gateway(GatewayUpsert),
    CsDevice(CsDeviceUpsert),
}

/// Producer-side handle for the pipeline.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    pub packets_tx: mpsc::Sender<ParsedPacket>,
    pub cs_tx: mpsc::Sender<CsPacket>,
    pub meta_tx: mpsc::Sender<MetaUpsert>,
}

/// One stream buffer. Pure mechanics, separated from I/O so the flush
/// triggers and re-queue behavior are testable without a database.
#[derive(Debug)]
pub struct BatchBuffer<T> {
    rows: VecDeque<T>,
    batch_size: usize,
    flush_interval: Duration,
    /// Arrival time of the oldest buffered row.
    oldest: Option<Instant>,
}

impl<T> BatchBuffer<T> {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        BatchBuffer {
            rows: VecDeque::new(),
            batch_size,
            flush_interval,
            oldest: None,
        }
    }

    pub fn push(&mut self, row: T) {
        if self.rows.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.rows.push_back(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Size trigger reached.
    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.batch_size
    }

    /// Interval trigger reached.
    pub fn is_due(&self) -> bool {
        match self.oldest {
            Some(oldest) => oldest.elapsed() >= self.flush_interval,
            None => false,
        }
    }

    /// Drain up to one batch from the head.
    pub fn take_batch(&mut self) -> Vec<T> {
        let n = self.rows.len().min(self.batch_size);
        let batch: Vec<T> = self.rows.drain(..n).collect();
        self.oldest = if self.rows.is_empty() {
            None
        } else {
            // conservatively treat the remainder as old; it flushes next tick
            Some(Instant::now() - self.flush_interval)
        };
        batch
    }

    /// Put a failed batch back at the head, preserving order.
    pub fn requeue_front(&mut self, batch: Vec<T>) {
        for row in batch.into_iter().rev() {
            self.rows.push_front(row);
        }
        self.oldest = Some(Instant::now());
    }
}

/// The writer task plus its channel receivers.
pub struct Writer {
    store: Store,
    broadcaster: Arc<Broadcaster>,
    packets: BatchBuffer<ParsedPacket>,
    cs_packets: BatchBuffer<CsPacket>,
    packets_rx: mpsc::Receiver<ParsedPacket>,
    cs_rx: mpsc::Receiver<CsPacket>,
    meta_rx: mpsc::Receiver<MetaUpsert>,
}

impl Writer {
    /// Build the writer and its producer handle.
    pub fn new(
        store: Store,
        broadcaster: Arc<Broadcaster>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> (Self, WriterHandle) {
        let (packets_tx, packets_rx) = mpsc::channel(4096);
        let (cs_tx, cs_rx) = mpsc::channel(4096);
        let (meta_tx, meta_rx) = mpsc::channel(1024);
        let writer = Writer {
            store,
            broadcaster,
            packets: BatchBuffer::new(batch_size, flush_interval),
            cs_packets: BatchBuffer::new(batch_size, flush_interval),
            packets_rx,
            cs_rx,
            meta_rx,
        };
        (
            writer,
            WriterHandle {
                packets_tx,
                cs_tx,
                meta_tx,
            },
        )
    }

    /// Run until shutdown, then drain both buffers.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        log::info!("batched writer started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Some(packet) = self.packets_rx.recv() => {
                    self.packets.push(packet);
                    if self.packets.is_full() {
                        self.flush_packets().await;
                    }
                }
                Some(packet) = self.cs_rx.recv() => {
                    self.cs_packets.push(packet);
                    if self.cs_packets.is_full() {
                        self.flush_cs_packets().await;
                    }
                }
                Some(upsert) = self.meta_rx.recv() => {
                    self.apply_meta(upsert).await;
                }
                _ = tick.tick() => {
                    if self.packets.is_due() {
                        self.flush_packets().await;
                    }
                    if self.cs_packets.is_due() {
                        self.flush_cs_packets().await;
                    }
                }
            }
        }

        self.drain().await;
        log::info!("batched writer stopped");
    }

    /// Final synchronous drain on shutdown.
    async fn drain(&mut self) {
        while let Ok(packet) = self.packets_rx.try_recv() {
            self.packets.push(packet);
        }
        while let Ok(packet) = self.cs_rx.try_recv() {
            self.cs_packets.push(packet);
        }
        while let Ok(upsert) = self.meta_rx.try_recv() {
            self.apply_meta(upsert).await;
        }
        while !self.packets.is_empty() {
            let before = self.packets.len();
            self.flush_packets().await;
            if self.packets.len() >= before {
                log::error!("abandoning {} gateway rows on shutdown", self.packets.len());
                break;
            }
        }
        while !self.cs_packets.is_empty() {
            let before = self.cs_packets.len();
            self.flush_cs_packets().await;
            if self.cs_packets.len() >= before {
                log::error!("abandoning {} cs rows on shutdown", self.cs_packets.len());
                break;
            }
        }
    }

    async fn flush_packets(&mut self) {
        let batch = self.packets.take_batch();
        if batch.is_empty() {
            return;
        }
        let n = batch.len();
        if let Err(e) = self.store.insert_packets(&batch).await {
            log::warn!("packet batch insert failed ({n} rows), re-queued: {e}");
            self.packets.requeue_front(batch);
        } else {
            log::debug!("flushed {n} gateway packets");
        }
    }

    async fn flush_cs_packets(&mut self) {
        let batch = self.cs_packets.take_batch();
        if batch.is_empty() {
            return;
        }
        let n = batch.len();
        if let Err(e) = self.store.insert_cs_packets(&batch).await {
            log::warn!("cs batch insert failed ({n} rows), re-queued: {e}");
            self.cs_packets.requeue_front(batch);
        } else {
            log::debug!("flushed {n} cs packets");
        }
    }

    /// Upserts apply immediately and refresh the broadcaster caches; a
    /// database failure skips only the cache-consistency step.
    async fn apply_meta(&mut self, upsert: MetaUpsert) {
        match upsert {
            MetaUpsert::Gateway(gateway) => {
                if let Err(e) = self.store.upsert_gateway(&gateway).await {
                    log::warn!("gateway upsert failed for {}: {e}", gateway.gateway_id);
                    return;
                }
                self.broadcaster.update_gateway_meta(
                    &gateway.gateway_id,
                    gateway.name,
                    gateway.alias,
                    gateway.group_name,
                );
            }
            MetaUpsert::CsDevice(device) => {
                if let Err(e) = self.store.upsert_cs_device(&device).await {
                    log::warn!("device upsert failed for {}: {e}", device.dev_eui);
                    return;
                }
                self.broadcaster.update_cs_device(
                    &device.dev_eui,
                    CsDeviceMeta {
                        device_name: device.device_name,
                        application_name: device.application_name,
                        dev_addr: device.dev_addr,
                    },
                );
            }
        }
    }
}
