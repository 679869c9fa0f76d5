//! The designated FCI command-processing worker.
//!
//! Command handlers are not designed for concurrent invocation: the
//! worker owns the database, the DMEM window, the session cursors, and
//! the bridge instance outright, and drains one bounded request channel.
//! Serialization falls out of ownership; there is no lock to forget.

use anyhow::Context;
use pfe_dmem::HostDmem;
use pfe_fci::{FciStatus, FpFciSession, RULE_REPLY_SIZE};
use pfe_fp::FpDb;
use pfe_l2br::{BridgeConfig, L2Bridge, TableGeometry};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Which FCI command family a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpCommandKind {
    /// Rule create/destroy/query commands.
    Rule,
    /// Table lifecycle, membership, and activation commands.
    Table,
}

/// One FCI request: a command frame plus a reply channel.
#[derive(Debug)]
pub struct FciRequest {
    /// Command family of the frame.
    pub kind: FpCommandKind,
    /// The raw command frame.
    pub frame: Vec<u8>,
    /// Where the reply goes.
    pub reply: oneshot::Sender<FciReply>,
}

/// Status word plus the exact reply payload produced (possibly empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FciReply {
    /// Wire status.
    pub status: FciStatus,
    /// Reply payload; empty when the command produced nothing.
    pub payload: Vec<u8>,
}

/// Worker construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Size of the DMEM window in bytes.
    pub dmem_size: usize,
    /// VLAN table primary slots.
    pub vlan_hash_slots: usize,
    /// VLAN table collision slots.
    pub vlan_collision_slots: usize,
    /// Request channel depth.
    pub channel_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dmem_size: 64 * 1024,
            vlan_hash_slots: 64,
            vlan_collision_slots: 32,
            channel_depth: 64,
        }
    }
}

/// The worker: single owner of all Flexible Parser and bridge state.
pub struct FciWorker {
    db: FpDb,
    dmem: HostDmem,
    session: FpFciSession,
    bridge: L2Bridge,
    rx: mpsc::Receiver<FciRequest>,
}

impl FciWorker {
    /// Brings up the worker: allocates the DMEM window, creates the
    /// bridge instance, and returns the request handle.
    pub fn new(config: WorkerConfig) -> anyhow::Result<(Self, mpsc::Sender<FciRequest>)> {
        let (tx, rx) = mpsc::channel(config.channel_depth);
        let mut dmem = HostDmem::new(config.dmem_size);

        let bridge_config = BridgeConfig {
            vlan_geometry: TableGeometry {
                hash_slots: config.vlan_hash_slots,
                collision_slots: config.vlan_collision_slots,
            },
            ..BridgeConfig::default()
        };
        let bridge =
            L2Bridge::new(&mut dmem, bridge_config).context("bridge bring-up failed")?;

        Ok((
            Self {
                db: FpDb::new(),
                dmem,
                session: FpFciSession::new(),
                bridge,
                rx,
            },
            tx,
        ))
    }

    /// Read access to the bridge instance.
    pub fn bridge(&self) -> &L2Bridge {
        &self.bridge
    }

    /// Write access to the bridge instance and the DMEM window, for
    /// platform-side domain configuration between commands.
    pub fn bridge_mut(&mut self) -> (&mut L2Bridge, &mut HostDmem) {
        (&mut self.bridge, &mut self.dmem)
    }

    fn process(&mut self, kind: FpCommandKind, frame: &[u8]) -> FciReply {
        let mut payload = vec![0u8; RULE_REPLY_SIZE];
        let (status, len) = match kind {
            FpCommandKind::Rule => self
                .session
                .process_rule_cmd(&mut self.db, frame, &mut payload),
            FpCommandKind::Table => self.session.process_table_cmd(
                &mut self.db,
                &mut self.dmem,
                frame,
                &mut payload,
            ),
        };
        payload.truncate(len);
        debug!(?kind, %status, reply_len = len, "FCI command processed");
        FciReply { status, payload }
    }

    /// Runs until every request handle is dropped.
    pub async fn run(mut self) {
        info!("FCI worker up");
        while let Some(request) = self.rx.recv().await {
            let reply = self.process(request.kind, &request.frame);
            // A client that dropped its reply half still had the command
            // applied; nothing to undo.
            let _ = request.reply.send(reply);
        }
        info!("FCI channel closed, worker exiting");
    }
}

/// Sends one command frame to a running worker and awaits the reply.
pub async fn submit(
    tx: &mpsc::Sender<FciRequest>,
    kind: FpCommandKind,
    frame: Vec<u8>,
) -> anyhow::Result<FciReply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(FciRequest {
        kind,
        frame,
        reply: reply_tx,
    })
    .await
    .context("FCI worker is gone")?;
    reply_rx.await.context("FCI worker dropped the reply")
}
