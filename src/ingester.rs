//! Frame decoding, event validation and the storage write path.
//!
//! The ingester is the only component that parses client frames and the
//! only writer to storage. Every inbound frame is handled on its own task,
//! so acknowledgement order across frames of one connection is not
//! guaranteed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, StoreError};
use crate::event::{Event, KindClass};
use crate::filter::{Filter, Subscription};
use crate::frame::{ClientFrame, RelayFrame};
use crate::msg::{FanoutMsg, Inbound, Outbound};
use crate::storage::{EventStore, StoreRequest};

/// Deadline for storage acknowledgements and the replace pre-query.
const STORE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_SUB_ID_LEN: usize = 64;

const REASON_BAD_SIGNATURE: &str = "invalid: bad signature or id";
const REASON_STORE_FAILED: &str = "error: failed to store event";
const REASON_DUPLICATE: &str = "duplicate: already have this event";
const REASON_SUB_ID_TOO_LONG: &str = "error: subscription id exceeds 64 character limit";
const NOTICE_UNPARSEABLE: &str =
    "error: failed to parse message and continued failure to parse future messages will result in a ban";

/// Handles shared by every worker task.
#[derive(Clone)]
struct IngestCtx {
    to_hub: mpsc::Sender<Outbound>,
    to_fanout: mpsc::Sender<FanoutMsg>,
    to_store: mpsc::Sender<StoreRequest>,
    store: Arc<dyn EventStore>,
    reject_future_seconds: u64,
}

impl IngestCtx {
    async fn reply(&self, conn_id: Uuid, frame: RelayFrame) {
        if self.to_hub.send(Outbound::new(conn_id, frame)).await.is_err() {
            warn!(%conn_id, "connection hub is gone, dropping reply");
        }
    }

    async fn forward(&self, msg: FanoutMsg) {
        if self.to_fanout.send(msg).await.is_err() {
            warn!("filter manager is gone, dropping envelope");
        }
    }
}

/// Decodes inbound frames and gatekeeps event persistence.
pub struct Ingester {
    recv: mpsc::Receiver<Inbound>,
    ctx: IngestCtx,
    stopping: watch::Receiver<bool>,
}

impl Ingester {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        recv: mpsc::Receiver<Inbound>,
        to_hub: mpsc::Sender<Outbound>,
        to_fanout: mpsc::Sender<FanoutMsg>,
        to_store: mpsc::Sender<StoreRequest>,
        store: Arc<dyn EventStore>,
        reject_future_seconds: u64,
        stopping: watch::Receiver<bool>,
    ) -> Self {
        Self {
            recv,
            ctx: IngestCtx {
                to_hub,
                to_fanout,
                to_store,
                store,
                reject_future_seconds,
            },
            stopping,
        }
    }

    /// Receive frames until the hub closes the channel, spawning one worker
    /// task per frame. Workers are drained before returning.
    pub async fn run(mut self) {
        info!("ingester started");
        let mut workers: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                inbound = self.recv.recv() => match inbound {
                    Some(Inbound::Frame { conn_id, payload }) => {
                        let ctx = self.ctx.clone();
                        workers.spawn(async move {
                            handle_frame(ctx, conn_id, payload).await;
                        });
                    }
                    Some(Inbound::Disconnect { conn_id }) => {
                        debug!(%conn_id, "connection closed, notifying filter manager");
                        self.ctx.forward(FanoutMsg::Disconnect { conn_id }).await;
                    }
                    None => {
                        if !*self.stopping.borrow() {
                            error!("receive channel from connection hub unexpectedly closed");
                        }
                        break;
                    }
                },
                // reap finished workers so the set does not grow unbounded
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }
        while workers.join_next().await.is_some() {}
        info!("ingester stopped");
    }
}

async fn handle_frame(ctx: IngestCtx, conn_id: Uuid, payload: String) {
    let frame = match ClientFrame::parse(&payload) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(%conn_id, error = %err, "failed to parse frame");
            let notice = Outbound::unparseable(conn_id, RelayFrame::notice(NOTICE_UNPARSEABLE));
            if ctx.to_hub.send(notice).await.is_err() {
                warn!(%conn_id, "connection hub is gone, dropping notice");
            }
            return;
        }
    };
    match frame {
        ClientFrame::Event(event) => handle_event(ctx, conn_id, event).await,
        ClientFrame::Req { sub_id, filters } => {
            if sub_id.len() > MAX_SUB_ID_LEN {
                warn!(%conn_id, sub_id_len = sub_id.len(), "rejecting REQ");
                ctx.reply(conn_id, RelayFrame::closed(sub_id, REASON_SUB_ID_TOO_LONG))
                    .await;
                return;
            }
            ctx.forward(FanoutMsg::Subscribe {
                conn_id,
                subscription: Subscription {
                    id: sub_id,
                    filters,
                },
            })
            .await;
        }
        ClientFrame::Close { sub_id } => {
            ctx.forward(FanoutMsg::Close { conn_id, sub_id }).await;
        }
    }
}

async fn handle_event(ctx: IngestCtx, conn_id: Uuid, event: Event) {
    if let Err(err) = event.verify() {
        debug!(%conn_id, event_id = %event.id, error = %err, "rejecting event");
        ctx.reply(conn_id, RelayFrame::ok_rejected(&event.id, REASON_BAD_SIGNATURE))
            .await;
        return;
    }
    if let Err(err) = event.validate_created_at(ctx.reject_future_seconds) {
        debug!(%conn_id, event_id = %event.id, created_at = event.created_at, "rejecting future-dated event");
        ctx.reply(conn_id, RelayFrame::ok_rejected(&event.id, format!("invalid: {err}")))
            .await;
        return;
    }

    match event.kind_class() {
        KindClass::Ephemeral => {
            // never stored: ack and hand straight to live fan-out
            ctx.reply(conn_id, RelayFrame::ok_accepted(&event.id)).await;
            ctx.forward(FanoutMsg::Event { event }).await;
            return;
        }
        KindClass::Replaceable => {
            let filter = Filter {
                kinds: Some(vec![event.kind]),
                authors: Some(vec![event.pubkey.clone()]),
                ..Default::default()
            };
            if let Err(err) = replace_existing(&ctx, filter).await {
                error!(%conn_id, event_id = %event.id, error = %err, "failed to handle replaceable event");
                ctx.reply(conn_id, RelayFrame::ok_rejected(&event.id, format!("error: {err}")))
                    .await;
                return;
            }
        }
        KindClass::Addressable => {
            // without a d tag the event stores like a regular one
            if let Some(d_tag) = event.d_tag() {
                let mut filter = Filter {
                    kinds: Some(vec![event.kind]),
                    authors: Some(vec![event.pubkey.clone()]),
                    ..Default::default()
                };
                filter.tags.insert("d".into(), vec![d_tag.to_string()]);
                if let Err(err) = replace_existing(&ctx, filter).await {
                    error!(%conn_id, event_id = %event.id, error = %err, "failed to handle addressable event");
                    ctx.reply(conn_id, RelayFrame::ok_rejected(&event.id, format!("error: {err}")))
                        .await;
                    return;
                }
            }
        }
        KindClass::Regular => {}
    }

    let (reply, ack) = oneshot::channel();
    let request = StoreRequest::Save {
        event: event.clone(),
        reply,
    };
    if ctx.to_store.send(request).await.is_err() {
        error!(%conn_id, event_id = %event.id, "storage backend is gone");
        ctx.reply(conn_id, RelayFrame::ok_rejected(&event.id, REASON_STORE_FAILED))
            .await;
        return;
    }
    match timeout(STORE_TIMEOUT, ack).await {
        Ok(Ok(Ok(()))) => {
            ctx.reply(conn_id, RelayFrame::ok_accepted(&event.id)).await;
            ctx.forward(FanoutMsg::Event { event }).await;
        }
        Ok(Ok(Err(StoreError::Duplicate))) => {
            // the id is content-derived, so the stored copy is identical;
            // acknowledge without fanning out a second time
            ctx.reply(conn_id, RelayFrame::ok_with_reason(&event.id, REASON_DUPLICATE))
                .await;
        }
        Ok(Ok(Err(err))) => {
            ctx.reply(
                conn_id,
                RelayFrame::ok_rejected(&event.id, format!("{REASON_STORE_FAILED}: {err}")),
            )
            .await;
        }
        Ok(Err(_)) => {
            error!(%conn_id, event_id = %event.id, "storage backend dropped the acknowledgement");
            ctx.reply(conn_id, RelayFrame::ok_rejected(&event.id, REASON_STORE_FAILED))
                .await;
        }
        Err(_) => {
            error!(%conn_id, event_id = %event.id, "timed out waiting for response from storage backend");
            ctx.reply(conn_id, RelayFrame::ok_rejected(&event.id, REASON_STORE_FAILED))
                .await;
        }
    }
}

/// Query storage for events the incoming one replaces and delete each,
/// awaiting the acknowledgement per deletion.
async fn replace_existing(ctx: &IngestCtx, filter: Filter) -> Result<(), IngestError> {
    let mut rx = ctx
        .store
        .query(&filter)
        .await
        .map_err(IngestError::ReplaceQuery)?;
    let mut existing = Vec::new();
    let drained = timeout(STORE_TIMEOUT, async {
        while let Some(ev) = rx.recv().await {
            existing.push(ev);
        }
    })
    .await;
    if drained.is_err() {
        return Err(IngestError::ReplaceQueryTimeout);
    }
    for stale in existing {
        let (reply, ack) = oneshot::channel();
        ctx.to_store
            .send(StoreRequest::Delete {
                event_id: stale.id,
                reply,
            })
            .await
            .map_err(|_| {
                IngestError::ReplaceDelete(StoreError::Backend("storage backend is gone".into()))
            })?;
        match timeout(STORE_TIMEOUT, ack).await {
            Ok(Ok(res)) => res.map_err(IngestError::ReplaceDelete)?,
            Ok(Err(_)) => {
                return Err(IngestError::ReplaceDelete(StoreError::Backend(
                    "acknowledgement dropped".into(),
                )))
            }
            Err(_) => return Err(IngestError::ReplaceDelete(StoreError::Timeout)),
        }
    }
    Ok(())
}
