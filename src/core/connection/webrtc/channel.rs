//! [`DataChannel`] over an `RTCDataChannel`.

use crate::core::connection::{ChannelFrame, DataChannel, EventSink, TransportEvent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    low: Arc<Notify>,
}

impl WebRtcDataChannel {
    pub(crate) fn new(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        Arc::new(Self {
            dc,
            low: Arc::new(Notify::new()),
        })
    }

    /// Route the channel's lifecycle and traffic into `sink`.
    pub(crate) async fn attach(&self, sink: EventSink) {
        let label = self.dc.label().to_string();

        let open_sink = sink.clone();
        let open_label = label.clone();
        self.dc.on_open(Box::new(move || {
            let sink = open_sink.clone();
            let label = open_label.clone();
            Box::pin(async move {
                info!(event = "data_channel_open", peer = sink.peer_id(), %label, "Data channel open");
                sink.emit(TransportEvent::ChannelOpen);
            })
        }));

        let close_sink = sink.clone();
        let close_low = self.low.clone();
        self.dc.on_close(Box::new(move || {
            let sink = close_sink.clone();
            let low = close_low.clone();
            Box::pin(async move {
                debug!(event = "data_channel_closed", peer = sink.peer_id(), "Data channel closed");
                low.notify_one();
                sink.emit(TransportEvent::ChannelClosed);
            })
        }));

        let err_sink = sink.clone();
        self.dc.on_error(Box::new(move |e| {
            let sink = err_sink.clone();
            Box::pin(async move {
                warn!(event = "data_channel_error", peer = sink.peer_id(), error = %e, "Data channel error");
            })
        }));

        let msg_sink = sink;
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = msg_sink.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    ChannelFrame::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelFrame::Binary(msg.data)
                };
                sink.emit(TransportEvent::ChannelMessage(frame));
            })
        }));

        let low = self.low.clone();
        self.dc
            .on_buffered_amount_low(Box::new(move || {
                let low = low.clone();
                Box::pin(async move {
                    low.notify_one();
                })
            }))
            .await;
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.dc
            .send_text(text.to_string())
            .await
            .map_err(|e| anyhow!("send text on {}: {e}", self.dc.label()))?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map_err(|e| anyhow!("send chunk on {}: {e}", self.dc.label()))?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn wait_buffered_low(&self) {
        self.low.notified().await;
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}
